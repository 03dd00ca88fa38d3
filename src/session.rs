//! The seam between the pool core and the rest of the server.
//!
//! Everything the reuse protocol needs from the surrounding server is
//! reached through [`SessionHooks`]: session teardown primitives, catalog
//! lookups, authentication, statistics, and protocol framing. The pool core
//! owns the ordering of the calls; the server owns their meaning.

use std::os::fd::BorrowedFd;

use crate::{
    channel::PeerAddr,
    error::Result,
    registry::slot::{CancelKey, DatabaseId, TablespaceId},
    startup::StartupPacket,
};

/// Error severity for applying client-supplied startup options.
///
/// Re-applying options for a handed-off client uses [`Severity::Warning`] so
/// that settings the new client lacks permission for do not kill the
/// connection, mirroring fresh-startup semantics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// A failed option application aborts the connection.
    Error,
    /// A failed option application is reported and skipped.
    Warning,
}

/// The catalog entry of a database, as re-read while verifying a handed-off
/// client.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct DatabaseEntry {
    /// Stable catalog identifier.
    pub id: DatabaseId,
    /// Current database name.
    pub name: String,
    /// The tablespace the database currently lives in. May have changed
    /// while the worker was pooled.
    pub tablespace: TablespaceId,
    /// Whether login event triggers are defined for this database.
    pub has_login_event_triggers: bool,
}

/// Operations the pool core requires from its host server.
///
/// The reuse protocol calls these in a documented order (see
/// [`PooledWorker::enter_pool`]); each method is expected to be idempotent
/// within one teardown cycle and to touch only the calling worker's session
/// state.
///
/// [`PooledWorker::enter_pool`]: crate::reuse::PooledWorker::enter_pool
pub trait SessionHooks {
    // Session teardown.

    /// Aborts any in-progress transaction.
    fn abort_current_transaction(&mut self);
    /// Drops all prepared statements of the session.
    fn drop_prepared_statements(&mut self);
    /// Drops all open portals and cursors.
    fn drop_portals(&mut self);
    /// Releases session-level (user and advisory) lock holdings.
    fn release_session_locks(&mut self);
    /// Cancels all listen subscriptions.
    fn unlisten_all(&mut self);
    /// Discards cached sequence state.
    fn discard_sequence_caches(&mut self);
    /// Discards cached query plans.
    fn discard_plan_caches(&mut self);
    /// Resets every configurable option to its default value.
    fn reset_all_options(&mut self);
    /// Resets the session role back to the authenticated identity.
    fn reset_session_authorization(&mut self);
    /// Opens a bounded transaction for cleanup or catalog work.
    fn begin_transaction(&mut self);
    /// Removes the session's temporary namespace contents.
    fn cleanup_temp_namespace(&mut self);
    /// Commits the transaction opened by [`begin_transaction`](Self::begin_transaction).
    fn commit_transaction(&mut self);
    /// Resets the session-local buffer pool.
    fn reset_local_buffers(&mut self);
    /// Releases every storage-manager file handle so relocated data
    /// directories are re-opened fresh.
    fn release_all_storage_handles(&mut self);
    /// Invalidates the per-connection operator-class cache.
    fn invalidate_opclass_cache(&mut self);
    /// Flushes accumulated counters to the statistics collector, including
    /// the disconnect event.
    fn report_disconnect(&mut self);
    /// Shuts down any secure channel layered over the old client socket
    /// before the socket itself is closed.
    fn secure_close(&mut self);
    /// Drops any wait-set entries referencing the closed client socket.
    fn release_client_wait_set(&mut self);
    /// Clears the activity/ps display to show the worker as pooled.
    fn clear_activity_display(&mut self);

    // Catalog access.

    /// Clears the nailed-catalog flag, returning its previous value. Paired
    /// with [`restore_nailed_catalogs`](Self::restore_nailed_catalogs) via a
    /// scoped guard so the flag is restored on every exit path.
    fn relax_nailed_catalogs(&mut self) -> bool;
    /// Restores the nailed-catalog flag to `previous`.
    fn restore_nailed_catalogs(&mut self, previous: bool);
    /// Looks up a database's catalog entry by id. `None` means the database
    /// no longer exists.
    fn get_database_entry(&mut self, id: DatabaseId) -> Option<DatabaseEntry>;
    /// Refreshes the session's cached tablespace identifier and
    /// login-event-trigger flag from a re-read entry.
    fn refresh_database_binding(&mut self, entry: &DatabaseEntry);
    /// Recomputes and replaces the cached data-directory path.
    fn recompute_database_path(&mut self, id: DatabaseId, tablespace: TablespaceId);
    /// Invalidates the relation cache so subsequent opens use fresh state.
    fn invalidate_relation_cache(&mut self);

    // Wait-loop interrupt processing.

    /// Re-reads the server configuration file. Called for a pending reload
    /// signal while waiting, and unconditionally when greeting a new client
    /// (where startup-only options may also be re-applied).
    fn reload_config(&mut self);
    /// Absorbs a pending global barrier.
    fn process_barrier(&mut self);
    /// Serves a pending memory-context log request.
    fn log_memory_contexts(&mut self);
    /// Processes queued cache-invalidation messages.
    fn absorb_invalidations(&mut self);

    // Client greeting and verification.

    /// Performs secure-channel negotiation on the new client socket, if the
    /// server is configured for any.
    fn negotiate_secure(&mut self, client: BorrowedFd<'_>) -> Result<()>;
    /// Re-initializes protocol framing and records the client's remote host
    /// and port from the transferred peer address.
    fn record_remote_endpoint(&mut self, peer: &PeerAddr);
    /// Sends a fatal protocol error with a connection-failure class code to
    /// the client.
    fn protocol_error(&mut self, client: BorrowedFd<'_>, message: &str);
    /// Reloads the access-control configuration tables.
    fn load_access_config(&mut self) -> Result<()>;
    /// Reloads the identity-mapping configuration tables.
    fn load_identity_map(&mut self) -> Result<()>;
    /// Runs authentication for the new client against the loaded
    /// access-control configuration.
    fn perform_authentication(&mut self, client: BorrowedFd<'_>, startup: &StartupPacket)
        -> Result<()>;
    /// Resets authenticated-user state and initializes session identity for
    /// the new client.
    fn initialize_session_identity(&mut self, user: &str) -> Result<()>;
    /// Applies the client's startup options at the given severity.
    fn apply_startup_options(&mut self, options: &[(String, String)], severity: Severity);
    /// Applies per-database and per-role default settings.
    fn apply_default_settings(&mut self);

    // Returning to service.

    /// Stores a fresh cancellation key in the registry consulted by cancel
    /// requests.
    fn register_cancel_key(&mut self, pid: i32, key: CancelKey);
    /// Sends the protocol ready framing carrying the worker pid and
    /// cancellation key.
    fn send_ready(&mut self, client: BorrowedFd<'_>, pid: i32, key: CancelKey) -> Result<()>;
    /// Reports the connect event to the statistics collector.
    fn report_connect(&mut self);
    /// Reinitializes the backend statistics entries (activity, connection,
    /// security) for the new session.
    fn restart_backend_status(&mut self, startup: &StartupPacket);
    /// Updates the process-visible activity descriptor for the new session.
    fn update_activity_display(&mut self, database: &str, user: &str);
    /// Fires login event triggers defined for the database.
    fn fire_login_triggers(&mut self);
}

/// Scoped relaxation of the nailed-catalog flag: records the previous value
/// on construction and restores it on drop, including error paths.
pub(crate) struct RelaxedCatalogs<'a, H: SessionHooks + ?Sized> {
    hooks: &'a mut H,
    previous: bool,
}

impl<'a, H: SessionHooks + ?Sized> RelaxedCatalogs<'a, H> {
    pub(crate) fn new(hooks: &'a mut H) -> Self {
        let previous = hooks.relax_nailed_catalogs();
        Self { hooks, previous }
    }

    pub(crate) fn hooks(&mut self) -> &mut H {
        self.hooks
    }
}

impl<H: SessionHooks + ?Sized> Drop for RelaxedCatalogs<'_, H> {
    fn drop(&mut self) {
        self.hooks.restore_nailed_catalogs(self.previous);
    }
}
