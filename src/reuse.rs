//! The reuse protocol: the worker-side state machine that turns a used
//! worker process back into the equivalent of a freshly started one.
//!
//! After its client disconnects, a worker calls
//! [`PooledWorker::enter_pool`]. The worker then drains all per-session
//! state, publishes itself as pooled, blocks on its control channel until the
//! supervisor hands it a new client descriptor, greets and verifies that
//! client, and finally reports `Resumed` so the caller can return to its
//! query loop. Any condition that makes reuse unsound reports `Exit` instead
//! and the process terminates; the supervisor forks replacements as needed.

pub mod wait;


use std::{
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
    time::Duration,
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use tracing::{debug, error, warn};

use self::wait::{DeathWatch, PendingInterrupts, Readiness, WaitSet, WakeLatch};
use crate::{
    channel::{self, ClientHandoff, Received},
    error::{Error, ErrorKind, Result},
    options::PoolOptions,
    registry::{
        slot::{CancelKey, DatabaseId, MAX_DATABASE_NAME},
        PoolRegistry,
    },
    session::{DatabaseEntry, RelaxedCatalogs, SessionHooks, Severity},
    startup::{self, StartupPacket, StartupRequest},
};

/// The outcome of [`PooledWorker::enter_pool`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reentry {
    /// A new client has been fully greeted; return to the query loop.
    Resumed,
    /// The worker must terminate. The supervisor reclaims the slot on reap.
    Exit,
}

/// The database identity a worker is attached to for its whole lifetime.
#[derive(Clone, Debug)]
pub struct DatabaseBinding {
    /// Stable catalog identifier.
    pub id: DatabaseId,
    /// The name clients request to reach this database.
    pub name: String,
}

/// The database name remembered across the teardown that resets everything
/// else, in a fixed-size buffer so step one of draining allocates nothing.
struct SavedBinding {
    id: DatabaseId,
    name: [u8; MAX_DATABASE_NAME],
    len: usize,
}

impl SavedBinding {
    fn capture(binding: &DatabaseBinding) -> Result<Self> {
        let bytes = binding.name.as_bytes();
        if bytes.len() > MAX_DATABASE_NAME {
            return Err(Error::internal("database name exceeds the slot layout"));
        }
        let mut name = [0u8; MAX_DATABASE_NAME];
        name[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            id: binding.id,
            name,
            len: bytes.len(),
        })
    }

    fn name(&self) -> &str {
        std::str::from_utf8(&self.name[..self.len]).unwrap_or_default()
    }
}

/// A worker process participating in the pool.
///
/// Owns the worker end of the slot's control channel, the wake latch, the
/// supervisor-health monitor, and the [`SessionHooks`] seam into the rest of
/// the server. Constructed once after fork and kept for the life of the
/// process.
pub struct PooledWorker<H: SessionHooks> {
    pid: i32,
    registry: PoolRegistry,
    worker_end: OwnedFd,
    latch: WakeLatch,
    death: DeathWatch,
    interrupts: Arc<PendingInterrupts>,
    hooks: H,
    binding: DatabaseBinding,
    client: Option<OwnedFd>,
    wait_timeout: Duration,
    rng: SmallRng,
}

impl<H: SessionHooks> PooledWorker<H> {
    /// Builds the worker-side pool state. `worker_end` is the inherited end
    /// of this slot's control channel; `client` is the socket of the session
    /// currently being served.
    pub fn new(
        registry: PoolRegistry,
        worker_end: OwnedFd,
        death: DeathWatch,
        interrupts: Arc<PendingInterrupts>,
        hooks: H,
        binding: DatabaseBinding,
        client: OwnedFd,
        options: &PoolOptions,
    ) -> Result<Self> {
        Ok(Self {
            pid: std::process::id() as i32,
            registry,
            worker_end,
            latch: WakeLatch::new()?,
            death,
            interrupts,
            hooks,
            binding,
            client: Some(client),
            wait_timeout: options.wait_timeout,
            rng: SmallRng::from_os_rng(),
        })
    }

    /// The latch that signal handlers use to wake this worker's wait loop.
    pub fn latch(&self) -> &WakeLatch {
        &self.latch
    }

    /// The worker's database binding.
    pub fn binding(&self) -> &DatabaseBinding {
        &self.binding
    }

    /// The current client socket, once a handoff has been consumed.
    pub fn client_socket(&self) -> Option<BorrowedFd<'_>> {
        self.client.as_ref().map(|fd| fd.as_fd())
    }

    /// Tears the finished session down, waits for a new client over the
    /// control channel, and re-initializes for it.
    ///
    /// Returns [`Reentry::Resumed`] once a client has been fully greeted, or
    /// [`Reentry::Exit`] when the worker must terminate: the pool's reserved
    /// headroom is exhausted, the database was evicted or dropped, the
    /// supervisor went away or asked for shutdown, or verification of a
    /// handed-off client failed.
    pub fn enter_pool(&mut self) -> Reentry {
        debug!(pid = self.pid, database = %self.binding.name, "entering pool");
        loop {
            let saved = match self.drain() {
                Ok(saved) => saved,
                Err(err) => return self.exit_with(err),
            };
            let handoff = match self.await_handoff(&saved) {
                Ok(Some(handoff)) => handoff,
                Ok(None) => {
                    debug!(pid = self.pid, "leaving pool wait");
                    return Reentry::Exit;
                }
                Err(err) => return self.exit_with(err),
            };
            let packet = match self.greet(handoff) {
                Ok(packet) => packet,
                Err(err) if err.is_startup_malformed() || err.is_io() => {
                    debug!(error = %err, "unusable startup from handed-off client; repooling");
                    self.client = None;
                    continue;
                }
                Err(err) => return self.exit_with(err),
            };
            let entry = match self.verify(&saved, &packet) {
                Ok(entry) => entry,
                Err(err) => return self.exit_with(err),
            };
            if let Err(err) = self.resume(&entry, &packet) {
                return self.exit_with(err);
            }
            debug!(pid = self.pid, database = %entry.name, "resumed with new client");
            return Reentry::Resumed;
        }
    }

    /// Session teardown. Every step is ordered; the saved binding is
    /// captured before anything is reset.
    fn drain(&mut self) -> Result<SavedBinding> {
        let saved = SavedBinding::capture(&self.binding)?;

        self.hooks.abort_current_transaction();

        self.hooks.drop_prepared_statements();
        self.hooks.drop_portals();
        self.hooks.release_session_locks();
        self.hooks.unlisten_all();
        self.hooks.discard_sequence_caches();
        self.hooks.discard_plan_caches();

        self.hooks.reset_all_options();
        self.hooks.reset_session_authorization();

        self.hooks.begin_transaction();
        self.hooks.cleanup_temp_namespace();
        self.hooks.commit_transaction();
        self.hooks.reset_local_buffers();

        self.hooks.release_all_storage_handles();
        self.hooks.invalidate_opclass_cache();
        self.hooks.report_disconnect();

        self.hooks.secure_close();
        self.client = None;
        self.hooks.release_client_wait_set();

        // Clear the published binding first so a concurrent database drop
        // does not have to wait on this worker.
        self.registry.update_database_id(self.pid, None);
        self.hooks.clear_activity_display();

        let exists = {
            let mut relaxed = RelaxedCatalogs::new(&mut self.hooks);
            relaxed.hooks().get_database_entry(saved.id).is_some()
        };
        if !exists {
            return Err(ErrorKind::DatabaseGone.into());
        }

        if !self.registry.mark_pooled(self.pid, saved.name()) {
            let kind = if self.registry.exit_requested(self.pid) {
                ErrorKind::DatabaseEvicted
            } else {
                ErrorKind::PoolCapExceeded
            };
            return Err(kind.into());
        }
        // Re-publish the binding so a drop of this database evicts the
        // pooled worker instead of waiting on it.
        self.registry
            .update_database_id(self.pid, Some(saved.id));
        Ok(saved)
    }

    /// Blocks on the wait set until a handoff arrives or the worker must
    /// exit. `Ok(None)` means exit: shutdown or exit requested, supervisor
    /// gone, end-of-stream, or a channel error.
    fn await_handoff(&mut self, saved: &SavedBinding) -> Result<Option<ClientHandoff>> {
        loop {
            let readiness = WaitSet {
                channel: self.worker_end.as_fd(),
                latch: &self.latch,
                death: &self.death,
            }
            .wait(self.wait_timeout)?;

            if readiness.contains(Readiness::LATCH) {
                self.latch.clear();
            }
            if self.interrupts.shutdown_requested() {
                return Ok(None);
            }
            if readiness.contains(Readiness::SUPERVISOR_GONE) {
                warn!(pid = self.pid, "supervisor went away while pooled");
                return Ok(None);
            }
            if self.interrupts.take_reload() {
                self.hooks.reload_config();
            }
            if self.interrupts.take_barrier() {
                self.hooks.process_barrier();
            }
            if self.interrupts.take_log_memory() {
                self.hooks.log_memory_contexts();
            }
            self.hooks.absorb_invalidations();
            if self.registry.exit_requested(self.pid) {
                return Ok(None);
            }
            if readiness.contains(Readiness::HANDOFF) {
                break;
            }
        }

        match channel::receive_handoff(self.worker_end.as_fd()) {
            Ok(Received::Handoff(handoff)) => {
                self.registry.update_database_id(self.pid, Some(saved.id));
                self.registry.mark_active(self.pid);
                Ok(Some(handoff))
            }
            Ok(Received::EndOfStream) => {
                debug!(pid = self.pid, "control channel closed; exiting");
                Ok(None)
            }
            Err(err) => {
                warn!(pid = self.pid, error = %err, "handoff receive failed; exiting");
                Ok(None)
            }
        }
    }

    /// Greets the handed-off client: configuration reload, protocol
    /// re-initialization, secure negotiation, and the startup packet.
    fn greet(&mut self, handoff: ClientHandoff) -> Result<StartupPacket> {
        // Unconditional: the configuration may have changed arbitrarily while
        // pooled, and startup-only options may be re-applied for this cycle.
        self.hooks.reload_config();

        let ClientHandoff { peer, client } = handoff;
        self.client = Some(client);
        self.hooks.record_remote_endpoint(&peer);

        let client = match &self.client {
            Some(fd) => fd.as_fd(),
            None => return Err(Error::internal("client socket missing during greeting")),
        };
        self.hooks.negotiate_secure(client)?;

        match startup::read_startup_request(client)? {
            StartupRequest::Startup(packet) => {
                if packet.wants_replication() {
                    return Err(ErrorKind::ReplicationOnPooled.into());
                }
                Ok(packet)
            }
            // assign_client filters these out; one reaching a pooled worker
            // is a routing bug.
            StartupRequest::Tls | StartupRequest::Credential | StartupRequest::Cancel => {
                Err(Error::internal(
                    "negotiation or cancel request reached a pooled worker",
                ))
            }
        }
    }

    /// Verifies the database identity and re-initializes collaborator state
    /// for the new client, inside one bounded transaction.
    fn verify(&mut self, saved: &SavedBinding, packet: &StartupPacket) -> Result<DatabaseEntry> {
        self.hooks.begin_transaction();

        let entry = {
            let mut relaxed = RelaxedCatalogs::new(&mut self.hooks);
            relaxed.hooks().get_database_entry(saved.id)
        };
        let Some(entry) = entry else {
            // Dropped while pooled. Commit, close the socket silently, and
            // exit so the supervisor forks fresh for any recreated database.
            self.hooks.commit_transaction();
            self.client = None;
            return Err(ErrorKind::DatabaseGone.into());
        };

        // The tablespace may have moved while pooled; reopen everything.
        self.hooks.refresh_database_binding(&entry);
        self.hooks.recompute_database_path(entry.id, entry.tablespace);
        self.hooks.release_all_storage_handles();
        self.hooks.invalidate_relation_cache();

        let requested = packet.routing_name().unwrap_or_default();
        if requested != saved.name() {
            return Err(ErrorKind::DatabaseMismatch {
                requested: requested.to_owned(),
                pooled: saved.name().to_owned(),
            }
            .into());
        }

        self.hooks.load_access_config()?;
        self.hooks.load_identity_map()?;

        let client = match &self.client {
            Some(fd) => fd.as_fd(),
            None => return Err(Error::internal("client socket missing during verification")),
        };
        self.hooks.perform_authentication(client, packet)?;

        let user = packet.user().unwrap_or_default().to_owned();
        self.hooks.initialize_session_identity(&user)?;

        // Warning severity: options the new client cannot apply must not
        // kill the connection, matching fresh-startup semantics.
        self.hooks
            .apply_startup_options(&packet.options, Severity::Warning);
        self.hooks.apply_default_settings();

        self.hooks.commit_transaction();
        Ok(entry)
    }

    /// Final steps before handing control back to the query loop.
    fn resume(&mut self, entry: &DatabaseEntry, packet: &StartupPacket) -> Result<()> {
        let key = CancelKey(self.rng.random());
        self.hooks.register_cancel_key(self.pid, key);

        let client = match &self.client {
            Some(fd) => fd.as_fd(),
            None => return Err(Error::internal("client socket missing during resume")),
        };
        self.hooks.send_ready(client, self.pid, key)?;

        self.hooks.report_connect();
        self.hooks.restart_backend_status(packet);
        self.hooks
            .update_activity_display(&entry.name, packet.user().unwrap_or_default());
        if entry.has_login_event_triggers {
            self.hooks.fire_login_triggers();
        }
        Ok(())
    }

    /// Terminal error handling: quiet exits just log, anything else sends a
    /// fatal protocol error to the client when a socket is still attached.
    fn exit_with(&mut self, err: Error) -> Reentry {
        if err.is_quiet_exit() {
            debug!(pid = self.pid, error = %err, "pooled worker exiting");
        } else {
            error!(pid = self.pid, error = %err, "pooled worker exiting after fatal error");
            if let Some(client) = &self.client {
                let message = err.to_string();
                self.hooks.protocol_error(client.as_fd(), &message);
            }
        }
        self.client = None;
        Reentry::Exit
    }
}
