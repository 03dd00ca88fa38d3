//! Per-worker slot state as laid out in the shared registry region.

use std::sync::atomic::{AtomicU32, Ordering};

use derive_more::{Display, From};

/// Upper bound on the stored database-name length, in bytes. The slot layout
/// reserves exactly this much inline space; `PoolOptions::max_database_name`
/// may lower the accepted length but never raise it.
pub const MAX_DATABASE_NAME: usize = 64;

/// Stable catalog identifier of a database. Zero is never a valid id; the
/// registry uses it to encode "no binding".
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, PartialEq)]
pub struct DatabaseId(pub u32);

/// Stable catalog identifier of a tablespace.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, PartialEq)]
pub struct TablespaceId(pub u32);

/// Dense per-worker identity assigned by the surrounding server; opaque to
/// the pool.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, PartialEq)]
pub struct WorkerKey(pub u32);

/// A freshly generated query-cancellation key, delivered to the client in the
/// ready framing and registered with the server's cancel machinery.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, PartialEq)]
pub struct CancelKey(pub u32);

/// The lifecycle status of a worker slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SlotStatus {
    /// Free slot: no worker process is attached.
    Unused = 0,
    /// The worker is serving a client.
    Active = 1,
    /// The worker is idle and eligible to receive a new client descriptor.
    Pooled = 2,
    /// The supervisor is handing a client off to this worker; no further
    /// matching is allowed until the worker consumes it.
    Reassigning = 3,
}

impl SlotStatus {
    fn from_raw(raw: u32) -> SlotStatus {
        match raw {
            1 => SlotStatus::Active,
            2 => SlotStatus::Pooled,
            3 => SlotStatus::Reassigning,
            _ => SlotStatus::Unused,
        }
    }
}

/// One worker slot as stored in shared memory. Fields other than
/// `database_id` and `exit_requested` may only be touched while the registry
/// lock is held; those two are word-sized and may additionally be snapshot
/// without it.
#[repr(C)]
pub(crate) struct RawSlot {
    pid: i32,
    worker_key: u32,
    database_id: AtomicU32,
    /// Raw descriptor number of the supervisor-owned channel end. Only
    /// meaningful inside the supervisor process; -1 when closed.
    supervisor_end: i32,
    status: u32,
    exit_requested: AtomicU32,
    name_len: u32,
    name: [u8; MAX_DATABASE_NAME],
}

impl RawSlot {
    pub(crate) fn reset(&mut self) {
        self.pid = 0;
        self.worker_key = 0;
        self.database_id.store(0, Ordering::Relaxed);
        self.supervisor_end = -1;
        self.status = SlotStatus::Unused as u32;
        self.exit_requested.store(0, Ordering::Relaxed);
        self.name_len = 0;
        self.name = [0; MAX_DATABASE_NAME];
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: i32) {
        self.pid = pid;
    }

    pub(crate) fn worker_key(&self) -> WorkerKey {
        WorkerKey(self.worker_key)
    }

    pub(crate) fn set_worker_key(&mut self, key: WorkerKey) {
        self.worker_key = key.0;
    }

    pub(crate) fn status(&self) -> SlotStatus {
        SlotStatus::from_raw(self.status)
    }

    pub(crate) fn set_status(&mut self, status: SlotStatus) {
        self.status = status as u32;
    }

    pub(crate) fn database_id(&self) -> Option<DatabaseId> {
        match self.database_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(DatabaseId(id)),
        }
    }

    pub(crate) fn set_database_id(&mut self, id: Option<DatabaseId>) {
        self.database_id
            .store(id.map_or(0, |id| id.0), Ordering::Release);
    }

    pub(crate) fn supervisor_end(&self) -> Option<i32> {
        (self.supervisor_end >= 0).then_some(self.supervisor_end)
    }

    pub(crate) fn set_supervisor_end(&mut self, fd: i32) {
        self.supervisor_end = fd;
    }

    pub(crate) fn clear_supervisor_end(&mut self) {
        self.supervisor_end = -1;
    }

    pub(crate) fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire) != 0
    }

    pub(crate) fn request_exit(&mut self) {
        self.exit_requested.store(1, Ordering::Release);
    }

    pub(crate) fn database_name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }

    /// Stores `name` inline. The caller has already checked it against the
    /// configured cap, so anything longer than the layout bound is a logic
    /// error.
    pub(crate) fn set_database_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= MAX_DATABASE_NAME);
        let len = name.len().min(MAX_DATABASE_NAME);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name_len = len as u32;
    }

    pub(crate) fn clear_database_name(&mut self) {
        self.name_len = 0;
    }
}
