//! The pool registry: a fixed-capacity table of worker slots in memory
//! shared between the supervisor and all workers.
//!
//! The registry publishes each worker's lifecycle status and enough identity
//! to route new clients to a compatible pooled worker. Every mutation happens
//! under a single process-shared spin lock; critical sections are bounded by
//! one scan of the slot array. The supervisor performs all mutations that
//! originate outside a worker (register, assign, evict, reap, shutdown);
//! workers only ever touch their own slot.

pub(crate) mod shared;
pub mod slot;

#[cfg(test)]
mod test;

use std::{
    mem,
    os::fd::{AsFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd},
    slice,
    sync::Arc,
};

use tracing::{debug, warn};

pub use self::shared::SharedRegion;
use self::{
    shared::{TicketGuard, TicketLock},
    slot::{DatabaseId, RawSlot, SlotStatus, WorkerKey},
};
use crate::{
    channel::{self, ClientHandoff, PeerAddr},
    error::Result,
    options::PoolOptions,
    startup,
};

/// Fixed header at the front of the shared region, followed inline by
/// `capacity` slots.
#[repr(C)]
struct RegistryHeader {
    lock: TicketLock,
    capacity: u32,
    reserve_cap: u32,
    name_cap: u32,
    /// Marks where the inline slot array begins; also forces the header's
    /// alignment to match the slots.
    _slots: [RawSlot; 0],
}

/// The outcome of routing one accepted client.
///
/// Ownership of the client descriptor models the handoff: `Assigned` means
/// the descriptor was duplicated into a pooled worker and the local copy
/// closed; `Fork` hands the descriptor back so the caller can serve the
/// client with a freshly forked worker.
#[derive(Debug)]
pub enum Routing {
    /// The client was handed off to a pooled worker.
    Assigned,
    /// No pooled worker can serve this client; fork as usual.
    Fork(OwnedFd),
}

impl Routing {
    /// Whether the client was handed off to a pooled worker.
    pub fn is_assigned(&self) -> bool {
        matches!(self, Routing::Assigned)
    }
}

/// A point-in-time copy of one slot's published state, taken under the lock.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct SlotInfo {
    /// Index of the slot in the registry.
    pub index: usize,
    /// Worker process id; 0 for an unused slot.
    pub pid: i32,
    /// Dense worker identity assigned by the server.
    pub worker_key: WorkerKey,
    /// Lifecycle status.
    pub status: SlotStatus,
    /// Database binding, if any.
    pub database_id: Option<DatabaseId>,
    /// Routing name stored while pooled.
    pub database_name: String,
}

/// Handle to the shared pool registry.
///
/// Created by the supervisor before any worker is forked; clones of the
/// handle (and the handle itself, across `fork`) all address the same shared
/// slots. All operations acquire the registry lock for a bounded critical
/// section unless documented otherwise.
#[derive(Clone, Debug)]
pub struct PoolRegistry {
    region: Arc<SharedRegion>,
}

impl PoolRegistry {
    /// Computes the number of bytes of shared memory the registry needs for
    /// `capacity` slots. Servers embedding the registry in their own shared
    /// segment reserve this much.
    pub fn reserved_size(capacity: u32) -> usize {
        mem::size_of::<RegistryHeader>() + capacity as usize * mem::size_of::<RawSlot>()
    }

    /// Maps a fresh anonymous shared region and initializes a registry in it.
    /// Must be called before any worker is forked.
    pub fn create(options: &PoolOptions) -> Result<Self> {
        options.validate()?;
        let region = SharedRegion::anonymous(Self::reserved_size(options.capacity))?;
        Self::initialize_in(region, options)
    }

    /// Initializes a registry inside an existing shared region: every slot is
    /// set to `Unused` with no pid and a closed supervisor end.
    pub fn initialize_in(region: SharedRegion, options: &PoolOptions) -> Result<Self> {
        options.validate()?;
        let needed = Self::reserved_size(options.capacity);
        if region.len() < needed {
            return Err(crate::error::Error::invalid_argument(format!(
                "shared region holds {} bytes but {} slots need {}",
                region.len(),
                options.capacity,
                needed
            )));
        }

        let registry = Self {
            region: Arc::new(region),
        };
        // No other process can observe the region yet, so initialize without
        // the lock.
        let header = registry.header();
        header.lock.init();
        unsafe {
            let header = registry.header_mut();
            header.capacity = options.capacity;
            header.reserve_cap = options.reserve_cap();
            header.name_cap = options.max_database_name as u32;
        }
        for slot in unsafe { registry.slots_mut() } {
            slot.reset();
        }
        Ok(registry)
    }

    /// The fixed slot count.
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Registers a freshly forked worker in the first unused slot, making it
    /// `Active`. If every slot is taken the pool is operating beyond
    /// capacity: a warning is logged and the supervisor end is handed back to
    /// the caller, which keeps running without pooling this worker.
    pub fn register_worker(
        &self,
        pid: i32,
        worker_key: WorkerKey,
        database_id: DatabaseId,
        supervisor_end: OwnedFd,
    ) -> std::result::Result<(), OwnedFd> {
        let mut guard = self.lock();
        match guard
            .slots
            .iter_mut()
            .find(|slot| slot.status() == SlotStatus::Unused)
        {
            Some(slot) => {
                slot.reset();
                slot.set_pid(pid);
                slot.set_worker_key(worker_key);
                slot.set_database_id(Some(database_id));
                // The slot owns the descriptor from here on.
                slot.set_supervisor_end(supervisor_end.into_raw_fd());
                slot.set_status(SlotStatus::Active);
                Ok(())
            }
            None => {
                warn!(pid, "no free pool slot for new worker; it will not be poolable");
                Err(supervisor_end)
            }
        }
    }

    /// Worker-side: publishes this worker as `Pooled` under `database_name`.
    ///
    /// Refuses (returning false, in which case the worker must exit) when the
    /// reserved-headroom cap is already met, when the worker's database
    /// binding was cleared by a concurrent eviction, or when the name cannot
    /// be stored.
    pub fn mark_pooled(&self, pid: i32, database_name: &str) -> bool {
        let mut guard = self.lock();
        let reserve_cap = self.header().reserve_cap;
        let name_cap = self.header().name_cap as usize;

        let reserved = guard.pooled_or_reassigning();
        let Some(slot) = guard.find_mut(pid) else {
            warn!(pid, "mark_pooled: worker has no slot");
            return false;
        };
        if slot.status() != SlotStatus::Active {
            warn!(pid, status = ?slot.status(), "mark_pooled: slot is not active");
            return false;
        }
        if database_name.is_empty() || database_name.len() > name_cap {
            warn!(pid, database_name, "mark_pooled: unusable database name");
            return false;
        }
        if reserved >= reserve_cap {
            debug!(pid, reserve_cap, "mark_pooled: reservation exhausted");
            return false;
        }
        // Eviction is flagged rather than inferred from the binding field,
        // which the worker itself blanks during teardown.
        if slot.exit_requested() {
            debug!(pid, "mark_pooled: database binding was evicted");
            return false;
        }
        slot.set_database_name(database_name.as_bytes());
        slot.set_status(SlotStatus::Pooled);
        true
    }

    /// Worker-side: marks this worker's slot `Active` again after consuming a
    /// handoff.
    pub fn mark_active(&self, pid: i32) {
        let mut guard = self.lock();
        if let Some(slot) = guard.find_mut(pid) {
            slot.set_status(SlotStatus::Active);
        }
    }

    /// Reclaims the slot of an exited worker: closes the supervisor end if
    /// still open and returns the slot to `Unused`. A no-op for unknown pids.
    pub fn remove_worker(&self, pid: i32) {
        let mut guard = self.lock();
        if let Some(slot) = guard.find_mut(pid) {
            close_supervisor_end(slot);
            slot.reset();
        }
    }

    /// Replaces the database binding published for `pid`. `None` clears it,
    /// which makes a later `mark_pooled` refuse.
    pub fn update_database_id(&self, pid: i32, database_id: Option<DatabaseId>) {
        let mut guard = self.lock();
        if let Some(slot) = guard.find_mut(pid) {
            slot.set_database_id(database_id);
        }
    }

    /// Invalidates every worker bound to `database_id`, ahead of a drop or
    /// rename of that database.
    ///
    /// Pooled workers are taken out of matching, stripped of their binding,
    /// and told to exit; active workers only lose the binding, so their next
    /// `mark_pooled` refuses and they exit on their own.
    pub fn evict_database(&self, database_id: DatabaseId) {
        let mut guard = self.lock();
        for slot in guard.slots.iter_mut() {
            if slot.database_id() != Some(database_id) {
                continue;
            }
            match slot.status() {
                SlotStatus::Pooled => {
                    slot.set_status(SlotStatus::Reassigning);
                    slot.clear_database_name();
                    slot.set_database_id(None);
                    slot.request_exit();
                    // Waking the worker: it observes end-of-stream (or the
                    // exit flag) and terminates.
                    close_supervisor_end(slot);
                    debug!(pid = slot.pid(), %database_id, "evicted pooled worker");
                }
                SlotStatus::Active => {
                    // The worker keeps serving its current client, but may
                    // not pool afterwards: it exits at end of session.
                    slot.set_database_id(None);
                    slot.request_exit();
                    debug!(pid = slot.pid(), %database_id, "cleared binding of active worker");
                }
                SlotStatus::Unused | SlotStatus::Reassigning => {}
            }
        }
    }

    /// Drains the pool on orderly shutdown: every pooled worker's supervisor
    /// end is closed, which its wait loop observes as end-of-stream.
    pub fn shutdown_pooled(&self) {
        let mut guard = self.lock();
        for slot in guard.slots.iter_mut() {
            if slot.status() == SlotStatus::Pooled {
                slot.request_exit();
                close_supervisor_end(slot);
                debug!(pid = slot.pid(), "notified pooled worker of shutdown");
            }
        }
    }

    /// Tries to route an accepted client to a compatible pooled worker.
    ///
    /// Peeks the client's startup bytes without consuming them; clients that
    /// open with secure-channel, credential-transport, cancel, or replication
    /// requests always go to a fresh fork, as does any client whose requested
    /// database has no pooled worker. Among matching slots the one with the
    /// highest index wins, preferring the most recently pooled worker.
    ///
    /// Two clients racing for the same database are each routed by their own
    /// scan; no fairness across workers is guaranteed.
    pub fn assign_client(&self, client: OwnedFd) -> Routing {
        let name = match startup::peek_routing_name(client.as_fd()) {
            Ok(Some(name)) => name,
            Ok(None) => return Routing::Fork(client),
            Err(err) => {
                debug!(error = %err, "startup peek failed; forking instead");
                return Routing::Fork(client);
            }
        };
        let peer = match PeerAddr::from_peer_of(client.as_fd()) {
            Ok(peer) => peer,
            Err(err) => {
                debug!(error = %err, "could not read client peer address; forking instead");
                return Routing::Fork(client);
            }
        };

        let (index, end) = {
            let mut guard = self.lock();
            // Reverse order: the most recently pooled worker has the warmest
            // caches.
            let Some(index) = guard.slots.iter().rposition(|slot| {
                slot.status() == SlotStatus::Pooled && slot.database_name() == name.as_bytes()
            }) else {
                return Routing::Fork(client);
            };
            let slot = &mut guard.slots[index];
            slot.set_status(SlotStatus::Reassigning);
            match slot.supervisor_end() {
                Some(end) => (index, end),
                None => {
                    // Pooled slots always carry an open end; recover anyway.
                    slot.set_status(SlotStatus::Pooled);
                    warn!(pid = slot.pid(), "pooled slot had no supervisor end");
                    return Routing::Fork(client);
                }
            }
        };

        let handoff = ClientHandoff { peer, client };
        // SAFETY: the slot owns `end` and cannot close it while the slot sits
        // in `Reassigning`, which only this call moves it out of.
        let end = unsafe { BorrowedFd::borrow_raw(end) };
        match channel::send_handoff(end, &handoff) {
            Ok(()) => {
                debug!(slot = index, database = %name, "client handed to pooled worker");
                Routing::Assigned
            }
            Err(err) => {
                warn!(slot = index, error = %err, "handoff send failed; reverting slot");
                let mut guard = self.lock();
                let slot = &mut guard.slots[index];
                if slot.status() == SlotStatus::Reassigning {
                    slot.set_status(SlotStatus::Pooled);
                }
                Routing::Fork(handoff.client)
            }
        }
    }

    /// Whether the supervisor has asked the worker owning `pid` to exit.
    pub fn exit_requested(&self, pid: i32) -> bool {
        let mut guard = self.lock();
        guard.find_mut(pid).is_some_and(|slot| slot.exit_requested())
    }

    /// Copies every slot's published state, for the server's admin and stats
    /// surfaces. Read-only.
    pub fn snapshot(&self) -> Vec<SlotInfo> {
        let guard = self.lock();
        guard
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotInfo {
                index,
                pid: slot.pid(),
                worker_key: slot.worker_key(),
                status: slot.status(),
                database_id: slot.database_id(),
                database_name: String::from_utf8_lossy(slot.database_name()).into_owned(),
            })
            .collect()
    }

    fn header(&self) -> &RegistryHeader {
        // SAFETY: the region outlives `self` and was initialized by
        // `initialize_in`.
        unsafe { self.region.as_ptr().cast::<RegistryHeader>().as_ref() }
    }

    /// # Safety
    ///
    /// Only during initialization, before any other process can observe the
    /// region.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut RegistryHeader {
        unsafe { self.region.as_ptr().cast::<RegistryHeader>().as_mut() }
    }

    /// # Safety
    ///
    /// The registry lock must be held, or no other process may be able to
    /// observe the region yet.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slots_mut(&self) -> &mut [RawSlot] {
        let header = self.header();
        let base = unsafe {
            self.region
                .as_ptr()
                .as_ptr()
                .add(mem::size_of::<RegistryHeader>())
                .cast::<RawSlot>()
        };
        unsafe { slice::from_raw_parts_mut(base, header.capacity as usize) }
    }

    fn lock(&self) -> RegistryGuard<'_> {
        let ticket = self.header().lock.lock();
        // SAFETY: the ticket guard provides exclusion across processes.
        let slots = unsafe { self.slots_mut() };
        RegistryGuard {
            slots,
            _ticket: ticket,
        }
    }
}

/// Locked view of the slot array.
struct RegistryGuard<'a> {
    slots: &'a mut [RawSlot],
    _ticket: TicketGuard<'a>,
}

impl RegistryGuard<'_> {
    fn find_mut(&mut self, pid: i32) -> Option<&mut RawSlot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.pid() == pid && slot.status() != SlotStatus::Unused)
    }

    fn pooled_or_reassigning(&self) -> u32 {
        self.slots
            .iter()
            .filter(|slot| {
                matches!(
                    slot.status(),
                    SlotStatus::Pooled | SlotStatus::Reassigning
                )
            })
            .count() as u32
    }
}

fn close_supervisor_end(slot: &mut RawSlot) {
    if let Some(fd) = slot.supervisor_end() {
        // SAFETY: the slot is the sole owner of this descriptor inside the
        // supervisor process; it is closed exactly once here.
        drop(unsafe { OwnedFd::from_raw_fd(fd) });
        slot.clear_supervisor_end();
    }
}
