use std::{
    io::Write,
    os::{
        fd::{AsFd, OwnedFd},
        unix::net::UnixStream,
    },
};

use pretty_assertions::assert_eq;

use super::{
    slot::{DatabaseId, SlotStatus, WorkerKey},
    PoolRegistry,
    Routing,
};
use crate::{
    channel::{self, receive_handoff, Received},
    options::PoolOptions,
    startup::test::startup_packet,
};

const APP_DB: DatabaseId = DatabaseId(17);

fn options(capacity: u32) -> PoolOptions {
    PoolOptions::builder().capacity(capacity).build()
}

fn registry(capacity: u32) -> PoolRegistry {
    PoolRegistry::create(&options(capacity)).unwrap()
}

/// Registers a worker and returns its inherited channel end.
fn register(registry: &PoolRegistry, pid: i32, database_id: DatabaseId) -> OwnedFd {
    let (supervisor_end, worker_end) = channel::pair().unwrap();
    registry
        .register_worker(pid, WorkerKey(pid as u32), database_id, supervisor_end)
        .unwrap_or_else(|_| panic!("no slot for pid {}", pid));
    worker_end
}

/// A connected "accepted client" with the given startup bytes already
/// buffered, plus the keep-alive far end.
fn client_with_startup(pairs: &[(&str, &str)]) -> (OwnedFd, UnixStream) {
    let (near, mut far) = UnixStream::pair().unwrap();
    far.write_all(&startup_packet(pairs)).unwrap();
    (OwnedFd::from(near), far)
}

fn status_of(registry: &PoolRegistry, pid: i32) -> SlotStatus {
    registry
        .snapshot()
        .into_iter()
        .find(|slot| slot.pid == pid)
        .map(|slot| slot.status)
        .unwrap_or(SlotStatus::Unused)
}

/// The §3 invariants that must hold outside every critical section.
fn assert_invariants(registry: &PoolRegistry) {
    let mut guard = registry.lock();
    let reserve_cap = registry.header().reserve_cap;

    let mut pids = Vec::new();
    let mut reserved = 0u32;
    for slot in guard.slots.iter_mut() {
        match slot.status() {
            SlotStatus::Unused => {
                assert_eq!(slot.pid(), 0);
                assert_eq!(slot.supervisor_end(), None);
            }
            status => {
                assert_ne!(slot.pid(), 0);
                assert!(!pids.contains(&slot.pid()), "duplicate pid {}", slot.pid());
                pids.push(slot.pid());
                if status == SlotStatus::Pooled {
                    assert!(slot.database_id().is_some());
                    assert!(!slot.database_name().is_empty());
                }
                if matches!(status, SlotStatus::Pooled | SlotStatus::Reassigning) {
                    reserved += 1;
                }
            }
        }
    }
    assert!(reserved <= reserve_cap, "{} reserved > cap {}", reserved, reserve_cap);
}

#[test]
fn register_marks_the_first_unused_slot_active() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].pid, 101);
    assert_eq!(snapshot[0].status, SlotStatus::Active);
    assert_eq!(snapshot[0].database_id, Some(APP_DB));
    assert_eq!(snapshot[0].worker_key, WorkerKey(101));
    assert!(snapshot[1..].iter().all(|s| s.status == SlotStatus::Unused));
    assert_invariants(&registry);
}

#[test]
fn register_beyond_capacity_returns_the_endpoint() {
    let registry = registry(1);
    let _w1 = register(&registry, 101, APP_DB);

    let (supervisor_end, _worker_end) = channel::pair().unwrap();
    let returned = registry.register_worker(202, WorkerKey(202), APP_DB, supervisor_end);
    assert!(returned.is_err());
    assert_invariants(&registry);
}

#[test]
fn mark_pooled_publishes_the_routing_name() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    assert!(registry.mark_pooled(101, "app"));
    let slot = &registry.snapshot()[0];
    assert_eq!(slot.status, SlotStatus::Pooled);
    assert_eq!(slot.database_name, "app");
    assert_invariants(&registry);
}

#[test]
fn mark_pooled_refuses_unknown_empty_and_oversized() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    assert!(!registry.mark_pooled(999, "app"));
    assert!(!registry.mark_pooled(101, ""));
    assert!(!registry.mark_pooled(101, &"x".repeat(65)));
    assert_eq!(status_of(&registry, 101), SlotStatus::Active);
}

#[test]
fn reserve_cap_limits_pooled_workers() {
    // Capacity 8, default divisor 4: exactly two workers may pool.
    let registry = registry(8);
    let _ends: Vec<_> = (0..8).map(|i| register(&registry, 101 + i, APP_DB)).collect();

    assert!(registry.mark_pooled(101, "a"));
    assert!(registry.mark_pooled(102, "a"));
    assert!(!registry.mark_pooled(103, "a"));
    assert!(!registry.mark_pooled(104, "a"));

    let pooled = registry
        .snapshot()
        .iter()
        .filter(|slot| slot.status == SlotStatus::Pooled)
        .count();
    assert_eq!(pooled, 2);
    assert_invariants(&registry);
}

#[test]
fn capacity_one_still_allows_one_pooled_worker() {
    let registry = registry(1);
    let _w1 = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "app"));
}

#[test]
fn eviction_prevents_pooling() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    registry.evict_database(APP_DB);
    assert!(registry.exit_requested(101));
    assert!(!registry.mark_pooled(101, "app"));
    assert_eq!(status_of(&registry, 101), SlotStatus::Active);
    assert_invariants(&registry);
}

#[test]
fn evicting_a_pooled_worker_notifies_and_unbinds_it() {
    let registry = registry(4);
    let worker_end = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "app"));

    registry.evict_database(APP_DB);

    let slot = &registry.snapshot()[0];
    assert_eq!(slot.status, SlotStatus::Reassigning);
    assert_eq!(slot.database_id, None);
    assert_eq!(slot.database_name, "");
    assert!(registry.exit_requested(101));
    // The closed supervisor end is observed as end-of-stream.
    assert!(matches!(
        receive_handoff(worker_end.as_fd()).unwrap(),
        Received::EndOfStream
    ));

    registry.remove_worker(101);
    assert_eq!(registry.snapshot()[0].status, SlotStatus::Unused);
    assert_invariants(&registry);
}

#[test]
fn remove_worker_is_idempotent() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    registry.remove_worker(999);
    registry.remove_worker(101);
    registry.remove_worker(101);
    assert!(registry
        .snapshot()
        .iter()
        .all(|slot| slot.status == SlotStatus::Unused));
    assert_invariants(&registry);
}

#[test]
fn shutdown_drains_every_pooled_worker() {
    let registry = registry(8);
    let w1 = register(&registry, 101, APP_DB);
    let w2 = register(&registry, 102, APP_DB);
    let _w3 = register(&registry, 103, APP_DB);
    assert!(registry.mark_pooled(101, "a"));
    assert!(registry.mark_pooled(102, "b"));

    registry.shutdown_pooled();

    for worker_end in [&w1, &w2] {
        assert!(matches!(
            receive_handoff(worker_end.as_fd()).unwrap(),
            Received::EndOfStream
        ));
    }
    assert!(registry.exit_requested(101));
    assert!(!registry.exit_requested(103));
}

#[test]
fn assignment_prefers_the_most_recently_pooled_worker() {
    // Scenario: four workers on "app"; slots 2 and 4 pool. Clients pick slot
    // 4 first, then slot 2, then nobody.
    let registry = registry(8);
    let ends: Vec<_> = (0..4).map(|i| register(&registry, 101 + i, APP_DB)).collect();
    assert!(registry.mark_pooled(102, "app"));
    assert!(registry.mark_pooled(104, "app"));

    let (client, _keep) = client_with_startup(&[("database", "app"), ("user", "alice")]);
    assert!(registry.assign_client(client).is_assigned());
    assert_eq!(status_of(&registry, 104), SlotStatus::Reassigning);
    assert_eq!(status_of(&registry, 102), SlotStatus::Pooled);
    let Received::Handoff(handoff) = receive_handoff(ends[3].as_fd()).unwrap() else {
        panic!("slot 4 should have received the handoff");
    };
    drop(handoff);

    let (client, _keep2) = client_with_startup(&[("database", "app"), ("user", "bob")]);
    assert!(registry.assign_client(client).is_assigned());
    assert_eq!(status_of(&registry, 102), SlotStatus::Reassigning);

    let (client, _keep3) = client_with_startup(&[("database", "app"), ("user", "carol")]);
    assert!(matches!(registry.assign_client(client), Routing::Fork(_)));
    assert_invariants(&registry);
}

#[test]
fn assignment_without_a_match_changes_nothing() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "app"));

    let (client, _keep) = client_with_startup(&[("database", "other")]);
    let routing = registry.assign_client(client);
    assert!(matches!(routing, Routing::Fork(_)));
    assert_eq!(status_of(&registry, 101), SlotStatus::Pooled);
}

#[test]
fn assignment_refuses_negotiation_requests() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "app"));

    let (near, mut far) = UnixStream::pair().unwrap();
    let mut packet = 8u32.to_be_bytes().to_vec();
    packet.extend_from_slice(&crate::startup::TLS_REQUEST_CODE.to_be_bytes());
    far.write_all(&packet).unwrap();

    let routing = registry.assign_client(OwnedFd::from(near));
    assert!(matches!(routing, Routing::Fork(_)));
    assert_eq!(status_of(&registry, 101), SlotStatus::Pooled);
}

#[test]
fn assignment_matches_on_the_user_fallback() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "bob"));

    let (client, _keep) = client_with_startup(&[("user", "bob")]);
    assert!(registry.assign_client(client).is_assigned());
    assert_eq!(status_of(&registry, 101), SlotStatus::Reassigning);
}

#[test]
fn failed_handoff_send_reverts_the_slot() {
    let registry = registry(4);
    let worker_end = register(&registry, 101, APP_DB);
    assert!(registry.mark_pooled(101, "app"));
    // The worker died without being reaped yet.
    drop(worker_end);

    let (client, _keep) = client_with_startup(&[("database", "app")]);
    let routing = registry.assign_client(client);

    // The client comes back for the fork path and the slot may match again.
    assert!(matches!(routing, Routing::Fork(_)));
    assert_eq!(status_of(&registry, 101), SlotStatus::Pooled);
    assert_invariants(&registry);
}

#[test]
fn update_database_id_round_trips() {
    let registry = registry(4);
    let _w1 = register(&registry, 101, APP_DB);

    registry.update_database_id(101, None);
    assert_eq!(registry.snapshot()[0].database_id, None);
    registry.update_database_id(101, Some(DatabaseId(99)));
    assert_eq!(registry.snapshot()[0].database_id, Some(DatabaseId(99)));
}

#[test]
fn reserved_size_scales_with_capacity() {
    let one = PoolRegistry::reserved_size(1);
    let two = PoolRegistry::reserved_size(2);
    assert!(one > 0);
    assert!(two > one);
}
