#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod channel;
pub mod error;
pub mod options;
pub mod registry;
pub mod reuse;
pub mod session;
pub mod startup;

pub use crate::{
    channel::{ClientHandoff, PeerAddr, Received},
    error::{Error, ErrorKind, Result},
    options::PoolOptions,
    registry::{
        slot::{CancelKey, DatabaseId, SlotStatus, TablespaceId, WorkerKey},
        PoolRegistry,
        Routing,
        SharedRegion,
        SlotInfo,
    },
    reuse::{
        wait::{DeathHandle, DeathWatch, PendingInterrupts, WakeLatch},
        DatabaseBinding,
        PooledWorker,
        Reentry,
    },
    session::{DatabaseEntry, SessionHooks, Severity},
    startup::{StartupPacket, StartupRequest},
};
