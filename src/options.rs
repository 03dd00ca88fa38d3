//! Contains the options for configuring the worker pool.

use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    registry::slot::MAX_DATABASE_NAME,
};

/// The default divisor applied to the pool capacity when computing the
/// reserved-headroom cap: at most `max(capacity / 4, 1)` slots may be
/// `Pooled` or `Reassigning` at once.
pub const DEFAULT_RESERVE_DIVISOR: u32 = 4;

/// The default timeout for one pass of the pooled worker's wait loop.
/// Shutdown and reload conditions are rechecked at least this often.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn default_reserve_divisor() -> u32 {
    DEFAULT_RESERVE_DIVISOR
}

fn default_wait_timeout() -> Duration {
    DEFAULT_WAIT_TIMEOUT
}

fn default_max_database_name() -> usize {
    MAX_DATABASE_NAME
}

/// Options for the pool registry and the pooled-worker wait loop.
///
/// `capacity` must equal the server's maximum worker count; every other field
/// has a default. The reserve divisor is a policy knob: it bounds how many
/// workers may sit idle in the pool so that slots remain available for
/// clients no pooled worker can serve.
#[derive(Clone, Debug, Deserialize, PartialEq, TypedBuilder)]
#[non_exhaustive]
pub struct PoolOptions {
    /// The fixed number of worker slots in the registry.
    pub capacity: u32,

    /// Divisor for the reserved-headroom cap; the number of `Pooled` plus
    /// `Reassigning` slots never exceeds `max(capacity / reserve_divisor, 1)`.
    #[builder(default = DEFAULT_RESERVE_DIVISOR)]
    #[serde(default = "default_reserve_divisor")]
    pub reserve_divisor: u32,

    /// How long the pooled worker blocks in one `poll` before rechecking
    /// shutdown and reload conditions.
    #[builder(default = DEFAULT_WAIT_TIMEOUT)]
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: Duration,

    /// Maximum accepted database-name length in bytes. Names longer than
    /// this cannot be stored in a slot, so such workers are refused pooling.
    #[builder(default = MAX_DATABASE_NAME)]
    #[serde(default = "default_max_database_name")]
    pub max_database_name: usize,
}

impl PoolOptions {
    /// Validates the options, returning an `InvalidArgument` error for any
    /// value the registry cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::invalid_argument("pool capacity must be nonzero"));
        }
        if self.reserve_divisor == 0 {
            return Err(Error::invalid_argument("reserve divisor must be nonzero"));
        }
        if self.max_database_name == 0 || self.max_database_name > MAX_DATABASE_NAME {
            return Err(Error::invalid_argument(format!(
                "max database name must be within 1..={}",
                MAX_DATABASE_NAME
            )));
        }
        Ok(())
    }

    /// The reserved-headroom cap computed from `capacity` and
    /// `reserve_divisor`.
    pub fn reserve_cap(&self) -> u32 {
        (self.capacity / self.reserve_divisor).max(1)
    }
}
