pub(crate) mod block;
pub mod config;
pub(crate) mod conn;
pub(crate) mod naive;
pub(crate) mod pool;
pub(crate) mod rolavg;
pub(crate) mod snapshot;
pub(crate) mod waitqueue;

mod time {
    #[cfg(not(test))]
    pub use std::time::Instant;
    #[cfg(test)]
    pub use tokio::time::Instant;
}

// Public interface

pub use conn::{ConnError, ConnResult, Connector};
pub use naive::NaivePool;
pub use pool::{Pool, PoolConfig};
pub use snapshot::{BlockSnapshot, PoolEvent, Snapshot, SnapshotLog, StatsCollector};
