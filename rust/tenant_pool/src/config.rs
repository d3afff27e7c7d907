use std::time::Duration;

/// How many times a failed connect is retried before the error is handed to
/// every waiter of the affected database. Permanent failures (as classified
/// by the connector) skip the retries entirely.
pub const MAX_CONNECT_RETRIES: usize = 3;

/// Floor for the average connect time wherever it is used as a pacing or
/// keep-alive threshold.
pub const MIN_CONN_TIME_THRESHOLD: Duration = Duration::from_millis(10);

/// Floor for the average query time when computing calibrated demand.
pub const MIN_QUERY_TIME_THRESHOLD: Duration = Duration::from_millis(1);

/// Connection lifecycle events closer together than this are coalesced into
/// a single batched log line.
pub const MIN_LOG_TIME_THRESHOLD: Duration = Duration::from_secs(1);

/// Minimum time a connection must sit unused on the idle stack before the
/// garbage collector may reclaim it; also the minimum spacing of GC runs.
pub const MIN_IDLE_TIME_BEFORE_GC: Duration = Duration::from_secs(120);

/// Pacing of stats snapshots for pools that are not driven by the
/// calibration tick.
pub const STATS_COLLECT_INTERVAL: Duration = Duration::from_millis(100);
