use serde::Serialize;

/// Sink for periodic pool snapshots. Stats are a lossy side channel: a slow
/// collector should drop older snapshots rather than block, because the
/// calibration tick will not wait for it.
pub trait StatsCollector {
    fn collect(&self, snapshot: Snapshot);
}

/// Events recorded into the snapshot log between two ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PoolEvent {
    /// A new connect was scheduled for a block.
    Connect,
    /// A connection was scheduled for disconnect.
    Disconnect,
    /// A connection left a block as the source of a transfer.
    TransferFrom,
    SetQuota,
    ResetQuota,
    /// An idle connection was stolen from an over-quota block.
    ConnStolen,
    /// A released connection went to a new block awaiting its first one.
    FirstConn,
    /// A released connection revived a block that had none left.
    ReviveConn,
    /// A released connection moved to the most under-quota block.
    RedistConn,
    /// Naive-pool handoff of a released connection.
    Free,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLog {
    pub timestamp: f64,
    pub event: PoolEvent,
    pub dbname: String,
    pub value: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockSnapshot {
    pub dbname: String,
    pub nwaiters_avg: usize,
    pub nconns: usize,
    pub npending: usize,
    pub nwaiters: usize,
    pub quota: usize,
}

/// Observable pool state, emitted once per tick. The log carries the events
/// observed since the previous emission.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub timestamp: f64,
    pub capacity: usize,
    pub blocks: Vec<BlockSnapshot>,
    pub log: Vec<SnapshotLog>,

    pub failed_connects: usize,
    pub failed_disconnects: usize,
    pub successful_connects: usize,
    pub successful_disconnects: usize,
}
