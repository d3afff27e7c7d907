use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;

use crate::time::Instant;

pub type ConnResult<T, E> = Result<T, ConnError<E>>;

/// Errors surfaced by the pool. `Underlying` carries the connector's own
/// error; the remaining variants are raised by the pool itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnError<E> {
    /// The pool is closing; all outstanding and future acquires fail.
    #[error("the pool is shutting down")]
    Shutdown,
    /// The database has never been seen by the pool.
    #[error("database is not known to the pool")]
    UnknownDb,
    /// The connection does not belong to the pool. Releasing such a
    /// connection is a caller bug; the pool does not try to recover.
    #[error("connection does not belong to the pool")]
    UnknownConn,
    /// The connection is known but was not checked out.
    #[error("connection was not acquired from the pool")]
    NotAcquired,
    #[error("{0}")]
    Underlying(E),
}

/// The abstract connect/disconnect contract the pool consumes. The pool
/// never interprets a connection beyond identity: handles must be cheap to
/// clone and stably hashable so they can be looked up in per-block maps.
///
/// The returned futures must not borrow the connector; they are spawned as
/// local tasks and may outlive the call site.
pub trait Connector: 'static {
    type Conn: Clone + Eq + Hash + Debug + 'static;
    type Error: Clone + Debug + Display + 'static;

    fn connect(
        &self,
        db: &str,
    ) -> impl Future<Output = ConnResult<Self::Conn, Self::Error>> + 'static;

    fn disconnect(
        &self,
        conn: Self::Conn,
    ) -> impl Future<Output = ConnResult<(), Self::Error>> + 'static;

    /// Classify an error as permanent (e.g. the database does not exist).
    /// Permanent connect failures are propagated without retrying.
    fn is_permanent_error(&self, _error: &Self::Error) -> bool {
        false
    }
}

/// Mutable per-connection state, keyed by the connection handle inside a
/// block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnState {
    pub in_use: bool,
    pub in_use_since: Instant,
    pub in_stack_since: Instant,
}

impl ConnState {
    pub fn new(now: Instant) -> Self {
        Self {
            in_use: false,
            in_use_since: now,
            in_stack_since: now,
        }
    }
}

/// Connection lifecycle events, used for the batched per-block log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
pub(crate) enum ConnEvent {
    #[strum(serialize = "established")]
    Established,
    #[strum(serialize = "transferred in")]
    TransferredIn,
    #[strum(serialize = "transferred out")]
    TransferredOut,
    #[strum(serialize = "discarded")]
    Discarded,
}
