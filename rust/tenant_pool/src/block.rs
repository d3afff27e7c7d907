use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use itertools::Itertools;
use scopeguard::ScopeGuard;
use tracing::info;

use crate::config;
use crate::conn::{ConnError, ConnEvent, ConnResult, ConnState, Connector};
use crate::rolavg::RollingAverage;
use crate::time::Instant;
use crate::waitqueue::WaitQueue;

/// A block holds the connections to one backend database. The pool consists
/// of one or more blocks; blocks are the basic unit of the pooling
/// algorithm, while the pool itself balances resources between them, because
/// all blocks share the same backend connection budget.
///
/// Idle connections live on a LIFO stack rather than a round-robin queue:
/// the most recently used connection is always yielded first, so garbage
/// collection and connection stealing can recycle the least recently used
/// ones from the bottom without touching the hot end.
///
/// Acquirers that cannot be served immediately suspend on a FIFO waiter
/// queue and are woken one at a time as connections are released into the
/// stack.
#[derive(derive_more::Debug)]
pub(crate) struct Block<C: Connector> {
    pub dbname: String,
    pub conns: RefCell<HashMap<C::Conn, ConnState>>,
    pub pending_conns: Cell<usize>,
    pub quota: Cell<usize>,
    idle_stack: RefCell<VecDeque<C::Conn>>,
    #[debug(skip)]
    waiters: WaitQueue<C::Error>,
    waiters_count: Cell<usize>,
    pub acquired_count: Cell<usize>,
    pub connect_failures: Cell<usize>,
    pub last_connect_ts: Cell<Instant>,
    pub querytime_avg: RefCell<RollingAverage<20>>,
    pub nwaiters_avg: RefCell<RollingAverage<3>>,
    /// Set by prune to refuse inbound transfers until the next acquire.
    pub suppressed: Cell<bool>,
    /// Calibrated demand cached by the most recent tick.
    pub demand: Cell<f64>,
    #[debug(skip)]
    log: RefCell<LogBatch>,
}

struct LogBatch {
    batching: bool,
    last_ts: Option<Instant>,
    events: BTreeMap<ConnEvent, usize>,
}

impl<C: Connector> Block<C> {
    pub fn new(dbname: &str) -> Rc<Self> {
        Rc::new(Self {
            dbname: dbname.to_owned(),
            conns: Default::default(),
            pending_conns: Cell::new(0),
            quota: Cell::new(1),
            idle_stack: Default::default(),
            waiters: Default::default(),
            waiters_count: Cell::new(0),
            acquired_count: Cell::new(0),
            connect_failures: Cell::new(0),
            last_connect_ts: Cell::new(Instant::now()),
            querytime_avg: Default::default(),
            nwaiters_avg: Default::default(),
            suppressed: Cell::new(false),
            demand: Cell::new(0.0),
            log: RefCell::new(LogBatch {
                batching: false,
                last_ts: None,
                events: BTreeMap::new(),
            }),
        })
    }

    /// Total number of connections owned by this block: idle, checked out,
    /// and still pending in connect.
    pub fn count_conns(&self) -> usize {
        self.conns.borrow().len() + self.pending_conns.get()
    }

    /// Number of acquirers currently suspended or about to suspend.
    pub fn count_waiters(&self) -> usize {
        self.waiters_count.get()
    }

    /// Number of idle connections on the stack.
    pub fn count_queued_conns(&self) -> usize {
        self.idle_stack.borrow().len()
    }

    pub fn count_pending_conns(&self) -> usize {
        self.pending_conns.get()
    }

    pub fn count_conns_over_quota(&self) -> usize {
        self.count_conns().saturating_sub(self.quota.get())
    }

    /// Approximate because a release may have completed while the woken
    /// waiter has not yet resumed to claim the connection.
    pub fn count_approx_available_conns(&self) -> usize {
        self.count_conns()
            .saturating_sub(self.acquired_count.get() + self.waiters_count.get())
    }

    pub fn inc_acquired_counter(&self) {
        self.acquired_count.set(self.acquired_count.get() + 1);
    }

    pub fn dec_acquired_counter(&self) {
        self.acquired_count.set(self.acquired_count.get() - 1);
    }

    pub fn inc_pending(&self) {
        self.pending_conns.set(self.pending_conns.get() + 1);
    }

    pub fn dec_pending(&self) {
        self.pending_conns.set(self.pending_conns.get() - 1);
    }

    /// Take one idle connection from the bottom of the stack (the least
    /// recently used one) without suspending. With `only_older_than`, the
    /// connection is returned only if it entered the stack at or before the
    /// given time; the stack is time-ordered, so only the bottom needs
    /// checking.
    pub fn try_steal(&self, only_older_than: Option<Instant>) -> Option<C::Conn> {
        let mut stack = self.idle_stack.borrow_mut();
        let oldest = stack.front()?;
        if let Some(threshold) = only_older_than {
            let conns = self.conns.borrow();
            let state = conns.get(oldest)?;
            if state.in_stack_since > threshold {
                return None;
            }
        }
        stack.pop_front()
    }

    /// One acquisition attempt. Returns `Ok(None)` when the waiter was woken
    /// but the stack had been drained again by a racing steal; `acquire`
    /// loops on that, re-registering at the front of the queue.
    pub async fn try_acquire(&self, attempts: usize) -> ConnResult<Option<C::Conn>, C::Error> {
        self.waiters_count.set(self.waiters_count.get() + 1);
        let _count = scopeguard::guard(&self.waiters_count, |count| {
            count.set(count.get() - 1);
        });

        let empty = self.idle_stack.borrow().is_empty();
        if empty {
            let waiter = self.waiters.subscribe(attempts > 1);
            // If this future is dropped after release() already picked it,
            // the wakeup must be passed on or the connection would sit idle
            // in front of a queue of sleeping waiters.
            let relay = scopeguard::guard((), |()| {
                if !self.idle_stack.borrow().is_empty() {
                    self.waiters.wake_next();
                }
            });
            match waiter.await {
                Ok(Ok(())) => {
                    ScopeGuard::into_inner(relay);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnError::Shutdown),
            }
        }

        Ok(self.idle_stack.borrow_mut().pop_back())
    }

    /// Acquire an idle connection, suspending until one is available. The
    /// most recently used connection is yielded first.
    pub async fn acquire(&self) -> ConnResult<C::Conn, C::Error> {
        let mut attempts = 1;
        loop {
            if let Some(conn) = self.try_acquire(attempts).await? {
                return Ok(conn);
            }
            attempts += 1;
        }
    }

    /// Put a connection (back) on top of the stack, refresh its timestamp
    /// and wake at most one waiter.
    pub fn release(&self, conn: C::Conn) {
        let now = Instant::now();
        {
            let mut conns = self.conns.borrow_mut();
            let state = conns.get_mut(&conn);
            debug_assert!(state.as_ref().is_some_and(|s| !s.in_use));
            if let Some(state) = state {
                state.in_stack_since = now;
            }
        }
        self.idle_stack.borrow_mut().push_back(conn);
        self.waiters.wake_next();
    }

    /// Propagate `error` to every suspended acquirer. Used when connects to
    /// this database have permanently failed, and on pool shutdown.
    pub fn abort_waiters(&self, error: ConnError<C::Error>)
    where
        C::Error: Clone,
    {
        self.waiters.abort_all(error);
    }

    pub fn clear_stack(&self) {
        self.idle_stack.borrow_mut().clear();
    }

    /// Log a connection lifecycle event, coalescing bursts into a single
    /// batched line flushed after the suppression window. Observability
    /// only; never consulted by pool decisions.
    pub fn log_connection(self: &Rc<Self>, event: ConnEvent) {
        let now = Instant::now();
        let mut log = self.log.borrow_mut();
        if log.batching {
            *log.events.entry(event).or_default() += 1;
        } else if log
            .last_ts
            .map_or(true, |ts| now.duration_since(ts) > config::MIN_LOG_TIME_THRESHOLD)
        {
            info!("Connection {event} to backend database: {}", self.dbname);
            log.last_ts = Some(now);
        } else {
            log.batching = true;
            log.events.clear();
            log.events.insert(event, 1);
            let block = self.clone();
            tokio::task::spawn_local(async move {
                tokio::time::sleep(config::MIN_LOG_TIME_THRESHOLD).await;
                block.flush_log();
            });
        }
    }

    fn flush_log(&self) {
        let mut log = self.log.borrow_mut();
        let summary = log
            .events
            .iter()
            .map(|(event, count)| format!("{count} were {event}"))
            .join(", ");
        info!(
            "Backend connections to database {}: {summary} in at least the last {:?}.",
            self.dbname,
            config::MIN_LOG_TIME_THRESHOLD
        );
        log.batching = false;
        log.last_ts = Some(Instant::now());
        log.events.clear();
    }
}
