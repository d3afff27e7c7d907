use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use smart_default::SmartDefault;
use tracing::{debug, error, trace, warn};

use crate::block::Block;
use crate::config;
use crate::conn::{ConnError, ConnEvent, ConnResult, ConnState, Connector};
use crate::rolavg::RollingAverage;
use crate::snapshot::{BlockSnapshot, PoolEvent, Snapshot, SnapshotLog, StatsCollector};
use crate::time::Instant;

#[derive(Debug, Clone, SmartDefault)]
pub struct PoolConfig {
    /// The aggregate backend connection budget shared by all databases.
    #[default = 100]
    pub max_capacity: usize,
    /// Minimum time a connection must sit idle before the GC may reclaim
    /// it; also the minimum spacing of GC runs.
    #[default(config::MIN_IDLE_TIME_BEFORE_GC)]
    pub min_idle_time_before_gc: Duration,
}

impl PoolConfig {
    pub fn assert_valid(&self) {
        assert!(self.max_capacity > 0);
    }

    /// Generate a suggested default configuration for the expected number of
    /// backend connections.
    pub fn suggested_default_for(connections: usize) -> Self {
        assert!(connections > 0);
        Self {
            max_capacity: connections,
            ..Default::default()
        }
    }

    pub fn with_min_idle_time_for_gc(mut self, min_idle_time_for_gc: Duration) -> Self {
        self.min_idle_time_before_gc = min_idle_time_for_gc;
        self
    }
}

/// State and plumbing shared by the production and the naive pool: the block
/// table, the capacity budget, the connect/disconnect/transfer tasks and the
/// snapshot pipeline.
///
/// The capacity counter is the one global every path creating or destroying
/// a connection must respect. It is mutated synchronously at the decision
/// point, never in the async tail of a task, so overlapping decisions cannot
/// exceed the budget.
#[derive(derive_more::Debug)]
pub(crate) struct PoolInner<C: Connector> {
    #[debug(skip)]
    pub connector: C,
    #[debug(skip)]
    pub stats: Option<Rc<dyn StatsCollector>>,
    pub max_capacity: usize,
    pub cur_capacity: Cell<usize>,
    /// Insertion-ordered; the order doubles as the round-robin position used
    /// while the pool is starving.
    pub blocks: RefCell<IndexMap<String, Rc<Block<C>>>>,
    /// Set when the count of demanding blocks meets or exceeds the max
    /// capacity, so some of them must time-share a single slot.
    pub is_starving: Cell<bool>,
    pub failed_connects: Cell<usize>,
    pub failed_disconnects: Cell<usize>,
    pub successful_connects: Cell<usize>,
    pub successful_disconnects: Cell<usize>,
    pub conntime_avg: RefCell<RollingAverage<10>>,
    current_snapshot: RefCell<Option<Snapshot>>,
    started_at: Instant,
    /// Bumped by prune_all: a connect that completes under a stale epoch
    /// must not attach its connection.
    epoch: Cell<u64>,
    pub closing: Cell<bool>,
}

impl<C: Connector> PoolInner<C> {
    pub fn new(
        connector: C,
        max_capacity: usize,
        stats: Option<Rc<dyn StatsCollector>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            connector,
            stats,
            max_capacity,
            cur_capacity: Cell::new(0),
            blocks: Default::default(),
            is_starving: Cell::new(false),
            failed_connects: Cell::new(0),
            failed_disconnects: Cell::new(0),
            successful_connects: Cell::new(0),
            successful_disconnects: Cell::new(0),
            conntime_avg: Default::default(),
            current_snapshot: Default::default(),
            started_at: Instant::now(),
            epoch: Cell::new(0),
            closing: Cell::new(false),
        })
    }

    fn now(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// The average connect time, floored so it stays usable as a pacing and
    /// keep-alive threshold before any sample exists.
    pub fn conn_time_threshold(&self) -> Duration {
        Duration::from_secs_f64(self.conntime_avg.borrow().avg())
            .max(config::MIN_CONN_TIME_THRESHOLD)
    }

    pub fn count_pending_conns(&self) -> usize {
        self.blocks
            .borrow()
            .values()
            .map(|block| block.count_pending_conns())
            .sum()
    }

    pub fn get_block(&self, dbname: &str) -> Rc<Block<C>> {
        if let Some(block) = self.blocks.borrow().get(dbname) {
            return block.clone();
        }
        self.new_block(dbname)
    }

    fn new_block(&self, dbname: &str) -> Rc<Block<C>> {
        let block = Block::new(dbname);
        let mut blocks = self.blocks.borrow_mut();
        let previous = blocks.insert(dbname.to_owned(), block.clone());
        debug_assert!(previous.is_none());
        if self.is_starving.get() {
            // Fresh blocks go to the front of the round-robin order.
            let last = blocks.len() - 1;
            blocks.move_index(last, 0);
        }
        block
    }

    pub fn drop_block(&self, block: &Rc<Block<C>>) {
        debug_assert_eq!(block.count_waiters(), 0);
        debug_assert_eq!(block.count_conns(), 0);
        debug_assert_eq!(block.quota.get(), 0);
        self.blocks.borrow_mut().shift_remove(&block.dbname);
    }

    pub fn move_to_end(&self, dbname: &str) {
        let mut blocks = self.blocks.borrow_mut();
        if let Some(index) = blocks.get_index_of(dbname) {
            let last = blocks.len() - 1;
            blocks.move_index(index, last);
        }
    }

    fn inc_capacity(&self) {
        self.cur_capacity.set(self.cur_capacity.get() + 1);
    }

    fn dec_capacity(&self) {
        self.cur_capacity.set(self.cur_capacity.get() - 1);
    }

    pub fn capture_snapshot(&self) {
        if self.stats.is_none() {
            return;
        }
        let mut current = self.current_snapshot.borrow_mut();
        debug_assert!(current.is_none());
        *current = Some(self.build_snapshot());
    }

    pub fn report_snapshot(&self) {
        let Some(stats) = &self.stats else { return };
        if let Some(snapshot) = self.current_snapshot.borrow_mut().take() {
            stats.collect(snapshot);
        }
    }

    fn build_snapshot(&self) -> Snapshot {
        let blocks = self
            .blocks
            .borrow()
            .values()
            .map(|block| BlockSnapshot {
                dbname: block.dbname.clone(),
                nwaiters_avg: block.nwaiters_avg.borrow().avg().round() as usize,
                nconns: block.conns.borrow().len(),
                npending: block.count_pending_conns(),
                nwaiters: block.count_waiters(),
                quota: block.quota.get(),
            })
            .sorted_by(|a, b| a.dbname.cmp(&b.dbname))
            .collect();

        Snapshot {
            timestamp: self.now(),
            capacity: self.cur_capacity.get(),
            blocks,
            log: Vec::new(),
            failed_connects: self.failed_connects.get(),
            failed_disconnects: self.failed_disconnects.get(),
            successful_connects: self.successful_connects.get(),
            successful_disconnects: self.successful_disconnects.get(),
        }
    }

    pub fn log_to_snapshot(&self, dbname: &str, event: PoolEvent, value: usize) {
        if self.stats.is_none() {
            return;
        }
        // Stats are a lossy side channel; an event with no snapshot in
        // progress is dropped rather than buffered.
        if let Some(snapshot) = self.current_snapshot.borrow_mut().as_mut() {
            snapshot.log.push(SnapshotLog {
                timestamp: self.now(),
                event,
                dbname: dbname.to_owned(),
                value,
            });
        }
    }

    /// Synchronously claim a slot, then dispatch an async connect targeting
    /// `block`.
    pub fn schedule_new_conn(self: &Rc<Self>, block: &Rc<Block<C>>, event: ConnEvent) {
        self.inc_capacity();
        block.inc_pending();
        if self.is_starving.get() {
            self.move_to_end(&block.dbname);
        }
        self.log_to_snapshot(&block.dbname, PoolEvent::Connect, block.count_conns());
        let inner = self.clone();
        let block = block.clone();
        let started_at = Instant::now();
        let epoch = self.epoch.get();
        tokio::task::spawn_local(async move {
            inner.connect(block, started_at, event, epoch).await;
        });
    }

    async fn connect(
        self: Rc<Self>,
        block: Rc<Block<C>>,
        started_at: Instant,
        event: ConnEvent,
        epoch: u64,
    ) {
        debug!(
            "Establishing new connection to backend database: {}",
            block.dbname
        );
        match self.connector.connect(&block.dbname).await {
            Err(error) => {
                self.failed_connects.set(self.failed_connects.get() + 1);
                self.dec_capacity();
                error!(
                    "Failed to establish a new connection to backend database {}: {error}",
                    block.dbname
                );
                block.connect_failures.set(block.connect_failures.get() + 1);

                let permanent = matches!(
                    &error,
                    ConnError::Underlying(e) if self.connector.is_permanent_error(e)
                );
                if permanent && block.connect_failures.get() <= config::MAX_CONNECT_RETRIES {
                    // e.g. the database does not exist: skip the remaining
                    // retries and propagate right away.
                    block.connect_failures.set(config::MAX_CONNECT_RETRIES + 1);
                }

                if self.closing.get() {
                    // The waiters were already aborted by close().
                } else if block.connect_failures.get() > config::MAX_CONNECT_RETRIES {
                    // There is no mapping from waiters to connect tasks, so
                    // the error goes to every waiter of this block.
                    block.abort_waiters(error);
                } else {
                    // Retry immediately, without sleeping: the calibration
                    // tick interval already provides the backoff.
                    self.schedule_new_conn(&block, event);
                }
                self.conntime_avg
                    .borrow_mut()
                    .add(started_at.elapsed().as_secs_f64());
                block.dec_pending();
            }
            Ok(conn) => {
                block.connect_failures.set(0);
                self.conntime_avg
                    .borrow_mut()
                    .add(started_at.elapsed().as_secs_f64());
                block.dec_pending();
                self.successful_connects
                    .set(self.successful_connects.get() + 1);

                if epoch != self.epoch.get() {
                    // The pool was hard-pruned while this connect was in
                    // flight; the fresh connection must not attach. Replace
                    // it under the new epoch while the block has demand.
                    let inner = self.clone();
                    let dbname = block.dbname.clone();
                    tokio::task::spawn_local(async move {
                        inner.disconnect(conn, &dbname).await;
                    });
                    block.log_connection(ConnEvent::Discarded);
                    if block.count_waiters() > 0 && !self.closing.get() {
                        self.schedule_new_conn(&block, event);
                    }
                    return;
                }

                let now = Instant::now();
                block
                    .conns
                    .borrow_mut()
                    .insert(conn.clone(), ConnState::new(now));
                block.last_connect_ts.set(now);
                // Hand the connection to the block's waiters.
                block.release(conn);
                block.log_connection(event);
            }
        }
    }

    async fn disconnect(&self, conn: C::Conn, dbname: &str) {
        debug!("Discarding a connection to backend database: {dbname}");
        match self.connector.disconnect(conn).await {
            Ok(()) => {
                self.successful_disconnects
                    .set(self.successful_disconnects.get() + 1);
            }
            Err(error) => {
                // The connection still counts as gone.
                self.failed_disconnects
                    .set(self.failed_disconnects.get() + 1);
                warn!("Failed to close a connection to backend database {dbname}: {error}");
            }
        }
        self.dec_capacity();
    }

    /// Atomically move a slot from `from` to `to`: the connection leaves the
    /// source block and the destination gains a pending connect, so the
    /// total capacity is unchanged.
    pub fn schedule_transfer(
        self: &Rc<Self>,
        from: &Rc<Block<C>>,
        conn: C::Conn,
        to: &Rc<Block<C>>,
    ) {
        let started_at = Instant::now();
        let state = from.conns.borrow_mut().remove(&conn);
        debug_assert!(state.is_some_and(|s| !s.in_use));
        to.inc_pending();
        if self.is_starving.get() {
            self.move_to_end(&to.dbname);
            self.move_to_end(&from.dbname);
        }
        let inner = self.clone();
        let from = from.clone();
        let to = to.clone();
        let epoch = self.epoch.get();
        tokio::task::spawn_local(async move {
            inner.log_to_snapshot(&from.dbname, PoolEvent::TransferFrom, 0);
            inner.disconnect(conn, &from.dbname).await;
            from.log_connection(ConnEvent::TransferredOut);
            inner.inc_capacity();
            inner
                .clone()
                .connect(to, started_at, ConnEvent::TransferredIn, epoch)
                .await;
        });
    }

    pub fn schedule_discard(self: &Rc<Self>, block: &Rc<Block<C>>, conn: C::Conn) {
        let inner = self.clone();
        let block = block.clone();
        tokio::task::spawn_local(async move {
            inner.discard(&block, conn).await;
        });
    }

    pub async fn discard(&self, block: &Rc<Block<C>>, conn: C::Conn) {
        let state = block.conns.borrow_mut().remove(&conn);
        debug_assert!(state.is_some_and(|s| !s.in_use));
        self.log_to_snapshot(&block.dbname, PoolEvent::Disconnect, block.count_conns());
        self.disconnect(conn, &block.dbname).await;
        block.log_connection(ConnEvent::Discarded);
    }

    /// Brutally close every connection in every block; used by HA failover.
    /// Pending connects are not awaited: completing under a stale epoch,
    /// they fail to attach and are torn down again.
    pub async fn prune_all(&self) {
        self.epoch.set(self.epoch.get() + 1);
        let blocks = self.blocks.borrow().values().cloned().collect_vec();
        let mut disconnects = Vec::new();
        for block in &blocks {
            block.clear_stack();
            let conns: Vec<C::Conn> = block
                .conns
                .borrow_mut()
                .drain()
                .map(|(conn, _)| conn)
                .collect();
            for conn in conns {
                disconnects.push(self.disconnect(conn, &block.dbname));
            }
            self.log_to_snapshot(&block.dbname, PoolEvent::Disconnect, 0);
        }
        futures::future::join_all(disconnects).await;
    }
}

/// The production pool: manages connections to the many databases of one
/// backend cluster, balancing acquisitions across databases in a relatively
/// fair way as demand shifts. Connections to the same database are kept in a
/// block; the pool arbitrates the shared budget between blocks.
///
/// The pool has four runtime modes, separately optimized:
///
/// - Mode A: a single database. A plain connection pool; a shortcut skips
///   all calibration.
/// - Mode B: multiple databases below max capacity. Blocks create
///   connections freely, racing for the spare budget organically.
/// - Mode C: at max capacity with tasks waiting. Per-block quotas are
///   recalibrated from observed demand on a periodic tick, and connections
///   are transferred between blocks to match them.
/// - Mode D: more demanding databases than slots. Each block holds at most
///   one connection and the starving rest are fed round-robin.
///
/// All state is single-threaded and cooperatively scheduled; the pool must
/// be driven from within a tokio [`LocalSet`](tokio::task::LocalSet).
#[derive(derive_more::Debug)]
pub struct Pool<C: Connector> {
    pub(crate) inner: Rc<PoolInner<C>>,
    gc_interval: Duration,
    /// Freshly created blocks awaiting their first connection, in creation
    /// order.
    new_blocks_waitlist: RefCell<IndexSet<String>>,
    /// Blocks left over quota by the last rebalance, sorted by how far over;
    /// concurrent acquires steal from these.
    #[debug(skip)]
    blocks_over_quota: RefCell<Vec<Rc<Block<C>>>>,
    nacquires: Cell<usize>,
    tick_scheduled: Cell<bool>,
    first_tick: Cell<bool>,
    gc_requests: Cell<usize>,
}

impl<C: Connector> Pool<C> {
    pub fn new(config: PoolConfig, connector: C) -> Rc<Self> {
        Self::with_stats_collector(config, connector, None)
    }

    pub fn with_stats(config: PoolConfig, connector: C, stats: Rc<dyn StatsCollector>) -> Rc<Self> {
        Self::with_stats_collector(config, connector, Some(stats))
    }

    fn with_stats_collector(
        config: PoolConfig,
        connector: C,
        stats: Option<Rc<dyn StatsCollector>>,
    ) -> Rc<Self> {
        config.assert_valid();
        Rc::new(Self {
            inner: PoolInner::new(connector, config.max_capacity, stats),
            gc_interval: config.min_idle_time_before_gc,
            new_blocks_waitlist: Default::default(),
            blocks_over_quota: Default::default(),
            nacquires: Cell::new(0),
            tick_scheduled: Cell::new(false),
            first_tick: Cell::new(true),
            gc_requests: Cell::new(0),
        })
    }

    /// Acquire a connection to `db`, suspending until one is available.
    /// Fails with the connector's error once the retries for this database
    /// are exhausted, and with [`ConnError::Shutdown`] when the pool is
    /// closing.
    pub async fn acquire(self: &Rc<Self>, db: &str) -> ConnResult<C::Conn, C::Error> {
        if self.inner.closing.get() {
            return Err(ConnError::Shutdown);
        }
        self.nacquires.set(self.nacquires.get() + 1);
        self.maybe_schedule_tick();
        let conn = {
            let _nacquires = scopeguard::guard(&self.nacquires, |count| {
                count.set(count.get() - 1);
            });
            self.acquire_inner(db).await?
        };

        let block = self.inner.blocks.borrow().get(db).cloned();
        let Some(block) = block else {
            debug_assert!(false, "block {db} vanished while handing out a connection");
            return Err(ConnError::UnknownDb);
        };
        {
            let mut conns = block.conns.borrow_mut();
            if let Some(state) = conns.get_mut(&conn) {
                debug_assert!(!state.in_use);
                state.in_use = true;
                state.in_use_since = Instant::now();
            }
        }
        block.inc_acquired_counter();
        trace!("acquire {db}: {conn:?}");
        Ok(conn)
    }

    async fn acquire_inner(self: &Rc<Self>, db: &str) -> ConnResult<C::Conn, C::Error> {
        let block = self.inner.get_block(db);
        block.suppressed.set(false);

        let room_for_new_conns = self.inner.cur_capacity.get() < self.inner.max_capacity;
        let nconns = block.count_conns();

        if room_for_new_conns {
            if self.inner.blocks.borrow().len() == 1 {
                // A single database (or the warm-up before the first tick):
                // keep at most one spare connection queued. Early requesters
                // in the same loop iteration grab the spares without
                // suspending, so this creates just enough connections for
                // the late ones plus one.
                if block.count_queued_conns() <= 1 {
                    self.inner.schedule_new_conn(&block, ConnEvent::Established);
                }
            } else if nconns == 0
                || nconns < block.quota.get()
                || block.count_approx_available_conns() == 0
            {
                // The block has no connections at all, or not enough.
                self.inner.schedule_new_conn(&block, ConnEvent::Established);
            }
            return block.acquire().await;
        }

        if nconns == 0 {
            // A block without any connections at the capacity limit: request
            // one of the next released connections to be reallocated here.
            if !self.try_steal_conn(&block) {
                self.new_blocks_waitlist.borrow_mut().insert(db.to_owned());
            }
            return block.acquire().await;
        }

        if nconns < block.quota.get() {
            // Best effort; fall through to the queue either way.
            self.try_steal_conn(&block);
        }
        block.acquire().await
    }

    /// Return a connection after use. The connection must be checked out
    /// from this pool; anything else is a caller bug surfaced as an error.
    pub fn release(self: &Rc<Self>, db: &str, conn: C::Conn) -> ConnResult<(), C::Error> {
        self.release_conn(db, conn, false)
    }

    /// Like [`Pool::release`], but disconnect the connection and replace it
    /// with a fresh one instead of recycling it.
    pub fn release_discard(self: &Rc<Self>, db: &str, conn: C::Conn) -> ConnResult<(), C::Error> {
        self.release_conn(db, conn, true)
    }

    fn release_conn(
        self: &Rc<Self>,
        db: &str,
        conn: C::Conn,
        discard: bool,
    ) -> ConnResult<(), C::Error> {
        let block = self
            .inner
            .blocks
            .borrow()
            .get(db)
            .cloned()
            .ok_or(ConnError::UnknownDb)?;
        {
            let mut conns = block.conns.borrow_mut();
            let state = conns.get_mut(&conn).ok_or(ConnError::UnknownConn)?;
            if !state.in_use {
                return Err(ConnError::NotAcquired);
            }
            block
                .querytime_avg
                .borrow_mut()
                .add(state.in_use_since.elapsed().as_secs_f64());
            state.in_use = false;
        }
        block.dec_acquired_counter();
        trace!("release {db}: {conn:?}");

        self.maybe_schedule_tick();

        if self.should_free_conn(&block) {
            if let Some((label, to_block)) = self.find_most_starving_block() {
                if !Rc::ptr_eq(&to_block, &block) {
                    self.inner.schedule_transfer(&block, conn, &to_block);
                    self.inner.log_to_snapshot(&to_block.dbname, label, 1);
                    return Ok(());
                }
            }
        }
        if discard {
            // A concurrent acquire may already be waiting to reuse this
            // connection, so replace the discarded one right away.
            self.inner.schedule_discard(&block, conn);
            self.inner.schedule_new_conn(&block, ConnEvent::Established);
        } else {
            self.release_unused(&block, conn);
        }
        Ok(())
    }

    fn release_unused(self: &Rc<Self>, block: &Rc<Block<C>>, conn: C::Conn) {
        block.release(conn);

        // Only connections released unused create work for the GC.
        self.gc_requests.set(self.gc_requests.get() + 1);
        if self.gc_requests.get() == 1 {
            self.schedule_gc();
        }
    }

    fn maybe_schedule_tick(self: &Rc<Self>) {
        if self.first_tick.replace(false) {
            self.inner.capture_snapshot();
        }

        // Ticks only run while acquisitions are outstanding (Mode C/D), one
        // at a time.
        if self.nacquires.get() == 0 || self.tick_scheduled.get() {
            return;
        }
        self.tick_scheduled.set(true);
        let delay = self.inner.conn_time_threshold();
        let pool = self.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            pool.tick();
        });
    }

    /// The calibration tick: publish the stats snapshot, recompute per-block
    /// quotas from observed demand, and rebalance or rotate depending on the
    /// operating mode.
    fn tick(self: &Rc<Self>) {
        self.tick_scheduled.set(false);
        if self.inner.closing.get() {
            return;
        }
        if self.nacquires.get() > 0 {
            self.maybe_schedule_tick();
        }

        let now = Instant::now();
        self.inner.report_snapshot();
        self.inner.capture_snapshot();

        {
            // Mode A: a single database gets the whole budget; no
            // calibration needed.
            let blocks = self.inner.blocks.borrow();
            if blocks.len() <= 1 {
                self.inner.is_starving.set(false);
                if let Some(block) = blocks.values().next() {
                    block.quota.set(self.inner.max_capacity);
                    let nwaiters = block.count_waiters();
                    block.nwaiters_avg.borrow_mut().add(nwaiters as f64);
                }
                return;
            }
        }

        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        let mut need_conns_at_least = 0usize;
        let mut total_nwaiters = 0usize;
        let mut total_demand = 0.0f64;
        let mut min_demand = f64::INFINITY;
        let mut to_drop = Vec::new();
        for block in &blocks {
            let nwaiters = block.count_waiters() + block.acquired_count.get();
            block.quota.set(nwaiters); // usually overwritten below
            total_nwaiters += nwaiters;
            block.nwaiters_avg.borrow_mut().add(nwaiters as f64);
            let nwaiters_avg = block.nwaiters_avg.borrow().avg();
            if nwaiters_avg > 0.0 && !block.suppressed.get() {
                // Counter of blocks that need at least one connection; once
                // it reaches the max capacity, some block will be starving
                // with zero connections.
                need_conns_at_least += 1;
            } else if block.count_conns() == 0 {
                to_drop.push(block.clone());
                continue;
            }

            let demand = nwaiters_avg.max(nwaiters as f64)
                * block
                    .querytime_avg
                    .borrow()
                    .avg()
                    .max(config::MIN_QUERY_TIME_THRESHOLD.as_secs_f64());
            total_demand += demand;
            block.demand.set(demand);
            min_demand = min_demand.min(demand);
        }

        let was_starving = self.inner.is_starving.get();
        let starving = need_conns_at_least >= self.inner.max_capacity;
        self.inner.is_starving.set(starving);
        for block in &to_drop {
            self.inner.drop_block(block);
        }

        if total_nwaiters == 0 {
            // Nothing is being acquired; leave the pool alone.
            return;
        }

        if total_nwaiters < self.inner.max_capacity {
            if self.inner.cur_capacity.get() >= self.inner.max_capacity {
                // Still Mode C: the waiter total does not include unused
                // connections sitting in stacks, so a rebalance is needed to
                // shrink those blocks in favor of the ones blocked on their
                // quota (already set from the waiter count above).
                self.maybe_rebalance();
            }
            // Under capacity (Mode B), the blocks race for the spare budget
            // organically and the GC shrinks whatever turns out unneeded.
            return;
        }

        trace!("tick: nwaiters={total_nwaiters} demand={total_demand:.6} starving={starving}");
        if starving {
            self.tick_starving(now, was_starving);
        } else {
            self.tick_saturated(total_demand, min_demand);
        }
    }

    /// Mode D: more demanding databases than slots. Every block gets a quota
    /// of one or zero, and blocks giving up their slot rotate to the end of
    /// the round-robin order so later scans favor fresh candidates.
    fn tick_starving(self: &Rc<Self>, now: Instant, was_starving: bool) {
        let keep_threshold = self.inner.conn_time_threshold();
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        for block in &blocks {
            let nconns = block.count_conns();
            if nconns == 1 {
                if now.duration_since(block.last_connect_ts.get()) < keep_threshold {
                    // Reconnecting is expensive; a block that only just got
                    // its connection keeps it for now.
                    block.quota.set(1);
                } else {
                    block.quota.set(0);
                    self.inner.move_to_end(&block.dbname);
                }
            } else if nconns > 1 {
                block.quota.set(0);
                self.inner.move_to_end(&block.dbname);
            } else {
                block.quota.set(1);
                self.inner.move_to_end(&block.dbname);
            }

            if block.quota.get() > 0 {
                self.inner
                    .log_to_snapshot(&block.dbname, PoolEvent::SetQuota, block.quota.get());
            } else {
                self.inner
                    .log_to_snapshot(&block.dbname, PoolEvent::ResetQuota, 0);
            }
        }

        if !was_starving && !self.new_blocks_waitlist.borrow().is_empty() {
            // Mode D normally relies on release() to route connections
            // onward. Right when entering it, every acquired connection may
            // already have been returned to its stack before the starving
            // flag was set, leaving freshly created blocks waiting forever.
            // Steal from the idle blocks and feed the starving ones,
            // stopping as soon as no starving target is left.
            let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
            for block in &blocks {
                while self.should_free_conn(block) {
                    let Some(conn) = block.try_steal(None) else { break };
                    let target = self
                        .find_most_starving_block()
                        .filter(|(_, to_block)| !Rc::ptr_eq(to_block, block));
                    match target {
                        Some((label, to_block)) => {
                            self.inner.schedule_transfer(block, conn, &to_block);
                            self.inner.log_to_snapshot(&to_block.dbname, label, 1);
                        }
                        None => {
                            // Put the last stolen connection back; nothing
                            // needs it anymore.
                            self.release_unused(block, conn);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Mode C: saturated. Distribute the whole budget as per-block quotas
    /// proportional to calibrated demand, then rebalance toward them.
    fn tick_saturated(self: &Rc<Self>, total_demand: f64, min_demand: f64) {
        let max_capacity = self.inner.max_capacity;
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        let mut entries: Vec<(Rc<Block<C>>, bool)> =
            blocks.iter().map(|block| (block.clone(), false)).collect();
        let mut capacity_left = max_capacity;
        let mut demand_left = total_demand;

        if min_demand / total_demand * (max_capacity as f64) < 1.0 {
            for (block, pinned) in &mut entries {
                let demand = block.demand.get();
                if demand == 0.0 {
                    block.quota.set(0);
                    self.inner
                        .log_to_snapshot(&block.dbname, PoolEvent::ResetQuota, 0);
                    continue;
                }
                let share = max_capacity as f64 * demand / total_demand;
                if share <= 1.0 {
                    // A share this small would round away entirely; reserve
                    // a single slot for the block instead.
                    block.quota.set(1);
                    self.inner
                        .log_to_snapshot(&block.dbname, PoolEvent::SetQuota, 1);
                    capacity_left -= 1;
                    demand_left -= demand;
                    *pinned = true;
                }
            }
        }
        debug_assert!(capacity_left > 0);

        // Distribute the remaining slots with a floating accumulator: the
        // rounding error stays bounded and the quotas sum to exactly the
        // remaining capacity.
        let mut acc = 0.0f64;
        for (block, pinned) in &entries {
            let demand = block.demand.get();
            if *pinned || demand == 0.0 {
                continue;
            }
            let prev = acc;
            acc += capacity_left as f64 * demand / demand_left;
            block
                .quota
                .set((acc.round_ties_even() - prev.round_ties_even()) as usize);
            self.inner
                .log_to_snapshot(&block.dbname, PoolEvent::SetQuota, block.quota.get());
        }

        self.maybe_rebalance();
    }

    /// Shrink blocks over quota, transferring or discarding their least
    /// recently used connections, and grow blocks under quota while spare
    /// capacity remains. Whatever stays over quota is published for
    /// opportunistic stealing by concurrent acquires.
    fn maybe_rebalance(self: &Rc<Self>) {
        if self.inner.is_starving.get() {
            return;
        }

        self.blocks_over_quota.borrow_mut().clear();
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        for block in &blocks {
            let nconns = block.count_conns();
            let quota = block.quota.get();
            if nconns > quota {
                self.try_shrink_block(block);
                if block.count_conns() > quota {
                    self.blocks_over_quota.borrow_mut().push(block.clone());
                }
            } else if nconns < quota {
                while block.count_conns() < quota
                    && self.inner.cur_capacity.get() < self.inner.max_capacity
                {
                    self.inner.schedule_new_conn(block, ConnEvent::Established);
                }
            }
        }

        self.blocks_over_quota
            .borrow_mut()
            .sort_by_key(|block| std::cmp::Reverse(block.count_conns_over_quota()));
    }

    fn try_shrink_block(self: &Rc<Self>, block: &Rc<Block<C>>) {
        while block.count_conns_over_quota() > 0 && self.should_free_conn(block) {
            let Some(conn) = block.try_steal(None) else { break };
            match self.find_most_starving_block() {
                Some((_, to_block)) => self.inner.schedule_transfer(block, conn, &to_block),
                None => self.inner.schedule_discard(block, conn),
            }
        }
    }

    /// Steal an idle connection for `for_block` from the over-quota blocks
    /// published by the last rebalance.
    fn try_steal_conn(self: &Rc<Self>, for_block: &Rc<Block<C>>) -> bool {
        let over_quota = self.blocks_over_quota.borrow();
        for block in over_quota.iter() {
            if Rc::ptr_eq(block, for_block) || !self.should_free_conn(block) {
                continue;
            }
            if let Some(conn) = block.try_steal(None) {
                self.inner
                    .log_to_snapshot(&block.dbname, PoolEvent::ConnStolen, 0);
                self.inner.schedule_transfer(block, conn, for_block);
                return true;
            }
        }
        false
    }

    /// Whether `block` can afford to give up one of its idle connections.
    fn should_free_conn(&self, block: &Rc<Block<C>>) -> bool {
        // A single block has nothing to rebalance against.
        if self.inner.blocks.borrow().len() <= 1 {
            return false;
        }

        let nconns = block.count_conns();
        let starving = self.inner.is_starving.get();

        if !starving && nconns <= block.quota.get() {
            return false;
        }

        // A starving block holding a single, very recent connection with
        // waiters queued keeps it: freeing it would just trade one reconnect
        // for another.
        if starving
            && nconns == 1
            && block.count_waiters() > 0
            && block.last_connect_ts.get().elapsed() < self.inner.conn_time_threshold()
        {
            return false;
        }

        true
    }

    /// Pick the destination for a freed connection, in strict priority
    /// order: blocks awaiting their very first connection, then blocks left
    /// with zero connections, then the block furthest under its quota.
    fn find_most_starving_block(&self) -> Option<(PoolEvent, Rc<Block<C>>)> {
        loop {
            let name = self.new_blocks_waitlist.borrow_mut().shift_remove_index(0);
            let Some(name) = name else { break };
            let Some(block) = self.inner.blocks.borrow().get(&name).cloned() else {
                continue;
            };
            if block.count_conns() > 0 {
                // Registered blocks stay empty until their first transfer
                // lands; anything else is a bookkeeping bug.
                debug_assert!(false, "waitlisted block {name} already has connections");
                warn!("Dropping {name} from the first-connection waitlist: it already has connections");
                continue;
            }
            if block.count_waiters() == 0 {
                // All of its waiters went away (cancelled); nothing to feed.
                continue;
            }
            return Some((PoolEvent::FirstConn, block));
        }

        let blocks = self.inner.blocks.borrow();

        // Blocks with demand but not a single connection left; the one with
        // the most waiters wins.
        let mut max_need = 0;
        let mut to_block = None;
        for block in blocks.values() {
            if block.count_conns() > 0 || block.suppressed.get() {
                continue;
            }
            let need = block.count_waiters();
            if need > max_need {
                max_need = need;
                to_block = Some(block.clone());
            }
        }
        if let Some(block) = to_block {
            return Some((PoolEvent::ReviveConn, block));
        }

        // Finally, award the block that is furthest under its quota.
        let mut max_need = 0;
        let mut to_block = None;
        for block in blocks.values() {
            if block.suppressed.get() {
                continue;
            }
            let need = block.quota.get().saturating_sub(block.count_conns());
            if need > max_need {
                max_need = need;
                to_block = Some(block.clone());
            }
        }
        to_block.map(|block| (PoolEvent::RedistConn, block))
    }

    fn schedule_gc(self: &Rc<Self>) {
        let pool = self.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(pool.gc_interval).await;
            pool.run_gc();
        });
    }

    /// Reclaim connections that have sat idle for at least one GC interval.
    /// Runs at most once per interval; requests within a window coalesce
    /// into one run.
    fn run_gc(self: &Rc<Self>) {
        if self.inner.closing.get() {
            return;
        }
        if self.inner.is_starving.get() {
            // Every slot is needed right now; try again later.
            self.schedule_gc();
            return;
        }

        if self.gc_requests.get() > 1 {
            // More requests arrived during this window; keep one run queued.
            self.gc_requests.set(1);
            self.schedule_gc();
        } else {
            self.gc_requests.set(0);
        }

        // Unused connections stay in the pool for at least one full
        // interval, so they are reclaimed within one to two intervals.
        let Some(only_older_than) = Instant::now().checked_sub(self.gc_interval) else {
            return;
        };
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        for block in blocks {
            while let Some(conn) = block.try_steal(Some(only_older_than)) {
                self.inner.schedule_discard(&block, conn);
            }
        }
    }

    /// Close all idle connections to `db` and refuse inbound transfers until
    /// the next acquire. In-flight connects are awaited and drained as they
    /// land. The block itself survives, so waiters can resurrect it.
    pub async fn prune_inactive(self: &Rc<Self>, db: &str) {
        let block = self.inner.blocks.borrow().get(db).cloned();
        let Some(block) = block else { return };

        block.suppressed.set(true);

        let mut conns = Vec::new();
        while let Some(conn) = block.try_steal(None) {
            conns.push(conn);
        }
        while block.count_waiters() == 0 && block.count_pending_conns() > 0 {
            // try_acquire: the incoming connection can still be stolen from
            // under us.
            match block.try_acquire(1).await {
                Ok(Some(conn)) => conns.push(conn),
                Ok(None) => {}
                Err(_) => break,
            }
        }

        let inner = &self.inner;
        futures::future::join_all(conns.into_iter().map(|conn| inner.discard(&block, conn))).await;
    }

    /// Hard-kill every connection across every block (HA failover). Pending
    /// connects are not awaited; they fail to attach on completion and are
    /// replaced under the new epoch while their block still has waiters.
    pub async fn prune_all(self: &Rc<Self>) {
        self.inner.prune_all().await;
    }

    /// Close the pool: fail all outstanding and future acquires with
    /// [`ConnError::Shutdown`], stop the background callbacks, and tear
    /// down every connection.
    pub async fn close(self: &Rc<Self>) {
        self.inner.closing.set(true);
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        for block in &blocks {
            block.abort_waiters(ConnError::Shutdown);
        }
        self.inner.prune_all().await;
    }

    /// The connection handles currently owned by the pool, for inspection
    /// only.
    pub fn iter_connections(&self) -> impl Iterator<Item = C::Conn> {
        self.inner
            .blocks
            .borrow()
            .values()
            .flat_map(|block| block.conns.borrow().keys().cloned().collect_vec())
            .collect_vec()
            .into_iter()
    }

    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity
    }

    pub fn current_capacity(&self) -> usize {
        self.inner.cur_capacity.get()
    }

    /// Established connections: the current capacity minus connects still in
    /// flight.
    pub fn active_conns(&self) -> usize {
        self.inner.cur_capacity.get() - self.inner.count_pending_conns()
    }

    pub fn failed_connects(&self) -> usize {
        self.inner.failed_connects.get()
    }

    pub fn failed_disconnects(&self) -> usize {
        self.inner.failed_disconnects.get()
    }

    pub fn successful_connects(&self) -> usize {
        self.inner.successful_connects.get()
    }

    pub fn successful_disconnects(&self) -> usize {
        self.inner.successful_disconnects.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{spawn_workload, BasicConnector, RecordingStats, TestError};
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use test_log::test;
    use tokio::task::LocalSet;
    use tokio::time::timeout;

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_pool_basic() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            let pool = Pool::new(PoolConfig::suggested_default_for(10), connector.clone());

            let conn1 = pool.acquire("1").await?;
            let conn2 = pool.acquire("1").await?;
            assert_ne!(conn1, conn2);

            pool.release("1", conn1)?;
            pool.release_discard("1", conn2)?;
            tokio::time::sleep(Duration::from_millis(10)).await;

            // The discarded connection was replaced with a fresh one.
            assert_eq!(pool.current_capacity(), 2);
            assert_eq!(pool.successful_connects(), 3);
            assert_eq!(pool.failed_connects(), 0);

            pool.close().await;
            assert_eq!(pool.current_capacity(), 0);
            assert_eq!(connector.live(), 0);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_release_misuse() -> Result<()> {
        let future = async {
            let pool = Pool::new(PoolConfig::suggested_default_for(4), BasicConnector::no_delay());

            assert_eq!(pool.release("missing", 1), Err(ConnError::UnknownDb));

            let conn = pool.acquire("1").await?;
            assert_eq!(pool.release("1", 999), Err(ConnError::UnknownConn));

            pool.release("1", conn)?;
            assert_eq!(pool.release("1", conn), Err(ConnError::NotAcquired));
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    #[rstest]
    #[case::single_slot(1)]
    #[case::bounded(6)]
    async fn test_single_db_bounded_capacity(#[case] capacity: usize) -> Result<()> {
        let future = async move {
            let connector = BasicConnector::no_delay();
            let pool = Pool::new(
                PoolConfig::suggested_default_for(capacity),
                connector.clone(),
            );

            let completed = Rc::new(Cell::new(0usize));
            let mut handles = Vec::new();
            for _ in 0..50 {
                let pool = pool.clone();
                let completed = completed.clone();
                handles.push(tokio::task::spawn_local(async move {
                    let conn = pool.acquire("db").await.unwrap();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    pool.release("db", conn).unwrap();
                    completed.set(completed.get() + 1);
                }));
            }
            for handle in handles {
                handle.await?;
            }

            assert_eq!(completed.get(), 50);
            assert!(connector.max_live() <= capacity);
            assert!(pool.current_capacity() <= capacity);
            assert_eq!(pool.failed_connects(), 0);
            assert_eq!(pool.failed_disconnects(), 0);
            Ok(())
        };
        timeout(Duration::from_secs(120), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_acquire_release_steady_state() -> Result<()> {
        let future = async {
            let pool = Pool::new(PoolConfig::suggested_default_for(5), BasicConnector::no_delay());

            // Warm up until the spare-connection policy settles.
            for _ in 0..3 {
                let conn = pool.acquire("1").await?;
                pool.release("1", conn)?;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;

            let capacity = pool.current_capacity();
            let conn = pool.acquire("1").await?;
            pool.release("1", conn)?;
            tokio::time::sleep(Duration::from_millis(10)).await;

            assert_eq!(pool.current_capacity(), capacity);
            assert_eq!(pool.active_conns(), capacity);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_fair_split_when_saturated() -> Result<()> {
        let future = async {
            let connector = BasicConnector::with_delay(Duration::from_millis(10));
            let stats = Rc::new(RecordingStats::default());
            let pool = Pool::with_stats(
                PoolConfig::suggested_default_for(6),
                connector.clone(),
                stats.clone(),
            );

            // "a" runs cheap queries, "b" expensive ones; under saturation
            // the calibrated demand should award "b" most of the budget.
            let (completed_a, mut handles) = spawn_workload(
                &pool,
                "a",
                10,
                Duration::from_millis(1),
                Duration::from_secs(2),
            );
            let (completed_b, more) = spawn_workload(
                &pool,
                "b",
                10,
                Duration::from_millis(30),
                Duration::from_secs(2),
            );
            handles.extend(more);
            for handle in handles {
                handle.await?;
            }

            assert!(completed_a.get() > 10);
            assert!(completed_b.get() > 10);
            assert!(connector.max_live() <= 6);

            let snapshots = stats.snapshots();
            let snapshot = snapshots
                .iter()
                .rev()
                .find(|snapshot| {
                    snapshot.blocks.len() == 2
                        && snapshot
                            .blocks
                            .iter()
                            .all(|block| block.nwaiters > 0 && block.quota > 0)
                })
                .expect("no saturated snapshot captured");
            let a = &snapshot.blocks[0];
            let b = &snapshot.blocks[1];
            assert_eq!(a.dbname, "a");
            assert_eq!(b.dbname, "b");
            assert!(
                b.quota > a.quota,
                "expected the expensive database to win the larger quota: {snapshot:?}"
            );
            let total: usize = snapshot.blocks.iter().map(|block| block.quota).sum();
            assert!((5..=7).contains(&total), "quota sum off: {snapshot:?}");
            Ok(())
        };
        timeout(Duration::from_secs(120), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_starving_round_robin() -> Result<()> {
        let future = async {
            let connector = BasicConnector::with_delay(Duration::from_millis(10));
            let pool = Pool::new(PoolConfig::suggested_default_for(6), connector.clone());

            // Twice as many databases as slots; every one of them must still
            // get service.
            let mut handles = Vec::new();
            let mut counters = Vec::new();
            for i in 0..12 {
                let (completed, workers) = spawn_workload(
                    &pool,
                    &format!("db{i}"),
                    2,
                    Duration::from_millis(5),
                    Duration::from_secs(2),
                );
                counters.push(completed);
                handles.extend(workers);
            }
            for handle in handles {
                handle.await?;
            }

            for (i, counter) in counters.iter().enumerate() {
                assert!(counter.get() > 0, "database db{i} was starved");
            }
            assert!(connector.max_live() <= 6);
            Ok(())
        };
        timeout(Duration::from_secs(120), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_permanent_failure_skips_retries() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            connector.mark_invalid_catalog("bad");
            let pool = Pool::new(PoolConfig::suggested_default_for(6), connector.clone());

            let good_task = {
                let pool = pool.clone();
                tokio::task::spawn_local(async move { pool.acquire("good").await })
            };

            let result = pool.acquire("bad").await;
            assert_eq!(
                result,
                Err(ConnError::Underlying(TestError::invalid_catalog("bad")))
            );
            // No retries for a permanently failing database.
            assert_eq!(connector.connect_attempts("bad"), 1);
            assert_eq!(pool.failed_connects(), 1);

            let conn = good_task.await??;
            pool.release("good", conn)?;
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_transient_failures_retry() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            connector.fail_next_connects("1", 2);
            let pool = Pool::new(PoolConfig::suggested_default_for(4), connector.clone());

            let conn = pool.acquire("1").await?;
            pool.release("1", conn)?;
            assert_eq!(connector.connect_attempts("1"), 3);
            assert_eq!(pool.failed_connects(), 2);
            assert_eq!(pool.successful_connects(), 1);

            // Enough consecutive failures exhaust the retries and surface
            // the last error to the waiters.
            connector.fail_next_connects("2", 10);
            let result = pool.acquire("2").await;
            assert_eq!(
                result,
                Err(ConnError::Underlying(TestError::new("connection refused")))
            );
            assert_eq!(
                connector.connect_attempts("2"),
                config::MAX_CONNECT_RETRIES + 1
            );
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_gc_reclaims_idle() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            let config = PoolConfig::suggested_default_for(10)
                .with_min_idle_time_for_gc(Duration::from_secs(1));
            let pool = Pool::new(config, connector.clone());

            let mut conns = Vec::new();
            for _ in 0..8 {
                conns.push(pool.acquire("1").await?);
            }
            assert_eq!(pool.current_capacity(), 8);
            for conn in conns {
                pool.release("1", conn)?;
            }

            // Nothing is reclaimed before the idle threshold...
            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(pool.current_capacity(), 8);

            // ...and everything is shortly after it.
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert_eq!(pool.current_capacity(), 0);
            assert_eq!(connector.live(), 0);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_cancellation_leaks_nothing() -> Result<()> {
        let future = async {
            let connector = BasicConnector::with_delay(Duration::from_millis(10));
            let pool = Pool::new(PoolConfig::suggested_default_for(1), connector.clone());

            let mut handles = Vec::new();
            for _ in 0..100 {
                let pool = pool.clone();
                handles.push(tokio::task::spawn_local(async move {
                    pool.acquire("1").await
                }));
            }
            // Everyone is queued and the single connect is still in flight.
            tokio::time::sleep(Duration::from_millis(1)).await;

            let survivor = handles.remove(0);
            for handle in handles {
                handle.abort();
            }

            let conn = survivor.await??;
            assert_eq!(pool.current_capacity(), 1);
            pool.release("1", conn)?;

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(pool.current_capacity(), 1);
            assert_eq!(connector.live(), 1);
            assert_eq!(pool.iter_connections().count(), 1);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_prune_inactive() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            let pool = Pool::new(PoolConfig::suggested_default_for(10), connector.clone());

            for _ in 0..3 {
                let conn = pool.acquire("1").await?;
                pool.release("1", conn)?;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(pool.current_capacity() >= 2);

            pool.prune_inactive("1").await;
            assert_eq!(pool.current_capacity(), 0);
            assert_eq!(connector.live(), 0);

            // The block survives and can serve again.
            let conn = pool.acquire("1").await?;
            pool.release("1", conn)?;
            assert!(pool.current_capacity() >= 1);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_prune_all_with_pending_connect() -> Result<()> {
        let future = async {
            let connector = BasicConnector::with_delay(Duration::from_millis(10));
            let pool = Pool::new(PoolConfig::suggested_default_for(4), connector.clone());

            let held = pool.acquire("a").await?;
            let waiter = {
                let pool = pool.clone();
                tokio::task::spawn_local(async move { pool.acquire("b").await })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;

            pool.prune_all().await;

            // The held connection is gone from the books.
            assert_eq!(pool.release("a", held), Err(ConnError::UnknownConn));

            // The pending connect fails to attach under the new epoch, is
            // replaced, and the waiter is still served.
            let conn = waiter.await??;
            pool.release("b", conn)?;

            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(connector.live(), pool.current_capacity());
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_close_aborts_waiters() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            let pool = Pool::new(PoolConfig::suggested_default_for(1), connector.clone());

            let held = pool.acquire("a").await?;
            let waiter = {
                let pool = pool.clone();
                tokio::task::spawn_local(async move { pool.acquire("b").await })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;

            pool.close().await;

            assert_eq!(waiter.await?, Err(ConnError::Shutdown));
            assert_eq!(pool.acquire("c").await, Err(ConnError::Shutdown));
            assert_eq!(pool.release("a", held), Err(ConnError::UnknownConn));
            assert_eq!(pool.current_capacity(), 0);
            assert_eq!(connector.live(), 0);
            Ok(())
        };
        timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }
}
