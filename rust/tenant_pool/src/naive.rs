use std::cell::Cell;
use std::rc::Rc;

use itertools::Itertools;

use crate::block::Block;
use crate::config;
use crate::conn::{ConnError, ConnEvent, ConnResult, Connector};
use crate::pool::{PoolConfig, PoolInner};
use crate::snapshot::{PoolEvent, StatsCollector};
use crate::time::Instant;

/// A deliberately simple pool sharing the connector contract and snapshot
/// plumbing of [`Pool`](crate::Pool), kept for comparative simulation:
/// unconditional connects while the budget lasts, steal-on-empty, and a
/// waiter-count handoff on release. No quotas, no calibration, no GC. It
/// honors the capacity budget but makes no fairness promises.
#[derive(derive_more::Debug)]
pub struct NaivePool<C: Connector> {
    inner: Rc<PoolInner<C>>,
    last_tick: Cell<Option<Instant>>,
}

impl<C: Connector> NaivePool<C> {
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
            last_tick: Cell::new(None),
        })
    }

    fn maybe_tick(&self) {
        let now = Instant::now();
        match self.last_tick.get() {
            None => {
                // First call; open the first snapshot window.
                self.inner.capture_snapshot();
                self.last_tick.set(Some(now));
            }
            Some(last) if now.duration_since(last) < config::STATS_COLLECT_INTERVAL => {}
            _ => {
                self.last_tick.set(Some(now));
                self.inner.report_snapshot();
                self.inner.capture_snapshot();
            }
        }
    }

    /// Simplified connection stealing: take any idle connection outright,
    /// or wait in some busy block's queue for one.
    async fn steal_conn(&self, for_block: &Rc<Block<C>>) -> ConnResult<(), C::Error> {
        let blocks = self.inner.blocks.borrow().values().cloned().collect_vec();
        for block in &blocks {
            if Rc::ptr_eq(block, for_block) {
                continue;
            }
            if let Some(conn) = block.try_steal(None) {
                self.inner
                    .log_to_snapshot(&block.dbname, PoolEvent::ConnStolen, 0);
                self.inner.schedule_transfer(block, conn, for_block);
                self.inner.move_to_end(&block.dbname);
                return Ok(());
            }
        }
        for block in &blocks {
            if Rc::ptr_eq(block, for_block) || block.count_conns() == 0 {
                continue;
            }
            let conn = block.acquire().await?;
            self.inner
                .log_to_snapshot(&block.dbname, PoolEvent::ConnStolen, 0);
            self.inner.schedule_transfer(block, conn, for_block);
            self.inner.move_to_end(&block.dbname);
            return Ok(());
        }
        Ok(())
    }

    pub async fn acquire(self: &Rc<Self>, db: &str) -> ConnResult<C::Conn, C::Error> {
        if self.inner.closing.get() {
            return Err(ConnError::Shutdown);
        }
        self.maybe_tick();

        let block = self.inner.get_block(db);

        if self.inner.cur_capacity.get() < self.inner.max_capacity {
            self.inner.schedule_new_conn(&block, ConnEvent::Established);
        } else if block.count_conns() == 0 {
            // A new block at the capacity limit cannot rely on the handoff
            // in release(): it would hang if no other block ever releases.
            self.steal_conn(&block).await?;
        }

        block.acquire().await
    }

    /// Hand a connection back, or directly onward to the block that needs
    /// it the most, favoring blocks with no connections at all.
    pub fn release(self: &Rc<Self>, db: &str, conn: C::Conn) {
        self.maybe_tick();
        let this_block = self.inner.get_block(db);

        if this_block.count_conns() < this_block.count_waiters() {
            this_block.release(conn);
            return;
        }

        let mut max_need = 0usize;
        let mut to_block = None;
        for block in self.inner.blocks.borrow().values() {
            let size = block.count_conns();
            let demand = block.count_waiters();
            let need = if size == 0 && demand > 0 {
                demand * 1000
            } else if size < demand {
                demand - size
            } else {
                continue;
            };
            if need > max_need {
                max_need = need;
                to_block = Some(block.clone());
            }
        }

        match to_block {
            Some(to_block) if !Rc::ptr_eq(&to_block, &this_block) => {
                self.inner.schedule_transfer(&this_block, conn, &to_block);
                self.inner
                    .log_to_snapshot(&to_block.dbname, PoolEvent::Free, 1);
            }
            _ => this_block.release(conn),
        }
    }

    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity
    }

    pub fn current_capacity(&self) -> usize {
        self.inner.cur_capacity.get()
    }

    pub fn active_conns(&self) -> usize {
        self.inner.cur_capacity.get() - self.inner.count_pending_conns()
    }

    pub fn failed_connects(&self) -> usize {
        self.inner.failed_connects.get()
    }

    pub fn failed_disconnects(&self) -> usize {
        self.inner.failed_disconnects.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::BasicConnector;
    use anyhow::Result;
    use std::time::Duration;
    use test_log::test;
    use tokio::task::LocalSet;

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_naive_basic() -> Result<()> {
        LocalSet::new()
            .run_until(async {
                let connector = BasicConnector::no_delay();
                let pool = NaivePool::new(PoolConfig::suggested_default_for(4), connector.clone());

                for db in ["a", "b", "a", "c"] {
                    let conn = pool.acquire(db).await?;
                    pool.release(db, conn);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;

                assert!(pool.current_capacity() <= 4);
                assert_eq!(pool.failed_connects(), 0);
                assert!(connector.max_live() <= 4);
                Ok(())
            })
            .await
    }

    #[test(tokio::test(flavor = "current_thread", start_paused = true))]
    async fn test_naive_steals_for_new_block_when_saturated() -> Result<()> {
        let future = async {
            let connector = BasicConnector::no_delay();
            let pool = NaivePool::new(PoolConfig::suggested_default_for(1), connector.clone());

            let conn_a = pool.acquire("a").await?;

            let served = {
                let pool = pool.clone();
                tokio::task::spawn_local(async move {
                    let conn = pool.acquire("b").await.unwrap();
                    pool.release("b", conn);
                })
            };
            tokio::time::sleep(Duration::from_millis(1)).await;

            // The only connection comes back and must end up serving "b".
            pool.release("a", conn_a);
            served.await?;

            assert_eq!(pool.current_capacity(), 1);
            assert_eq!(connector.live(), 1);
            Ok(())
        };
        tokio::time::timeout(Duration::from_secs(60), LocalSet::new().run_until(future)).await?
    }
}
