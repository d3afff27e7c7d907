use std::cell::RefCell;
use std::collections::VecDeque;

use tokio::sync::oneshot;

use crate::conn::{ConnError, ConnResult};

/// FIFO queue of suspended acquirers. Each waiter is a one-shot channel;
/// a receiver dropped by a cancelled acquirer is skipped when the queue is
/// next woken, so cancellation needs no eager cleanup.
pub(crate) struct WaitQueue<E> {
    waiters: RefCell<VecDeque<oneshot::Sender<ConnResult<(), E>>>>,
}

impl<E> Default for WaitQueue<E> {
    fn default() -> Self {
        Self {
            waiters: RefCell::new(VecDeque::new()),
        }
    }
}

impl<E> WaitQueue<E> {
    /// Register a waiter. A waiter that was already woken once but lost the
    /// race for the connection re-registers at the front so it does not lose
    /// its place in line.
    pub fn subscribe(&self, front: bool) -> oneshot::Receiver<ConnResult<(), E>> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.borrow_mut();
        if front {
            waiters.push_front(tx);
        } else {
            waiters.push_back(tx);
        }
        rx
    }

    /// Wake the first waiter that is still listening.
    pub fn wake_next(&self) {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(waiter) = waiters.pop_front() {
            if waiter.send(Ok(())).is_ok() {
                break;
            }
        }
    }

    /// Fail every queued waiter with a clone of `error`.
    pub fn abort_all(&self, error: ConnError<E>)
    where
        E: Clone,
    {
        let mut waiters = self.waiters.borrow_mut();
        while let Some(waiter) = waiters.pop_front() {
            let _ = waiter.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_skips_dead_waiters() {
        let queue: WaitQueue<String> = WaitQueue::default();
        let dead = queue.subscribe(false);
        let mut live = queue.subscribe(false);
        drop(dead);
        queue.wake_next();
        assert_eq!(live.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_subscribe_front() {
        let queue: WaitQueue<String> = WaitQueue::default();
        let mut second = queue.subscribe(false);
        let mut first = queue.subscribe(true);
        queue.wake_next();
        assert!(first.try_recv().is_ok());
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn test_abort_all() {
        let queue: WaitQueue<String> = WaitQueue::default();
        let mut one = queue.subscribe(false);
        let mut two = queue.subscribe(false);
        queue.abort_all(ConnError::Underlying("boom".to_owned()));
        assert_eq!(
            one.try_recv().unwrap(),
            Err(ConnError::Underlying("boom".to_owned()))
        );
        assert_eq!(
            two.try_recv().unwrap(),
            Err(ConnError::Underlying("boom".to_owned()))
        );
    }
}
