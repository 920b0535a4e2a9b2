//! Concurrency primitives the control plane is built on
//!
//! Two pieces live here: [`FairMutex`], the single exclusivity lock that
//! serializes evict/launch phases across switch attempts, and
//! [`BoundedQueue`], the drop-on-overflow queue backing event bus
//! subscribers. Both are intentionally small wrappers over `tokio::sync`
//! building blocks so their ordering guarantees are easy to audit.

use crate::errors::QueueError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// An exclusive async lock with strict FIFO handover.
///
/// Unlike `tokio::sync::Mutex`, waiters are woken in arrival order and the
/// lock is handed directly to the next waiter on release, so no caller can
/// barge in ahead of an earlier one. The permit is owned (not borrowed) so
/// it can cross task boundaries.
#[derive(Debug, Clone)]
pub struct FairMutex {
    inner: Arc<LockInner>,
}

#[derive(Debug)]
struct LockInner {
    state: Mutex<LockState>,
}

#[derive(Debug)]
struct LockState {
    held: bool,
    waiters: VecDeque<Waiter>,
    next_id: u64,
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

/// Release capability returned by [`FairMutex::acquire`]. Dropping it wakes
/// exactly one waiter, or clears the held flag if none remain.
#[derive(Debug)]
pub struct Permit {
    inner: Arc<LockInner>,
}

impl Default for FairMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl FairMutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockInner {
                state: Mutex::new(LockState {
                    held: false,
                    waiters: VecDeque::new(),
                    next_id: 0,
                }),
            }),
        }
    }

    /// Acquire the lock, queueing behind earlier callers.
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.inner.state.lock().expect("lock state poisoned");
                if !state.held {
                    state.held = true;
                    return Permit {
                        inner: Arc::clone(&self.inner),
                    };
                }
                let (tx, rx) = oneshot::channel();
                let id = state.next_id;
                state.next_id += 1;
                state.waiters.push_back(Waiter { id, tx });
                rx
            };

            if rx.await.is_ok() {
                // The releaser handed the lock over without clearing `held`.
                return Permit {
                    inner: Arc::clone(&self.inner),
                };
            }
            // Sender dropped without a handover; re-queue.
        }
    }

    /// Acquire with a deadline.
    ///
    /// Returns `None` if `timeout` elapses first. A timed-out caller is
    /// removed from the waiter queue; if the race is lost *after* the lock
    /// was already handed over, the permit is returned instead of being
    /// leaked.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Option<Permit> {
        let (id, mut rx) = {
            let mut state = self.inner.state.lock().expect("lock state poisoned");
            if !state.held {
                state.held = true;
                return Some(Permit {
                    inner: Arc::clone(&self.inner),
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_id;
            state.next_id += 1;
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        tokio::select! {
            biased;
            res = &mut rx => {
                if res.is_ok() {
                    Some(Permit { inner: Arc::clone(&self.inner) })
                } else {
                    None
                }
            }
            _ = tokio::time::sleep(timeout) => {
                let mut state = self.inner.state.lock().expect("lock state poisoned");
                let queued = state.waiters.iter().position(|w| w.id == id);
                match queued {
                    Some(pos) => {
                        // We abandoned the attempt before the handover.
                        state.waiters.remove(pos);
                        None
                    }
                    None => {
                        // Release popped us while the timer fired: the
                        // handover happened under the state lock, so the
                        // permit is already in the channel.
                        drop(state);
                        match rx.try_recv() {
                            Ok(()) => Some(Permit { inner: Arc::clone(&self.inner) }),
                            Err(_) => None,
                        }
                    }
                }
            }
        }
    }

    /// Whether the lock is currently held (snapshot, for diagnostics).
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().expect("lock state poisoned").held
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().expect("lock state poisoned");
        loop {
            match state.waiters.pop_front() {
                Some(waiter) => {
                    // Handover keeps `held` set; send only fails if the
                    // waiter already gave up, in which case try the next.
                    if waiter.tx.send(()).is_ok() {
                        return;
                    }
                }
                None => {
                    state.held = false;
                    return;
                }
            }
        }
    }
}

/// Outcome of a non-blocking [`BoundedQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Handed directly to a waiting consumer, bypassing the buffer
    Delivered,
    /// Appended to the buffer
    Buffered,
    /// Buffer full or queue closed; the item was dropped
    Rejected,
}

/// A fixed-capacity queue whose producer never blocks.
///
/// `push` either hands the item to a currently-suspended `take` or buffers
/// it; a full buffer rejects the push outright. This is the backpressure
/// primitive behind event bus subscriptions: a slow subscriber rejects, and
/// the publisher drops it.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
}

#[derive(Debug)]
struct QueueState<T> {
    buf: VecDeque<T>,
    takers: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                buf: VecDeque::new(),
                takers: VecDeque::new(),
                closed: false,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue state poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push without blocking.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut state = self.state.lock().expect("queue state poisoned");
        if state.closed {
            return PushOutcome::Rejected;
        }

        let mut item = item;
        while let Some(taker) = state.takers.pop_front() {
            match taker.send(item) {
                Ok(()) => return PushOutcome::Delivered,
                // Taker cancelled its wait; reclaim the item and try the next.
                Err(reclaimed) => item = reclaimed,
            }
        }

        if state.buf.len() < self.capacity {
            state.buf.push_back(item);
            PushOutcome::Buffered
        } else {
            PushOutcome::Rejected
        }
    }

    /// Take the next item, suspending until one arrives.
    ///
    /// Buffered items are returned immediately, even after `close`. An empty
    /// closed queue fails with [`QueueError::Closed`]; a cancelled wait
    /// fails with [`QueueError::Cancelled`].
    pub async fn take(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        let rx = {
            let mut state = self.state.lock().expect("queue state poisoned");
            if let Some(item) = state.buf.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            state.takers.push_back(tx);
            rx
        };

        tokio::select! {
            biased;
            res = rx => res.map_err(|_| QueueError::Closed),
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
        }
    }

    /// Close the queue: every suspended `take` fails, and all future pushes
    /// are rejected. Items already buffered remain drainable.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("queue state poisoned");
        state.closed = true;
        // Dropping the senders fails the corresponding takes.
        state.takers.clear();
    }
}
