//! Priority-lane fetch scheduling with a global concurrency cap.
//!
//! Operations are admitted into one of two lanes. High-priority work gets
//! the majority of capacity, but a reserved floor of
//! `floor(concurrency * (1 - high_share))` slots guarantees forward
//! progress for low-priority work even under a permanent high-priority
//! backlog. Without that floor, a continuous stream of high-priority
//! requests starves background work indefinitely.
//!
//! The scheduler never retries: an operation's failure propagates to its
//! caller and simply frees the slot.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::config::clamp_share;

/// Priority lane for a scheduled operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Latency-sensitive foreground work.
    High,
    /// Background work (quality upgrades, prefetch).
    Low,
}

/// Two-lane concurrency-limited scheduler.
///
/// Cheap to clone; clones share the same queues and counters.
#[derive(Debug, Clone)]
pub struct PriorityScheduler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    concurrency: usize,
    high_share: f64,
    active_high: usize,
    active_low: usize,
    queue_high: VecDeque<oneshot::Sender<Permit>>,
    queue_low: VecDeque<oneshot::Sender<Permit>>,
}

impl State {
    fn active(&self) -> usize {
        self.active_high + self.active_low
    }

    /// Slots reserved for low-priority work.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn low_reserve(&self) -> usize {
        (self.concurrency as f64 * (1.0 - self.high_share)).floor() as usize
    }

    /// Whether a newly arriving operation may run immediately.
    fn admit_now(&self, priority: Priority) -> bool {
        if self.active() >= self.concurrency {
            return false;
        }
        match priority {
            Priority::High => true,
            // Low-priority work must not crowd out a waiting high-priority
            // backlog beyond its reserved floor.
            Priority::Low => self.queue_high.is_empty() || self.active_low < self.low_reserve(),
        }
    }

    /// Pick the lane to dispatch from when at least one slot is free.
    fn next_lane(&self) -> Option<Priority> {
        match (self.queue_high.is_empty(), self.queue_low.is_empty()) {
            (true, true) => None,
            (false, true) => Some(Priority::High),
            (true, false) => Some(Priority::Low),
            (false, false) => {
                if self.active_low < self.low_reserve() {
                    Some(Priority::Low)
                } else {
                    Some(Priority::High)
                }
            }
        }
    }
}

/// An admitted slot. Dropping it frees the slot and dispatches queued work.
#[derive(Debug)]
struct Permit {
    inner: Arc<Inner>,
    priority: Priority,
}

impl Drop for Permit {
    fn drop(&mut self) {
        Inner::release(&self.inner, self.priority);
    }
}

impl PriorityScheduler {
    /// Create a scheduler with the given global cap and high-priority share.
    #[must_use]
    pub fn new(concurrency: usize, high_share: f64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    concurrency: concurrency.max(1),
                    high_share: clamp_share(high_share),
                    active_high: 0,
                    active_low: 0,
                    queue_high: VecDeque::new(),
                    queue_low: VecDeque::new(),
                }),
            }),
        }
    }

    /// Run `op` once a slot for `priority` is available.
    ///
    /// The slot is held for the full duration of `op` and freed when it
    /// settles, including by panic or drop.
    pub async fn run<T>(&self, priority: Priority, op: impl Future<Output = T>) -> T {
        let permit = self.acquire(priority).await;
        let result = op.await;
        drop(permit);
        result
    }

    async fn acquire(&self, priority: Priority) -> Permit {
        let rx = {
            let mut state = self.inner.state.lock().unwrap();
            if state.admit_now(priority) {
                match priority {
                    Priority::High => state.active_high += 1,
                    Priority::Low => state.active_low += 1,
                }
                tracing::debug!(?priority, active = state.active(), "admitted");
                None
            } else {
                let (tx, rx) = oneshot::channel();
                match priority {
                    Priority::High => state.queue_high.push_back(tx),
                    Priority::Low => state.queue_low.push_back(tx),
                }
                tracing::debug!(?priority, "queued");
                Some(rx)
            }
        };

        match rx {
            None => Permit {
                inner: Arc::clone(&self.inner),
                priority,
            },
            // The sender is only dropped when a queued waiter is skipped
            // during dispatch, which cannot happen while this receiver is
            // alive, or when the scheduler itself is dropped.
            Some(rx) => rx.await.expect("scheduler dropped with queued work"),
        }
    }

    /// Currently executing operations as `(high, low)`.
    #[must_use]
    pub fn active_counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.active_high, state.active_low)
    }

    /// Queued operations as `(high, low)`.
    #[must_use]
    pub fn queued_counts(&self) -> (usize, usize) {
        let state = self.inner.state.lock().unwrap();
        (state.queue_high.len(), state.queue_low.len())
    }

    /// Change the global concurrency cap. Newly freed capacity dispatches
    /// queued work immediately.
    pub fn set_concurrency(&self, concurrency: usize) {
        let mut dispatched = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.concurrency = concurrency.max(1);
            Inner::fill_slots(&self.inner, &mut state, &mut dispatched);
        }
        Inner::deliver(dispatched);
    }

    /// Change the high-priority capacity share (clamped to `0.05..=0.95`).
    pub fn set_high_share(&self, high_share: f64) {
        let mut dispatched = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            state.high_share = clamp_share(high_share);
            Inner::fill_slots(&self.inner, &mut state, &mut dispatched);
        }
        Inner::deliver(dispatched);
    }
}

impl Inner {
    /// Free a slot and dispatch as much queued work as now fits.
    fn release(inner: &Arc<Inner>, priority: Priority) {
        let mut dispatched = Vec::new();
        {
            let mut state = inner.state.lock().unwrap();
            match priority {
                Priority::High => state.active_high -= 1,
                Priority::Low => state.active_low -= 1,
            }
            Self::fill_slots(inner, &mut state, &mut dispatched);
        }
        Self::deliver(dispatched);
    }

    /// Hand permits to queued waiters while capacity remains.
    ///
    /// Counters are bumped under the lock; if a waiter turns out to have
    /// been dropped, delivering its permit fails and the permit's own drop
    /// re-releases the slot.
    fn fill_slots(
        inner: &Arc<Inner>,
        state: &mut State,
        out: &mut Vec<(oneshot::Sender<Permit>, Permit)>,
    ) {
        while state.active() < state.concurrency {
            let Some(lane) = state.next_lane() else {
                break;
            };
            let tx = match lane {
                Priority::High => state.queue_high.pop_front(),
                Priority::Low => state.queue_low.pop_front(),
            }
            .expect("next_lane reported a non-empty queue");
            match lane {
                Priority::High => state.active_high += 1,
                Priority::Low => state.active_low += 1,
            }
            out.push((
                tx,
                Permit {
                    inner: Arc::clone(inner),
                    priority: lane,
                },
            ));
        }
    }

    /// Deliver permits outside the state lock.
    fn deliver(dispatched: Vec<(oneshot::Sender<Permit>, Permit)>) {
        for (tx, permit) in dispatched {
            if let Err(unclaimed) = tx.send(permit) {
                // Waiter went away; dropping the permit frees the slot
                // and dispatches the next candidate.
                drop(unclaimed);
            }
        }
    }
}
