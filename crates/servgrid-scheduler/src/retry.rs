//! Delayed re-attempts of failed service creations.
//!
//! ```text
//!   create fails ──► RetryQueue::schedule(tracker, delay)
//!                          │
//!                          ▼  single worker, earliest due first
//!                    handler(tracker) ──► Created  → publish
//!                                      └► Failed   → reschedule or publish FAILED
//! ```

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use servgrid_state::{RetryConfiguration, ServiceConfiguration, ServiceCreateResult};

/// Floor applied to every retry delay.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Delay before retry number `attempt` (zero-based). The last backoff entry
/// repeats once the list is exhausted.
pub fn retry_delay(policy: &RetryConfiguration, attempt: u32) -> Duration {
    let index = (attempt as usize).min(policy.backoff_ms.len().saturating_sub(1));
    let millis = policy.backoff_ms.get(index).copied().unwrap_or(0);
    Duration::from_millis(millis).max(MIN_RETRY_DELAY)
}

/// State of one deferred creation.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    pub creation_id: Uuid,
    /// Finalized configuration, retry disabled.
    pub configuration: ServiceConfiguration,
    /// Policy of the original request.
    pub policy: RetryConfiguration,
    /// Retries already run.
    pub attempt: u32,
}

impl RetryTracker {
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.policy.max_retries
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    tracker: RetryTracker,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Single-worker delayed queue of trackers.
pub struct RetryQueue {
    tx: mpsc::UnboundedSender<(Duration, RetryTracker)>,
}

impl RetryQueue {
    /// Spawn the worker. `handler` runs one due tracker at a time.
    pub fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(RetryTracker) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, handler));
        Self { tx }
    }

    pub fn schedule(&self, tracker: RetryTracker, delay: Duration) {
        debug!(creation_id = %tracker.creation_id, attempt = tracker.attempt, ?delay, "retry scheduled");
        if self.tx.send((delay, tracker)).is_err() {
            debug!("retry worker stopped, dropping tracker");
        }
    }
}

async fn run_worker<F, Fut>(mut rx: mpsc::UnboundedReceiver<(Duration, RetryTracker)>, handler: F)
where
    F: Fn(RetryTracker) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let next_due = heap.peek().map(|Reverse(s)| s.due);
        tokio::select! {
            item = rx.recv() => match item {
                Some((delay, tracker)) => {
                    seq += 1;
                    heap.push(Reverse(Scheduled { due: Instant::now() + delay, seq, tracker }));
                }
                None => break,
            },
            _ = async {
                match next_due {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Some(Reverse(scheduled)) = heap.pop() {
                    handler(scheduled.tracker).await;
                }
            }
        }
    }
}

/// How long a terminal result stays observable after it is published.
pub const OUTCOME_RETENTION: Duration = Duration::from_secs(60);

/// Terminal results of deferred creations, observable by creation id.
///
/// An entry lives from [`open`](Self::open) until [`OUTCOME_RETENTION`]
/// after its result was published. Receivers taken before eviction keep
/// the final value.
#[derive(Default)]
pub struct RetryOutcomes {
    channels: Arc<DashMap<Uuid, watch::Sender<Option<ServiceCreateResult>>>>,
}

impl RetryOutcomes {
    pub fn open(&self, creation_id: Uuid) {
        self.channels.insert(creation_id, watch::channel(None).0);
    }

    /// Receiver that yields the terminal result once it is known.
    pub fn subscribe(&self, creation_id: Uuid) -> Option<watch::Receiver<Option<ServiceCreateResult>>> {
        self.channels.get(&creation_id).map(|tx| tx.subscribe())
    }

    /// Publish the terminal result and schedule the entry's eviction.
    pub fn publish(&self, creation_id: Uuid, result: ServiceCreateResult) {
        let Some(tx) = self.channels.get(&creation_id) else {
            return;
        };
        tx.send_replace(Some(result));
        drop(tx);

        let channels = Arc::clone(&self.channels);
        tokio::spawn(async move {
            tokio::time::sleep(OUTCOME_RETENTION).await;
            channels.remove(&creation_id);
            debug!(%creation_id, "deferred creation outcome evicted");
        });
    }

    pub fn result(&self, creation_id: Uuid) -> Option<ServiceCreateResult> {
        self.channels
            .get(&creation_id)
            .and_then(|tx| tx.borrow().clone())
    }

    /// Creations still tracked, pending or recently finished.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
