//! Deferred work executed on the node's next tick.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Interval of the node's main loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Ticks between watchdog and cluster maintenance passes.
pub const WATCHDOG_EVERY_TICKS: u64 = 10;

pub type TickTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Schedules work onto the next tick.
#[derive(Clone)]
pub struct TickHandle {
    tx: mpsc::UnboundedSender<TickTask>,
}

impl TickHandle {
    pub fn run_next_tick(&self, task: impl Future<Output = ()> + Send + 'static) {
        if self.tx.send(Box::pin(task)).is_err() {
            debug!("tick loop stopped, dropping task");
        }
    }
}

/// Receiving side, drained by the node's main loop.
pub struct TickQueue {
    rx: mpsc::UnboundedReceiver<TickTask>,
}

impl TickQueue {
    /// Spawn everything queued so far. Returns how many tasks ran.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.rx.try_recv() {
            tokio::spawn(task);
            count += 1;
        }
        count
    }
}

pub fn tick_channel() -> (TickHandle, TickQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TickHandle { tx }, TickQueue { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn queued_tasks_run_when_drained() {
        let (handle, mut queue) = tick_channel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        handle.run_next_tick(async move { flag.store(true, Ordering::SeqCst) });

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.drain(), 1);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queue.drain(), 0);
    }
}
