//! Console capture for service processes.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

/// One line of process output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleLine {
    pub line: String,
    pub error_stream: bool,
}

/// Bounded cache of the latest output lines plus a live feed.
pub struct ConsoleLog {
    service: String,
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
    feed: broadcast::Sender<ConsoleLine>,
}

impl ConsoleLog {
    pub fn new(service: impl Into<String>, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(256);
        Self {
            service: service.into(),
            capacity,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            feed,
        }
    }

    pub fn push(&self, line: String, error_stream: bool) {
        debug!(target: "servgrid::console", service = %self.service, error_stream, "{line}");
        {
            let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
            if self.capacity > 0 {
                if lines.len() == self.capacity {
                    lines.pop_front();
                }
                lines.push_back(line.clone());
            }
        }
        // No subscribers is fine.
        let _ = self.feed.send(ConsoleLine { line, error_stream });
    }

    /// Cached lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleLine> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_latest_lines() {
        let log = ConsoleLog::new("Lobby-1", 2);
        log.push("a".into(), false);
        log.push("b".into(), false);
        log.push("c".into(), true);
        assert_eq!(log.lines(), vec!["b", "c"]);

        log.clear();
        assert!(log.lines().is_empty());
    }

    #[tokio::test]
    async fn subscribers_see_new_lines() {
        let log = ConsoleLog::new("Lobby-1", 8);
        let mut feed = log.subscribe();
        log.push("Done (3.2s)!".into(), false);

        let line = feed.recv().await.unwrap();
        assert_eq!(line.line, "Done (3.2s)!");
        assert!(!line.error_stream);
    }
}
