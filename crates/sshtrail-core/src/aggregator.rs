//! Terminal burst aggregation
//!
//! Terminal data arrives from the kernel one read() at a time, which at an
//! interactive prompt means a flood of tiny events. Data received for the
//! same session within the flush window is concatenated and emitted as one
//! update.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct PendingTerminal {
    data: Vec<u8>,
    inserted_at: Instant,
}

/// Per-session accumulators guarded by one mutex; the pipeline ingest adds,
/// the pipeline flusher drains. At most one live accumulator per ptm pid.
pub struct TerminalAggregator {
    window: Duration,
    pending: Mutex<HashMap<u32, PendingTerminal>>,
}

impl TerminalAggregator {
    /// Default flush window for interactive terminal traffic
    pub const DEFAULT_WINDOW: Duration = Duration::from_millis(200);

    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append data for a session. The window clock starts on first append
    /// and is not extended by later ones.
    pub fn add(&self, ptm_pid: u32, data: &[u8]) {
        let mut pending = self.pending.lock();
        pending
            .entry(ptm_pid)
            .or_insert_with(|| PendingTerminal {
                data: Vec::new(),
                inserted_at: Instant::now(),
            })
            .data
            .extend_from_slice(data);
    }

    /// Remove and return every accumulator older than the window, in
    /// arrival order per session. Accepted data is never dropped.
    pub fn drain_expired(&self) -> Vec<(u32, Vec<u8>)> {
        let now = Instant::now();
        let mut pending = self.pending.lock();

        let expired: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.inserted_at) >= self.window)
            .map(|(&pid, _)| pid)
            .collect();

        expired
            .into_iter()
            .filter_map(|pid| pending.remove(&pid).map(|p| (pid, p.data)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_preserve_arrival_order() {
        let agg = TerminalAggregator::new(Duration::ZERO);
        agg.add(10, b"hello ");
        agg.add(10, b"world");

        let drained = agg.drain_expired();
        assert_eq!(drained, vec![(10, b"hello world".to_vec())]);
    }

    #[test]
    fn sessions_accumulate_independently() {
        let agg = TerminalAggregator::new(Duration::ZERO);
        agg.add(1, b"one");
        agg.add(2, b"two");

        let mut drained = agg.drain_expired();
        drained.sort_by_key(|(pid, _)| *pid);
        assert_eq!(drained, vec![(1, b"one".to_vec()), (2, b"two".to_vec())]);
    }

    #[test]
    fn young_accumulators_are_held_back() {
        let agg = TerminalAggregator::new(Duration::from_secs(60));
        agg.add(7, b"not yet");
        assert!(agg.drain_expired().is_empty());

        // still buffered, nothing lost
        agg.add(7, b", still here");
        let held = agg.pending.lock();
        assert_eq!(held.get(&7).unwrap().data, b"not yet, still here");
    }

    #[test]
    fn drained_accumulators_are_gone() {
        let agg = TerminalAggregator::new(Duration::ZERO);
        agg.add(3, b"once");
        assert_eq!(agg.drain_expired().len(), 1);
        assert!(agg.drain_expired().is_empty());
    }
}
