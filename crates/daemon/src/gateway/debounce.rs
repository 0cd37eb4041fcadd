// Tree-refresh debouncer.
//
// Collects the paths touched by watcher events and releases them as one batch
// once no new event has arrived for the window (default 500ms).

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_TREE_REFRESH_MS: u64 = 500;

#[derive(Debug)]
pub struct TreeRefreshDebouncer {
    window: Duration,
    pending: BTreeSet<String>,
    deadline: Option<Instant>,
}

impl TreeRefreshDebouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, pending: BTreeSet::new(), deadline: None }
    }

    /// Record a touched path; every push restarts the window.
    pub fn push_at(&mut self, path: String, now: Instant) {
        self.pending.insert(path);
        self.deadline = Some(now + self.window);
    }

    /// When the pending batch becomes ready, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the batch if its window has elapsed at `now`.
    pub fn drain_ready_at(&mut self, now: Instant) -> Option<Vec<String>> {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                Some(std::mem::take(&mut self.pending).into_iter().collect())
            }
            _ => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Default for TreeRefreshDebouncer {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_TREE_REFRESH_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_paths_until_window_elapses() {
        let mut debouncer = TreeRefreshDebouncer::default();
        let start = Instant::now();

        debouncer.push_at("b.txt".into(), start);
        debouncer.push_at("a.txt".into(), start + Duration::from_millis(100));
        debouncer.push_at("a.txt".into(), start + Duration::from_millis(200));
        assert_eq!(debouncer.pending_count(), 2);

        assert!(debouncer.drain_ready_at(start + Duration::from_millis(650)).is_none());
        let batch = debouncer.drain_ready_at(start + Duration::from_millis(700)).unwrap();
        assert_eq!(batch, vec!["a.txt".to_string(), "b.txt".to_string()]);
        assert!(debouncer.next_deadline().is_none());
        assert_eq!(debouncer.pending_count(), 0);
    }

    #[test]
    fn idle_debouncer_has_no_deadline() {
        let mut debouncer = TreeRefreshDebouncer::new(Duration::from_millis(50));
        assert!(debouncer.next_deadline().is_none());
        assert!(debouncer.drain_ready_at(Instant::now()).is_none());
    }
}
