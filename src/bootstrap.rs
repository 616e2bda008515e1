//! Bootstrap progress tracking.

use crate::types::BootstrapState;
use tracing::{debug, info, warn};

/// What an update did to the tracked state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Stale, duplicate, or blocked by exhaustion.
    Unchanged,
    /// Progress moved forward, still below 100.
    Advanced(u8),
    /// Progress reached 100 for the first time.
    Completed,
    /// The exhaustion sentinel was just set.
    Exhausted,
}

/// Monotonic bootstrap percentage with a sticky failure sentinel.
#[derive(Debug, Default)]
pub struct BootstrapTracker {
    state: BootstrapState,
}

impl BootstrapTracker {
    /// Start at 0%.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Whether bootstrap reached 100%.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Apply a reported percentage; only strictly larger values count.
    pub fn update(&mut self, progress: u8) -> Transition {
        let current = match self.state {
            BootstrapState::Exhausted => {
                debug!("Ignoring bootstrap {}% after exhaustion", progress);
                return Transition::Unchanged;
            }
            BootstrapState::Progress(current) => current,
        };

        if progress <= current || progress > 100 {
            return Transition::Unchanged;
        }

        self.state = BootstrapState::Progress(progress);
        if progress == 100 {
            info!("Bootstrap complete");
            Transition::Completed
        } else {
            debug!("Bootstrap at {}%", progress);
            Transition::Advanced(progress)
        }
    }

    /// Record that the daemon ran out of resources.
    pub fn mark_exhausted(&mut self) -> Transition {
        if self.state == BootstrapState::Exhausted {
            return Transition::Unchanged;
        }
        warn!("Daemon reported resource exhaustion");
        self.state = BootstrapState::Exhausted;
        Transition::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_progress() {
        let mut tracker = BootstrapTracker::new();
        assert_eq!(tracker.update(30), Transition::Advanced(30));
        assert_eq!(tracker.update(10), Transition::Unchanged);
        assert_eq!(tracker.update(30), Transition::Unchanged);
        assert_eq!(tracker.state(), BootstrapState::Progress(30));
    }

    #[test]
    fn test_completion_fires_once() {
        let mut tracker = BootstrapTracker::new();
        assert_eq!(tracker.update(100), Transition::Completed);
        assert!(tracker.is_complete());
        assert_eq!(tracker.update(100), Transition::Unchanged);
    }

    #[test]
    fn test_exhaustion_is_sticky() {
        let mut tracker = BootstrapTracker::new();
        tracker.update(40);
        assert_eq!(tracker.mark_exhausted(), Transition::Exhausted);
        assert_eq!(tracker.update(50), Transition::Unchanged);
        assert_eq!(tracker.update(100), Transition::Unchanged);
        assert_eq!(tracker.mark_exhausted(), Transition::Unchanged);
        assert_eq!(tracker.state(), BootstrapState::Exhausted);
        assert!(!tracker.is_complete());
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut tracker = BootstrapTracker::new();
        assert_eq!(tracker.update(101), Transition::Unchanged);
        assert_eq!(tracker.update(0), Transition::Unchanged);
    }
}
