//! Readiness gate for caller requests.
//!
//! Requests that arrive before the daemon finished bootstrapping are
//! parked here and handed back, in order, exactly once when the gate
//! opens. The gate has a single owner, so a drain can never race with a
//! new park.

use std::collections::VecDeque;

/// FIFO of deferred operations that opens once and stays open.
#[derive(Debug)]
pub struct ReadinessGate<T> {
    open: bool,
    parked: VecDeque<T>,
}

impl<T> Default for ReadinessGate<T> {
    fn default() -> Self {
        Self {
            open: false,
            parked: VecDeque::new(),
        }
    }
}

impl<T> ReadinessGate<T> {
    /// Create a closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `op` back if the gate is open, otherwise park it.
    pub fn admit(&mut self, op: T) -> Option<T> {
        if self.open {
            Some(op)
        } else {
            self.parked.push_back(op);
            None
        }
    }

    /// Open the gate and take every parked operation, oldest first.
    ///
    /// Opening an already open gate yields nothing.
    pub fn open(&mut self) -> Vec<T> {
        self.open = true;
        self.parked.drain(..).collect()
    }

    /// Whether the gate has opened.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Number of parked operations.
    pub fn len(&self) -> usize {
        self.parked.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parks_until_open() {
        let mut gate = ReadinessGate::new();
        assert_eq!(gate.admit("ctx1"), None);
        assert_eq!(gate.admit("ctx2"), None);
        assert_eq!(gate.len(), 2);

        assert_eq!(gate.open(), vec!["ctx1", "ctx2"]);
        assert!(gate.is_empty());
        assert!(gate.is_open());
    }

    #[test]
    fn test_open_gate_passes_through() {
        let mut gate = ReadinessGate::new();
        gate.open();
        assert_eq!(gate.admit(7), Some(7));
        assert!(gate.open().is_empty());
    }
}
