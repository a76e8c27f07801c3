use super::log::LogEntry;
use nidus_common::types::LogIndex;
use std::fmt::Debug;

/// Trait for any Raft-compatible state machine.
/// This allows pluggable logic for different types of services (e.g., key-value store, DB, etc.)
///
/// `apply` must be deterministic: replaying the same commands from index 1
/// always yields the same state.
pub trait StateMachine: Send + 'static {
    type Response: Clone + Debug + Send + 'static;

    /// Applies a committed command and returns a response
    fn apply(&mut self, command: &[u8]) -> Self::Response;
}

/// Feeds committed entries to a state machine strictly in index order.
///
/// `last_applied` starts at 0 on every process start, so after a restart the
/// log is replayed from index 1.
#[derive(Debug)]
pub struct Applier<S> {
    machine: S,
    last_applied: LogIndex,
}

impl<S: StateMachine> Applier<S> {
    pub fn new(machine: S) -> Self {
        Self {
            machine,
            last_applied: 0,
        }
    }

    /// Applies `entry`, which must be the one right after `last_applied`.
    ///
    /// # Panics
    ///
    /// On any gap or reordering; that is a bug in the caller, not a
    /// recoverable condition.
    pub fn apply(&mut self, entry: &LogEntry) -> S::Response {
        assert_eq!(
            entry.index,
            self.last_applied + 1,
            "entries must be applied in order: last applied {}, got {}",
            self.last_applied,
            entry.index
        );
        let response = self.machine.apply(&entry.command);
        self.last_applied = entry.index;
        response
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn machine(&self) -> &S {
        &self.machine
    }
}

//
// Tests
//
#[cfg(test)]
mod tests {
    use super::*;

    /// Records every command it sees.
    #[derive(Default)]
    struct Recorder {
        seen: Vec<Vec<u8>>,
    }

    impl StateMachine for Recorder {
        type Response = usize;

        fn apply(&mut self, command: &[u8]) -> usize {
            self.seen.push(command.to_vec());
            self.seen.len()
        }
    }

    #[test]
    fn test_applies_in_order() {
        let mut applier = Applier::new(Recorder::default());
        assert_eq!(applier.apply(&LogEntry::new(1, 1, "a")), 1);
        assert_eq!(applier.apply(&LogEntry::new(2, 1, "b")), 2);

        assert_eq!(applier.last_applied(), 2);
        assert_eq!(applier.machine().seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    #[should_panic(expected = "entries must be applied in order")]
    fn test_refuses_gap() {
        let mut applier = Applier::new(Recorder::default());
        applier.apply(&LogEntry::new(1, 1, "a"));
        applier.apply(&LogEntry::new(3, 1, "c"));
    }

    #[test]
    #[should_panic(expected = "entries must be applied in order")]
    fn test_refuses_reapply() {
        let mut applier = Applier::new(Recorder::default());
        applier.apply(&LogEntry::new(1, 1, "a"));
        applier.apply(&LogEntry::new(1, 1, "a"));
    }
}
