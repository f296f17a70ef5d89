//! Reliable text command rings
//!
//! Each side of a connection keeps the last [`MAX_RELIABLE_COMMANDS`]
//! commands it has queued, indexed by `sequence & (MAX_RELIABLE_COMMANDS - 1)`,
//! and resends everything the peer has not acknowledged on every packet.
//! The receiving side stores commands by sequence and executes each one once.
//!
//! Sequence numbers wrap at `i32::MAX`; every comparison goes through
//! `wrapping_sub`, so ordering stays correct across the wrap as long as the
//! two sequences compared are less than 2^31 apart.

use crate::protocol::{MAX_RELIABLE_COMMANDS, MAX_STRING_CHARS};
use thiserror::Error;

/// Longest command that may be queued; longer ones are refused, never truncated
pub const MAX_COMMAND_LEN: usize = MAX_STRING_CHARS - 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReliableError {
    /// More than the ring size of commands is waiting for acknowledgement
    #[error("reliable command overflow: sequence {sequence}, acknowledged {acknowledge}")]
    Overflow { sequence: i32, acknowledge: i32 },

    /// Command no longer retained
    #[error("command {requested} cycled out, latest is {latest}")]
    CycledOut { requested: i32, latest: i32 },

    /// Command newer than anything received
    #[error("requested a command not received: {requested}, latest is {latest}")]
    NotReceived { requested: i32, latest: i32 },

    #[error("command of {0} bytes exceeds the reliable command limit")]
    TooLong(usize),
}

fn slot(sequence: i32) -> usize {
    (sequence as u32 as usize) & (MAX_RELIABLE_COMMANDS - 1)
}

/// Outgoing commands awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct ReliableSender {
    commands: Vec<String>,
    sequence: i32,
    acknowledge: i32,
}

impl Default for ReliableSender {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableSender {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Starts a log whose next command will be `sequence + 1`
    pub fn starting_at(sequence: i32) -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence,
            acknowledge: sequence,
        }
    }

    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    pub fn acknowledge(&self) -> i32 {
        self.acknowledge
    }

    /// Number of queued commands the peer has not acknowledged
    pub fn backlog(&self) -> i32 {
        self.sequence.wrapping_sub(self.acknowledge)
    }

    /// Queues a command and returns its sequence number
    ///
    /// Overflow leaves the log untouched; the caller must drop the connection.
    pub fn push(&mut self, text: &str) -> Result<i32, ReliableError> {
        if text.len() > MAX_COMMAND_LEN {
            return Err(ReliableError::TooLong(text.len()));
        }
        if self.backlog() >= MAX_RELIABLE_COMMANDS as i32 {
            return Err(ReliableError::Overflow {
                sequence: self.sequence.wrapping_add(1),
                acknowledge: self.acknowledge,
            });
        }
        self.sequence = self.sequence.wrapping_add(1);
        self.commands[slot(self.sequence)] = text.to_string();
        Ok(self.sequence)
    }

    /// Records the peer's acknowledgement
    ///
    /// Values outside `[sequence - MAX_RELIABLE_COMMANDS, sequence]` cannot be
    /// genuine; they reset the acknowledgement to `sequence` and return false.
    pub fn set_acknowledge(&mut self, acknowledge: i32) -> bool {
        let behind = self.sequence.wrapping_sub(acknowledge);
        if behind < 0 || behind > MAX_RELIABLE_COMMANDS as i32 {
            self.acknowledge = self.sequence;
            return false;
        }
        self.acknowledge = acknowledge;
        true
    }

    /// Commands the peer still has to acknowledge, oldest first
    pub fn unacknowledged(&self) -> impl Iterator<Item = (i32, &str)> {
        let start = self.acknowledge;
        (1..=self.backlog()).map(move |offset| {
            let sequence = start.wrapping_add(offset);
            (sequence, self.commands[slot(sequence)].as_str())
        })
    }

    /// Text of a retained command
    pub fn get(&self, sequence: i32) -> Option<&str> {
        let behind = self.sequence.wrapping_sub(sequence);
        if behind < 0 || behind >= MAX_RELIABLE_COMMANDS as i32 {
            return None;
        }
        Some(&self.commands[slot(sequence)])
    }
}

/// Incoming commands kept for in-order execution
#[derive(Debug, Clone)]
pub struct ReliableReceiver {
    commands: Vec<String>,
    sequence: i32,
}

impl Default for ReliableReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableReceiver {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(sequence: i32) -> Self {
        Self {
            commands: vec![String::new(); MAX_RELIABLE_COMMANDS],
            sequence,
        }
    }

    /// Highest sequence received so far
    pub fn sequence(&self) -> i32 {
        self.sequence
    }

    /// Stores a command; already received sequences are ignored
    pub fn store(&mut self, sequence: i32, text: &str) -> bool {
        if sequence.wrapping_sub(self.sequence) <= 0 {
            return false;
        }
        self.sequence = sequence;
        self.commands[slot(sequence)] = text.to_string();
        true
    }

    /// Looks up a received command that is still retained
    pub fn get(&self, sequence: i32) -> Result<&str, ReliableError> {
        let behind = self.sequence.wrapping_sub(sequence);
        if behind >= MAX_RELIABLE_COMMANDS as i32 {
            return Err(ReliableError::CycledOut {
                requested: sequence,
                latest: self.sequence,
            });
        }
        if behind < 0 {
            return Err(ReliableError::NotReceived {
                requested: sequence,
                latest: self.sequence,
            });
        }
        Ok(&self.commands[slot(sequence)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unacknowledged_window() {
        let mut sender = ReliableSender::new();
        for text in ["cmd1", "cmd2", "cmd3"] {
            sender.push(text).unwrap();
        }
        assert!(sender.set_acknowledge(2));
        sender.push("cmd4").unwrap();

        let pending: Vec<_> = sender.unacknowledged().collect();
        assert_eq!(pending, vec![(3, "cmd3"), (4, "cmd4")]);
    }

    #[test]
    fn test_overflow_is_reported_not_wrapped() {
        let mut sender = ReliableSender::new();
        for i in 0..MAX_RELIABLE_COMMANDS {
            sender.push(&format!("cmd{}", i)).unwrap();
        }
        let err = sender.push("one too many").unwrap_err();
        assert_eq!(
            err,
            ReliableError::Overflow {
                sequence: 257,
                acknowledge: 0
            }
        );
        assert_eq!(sender.sequence(), 256);
        assert_eq!(sender.get(1), Some("cmd0"));
    }

    #[test]
    fn test_bogus_acknowledge_resets() {
        let mut sender = ReliableSender::starting_at(300);
        sender.push("a").unwrap();
        assert!(!sender.set_acknowledge(400));
        assert_eq!(sender.acknowledge(), 301);
        assert!(!sender.set_acknowledge(10));
        assert_eq!(sender.acknowledge(), 301);
        assert!(sender.set_acknowledge(301 - 256));
    }

    #[test]
    fn test_too_long_command_is_refused() {
        let mut sender = ReliableSender::new();
        let long = "x".repeat(MAX_COMMAND_LEN + 1);
        assert_eq!(sender.push(&long), Err(ReliableError::TooLong(MAX_COMMAND_LEN + 1)));
        assert_eq!(sender.sequence(), 0);
        assert!(sender.push(&"x".repeat(MAX_COMMAND_LEN)).is_ok());
    }

    #[test]
    fn test_receiver_ignores_duplicates() {
        let mut receiver = ReliableReceiver::new();
        assert!(receiver.store(1, "a"));
        assert!(receiver.store(2, "b"));
        assert!(!receiver.store(2, "b again"));
        assert!(!receiver.store(1, "a again"));
        assert_eq!(receiver.get(2), Ok("b"));
    }

    #[test]
    fn test_receiver_window_errors() {
        let mut receiver = ReliableReceiver::new();
        for seq in 1..=300 {
            receiver.store(seq, &format!("c{}", seq));
        }
        assert_eq!(receiver.get(45).unwrap(), "c45".to_string().as_str());
        assert!(matches!(receiver.get(44), Err(ReliableError::CycledOut { .. })));
        assert!(matches!(receiver.get(301), Err(ReliableError::NotReceived { .. })));
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut sender = ReliableSender::starting_at(i32::MAX - 1);
        assert_eq!(sender.push("a").unwrap(), i32::MAX);
        assert_eq!(sender.push("b").unwrap(), i32::MIN);
        assert_eq!(sender.backlog(), 2);
        assert_eq!(sender.get(i32::MAX), Some("a"));

        let pending: Vec<_> = sender.unacknowledged().map(|(_, t)| t).collect();
        assert_eq!(pending, vec!["a", "b"]);

        let mut receiver = ReliableReceiver::starting_at(i32::MAX - 1);
        assert!(receiver.store(i32::MAX, "a"));
        assert!(receiver.store(i32::MIN, "b"));
        assert!(!receiver.store(i32::MAX, "a"));
        assert_eq!(receiver.get(i32::MIN), Ok("b"));
    }
}
