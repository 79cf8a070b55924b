//! Transaction replay log.
//!
//! While a transaction is open, every acknowledged state-changing command is
//! recorded by value. When the physical connection is lost mid-transaction,
//! the log is re-issued on a new session in the original order; afterwards
//! recording continues.
//!
//! ```text
//! INACTIVE -> RECORDING -> REPLAYING -> RECORDING
//!                 |
//!                 +-> POISONED (too many commands; replay impossible)
//! ```

use std::time::Instant;

use crate::command::Command;

/// Replay log state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Inactive,
    Recording,
    Replaying,
    /// The transaction outgrew the log; a reconnect loses it
    Poisoned,
}

/// One recorded command.
#[derive(Debug, Clone)]
pub struct CommandLogEntry {
    pub command: Command,
    /// Position in the transaction, starting at 1
    pub sequence: u64,
    pub captured_at: Instant,
}

/// Commands of the open transaction.
#[derive(Debug)]
pub struct TransactionLog {
    entries: Vec<CommandLogEntry>,
    max_entries: usize,
    state: ReplayState,
    next_sequence: u64,
}

impl TransactionLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            state: ReplayState::Inactive,
            next_sequence: 1,
        }
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == ReplayState::Poisoned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[CommandLogEntry] {
        &self.entries
    }

    /// Record a command the server acknowledged.
    ///
    /// `in_transaction` is the session's transaction status after the
    /// command. Leaving the transaction (COMMIT, ROLLBACK, or an
    /// autocommitted statement) clears the log.
    pub fn record(&mut self, command: &Command, in_transaction: bool) {
        if !in_transaction {
            self.clear();
            return;
        }
        match self.state {
            ReplayState::Poisoned => return,
            ReplayState::Replaying => {
                tracing::debug!("Ignoring record during replay");
                return;
            }
            ReplayState::Inactive | ReplayState::Recording => {}
        }
        if !command.is_replayable() {
            self.state = ReplayState::Recording;
            return;
        }
        if self.entries.len() >= self.max_entries {
            tracing::warn!(
                limit = self.max_entries,
                "Transaction exceeds replay log size, replay disabled for this transaction"
            );
            self.entries.clear();
            self.state = ReplayState::Poisoned;
            return;
        }
        self.entries.push(CommandLogEntry {
            command: command.clone(),
            sequence: self.next_sequence,
            captured_at: Instant::now(),
        });
        self.next_sequence += 1;
        self.state = ReplayState::Recording;
    }

    /// Enter replay, returning the commands to re-issue in order.
    pub fn begin_replay(&mut self) -> Vec<Command> {
        self.state = ReplayState::Replaying;
        self.entries.iter().map(|e| e.command.clone()).collect()
    }

    /// Replay succeeded; keep recording into the same log.
    pub fn end_replay(&mut self) {
        if self.state == ReplayState::Replaying {
            self.state = ReplayState::Recording;
        }
    }

    /// Forget the transaction.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_sequence = 1;
        self.state = ReplayState::Inactive;
    }
}
