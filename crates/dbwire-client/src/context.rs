//! Per-session state.
//!
//! Created when a handshake completes, updated by the engine after every
//! parsed response, replaced wholesale on reconnect. A change of
//! `thread_id` is how callers learn that a reconnect happened.

use crate::protocol::server_status;
use dbwire_core::IsolationLevel;

/// State flags callers set to drive reset-on-reuse.
pub mod state_flags {
    /// The session database was changed
    pub const DATABASE: u32 = 1;
    /// Autocommit was switched off
    pub const AUTOCOMMIT: u32 = 1 << 1;
    /// The transaction isolation was changed
    pub const TRANSACTION_ISOLATION: u32 = 1 << 2;
    /// Session variables were set
    pub const SESSION_VARIABLES: u32 = 1 << 3;
}

/// Snapshot of one physical session's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Server-side connection (thread) id
    pub thread_id: u32,
    /// Capabilities both sides agreed on
    pub capabilities: u32,
    /// Status flags from the latest OK/EOF packet
    pub server_status: u16,
    pub server_version: String,
    /// Current default database
    pub database: Option<String>,
    /// Warnings reported by the latest command
    pub warning_count: u16,
    pub transaction_isolation: Option<IsolationLevel>,
    pub charset: u8,
    state_flags: u32,
}

impl SessionContext {
    pub(crate) fn new(
        thread_id: u32,
        capabilities: u32,
        server_status: u16,
        server_version: String,
        charset: u8,
    ) -> Self {
        Self {
            thread_id,
            capabilities,
            server_status,
            server_version,
            charset,
            ..Self::default()
        }
    }

    /// Is a transaction open?
    ///
    /// The server sets the flag on BEGIN, or on the first statement of an
    /// implicit transaction while autocommit is off.
    pub fn in_transaction(&self) -> bool {
        self.server_status & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn autocommit(&self) -> bool {
        self.server_status & server_status::SERVER_STATUS_AUTOCOMMIT != 0
    }

    /// Does the server treat backslash as an ordinary character?
    pub fn no_backslash_escapes(&self) -> bool {
        self.server_status & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    pub fn more_results(&self) -> bool {
        self.server_status & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }

    /// Was `capability` negotiated?
    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities & capability != 0
    }

    pub fn add_state_flag(&mut self, flag: u32) {
        self.state_flags |= flag;
    }

    pub fn get_state_flag(&self) -> u32 {
        self.state_flags
    }

    pub(crate) fn clear_state_flags(&mut self) {
        self.state_flags = 0;
    }

    pub(crate) fn update_status(&mut self, status: u16, warnings: u16) {
        self.server_status = status;
        self.warning_count = warnings;
    }
}
