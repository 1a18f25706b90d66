//! Events emitted by the engine while a turn runs.
//!
//! The console listens on an unbounded channel and renders progress as it
//! arrives; the engine never blocks on the listener.

use crate::core::governor::Credential;
use crate::core::turn::{TurnState, TurnStatus};
use crate::tools::spec::ToolStatus;

/// Final status for a turn, including the ways it can end without a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcomeStatus {
    Completed,
    Truncated,
    Interrupted,
    Failed,
}

impl From<TurnStatus> for TurnOutcomeStatus {
    fn from(status: TurnStatus) -> Self {
        match status {
            TurnStatus::Completed => Self::Completed,
            TurnStatus::Truncated => Self::Truncated,
        }
    }
}

/// Events emitted by the engine to update the console.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // === Turn Lifecycle ===
    /// A new turn has started (user sent a message)
    TurnStarted { index: u64 },

    /// The state machine moved
    StateChanged { state: TurnState, iteration: u32 },

    /// A prompt is about to be sent to the model
    ModelRequest {
        credential: Credential,
        iteration: u32,
    },

    /// The turn is over
    TurnComplete {
        status: TurnOutcomeStatus,
        error: Option<String>,
    },

    // === Tool Events ===
    /// Tool call about to run (or be refused)
    ToolCallStarted { name: String, summary: String },

    /// Tool call finished
    ToolCallComplete {
        name: String,
        status: ToolStatus,
        preview: String,
    },

    // === System Events ===
    /// An error occurred
    Error { message: String, recoverable: bool },

    /// Status message for console display
    Status { message: String },
}

impl Event {
    /// Create a new error event
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Event::Error {
            message: message.into(),
            recoverable,
        }
    }

    /// Create a new status event
    pub fn status(message: impl Into<String>) -> Self {
        Event::Status {
            message: message.into(),
        }
    }
}
