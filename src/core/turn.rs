//! Turn records and the per-turn state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::governor::Credential;
use crate::core::tool_parser::ToolCall;
use crate::tools::spec::ToolResult;

// === Records ===

/// One tool call paired with the result that was fed back for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub call: ToolCall,
    pub result: ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    /// The iteration bound was hit while the model still wanted tools.
    Truncated,
}

impl fmt::Display for TurnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Truncated => f.write_str("truncated"),
        }
    }
}

/// A committed unit of conversation. Never modified after it is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub user: String,
    pub exchanges: Vec<Exchange>,
    pub response: String,
    pub credential: Credential,
    pub timestamp: DateTime<Utc>,
    pub status: TurnStatus,
}

impl Turn {
    /// Names of the tools this turn used, in call order.
    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.exchanges.iter().map(|exchange| exchange.call.name.as_str())
    }
}

// === State machine ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingModel,
    HasToolCalls,
    Executing,
    Done(TurnStatus),
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AwaitingModel => f.write_str("awaiting model"),
            Self::HasToolCalls => f.write_str("has tool calls"),
            Self::Executing => f.write_str("executing"),
            Self::Done(status) => write!(f, "done ({status})"),
        }
    }
}

/// Inputs that drive [`TurnState::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Submit,
    ModelReplied,
    /// The reply decoded to at least one call.
    CallsFound,
    /// The reply holds no calls.
    NoCalls,
    ResultsAppended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {transition:?} from {from}")]
pub struct InvalidTransition {
    pub from: TurnState,
    pub transition: Transition,
}

impl TurnState {
    /// Apply `transition`. `iteration` counts model replies so far in this turn.
    pub fn advance(
        self,
        transition: Transition,
        iteration: u32,
        max_iterations: u32,
    ) -> Result<TurnState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, Transition::Submit) => Self::AwaitingModel,
            (Self::AwaitingModel, Transition::ModelReplied) => Self::HasToolCalls,
            (Self::HasToolCalls, Transition::NoCalls) => Self::Done(TurnStatus::Completed),
            (Self::HasToolCalls, Transition::CallsFound) if iteration >= max_iterations => {
                Self::Done(TurnStatus::Truncated)
            }
            (Self::HasToolCalls, Transition::CallsFound) => Self::Executing,
            (Self::Executing, Transition::ResultsAppended) => Self::AwaitingModel,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }

    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_a_two_round_turn() {
        let mut state = TurnState::Idle;
        state = state.advance(Transition::Submit, 0, 10).unwrap();
        assert_eq!(state, TurnState::AwaitingModel);
        state = state.advance(Transition::ModelReplied, 1, 10).unwrap();
        state = state.advance(Transition::CallsFound, 1, 10).unwrap();
        assert_eq!(state, TurnState::Executing);
        state = state.advance(Transition::ResultsAppended, 1, 10).unwrap();
        state = state.advance(Transition::ModelReplied, 2, 10).unwrap();
        state = state.advance(Transition::NoCalls, 2, 10).unwrap();
        assert_eq!(state, TurnState::Done(TurnStatus::Completed));
        assert!(state.is_done());
    }

    #[test]
    fn calls_at_the_bound_truncate() {
        let state = TurnState::HasToolCalls;
        assert_eq!(
            state.advance(Transition::CallsFound, 3, 3).unwrap(),
            TurnState::Done(TurnStatus::Truncated)
        );
        assert_eq!(
            state.advance(Transition::CallsFound, 2, 3).unwrap(),
            TurnState::Executing
        );
    }

    #[test]
    fn rejects_out_of_order_transitions() {
        let err = TurnState::Idle
            .advance(Transition::ResultsAppended, 0, 10)
            .unwrap_err();
        assert_eq!(err.from, TurnState::Idle);
        assert!(
            TurnState::Done(TurnStatus::Completed)
                .advance(Transition::Submit, 0, 10)
                .is_err()
        );
    }

    #[test]
    fn status_serializes_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&TurnStatus::Truncated).unwrap(),
            "\"truncated\""
        );
    }
}
