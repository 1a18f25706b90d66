//! Tool approval for calls the security gate marks as needing confirmation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use colored::Colorize;
use rustyline::error::ReadlineError;
use serde::{Deserialize, Serialize};

use crate::input::LineReader;

/// Determines when tool executions require user approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Approve everything the gate allows (`--yes`)
    Auto,
    /// Ask the user for each call that needs confirmation
    #[default]
    Suggest,
    /// Never execute calls that need confirmation
    Never,
}

impl ApprovalMode {
    pub fn label(self) -> &'static str {
        match self {
            ApprovalMode::Auto => "AUTO",
            ApprovalMode::Suggest => "SUGGEST",
            ApprovalMode::Never => "NEVER",
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "yes" | "trust" => Ok(Self::Auto),
            "suggest" | "ask" => Ok(Self::Suggest),
            "never" | "deny" => Ok(Self::Never),
            other => Err(format!(
                "unknown approval policy `{other}` (expected auto, suggest or never)"
            )),
        }
    }
}

/// User's decision for a pending approval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewDecision {
    /// Execute this call once
    Approved,
    /// Approve and don't ask again for this tool this session
    ApprovedForSession,
    /// Reject this call; the model is told and may try something else
    Denied,
    /// Reject and end the whole turn
    Abort,
}

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub tool_name: String,
    pub reason: String,
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ApprovalRequest) -> ReviewDecision;
}

/// Always answers the same way. Used for non-interactive runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedConfirmer(pub ReviewDecision);

#[async_trait]
impl Confirmer for FixedConfirmer {
    async fn confirm(&self, _request: &ApprovalRequest) -> ReviewDecision {
        self.0
    }
}

/// Asks on the terminal through the same reader as the chat prompt, so an
/// answer left unread by a cancelled turn reaches the chat loop instead.
#[derive(Clone)]
pub struct ConsoleConfirmer {
    input: Arc<LineReader>,
}

impl ConsoleConfirmer {
    #[must_use]
    pub fn new(input: Arc<LineReader>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Confirmer for ConsoleConfirmer {
    async fn confirm(&self, request: &ApprovalRequest) -> ReviewDecision {
        eprintln!(
            "{} {}\n  {}",
            "Approval needed:".yellow().bold(),
            request.tool_name.bold(),
            request.reason
        );
        match self
            .input
            .read_line("  [y] approve  [a] approve for session  [n] deny  [q] abort turn: ")
            .await
        {
            Ok(line) => parse_answer(&line),
            Err(ReadlineError::Interrupted) => ReviewDecision::Abort,
            Err(err) => {
                tracing::debug!(error = %err, "approval prompt closed");
                ReviewDecision::Denied
            }
        }
    }
}

fn parse_answer(line: &str) -> ReviewDecision {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => ReviewDecision::Approved,
        "a" | "always" => ReviewDecision::ApprovedForSession,
        "q" | "quit" | "abort" => ReviewDecision::Abort,
        _ => ReviewDecision::Denied,
    }
}
