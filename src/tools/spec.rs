//! Tool contract: descriptors, argument schema, execution context and results.
//!
//! Every tool is an implementation of [`ToolHandler`]. The registry owns the
//! handlers and turns their `Result<String, ToolError>` into a [`ToolResult`]
//! that always carries one of the three wire statuses.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::tool_parser::ToolArgs;

// === Descriptors ===

/// How an argument is interpreted by the security gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    /// Filesystem path, sandboxed and checked against the sensitive list.
    Path,
    /// Shell command line, matched against the allow and block lists.
    Command,
    Text,
    /// Newline or `;` separated list of items.
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    /// Alternate keys models commonly use; folded into `name` before the gate runs.
    pub aliases: &'static [&'static str],
}

impl ArgSpec {
    #[must_use]
    pub const fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: true,
            aliases: &[],
        }
    }

    #[must_use]
    pub const fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: false,
            aliases: &[],
        }
    }

    #[must_use]
    pub const fn with_aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }
}

/// Static description of a registered tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// The tool modifies the filesystem; overwriting existing files needs confirmation.
    pub mutates: bool,
    /// Every invocation needs explicit user confirmation.
    pub needs_confirmation: bool,
    pub args: Vec<ArgSpec>,
}

impl ToolDescriptor {
    pub fn arg(&self, name: &str) -> Option<&ArgSpec> {
        self.args.iter().find(|spec| spec.name == name)
    }

    /// Rename alias keys to their canonical name. An explicit canonical key wins.
    pub fn canonicalize(&self, args: &mut ToolArgs) {
        for spec in &self.args {
            for alias in spec.aliases {
                if let Some(value) = args.remove(alias)
                    && !args.contains_key(spec.name)
                {
                    args.insert(spec.name, value);
                }
            }
        }
    }

    /// One-line usage rendered into the system prompt.
    #[must_use]
    pub fn usage_line(&self) -> String {
        let mut line = format!("TOOL_CALL: {}", self.name);
        for spec in &self.args {
            if spec.required {
                line.push_str(&format!(" | {}=<{}>", spec.name, kind_label(spec.kind)));
            } else {
                line.push_str(&format!(" | [{}=<{}>]", spec.name, kind_label(spec.kind)));
            }
        }
        line
    }
}

fn kind_label(kind: ArgKind) -> &'static str {
    match kind {
        ArgKind::Path => "path",
        ArgKind::Command => "command",
        ArgKind::Text => "text",
        ArgKind::List => "list",
    }
}

// === Context ===

/// Environment shared by all tool invocations.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Sandbox root; relative paths resolve against it.
    pub workspace: PathBuf,
    /// Upper bound for a single `run_command` child process.
    pub command_timeout: Duration,
    /// Maximum bytes returned by `read_file`.
    pub max_read_bytes: usize,
}

impl ToolContext {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            command_timeout: Duration::from_secs(60),
            max_read_bytes: 256 * 1024,
        }
    }

    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Resolve a tool path argument against the workspace.
    #[must_use]
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let expanded = shellexpand::tilde(raw.trim());
        let path = PathBuf::from(expanded.as_ref());
        if path.is_absolute() {
            path
        } else {
            self.workspace.join(path)
        }
    }
}

// === Handler ===

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(&self, args: &ToolArgs, context: &ToolContext) -> Result<String, ToolError>;
}

// === Errors ===

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Missing required argument: {field}")]
    MissingField { field: String },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Not available: {message}")]
    NotAvailable { message: String },
}

impl ToolError {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::execution_failed(err.to_string())
    }
}

pub fn required_str<'a>(args: &'a ToolArgs, key: &str) -> Result<&'a str, ToolError> {
    args.get_str(key).ok_or_else(|| ToolError::missing_field(key))
}

pub fn optional_str<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get_str(key).filter(|value| !value.is_empty())
}

/// Split a `list` argument on newlines or `;`, dropping blanks.
pub fn list_items(raw: &str) -> Vec<String> {
    raw.split(['\n', ';'])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

// === Results ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Blocked,
}

impl ToolStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one tool call, echoed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool: String,
    pub args: ToolArgs,
    pub status: ToolStatus,
    pub output: String,
}

impl ToolResult {
    #[must_use]
    pub fn new(
        tool: impl Into<String>,
        args: ToolArgs,
        status: ToolStatus,
        output: impl Into<String>,
    ) -> Self {
        Self {
            tool: tool.into(),
            args,
            status,
            output: output.into(),
        }
    }

    #[must_use]
    pub fn success(tool: impl Into<String>, args: ToolArgs, output: impl Into<String>) -> Self {
        Self::new(tool, args, ToolStatus::Success, output)
    }

    #[must_use]
    pub fn error(tool: impl Into<String>, args: ToolArgs, output: impl Into<String>) -> Self {
        Self::new(tool, args, ToolStatus::Error, output)
    }

    #[must_use]
    pub fn blocked(tool: impl Into<String>, args: ToolArgs, output: impl Into<String>) -> Self {
        Self::new(tool, args, ToolStatus::Blocked, output)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}
