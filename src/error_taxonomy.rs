//! Shared error taxonomy across the channel, governor, tools, engine and session.
//!
//! Each subsystem keeps its own `thiserror` enum; [`ErrorEnvelope`] is the
//! common shape used for console messages and audit records.

use std::fmt;

use crate::core::engine::TurnError;
use crate::core::governor::GovernorError;
use crate::core::spawn::SpawnError;
use crate::core::tool_parser::DecodeError;
use crate::llm_client::ChannelError;
use crate::session_manager::SessionError;
use crate::tools::spec::ToolError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    RateLimit,
    Timeout,
    InvalidInput,
    Parse,
    Tool,
    State,
    Cancelled,
    Internal,
}

/// Severity hint for the console and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub recoverable: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        recoverable: bool,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            recoverable,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Record body for `audit::AuditLog::log_event`.
    #[must_use]
    pub fn to_audit(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "code": self.code }))
    }
}

impl fmt::Display for ErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<&ChannelError> for ErrorEnvelope {
    fn from(value: &ChannelError) -> Self {
        let (category, severity) = match value {
            ChannelError::Timeout(_) => (ErrorCategory::Timeout, ErrorSeverity::Warning),
            ChannelError::QuotaExceeded(_) => (ErrorCategory::RateLimit, ErrorSeverity::Warning),
            ChannelError::Transport(_) => (ErrorCategory::Network, ErrorSeverity::Error),
        };
        Self::new(category, severity, true, value.code(), value.to_string())
    }
}

impl From<&GovernorError> for ErrorEnvelope {
    fn from(value: &GovernorError) -> Self {
        match value {
            GovernorError::Exhausted | GovernorError::CircuitOpen(_) => Self::new(
                ErrorCategory::RateLimit,
                ErrorSeverity::Warning,
                true,
                "governor_exhausted",
                value.to_string(),
            ),
            GovernorError::UnknownCredential(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                false,
                "governor_unknown_credential",
                value.to_string(),
            ),
            GovernorError::NoCredentials => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Critical,
                false,
                "governor_no_credentials",
                value.to_string(),
            ),
        }
    }
}

impl From<&ToolError> for ErrorEnvelope {
    fn from(value: &ToolError) -> Self {
        let message = value.to_string();
        match value {
            ToolError::InvalidInput { .. } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_invalid_input",
                message,
            ),
            ToolError::MissingField { .. } => Self::new(
                ErrorCategory::InvalidInput,
                ErrorSeverity::Error,
                false,
                "tool_missing_field",
                message,
            ),
            ToolError::ExecutionFailed { .. } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                true,
                "tool_execution_failed",
                message,
            ),
            ToolError::Timeout { .. } => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                "tool_timeout",
                message,
            ),
            ToolError::NotAvailable { .. } => Self::new(
                ErrorCategory::State,
                ErrorSeverity::Error,
                false,
                "tool_not_available",
                message,
            ),
        }
    }
}

impl From<&DecodeError> for ErrorEnvelope {
    fn from(value: &DecodeError) -> Self {
        Self::new(
            ErrorCategory::Parse,
            ErrorSeverity::Warning,
            true,
            "protocol_decode",
            value.to_string(),
        )
    }
}

impl From<&TurnError> for ErrorEnvelope {
    fn from(value: &TurnError) -> Self {
        match value {
            TurnError::Channel { source, .. } => {
                let inner = Self::from(source);
                Self::new(inner.category, ErrorSeverity::Error, true, inner.code, value.to_string())
            }
            TurnError::Exhausted { source, .. } => {
                let inner = Self::from(source);
                Self::new(inner.category, inner.severity, inner.recoverable, inner.code, value.to_string())
            }
            TurnError::Cancelled { .. } => Self::new(
                ErrorCategory::Cancelled,
                ErrorSeverity::Info,
                true,
                "turn_cancelled",
                value.to_string(),
            ),
            TurnError::DeadlineExceeded { .. } => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                "turn_deadline",
                value.to_string(),
            ),
            TurnError::State { .. } => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Critical,
                false,
                "turn_state",
                value.to_string(),
            ),
        }
    }
}

impl From<&SpawnError> for ErrorEnvelope {
    fn from(value: &SpawnError) -> Self {
        match value {
            SpawnError::Timeout(_) => Self::new(
                ErrorCategory::Timeout,
                ErrorSeverity::Warning,
                true,
                "spawn_timeout",
                value.to_string(),
            ),
            SpawnError::Channel { source, .. } => Self::from(source),
            SpawnError::Exhausted(source) => Self::from(source),
            SpawnError::Internal(_) => Self::new(
                ErrorCategory::Internal,
                ErrorSeverity::Error,
                false,
                "spawn_internal",
                value.to_string(),
            ),
        }
    }
}

impl From<&SessionError> for ErrorEnvelope {
    fn from(value: &SessionError) -> Self {
        let (category, severity, code) = match value {
            SessionError::AlreadyRunning { .. } => {
                (ErrorCategory::State, ErrorSeverity::Critical, "session_already_running")
            }
            SessionError::Io { .. } => (ErrorCategory::Internal, ErrorSeverity::Error, "session_io"),
            SessionError::CorruptHistory { .. } => {
                (ErrorCategory::Parse, ErrorSeverity::Error, "session_corrupt_history")
            }
            SessionError::Serialize(_) => {
                (ErrorCategory::Internal, ErrorSeverity::Error, "session_serialize")
            }
        };
        Self::new(category, severity, false, code, value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::governor::Credential;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn channel_failures_are_recoverable() {
        let envelope = ErrorEnvelope::from(&ChannelError::QuotaExceeded("429".to_string()));
        assert_eq!(envelope.category, ErrorCategory::RateLimit);
        assert_eq!(envelope.code, "channel_quota");
        assert!(envelope.recoverable);
    }

    #[test]
    fn turn_error_keeps_channel_code() {
        let err = TurnError::Channel {
            credential: Credential::new("2"),
            source: ChannelError::Transport("connection reset".to_string()),
            partial: Vec::new(),
        };
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.code, "channel_transport");
        assert_eq!(envelope.category, ErrorCategory::Network);
        assert!(envelope.message.contains("account 2"));
    }

    #[test]
    fn cancellation_is_informational() {
        let envelope = ErrorEnvelope::from(&TurnError::Cancelled { partial: Vec::new() });
        assert_eq!(envelope.severity, ErrorSeverity::Info);
        assert_eq!(envelope.category, ErrorCategory::Cancelled);
    }

    #[test]
    fn spawn_timeout_maps_to_timeout() {
        let envelope = ErrorEnvelope::from(&SpawnError::Timeout(Duration::from_secs(180)));
        assert_eq!(envelope.to_string(), "[spawn_timeout] timed out after 180s");
    }

    #[test]
    fn session_conflict_is_fatal() {
        let err = SessionError::AlreadyRunning {
            session_id: "abc".to_string(),
            pid: 42,
        };
        let envelope = ErrorEnvelope::from(&err);
        assert_eq!(envelope.severity, ErrorSeverity::Critical);
        assert!(!envelope.recoverable);
    }

    #[test]
    fn audit_body_is_snake_case() {
        let envelope = ErrorEnvelope::from(&ToolError::missing_field("path"));
        let value = envelope.to_audit();
        assert_eq!(value["category"], "invalid_input");
        assert_eq!(value["code"], "tool_missing_field");
    }
}
