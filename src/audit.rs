//! Lightweight audit logging for tool decisions.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::core::tool_parser::ToolArgs;
use crate::utils::truncate_with_ellipsis;

const AUDIT_FILE: &str = "audit.log";
const MAX_VALUE_CHARS: usize = 500;
const SECRET_KEY_HINTS: &[&str] = &["secret", "token", "password", "passwd", "api_key", "apikey", "credential"];

/// Append-only JSON-lines log under the state directory.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<state_dir>/audit.log`
    #[must_use]
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(AUDIT_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an audit event.
    ///
    /// Best-effort: a failed write is logged and otherwise ignored.
    pub fn log_event(&self, event: &str, details: Value) {
        if let Err(err) = self.append_event(event, details) {
            crate::logging::warn(format!("audit log write failed: {err}"));
        }
    }

    fn append_event(&self, event: &str, details: Value) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let record = json!({
            "ts": Utc::now().to_rfc3339(),
            "event": event,
            "details": details,
        });
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        Ok(())
    }
}

/// Arguments as JSON with secret-looking keys redacted and long values cut.
#[must_use]
pub fn sanitize_args(args: &ToolArgs) -> Value {
    let mut map = Map::new();
    for (key, value) in args {
        let lowered = key.to_ascii_lowercase();
        let rendered = if SECRET_KEY_HINTS.iter().any(|hint| lowered.contains(hint)) {
            "[redacted]".to_string()
        } else {
            truncate_with_ellipsis(&value.to_wire(), MAX_VALUE_CHARS, "...")
        };
        map.insert(key.clone(), Value::String(rendered));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::in_state_dir(&dir.path().join("state"));
        log.log_event("tool_call", json!({"tool": "read_file"}));
        log.log_event("security_denied", json!({"tool": "run_command"}));

        let text = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "tool_call");
        assert_eq!(lines[1]["details"]["tool"], "run_command");
        assert!(lines[0]["ts"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn secrets_are_redacted_and_long_values_cut() {
        let args = ToolArgs::new()
            .with("path", "src/main.rs")
            .with("api_key", "sk-123")
            .with("content", "x".repeat(2_000));
        let sanitized = sanitize_args(&args);
        assert_eq!(sanitized["path"], "src/main.rs");
        assert_eq!(sanitized["api_key"], "[redacted]");
        let content = sanitized["content"].as_str().unwrap();
        assert_eq!(content.len(), MAX_VALUE_CHARS);
        assert!(content.ends_with("..."));
    }
}
