//! Security gate: the single trust boundary between model requests and tools.
//!
//! Every decoded call is evaluated against the sandbox root and the immutable
//! [`RuleSet`] before dispatch. Evaluation reads the filesystem (to resolve
//! symlinks and to see whether a target exists) but keeps no state of its own,
//! so the same call against the same tree always gets the same verdict.

pub mod matcher;
pub mod paths;
pub mod rules;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::tool_parser::ToolCall;
use crate::tools::spec::{ArgKind, ToolDescriptor};

pub use matcher::normalize_command;
pub use rules::{RuleError, RuleSet};

/// Verdict for one pending call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityDecision {
    Allow,
    Deny(String),
    RequireConfirmation(String),
}

impl fmt::Display for SecurityDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::Deny(reason) => write!(f, "deny ({reason})"),
            Self::RequireConfirmation(reason) => write!(f, "confirm ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityGate {
    root: PathBuf,
    rules: RuleSet,
}

impl SecurityGate {
    #[must_use]
    pub fn new(root: &Path, rules: RuleSet) -> Self {
        Self {
            root: paths::canonicalize_lenient(&paths::absolutize(
                &std::env::current_dir().unwrap_or_default(),
                &root.to_string_lossy(),
            )),
            rules,
        }
    }

    /// Canonical sandbox root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn evaluate(&self, call: &ToolCall, descriptor: &ToolDescriptor) -> SecurityDecision {
        let mut confirmations = Vec::new();

        for spec in &descriptor.args {
            let Some(value) = call.args.get(spec.name) else {
                continue;
            };
            let value = value.to_wire();
            match spec.kind {
                ArgKind::Path => match self.check_path(&value) {
                    Ok(canonical) => {
                        if descriptor.mutates && canonical.exists() {
                            confirmations.push(format!("{} would modify existing {}", descriptor.name, value));
                        }
                    }
                    Err(reason) => return SecurityDecision::Deny(reason),
                },
                ArgKind::Command => {
                    if let Err(reason) = self.check_command(&value) {
                        return SecurityDecision::Deny(reason);
                    }
                }
                ArgKind::Text | ArgKind::List => {}
            }
        }

        if descriptor.needs_confirmation {
            confirmations.push(describe_call(call, descriptor));
        }

        if confirmations.is_empty() || !self.rules.require_confirmations {
            SecurityDecision::Allow
        } else {
            SecurityDecision::RequireConfirmation(confirmations.join("; "))
        }
    }

    /// Resolve `raw` and check it against the sandbox and the sensitive list.
    pub fn check_path(&self, raw: &str) -> Result<PathBuf, String> {
        if raw.trim().is_empty() {
            return Err("empty path".to_string());
        }
        if raw.contains('\0') {
            return Err(format!("invalid path: {}", raw.escape_default()));
        }
        let canonical = paths::canonicalize_lenient(&paths::absolutize(&self.root, raw));
        if !canonical.starts_with(&self.root) {
            return Err(format!("path escapes sandbox: {raw}"));
        }

        // Matched below the root so the workspace's own location never trips a pattern.
        let relative = canonical.strip_prefix(&self.root).unwrap_or(&canonical);
        let mut rendered = paths::display_for_matching(relative);
        if canonical.is_dir() {
            rendered.push('/');
        }
        if self.rules.sensitive.iter().any(|re| re.is_match(&rendered)) {
            return Err(format!("sensitive path: {raw}"));
        }

        if let Some(name) = paths::reserved_component(relative) {
            return Err(format!("reserved device name: {name}"));
        }
        Ok(canonical)
    }

    /// Check a command line against the block list, then the allow list.
    pub fn check_command(&self, raw: &str) -> Result<(), String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("command not permitted: empty command".to_string());
        }
        let normalized = normalize_command(trimmed);

        if let Some(pattern) = self
            .rules
            .blocked
            .iter()
            .find(|pattern| pattern.matches(trimmed, &normalized))
        {
            return Err(format!(
                "command blocked by pattern `{}`: {trimmed}",
                pattern.source()
            ));
        }
        if self.rules.allowed.iter().any(|pattern| pattern.matches(&normalized)) {
            Ok(())
        } else {
            Err(format!("command not permitted: {trimmed}"))
        }
    }
}

fn describe_call(call: &ToolCall, descriptor: &ToolDescriptor) -> String {
    let details: Vec<String> = descriptor
        .args
        .iter()
        .filter_map(|spec| {
            call.args
                .get(spec.name)
                .map(|value| format!("{}={}", spec.name, crate::utils::one_line(&value.to_wire(), 120)))
        })
        .collect();
    if details.is_empty() {
        descriptor.name.to_string()
    } else {
        format!("{} {}", descriptor.name, details.join(" "))
    }
}
