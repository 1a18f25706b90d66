//! Immutable rule set built once from configuration.

use regex::Regex;
use thiserror::Error;

use crate::config::SecurityConfig;

use super::matcher::{BlockPattern, CommandPattern};

/// Commands the model may run. Each entry must match the whole normalized command.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // git
    r"git (status|diff|log|branch|show|blame|rev-parse|ls-files)( .*)?",
    r"git (add|commit|checkout|switch|merge|rebase|pull|push|fetch)( .*)?",
    r"git (stash|tag|remote)( .*)?",
    r"git config --get .+",
    // python
    r"python3? .+",
    r"pip3? (install|list|show|freeze)( .*)?",
    r"pytest( .*)?",
    r"(mypy|black|ruff) .+",
    // node
    r"node .+",
    r"npm (install|test|run|start|build|ci|audit)( .*)?",
    r"npx .+",
    r"(yarn|pnpm|bun) (install|test|run|start|build)( .*)?",
    // inspection
    r"ls( .*)?",
    r"(cat|head|tail|grep|rg|find|wc|sort|uniq|diff|which) .+",
    r"echo( .*)?",
    r"pwd|whoami|date",
    // build
    r"make( .*)?",
    r"cmake .+",
    r"cargo .+",
    r"go (build|run|test|mod|get)( .*)?",
    r"docker (ps|images|build|logs)( .*)?",
];

/// Patterns that reject a command even when an allow entry matches.
pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &[
    r"rm\s+-rf\s+/",
    r"rm\s+-rf\s+\*",
    r"rm\s+-rf\s+~",
    r"rmdir\s+/s\s+",
    r"del\s+/s\s+/q",
    r"\bformat\s+[a-z]:",
    r"mkfs\.",
    r"dd\s+if=",
    r"chmod\s+(-R\s+)?777",
    r":\(\)\s*\{",
    r">\s*/dev/sd",
    r"(curl|wget).*\|\s*(ba)?sh",
    r"\beval\s+",
    r"\$\(",
    r"`",
    r";\s*rm\s+",
    r"&&\s*rm\s+",
    r"\|\s*rm\s+",
];

/// Paths that are never readable or writable, even inside the sandbox.
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    r"\.env$",
    r"\.env\.",
    r"credentials.*\.json$",
    r"secrets.*\.json$",
    r"oauth.*\.json$",
    r"\.ssh/",
    r"\.gnupg/",
    r"\.aws/",
    r"\.gcloud/",
    r"id_rsa",
    r"id_ed25519",
    r"\.pem$",
    r"\.key$",
    r"password",
    r"secret",
    r"token",
];

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid {list} pattern `{pattern}`: {source}")]
    InvalidPattern {
        list: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Compiled allow, block and sensitive lists.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub(crate) allowed: Vec<CommandPattern>,
    pub(crate) blocked: Vec<BlockPattern>,
    pub(crate) sensitive: Vec<Regex>,
    pub(crate) require_confirmations: bool,
}

impl RuleSet {
    /// Build from explicit lists.
    pub fn new<A, B, S>(
        allowed: A,
        blocked: B,
        sensitive: S,
        require_confirmations: bool,
    ) -> Result<Self, RuleError>
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        B: IntoIterator,
        B::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let allowed = allowed
            .into_iter()
            .map(|p| {
                CommandPattern::new(p.as_ref()).map_err(|source| invalid("allowed_commands", p.as_ref(), source))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let blocked = blocked
            .into_iter()
            .map(|p| {
                BlockPattern::new(p.as_ref()).map_err(|source| invalid("blocked_commands", p.as_ref(), source))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sensitive = sensitive
            .into_iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p.as_ref()))
                    .map_err(|source| invalid("sensitive_patterns", p.as_ref(), source))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            allowed,
            blocked,
            sensitive,
            require_confirmations,
        })
    }

    /// Defaults merged with the `[security]` table.
    ///
    /// `allowed_commands` replaces the default allow list. Block and sensitive
    /// entries are added to the defaults, never replacing them.
    pub fn from_config(config: &SecurityConfig) -> Result<Self, RuleError> {
        let allowed: Vec<String> = match &config.allowed_commands {
            Some(list) => list.clone(),
            None => DEFAULT_ALLOWED_COMMANDS.iter().map(|s| (*s).to_string()).collect(),
        };
        let blocked = DEFAULT_BLOCKED_COMMANDS
            .iter()
            .map(|s| (*s).to_string())
            .chain(config.blocked_commands.iter().cloned());
        let sensitive = DEFAULT_SENSITIVE_PATTERNS
            .iter()
            .map(|s| (*s).to_string())
            .chain(config.sensitive_patterns.iter().cloned());

        Self::new(allowed, blocked, sensitive, config.require_confirmations.unwrap_or(true))
    }

    #[must_use]
    pub fn require_confirmations(&self) -> bool {
        self.require_confirmations
    }

    #[must_use]
    pub fn allowed_sources(&self) -> Vec<&str> {
        self.allowed.iter().map(CommandPattern::source).collect()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default()).unwrap_or_else(|_| Self {
            allowed: Vec::new(),
            blocked: Vec::new(),
            sensitive: Vec::new(),
            require_confirmations: true,
        })
    }
}

fn invalid(list: &'static str, pattern: &str, source: regex::Error) -> RuleError {
    RuleError::InvalidPattern {
        list,
        pattern: pattern.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lists_compile() {
        let rules = RuleSet::from_config(&SecurityConfig::default()).unwrap();
        assert_eq!(rules.allowed.len(), DEFAULT_ALLOWED_COMMANDS.len());
        assert_eq!(rules.blocked.len(), DEFAULT_BLOCKED_COMMANDS.len());
        assert!(rules.require_confirmations());
    }

    #[test]
    fn config_extends_block_list_and_replaces_allow_list() {
        let config = SecurityConfig {
            allowed_commands: Some(vec!["pytest".to_string()]),
            blocked_commands: vec!["shutdown".to_string()],
            sensitive_patterns: vec![r"\.sqlite$".to_string()],
            require_confirmations: Some(false),
        };
        let rules = RuleSet::from_config(&config).unwrap();
        assert_eq!(rules.allowed_sources(), vec!["pytest"]);
        assert_eq!(rules.blocked.len(), DEFAULT_BLOCKED_COMMANDS.len() + 1);
        assert_eq!(rules.sensitive.len(), DEFAULT_SENSITIVE_PATTERNS.len() + 1);
        assert!(!rules.require_confirmations());
    }

    #[test]
    fn invalid_pattern_names_its_list() {
        let err = RuleSet::new(["git ("], Vec::<String>::new(), Vec::<String>::new(), true)
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid allowed_commands pattern `git (`"));
    }
}
