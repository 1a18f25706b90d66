//! Command matching helpers for the allow and block lists.

use regex::Regex;

/// Normalize a command string by shlex parsing and re-joining tokens.
pub fn normalize_command(command: &str) -> String {
    if let Some(tokens) = shlex::split(command) {
        tokens.join(" ")
    } else {
        command.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// An allow-list entry. The pattern must match the whole normalized command.
#[derive(Debug, Clone)]
pub struct CommandPattern {
    source: String,
    regex: Regex,
}

impl CommandPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?i)^(?:{pattern})$"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the pattern covers all of `normalized`.
    #[must_use]
    pub fn matches(&self, normalized: &str) -> bool {
        self.regex.is_match(normalized)
    }
}

/// A block-list entry. Matches anywhere in the raw or the normalized command.
#[derive(Debug, Clone)]
pub struct BlockPattern {
    source: String,
    regex: Regex,
}

impl BlockPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = Regex::new(&format!("(?i){pattern}"))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn matches(&self, raw: &str, normalized: &str) -> bool {
        self.regex.is_match(raw) || self.regex.is_match(normalized)
    }
}
