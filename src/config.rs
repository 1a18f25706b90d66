//! Configuration loading and defaults for agentic-cli.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::approval::ApprovalMode;
use crate::core::engine::{DEFAULT_MAX_ITERATIONS, EngineConfig};
use crate::core::governor::{Credential, GovernorConfig};
use crate::core::spawn::SpawnConfig;
use crate::security::RuleSet;
use crate::tools::swarm::DEFAULT_MAX_QUERIES;

pub const CONFIG_ENV: &str = "AGENTIC_CONFIG_PATH";
pub const DEFAULT_MODEL_COMMAND: &str = "gemini-account.sh";
pub const DEFAULT_ACCOUNTS: &[&str] = &["1", "2"];
const STATE_DIR_NAME: &str = ".agentic";
const MAX_ITERATIONS_CEILING: u32 = 100;

// === Types ===

/// How the model program is launched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    pub command: Option<String>,
    /// Arguments; `{account}` and `{prompt}` are substituted per call.
    pub args: Option<Vec<String>>,
    pub accounts: Option<Vec<String>>,
}

/// Sliding-window limits and circuit breaker settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateConfig {
    pub window_secs: Option<u64>,
    pub window_limit: Option<u32>,
    pub soft_ratio: Option<f64>,
    pub failure_threshold: Option<u32>,
    pub failure_window_secs: Option<u64>,
    pub cooldown_secs: Option<u64>,
}

/// `[security]` table. Lists extend the built-in rules except
/// `allowed_commands`, which replaces them when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    pub allowed_commands: Option<Vec<String>>,
    #[serde(default)]
    pub blocked_commands: Vec<String>,
    #[serde(default)]
    pub sensitive_patterns: Vec<String>,
    pub require_confirmations: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnSection {
    pub max_concurrency: Option<usize>,
    pub job_timeout_secs: Option<u64>,
    pub max_queries: Option<usize>,
}

/// Resolved CLI configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub workspace: Option<String>,
    pub state_dir: Option<String>,
    pub approval_policy: Option<String>,
    pub max_iterations: Option<u32>,
    pub history_window: Option<usize>,
    pub model_timeout_secs: Option<u64>,
    pub tool_timeout_secs: Option<u64>,
    pub turn_timeout_secs: Option<u64>,
    pub model: Option<ModelConfig>,
    pub rate: Option<RateConfig>,
    pub security: Option<SecurityConfig>,
    pub spawn: Option<SpawnSection>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::parse(&contents, profile)
                    .with_context(|| format!("Failed to load config file: {}", path.display()))?
            }
            _ => {
                if profile.is_some() {
                    anyhow::bail!("Profile requested but no config file was found");
                }
                Config::default()
            }
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text and apply `profile`, without touching the environment.
    pub fn parse(contents: &str, profile: Option<&str>) -> Result<Self> {
        let parsed: ConfigFile = toml::from_str(contents).context("Failed to parse config")?;
        apply_profile(parsed, profile)
    }

    /// Validate ranges and enumerations.
    pub fn validate(&self) -> Result<()> {
        if let Some(policy) = self.approval_policy.as_deref()
            && let Err(err) = policy.parse::<ApprovalMode>()
        {
            anyhow::bail!("Invalid approval_policy: {err}");
        }
        if let Some(max) = self.max_iterations
            && !(1..=MAX_ITERATIONS_CEILING).contains(&max)
        {
            anyhow::bail!("max_iterations must be between 1 and {MAX_ITERATIONS_CEILING}, got {max}");
        }
        for (name, value) in [
            ("model_timeout_secs", self.model_timeout_secs),
            ("tool_timeout_secs", self.tool_timeout_secs),
            ("turn_timeout_secs", self.turn_timeout_secs),
        ] {
            if value == Some(0) {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if let Some(model) = &self.model {
            if let Some(command) = model.command.as_deref()
                && command.trim().is_empty()
            {
                anyhow::bail!("model.command cannot be empty string");
            }
            if let Some(accounts) = &model.accounts {
                if accounts.is_empty() {
                    anyhow::bail!("model.accounts must list at least one account");
                }
                if accounts.iter().any(|account| account.trim().is_empty()) {
                    anyhow::bail!("model.accounts cannot contain empty entries");
                }
            }
        }
        if let Some(rate) = &self.rate {
            if rate.window_limit == Some(0) {
                anyhow::bail!("rate.window_limit must be greater than zero");
            }
            if rate.window_secs == Some(0) {
                anyhow::bail!("rate.window_secs must be greater than zero");
            }
            if let Some(ratio) = rate.soft_ratio
                && !(ratio > 0.0 && ratio <= 1.0)
            {
                anyhow::bail!("rate.soft_ratio must be in (0, 1], got {ratio}");
            }
            if rate.failure_threshold == Some(0) {
                anyhow::bail!("rate.failure_threshold must be greater than zero");
            }
        }
        if let Some(spawn) = &self.spawn {
            if spawn.max_concurrency == Some(0) {
                anyhow::bail!("spawn.max_concurrency must be greater than zero");
            }
            if spawn.max_queries == Some(0) {
                anyhow::bail!("spawn.max_queries must be greater than zero");
            }
            if spawn.job_timeout_secs == Some(0) {
                anyhow::bail!("spawn.job_timeout_secs must be greater than zero");
            }
        }
        Ok(())
    }

    // === Resolved values ===

    /// Sandbox root: configured workspace or the current directory.
    pub fn workspace(&self) -> Result<PathBuf> {
        let raw = match self.workspace.as_deref() {
            Some(path) => expand_path(path),
            None => std::env::current_dir().context("Failed to resolve current directory")?,
        };
        raw.canonicalize()
            .with_context(|| format!("Workspace does not exist: {}", raw.display()))
    }

    /// Where session files live; defaults to `.agentic` inside the workspace.
    #[must_use]
    pub fn state_dir(&self, workspace: &Path) -> PathBuf {
        self.state_dir
            .as_deref()
            .map_or_else(|| workspace.join(STATE_DIR_NAME), expand_path)
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_policy
            .as_deref()
            .and_then(|policy| policy.parse().ok())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn model_command(&self) -> (String, Vec<String>) {
        let model = self.model.clone().unwrap_or_default();
        let command = model
            .command
            .map_or_else(|| DEFAULT_MODEL_COMMAND.to_string(), |c| expand_path(&c).display().to_string());
        let args = model.args.unwrap_or_else(|| vec!["{account}".to_string()]);
        (command, args)
    }

    #[must_use]
    pub fn credentials(&self) -> Vec<Credential> {
        match self.model.as_ref().and_then(|model| model.accounts.as_ref()) {
            Some(accounts) => accounts.iter().map(|id| Credential::new(id.trim())).collect(),
            None => DEFAULT_ACCOUNTS.iter().map(|id| Credential::new(*id)).collect(),
        }
    }

    #[must_use]
    pub fn governor_config(&self) -> GovernorConfig {
        let defaults = GovernorConfig::default();
        let Some(rate) = &self.rate else {
            return defaults;
        };
        GovernorConfig {
            window: rate.window_secs.map_or(defaults.window, Duration::from_secs),
            window_limit: rate.window_limit.unwrap_or(defaults.window_limit),
            soft_ratio: rate.soft_ratio.unwrap_or(defaults.soft_ratio),
            failure_threshold: rate.failure_threshold.unwrap_or(defaults.failure_threshold),
            failure_window: rate
                .failure_window_secs
                .map_or(defaults.failure_window, Duration::from_secs),
            cooldown: rate.cooldown_secs.map_or(defaults.cooldown, Duration::from_secs),
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_iterations: self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
            history_window: self.history_window.unwrap_or(defaults.history_window),
            model_timeout: self
                .model_timeout_secs
                .map_or(defaults.model_timeout, Duration::from_secs),
            tool_timeout: self
                .tool_timeout_secs
                .map_or(defaults.tool_timeout, Duration::from_secs),
            turn_timeout: self.turn_timeout_secs.map(Duration::from_secs),
            approval_mode: self.approval_mode(),
            ..defaults
        }
    }

    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        let defaults = SpawnConfig::default();
        let Some(spawn) = &self.spawn else {
            return defaults;
        };
        SpawnConfig {
            max_concurrency: spawn.max_concurrency,
            job_timeout: spawn
                .job_timeout_secs
                .map_or(defaults.job_timeout, Duration::from_secs),
            ..defaults
        }
    }

    #[must_use]
    pub fn max_queries(&self) -> usize {
        self.spawn
            .as_ref()
            .and_then(|spawn| spawn.max_queries)
            .unwrap_or(DEFAULT_MAX_QUERIES)
    }

    pub fn rule_set(&self) -> Result<RuleSet> {
        let security = self.security.clone().unwrap_or_default();
        RuleSet::from_config(&security).context("Invalid [security] configuration")
    }
}

// === Paths ===

fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.map(|p| expand_path(&p.to_string_lossy()))
        .or_else(env_config_path)
        .or_else(home_config_path)
}

fn env_config_path() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| expand_path(&value))
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(STATE_DIR_NAME).join("config.toml"))
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment Overrides ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("AGENTIC_WORKSPACE") {
        config.workspace = Some(value);
    }
    if let Ok(value) = std::env::var("AGENTIC_STATE_DIR") {
        config.state_dir = Some(value);
    }
    if let Ok(value) = std::env::var("AGENTIC_MODEL_COMMAND") {
        config.model.get_or_insert_with(ModelConfig::default).command = Some(value);
    }
    if let Ok(value) = std::env::var("AGENTIC_ACCOUNTS") {
        let accounts = value
            .split(',')
            .map(str::trim)
            .filter(|account| !account.is_empty())
            .map(str::to_string)
            .collect();
        config.model.get_or_insert_with(ModelConfig::default).accounts = Some(accounts);
    }
    if let Ok(value) = std::env::var("AGENTIC_MAX_ITERATIONS")
        && let Ok(parsed) = value.parse::<u32>()
    {
        config.max_iterations = Some(parsed.clamp(1, MAX_ITERATIONS_CEILING));
    }
    if let Ok(value) = std::env::var("AGENTIC_APPROVAL_POLICY") {
        config.approval_policy = Some(value);
    }
}

// === Profiles ===

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

/// Field-wise override; a section present in the profile replaces the base's
/// section wholesale.
fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        workspace: override_cfg.workspace.or(base.workspace),
        state_dir: override_cfg.state_dir.or(base.state_dir),
        approval_policy: override_cfg.approval_policy.or(base.approval_policy),
        max_iterations: override_cfg.max_iterations.or(base.max_iterations),
        history_window: override_cfg.history_window.or(base.history_window),
        model_timeout_secs: override_cfg.model_timeout_secs.or(base.model_timeout_secs),
        tool_timeout_secs: override_cfg.tool_timeout_secs.or(base.tool_timeout_secs),
        turn_timeout_secs: override_cfg.turn_timeout_secs.or(base.turn_timeout_secs),
        model: override_cfg.model.or(base.model),
        rate: override_cfg.rate.or(base.rate),
        security: override_cfg.security.or(base.security),
        spawn: override_cfg.spawn.or(base.spawn),
    }
}
