//! Global configuration parsing, validation, and spawn parameter assembly.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::acp::spawner::SpawnConfig;
use crate::{AppError, Result};

/// Environment variable overriding the agent command line.
pub const AGENT_COMMAND_ENV: &str = "COPILOT_COMMAND";

/// Agent binary used when neither the config nor the environment names one.
pub const DEFAULT_AGENT_COMMAND: &str = "copilot";

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3000
}

fn default_agent_args() -> Vec<String> {
    vec!["--acp".into(), "--stdio".into()]
}

fn default_cwd() -> PathBuf {
    PathBuf::from(".")
}

fn default_token_ttl_seconds() -> u64 {
    300
}

fn default_kill_grace_ms() -> u64 {
    2000
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the HTTP server binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Agent binary; when unset, [`AGENT_COMMAND_ENV`] may supply it.
    #[serde(default)]
    pub agent_command: Option<String>,
    /// Agent arguments.
    #[serde(default = "default_agent_args")]
    pub agent_args: Vec<String>,
    /// Default working directory for agent processes.
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,
    /// Environment variables set for the agent on top of the inherited ones.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Skill/plugin directories, each passed as `--add-dir <dir>`.
    #[serde(default)]
    pub skill_dirs: Vec<PathBuf>,
    /// Lifetime of an unconsumed session token.
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
    /// Grace period between terminate and kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            agent_command: None,
            agent_args: default_agent_args(),
            cwd: default_cwd(),
            env: HashMap::new(),
            skill_dirs: Vec::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validated defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the process working directory cannot
    /// be resolved.
    pub fn with_defaults() -> Result<Self> {
        let mut config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Replace the working directory, canonicalising it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `cwd` does not exist.
    pub fn set_cwd(&mut self, cwd: &Path) -> Result<()> {
        self.cwd = canonical_dir(cwd, "cwd")?;
        Ok(())
    }

    /// `host:port` for the listener.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Token lifetime.
    #[must_use]
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    /// Terminate → kill grace period.
    #[must_use]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Agent command and arguments.
    ///
    /// When `agent_command` is unset and `env_override` is present, the
    /// override is split on whitespace: its first word becomes the command
    /// and the remaining words are prepended to `agent_args`.
    #[must_use]
    pub fn resolve_command(&self, env_override: Option<&str>) -> (String, Vec<String>) {
        if let Some(command) = &self.agent_command {
            return (command.clone(), self.agent_args.clone());
        }

        let mut words = env_override.unwrap_or_default().split_whitespace();
        match words.next() {
            Some(command) => {
                let args = words
                    .map(str::to_owned)
                    .chain(self.agent_args.iter().cloned())
                    .collect();
                (command.to_owned(), args)
            }
            None => (DEFAULT_AGENT_COMMAND.to_owned(), self.agent_args.clone()),
        }
    }

    /// Spawn parameters for the bridge, reading [`AGENT_COMMAND_ENV`].
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        let env_override = env::var(AGENT_COMMAND_ENV).ok();
        let (command, mut args) = self.resolve_command(env_override.as_deref());
        for dir in &self.skill_dirs {
            args.push("--add-dir".into());
            args.push(dir.display().to_string());
        }

        let mut spawn = SpawnConfig::new(command, args, self.cwd.clone());
        spawn.env = self.env.clone();
        spawn.kill_grace = self.kill_grace();
        spawn
    }

    fn validate(&mut self) -> Result<()> {
        if self.token_ttl_seconds == 0 {
            return Err(AppError::Config(
                "token_ttl_seconds must be greater than zero".into(),
            ));
        }

        if self
            .agent_command
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
        {
            return Err(AppError::Config("agent_command must not be empty".into()));
        }

        self.cwd = canonical_dir(&self.cwd, "cwd")?;

        self.skill_dirs = std::mem::take(&mut self.skill_dirs)
            .into_iter()
            .filter_map(|dir| match dir.canonicalize() {
                Ok(path) if path.is_dir() => Some(path),
                _ => {
                    warn!(dir = %dir.display(), "skill directory not found, skipping");
                    None
                }
            })
            .collect();

        Ok(())
    }
}

fn canonical_dir(path: &Path, field: &str) -> Result<PathBuf> {
    let canonical = path
        .canonicalize()
        .map_err(|err| AppError::Config(format!("{field} invalid: {err}")))?;
    if !canonical.is_dir() {
        return Err(AppError::Config(format!(
            "{field} is not a directory: {}",
            canonical.display()
        )));
    }
    Ok(canonical)
}
