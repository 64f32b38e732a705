//! Configuration system (layered: defaults < `kiln.toml` < `KILN_*` environment).

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, Result};
use crate::permission::{self, PermissionAction, PermissionConfig, PermissionSetting, Ruleset, DOOM_LOOP};
use crate::tools::truncate::{self, TruncateOptions, Truncator};
use crate::tools::BatchTool;
use crate::turn::{RetryPolicy, TurnSettings};

/// Global default config (lazy-initialized from file and env).
static DEFAULT_CONFIG: OnceLock<KilnConfig> = OnceLock::new();

pub const CONFIG_FILE: &str = "kiln.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    pub max_lines: usize,
    pub max_bytes: usize,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            max_lines: truncate::MAX_LINES,
            max_bytes: truncate::MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_jitter_ms: policy.max_jitter.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_calls: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_calls: crate::tools::MAX_BATCH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub max_steps: usize,
    pub doom_loop_threshold: usize,
    pub context_limit: Option<u64>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        let settings = TurnSettings::default();
        Self {
            max_steps: settings.max_steps,
            doom_loop_threshold: settings.doom_loop_threshold,
            context_limit: settings.context_limit,
        }
    }
}

/// Layered configuration for kiln.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    /// Root for stored documents and truncated tool output.
    pub data_dir: PathBuf,
    pub truncation: TruncationConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub turn: TurnConfig,
    pub permission: PermissionConfig,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            data_dir: default_kiln_dir(),
            truncation: TruncationConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            turn: TurnConfig::default(),
            permission: default_permissions(),
        }
    }
}

fn default_permissions() -> PermissionConfig {
    PermissionConfig::from([
        ("*".to_string(), PermissionSetting::Action(PermissionAction::Allow)),
        (DOOM_LOOP.to_string(), PermissionSetting::Action(PermissionAction::Ask)),
    ])
}

fn default_kiln_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".kiln"))
        .unwrap_or_else(|| PathBuf::from(".kiln"))
}

impl KilnConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|err| KilnError::Configuration(err.to_string()))
    }

    /// Read `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(KilnError::Configuration(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    /// Defaults, then the config file (`KILN_CONFIG` or `~/.kiln/kiln.toml`), then env.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let path = std::env::var("KILN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_kiln_dir().join(CONFIG_FILE));
        let mut config = Self::from_file(&path)?;
        config.apply_vars(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Get (or load) the global default config.
    pub fn global() -> &'static KilnConfig {
        DEFAULT_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid kiln config, using defaults");
                Self::default()
            })
        })
    }

    /// Override fields from `KILN_*` variables supplied by `lookup`.
    pub fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("KILN_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        set_parsed(&lookup, "KILN_MAX_STEPS", &mut self.turn.max_steps)?;
        set_parsed(&lookup, "KILN_DOOM_LOOP_THRESHOLD", &mut self.turn.doom_loop_threshold)?;
        if let Some(raw) = lookup("KILN_CONTEXT_LIMIT") {
            self.turn.context_limit = Some(parse_var("KILN_CONTEXT_LIMIT", &raw)?);
        }
        set_parsed(&lookup, "KILN_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        set_parsed(&lookup, "KILN_BATCH_MAX_CALLS", &mut self.batch.max_calls)?;
        set_parsed(&lookup, "KILN_TRUNCATE_MAX_LINES", &mut self.truncation.max_lines)?;
        set_parsed(&lookup, "KILN_TRUNCATE_MAX_BYTES", &mut self.truncation.max_bytes)?;
        Ok(())
    }

    pub fn ruleset(&self) -> Ruleset {
        permission::from_config(&self.permission)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_jitter: Duration::from_millis(self.retry.max_jitter_ms),
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            max_steps: self.turn.max_steps,
            doom_loop_threshold: self.turn.doom_loop_threshold,
            context_limit: self.turn.context_limit,
            retry: self.retry_policy(),
        }
    }

    pub fn truncator(&self) -> Truncator {
        Truncator::new(&self.data_dir).with_defaults(
            TruncateOptions::builder()
                .max_lines(self.truncation.max_lines)
                .max_bytes(self.truncation.max_bytes)
                .build(),
        )
    }

    pub fn batch_tool(&self) -> BatchTool {
        BatchTool::new(self.batch.max_calls)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| KilnError::Configuration(format!("{name} has invalid value '{raw}'")))
}

fn set_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<()> {
    if let Some(raw) = lookup(name) {
        *target = parse_var(name, &raw)?;
    }
    Ok(())
}
