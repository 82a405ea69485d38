use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_LOCK_FILE: &str = ".runcron.lock";
pub const DEFAULT_RETRY_INTERVAL_SECS: u32 = 3600; // 1 hour
pub const DEFAULT_SIGNAL: i32 = 15; // SIGTERM
pub const DEFAULT_LIMIT_CPU_SECS: u64 = 10;
pub const DEFAULT_LIMIT_AS_BYTES: u64 = 1024 * 1024; // 1 MiB

/// Env var naming a TOML config file when `--config` is not given.
pub const CONFIG_ENV: &str = "RUNCRON_CONFIG";

/// Keys that may be overridden through `RUNCRON_*` variables.
///
/// `timeout` is excluded: `RUNCRON_TIMEOUT` is the variable exported to the
/// supervised command, which may itself be a runcron.
const ENV_KEYS: &[&str] = &[
    "file",
    "chdir",
    "tag",
    "retry_interval",
    "signal",
    "disable_process_restrictions",
    "allow_setuid_subprocess",
    "disable_signal_on_exit",
];

/// Per-job tunables (defaults < TOML file < RUNCRON_* env < CLI flags).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Lock file holding the previous exit status.
    #[serde(default = "default_file")]
    pub file: PathBuf,
    /// Directory to change into before anything else happens.
    #[serde(default)]
    pub chdir: Option<PathBuf>,
    /// Seed for `H` fields. `None` means the host name.
    #[serde(default)]
    pub tag: Option<String>,
    /// 0 derives the timeout from the schedule, negative disables it.
    #[serde(default)]
    pub timeout: i64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u32,
    /// Signal number sent to the command's process group on timeout and exit.
    #[serde(default = "default_signal")]
    pub signal: i32,
    #[serde(default)]
    pub limits: EvaluatorLimits,
    #[serde(default)]
    pub disable_process_restrictions: bool,
    #[serde(default)]
    pub allow_setuid_subprocess: bool,
    #[serde(default)]
    pub disable_signal_on_exit: bool,
}

/// Resource limits applied to the schedule evaluator subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluatorLimits {
    /// CPU seconds (soft limit; the hard limit is twice this).
    #[serde(default = "default_limit_cpu")]
    pub cpu: u64,
    /// Address space in bytes (soft limit; the hard limit is twice this).
    #[serde(default = "default_limit_as")]
    pub address_space: u64,
}

impl Default for EvaluatorLimits {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_LIMIT_CPU_SECS,
            address_space: DEFAULT_LIMIT_AS_BYTES,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file: default_file(),
            chdir: None,
            tag: None,
            timeout: 0,
            retry_interval: DEFAULT_RETRY_INTERVAL_SECS,
            signal: DEFAULT_SIGNAL,
            limits: EvaluatorLimits::default(),
            disable_process_restrictions: false,
            allow_setuid_subprocess: false,
            disable_signal_on_exit: false,
        }
    }
}

fn default_file() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_FILE)
}
fn default_retry_interval() -> u32 {
    DEFAULT_RETRY_INTERVAL_SECS
}
fn default_signal() -> i32 {
    DEFAULT_SIGNAL
}
fn default_limit_cpu() -> u64 {
    DEFAULT_LIMIT_CPU_SECS
}
fn default_limit_as() -> u64 {
    DEFAULT_LIMIT_AS_BYTES
}

/// How long the supervised command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSetting {
    /// Evaluate the schedule again at `now + delay`.
    Derive,
    /// Never arm the alarm.
    Unbounded,
    Seconds(u32),
}

/// Command-line values layered on top of file and env configuration.
///
/// Only `Some` fields (and `true` toggles) override lower layers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chdir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitOverrides>,
    #[serde(skip_serializing_if = "is_false")]
    pub disable_process_restrictions: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub allow_setuid_subprocess: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub disable_signal_on_exit: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LimitOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address_space: Option<u64>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Config {
    /// Load config layers and validate the result.
    ///
    /// Checks the file in order:
    ///   1. Explicit path argument (must exist)
    ///   2. `RUNCRON_CONFIG` (must exist)
    ///   3. no file, defaults + env + overrides only
    pub fn load(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !path.is_file() {
                return Err(CoreError::ConfigFileMissing { path });
            }
            tracing::debug!(path = %path.display(), "loading config file");
            figment = figment.merge(Toml::file(&path));
        }

        let config: Config = figment
            .merge(Env::prefixed("RUNCRON_").only(ENV_KEYS))
            .merge(Serialized::defaults(overrides))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.limits.cpu == 0 {
            return Err(CoreError::Invalid("limits.cpu must be at least 1 second".into()));
        }
        if self.limits.address_space == 0 {
            return Err(CoreError::Invalid(
                "limits.address_space must be at least 1 byte".into(),
            ));
        }
        if self.signal <= 0 {
            return Err(CoreError::Invalid(format!(
                "signal must be positive: {}",
                self.signal
            )));
        }
        if self.timeout > i64::from(u32::MAX) {
            return Err(CoreError::Invalid(format!(
                "timeout too large: {}",
                self.timeout
            )));
        }
        Ok(())
    }

    pub fn timeout_setting(&self) -> TimeoutSetting {
        match self.timeout {
            0 => TimeoutSetting::Derive,
            t if t < 0 => TimeoutSetting::Unbounded,
            // validate() caps the upper bound
            t => TimeoutSetting::Seconds(u32::try_from(t).unwrap_or(u32::MAX)),
        }
    }
}
