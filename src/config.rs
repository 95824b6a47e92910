use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::language::LanguageKind;
use crate::sandbox::{ExecutionIdentity, PollPolicy, ResourceLimits};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    /// Backends in the order they are tried for a language
    #[serde(default)]
    pub sandboxes: Vec<SandboxConfig>,
    #[serde(default)]
    pub poll: PollConfig,
    /// Limits used when a run does not specify its own
    #[serde(default)]
    pub defaults: ResourceLimits,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Config {
    /// Load the configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open config {}", path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.workers > 0, "workers must be at least 1");
        ensure!(self.poll.max_polls > 0, "poll.max_polls must be at least 1");
        Ok(())
    }
}

fn default_workers() -> usize {
    1
}

fn enabled() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            max_polls: 40,
        }
    }
}

impl From<PollConfig> for PollPolicy {
    fn from(poll: PollConfig) -> Self {
        PollPolicy {
            interval: Duration::from_millis(poll.interval_ms),
            max_polls: poll.max_polls,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxConfig {
    Jobe(JobeConfig),
    Process(ProcessConfig),
    Guarded(GuardedConfig),
    Vm(VmConfig),
}

impl SandboxConfig {
    pub fn enabled(&self) -> bool {
        match self {
            Self::Jobe(config) => config.enabled,
            Self::Process(config) => config.enabled,
            Self::Guarded(config) => config.enabled,
            Self::Vm(config) => config.enabled,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct JobeConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub host: String,
    pub api_key: Option<String>,
    /// Canonical language name to the server's identifier
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout() -> u64 {
    60
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ProcessConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Defaults to every known language
    pub languages: Option<Vec<LanguageKind>>,
    /// Replacement programs for the first word of run commands
    #[serde(default)]
    pub interpreters: BTreeMap<LanguageKind, String>,
    /// Overrides the global defaults; numprocs defaults to 200 here
    pub limits: Option<ResourceLimits>,
    /// OS users runs are switched to, one per worker slot
    #[serde(default)]
    pub identities: Vec<ExecutionIdentity>,
    pub work_root: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GuardedConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub wrapper: PathBuf,
    pub languages: Option<Vec<LanguageKind>>,
    pub work_root: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct VmConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub bridge: PathBuf,
    pub languages: Option<Vec<LanguageKind>>,
    pub work_root: Option<PathBuf>,
}
