use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::{ResultCode, RunParams};

/// Resource limits applied to one run of a local backend
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU seconds
    #[serde(rename = "cputime")]
    pub cputime: u32,
    /// Wall-clock seconds
    #[serde(rename = "walltime")]
    pub walltime: u32,
    /// Megabytes of address space, 0 for unlimited
    #[serde(rename = "memorylimit")]
    pub memory_mb: u32,
    /// Megabytes any single written file may reach
    #[serde(rename = "disklimit")]
    pub disk_mb: u32,
    /// Processes or threads the execution user may own
    #[serde(rename = "numprocs")]
    pub num_procs: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cputime: 3,
            walltime: 30,
            memory_mb: 64,
            disk_mb: 10,
            num_procs: 20,
        }
    }
}

impl ResourceLimits {
    /// Overlays the limits a run asked for on top of these defaults
    pub fn with_params(&self, params: &RunParams) -> Self {
        Self {
            cputime: params.cputime_limit.unwrap_or(self.cputime),
            walltime: params.wallclock_limit.unwrap_or(self.walltime),
            memory_mb: params.memory_limit_mb.unwrap_or(self.memory_mb),
            disk_mb: params.disk_limit_mb.unwrap_or(self.disk_mb),
            num_procs: params.num_procs.unwrap_or(self.num_procs),
        }
    }
}

/// OS user and group a local run is switched to before exec
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionIdentity {
    pub uid: u32,
    pub gid: u32,
}

/// Everything an execution primitive needs to run one compiled program
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub workdir: &'a Path,
    pub command: &'a [String],
    pub stdin: &'a str,
    pub limits: ResourceLimits,
    /// Paths outside the working directory the program may read
    pub readable_dirs: &'a [&'static str],
}

/// Raw outcome of one run, before language-specific filtering
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub result: ResultCode,
    pub stdout: String,
    pub stderr: String,
    pub signal: i32,
    /// Seconds
    pub time: f64,
    /// Kilobytes
    pub memory: u64,
}

impl RunOutcome {
    pub fn new(result: ResultCode) -> Self {
        Self {
            result,
            stdout: String::new(),
            stderr: String::new(),
            signal: 0,
            time: 0.0,
            memory: 0,
        }
    }
}

/// Execution primitive behind a [`super::LocalSandbox`]
///
/// The local backends differ only here: how an already compiled program is
/// started, confined and judged.
pub trait Runner: Send {
    fn name(&self) -> &'static str;

    /// Runs the command and classifies how it ended
    ///
    /// Limit violations and crashes are reported through
    /// [`RunOutcome::result`]; an `Err` means the primitive itself failed.
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome>;

    /// Limits used when a run does not specify its own
    fn default_limits(&self) -> ResourceLimits {
        ResourceLimits::default()
    }
}
