use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use super::spawn::{SpawnLimits, run_process};
use super::{ResultCode, RunOutcome, RunRequest, Runner};

/// Runs programs inside a virtual machine through a bridge program
///
/// The bridge is invoked as `bridge <workdir> <run command...>`; it copies the
/// working directory into the VM, runs the command there and relays the
/// program's output. Any stderr from the bridge means the run went wrong.
#[derive(Debug, Clone)]
pub struct VmRunner {
    bridge: PathBuf,
}

impl VmRunner {
    pub fn new(bridge: impl Into<PathBuf>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }

    fn command(&self, request: &RunRequest<'_>) -> Vec<String> {
        let mut command = Vec::with_capacity(request.command.len() + 2);
        command.push(self.bridge.to_string_lossy().into_owned());
        command.push(request.workdir.to_string_lossy().into_owned());
        command.extend(request.command.iter().cloned());
        command
    }
}

impl Runner for VmRunner {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome> {
        let command = self.command(request);
        let wall = Duration::from_secs(u64::from(request.limits.walltime.max(1)));
        let output = run_process(&command, request.workdir, request.stdin, &SpawnLimits::wall_only(wall))?;

        let result = if output.timed_out {
            ResultCode::TimeLimitExceeded
        } else if !output.stderr.trim().is_empty() {
            ResultCode::AbnormalTermination
        } else if output.exit_code != Some(0) {
            ResultCode::RuntimeError
        } else {
            ResultCode::Success
        };

        let mut outcome = RunOutcome::new(result);
        outcome.time = output.elapsed.as_secs_f64();
        outcome.signal = output.signal.unwrap_or(0);
        outcome.stdout = output.stdout;
        outcome.stderr = output.stderr;
        Ok(outcome)
    }
}
