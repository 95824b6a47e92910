use std::time::Duration;

use anyhow::Result;

use super::spawn::{SpawnLimits, run_process};
use super::{ExecutionIdentity, ResourceLimits, ResultCode, RunOutcome, RunRequest, Runner};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024;

/// Runs programs as plain child processes confined by rlimits
///
/// Memory, CPU, file size and process count limits are enforced by the
/// kernel; the wall-clock limit is enforced here by killing the child's
/// process group. There is no filesystem or syscall isolation, so unless an
/// [`ExecutionIdentity`] is configured the program runs as the grading user.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    identity: Option<ExecutionIdentity>,
    defaults: ResourceLimits,
    max_output_bytes: usize,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            identity: None,
            defaults: ResourceLimits {
                num_procs: 200,
                ..ResourceLimits::default()
            },
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches every run to the given OS user and group
    pub fn with_identity(mut self, identity: ExecutionIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_defaults(mut self, defaults: ResourceLimits) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    fn spawn_limits(&self, limits: &ResourceLimits) -> SpawnLimits {
        let megabytes = |mb: u32| (mb > 0).then(|| u64::from(mb) * 1024 * 1024);
        SpawnLimits {
            wall: Duration::from_secs(u64::from(limits.walltime.max(1))),
            cpu_secs: (limits.cputime > 0).then(|| u64::from(limits.cputime)),
            memory_bytes: megabytes(limits.memory_mb),
            file_size_bytes: megabytes(limits.disk_mb),
            num_procs: (limits.num_procs > 0).then(|| u64::from(limits.num_procs)),
            identity: self.identity,
            max_output: Some(self.max_output_bytes),
        }
    }
}

impl Runner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome> {
        let limits = self.spawn_limits(&request.limits);
        let output = run_process(request.command, request.workdir, request.stdin, &limits)?;

        let mut outcome = RunOutcome::new(ResultCode::Success);
        outcome.time = output.elapsed.as_secs_f64();

        match output.signal {
            _ if output.timed_out => {
                outcome.result = ResultCode::TimeLimitExceeded;
                outcome.signal = libc::SIGKILL;
            }
            _ if output.output_exceeded => {
                outcome.result = ResultCode::OutputLimitExceeded;
            }
            Some(libc::SIGXCPU) | Some(libc::SIGKILL) => {
                outcome.result = ResultCode::TimeLimitExceeded;
                outcome.signal = libc::SIGKILL;
            }
            Some(signal) => {
                outcome.result = ResultCode::RuntimeError;
                outcome.signal = signal;
            }
            None if output.exit_code != Some(0) => {
                outcome.result = ResultCode::RuntimeError;
            }
            None if !output.stderr.trim().is_empty() => {
                outcome.result = ResultCode::AbnormalTermination;
            }
            None => {}
        }

        log::debug!(
            "Process run of {:?} finished: {:?} in {:.3}s",
            request.command,
            outcome.result,
            outcome.time
        );

        outcome.stdout = output.stdout;
        outcome.stderr = output.stderr;
        Ok(outcome)
    }

    fn default_limits(&self) -> ResourceLimits {
        self.defaults
    }
}
