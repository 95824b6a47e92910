use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::spawn::{SpawnLimits, run_process};
use super::{ResourceLimits, ResultCode, RunOutcome, RunRequest, Runner};

const TASK_FILE_NAME: &str = "taskDetails.json";

/// Grace period the wrapper gets on top of the program's own wall limit
const WRAPPER_GRACE: Duration = Duration::from_secs(10);

/// Delegates each run to an external syscall-filtering wrapper program
///
/// The wrapper is handed a task description file and prints a single JSON
/// verdict on its standard output.
#[derive(Debug, Clone)]
pub struct GuardedRunner {
    wrapper: PathBuf,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TaskDetails<'a> {
    cmd: &'a [String],
    input: &'a str,
    quota: Quota,
    readable_dirs: &'a [&'static str],
    workdir: &'a Path,
}

/// Milliseconds and bytes, as the wrapper expects them
#[derive(Serialize, Debug)]
struct Quota {
    wallclock: u64,
    cpu: u64,
    memory: u64,
    disk: u64,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Verdict {
    return_code: String,
    #[serde(default)]
    output: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    details: Option<VerdictDetails>,
}

#[derive(Deserialize, Debug)]
struct VerdictDetails {
    #[serde(default)]
    signal_info: Vec<i64>,
    #[serde(default)]
    elapsed: f64,
    #[serde(default)]
    mem_info: Vec<u64>,
}

impl GuardedRunner {
    pub fn new(wrapper: impl Into<PathBuf>) -> Self {
        Self {
            wrapper: wrapper.into(),
        }
    }

    fn quota(limits: &ResourceLimits) -> Quota {
        Quota {
            wallclock: 1000 * u64::from(limits.walltime),
            cpu: 1000 * u64::from(limits.cputime),
            memory: 1_000_000 * u64::from(limits.memory_mb),
            disk: 1_000_000 * u64::from(limits.disk_mb),
        }
    }
}

/// Maps the wrapper's two-letter verdicts onto result codes
fn result_from_verdict(code: &str) -> Option<ResultCode> {
    let result = match code {
        "PD" => ResultCode::SandboxPending,
        "OK" => ResultCode::Success,
        "RF" => ResultCode::IllegalSyscall,
        "RT" => ResultCode::RuntimeError,
        "TL" => ResultCode::TimeLimitExceeded,
        "ML" => ResultCode::MemoryLimitExceeded,
        "OL" => ResultCode::OutputLimitExceeded,
        "AT" => ResultCode::AbnormalTermination,
        "IE" => ResultCode::InternalError,
        "BP" => ResultCode::SandboxPolicyViolation,
        _ => return None,
    };
    Some(result)
}

impl Runner for GuardedRunner {
    fn name(&self) -> &'static str {
        "guarded"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome> {
        let task = TaskDetails {
            cmd: request.command,
            input: request.stdin,
            quota: Self::quota(&request.limits),
            readable_dirs: request.readable_dirs,
            workdir: request.workdir,
        };
        let task_path = request.workdir.join(TASK_FILE_NAME);
        fs::write(&task_path, serde_json::to_vec(&task)?)
            .with_context(|| format!("Failed to write {}", task_path.display()))?;

        let command = vec![
            self.wrapper.to_string_lossy().into_owned(),
            TASK_FILE_NAME.to_string(),
        ];
        let wall = Duration::from_secs(u64::from(request.limits.walltime)) + WRAPPER_GRACE;
        let output = run_process(&command, request.workdir, "", &SpawnLimits::wall_only(wall))?;
        if output.timed_out {
            log::error!("Sandbox wrapper {} did not finish", self.wrapper.display());
            return Ok(RunOutcome::new(ResultCode::InternalError));
        }

        let line = output.stdout.lines().next().unwrap_or_default();
        let verdict: Verdict = serde_json::from_str(line).with_context(|| {
            format!(
                "Sandbox wrapper produced no verdict (exit {:?}): {}",
                output.exit_code,
                output.stderr.trim()
            )
        })?;
        let result = result_from_verdict(&verdict.return_code)
            .ok_or_else(|| anyhow!("Unknown sandbox verdict {}", verdict.return_code))?;

        let mut outcome = RunOutcome::new(result);
        outcome.stdout = verdict.output;
        outcome.stderr = verdict.stderr;
        // An internal error leaves the details out
        if let Some(details) = verdict.details {
            outcome.signal = details.signal_info.first().copied().unwrap_or(0) as i32;
            outcome.time = details.elapsed;
            outcome.memory = details.mem_info.first().copied().unwrap_or(0);
        }
        Ok(outcome)
    }
}
