mod codes;
mod dispatch;
mod error;
mod guarded_runner;
mod jobe;
mod local;
mod process_runner;
mod runner;
pub(crate) mod spawn;
mod transport;
mod vm_runner;

pub use codes::{ErrorCode, ResultCode, RunStatus};
pub use dispatch::{Dispatcher, SandboxProvider, create_sandbox};
pub use error::SandboxError;
pub use guarded_runner::GuardedRunner;
pub use jobe::{JobeOptions, JobeSandbox, content_hash, strip_run_paths};
pub use local::{LocalSandbox, default_work_root};
pub use process_runner::ProcessRunner;
pub use runner::{ExecutionIdentity, ResourceLimits, RunOutcome, RunRequest, Runner};
pub use transport::{HttpMethod, HttpResponse, HttpTransport, ReqwestTransport};
pub use vm_runner::VmRunner;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Per-run execution limits and options
///
/// Field names follow the parameter vocabulary of the remote job service so
/// the struct can be forwarded verbatim as the `parameters` object of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RunParams {
    /// CPU seconds
    #[serde(rename = "cputime", default, skip_serializing_if = "Option::is_none")]
    pub cputime_limit: Option<u32>,
    #[serde(rename = "memorylimit", default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_mb: Option<u32>,
    /// Wall-clock seconds
    #[serde(rename = "walltime", default, skip_serializing_if = "Option::is_none")]
    pub wallclock_limit: Option<u32>,
    #[serde(rename = "disklimit", default, skip_serializing_if = "Option::is_none")]
    pub disk_limit_mb: Option<u32>,
    #[serde(rename = "numprocs", default, skip_serializing_if = "Option::is_none")]
    pub num_procs: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
    #[serde(rename = "sourcefilename", default, skip_serializing_if = "Option::is_none")]
    pub source_file_name: Option<String>,
    /// Backend-specific parameters passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Immutable description of one execution request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RunSpec {
    pub source_code: String,
    pub language: String,
    pub stdin: String,
    /// Runtime data files, keyed by file name
    pub files: BTreeMap<String, Vec<u8>>,
    pub params: RunParams,
}

impl RunSpec {
    pub fn new(source_code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language: language.into(),
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(name.into(), contents.into());
        self
    }

    pub fn with_params(mut self, params: RunParams) -> Self {
        self.params = params;
        self
    }

    /// Canonical (lower-case) language identifier
    pub fn language_id(&self) -> String {
        self.language.to_lowercase()
    }

    /// Standard input with a trailing newline forced on when non-empty
    pub fn normalized_stdin(&self) -> String {
        if self.stdin.is_empty() || self.stdin.ends_with('\n') {
            self.stdin.clone()
        } else {
            format!("{}\n", self.stdin)
        }
    }
}

/// Opaque token identifying the single in-flight submission of a backend
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubmissionHandle(String);

impl SubmissionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubmissionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionStatus {
    pub status: RunStatus,
    /// Only meaningful once `status` is [`RunStatus::Done`]
    pub result: Option<ResultCode>,
}

impl SubmissionStatus {
    pub fn done(result: ResultCode) -> Self {
        Self {
            status: RunStatus::Done,
            result: Some(result),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == RunStatus::Done
    }
}

/// Selects which optional fields a details request fills in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetailFlags {
    pub with_source: bool,
    pub with_input: bool,
    pub with_output: bool,
    pub with_stderr: bool,
    pub with_compile_info: bool,
}

impl Default for DetailFlags {
    fn default() -> Self {
        Self {
            with_source: false,
            with_input: false,
            with_output: true,
            with_stderr: true,
            with_compile_info: true,
        }
    }
}

impl DetailFlags {
    pub fn all() -> Self {
        Self {
            with_source: true,
            with_input: true,
            ..Self::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SubmissionDetails {
    pub result: Option<ResultCode>,
    pub language: String,
    pub language_version: Option<String>,
    /// Seconds
    pub time: f64,
    /// Kilobytes
    pub memory_used: u64,
    pub signal: i32,
    pub date: String,
    pub source: Option<String>,
    pub input: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_info: Option<String>,
}

/// Result of a completed `execute` call, as handed to the graders
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunResult {
    pub result: ResultCode,
    pub stdout: String,
    pub stderr: String,
    pub compile_info: String,
    pub signal: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_info: Option<Value>,
}

impl RunResult {
    pub fn new(result: ResultCode, stdout: impl Into<String>) -> Self {
        Self {
            result,
            stdout: stdout.into(),
            stderr: String::new(),
            compile_info: String::new(),
            signal: 0,
            sandbox_info: None,
        }
    }
}

/// Builds the JSON run-result document exposed to callers outside the core
pub fn run_report(outcome: &Result<RunResult, SandboxError>) -> Value {
    match outcome {
        Ok(run) => json!({
            "error": ErrorCode::Ok,
            "result": run.result,
            "result_code": run.result.code(),
            "stdout": run.stdout,
            "stderr": run.stderr,
            "cmpinfo": run.compile_info,
            "signal": run.signal,
        }),
        Err(err) => json!({
            "error": err.code(),
            "message": err.to_string(),
        }),
    }
}

/// Fixed polling configuration used by [`Sandbox::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_polls: 40,
        }
    }
}

/// Contract shared by every execution backend
///
/// A backend instance tracks exactly one live submission at a time and is
/// meant to serve the test cases of a single student submission, strictly
/// sequentially, before being closed or dropped.
pub trait Sandbox: Send {
    /// Short name of the backend, used in logs and error messages
    fn name(&self) -> &str;

    /// Canonical identifiers of the languages this instance supports
    ///
    /// Idempotent for the lifetime of the instance.
    fn languages(&self) -> Result<&BTreeSet<String>, SandboxError>;

    fn supports(&self, language: &str) -> Result<bool, SandboxError> {
        let language = language.to_lowercase();
        Ok(self
            .languages()?
            .iter()
            .any(|lang| lang.to_lowercase() == language))
    }

    /// Starts running a submission, replacing any previously tracked one
    fn create_submission(&mut self, spec: &RunSpec) -> Result<SubmissionHandle, SandboxError>;

    fn submission_status(
        &mut self,
        handle: &SubmissionHandle,
    ) -> Result<SubmissionStatus, SandboxError>;

    /// Fails with [`SandboxError::NotDone`] unless the submission is done
    fn submission_details(
        &mut self,
        handle: &SubmissionHandle,
        flags: DetailFlags,
    ) -> Result<SubmissionDetails, SandboxError>;

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }

    /// Extra information about where the last run went, if any
    fn sandbox_info(&self) -> Option<Value> {
        None
    }

    /// Submits, polls until done or the poll budget is spent, then fetches
    fn execute(&mut self, spec: &RunSpec) -> Result<RunResult, SandboxError> {
        let handle = self.create_submission(spec)?;
        let policy = self.poll_policy();

        let mut state = self.submission_status(&handle)?;
        let mut polls = 0;
        while !state.is_done() {
            if polls >= policy.max_polls {
                log::error!(
                    "Sandbox {} timed out waiting for submission {handle} after {polls} polls",
                    self.name()
                );
                return Err(SandboxError::Timeout { polls });
            }
            polls += 1;
            std::thread::sleep(policy.interval);
            state = self.submission_status(&handle)?;
        }

        let details = self.submission_details(&handle, DetailFlags::default())?;
        let result = state
            .result
            .or(details.result)
            .ok_or_else(|| SandboxError::UnknownServerError("run finished without a result".into()))?;

        Ok(RunResult {
            result,
            stdout: details.stdout.unwrap_or_default(),
            stderr: details.stderr.unwrap_or_default(),
            compile_info: details.compile_info.unwrap_or_default(),
            signal: details.signal,
            sandbox_info: self.sandbox_info(),
        })
    }

    /// Releases cached artifacts and working directories
    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// A backend whose submissions never leave the running state
    struct StuckSandbox {
        languages: BTreeSet<String>,
        status_calls: u32,
        policy: PollPolicy,
    }

    impl StuckSandbox {
        fn new(max_polls: u32) -> Self {
            Self {
                languages: BTreeSet::from(["python3".to_string()]),
                status_calls: 0,
                policy: PollPolicy {
                    interval: Duration::ZERO,
                    max_polls,
                },
            }
        }
    }

    impl Sandbox for StuckSandbox {
        fn name(&self) -> &str {
            "stuck"
        }

        fn languages(&self) -> Result<&BTreeSet<String>, SandboxError> {
            Ok(&self.languages)
        }

        fn create_submission(&mut self, _spec: &RunSpec) -> Result<SubmissionHandle, SandboxError> {
            Ok(SubmissionHandle::new("1"))
        }

        fn submission_status(
            &mut self,
            _handle: &SubmissionHandle,
        ) -> Result<SubmissionStatus, SandboxError> {
            self.status_calls += 1;
            Ok(SubmissionStatus {
                status: RunStatus::Running,
                result: None,
            })
        }

        fn submission_details(
            &mut self,
            _handle: &SubmissionHandle,
            _flags: DetailFlags,
        ) -> Result<SubmissionDetails, SandboxError> {
            Err(SandboxError::NotDone)
        }

        fn poll_policy(&self) -> PollPolicy {
            self.policy
        }
    }

    #[test]
    fn test_execute_times_out_after_poll_ceiling() {
        let mut sandbox = StuckSandbox::new(5);
        let result = sandbox.execute(&RunSpec::new("print(1)", "python3"));

        assert_eq!(result, Err(SandboxError::Timeout { polls: 5 }));
        // One initial status check plus one per poll
        assert_eq!(sandbox.status_calls, 6);
    }

    #[test]
    fn test_supports_is_case_insensitive() {
        let sandbox = StuckSandbox::new(1);
        assert!(sandbox.supports("Python3").unwrap());
        assert!(!sandbox.supports("java").unwrap());
    }

    #[test]
    fn test_stdin_gets_trailing_newline() {
        let spec = RunSpec::new("", "c").with_stdin("42");
        assert_eq!(spec.normalized_stdin(), "42\n");
        assert_eq!(RunSpec::new("", "c").normalized_stdin(), "");
        assert_eq!(RunSpec::new("", "c").with_stdin("1\n").normalized_stdin(), "1\n");
    }

    #[test]
    fn test_run_params_serialize_with_service_names() {
        let params = RunParams {
            cputime_limit: Some(5),
            memory_limit_mb: Some(200),
            source_file_name: Some("Main.java".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&params).unwrap(),
            json!({"cputime": 5, "memorylimit": 200, "sourcefilename": "Main.java"})
        );
    }

    #[test]
    fn test_run_report_for_fatal_error() {
        let report = run_report(&Err(SandboxError::UnsupportedLanguage("cobol".into())));
        assert_eq!(report["error"], json!("unsupported_language"));
    }
}
