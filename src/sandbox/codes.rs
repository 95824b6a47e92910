use std::fmt;

use serde::{Deserialize, Serialize};

/// Dispatch-level error codes, as reported upward in a run result
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Ok,
    AuthError,
    SubmissionNotFound,
    UnsupportedLanguage,
    AccessDenied,
    RateLimitExceeded,
    SubmissionFailed,
    UnknownServerError,
}

/// Outcome of a completed run
///
/// The numeric values are the ones used on the wire by the remote job
/// service and by the legacy sandboxes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    NoRun,
    CompilationError,
    RuntimeError,
    TimeLimitExceeded,
    Success,
    MemoryLimitExceeded,
    IllegalSyscall,
    InternalError,
    SandboxPending,
    SandboxPolicyViolation,
    OutputLimitExceeded,
    AbnormalTermination,
}

impl ResultCode {
    pub fn code(self) -> i64 {
        match self {
            Self::NoRun => 0,
            Self::CompilationError => 11,
            Self::RuntimeError => 12,
            Self::TimeLimitExceeded => 13,
            Self::Success => 15,
            Self::MemoryLimitExceeded => 17,
            Self::IllegalSyscall => 19,
            Self::InternalError => 20,
            Self::SandboxPending => 21,
            Self::SandboxPolicyViolation => 22,
            Self::OutputLimitExceeded => 30,
            Self::AbnormalTermination => 31,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let result = match code {
            0 => Self::NoRun,
            11 => Self::CompilationError,
            12 => Self::RuntimeError,
            13 => Self::TimeLimitExceeded,
            15 => Self::Success,
            17 => Self::MemoryLimitExceeded,
            19 => Self::IllegalSyscall,
            20 => Self::InternalError,
            21 => Self::SandboxPending,
            22 => Self::SandboxPolicyViolation,
            30 => Self::OutputLimitExceeded,
            31 => Self::AbnormalTermination,
            _ => return None,
        };
        Some(result)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Text shown to students when a run did not succeed
    pub fn description(self) -> &'static str {
        match self {
            Self::NoRun => "No run",
            Self::CompilationError => "Compilation error",
            Self::RuntimeError => "Runtime error",
            Self::TimeLimitExceeded => "Time limit exceeded",
            Self::Success => "OK",
            Self::MemoryLimitExceeded => "Memory limit exceeded",
            Self::IllegalSyscall => "Illegal function call",
            Self::InternalError => "Sandbox error (IE): please tell a tutor",
            Self::SandboxPending => "Sandbox error (PD): please tell a tutor",
            Self::SandboxPolicyViolation => "Sandbox error (BP): please tell a tutor",
            Self::OutputLimitExceeded => "Excessive output",
            Self::AbnormalTermination => "Abnormal termination",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Lifecycle state of a submission
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Waiting,
    Compiling,
    Running,
    Done,
}

impl RunStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Waiting => -1,
            Self::Done => 0,
            Self::Compiling => 1,
            Self::Running => 3,
        }
    }
}
