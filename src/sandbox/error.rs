use thiserror::Error;

use super::ErrorCode;

/// Fatal dispatch-level failures
///
/// Execution outcomes such as compile errors or time limits are not errors at
/// this level; they travel as [`super::ResultCode`] values inside a run result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("Unauthorised to use sandbox")]
    AuthError,

    #[error("Requesting status of non-existent job")]
    SubmissionNotFound,

    #[error("Non-existent language requested: {0}")]
    UnsupportedLanguage(String),

    #[error("Access to sandbox denied")]
    AccessDenied,

    #[error("Sandbox job quota exceeded")]
    RateLimitExceeded,

    #[error("Submission to sandbox failed: {0}")]
    SubmissionFailed(String),

    #[error("Sandbox rejected the request (HTTP 400): {0}")]
    BadRequest(String),

    #[error("Sandbox is overloaded, please try again later")]
    ServerOverload,

    #[error("Execution service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unexpected error from sandbox: {0}")]
    UnknownServerError(String),

    #[error("Execution timed out after {polls} status polls")]
    Timeout { polls: u32 },

    #[error("Submission details requested before the run finished")]
    NotDone,

    #[error("No sandbox available for language {0}")]
    NoSandboxForLanguage(String),

    #[error("Sandbox internal error: {0}")]
    Internal(String),
}

impl SandboxError {
    /// Maps the error onto the coarse error-code vocabulary of run results
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthError => ErrorCode::AuthError,
            Self::SubmissionNotFound | Self::NotDone => ErrorCode::SubmissionNotFound,
            Self::UnsupportedLanguage(_) | Self::NoSandboxForLanguage(_) => {
                ErrorCode::UnsupportedLanguage
            }
            Self::AccessDenied => ErrorCode::AccessDenied,
            Self::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            Self::SubmissionFailed(_) | Self::BadRequest(_) => ErrorCode::SubmissionFailed,
            Self::ServerOverload
            | Self::ServiceUnavailable(_)
            | Self::UnknownServerError(_)
            | Self::Timeout { .. }
            | Self::Internal(_) => ErrorCode::UnknownServerError,
        }
    }
}

impl From<anyhow::Error> for SandboxError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
