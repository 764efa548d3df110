//! Uniform result contract shared by every engine component.
//!
//! Components report environmental failures through [`ExecutionResult`]
//! rather than returning `Err`, so the orchestrator can always run its
//! compensating path. `Err(EngineError::InvalidArgument)` is reserved for
//! caller mistakes.

use thiserror::Error;

use crate::external::{CommandError, GitError, ReviewError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Validation failed: {message}")]
    Validation { message: String },
    #[error("`{command}` exited with {exit_code}: {stderr}")]
    Process {
        command: String,
        exit_code: i32,
        stderr: String,
    },
    #[error("All push strategies exhausted for branch '{branch}'")]
    Conflict { branch: String, attempts: usize },
    #[error("Rollback failed: {message}")]
    Rollback { message: String },
    #[error("Configuration error: {message}")]
    Configuration { message: String },
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation { message: message.into() }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        EngineError::Rollback { message: message.into() }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration { message: message.into() }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        EngineError::InvalidArgument { message: message.into() }
    }

    /// Short machine-readable kind, used in reports and review bodies
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "ValidationError",
            EngineError::Process { .. } => "ProcessError",
            EngineError::Conflict { .. } => "ConflictError",
            EngineError::Rollback { .. } => "RollbackError",
            EngineError::Configuration { .. } => "ConfigurationError",
            EngineError::InvalidArgument { .. } => "InvalidArgument",
        }
    }
}

impl From<CommandError> for EngineError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::CommandNotFound { command } => EngineError::Configuration {
                message: format!("required tool '{command}' is not installed or not on PATH"),
            },
            other => EngineError::Process {
                command: String::new(),
                exit_code: -1,
                stderr: other.to_string(),
            },
        }
    }
}

impl From<GitError> for EngineError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::CommandError { source } => source.into(),
            GitError::GitCommandFailed {
                command,
                exit_code,
                stderr,
            } => EngineError::Process {
                command,
                exit_code,
                stderr,
            },
            GitError::Conflict { command, stderr } | GitError::PushRejected { command, stderr } => {
                EngineError::Process {
                    command,
                    exit_code: 1,
                    stderr,
                }
            }
            other => EngineError::Process {
                command: "git".to_string(),
                exit_code: 1,
                stderr: other.to_string(),
            },
        }
    }
}

impl From<ReviewError> for EngineError {
    fn from(err: ReviewError) -> Self {
        match err {
            ReviewError::AuthenticationFailed => EngineError::Configuration {
                message: err.to_string(),
            },
            ReviewError::CommandError { source } => source.into(),
            other => EngineError::Process {
                command: "gh".to_string(),
                exit_code: 1,
                stderr: other.to_string(),
            },
        }
    }
}

/// `{success, message, data, error}` with a typed payload.
///
/// A failed result may still carry `data` (an escalation trace, per-file
/// restore results) so operators can see what was attempted.
#[derive(Debug, Clone)]
pub struct ExecutionResult<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub error: Option<EngineError>,
}

impl<T> ExecutionResult<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>, error: EngineError) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(error),
        }
    }

    pub fn failed_with(message: impl Into<String>, error: EngineError, data: T) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Some(data),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ExecutionResult<U> {
        ExecutionResult {
            success: self.success,
            message: self.message,
            data: self.data.map(f),
            error: self.error,
        }
    }

    /// Collapse into a plain `Result`, dropping any payload attached to a failure
    pub fn into_result(self) -> Result<T, EngineError> {
        match (self.success, self.data, self.error) {
            (true, Some(data), _) => Ok(data),
            (_, _, Some(error)) => Err(error),
            (_, _, None) => Err(EngineError::Validation { message: self.message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_result_keeps_payload() {
        let result = ExecutionResult::failed_with("nope", EngineError::validation("dirty tree"), vec![1, 2]);

        assert!(!result.is_success());
        assert_eq!(result.data(), Some(&vec![1, 2]));
        assert_eq!(result.clone().map(|v| v.len()).data, Some(2));
        assert_eq!(result.into_result(), Err(EngineError::validation("dirty tree")));
    }

    #[test]
    fn test_ok_into_result() {
        let result = ExecutionResult::ok("done", "branch");
        assert_eq!(result.into_result(), Ok("branch"));
    }

    #[test]
    fn test_git_failure_maps_to_process_error_with_stderr() {
        let err: EngineError = GitError::GitCommandFailed {
            command: "git reset --hard abc".to_string(),
            exit_code: 128,
            stderr: "fatal: ambiguous argument".to_string(),
        }
        .into();

        assert_eq!(err.kind(), "ProcessError");
        assert!(err.to_string().contains("ambiguous argument"));
    }

    #[test]
    fn test_missing_tool_and_auth_map_to_configuration_error() {
        let missing: EngineError = GitError::CommandError {
            source: CommandError::CommandNotFound { command: "git".to_string() },
        }
        .into();
        let unauthenticated: EngineError = ReviewError::AuthenticationFailed.into();

        assert_eq!(missing.kind(), "ConfigurationError");
        assert_eq!(unauthenticated.kind(), "ConfigurationError");
    }
}
