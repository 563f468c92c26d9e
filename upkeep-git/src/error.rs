//! Error type for every operation of the git layer.

use crate::classify::classify_failure;
use crate::retry::RetryableError;
use crate::runner::GitCommandFailure;
use thiserror::Error;
use upkeep_common::{ErrorCode, ErrorKind};

pub type Result<T, E = GitError> = std::result::Result<T, E>;

/// A classified failure.
///
/// `command` is already masked; `stderr` is the raw tool output and must go
/// through a `Sanitizer` before it reaches a user.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct GitError {
    pub kind: ErrorKind,
    pub message: String,
    pub command: Option<String>,
    pub stderr: String,
}

impl GitError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            command: None,
            stderr: String::new(),
        }
    }

    /// Classify a failed git invocation.
    pub fn from_failure(failure: GitCommandFailure) -> Self {
        let output = failure.output();
        Self {
            kind: classify_failure(&output),
            message: failure.summary(),
            command: Some(failure.command_line()),
            stderr: output,
        }
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        let message = format!("{context}: {err}");
        Self {
            kind: classify_failure(&message),
            message,
            command: None,
            stderr: String::new(),
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Message plus raw output, the text the classification tables look at.
    pub fn full_text(&self) -> String {
        if self.stderr.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n{}", self.message, self.stderr)
        }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.message.contains(needle) || self.stderr.contains(needle)
    }

    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }

    /// Failures caused by the forge or the transport rather than by the
    /// repository contents.
    pub fn is_platform_failure(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ExternalHost | ErrorKind::ConfigValidation | ErrorKind::AuthenticationFailed
        )
    }
}

impl RetryableError for GitError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(stderr: &str) -> GitCommandFailure {
        GitCommandFailure {
            args: vec!["fetch".into(), "--prune".into(), "origin".into()],
            exit_code: Some(128),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_from_failure_classifies_stderr() {
        let err = GitError::from_failure(failure("fatal: Could not resolve host: github.com"));
        assert_eq!(err.kind, ErrorKind::ExternalHost);
        assert!(err.is_retryable());
        assert_eq!(err.command.as_deref(), Some("git fetch --prune origin"));
    }

    #[test]
    fn test_unmatched_output_is_unclassified() {
        let err = GitError::from_failure(failure("error: something odd"));
        assert_eq!(err.kind, ErrorKind::Unclassified);
        assert!(!err.is_retryable());
        assert!(!err.is_platform_failure());
        assert!(err.contains("something odd"));
    }

    #[test]
    fn test_display_includes_kind() {
        let err = GitError::new(ErrorKind::RepositoryEmpty, "no commits");
        assert_eq!(err.to_string(), "empty: no commits");
        assert_eq!(err.code(), ErrorCode::RepositoryEmpty);
    }
}
