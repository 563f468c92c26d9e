//! Tagged failure taxonomy shared by the git layer and the branch processor.

use super::catalog::ErrorCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What went wrong, independent of which git command or collaborator
/// reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Remote host failure; the only kind the retry wrapper retries.
    ExternalHost,
    RepositoryEmpty,
    RepositoryChanged,
    RepositoryDisabled,
    InsufficientDiskSpace,
    InvalidPath,
    /// `TEMPORARY_ERROR`: abort the run, try again next time.
    Transient,
    ConfigValidation,
    AuthenticationFailed,
    /// Artifact generation failed for a release too young to trust.
    LockfileError,
    Unclassified,
}

impl ErrorKind {
    /// Retried by the retry wrapper.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalHost)
    }

    /// Aborts every remaining branch of the current repository run.
    #[must_use]
    pub const fn is_repository_fatal(&self) -> bool {
        matches!(
            self,
            Self::RepositoryEmpty
                | Self::RepositoryChanged
                | Self::RepositoryDisabled
                | Self::InsufficientDiskSpace
                | Self::InvalidPath
                | Self::Transient
        )
    }

    /// Propagates past the per-branch error boundary instead of becoming an
    /// `error` outcome.
    #[must_use]
    pub const fn escapes_branch(&self) -> bool {
        self.is_repository_fatal()
            || matches!(
                self,
                Self::ExternalHost
                    | Self::AuthenticationFailed
                    | Self::LockfileError
                    | Self::ConfigValidation
            )
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::ExternalHost => ErrorCode::TransportExternalHost,
            Self::RepositoryEmpty => ErrorCode::RepositoryEmpty,
            Self::RepositoryChanged => ErrorCode::RepositoryChanged,
            Self::RepositoryDisabled => ErrorCode::RepositoryDisabled,
            Self::InsufficientDiskSpace => ErrorCode::InternalInsufficientDiskSpace,
            Self::InvalidPath => ErrorCode::RepositoryInvalidPath,
            Self::Transient => ErrorCode::TransportTemporary,
            Self::ConfigValidation => ErrorCode::ConfigValidationError,
            Self::AuthenticationFailed => ErrorCode::TransportAuthFailed,
            Self::LockfileError => ErrorCode::BranchLockfileError,
            Self::Unclassified => ErrorCode::InternalUnclassified,
        }
    }

    /// The sentinel string used in run summaries and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalHost => "external-host-error",
            Self::RepositoryEmpty => "empty",
            Self::RepositoryChanged => "repository-changed",
            Self::RepositoryDisabled => "disabled",
            Self::InsufficientDiskSpace => "disk-space",
            Self::InvalidPath => "invalid-path",
            Self::Transient => "temporary-error",
            Self::ConfigValidation => "config-validation",
            Self::AuthenticationFailed => "authentication-error",
            Self::LockfileError => "lockfile-error",
            Self::Unclassified => "unknown-error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_external_host_is_retryable() {
        let retryable: Vec<_> = [
            ErrorKind::ExternalHost,
            ErrorKind::RepositoryEmpty,
            ErrorKind::Transient,
            ErrorKind::Unclassified,
            ErrorKind::AuthenticationFailed,
        ]
        .into_iter()
        .filter(ErrorKind::is_retryable)
        .collect();
        assert_eq!(retryable, vec![ErrorKind::ExternalHost]);
    }

    #[test]
    fn test_sentinels_are_repository_fatal() {
        assert!(ErrorKind::RepositoryEmpty.is_repository_fatal());
        assert!(ErrorKind::RepositoryChanged.is_repository_fatal());
        assert!(ErrorKind::InsufficientDiskSpace.is_repository_fatal());
        assert!(!ErrorKind::ExternalHost.is_repository_fatal());
        assert!(!ErrorKind::Unclassified.is_repository_fatal());
    }

    #[test]
    fn test_escapes_branch() {
        assert!(ErrorKind::ExternalHost.escapes_branch());
        assert!(ErrorKind::LockfileError.escapes_branch());
        assert!(!ErrorKind::Unclassified.escapes_branch());
    }

    #[test]
    fn test_kind_maps_to_code() {
        assert_eq!(
            ErrorKind::RepositoryChanged.code().code_string(),
            "UPK-E101"
        );
        assert_eq!(ErrorKind::Unclassified.code().code_string(), "UPK-E501");
    }
}
