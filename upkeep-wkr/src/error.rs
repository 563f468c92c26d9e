//! Errors raised while processing a branch.

use crate::ports::PortError;
use crate::tasks::TemplateError;
use thiserror::Error;
use upkeep_common::{ErrorCode, ErrorKind};
use upkeep_git::GitError;

pub type Result<T, E = WorkerError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Port(#[from] PortError),

    /// Artifact generation failed for a release that may not be fully
    /// published yet.
    #[error("lockfile-error: artifact update failed for a recent release of {dep_names}")]
    Lockfile { dep_names: String },

    #[error("invalid branch configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl WorkerError {
    pub fn io(context: &str, source: std::io::Error) -> Self {
        Self::Io {
            context: context.to_string(),
            source,
        }
    }

    /// Error of a given kind, used when the processor reclassifies a failure.
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Git(GitError::new(kind, message))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Git(err) => err.kind,
            Self::Port(err) => err.kind,
            Self::Lockfile { .. } => ErrorKind::LockfileError,
            Self::InvalidConfig(_) => ErrorKind::ConfigValidation,
            Self::Template(_) | Self::Io { .. } => ErrorKind::Unclassified,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Template(_) => ErrorCode::TaskTemplateError,
            _ => self.kind().code(),
        }
    }

    /// Message plus any raw tool output.
    pub fn full_text(&self) -> String {
        match self {
            Self::Git(err) => err.full_text(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_each_variant() {
        let git = WorkerError::from(GitError::new(ErrorKind::RepositoryChanged, "moved"));
        assert_eq!(git.kind(), ErrorKind::RepositoryChanged);

        let port = WorkerError::from(PortError::external_host("rate limited"));
        assert_eq!(port.kind(), ErrorKind::ExternalHost);

        let lockfile = WorkerError::Lockfile {
            dep_names: "lodash".into(),
        };
        assert_eq!(lockfile.kind(), ErrorKind::LockfileError);
        assert!(lockfile.to_string().starts_with("lockfile-error"));
    }

    #[test]
    fn test_full_text_includes_git_output() {
        let mut err = GitError::new(ErrorKind::Unclassified, "`git push` failed");
        err.stderr = "fatal: bad revision 'abc'".into();
        let err = WorkerError::from(err);
        assert!(err.full_text().contains("fatal: bad revision"));
    }
}
