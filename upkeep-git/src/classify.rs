//! Translation of raw git output into [`ErrorKind`].
//!
//! This is the only place that matches on git's human-readable output.
//! Call sites decide what to do with a kind; they never look at stderr.

use upkeep_common::{ErrorKind, FileChange};

/// Sentinel markers checked before the transport table; a message carrying
/// both a disk-space and a hang-up line is a disk-space failure.
const SENTINEL_PATTERNS: &[(&str, ErrorKind)] = &[
    ("No space left on device", ErrorKind::InsufficientDiskSpace),
    ("ENOSPC", ErrorKind::InsufficientDiskSpace),
    (
        "Please ask the owner to check their account",
        ErrorKind::RepositoryDisabled,
    ),
    ("is not a symbolic ref", ErrorKind::RepositoryEmpty),
    ("does not have any commits yet", ErrorKind::RepositoryEmpty),
    ("fatal: not a git repository", ErrorKind::RepositoryChanged),
    ("fatal: bad revision", ErrorKind::RepositoryChanged),
    ("fatal: Not a valid object name", ErrorKind::RepositoryChanged),
    ("fatal: ambiguous argument", ErrorKind::Transient),
    ("fatal: Authentication failed", ErrorKind::AuthenticationFailed),
];

const EXTERNAL_HOST_PATTERNS: &[&str] = &[
    "remote: Invalid username or password",
    "gnutls_handshake() failed",
    "The requested URL returned error: 5",
    "The remote end hung up unexpectedly",
    "access denied or repository not exported",
    "Could not write new index file",
    "Failed to connect to",
    "Connection timed out",
    "malformed object name",
    "Could not resolve host",
    "early EOF",
    "fatal: bad config",
    "incorrect old value provided",
    "RPC failed",
    "Operation timed out",
];

/// Push rules enforced by the forge; retrying cannot help, the repository
/// configuration has to change.
const PUSH_RULE_PATTERNS: &[&str] = &[
    "GitLab: Branch name does not follow the pattern",
    "GitLab: Commit message does not follow the pattern",
    "GitLab: Author",
    "GitLab: Committer",
    "remote: You are not allowed to push code to this project",
];

/// Classify a failure message. Unmatched output is `Unclassified` and is not
/// retried.
pub fn classify_failure(message: &str) -> ErrorKind {
    if is_stale_info_rejection(message) {
        return ErrorKind::RepositoryChanged;
    }
    if let Some((_, kind)) = SENTINEL_PATTERNS
        .iter()
        .find(|(pattern, _)| message.contains(pattern))
    {
        return *kind;
    }
    if EXTERNAL_HOST_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorKind::ExternalHost;
    }
    if PUSH_RULE_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorKind::ConfigValidation;
    }
    ErrorKind::Unclassified
}

/// A lease-protected push refused because the remote moved.
pub fn is_stale_info_rejection(message: &str) -> bool {
    message
        .lines()
        .any(|line| line.contains("[rejected]") && line.contains("(stale info)"))
}

/// What to do with a failed commit or push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitFailure {
    /// Raise with this kind and message.
    Raise { kind: ErrorKind, message: String },
    /// Another process holds the ref; give up on this commit quietly.
    Skip,
    /// Nothing special; keep the original error.
    Passthrough,
}

/// Commit/push specific mappings, applied after [`classify_failure`].
pub fn commit_failure(message: &str, branch_name: &str, files: &[FileChange]) -> CommitFailure {
    let kind = classify_failure(message);
    if matches!(
        kind,
        ErrorKind::ExternalHost
            | ErrorKind::InsufficientDiskSpace
            | ErrorKind::RepositoryChanged
            | ErrorKind::AuthenticationFailed
    ) {
        return CommitFailure::Raise {
            kind,
            message: first_line(message),
        };
    }
    if kind == ErrorKind::ConfigValidation {
        return CommitFailure::Raise {
            kind,
            message: format!("Cannot push {branch_name}: rejected by the repository push rules"),
        };
    }
    if message.contains("[remote rejected]")
        && files
            .iter()
            .any(|f| f.path().starts_with(".github/workflows/"))
    {
        return CommitFailure::Raise {
            kind: ErrorKind::ConfigValidation,
            message: format!(
                "Cannot push {branch_name}: the token is not allowed to modify workflow files"
            ),
        };
    }
    if message.contains("protected branch hook declined")
        || message.contains("GH006: Protected branch update failed")
        || message.contains("Code owner approval is required")
    {
        return CommitFailure::Raise {
            kind: ErrorKind::RepositoryChanged,
            message: format!("Cannot push {branch_name}: branch is protected"),
        };
    }
    if message.contains("cannot lock ref") {
        return CommitFailure::Skip;
    }
    CommitFailure::Passthrough
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().to_string()
}
