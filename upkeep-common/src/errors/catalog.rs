//! Error catalog for the upkeep engine.
//!
//! Every user-facing failure has a stable code in the `UPK-Exxx` format,
//! a message, remediation steps and a documentation link.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                              |
//! |------------|-------------|------------------------------------------|
//! | E001-E099  | Config      | Configuration and setup errors           |
//! | E100-E199  | Repository  | Local checkout and remote repository     |
//! | E200-E299  | Transport   | Remote host, network and authentication  |
//! | E300-E399  | Branch      | Branch processing, commit and automerge  |
//! | E400-E499  | Task        | Post-upgrade task execution              |
//! | E500-E599  | Internal    | Internal/unexpected errors               |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all upkeep error scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Allowed-command pattern is not a valid regex
    ConfigInvalidAllowedCommand,

    // =========================================================================
    // Repository Errors (E100-E199)
    // =========================================================================
    /// Repository has no commits
    RepositoryEmpty,
    /// Repository changed underneath the run
    RepositoryChanged,
    /// Repository is disabled or blocked by the host
    RepositoryDisabled,
    /// Path escapes the local working directory
    RepositoryInvalidPath,

    // =========================================================================
    // Transport Errors (E200-E299)
    // =========================================================================
    /// Remote host failed or is unreachable
    TransportExternalHost,
    /// Temporary git failure
    TransportTemporary,
    /// Authentication against the remote failed
    TransportAuthFailed,

    // =========================================================================
    // Branch Errors (E300-E399)
    // =========================================================================
    /// Lockfile regeneration failed for a fresh release
    BranchLockfileError,

    // =========================================================================
    // Task Errors (E400-E499)
    // =========================================================================
    /// Command template could not be rendered
    TaskTemplateError,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Disk is full
    InternalInsufficientDiskSpace,
    /// Failure that matched no known pattern
    InternalUnclassified,
}

impl ErrorCode {
    /// Returns the numeric error code (without prefix).
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (001-099)
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigInvalidAllowedCommand => 6,

            // Repository (100-199)
            Self::RepositoryEmpty => 100,
            Self::RepositoryChanged => 101,
            Self::RepositoryDisabled => 102,
            Self::RepositoryInvalidPath => 103,

            // Transport (200-299)
            Self::TransportExternalHost => 200,
            Self::TransportTemporary => 201,
            Self::TransportAuthFailed => 202,

            // Branch (300-399)
            Self::BranchLockfileError => 300,

            // Task (400-499)
            Self::TaskTemplateError => 400,

            // Internal (500-599)
            Self::InternalInsufficientDiskSpace => 500,
            Self::InternalUnclassified => 501,
        }
    }

    /// Returns the formatted error code string (e.g., "UPK-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("UPK-E{:03}", self.code_number())
    }

    /// Looks up a code by its `UPK-Exxx` string (case-insensitive).
    #[must_use]
    pub fn from_code_string(code: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.code_string().eq_ignore_ascii_case(code.trim()))
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Repository,
            200..=299 => ErrorCategory::Transport,
            300..=399 => ErrorCategory::Branch,
            400..=499 => ErrorCategory::Task,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the full error entry with all metadata.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self
                .remediation()
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            doc_url: self.doc_url().map(String::from),
        }
    }

    /// Returns the error message template.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Failed to read configuration file",
            Self::ConfigParseError => "Configuration file contains invalid TOML",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigInvalidAllowedCommand => "Allowed command pattern is not a valid regex",

            Self::RepositoryEmpty => "Repository is empty",
            Self::RepositoryChanged => "Repository changed during the run",
            Self::RepositoryDisabled => "Repository is disabled by the host",
            Self::RepositoryInvalidPath => "Path is outside the local working directory",

            Self::TransportExternalHost => "Remote git host failed",
            Self::TransportTemporary => "Temporary git error",
            Self::TransportAuthFailed => "Authentication with the git remote failed",

            Self::BranchLockfileError => "Lockfile update failed for a recent release",

            Self::TaskTemplateError => "Post-upgrade command template could not be rendered",

            Self::InternalInsufficientDiskSpace => "Insufficient disk space",
            Self::InternalUnclassified => "Unexpected error",
        }
    }

    /// Returns remediation steps for this error.
    #[must_use]
    pub const fn remediation(&self) -> &'static [&'static str] {
        match self {
            Self::ConfigNotFound => &[
                "Check if ~/.config/upkeep/config.toml exists",
                "Pass --config to point at a custom file",
            ],
            Self::ConfigReadError => &[
                "Check file permissions on the configuration file",
                "Verify the file is not corrupted",
            ],
            Self::ConfigParseError => &[
                "Check TOML syntax at the indicated line",
                "Ensure all strings are properly quoted",
            ],
            Self::ConfigValidationError => &["Review the reported field and its allowed values"],
            Self::ConfigEnvError => &[
                "Check UPKEEP_* environment variables for typos",
                "Unset the variable to fall back to the default",
            ],
            Self::ConfigInvalidAllowedCommand => &[
                "Escape regex metacharacters in allowed_commands entries",
                "Anchor patterns with ^ and $ to avoid surprises",
            ],

            Self::RepositoryEmpty => &[
                "Push an initial commit to the default branch",
                "Verify the default branch (HEAD) is set on the remote",
            ],
            Self::RepositoryChanged => &[
                "Re-run; the remote moved while branches were processed",
                "Check for concurrent automation pushing to the same branches",
            ],
            Self::RepositoryDisabled => &[
                "Check whether the repository is archived, blocked or over quota",
                "Ask the repository owner to check their account",
            ],
            Self::RepositoryInvalidPath => &["Use paths relative to the repository root"],

            Self::TransportExternalHost => &[
                "Check the status page of the git host",
                "Re-run later; the failure is usually transient",
            ],
            Self::TransportTemporary => &["Re-run the job"],
            Self::TransportAuthFailed => &[
                "Verify the token or SSH key configured for the remote",
                "Check the token has not expired",
            ],

            Self::BranchLockfileError => &[
                "Wait for registries to publish the release everywhere",
                "The branch is retried automatically on the next run",
            ],

            Self::TaskTemplateError => &["Check the {{field}} names used in the command"],

            Self::InternalInsufficientDiskSpace => &[
                "Free disk space under local_dir",
                "Enable partial clones by leaving full_clone = false",
            ],
            Self::InternalUnclassified => &[
                "Run with --verbose to capture details",
                "Report a bug including the log",
            ],
        }
    }

    /// Returns documentation URL for this error, if available.
    #[must_use]
    pub const fn doc_url(&self) -> Option<&'static str> {
        match self.category() {
            ErrorCategory::Config => Some("https://upkeep.dev/docs/config"),
            ErrorCategory::Repository => Some("https://upkeep.dev/docs/repository"),
            ErrorCategory::Transport => Some("https://upkeep.dev/docs/git-hosts"),
            ErrorCategory::Branch => Some("https://upkeep.dev/docs/branches"),
            ErrorCategory::Task => Some("https://upkeep.dev/docs/post-upgrade-tasks"),
            ErrorCategory::Internal => Some("https://upkeep.dev/docs/troubleshooting"),
        }
    }

    /// Returns all error codes.
    #[must_use]
    pub const fn all() -> &'static [ErrorCode] {
        &[
            // Config
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigInvalidAllowedCommand,
            // Repository
            Self::RepositoryEmpty,
            Self::RepositoryChanged,
            Self::RepositoryDisabled,
            Self::RepositoryInvalidPath,
            // Transport
            Self::TransportExternalHost,
            Self::TransportTemporary,
            Self::TransportAuthFailed,
            // Branch
            Self::BranchLockfileError,
            // Task
            Self::TaskTemplateError,
            // Internal
            Self::InternalInsufficientDiskSpace,
            Self::InternalUnclassified,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration and setup errors (E001-E099)
    Config,
    /// Local checkout and remote repository errors (E100-E199)
    Repository,
    /// Remote host and authentication errors (E200-E299)
    Transport,
    /// Branch processing errors (E300-E399)
    Branch,
    /// Post-upgrade task errors (E400-E499)
    Task,
    /// Internal/unexpected errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    /// Returns the category name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Repository => "Repository",
            Self::Transport => "Transport",
            Self::Branch => "Branch",
            Self::Task => "Task",
            Self::Internal => "Internal",
        }
    }

    /// Returns a description of this category.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Config => "Configuration file and environment issues",
            Self::Repository => "Problems with the local clone or the remote repository itself",
            Self::Transport => "Git host availability, network and authentication issues",
            Self::Branch => "Branch commit, push and automerge issues",
            Self::Task => "Post-upgrade command issues",
            Self::Internal => "Internal errors that may indicate bugs",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "UPK-E001")
    pub code: String,
    /// Error category
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Steps to remediate the error
    pub remediation: Vec<String>,
    /// Documentation URL, if available
    pub doc_url: Option<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        if let Some(url) = &self.doc_url {
            output.push_str(&format!("\nFor more information: {}\n", url));
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(
                seen.insert(num),
                "Duplicate error code number: {} for {:?}",
                num,
                code
            );
        }
    }

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "UPK-E001");
        assert_eq!(ErrorCode::RepositoryEmpty.code_string(), "UPK-E100");
        assert_eq!(ErrorCode::TransportExternalHost.code_string(), "UPK-E200");
        assert_eq!(ErrorCode::BranchLockfileError.code_string(), "UPK-E300");
        assert_eq!(ErrorCode::TaskTemplateError.code_string(), "UPK-E400");
        assert_eq!(
            ErrorCode::InternalInsufficientDiskSpace.code_string(),
            "UPK-E500"
        );
    }

    #[test]
    fn test_from_code_string() {
        assert_eq!(
            ErrorCode::from_code_string("upk-e101"),
            Some(ErrorCode::RepositoryChanged)
        );
        assert_eq!(ErrorCode::from_code_string("UPK-E999"), None);
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{:?} has empty message", code);
            assert!(
                !code.remediation().is_empty(),
                "{:?} has no remediation steps",
                code
            );
            assert!(code.doc_url().is_some(), "{:?} has no doc url", code);
        }
    }

    #[test]
    fn test_error_entry_serialization() {
        let entry = ErrorCode::ConfigNotFound.entry();
        let json = serde_json::to_string(&entry).expect("serialization failed");
        assert!(json.contains("UPK-E001"));
        assert!(json.contains("config"));

        let parsed: ErrorEntry = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(parsed.code, "UPK-E001");
        assert_eq!(parsed.category, ErrorCategory::Config);
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::TransportAuthFailed).unwrap();
        assert_eq!(json, "\"TRANSPORT_AUTH_FAILED\"");
    }

    #[test]
    fn test_format_full_and_brief() {
        let entry = ErrorCode::RepositoryEmpty.entry();
        let full = entry.format_full();
        assert!(full.contains("[UPK-E100]"));
        assert!(full.contains("Remediation steps:"));
        assert!(full.contains("https://upkeep.dev/docs/repository"));
        assert_eq!(entry.format_brief(), "[UPK-E100] Repository is empty");
    }

    #[test]
    fn test_display_implementations() {
        let display = ErrorCode::ConfigNotFound.to_string();
        assert_eq!(display, "UPK-E001: Configuration file not found");
        assert_eq!(ErrorCategory::Config.to_string(), "Configuration");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let num = code.code_number();
            let range = match code.category() {
                ErrorCategory::Config => 1..100,
                ErrorCategory::Repository => 100..200,
                ErrorCategory::Transport => 200..300,
                ErrorCategory::Branch => 300..400,
                ErrorCategory::Task => 400..500,
                ErrorCategory::Internal => 500..600,
            };
            assert!(range.contains(&num), "{:?} outside {:?}", code, range);
        }
    }
}
