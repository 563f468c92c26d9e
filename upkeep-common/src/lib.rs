//! Shared building blocks for the upkeep dependency-update engine.
//!
//! Error catalog and failure taxonomy, configuration (environment and
//! `config.toml`), logging setup, secret masking and the data types that
//! cross the boundary between the git layer and the branch worker.

pub mod config;
pub mod errors;
pub mod logging;
pub mod testing;
pub mod types;
pub mod util;

pub use config::{ConfigError, ConfigSource, EnvParser, GlobalConfig, NoVerify, RetryPolicy, Sourced};
pub use errors::{ErrorCategory, ErrorCode, ErrorEntry, ErrorKind};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use types::{
    CommitResult, FileChange, FileContents, RenamedFile, RepoStatus, TreeItem, TreeItemKind,
    upsert_file_change,
};
pub use util::{Sanitizer, mask_sensitive_command, mask_url_credentials};
