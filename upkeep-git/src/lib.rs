//! Git layer of the upkeep engine.
//!
//! [`VcsManager`] owns one working copy and its [`RepositoryState`]. Remote
//! operations go through [`git_retry`]; expensive branch questions are
//! memoized in a [`FingerprintCache`]. The branch worker only sees the
//! [`Scm`] trait.

pub mod cache;
pub mod classify;
pub mod error;
pub mod manager;
pub mod parse;
pub mod retry;
pub mod runner;
pub mod scm;
pub mod state;

pub use cache::{
    FingerprintCache, FingerprintKey, FingerprintQuestion, FingerprintStore,
    InMemoryFingerprintStore, JsonFileFingerprintStore,
};
pub use classify::{CommitFailure, classify_failure, commit_failure};
pub use error::{GitError, Result};
pub use manager::{BOOKKEEPING_REF_PREFIX, CommitFilesConfig, GitProtocol, VcsManager, get_url};
pub use retry::{RetryableError, git_retry};
pub use runner::{GitCommandFailure, GitRunner, MockGitRunner, ProcessGitRunner};
pub use scm::{MockScm, Scm};
pub use state::{FORK_UPSTREAM_REMOTE, GitAuthor, RepositoryState, StorageConfig};

