//! The slice of the version-control manager the branch processor uses.

use crate::error::{GitError, Result};
use crate::manager::{CommitFilesConfig, VcsManager};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use upkeep_common::RepoStatus;

#[async_trait]
pub trait Scm: Send + Sync {
    /// Root of the working copy.
    fn local_dir(&self) -> &Path;
    async fn branch_exists(&self, branch: &str) -> bool;
    async fn get_branch_commit(&self, branch: &str) -> Option<String>;
    async fn is_branch_behind_base(&self, branch: &str, base: &str) -> Result<bool>;
    async fn is_branch_modified(&self, branch: &str, base: &str) -> Result<bool>;
    async fn is_branch_conflicted(&self, base: &str, branch: &str) -> Result<bool>;
    async fn checkout_branch(&self, branch: &str) -> Result<String>;
    async fn commit_files(&self, config: &CommitFilesConfig) -> Result<Option<String>>;
    async fn delete_branch(&self, branch: &str) -> Result<()>;
    async fn merge_branch(&self, branch: &str) -> Result<()>;
    async fn get_repo_status(&self, path: Option<&str>) -> Result<RepoStatus>;
    async fn commits_pushed(&self) -> u32;
}

#[async_trait]
impl Scm for VcsManager {
    fn local_dir(&self) -> &Path {
        VcsManager::local_dir(self)
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        VcsManager::branch_exists(self, branch).await
    }

    async fn get_branch_commit(&self, branch: &str) -> Option<String> {
        VcsManager::get_branch_commit(self, branch).await
    }

    async fn is_branch_behind_base(&self, branch: &str, base: &str) -> Result<bool> {
        VcsManager::is_branch_behind_base(self, branch, base).await
    }

    async fn is_branch_modified(&self, branch: &str, base: &str) -> Result<bool> {
        VcsManager::is_branch_modified(self, branch, base).await
    }

    async fn is_branch_conflicted(&self, base: &str, branch: &str) -> Result<bool> {
        VcsManager::is_branch_conflicted(self, base, branch).await
    }

    async fn checkout_branch(&self, branch: &str) -> Result<String> {
        VcsManager::checkout_branch(self, branch).await
    }

    async fn commit_files(&self, config: &CommitFilesConfig) -> Result<Option<String>> {
        VcsManager::commit_files(self, config).await
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        VcsManager::delete_branch(self, branch).await
    }

    async fn merge_branch(&self, branch: &str) -> Result<()> {
        VcsManager::merge_branch(self, branch).await
    }

    async fn get_repo_status(&self, path: Option<&str>) -> Result<RepoStatus> {
        VcsManager::get_repo_status(self, path).await
    }

    async fn commits_pushed(&self) -> u32 {
        VcsManager::commits_pushed(self).await
    }
}

#[derive(Debug, Default)]
struct MockScmState {
    branches: BTreeMap<String, String>,
    modified: HashMap<String, bool>,
    behind: HashMap<String, bool>,
    conflicted: HashMap<String, bool>,
    commit_results: VecDeque<Result<Option<String>>>,
    statuses: VecDeque<Result<RepoStatus>>,
    failures: HashMap<&'static str, GitError>,
    commits: Vec<CommitFilesConfig>,
    calls: Vec<String>,
    commits_pushed: u32,
}

/// In-memory [`Scm`] for processor tests.
///
/// Commits succeed with sha `sha-<n>` unless a result is queued; one-shot
/// failures can be injected per operation name.
#[derive(Debug, Clone)]
pub struct MockScm {
    local_dir: PathBuf,
    state: Arc<Mutex<MockScmState>>,
}

impl MockScm {
    pub fn new(local_dir: impl Into<PathBuf>) -> Self {
        Self {
            local_dir: local_dir.into(),
            state: Arc::new(Mutex::new(MockScmState::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockScmState> {
        self.state.lock().expect("mock scm mutex poisoned")
    }

    pub fn with_branch(self, branch: &str, sha: &str) -> Self {
        self.lock()
            .branches
            .insert(branch.to_string(), sha.to_string());
        self
    }

    pub fn set_modified(&self, branch: &str, value: bool) {
        self.lock().modified.insert(branch.to_string(), value);
    }

    pub fn set_behind(&self, branch: &str, value: bool) {
        self.lock().behind.insert(branch.to_string(), value);
    }

    pub fn set_conflicted(&self, branch: &str, value: bool) {
        self.lock().conflicted.insert(branch.to_string(), value);
    }

    pub fn push_commit_result(&self, result: Result<Option<String>>) {
        self.lock().commit_results.push_back(result);
    }

    pub fn push_status(&self, status: RepoStatus) {
        self.lock().statuses.push_back(Ok(status));
    }

    /// Fail the next call of `operation` (`"checkout_branch"`, ...).
    pub fn fail_next(&self, operation: &'static str, err: GitError) {
        self.lock().failures.insert(operation, err);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn commits(&self) -> Vec<CommitFilesConfig> {
        self.lock().commits.clone()
    }

    fn record(&self, operation: &'static str, arg: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("{operation}:{arg}"));
        match state.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Scm for MockScm {
    fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        self.lock().branches.contains_key(branch)
    }

    async fn get_branch_commit(&self, branch: &str) -> Option<String> {
        self.lock().branches.get(branch).cloned()
    }

    async fn is_branch_behind_base(&self, branch: &str, _base: &str) -> Result<bool> {
        self.record("is_branch_behind_base", branch)?;
        Ok(self.lock().behind.get(branch).copied().unwrap_or(false))
    }

    async fn is_branch_modified(&self, branch: &str, _base: &str) -> Result<bool> {
        self.record("is_branch_modified", branch)?;
        Ok(self.lock().modified.get(branch).copied().unwrap_or(false))
    }

    async fn is_branch_conflicted(&self, _base: &str, branch: &str) -> Result<bool> {
        self.record("is_branch_conflicted", branch)?;
        Ok(self.lock().conflicted.get(branch).copied().unwrap_or(false))
    }

    async fn checkout_branch(&self, branch: &str) -> Result<String> {
        self.record("checkout_branch", branch)?;
        Ok(self
            .lock()
            .branches
            .get(branch)
            .cloned()
            .unwrap_or_else(|| "base-sha".to_string()))
    }

    async fn commit_files(&self, config: &CommitFilesConfig) -> Result<Option<String>> {
        self.record("commit_files", &config.branch_name)?;
        let mut state = self.lock();
        state.commits.push(config.clone());
        let result = match state.commit_results.pop_front() {
            Some(result) => result,
            None => Ok(Some(format!("sha-{}", state.commits.len()))),
        };
        if let Ok(Some(sha)) = &result {
            state
                .branches
                .insert(config.branch_name.clone(), sha.clone());
            state.commits_pushed += 1;
        }
        result
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.record("delete_branch", branch)?;
        self.lock().branches.remove(branch);
        Ok(())
    }

    async fn merge_branch(&self, branch: &str) -> Result<()> {
        self.record("merge_branch", branch)?;
        self.lock().commits_pushed += 1;
        Ok(())
    }

    async fn get_repo_status(&self, _path: Option<&str>) -> Result<RepoStatus> {
        self.record("get_repo_status", "")?;
        self.lock()
            .statuses
            .pop_front()
            .unwrap_or_else(|| Ok(RepoStatus::default()))
    }

    async fn commits_pushed(&self) -> u32 {
        self.lock().commits_pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use upkeep_common::ErrorKind;

    fn commit(branch: &str) -> CommitFilesConfig {
        CommitFilesConfig {
            branch_name: branch.to_string(),
            base_branch: Some("main".into()),
            files: vec![],
            message: "update".into(),
            force: false,
        }
    }

    #[tokio::test]
    async fn test_mock_commit_creates_branch() {
        let scm = MockScm::new("/tmp/repo");
        assert!(!scm.branch_exists("upkeep/a").await);
        let sha = scm.commit_files(&commit("upkeep/a")).await.unwrap();
        assert_eq!(sha.as_deref(), Some("sha-1"));
        assert_eq!(scm.get_branch_commit("upkeep/a").await.as_deref(), Some("sha-1"));
        assert_eq!(scm.commits_pushed().await, 1);
    }

    #[tokio::test]
    async fn test_mock_failure_is_one_shot() {
        let scm = MockScm::new("/tmp/repo").with_branch("main", "m1");
        scm.fail_next(
            "checkout_branch",
            GitError::new(ErrorKind::RepositoryChanged, "gone"),
        );
        assert!(scm.checkout_branch("main").await.is_err());
        assert_eq!(scm.checkout_branch("main").await.unwrap(), "m1");
        assert_eq!(scm.calls(), vec!["checkout_branch:main", "checkout_branch:main"]);
    }
}
