//! The version-control manager: the single owner of a working copy.
//!
//! Every public method takes the state lock once and holds it until the
//! operation is done, so two operations never interleave on the checkout.
//! The lock is not reentrant; private helpers receive the already locked
//! `RepositoryState` and never lock again.

use crate::cache::FingerprintCache;
use crate::classify::{CommitFailure, commit_failure, is_stale_info_rejection};
use crate::error::{GitError, Result};
use crate::parse;
use crate::retry::git_retry;
use crate::runner::GitRunner;
use crate::state::{FORK_UPSTREAM_REMOTE, GitAuthor, RepositoryState, StorageConfig};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use upkeep_common::config::DEFAULT_GIT_AUTHOR;
use upkeep_common::{
    CommitResult, ErrorKind, FileChange, FileContents, GlobalConfig, NoVerify, RepoStatus,
    RetryPolicy, TreeItem,
};

/// Prefix of the non-branch refs used for bot bookkeeping.
pub const BOOKKEEPING_REF_PREFIX: &str = "refs/upkeep/branches/";

const BULK_REF_UPDATE_DENIED: &str =
    "remote: Repository policies do not allow pushes that update more than";
const GITIGNORED_PATHS: &str = "The following paths are ignored by one of your .gitignore files";

/// Input of [`VcsManager::commit_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFilesConfig {
    pub branch_name: String,
    /// Branch the commit is based on; the checked out branch when `None`.
    pub base_branch: Option<String>,
    pub files: Vec<FileChange>,
    pub message: String,
    /// Commit even when the tree equals the existing remote branch.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitProtocol {
    Https,
    Http,
    Ssh,
}

/// Clone URL for a hosted repository (`owner/name`).
pub fn get_url(protocol: GitProtocol, auth: Option<&str>, host: &str, repository: &str) -> String {
    match protocol {
        GitProtocol::Ssh => format!("git@{host}:{repository}.git"),
        GitProtocol::Https | GitProtocol::Http => {
            let scheme = if protocol == GitProtocol::Http { "http" } else { "https" };
            match auth {
                Some(auth) => format!("{scheme}://{auth}@{host}/{repository}.git"),
                None => format!("{scheme}://{host}/{repository}.git"),
            }
        }
    }
}

pub struct VcsManager {
    local_dir: PathBuf,
    runner: Arc<dyn GitRunner>,
    cache: FingerprintCache,
    retry: RetryPolicy,
    no_verify: Vec<NoVerify>,
    state: Mutex<RepositoryState>,
}

impl std::fmt::Debug for VcsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VcsManager")
            .field("local_dir", &self.local_dir)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl VcsManager {
    pub fn new(local_dir: impl Into<PathBuf>, runner: Arc<dyn GitRunner>, cache: FingerprintCache) -> Self {
        Self {
            local_dir: local_dir.into(),
            runner,
            cache,
            retry: RetryPolicy::default(),
            no_verify: Vec::new(),
            state: Mutex::new(RepositoryState::default()),
        }
    }

    /// Manager for `local_dir` using the retry, hook and identity settings
    /// of `config`. Ignored authors are per repository; pass them to
    /// [`Self::set_user_repo_config`] after [`Self::init_repo`].
    pub fn from_config(
        config: &GlobalConfig,
        local_dir: impl Into<PathBuf>,
        runner: Arc<dyn GitRunner>,
        cache: FingerprintCache,
    ) -> Result<Self> {
        let mut manager = Self::new(local_dir, runner, cache)
            .with_retry_policy(config.retry.clone())
            .with_no_verify(config.no_verify.clone());
        let state = manager.state.get_mut();
        state.git_author = Some(parse_author(config.git_author_or_default())?);
        Ok(manager)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_no_verify(mut self, no_verify: Vec<NoVerify>) -> Self {
        self.no_verify = no_verify;
        self
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    pub fn cache(&self) -> &FingerprintCache {
        &self.cache
    }

    fn skips(&self, hook: NoVerify) -> bool {
        self.no_verify.contains(&hook)
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        self.runner
            .run(&self.local_dir, args)
            .await
            .map_err(GitError::from_failure)
    }

    async fn git_bytes(&self, args: &[&str]) -> Result<Vec<u8>> {
        self.runner
            .run_bytes(&self.local_dir, args)
            .await
            .map_err(GitError::from_failure)
    }

    async fn git_retry(&self, operation: &str, args: &[&str]) -> Result<String> {
        git_retry(operation, &self.retry, move || self.git(args)).await
    }

    // ------------------------------------------------------------------
    // Initialisation and identity
    // ------------------------------------------------------------------

    /// Bind to `storage` and list its remote heads without touching the
    /// working tree.
    pub async fn init_repo(&self, storage: StorageConfig) -> Result<()> {
        let mut st = self.state.lock().await;
        st.reset(storage);
        tokio::fs::create_dir_all(&self.local_dir)
            .await
            .map_err(|e| GitError::io("cannot create local directory", e))?;
        self.fetch_branch_commits(&mut st, true).await
    }

    /// Set the commit identity and the authors whose commits do not count
    /// as human modifications.
    pub async fn set_user_repo_config(
        &self,
        git_author: Option<&str>,
        ignored_authors: Vec<String>,
    ) -> Result<()> {
        let author = parse_author(git_author.unwrap_or(DEFAULT_GIT_AUTHOR))?;
        let mut st = self.state.lock().await;
        st.git_author = Some(author);
        st.ignored_authors = ignored_authors.into_iter().collect();
        st.author_written = false;
        Ok(())
    }

    pub async fn write_git_author(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        self.write_author(&mut st).await
    }

    async fn write_author(&self, st: &mut RepositoryState) -> Result<()> {
        if st.author_written {
            return Ok(());
        }
        st.author_written = true;
        let Some(author) = st.git_author.clone() else {
            return Ok(());
        };
        let result = async {
            if let Some(name) = &author.name {
                self.git(&["config", "user.name", name]).await?;
            }
            self.git(&["config", "user.email", &author.email]).await?;
            Ok::<_, GitError>(())
        }
        .await;
        result.map_err(|e| {
            if e.is_platform_failure() {
                e
            } else {
                warn!(error = %e, "Cannot write git author");
                e.with_kind(ErrorKind::Transient)
            }
        })
    }

    async fn fetch_branch_commits(&self, st: &mut RepositoryState, prefer_upstream: bool) -> Result<()> {
        let url = match (&st.storage.upstream_url, prefer_upstream) {
            (Some(upstream), true) => upstream.clone(),
            _ => st.storage.url.clone(),
        };
        let mut args = st.storage.extra_clone_args();
        args.extend(["ls-remote".to_string(), "--heads".to_string(), url]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.git_retry("ls-remote", &args).await?;
        st.branch_commits = parse::parse_ls_remote_heads(&output);
        debug!(branches = st.branch_commits.len(), "Fetched remote branch heads");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Bring the working copy in line with the remote. Only the first call
    /// per run does any work.
    pub async fn sync(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await
    }

    async fn sync_locked(&self, st: &mut RepositoryState) -> Result<()> {
        if st.synced {
            trace!("Working copy already synced");
            return Ok(());
        }
        let started = Instant::now();
        let result = self.sync_working_copy(st).await;
        match &result {
            Ok(()) => {
                st.synced = true;
                info!(
                    branch = st.current_branch.as_deref().unwrap_or_default(),
                    sha = st.current_branch_sha.as_deref().unwrap_or_default(),
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Working copy synced"
                );
            }
            Err(e) => warn!(error = %e, "Working copy sync failed"),
        }
        result
    }

    async fn sync_working_copy(&self, st: &mut RepositoryState) -> Result<()> {
        let head = self.local_dir.join(".git").join("HEAD");
        let mut fetched = false;
        if tokio::fs::try_exists(&head).await.unwrap_or(false) {
            match self.refresh_existing_clone(st).await {
                Ok(()) => fetched = true,
                Err(e) if e.kind == ErrorKind::RepositoryEmpty => return Err(e),
                Err(e) => {
                    info!(error = %e, "Existing working copy is unusable, cloning again");
                }
            }
        }
        if !fetched {
            self.fresh_clone(st).await?;
        }

        st.current_branch_sha = Some(self.rev_parse("HEAD").await?);

        if st.storage.clone_submodules {
            self.init_submodules(st).await;
        }

        match self.git(&["log", "-n", "1", "--format=%H"]).await {
            Ok(_) => {}
            Err(e) if e.kind == ErrorKind::RepositoryEmpty => return Err(e),
            Err(e) => warn!(error = %e, "Cannot read latest commit"),
        }

        if st.current_branch.is_none() {
            let branch = self.default_branch(st.storage.default_branch.as_deref()).await?;
            st.current_branch = Some(branch);
        }

        if let Some(upstream_url) = st.storage.upstream_url.clone() {
            let remotes = self.remotes().await?;
            if !remotes.iter().any(|r| r == FORK_UPSTREAM_REMOTE) {
                self.git(&["remote", "add", FORK_UPSTREAM_REMOTE, &upstream_url])
                    .await?;
            }
            let branch = st.current_branch.clone().unwrap_or_default();
            self.sync_fork(st, &branch).await?;
            self.fetch_branch_commits(st, false).await?;
        }

        st.current_branch_sha = Some(self.rev_parse("HEAD").await?);
        Ok(())
    }

    async fn refresh_existing_clone(&self, st: &mut RepositoryState) -> Result<()> {
        let url = st.storage.url.clone();
        self.git(&["remote", "set-url", "origin", &url]).await?;
        let started = Instant::now();
        self.git_retry("fetch", &["fetch", "--prune", "origin"])
            .await?;
        debug!(duration_ms = started.elapsed().as_millis() as u64, "Fetched origin");

        let branch = match st.current_branch.clone() {
            Some(branch) => branch,
            None => self.default_branch(st.storage.default_branch.as_deref()).await?,
        };
        st.current_branch = Some(branch.clone());
        self.reset_to_branch(&branch).await?;
        self.clean_local_branches().await
    }

    async fn fresh_clone(&self, st: &mut RepositoryState) -> Result<()> {
        let mut args = vec!["clone".to_string()];
        if let Some(branch) = &st.storage.default_branch {
            args.extend(["-b".to_string(), branch.clone()]);
        }
        if !st.storage.full_clone {
            args.push("--filter=blob:none".to_string());
        }
        args.extend(st.storage.extra_clone_args());
        args.extend([st.storage.url.clone(), ".".to_string()]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let args = &args;
        let local_dir = &self.local_dir;

        let started = Instant::now();
        let result = git_retry("clone", &self.retry, move || async move {
            empty_dir(local_dir).await?;
            self.git(args).await
        })
        .await;

        match result {
            Ok(_) => {
                info!(duration_ms = started.elapsed().as_millis() as u64, "Repository cloned");
                Ok(())
            }
            Err(e) if matches!(e.kind, ErrorKind::InsufficientDiskSpace | ErrorKind::RepositoryEmpty) => {
                Err(e)
            }
            Err(e) => {
                debug!(error = %e, "Clone failed");
                Err(e.with_kind(ErrorKind::ExternalHost))
            }
        }
    }

    async fn rev_parse(&self, reference: &str) -> Result<String> {
        Ok(self.git(&["rev-parse", reference]).await?.trim().to_string())
    }

    async fn default_branch(&self, configured: Option<&str>) -> Result<String> {
        if let Some(branch) = configured {
            return Ok(branch.to_string());
        }
        let mut head = self
            .git(&["rev-parse", "--abbrev-ref", "origin/HEAD"])
            .await?;
        if head.trim().is_empty() {
            debug!("origin/HEAD unset, asking the remote");
            self.git(&["remote", "set-head", "origin", "--auto"]).await?;
            head = self
                .git(&["rev-parse", "--abbrev-ref", "origin/HEAD"])
                .await?;
        }
        let head = head.trim();
        let branch = head.strip_prefix("origin/").unwrap_or(head);
        if branch.is_empty() || branch == "HEAD" {
            return Err(GitError::new(
                ErrorKind::RepositoryEmpty,
                "remote has no default branch",
            ));
        }
        Ok(branch.to_string())
    }

    pub async fn get_default_branch(&self) -> Result<String> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.default_branch(None).await
    }

    async fn reset_to_branch(&self, branch: &str) -> Result<()> {
        self.git(&["reset", "--hard"]).await?;
        self.git_retry("checkout", &["checkout", branch]).await?;
        self.git(&["reset", "--hard", &format!("origin/{branch}")])
            .await?;
        self.git(&["clean", "-fd"]).await?;
        Ok(())
    }

    async fn clean_local_branches(&self) -> Result<()> {
        let output = self.git(&["branch"]).await?;
        for branch in parse::parse_other_local_branches(&output) {
            debug!(branch = %branch, "Deleting stray local branch");
            self.git(&["branch", "-D", &branch]).await?;
        }
        Ok(())
    }

    async fn sync_fork(&self, st: &mut RepositoryState, branch: &str) -> Result<()> {
        debug!(branch, "Synchronizing fork with upstream");
        let result = async {
            self.git_retry("fetch upstream", &["fetch", FORK_UPSTREAM_REMOTE])
                .await?;
            let local = self.git(&["branch", "--list", branch]).await?;
            if local.trim().is_empty() {
                self.checkout_from_remote(st, branch, FORK_UPSTREAM_REMOTE)
                    .await?;
            } else {
                self.checkout(st, branch).await?;
            }
            self.git(&["reset", "--hard", &format!("{FORK_UPSTREAM_REMOTE}/{branch}")])
                .await?;
            self.force_push(branch, "origin").await
        }
        .await;
        result.map_err(|e| {
            warn!(error = %e, "Fork sync failed");
            GitError {
                kind: ErrorKind::Unclassified,
                message: format!("error synchronizing fork: {}", e.message),
                ..e
            }
        })
    }

    // ------------------------------------------------------------------
    // Submodules and remotes
    // ------------------------------------------------------------------

    pub async fn get_submodules(&self) -> Vec<String> {
        let _st = self.state.lock().await;
        self.submodules().await
    }

    async fn submodules(&self) -> Vec<String> {
        match self
            .git(&["config", "--file", ".gitmodules", "--get-regexp", r"\.path"])
            .await
        {
            Ok(output) => parse::parse_submodule_paths(&output),
            Err(e) => {
                trace!(error = %e, "No submodules");
                Vec::new()
            }
        }
    }

    /// Initialise submodules matching the configured glob filter (all when
    /// unset). A failing submodule is logged and skipped.
    pub async fn clone_submodules(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.init_submodules(&mut st).await;
        Ok(())
    }

    async fn init_submodules(&self, st: &mut RepositoryState) {
        if st.submodules_initialized {
            return;
        }
        st.submodules_initialized = true;

        let filters = if st.storage.clone_submodules_filter.is_empty() {
            vec!["*".to_string()]
        } else {
            st.storage.clone_submodules_filter.clone()
        };
        let patterns: Vec<glob::Pattern> = filters
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Ignoring invalid submodule filter");
                    None
                }
            })
            .collect();

        for submodule in self.submodules().await {
            if !patterns.iter().any(|p| p.matches(&submodule)) {
                debug!(submodule = %submodule, "Submodule excluded by filter");
                continue;
            }
            let args = ["submodule", "update", "--init", "--recursive", submodule.as_str()];
            if let Err(e) = self.git_retry("submodule update", &args).await {
                warn!(submodule = %submodule, error = %e, "Cannot initialise submodule");
            }
        }
    }

    pub async fn get_remotes(&self) -> Result<Vec<String>> {
        let _st = self.state.lock().await;
        self.remotes().await
    }

    async fn remotes(&self) -> Result<Vec<String>> {
        Ok(self
            .git(&["remote"])
            .await?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub async fn branch_exists(&self, branch: &str) -> bool {
        self.state.lock().await.branch_exists(branch)
    }

    pub async fn get_branch_commit(&self, branch: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .branch_commit(branch)
            .map(ToString::to_string)
    }

    pub async fn get_branch_list(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .branch_commits
            .keys()
            .cloned()
            .collect()
    }

    pub async fn current_branch(&self) -> Option<String> {
        self.state.lock().await.current_branch.clone()
    }

    pub async fn current_branch_sha(&self) -> Option<String> {
        self.state.lock().await.current_branch_sha.clone()
    }

    /// Commits and merges pushed by this manager so far.
    pub async fn commits_pushed(&self) -> u32 {
        self.state.lock().await.commits_pushed
    }

    pub fn clear_fingerprint_cache(&self) {
        info!("Clearing fingerprint cache");
        self.cache.clear();
    }

    // ------------------------------------------------------------------
    // Checkout
    // ------------------------------------------------------------------

    /// Force-checkout `branch` and make it current. Returns its sha.
    pub async fn checkout_branch(&self, branch: &str) -> Result<String> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.checkout(&mut st, branch).await
    }

    async fn checkout(&self, st: &mut RepositoryState, branch: &str) -> Result<String> {
        debug!(branch, "Checking out branch");
        let mut args = vec!["checkout", "-f"];
        if st.submodules_initialized {
            args.push("--recurse-submodules");
        }
        args.extend([branch, "--"]);
        self.git_retry("checkout", &args).await?;

        let sha = self.rev_parse("HEAD").await?;
        st.current_branch = Some(branch.to_string());
        st.current_branch_sha = Some(sha.clone());
        self.git(&["reset", "--hard"]).await?;
        Ok(sha)
    }

    /// Create local `branch` from `<remote>/<branch>` and check it out.
    pub async fn checkout_branch_from_remote(&self, branch: &str, remote: &str) -> Result<String> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.checkout_from_remote(&mut st, branch, remote).await
    }

    async fn checkout_from_remote(&self, st: &mut RepositoryState, branch: &str, remote: &str) -> Result<String> {
        debug!(branch, remote, "Checking out branch from remote");
        self.git(&["checkout", "-b", branch, &format!("{remote}/{branch}")])
            .await?;
        let sha = self.rev_parse("HEAD").await?;
        st.current_branch = Some(branch.to_string());
        st.current_branch_sha = Some(sha.clone());
        st.record_branch_commit(branch, &sha);
        Ok(sha)
    }

    /// `reset --hard <remote>/<branch>`.
    pub async fn reset_hard_from_remote(&self, remote_and_branch: &str) -> Result<()> {
        let _st = self.state.lock().await;
        self.git(&["reset", "--hard", remote_and_branch]).await?;
        Ok(())
    }

    pub async fn force_push_to_remote(&self, branch: &str, remote: &str) -> Result<()> {
        let _st = self.state.lock().await;
        self.force_push(branch, remote).await
    }

    async fn force_push(&self, branch: &str, remote: &str) -> Result<()> {
        let mut args = vec!["push", remote, branch, "--force"];
        if self.skips(NoVerify::Push) {
            args.push("--no-verify");
        }
        self.git_retry("force push", &args).await?;
        Ok(())
    }

    pub async fn reset_to_commit(&self, sha: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        self.git(&["reset", "--hard", sha]).await?;
        st.current_branch_sha = Some(sha.to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status and reads
    // ------------------------------------------------------------------

    /// Working tree status, optionally limited to `path` inside the clone.
    pub async fn get_repo_status(&self, path: Option<&str>) -> Result<RepoStatus> {
        let relative = match path {
            Some(path) => Some(self.path_within(path)?),
            None => None,
        };
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;

        let relative = relative.map(|p| p.to_string_lossy().into_owned());
        let mut args = vec!["status", "--porcelain=v1", "-z", "--untracked-files=all"];
        if let Some(path) = relative.as_deref() {
            args.extend(["--", path]);
        }
        let output = self.git(&args).await?;
        Ok(parse::parse_porcelain_status(&output))
    }

    /// `path` relative to the clone, or `InvalidPath` when it escapes it.
    fn path_within(&self, path: &str) -> Result<PathBuf> {
        let invalid = || GitError::new(ErrorKind::InvalidPath, format!("path {path} is outside the repository"));
        let candidate = Path::new(path);
        let candidate = if candidate.is_absolute() {
            candidate.strip_prefix(&self.local_dir).map_err(|_| invalid())?
        } else {
            candidate
        };
        let mut normalized = PathBuf::new();
        for component in candidate.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(invalid());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(invalid()),
            }
        }
        Ok(normalized)
    }

    /// Regular files at the tip of the current branch.
    pub async fn get_file_list(&self) -> Result<Vec<String>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let branch = st.current_branch.clone().unwrap_or_default();
        let output = self
            .git(&["ls-tree", "-r", &format!("refs/heads/{branch}")])
            .await?;
        Ok(parse::parse_ls_tree_files(&output))
    }

    /// Subjects of the last 20 commits.
    pub async fn get_commit_messages(&self) -> Result<Vec<String>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        match self.git(&["log", "-n", "20", "--format=%s"]).await {
            Ok(output) => Ok(output.lines().map(ToString::to_string).collect()),
            Err(e) => {
                debug!(error = %e, "Cannot read commit messages");
                Ok(Vec::new())
            }
        }
    }

    pub async fn get_branch_last_commit_time(&self, branch: &str) -> Result<DateTime<Utc>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        match self
            .git(&["show", "-s", "--format=%ai", &format!("origin/{branch}")])
            .await
        {
            Ok(output) => Ok(parse::parse_commit_time(&output).unwrap_or_else(Utc::now)),
            Err(e) if e.is_platform_failure() => Err(e),
            Err(e) => {
                debug!(branch, error = %e, "Cannot read last commit time");
                Ok(Utc::now())
            }
        }
    }

    /// Files changed by the tip commit of `branch`.
    pub async fn get_branch_files(&self, branch: &str) -> Result<Option<Vec<String>>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.files_changed_by(&format!("origin/{branch}")).await
    }

    pub async fn get_branch_files_from_commit(&self, sha: &str) -> Result<Option<Vec<String>>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.files_changed_by(sha).await
    }

    async fn files_changed_by(&self, reference: &str) -> Result<Option<Vec<String>>> {
        match self
            .git(&["diff", "--name-only", &format!("{reference}^"), reference])
            .await
        {
            Ok(output) => Ok(Some(
                output
                    .lines()
                    .filter(|l| !l.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            )),
            Err(e) if e.is_platform_failure() => Err(e),
            Err(e) => {
                debug!(reference, error = %e, "Cannot list changed files");
                Ok(None)
            }
        }
    }

    /// Content of `path` at `origin/<branch>` (the current branch when
    /// `None`). Non-UTF-8 blobs come back as [`FileContents::Binary`].
    pub async fn get_file(&self, path: &str, branch: Option<&str>) -> Result<Option<FileContents>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let branch = branch
            .map(ToString::to_string)
            .or_else(|| st.current_branch.clone())
            .unwrap_or_default();
        self.read_file(path, &branch).await
    }

    async fn read_file(&self, path: &str, branch: &str) -> Result<Option<FileContents>> {
        match self.git_bytes(&["show", &format!("origin/{branch}:{path}")]).await {
            Ok(content) => Ok(Some(FileContents::from_bytes(content))),
            Err(e) if e.is_platform_failure() => Err(e),
            Err(e) => {
                trace!(path, branch, error = %e, "File not readable");
                Ok(None)
            }
        }
    }

    pub async fn get_files(&self, paths: &[String]) -> Result<BTreeMap<String, Option<FileContents>>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let branch = st.current_branch.clone().unwrap_or_default();
        let mut files = BTreeMap::new();
        for path in paths {
            files.insert(path.clone(), self.read_file(path, &branch).await?);
        }
        Ok(files)
    }

    /// Whether two refs differ. Errors count as a difference.
    pub async fn has_diff(&self, a: &str, b: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        Ok(self.differs(a, b).await)
    }

    async fn differs(&self, a: &str, b: &str) -> bool {
        match self.git(&["diff", a, b, "--"]).await {
            Ok(output) => !output.trim().is_empty(),
            Err(e) => {
                debug!(a, b, error = %e, "diff failed, assuming changes");
                true
            }
        }
    }

    /// Entries of the top-level tree of `sha`.
    pub async fn list_commit_tree(&self, sha: &str) -> Result<Vec<TreeItem>> {
        let _st = self.state.lock().await;
        let commit = self.git(&["cat-file", "-p", sha]).await?;
        let tree = parse::parse_commit_tree_sha(&commit).ok_or_else(|| {
            GitError::new(ErrorKind::Unclassified, format!("commit {sha} has no tree"))
        })?;
        let entries = self.git(&["cat-file", "-p", &tree]).await?;
        Ok(parse::parse_tree_entries(&entries))
    }

    // ------------------------------------------------------------------
    // Branch questions (cached)
    // ------------------------------------------------------------------

    /// Whether `base` has commits `branch` lacks.
    pub async fn is_branch_behind_base(&self, branch: &str, base: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        let (branch_sha, base_sha) = known_pair(&st, branch, base)?;
        if let Some(behind) = self.cache.behind_base(branch, &branch_sha, base, &base_sha) {
            trace!(branch, behind, "behind-base answer from cache");
            return Ok(behind);
        }
        self.sync_locked(&mut st).await?;

        let count = self
            .git(&["rev-list", "--count", &format!("{branch_sha}..{base_sha}")])
            .await?;
        let behind = count.trim() != "0";
        debug!(branch, base, behind, "Computed behind-base");
        self.cache
            .set_behind_base(branch, &branch_sha, base, &base_sha, behind);
        Ok(behind)
    }

    /// Whether someone other than the bot (and the ignored authors)
    /// committed to `branch` since it left `base`.
    pub async fn is_branch_modified(&self, branch: &str, base: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        let Some(branch_sha) = st.branch_commit(branch).map(ToString::to_string) else {
            debug!(branch, "Branch does not exist, not modified");
            return Ok(false);
        };
        if let Some(modified) = st.branch_is_modified.get(branch) {
            return Ok(*modified);
        }
        if let Some(modified) = self.cache.modified(branch, &branch_sha) {
            st.branch_is_modified.insert(branch.to_string(), modified);
            return Ok(modified);
        }
        self.sync_locked(&mut st).await?;

        let range = format!("origin/{base}..origin/{branch}");
        let authors: BTreeSet<String> = match self.git(&["log", "--format=%ae", &range]).await {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(ToString::to_string)
                .collect(),
            Err(e) if e.kind == ErrorKind::RepositoryChanged || e.is_platform_failure() => {
                return Err(e);
            }
            Err(e) => {
                warn!(branch, error = %e, "Cannot read branch authors");
                BTreeSet::new()
            }
        };

        let foreign: Vec<&String> = authors
            .iter()
            .filter(|email| !st.is_bot_author(email))
            .collect();
        let modified = !foreign.is_empty();
        if modified {
            debug!(branch, authors = ?foreign, "Branch modified by other authors");
        }
        st.branch_is_modified.insert(branch.to_string(), modified);
        self.cache.set_modified(branch, &branch_sha, modified);
        Ok(modified)
    }

    /// Whether merging `branch` into `base` conflicts. Missing refs count as
    /// conflicted.
    pub async fn is_branch_conflicted(&self, base: &str, branch: &str) -> Result<bool> {
        let mut st = self.state.lock().await;
        let (Some(base_sha), Some(branch_sha)) = (
            st.branch_commit(base).map(ToString::to_string),
            st.branch_commit(branch).map(ToString::to_string),
        ) else {
            warn!(base, branch, "Base or branch sha unknown, treating as conflicted");
            return Ok(true);
        };
        if let Some(conflicted) = self.cache.conflicted(branch, &branch_sha, base, &base_sha) {
            trace!(branch, conflicted, "conflict answer from cache");
            return Ok(conflicted);
        }
        self.sync_locked(&mut st).await?;
        self.write_author(&mut st).await?;

        let original = st.current_branch.clone().unwrap_or_default();
        let conflicted = match self.trial_merge(base, branch, &original).await {
            Ok(()) => false,
            Err(e) => {
                debug!(branch, error = %e, "Trial merge failed");
                true
            }
        };

        if let Err(e) = self.git(&["merge", "--abort"]).await {
            trace!(error = %e, "Nothing to abort");
        }
        if original != base {
            if let Err(e) = self.git(&["checkout", &original]).await {
                warn!(branch = %original, error = %e, "Cannot restore branch after trial merge");
            }
        }

        debug!(branch, base, conflicted, "Computed conflict state");
        self.cache
            .set_conflicted(branch, &branch_sha, base, &base_sha, conflicted);
        Ok(conflicted)
    }

    async fn trial_merge(&self, base: &str, branch: &str, original: &str) -> Result<()> {
        self.git(&["reset", "--hard"]).await?;
        if original != base {
            self.git(&["checkout", base]).await?;
        }
        self.git(&["merge", "--no-commit", "--no-ff", &format!("origin/{branch}")])
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Branch mutation
    // ------------------------------------------------------------------

    /// Delete `branch` remotely and locally. A missing remote branch is not
    /// an error.
    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;

        let mut args = vec!["push", "--delete", "origin", branch];
        if self.skips(NoVerify::Push) {
            args.push("--no-verify");
        }
        match self.git_retry("delete branch", &args).await {
            Ok(_) => info!(branch, "Deleted remote branch"),
            Err(e) if e.is_platform_failure() => return Err(e),
            Err(e) => debug!(branch, error = %e, "No remote branch to delete"),
        }
        if let Err(e) = self.git(&["branch", "-D", branch]).await {
            debug!(branch, error = %e, "No local branch to delete");
        }
        st.forget_branch(branch);
        Ok(())
    }

    /// Merge `refspec` fetched from origin into the current branch, locally.
    pub async fn merge_to_local(&self, refspec: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let current = st.current_branch.clone().unwrap_or_default();
        self.git(&["reset", "--hard"]).await?;
        self.git_retry(
            "checkout",
            &["checkout", "-B", &current, &format!("origin/{current}")],
        )
        .await?;
        self.git_retry("fetch", &["fetch", "origin", refspec]).await?;
        self.git(&["merge", "FETCH_HEAD"]).await?;
        Ok(())
    }

    /// Fast-forward the current branch to `branch` and push it.
    pub async fn merge_branch(&self, branch: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let current = st.current_branch.clone().unwrap_or_default();

        self.git(&["reset", "--hard"]).await?;
        self.git_retry(
            "checkout",
            &["checkout", "-B", branch, &format!("origin/{branch}")],
        )
        .await?;
        self.git_retry(
            "checkout",
            &["checkout", "-B", &current, &format!("origin/{current}")],
        )
        .await?;
        self.git(&["merge", "--ff-only", branch]).await?;

        let mut push = vec!["push", "origin", current.as_str()];
        if self.skips(NoVerify::Push) {
            push.push("--no-verify");
        }
        self.git_retry("push", &push).await?;

        let sha = self.rev_parse("HEAD").await?;
        st.record_branch_commit(&current, &sha);
        st.current_branch_sha = Some(sha);
        st.commits_pushed += 1;
        info!(branch, base = %current, "Branch merged");
        Ok(())
    }

    /// Pull `branch` into its remote-tracking ref and record its sha.
    pub async fn fetch_branch(&self, branch: &str) -> Result<String> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let refspec = format!("refs/heads/{branch}:refs/remotes/origin/{branch}");
        self.git_retry("pull", &["pull", "origin", &refspec, "--force"])
            .await?;
        let sha = self
            .rev_parse(&format!("refs/remotes/origin/{branch}"))
            .await?;
        st.record_branch_commit(branch, &sha);
        st.branch_is_modified.insert(branch.to_string(), false);
        Ok(sha)
    }

    // ------------------------------------------------------------------
    // Commit and push
    // ------------------------------------------------------------------

    /// Build a commit for `config` on a branch recreated from the base
    /// remote tip. `None` when the commit would not change anything.
    pub async fn prepare_commit(&self, config: &CommitFilesConfig) -> Result<Option<CommitResult>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        self.prepare(&mut st, config).await
    }

    async fn prepare(&self, st: &mut RepositoryState, config: &CommitFilesConfig) -> Result<Option<CommitResult>> {
        self.write_author(st).await?;
        let built = self.build_commit(st, config).await;
        self.restore_checkout(st).await;
        match built {
            Ok(result) => Ok(result),
            Err(e) => handle_commit_error(e, &config.branch_name, &config.files),
        }
    }

    /// Return the working copy to the branch recorded in `st` after a
    /// commit was built on another branch.
    async fn restore_checkout(&self, st: &RepositoryState) {
        let Some(current) = st.current_branch.as_deref() else {
            return;
        };
        if let Err(e) = self.git(&["reset", "--hard"]).await {
            trace!(error = %e, "Nothing to reset");
        }
        if let Err(e) = self.git(&["checkout", "-f", current]).await {
            warn!(branch = current, error = %e, "Cannot restore branch after commit");
        }
    }

    async fn build_commit(&self, st: &mut RepositoryState, config: &CommitFilesConfig) -> Result<Option<CommitResult>> {
        let branch = config.branch_name.as_str();
        let base = config
            .base_branch
            .clone()
            .or_else(|| st.current_branch.clone())
            .ok_or_else(|| GitError::new(ErrorKind::Unclassified, "no base branch to commit on"))?;

        self.git(&["reset", "--hard"]).await?;
        self.git(&["clean", "-fd"]).await?;
        let parent_sha = st.current_branch_sha.clone().unwrap_or_default();
        self.git_retry(
            "checkout",
            &["checkout", "-B", branch, &format!("origin/{base}")],
        )
        .await?;

        let mut applied: BTreeSet<&str> = BTreeSet::new();
        let mut ignored: Vec<&str> = Vec::new();
        for file in &config.files {
            let path = file.path();
            self.path_within(path)?;
            match file {
                FileChange::Deletion { .. } => match self.git(&["rm", "-r", "--", path]).await {
                    Ok(_) => {
                        applied.insert(path);
                    }
                    Err(e) if e.is_platform_failure() => return Err(e),
                    Err(e) => {
                        debug!(path, error = %e, "Cannot delete file");
                        ignored.push(path);
                    }
                },
                FileChange::Addition {
                    contents,
                    is_executable,
                    is_symlink,
                    ..
                } => {
                    let target = self.local_dir.join(path);
                    let is_dir = tokio::fs::metadata(&target)
                        .await
                        .map(|m| m.is_dir())
                        .unwrap_or(false);
                    if is_dir && !is_symlink {
                        trace!(path, "Adding directory (submodule update)");
                    } else {
                        write_file(&target, contents, *is_executable, *is_symlink)
                            .await
                            .map_err(|e| GitError::io(&format!("cannot write {path}"), e))?;
                    }
                    match self.git(&["add", "--", path]).await {
                        Ok(_) => {}
                        Err(e) if e.contains(GITIGNORED_PATHS) => {
                            debug!(path, "File is gitignored, skipping");
                            ignored.push(path);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    if *is_executable {
                        self.git(&["update-index", "--chmod=+x", "--", path])
                            .await?;
                    }
                    applied.insert(path);
                }
            }
        }
        if !ignored.is_empty() {
            info!(files = ?ignored, "Some files were not committed");
        }

        let mut commit = vec!["commit", "-m", config.message.as_str()];
        if self.skips(NoVerify::Commit) {
            commit.push("--no-verify");
        }
        if let Err(e) = self.git(&commit).await {
            if e.contains("nothing to commit") || e.contains("nothing added to commit") {
                warn!(branch, "Detected empty commit, not pushing");
                return Ok(None);
            }
            return Err(e);
        }

        if !config.force && !self.differs("HEAD", &format!("origin/{branch}")).await {
            info!(branch, "No file changes compared to the existing branch, skipping commit");
            return Ok(None);
        }

        let sha = self.rev_parse(branch).await?;
        debug!(branch, sha = %sha, "Commit prepared");
        Ok(Some(CommitResult {
            parent_sha,
            sha,
            files: config
                .files
                .iter()
                .filter(|f| applied.contains(f.path()))
                .cloned()
                .collect(),
        }))
    }

    /// Lease-protected force push of `source_ref` to `target_ref`. `false`
    /// when the push was skipped because the ref is locked.
    pub async fn push_commit(&self, source_ref: &str, target_ref: &str, files: &[FileChange]) -> Result<bool> {
        let mut st = self.state.lock().await;
        self.push(&mut st, source_ref, target_ref, files).await
    }

    async fn push(
        &self,
        st: &mut RepositoryState,
        source_ref: &str,
        target_ref: &str,
        files: &[FileChange],
    ) -> Result<bool> {
        let refspec = format!("{source_ref}:{target_ref}");
        let mut args = vec!["push", "origin", refspec.as_str(), "--force-with-lease", "-u"];
        if self.skips(NoVerify::Push) {
            args.push("--no-verify");
        }
        match self.git_retry("push", &args).await {
            Ok(_) => {
                st.commits_pushed += 1;
                info!(target_ref, "Pushed commit");
                Ok(true)
            }
            Err(e) => handle_commit_error::<()>(e, target_ref, files).map(|r| r.is_some()),
        }
    }

    /// Prepare and push. Returns the new sha only when both steps ran.
    pub async fn commit_files(&self, config: &CommitFilesConfig) -> Result<Option<String>> {
        let mut st = self.state.lock().await;
        self.sync_locked(&mut st).await?;
        let result = async {
            let Some(commit) = self.prepare(&mut st, config).await? else {
                return Ok(None);
            };
            let target = format!("refs/heads/{}", config.branch_name);
            if !self
                .push(&mut st, &config.branch_name, &target, &config.files)
                .await?
            {
                return Ok(None);
            }
            st.record_branch_commit(&config.branch_name, &commit.sha);
            st.branch_is_modified
                .insert(config.branch_name.clone(), false);
            Ok(Some(commit.sha))
        }
        .await;
        result.map_err(|e: GitError| {
            if is_stale_info_rejection(&e.full_text()) {
                e.with_kind(ErrorKind::RepositoryChanged)
            } else {
                e
            }
        })
    }

    // ------------------------------------------------------------------
    // Bookkeeping refs
    // ------------------------------------------------------------------

    pub async fn push_commit_to_bookkeeping_ref(&self, sha: &str, name: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        let reference = format!("{BOOKKEEPING_REF_PREFIX}{name}");
        self.git(&["update-ref", &reference, sha]).await?;
        self.git_retry("push bookkeeping ref", &["push", "--force", "origin", &reference])
            .await?;
        st.bookkeeping_refs_pushed = true;
        Ok(())
    }

    /// Delete all bookkeeping refs from the remote. A no-op unless this run
    /// pushed one.
    pub async fn clear_bookkeeping_refs(&self) -> Result<()> {
        let mut st = self.state.lock().await;
        if !st.synced || !st.bookkeeping_refs_pushed {
            return Ok(());
        }
        let url = st.storage.url.clone();
        let pattern = format!("{BOOKKEEPING_REF_PREFIX}*");
        let listing = self.git(&["ls-remote", &url, &pattern]).await?;
        let refs: Vec<&str> = listing
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .collect();

        if !refs.is_empty() {
            let mut args = vec!["push", "--delete", "origin"];
            args.extend(refs.iter().copied());
            match self.git(&args).await {
                Ok(_) => debug!(count = refs.len(), "Deleted bookkeeping refs"),
                Err(e) if e.contains(BULK_REF_UPDATE_DENIED) => {
                    debug!("Bulk ref deletion denied, deleting one by one");
                    for reference in &refs {
                        if let Err(e) = self.git(&["push", "--delete", "origin", reference]).await {
                            debug!(reference, error = %e, "Stopping bookkeeping ref cleanup");
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Cannot delete bookkeeping refs"),
            }
        }
        st.bookkeeping_refs_pushed = false;
        Ok(())
    }
}

fn parse_author(author: &str) -> Result<GitAuthor> {
    GitAuthor::parse(author).ok_or_else(|| {
        GitError::new(
            ErrorKind::ConfigValidation,
            format!("invalid git author: {author}"),
        )
    })
}

fn known_pair(st: &RepositoryState, branch: &str, base: &str) -> Result<(String, String)> {
    match (st.branch_commit(branch), st.branch_commit(base)) {
        (Some(branch_sha), Some(base_sha)) => Ok((branch_sha.to_string(), base_sha.to_string())),
        _ => Err(GitError::new(
            ErrorKind::Unclassified,
            format!("cannot compare {branch} with {base}: unknown branch"),
        )),
    }
}

fn handle_commit_error<T>(err: GitError, branch: &str, files: &[FileChange]) -> Result<Option<T>> {
    match commit_failure(&err.full_text(), branch, files) {
        CommitFailure::Raise { kind, message } => Err(GitError { kind, message, ..err }),
        CommitFailure::Skip => {
            warn!(branch, error = %err, "Ref is locked, skipping commit");
            Ok(None)
        }
        CommitFailure::Passthrough => Err(err),
    }
}

async fn empty_dir(dir: &Path) -> Result<()> {
    let io = |e| GitError::io("cannot empty local directory", e);
    tokio::fs::create_dir_all(dir).await.map_err(io)?;
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io)?;
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let path = entry.path();
        if entry.file_type().await.map_err(io)?.is_dir() {
            tokio::fs::remove_dir_all(&path).await.map_err(io)?;
        } else {
            tokio::fs::remove_file(&path).await.map_err(io)?;
        }
    }
    Ok(())
}

async fn write_file(
    target: &Path,
    contents: &FileContents,
    is_executable: bool,
    is_symlink: bool,
) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if is_symlink {
        match tokio::fs::remove_file(target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let link = String::from_utf8_lossy(contents.as_bytes()).into_owned();
        #[cfg(unix)]
        return tokio::fs::symlink(link, target).await;
        #[cfg(not(unix))]
        return tokio::fs::write(target, link).await;
    }

    tokio::fs::write(target, contents.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if is_executable { 0o755 } else { 0o644 };
        tokio::fs::set_permissions(target, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = is_executable;
    Ok(())
}
