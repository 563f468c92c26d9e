//! Scripted collaborators for processor tests.
//!
//! Every mock records its calls and answers from queued or fixed values.

use super::{
    ArtifactUpdater, BranchStatus, Comment, EnsurePrOutcome, FindPr, MergeConfidence,
    PackageFilesResult, Platform, PortError, PortResult, Pr, PrAutomergeResult, PrManager,
    Schedule, ScheduleKind,
};
use crate::config::{BranchConfig, ConfidenceLevel, Upgrade};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct PlatformState {
    branch_prs: HashMap<String, Pr>,
    found_prs: VecDeque<Option<Pr>>,
    branch_status: Option<BranchStatus>,
    failures: HashMap<&'static str, PortError>,
    comments: Vec<Comment>,
    removed_comments: Vec<(u64, String)>,
    calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockPlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PlatformState> {
        self.state.lock().expect("mock platform mutex poisoned")
    }

    pub fn with_branch_pr(self, branch: &str, pr: Pr) -> Self {
        self.lock().branch_prs.insert(branch.to_string(), pr);
        self
    }

    /// Answer the next `find_pr` call.
    pub fn push_found_pr(&self, pr: Option<Pr>) {
        self.lock().found_prs.push_back(pr);
    }

    pub fn set_branch_status(&self, status: BranchStatus) {
        self.lock().branch_status = Some(status);
    }

    pub fn fail_next(&self, operation: &'static str, err: PortError) {
        self.lock().failures.insert(operation, err);
    }

    pub fn comments(&self) -> Vec<Comment> {
        self.lock().comments.clone()
    }

    pub fn comment_topics(&self) -> Vec<String> {
        self.lock().comments.iter().map(|c| c.topic.clone()).collect()
    }

    pub fn removed_comments(&self) -> Vec<(u64, String)> {
        self.lock().removed_comments.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn record(&self, operation: &'static str, arg: &str) -> PortResult<()> {
        let mut state = self.lock();
        state.calls.push(format!("{operation}:{arg}"));
        match state.failures.remove(operation) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn get_branch_pr(&self, branch: &str) -> PortResult<Option<Pr>> {
        self.record("get_branch_pr", branch)?;
        Ok(self.lock().branch_prs.get(branch).cloned())
    }

    async fn find_pr(&self, query: &FindPr) -> PortResult<Option<Pr>> {
        self.record("find_pr", &query.branch_name)?;
        Ok(self.lock().found_prs.pop_front().flatten())
    }

    async fn ensure_comment(&self, comment: &Comment) -> PortResult<bool> {
        self.record("ensure_comment", &comment.topic)?;
        self.lock().comments.push(comment.clone());
        Ok(true)
    }

    async fn ensure_comment_removal(&self, number: u64, topic: &str) -> PortResult<()> {
        self.record("ensure_comment_removal", topic)?;
        self.lock()
            .removed_comments
            .push((number, topic.to_string()));
        Ok(())
    }

    async fn get_branch_status(&self, branch: &str, _ignore_tests: bool) -> PortResult<BranchStatus> {
        self.record("get_branch_status", branch)?;
        Ok(self.lock().branch_status.unwrap_or(BranchStatus::Yellow))
    }
}

#[derive(Debug, Default)]
struct PrManagerState {
    results: VecDeque<PortResult<EnsurePrOutcome>>,
    automerge: Option<PrAutomergeResult>,
    ensured: Vec<(String, bool)>,
    automerge_checks: Vec<u64>,
}

/// Creates PR #1 for every branch unless results are queued.
#[derive(Debug, Clone, Default)]
pub struct MockPrManager {
    state: Arc<Mutex<PrManagerState>>,
}

impl MockPrManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PrManagerState> {
        self.state.lock().expect("mock pr manager mutex poisoned")
    }

    pub fn push_result(&self, result: PortResult<EnsurePrOutcome>) {
        self.lock().results.push_back(result);
    }

    pub fn set_automerge(&self, result: PrAutomergeResult) {
        self.lock().automerge = Some(result);
    }

    /// Branches `ensure_pr` was called for.
    pub fn ensured(&self) -> Vec<String> {
        self.lock().ensured.iter().map(|(b, _)| b.clone()).collect()
    }

    /// Branches `ensure_pr` was called for with `force_pr` set.
    pub fn forced(&self) -> Vec<String> {
        self.lock()
            .ensured
            .iter()
            .filter(|(_, force)| *force)
            .map(|(b, _)| b.clone())
            .collect()
    }

    pub fn automerge_checks(&self) -> Vec<u64> {
        self.lock().automerge_checks.clone()
    }
}

#[async_trait]
impl PrManager for MockPrManager {
    async fn ensure_pr(&self, config: &BranchConfig, force_pr: bool) -> PortResult<EnsurePrOutcome> {
        let mut state = self.lock();
        state.ensured.push((config.branch_name.clone(), force_pr));
        state
            .results
            .pop_front()
            .unwrap_or_else(|| Ok(EnsurePrOutcome::WithPr(Pr::open(1))))
    }

    async fn check_auto_merge(&self, pr: &Pr, _config: &BranchConfig) -> PortResult<PrAutomergeResult> {
        let mut state = self.lock();
        state.automerge_checks.push(pr.number);
        Ok(state.automerge.clone().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct ArtifactUpdaterState {
    results: VecDeque<PortResult<PackageFilesResult>>,
    fallback: PackageFilesResult,
    calls: Vec<bool>,
}

/// Returns queued results, then the fallback result.
#[derive(Debug, Clone, Default)]
pub struct MockArtifactUpdater {
    state: Arc<Mutex<ArtifactUpdaterState>>,
}

impl MockArtifactUpdater {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ArtifactUpdaterState> {
        self.state.lock().expect("mock artifact updater mutex poisoned")
    }

    pub fn returning(self, result: PackageFilesResult) -> Self {
        self.lock().fallback = result;
        self
    }

    pub fn push_result(&self, result: PortResult<PackageFilesResult>) {
        self.lock().results.push_back(result);
    }

    pub fn calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// `reuse_existing_branch` flag of every call.
    pub fn reuse_flags(&self) -> Vec<bool> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl ArtifactUpdater for MockArtifactUpdater {
    async fn update(
        &self,
        _config: &BranchConfig,
        reuse_existing_branch: bool,
    ) -> PortResult<PackageFilesResult> {
        let mut state = self.lock();
        state.calls.push(reuse_existing_branch);
        match state.results.pop_front() {
            Some(result) => result,
            None => Ok(state.fallback.clone()),
        }
    }
}

/// Fixed answers per schedule kind; in schedule by default.
#[derive(Debug, Clone)]
pub struct MockSchedule {
    pub update: bool,
    pub automerge: bool,
}

impl Default for MockSchedule {
    fn default() -> Self {
        Self {
            update: true,
            automerge: true,
        }
    }
}

impl Schedule for MockSchedule {
    fn is_scheduled_now(&self, _config: &BranchConfig, kind: ScheduleKind) -> bool {
        match kind {
            ScheduleKind::Update => self.update,
            ScheduleKind::Automerge => self.automerge,
        }
    }
}

/// Same confidence for every upgrade.
#[derive(Debug, Clone, Default)]
pub struct MockMergeConfidence {
    pub level: Option<ConfidenceLevel>,
}

#[async_trait]
impl MergeConfidence for MockMergeConfidence {
    async fn confidence(&self, _upgrade: &Upgrade) -> PortResult<Option<ConfidenceLevel>> {
        Ok(self.level)
    }
}
