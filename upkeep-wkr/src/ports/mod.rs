//! Collaborators the branch processor talks to but does not implement:
//! the forge, PR management, package-file regeneration, scheduling and
//! merge confidence. Each has an in-memory double in [`mock`].

pub mod mock;

use crate::config::{BranchConfig, ConfidenceLevel, Upgrade};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use upkeep_common::{ErrorKind, FileChange};

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct PortError {
    pub kind: ErrorKind,
    pub message: String,
}

impl PortError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn external_host(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalHost, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }
}

pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pr {
    pub number: u64,
    pub state: PrState,
    #[serde(default)]
    pub title: String,
    /// Head commit as the forge last saw it.
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub target_branch: Option<String>,
    /// Target branch recorded in the PR body when the bot created it.
    #[serde(default)]
    pub recorded_target_branch: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    /// The rebase checkbox in the PR body is ticked.
    #[serde(default)]
    pub rebase_requested: bool,
}

impl Pr {
    pub fn open(number: u64) -> Self {
        Self {
            number,
            state: PrState::Open,
            title: String::new(),
            sha: None,
            target_branch: None,
            recorded_target_branch: None,
            labels: Vec::new(),
            rebase_requested: false,
        }
    }

    pub fn with_state(mut self, state: PrState) -> Self {
        self.state = state;
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Someone retargeted the PR after the bot opened it.
    pub fn target_branch_changed(&self) -> bool {
        match (&self.recorded_target_branch, &self.target_branch) {
            (Some(recorded), Some(current)) => recorded != current,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrStateFilter {
    Open,
    NotOpen,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindPr {
    pub branch_name: String,
    pub pr_title: Option<String>,
    pub state: PrStateFilter,
    pub target_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub number: u64,
    pub topic: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Green,
    Yellow,
    Red,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_branch_pr(&self, branch: &str) -> PortResult<Option<Pr>>;
    async fn find_pr(&self, query: &FindPr) -> PortResult<Option<Pr>>;
    /// Create or update the comment with `topic`; true when it changed.
    async fn ensure_comment(&self, comment: &Comment) -> PortResult<bool>;
    async fn ensure_comment_removal(&self, number: u64, topic: &str) -> PortResult<()>;
    async fn get_branch_status(&self, branch: &str, ignore_tests: bool) -> PortResult<BranchStatus>;
}

/// Why PR management did not produce a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrBlockedBy {
    RateLimited,
    NeedsApproval,
    AwaitingTests,
    BranchAutomerge,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsurePrOutcome {
    WithPr(Pr),
    WithoutPr(PrBlockedBy),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrAutomergeResult {
    pub automerged: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait PrManager: Send + Sync {
    /// `force_pr` bypasses the creation gates, used after a failed branch
    /// automerge.
    async fn ensure_pr(&self, config: &BranchConfig, force_pr: bool) -> PortResult<EnsurePrOutcome>;
    async fn check_auto_merge(&self, pr: &Pr, config: &BranchConfig) -> PortResult<PrAutomergeResult>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactError {
    pub file_name: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactNotice {
    pub file: String,
    pub message: String,
}

/// Regenerated package files and derived artifacts for a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageFilesResult {
    pub updated_package_files: Vec<FileChange>,
    pub updated_artifacts: Vec<FileChange>,
    pub artifact_errors: Vec<ArtifactError>,
    pub artifact_notices: Vec<ArtifactNotice>,
}

impl PackageFilesResult {
    pub fn all_changes(&self) -> Vec<FileChange> {
        self.updated_package_files
            .iter()
            .chain(&self.updated_artifacts)
            .cloned()
            .collect()
    }
}

#[async_trait]
pub trait ArtifactUpdater: Send + Sync {
    /// With `reuse_existing_branch` the files are read from the existing
    /// branch instead of the base branch.
    async fn update(
        &self,
        config: &BranchConfig,
        reuse_existing_branch: bool,
    ) -> PortResult<PackageFilesResult>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Update,
    Automerge,
}

pub trait Schedule: Send + Sync {
    fn is_scheduled_now(&self, config: &BranchConfig, kind: ScheduleKind) -> bool;
}

#[async_trait]
pub trait MergeConfidence: Send + Sync {
    /// `None` when no score is known.
    async fn confidence(&self, upgrade: &Upgrade) -> PortResult<Option<ConfidenceLevel>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Limit {
    Branches,
    Commits,
}

pub trait Limits: Send + Sync {
    fn is_limit_reached(&self, limit: Limit) -> bool;
    fn increment(&self, limit: Limit);
}

/// Per-run counters against configured maxima; an unset maximum never
/// limits.
#[derive(Debug, Default)]
pub struct CountingLimits {
    max: HashMap<Limit, u32>,
    counts: Mutex<HashMap<Limit, u32>>,
}

impl CountingLimits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max(mut self, limit: Limit, max: u32) -> Self {
        self.max.insert(limit, max);
        self
    }

    pub fn count(&self, limit: Limit) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&limit)
            .copied()
            .unwrap_or(0)
    }
}

impl Limits for CountingLimits {
    fn is_limit_reached(&self, limit: Limit) -> bool {
        match self.max.get(&limit) {
            Some(&max) => self.count(limit) >= max,
            None => false,
        }
    }

    fn increment(&self, limit: Limit) {
        *self
            .counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(limit)
            .or_insert(0) += 1;
    }
}

/// What the worker remembers about a branch between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchCacheRecord {
    pub sha: String,
    pub commit_fingerprint: String,
}

pub trait BranchCacheStore: Send + Sync {
    fn get(&self, branch: &str) -> Option<BranchCacheRecord>;
    fn set(&self, branch: &str, record: BranchCacheRecord);
}

#[derive(Debug, Default)]
pub struct InMemoryBranchCache {
    records: Mutex<HashMap<String, BranchCacheRecord>>,
}

impl InMemoryBranchCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BranchCacheStore for InMemoryBranchCache {
    fn get(&self, branch: &str) -> Option<BranchCacheRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(branch)
            .cloned()
    }

    fn set(&self, branch: &str, record: BranchCacheRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(branch.to_string(), record);
    }
}
