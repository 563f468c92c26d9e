//! The record handed back to the repository loop for every branch.

use crate::ports::PrBlockedBy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of one branch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BranchResult {
    NotScheduled,
    UpdateNotScheduled,
    Pending,
    NeedsApproval,
    BranchLimitReached,
    CommitLimitReached,
    PrLimitReached,
    NeedsPrApproval,
    NoWork,
    PrEdited,
    AlreadyExisted,
    PrCreated,
    Done,
    Error,
}

impl BranchResult {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotScheduled => "not-scheduled",
            Self::UpdateNotScheduled => "update-not-scheduled",
            Self::Pending => "pending",
            Self::NeedsApproval => "needs-approval",
            Self::BranchLimitReached => "branch-limit-reached",
            Self::CommitLimitReached => "commit-limit-reached",
            Self::PrLimitReached => "pr-limit-reached",
            Self::NeedsPrApproval => "needs-pr-approval",
            Self::NoWork => "no-work",
            Self::PrEdited => "pr-edited",
            Self::AlreadyExisted => "already-existed",
            Self::PrCreated => "pr-created",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BranchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessBranchResult {
    pub branch_exists: bool,
    pub result: BranchResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_no: Option<u64>,
    /// Sha pushed during this pass; `null` when nothing was pushed.
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_blocked_by: Option<PrBlockedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates_verified: Option<bool>,
    /// Merged straight into the base branch without a PR.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub automerged: bool,
}

impl ProcessBranchResult {
    pub fn new(branch_exists: bool, result: BranchResult) -> Self {
        Self {
            branch_exists,
            result,
            pr_no: None,
            commit_sha: None,
            pr_blocked_by: None,
            updates_verified: None,
            automerged: false,
        }
    }

    pub fn with_pr_no(mut self, pr_no: Option<u64>) -> Self {
        self.pr_no = pr_no;
        self
    }

    pub fn with_commit_sha(mut self, commit_sha: Option<String>) -> Self {
        self.commit_sha = commit_sha;
        self
    }

    pub fn with_pr_blocked_by(mut self, blocked_by: PrBlockedBy) -> Self {
        self.pr_blocked_by = Some(blocked_by);
        self
    }

    pub fn with_updates_verified(mut self, verified: bool) -> Self {
        self.updates_verified = Some(verified);
        self
    }

    pub fn automerged(mut self) -> Self {
        self.automerged = true;
        self
    }
}
