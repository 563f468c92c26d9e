//! Merging a branch straight into its base without opening a PR.

use crate::config::BranchConfig;
use crate::error::Result;
use crate::ports::{BranchStatus, Platform, Schedule, ScheduleKind};
use tracing::{debug, info, warn};
use upkeep_git::{GitError, Scm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchAutomergeResult {
    Automerged,
    NoAutomerge,
    OffSchedule,
    /// Checks are still running or the base branch refuses the merge for now.
    NotReady,
    /// The base branch moved on; the branch needs a rebase first.
    Stale,
    AbortedPrExists,
    BranchStatusError,
    Failed,
}

impl BranchAutomergeResult {
    /// A PR has to be raised because the branch could not be merged.
    pub fn requires_pr(&self) -> bool {
        matches!(
            self,
            Self::Stale | Self::AbortedPrExists | Self::BranchStatusError | Self::Failed
        )
    }
}

fn classify_merge_failure(err: &GitError) -> BranchAutomergeResult {
    if err.contains("not ready") {
        return BranchAutomergeResult::NotReady;
    }
    if err.contains("refusing to merge unrelated histories")
        || err.contains("Not possible to fast-forward")
        || err.contains("Updates were rejected because the tip of your current branch is behind")
    {
        return BranchAutomergeResult::Stale;
    }
    if err.contains("Protected branch") && err.contains("status check") {
        return BranchAutomergeResult::NotReady;
    }
    BranchAutomergeResult::Failed
}

pub async fn try_branch_automerge(
    scm: &dyn Scm,
    platform: &dyn Platform,
    schedule: &dyn Schedule,
    config: &BranchConfig,
    pr_exists: bool,
    dry_run: bool,
) -> Result<BranchAutomergeResult> {
    let branch = config.branch_name.as_str();
    if !config.is_branch_automerge() {
        return Ok(BranchAutomergeResult::NoAutomerge);
    }
    if !schedule.is_scheduled_now(config, ScheduleKind::Automerge) {
        debug!(branch, "branch automerge is off schedule");
        return Ok(BranchAutomergeResult::OffSchedule);
    }
    if pr_exists {
        debug!(branch, "PR exists, branch automerge aborted");
        return Ok(BranchAutomergeResult::AbortedPrExists);
    }

    match platform.get_branch_status(branch, config.ignore_tests).await? {
        BranchStatus::Green => {
            debug!(branch, "branch status is green, attempting merge");
            if dry_run {
                info!(branch, "DRY-RUN: would automerge branch");
                return Ok(BranchAutomergeResult::Automerged);
            }
            let merged = match scm.checkout_branch(&config.base_branch).await {
                Ok(_) => scm.merge_branch(branch).await,
                Err(err) => Err(err),
            };
            match merged {
                Ok(()) => {
                    info!(branch, base = %config.base_branch, "branch automerged");
                    Ok(BranchAutomergeResult::Automerged)
                }
                Err(err) if err.kind.is_repository_fatal() => Err(err.into()),
                Err(err) => {
                    let result = classify_merge_failure(&err);
                    warn!(branch, error = %err, ?result, "branch automerge failed");
                    Ok(result)
                }
            }
        }
        BranchStatus::Red => Ok(BranchAutomergeResult::BranchStatusError),
        BranchStatus::Yellow => {
            debug!(branch, "branch status pending, not automerging yet");
            Ok(BranchAutomergeResult::NoAutomerge)
        }
    }
}
