//! Branch processor: turns one branch configuration into exactly one
//! [`ProcessBranchResult`].
//!
//! The pass runs through ordered gates (closed PRs, approval, limits,
//! human edits, schedule, release age), regenerates the branch content,
//! commits it, tries a branch automerge and finally hands over to PR
//! management. Failures inside a pass become an `error` outcome unless
//! their kind escapes the branch boundary, in which case they are returned
//! to the repository loop.

pub mod automerge;
pub mod comments;
pub mod fingerprint;
pub mod outcome;
pub mod reuse;

pub use automerge::{BranchAutomergeResult, try_branch_automerge};
pub use fingerprint::commit_fingerprint;
pub use outcome::{BranchResult, ProcessBranchResult};
pub use reuse::{ReuseDecision, should_reuse_existing_branch};

use crate::config::{
    BranchConfig, ConfidenceLevel, Notification, PrCreation, RebaseWhen, RecreateWhen, RunMode,
};
use crate::error::{Result, WorkerError};
use crate::ports::{
    ArtifactError, ArtifactUpdater, BranchCacheRecord, BranchCacheStore, Comment,
    EnsurePrOutcome, FindPr, Limit, Limits, MergeConfidence, Platform, Pr, PrBlockedBy,
    PrManager, PrState, PrStateFilter, Schedule, ScheduleKind,
};
use crate::tasks::PostUpgradeRunner;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use upkeep_common::{ErrorKind, FileChange};
use upkeep_git::{CommitFilesConfig, Scm};

/// Releases younger than this get a lockfile error instead of a PR when
/// their artifacts fail to update.
const LOCKFILE_GRACE: Duration = Duration::from_secs(2 * 60 * 60);

/// External collaborators of the processor.
#[derive(Clone)]
pub struct Collaborators {
    pub platform: Arc<dyn Platform>,
    pub pr_manager: Arc<dyn PrManager>,
    pub artifacts: Arc<dyn ArtifactUpdater>,
    pub schedule: Arc<dyn Schedule>,
    pub confidence: Arc<dyn MergeConfidence>,
    pub limits: Arc<dyn Limits>,
    pub branch_cache: Arc<dyn BranchCacheStore>,
}

/// What is known about the branch when a pass fails midway.
#[derive(Debug, Default)]
struct BranchRun {
    branch_exists: bool,
    pr_no: Option<u64>,
    commit_sha: Option<String>,
}

/// Files and problems produced by regenerating a branch.
#[derive(Debug, Default)]
struct Regenerated {
    commit_sha: Option<String>,
    artifact_errors: Vec<ArtifactError>,
    task_errors: Vec<ArtifactError>,
    notices: Vec<crate::ports::ArtifactNotice>,
}

pub struct BranchWorker {
    scm: Arc<dyn Scm>,
    ports: Collaborators,
    tasks: PostUpgradeRunner,
    dry_run: bool,
}

/// Outcome of a repository run over many branches.
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<(String, ProcessBranchResult)>,
    /// The error that stopped the run early.
    pub aborted_by: Option<WorkerError>,
}

impl BranchWorker {
    pub fn new(scm: Arc<dyn Scm>, ports: Collaborators, tasks: PostUpgradeRunner) -> Self {
        Self {
            scm,
            ports,
            tasks,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Process branches one after another. A failing branch does not stop
    /// its siblings; errors that escape a branch end the run.
    pub async fn run_branches(&self, configs: &[BranchConfig]) -> RunReport {
        let mut report = RunReport::default();
        for config in configs {
            match self.process_branch(config).await {
                Ok(result) => {
                    info!(branch = %config.branch_name, result = %result.result, "branch processed");
                    report.outcomes.push((config.branch_name.clone(), result));
                }
                Err(err) if err.kind() == ErrorKind::LockfileError => {
                    warn!(branch = %config.branch_name, error = %err, "lockfile error, branch skipped");
                    let exists = self.scm.branch_exists(&config.branch_name).await;
                    report.outcomes.push((
                        config.branch_name.clone(),
                        ProcessBranchResult::new(exists, BranchResult::Error),
                    ));
                }
                Err(err) => {
                    warn!(branch = %config.branch_name, kind = %err.kind(), error = %err, "aborting repository run");
                    report.aborted_by = Some(err);
                    break;
                }
            }
        }
        report
    }

    pub async fn process_branch(&self, config: &BranchConfig) -> Result<ProcessBranchResult> {
        debug!(branch = %config.branch_name, deps = ?config.dep_names(), "processing branch");
        let mut run = BranchRun::default();
        match self.evaluate(config, &mut run).await {
            Ok(result) => Ok(result),
            Err(err) => self.convert_error(config, run, err).await,
        }
    }

    async fn convert_error(
        &self,
        config: &BranchConfig,
        run: BranchRun,
        err: WorkerError,
    ) -> Result<ProcessBranchResult> {
        let text = err.full_text();
        let stale = text.contains("[rejected]") && text.contains("(stale info)");
        if stale || text.contains("fatal: bad revision") {
            debug!(branch = %config.branch_name, "branch changed underneath the worker");
            return Err(WorkerError::of_kind(ErrorKind::RepositoryChanged, text));
        }
        if text.contains("fatal: Authentication failed") {
            return Err(WorkerError::of_kind(ErrorKind::AuthenticationFailed, text));
        }
        if err.kind().escapes_branch() {
            return Err(err);
        }

        warn!(branch = %config.branch_name, code = %err.code(), error = %err, "error processing branch");
        if let Err(restore) = self.scm.checkout_branch(&config.base_branch).await {
            debug!(error = %restore, "could not restore base branch");
        }
        Ok(ProcessBranchResult::new(run.branch_exists, BranchResult::Error)
            .with_pr_no(run.pr_no)
            .with_commit_sha(run.commit_sha))
    }

    async fn evaluate(
        &self,
        input: &BranchConfig,
        run: &mut BranchRun,
    ) -> Result<ProcessBranchResult> {
        let scm = self.scm.as_ref();
        let platform = self.ports.platform.as_ref();
        let limits = self.ports.limits.as_ref();
        let mut config = input.clone();
        let dashboard_check = config.dependency_dashboard_check;

        let mut branch_exists = scm.branch_exists(&config.branch_name).await;
        if !branch_exists
            && let Some(old) = config.old_prefix_branch_name()
            && scm.branch_exists(&old).await
        {
            debug!(branch = %config.branch_name, old = %old, "branch exists under the old prefix");
            config.branch_name = old;
            branch_exists = true;
        }
        run.branch_exists = branch_exists;
        let branch = config.branch_name.clone();

        let branch_pr = platform.get_branch_pr(&branch).await?;
        run.pr_no = branch_pr.as_ref().map(|pr| pr.number);
        let pr_no = run.pr_no;
        let rebase_requested = branch_pr
            .as_ref()
            .is_some_and(|pr| pr.rebase_requested || pr.has_label(config.rebase_label()));

        if branch_pr.is_none()
            && config.recreate_when != RecreateWhen::Always
            && !dashboard_check
            && let Some(existing) = self.pr_already_existed(&config).await?
        {
            debug!(branch = %branch, pr = existing.number, "closed PR already exists, skipping branch");
            self.handle_closed_pr(&config, &existing, branch_exists).await?;
            return Ok(ProcessBranchResult::new(false, BranchResult::AlreadyExisted)
                .with_pr_no(Some(existing.number)));
        }

        if !branch_exists
            && (config.dependency_dashboard_approval || config.mode == RunMode::Silent)
            && !dashboard_check
        {
            debug!(branch = %branch, "branch needs approval");
            return Ok(ProcessBranchResult::new(false, BranchResult::NeedsApproval).with_pr_no(pr_no));
        }
        if !branch_exists && limits.is_limit_reached(Limit::Branches) && !dashboard_check {
            debug!(branch = %branch, "reached branch limit, skipping branch creation");
            return Ok(ProcessBranchResult::new(false, BranchResult::BranchLimitReached).with_pr_no(pr_no));
        }
        if limits.is_limit_reached(Limit::Commits) && !dashboard_check {
            debug!(branch = %branch, "reached commits limit, skipping branch");
            return Ok(ProcessBranchResult::new(branch_exists, BranchResult::CommitLimitReached)
                .with_pr_no(pr_no));
        }
        if !branch_exists && config.pending_checks && !dashboard_check {
            debug!(branch = %branch, "branch checks are pending");
            return Ok(ProcessBranchResult::new(false, BranchResult::Pending).with_pr_no(pr_no));
        }

        if branch_exists {
            let stop_updating = match (&branch_pr, &config.stop_updating_label) {
                (Some(pr), Some(label)) => pr.has_label(label),
                _ => false,
            };
            let rebase_checked = branch_pr.as_ref().is_some_and(|pr| pr.rebase_requested);
            if stop_updating && !dashboard_check && !rebase_checked {
                info!(branch = %branch, "branch updating is skipped because of the stop-updating label");
                return Ok(ProcessBranchResult::new(true, BranchResult::NoWork).with_pr_no(pr_no));
            }

            let is_modified = scm.is_branch_modified(&branch, &config.base_branch).await?;
            if let Some(pr) = &branch_pr {
                if pr.state != PrState::Open {
                    return Err(WorkerError::of_kind(
                        ErrorKind::RepositoryChanged,
                        format!("PR #{} for {branch} is no longer open", pr.number),
                    ));
                }
                if is_modified || pr.target_branch_changed() {
                    debug!(branch = %branch, pr = pr.number, "PR has been edited");
                    self.handle_modified_pr(&config, pr).await?;
                    if !(dashboard_check || rebase_requested) {
                        return Ok(ProcessBranchResult::new(true, BranchResult::PrEdited).with_pr_no(pr_no));
                    }
                }
            } else if is_modified {
                let old_pr = platform
                    .find_pr(&FindPr {
                        branch_name: branch.clone(),
                        pr_title: None,
                        state: PrStateFilter::NotOpen,
                        target_branch: Some(config.base_branch.clone()),
                    })
                    .await?;
                let Some(old_pr) = old_pr else {
                    debug!(branch = %branch, "branch has been edited but no PR was found");
                    return Ok(ProcessBranchResult::new(true, BranchResult::PrEdited));
                };
                let branch_sha = scm.get_branch_commit(&branch).await;
                match &old_pr.sha {
                    Some(sha) if branch_sha.as_deref() != Some(sha.as_str()) => {
                        debug!(branch = %branch, pr = old_pr.number, "old PR found but the sha differs");
                        return Ok(ProcessBranchResult::new(true, BranchResult::PrEdited));
                    }
                    _ => debug!(branch = %branch, pr = old_pr.number, "old PR matches this branch, overriding it"),
                }
            }
        }

        if !dashboard_check && !self.ports.schedule.is_scheduled_now(&config, ScheduleKind::Update) {
            if !branch_exists {
                debug!(branch = %branch, "skipping branch creation as not within schedule");
                return Ok(ProcessBranchResult::new(false, BranchResult::NotScheduled).with_pr_no(pr_no));
            }
            if !config.update_not_scheduled && !rebase_requested {
                debug!(branch = %branch, "skipping branch update as not within schedule");
                return Ok(ProcessBranchResult::new(true, BranchResult::UpdateNotScheduled)
                    .with_pr_no(pr_no));
            }
            if branch_pr.is_none() && !config.is_branch_automerge() {
                debug!(branch = %branch, "branch exists without PR, waiting for schedule");
                return Ok(ProcessBranchResult::new(true, BranchResult::NotScheduled).with_pr_no(pr_no));
            }
            debug!(branch = %branch, "branch and PR exist outside schedule, updating if necessary");
        }

        if !dashboard_check
            && !branch_exists
            && matches!(config.pr_creation, PrCreation::NotPending | PrCreation::StatusSuccess)
            && self.has_unstable_upgrade(&config).await?
        {
            debug!(branch = %branch, "upgrades do not yet meet release age or confidence");
            return Ok(ProcessBranchResult::new(false, BranchResult::Pending).with_pr_no(pr_no));
        }

        let decision = if dashboard_check || rebase_requested {
            debug!(branch = %branch, "manual rebase requested");
            ReuseDecision::default()
        } else if branch_exists
            && config.rebase_when == RebaseWhen::Never
            && !has_keep_updated_label(&config, branch_pr.as_ref())
        {
            debug!(branch = %branch, "rebasing is disabled, skipping branch update");
            return Ok(ProcessBranchResult::new(true, BranchResult::NoWork).with_pr_no(pr_no));
        } else {
            should_reuse_existing_branch(scm, &config).await?
        };

        let fingerprint = commit_fingerprint(&config);
        let branch_sha = scm.get_branch_commit(&branch).await;
        let unchanged = decision.reuse_existing_branch
            && match (self.ports.branch_cache.get(&branch), &branch_sha) {
                (Some(record), Some(sha)) => {
                    record.commit_fingerprint == fingerprint && &record.sha == sha
                }
                _ => false,
            };

        let (regenerated, updates_verified) = if unchanged {
            debug!(branch = %branch, "branch fingerprint matches, no need to rebuild");
            (Regenerated::default(), false)
        } else {
            let force = dashboard_check
                || rebase_requested
                || !branch_exists
                || decision.is_conflicted == Some(true);
            let regenerated = self
                .regenerate(&config, branch_pr.as_ref(), &decision, branch_exists, force, &fingerprint)
                .await?;
            (regenerated, true)
        };
        let commit_sha = regenerated.commit_sha.clone();
        run.commit_sha = commit_sha.clone();

        if commit_sha.is_none() && !branch_exists {
            debug!(branch = %branch, "nothing to commit for a new branch");
            return Ok(ProcessBranchResult::new(false, BranchResult::NoWork)
                .with_updates_verified(updates_verified));
        }
        if commit_sha.is_some()
            && config.pr_creation != PrCreation::Immediate
            && branch_pr.is_none()
            && !dashboard_check
            && !rebase_requested
        {
            debug!(branch = %branch, sha = ?commit_sha, "branch status pending");
            return Ok(ProcessBranchResult::new(true, BranchResult::Pending)
                .with_commit_sha(commit_sha)
                .with_updates_verified(updates_verified));
        }

        let mut force_pr = false;
        if regenerated.artifact_errors.is_empty()
            && regenerated.task_errors.is_empty()
            && (commit_sha.is_none() || config.ignore_tests)
        {
            let merge = try_branch_automerge(
                scm,
                platform,
                self.ports.schedule.as_ref(),
                &config,
                branch_pr.is_some(),
                self.dry_run,
            )
            .await?;
            match merge {
                BranchAutomergeResult::Automerged => {
                    let exists = if self.dry_run {
                        info!(branch = %branch, "DRY-RUN: Would delete automerged branch");
                        true
                    } else {
                        scm.delete_branch(&branch).await?;
                        false
                    };
                    return Ok(ProcessBranchResult::new(exists, BranchResult::Done)
                        .with_commit_sha(commit_sha)
                        .with_updates_verified(updates_verified)
                        .automerged());
                }
                BranchAutomergeResult::OffSchedule => {
                    debug!(branch = %branch, "branch automerge is off schedule");
                    return Ok(ProcessBranchResult::new(branch_exists, BranchResult::NotScheduled)
                        .with_commit_sha(commit_sha));
                }
                other if other.requires_pr() => {
                    debug!(branch = %branch, result = ?other, "branch automerge did not merge, forcing PR");
                    force_pr = true;
                }
                other => debug!(branch = %branch, result = ?other, "no branch automerge"),
            }
        }

        let mut final_pr_no = pr_no;
        match self
            .ensure_pr_stage(&config, force_pr, &regenerated, commit_sha.is_some())
            .await
        {
            Ok(PrStage::Finished(result)) => {
                return Ok(result
                    .with_commit_sha(commit_sha)
                    .with_updates_verified(updates_verified));
            }
            Ok(PrStage::Continue(number)) => final_pr_no = number.or(final_pr_no),
            Err(err)
                if matches!(err.kind(), ErrorKind::ExternalHost | ErrorKind::RepositoryChanged) =>
            {
                return Err(err);
            }
            Err(err) => warn!(branch = %branch, error = %err, "error ensuring PR"),
        }

        let result = if branch_exists {
            ProcessBranchResult::new(true, BranchResult::Done)
        } else {
            ProcessBranchResult::new(true, BranchResult::PrCreated)
        };
        Ok(result
            .with_pr_no(final_pr_no)
            .with_commit_sha(commit_sha)
            .with_updates_verified(updates_verified))
    }

    async fn regenerate(
        &self,
        config: &BranchConfig,
        branch_pr: Option<&Pr>,
        decision: &ReuseDecision,
        branch_exists: bool,
        force: bool,
        fingerprint: &str,
    ) -> Result<Regenerated> {
        let scm = self.scm.as_ref();
        let branch = config.branch_name.as_str();
        let reuse = decision.reuse_existing_branch;

        let start = if reuse { branch } else { config.base_branch.as_str() };
        scm.checkout_branch(start).await?;
        let files = self.ports.artifacts.update(config, reuse).await?;
        let (package_files, artifacts, task_errors) =
            match self.tasks.execute_post_upgrade_commands(scm, config, &files).await? {
                Some(result) => (
                    result.updated_package_files,
                    result.updated_artifacts,
                    result.artifact_errors,
                ),
                None => (
                    files.updated_package_files.clone(),
                    files.updated_artifacts.clone(),
                    Vec::new(),
                ),
            };

        if !files.artifact_errors.is_empty() {
            let newest = config.upgrades.iter().filter_map(|u| u.release_timestamp).max();
            match newest {
                Some(released) if is_recent(released) && !branch_exists => {
                    debug!(branch, "release is less than 2 hours old, raising lockfile error instead of PR");
                    return Err(WorkerError::Lockfile {
                        dep_names: config.dep_names().join(", "),
                    });
                }
                Some(released) if is_recent(released) => {
                    debug!(branch, "release is recent but the branch exists, updating anyway");
                }
                Some(_) => debug!(branch, "release is older than 2 hours, raising PR with artifact errors"),
                None => debug!(branch, "no release timestamp, raising PR with artifact errors"),
            }
        } else if task_errors.is_empty()
            && !artifacts.is_empty()
            && let Some(pr) = branch_pr
        {
            if self.dry_run {
                info!(branch, pr = pr.number, "DRY-RUN: Would remove artifact error comment");
            } else {
                self.ports
                    .platform
                    .ensure_comment_removal(pr.number, comments::ARTIFACT_ERROR_TOPIC)
                    .await?;
            }
        }

        let changes: Vec<FileChange> = package_files.into_iter().chain(artifacts).collect();
        let commit_sha = if changes.is_empty() {
            debug!(branch, "no files to commit");
            None
        } else if self.dry_run {
            info!(branch, files = changes.len(), "DRY-RUN: Would commit files to branch");
            None
        } else {
            scm.commit_files(&CommitFilesConfig {
                branch_name: branch.to_string(),
                base_branch: Some(config.base_branch.clone()),
                files: changes,
                message: config.commit_message(),
                force,
            })
            .await?
        };
        scm.checkout_branch(&config.base_branch).await?;

        if commit_sha.is_some() {
            self.ports.limits.increment(Limit::Commits);
            if !branch_exists {
                self.ports.limits.increment(Limit::Branches);
            }
        }
        let recorded = match &commit_sha {
            Some(sha) => Some(sha.clone()),
            None => scm.get_branch_commit(branch).await,
        };
        if let Some(sha) = recorded {
            self.ports.branch_cache.set(
                branch,
                BranchCacheRecord {
                    sha,
                    commit_fingerprint: fingerprint.to_string(),
                },
            );
        }

        Ok(Regenerated {
            commit_sha,
            artifact_errors: files.artifact_errors,
            task_errors,
            notices: files.artifact_notices,
        })
    }

    async fn ensure_pr_stage(
        &self,
        config: &BranchConfig,
        force_pr: bool,
        regenerated: &Regenerated,
        has_new_commit: bool,
    ) -> Result<PrStage> {
        let branch = config.branch_name.as_str();
        debug!(branch, force_pr, "ensuring PR");
        let pr = match self.ports.pr_manager.ensure_pr(config, force_pr).await? {
            EnsurePrOutcome::WithoutPr(blocked_by) => {
                let result = match blocked_by {
                    PrBlockedBy::RateLimited => BranchResult::PrLimitReached,
                    PrBlockedBy::NeedsApproval => BranchResult::NeedsPrApproval,
                    PrBlockedBy::AwaitingTests => BranchResult::Pending,
                    PrBlockedBy::BranchAutomerge => BranchResult::Done,
                    PrBlockedBy::Error => BranchResult::Error,
                };
                debug!(branch, ?blocked_by, "PR not created");
                let exists = self.scm.branch_exists(branch).await;
                return Ok(PrStage::Finished(
                    ProcessBranchResult::new(exists, result).with_pr_blocked_by(blocked_by),
                ));
            }
            EnsurePrOutcome::WithPr(pr) => pr,
        };

        let suppress_artifact_errors = config.suppresses(Notification::ArtifactErrors)
            || config.suppresses(Notification::LockFileErrors);

        if !regenerated.artifact_errors.is_empty() {
            if suppress_artifact_errors {
                debug!(branch, "artifact error notification suppressed");
            } else {
                let content = comments::artifact_errors(config, &regenerated.artifact_errors);
                self.ensure_comment(pr.number, comments::ARTIFACT_ERROR_TOPIC, content)
                    .await?;
            }
        }
        if !regenerated.task_errors.is_empty() {
            if suppress_artifact_errors {
                debug!(branch, "post-upgrade task notification suppressed");
            } else {
                let content = comments::task_errors(&regenerated.task_errors);
                self.ensure_comment(pr.number, comments::TASK_ERROR_TOPIC, content)
                    .await?;
            }
        }

        let clean = regenerated.artifact_errors.is_empty() && regenerated.task_errors.is_empty();
        if clean && config.automerge && (config.ignore_tests || !has_new_commit) {
            debug!(branch, pr = pr.number, "checking PR automerge");
            let merged = self.ports.pr_manager.check_auto_merge(&pr, config).await?;
            if merged.automerged {
                return Ok(PrStage::Finished(
                    ProcessBranchResult::new(true, BranchResult::Done)
                        .with_pr_no(Some(pr.number))
                        .automerged(),
                ));
            }
            debug!(branch, reason = ?merged.reason, "PR not automerged");
        }

        if !regenerated.notices.is_empty() {
            let content = comments::artifact_notices(&regenerated.notices);
            self.ensure_comment(pr.number, comments::ARTIFACT_NOTICE_TOPIC, content)
                .await?;
        }
        Ok(PrStage::Continue(Some(pr.number)))
    }

    async fn ensure_comment(&self, number: u64, topic: &str, content: String) -> Result<()> {
        if self.dry_run {
            info!(pr = number, topic, "DRY-RUN: Would ensure comment");
            return Ok(());
        }
        self.ports
            .platform
            .ensure_comment(&Comment {
                number,
                topic: topic.to_string(),
                content,
            })
            .await?;
        Ok(())
    }

    /// A previously closed or merged PR for this branch.
    async fn pr_already_existed(&self, config: &BranchConfig) -> Result<Option<Pr>> {
        let platform = self.ports.platform.as_ref();
        let mut query = FindPr {
            branch_name: config.branch_name.clone(),
            pr_title: config.pr_title.clone(),
            state: PrStateFilter::NotOpen,
            target_branch: None,
        };
        if let Some(pr) = platform.find_pr(&query).await? {
            return Ok(Some(pr));
        }
        if let Some(old) = config.old_prefix_branch_name() {
            query.branch_name = old;
            return Ok(platform.find_pr(&query).await?);
        }
        Ok(None)
    }

    async fn handle_closed_pr(&self, config: &BranchConfig, pr: &Pr, branch_exists: bool) -> Result<()> {
        let branch = config.branch_name.as_str();
        match pr.state {
            PrState::Closed => {
                if config.suppresses(Notification::PrIgnoreNotification) {
                    debug!(branch, "ignore notification suppressed");
                } else {
                    self.ensure_comment(pr.number, comments::IGNORE_TOPIC, comments::ignore_notification(config))
                        .await?;
                }
                if branch_exists {
                    if self.dry_run {
                        info!(branch, "DRY-RUN: Would delete branch");
                    } else {
                        self.scm.delete_branch(branch).await?;
                    }
                }
            }
            PrState::Merged => debug!(branch, pr = pr.number, "matching PR was merged previously"),
            PrState::Open => {}
        }
        Ok(())
    }

    async fn handle_modified_pr(&self, config: &BranchConfig, pr: &Pr) -> Result<()> {
        if config.suppresses(Notification::PrEditedNotification) {
            debug!(branch = %config.branch_name, "edited notification suppressed");
            return Ok(());
        }
        self.ensure_comment(
            pr.number,
            comments::EDITED_TOPIC,
            comments::edited_notification().to_string(),
        )
        .await
    }

    /// Any upgrade younger than its minimum release age or below its
    /// minimum confidence.
    async fn has_unstable_upgrade(&self, config: &BranchConfig) -> Result<bool> {
        let now = Utc::now();
        for upgrade in &config.upgrades {
            if upgrade.is_too_young(now) {
                debug!(dep = %upgrade.dep_name, "release is younger than the minimum release age");
                return Ok(true);
            }
            if let Some(minimum) = upgrade.minimum_confidence {
                let level = self
                    .ports
                    .confidence
                    .confidence(upgrade)
                    .await?
                    .unwrap_or(ConfidenceLevel::Neutral);
                if level < minimum {
                    debug!(dep = %upgrade.dep_name, ?level, ?minimum, "merge confidence below minimum");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

enum PrStage {
    Finished(ProcessBranchResult),
    /// Continue to the final outcome with this PR number.
    Continue(Option<u64>),
}

fn has_keep_updated_label(config: &BranchConfig, pr: Option<&Pr>) -> bool {
    match (&config.keep_updated_label, pr) {
        (Some(label), Some(pr)) => pr.has_label(label),
        _ => false,
    }
}

fn is_recent(released: DateTime<Utc>) -> bool {
    Utc::now()
        .signed_duration_since(released)
        .to_std()
        .map(|age| age < LOCKFILE_GRACE)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutomergeType, Upgrade};
    use crate::ports::mock::{
        MockArtifactUpdater, MockMergeConfidence, MockPlatform, MockPrManager, MockSchedule,
    };
    use crate::ports::{CountingLimits, InMemoryBranchCache, PackageFilesResult};
    use crate::tasks::{MockCommandExecutor, TaskSettings};
    use upkeep_git::MockScm;

    const BRANCH: &str = "upkeep/lodash";

    struct Harness {
        scm: MockScm,
        platform: MockPlatform,
        prs: MockPrManager,
        artifacts: MockArtifactUpdater,
        cache: Arc<InMemoryBranchCache>,
        limits: Arc<CountingLimits>,
        schedule: MockSchedule,
    }

    impl Harness {
        fn new(scm: MockScm) -> Self {
            Self {
                scm,
                platform: MockPlatform::new(),
                prs: MockPrManager::new(),
                artifacts: MockArtifactUpdater::new().returning(updated()),
                cache: Arc::new(InMemoryBranchCache::new()),
                limits: Arc::new(CountingLimits::new()),
                schedule: MockSchedule::default(),
            }
        }

        fn worker(&self) -> BranchWorker {
            let settings = TaskSettings {
                allowed_commands: Vec::new(),
                allow_command_templating: true,
                expose_all_env: false,
                cache_dir: std::env::temp_dir(),
            };
            let ports = Collaborators {
                platform: Arc::new(self.platform.clone()),
                pr_manager: Arc::new(self.prs.clone()),
                artifacts: Arc::new(self.artifacts.clone()),
                schedule: Arc::new(self.schedule.clone()),
                confidence: Arc::new(MockMergeConfidence::default()),
                limits: self.limits.clone(),
                branch_cache: self.cache.clone(),
            };
            BranchWorker::new(
                Arc::new(self.scm.clone()),
                ports,
                PostUpgradeRunner::new(settings, Arc::new(MockCommandExecutor::new())),
            )
        }
    }

    fn updated() -> PackageFilesResult {
        PackageFilesResult {
            updated_package_files: vec![FileChange::addition("package.json", "{}")],
            ..PackageFilesResult::default()
        }
    }

    fn config() -> BranchConfig {
        let mut config = BranchConfig::new(BRANCH, "main");
        config.upgrades = vec![Upgrade::new("lodash")];
        config
    }

    #[tokio::test]
    async fn test_new_branch_creates_pr() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::PrCreated);
        assert!(result.branch_exists);
        assert_eq!(result.pr_no, Some(1));
        assert_eq!(result.commit_sha.as_deref(), Some("sha-1"));
        assert_eq!(result.updates_verified, Some(true));
        assert_eq!(h.limits.count(Limit::Commits), 1);
        assert_eq!(h.limits.count(Limit::Branches), 1);
        assert!(h.scm.commits()[0].force);
        assert_eq!(h.cache.get(BRANCH).map(|r| r.sha), Some("sha-1".to_string()));
    }

    #[tokio::test]
    async fn test_existing_branch_without_changes_is_done() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.scm.push_commit_result(Ok(None));
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::Done);
        assert_eq!(result.commit_sha, None);
        assert_eq!(h.limits.count(Limit::Commits), 0);
        assert_eq!(h.artifacts.reuse_flags(), vec![true]);
    }

    #[tokio::test]
    async fn test_matching_fingerprint_skips_regeneration() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.cache.set(
            BRANCH,
            BranchCacheRecord {
                sha: "abc".into(),
                commit_fingerprint: commit_fingerprint(&config()),
            },
        );
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::Done);
        assert_eq!(result.updates_verified, Some(false));
        assert_eq!(h.artifacts.calls(), 0);
        assert!(h.scm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_commit_limit_blocks_existing_branch() {
        let mut h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.limits = Arc::new(CountingLimits::new().with_max(Limit::Commits, 0));
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::CommitLimitReached);
        assert!(result.branch_exists);
        assert!(h.scm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_silent_mode_needs_approval() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        let mut cfg = config();
        cfg.mode = RunMode::Silent;
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::NeedsApproval);
        assert!(h.scm.commits().is_empty());
    }

    #[tokio::test]
    async fn test_stop_updating_label() {
        let mut pr = Pr::open(5);
        pr.labels = vec!["stop-updating".into()];
        let mut h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.platform = MockPlatform::new().with_branch_pr(BRANCH, pr);
        let mut cfg = config();
        cfg.stop_updating_label = Some("stop-updating".into());
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::NoWork);
        assert_eq!(result.pr_no, Some(5));
    }

    #[tokio::test]
    async fn test_rebase_never_skips_existing_branch() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        let mut cfg = config();
        cfg.rebase_when = RebaseWhen::Never;
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::NoWork);
        assert_eq!(h.artifacts.calls(), 0);
    }

    #[tokio::test]
    async fn test_young_release_is_pending() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        let mut cfg = config();
        cfg.pr_creation = PrCreation::NotPending;
        cfg.upgrades[0].release_timestamp = Some(Utc::now());
        cfg.upgrades[0].minimum_release_age = Some("3 days".into());
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::Pending);
        assert!(!result.branch_exists);
        assert_eq!(h.artifacts.calls(), 0);
    }

    #[tokio::test]
    async fn test_not_pending_pr_creation_waits_after_commit() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        let mut cfg = config();
        cfg.pr_creation = PrCreation::NotPending;
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::Pending);
        assert_eq!(result.commit_sha.as_deref(), Some("sha-1"));
        assert!(h.prs.ensured().is_empty());
    }

    #[tokio::test]
    async fn test_pr_blocked_by_rate_limit() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        h.prs
            .push_result(Ok(EnsurePrOutcome::WithoutPr(PrBlockedBy::RateLimited)));
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::PrLimitReached);
        assert_eq!(result.pr_blocked_by, Some(PrBlockedBy::RateLimited));
        assert_eq!(result.commit_sha.as_deref(), Some("sha-1"));
    }

    #[tokio::test]
    async fn test_branch_automerge_deletes_branch() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.scm.push_commit_result(Ok(None));
        h.platform.set_branch_status(crate::ports::BranchStatus::Green);
        let mut cfg = config();
        cfg.automerge = true;
        cfg.automerge_type = AutomergeType::Branch;
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::Done);
        assert!(result.automerged);
        assert!(!result.branch_exists);
        assert!(h.scm.calls().contains(&format!("delete_branch:{BRANCH}")));
        assert!(h.prs.ensured().is_empty());
    }

    #[tokio::test]
    async fn test_failed_branch_automerge_forces_pr() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.scm.push_commit_result(Ok(None));
        h.platform.set_branch_status(crate::ports::BranchStatus::Red);
        let mut cfg = config();
        cfg.automerge = true;
        cfg.automerge_type = AutomergeType::Branch;
        let result = h.worker().process_branch(&cfg).await.unwrap();
        assert_eq!(result.result, BranchResult::Done);
        assert_eq!(h.prs.forced(), vec![BRANCH.to_string()]);
    }

    #[tokio::test]
    async fn test_unclassified_error_becomes_error_outcome() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        h.scm.fail_next(
            "commit_files",
            upkeep_git::GitError::new(ErrorKind::Unclassified, "index.lock exists"),
        );
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::Error);
        assert!(result.branch_exists);
        assert_eq!(h.scm.calls().last().map(String::as_str), Some("checkout_branch:main"));
    }

    #[tokio::test]
    async fn test_stale_info_becomes_repository_changed() {
        let h = Harness::new(MockScm::new("/tmp/repo").with_branch(BRANCH, "abc"));
        let mut err = upkeep_git::GitError::new(ErrorKind::Unclassified, "push failed");
        err.stderr = " ! [rejected]        upkeep/lodash -> upkeep/lodash (stale info)".into();
        h.scm.fail_next("commit_files", err);
        let err = h.worker().process_branch(&config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RepositoryChanged);
    }

    #[tokio::test]
    async fn test_external_host_error_propagates() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        h.platform.fail_next(
            "get_branch_pr",
            crate::ports::PortError::external_host("rate limited"),
        );
        let err = h.worker().process_branch(&config()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalHost);
    }

    #[tokio::test]
    async fn test_pr_error_is_swallowed() {
        let h = Harness::new(MockScm::new("/tmp/repo"));
        h.prs
            .push_result(Err(crate::ports::PortError::other("template blew up")));
        let result = h.worker().process_branch(&config()).await.unwrap();
        assert_eq!(result.result, BranchResult::PrCreated);
        assert_eq!(result.pr_no, None);
    }
}
