//! Decide whether an existing branch can be updated in place or must be
//! regenerated from the base branch.

use crate::config::{BranchConfig, RebaseWhen};
use crate::error::Result;
use std::collections::HashMap;
use tracing::debug;
use upkeep_git::Scm;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReuseDecision {
    pub reuse_existing_branch: bool,
    /// Set when the answer was looked up while deciding.
    pub is_modified: Option<bool>,
    pub is_conflicted: Option<bool>,
}

impl ReuseDecision {
    fn regenerate() -> Self {
        Self::default()
    }

    fn reuse() -> Self {
        Self {
            reuse_existing_branch: true,
            ..Self::default()
        }
    }
}

fn rebases_when_behind(config: &BranchConfig) -> bool {
    match config.rebase_when {
        RebaseWhen::BehindBaseBranch => true,
        RebaseWhen::Automerging | RebaseWhen::Auto => config.automerge,
        RebaseWhen::Never | RebaseWhen::Conflicted => false,
    }
}

/// Package files that mix `update-lockfile` with another range strategy
/// cannot be patched incrementally.
fn has_mixed_range_strategies(config: &BranchConfig) -> bool {
    let mut per_file: HashMap<&str, Vec<&str>> = HashMap::new();
    for upgrade in &config.upgrades {
        let (Some(file), Some(strategy)) = (&upgrade.package_file, &upgrade.range_strategy) else {
            continue;
        };
        per_file.entry(file).or_default().push(strategy);
    }
    per_file.values().any(|strategies| {
        strategies.contains(&"update-lockfile") && strategies.iter().any(|s| *s != "update-lockfile")
    })
}

pub async fn should_reuse_existing_branch(
    scm: &dyn Scm,
    config: &BranchConfig,
) -> Result<ReuseDecision> {
    let branch = config.branch_name.as_str();
    let base = config.base_branch.as_str();

    if !scm.branch_exists(branch).await {
        debug!(branch, "branch does not exist");
        return Ok(ReuseDecision::regenerate());
    }

    let mut decision = ReuseDecision::reuse();

    if rebases_when_behind(config) && scm.is_branch_behind_base(branch, base).await? {
        debug!(branch, "branch is behind its base");
        if scm.is_branch_modified(branch, base).await? {
            debug!(branch, "cannot rebase, branch was modified");
            decision.is_modified = Some(true);
            return Ok(decision);
        }
        return Ok(ReuseDecision {
            is_modified: Some(false),
            ..ReuseDecision::regenerate()
        });
    }

    let is_conflicted = scm.is_branch_conflicted(base, branch).await?;
    decision.is_conflicted = Some(is_conflicted);
    if is_conflicted {
        debug!(branch, "branch is conflicted");
        let is_modified = scm.is_branch_modified(branch, base).await?;
        decision.is_modified = Some(is_modified);
        if is_modified {
            debug!(branch, "cannot regenerate, branch was modified");
            return Ok(decision);
        }
        if config.rebase_when == RebaseWhen::Never {
            debug!(branch, "rebasing is disabled, keeping conflicted branch");
            return Ok(decision);
        }
        decision.reuse_existing_branch = false;
        return Ok(decision);
    }

    if has_mixed_range_strategies(config) {
        debug!(branch, "mixed range strategies including update-lockfile");
        decision.reuse_existing_branch = false;
        return Ok(decision);
    }

    debug!(branch, "reusing existing branch");
    Ok(decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Upgrade;
    use upkeep_git::MockScm;

    const BRANCH: &str = "upkeep/lodash";

    fn config() -> BranchConfig {
        BranchConfig::new(BRANCH, "main")
    }

    fn scm() -> MockScm {
        MockScm::new("/tmp/repo").with_branch(BRANCH, "abc")
    }

    #[tokio::test]
    async fn test_missing_branch_regenerates() {
        let scm = MockScm::new("/tmp/repo");
        let decision = should_reuse_existing_branch(&scm, &config()).await.unwrap();
        assert!(!decision.reuse_existing_branch);
        assert!(scm.calls().is_empty());
    }

    #[tokio::test]
    async fn test_clean_branch_is_reused() {
        let scm = scm();
        let decision = should_reuse_existing_branch(&scm, &config()).await.unwrap();
        assert!(decision.reuse_existing_branch);
        assert_eq!(decision.is_conflicted, Some(false));
    }

    #[tokio::test]
    async fn test_behind_base_regenerates_unless_modified() {
        let mut cfg = config();
        cfg.rebase_when = RebaseWhen::BehindBaseBranch;
        let scm = scm();
        scm.set_behind(BRANCH, true);
        let decision = should_reuse_existing_branch(&scm, &cfg).await.unwrap();
        assert!(!decision.reuse_existing_branch);

        scm.set_modified(BRANCH, true);
        let decision = should_reuse_existing_branch(&scm, &cfg).await.unwrap();
        assert!(decision.reuse_existing_branch);
        assert_eq!(decision.is_modified, Some(true));
    }

    #[tokio::test]
    async fn test_behind_is_ignored_without_automerge_on_auto() {
        let scm = scm();
        scm.set_behind(BRANCH, true);
        let decision = should_reuse_existing_branch(&scm, &config()).await.unwrap();
        assert!(decision.reuse_existing_branch);
        assert!(!scm.calls().iter().any(|c| c.starts_with("is_branch_behind_base")));

        let mut cfg = config();
        cfg.automerge = true;
        let decision = should_reuse_existing_branch(&scm, &cfg).await.unwrap();
        assert!(!decision.reuse_existing_branch);
    }

    #[tokio::test]
    async fn test_conflicted_branch() {
        let scm = scm();
        scm.set_conflicted(BRANCH, true);
        let decision = should_reuse_existing_branch(&scm, &config()).await.unwrap();
        assert!(!decision.reuse_existing_branch);
        assert_eq!(decision.is_conflicted, Some(true));
        assert_eq!(decision.is_modified, Some(false));

        let mut never = config();
        never.rebase_when = RebaseWhen::Never;
        let decision = should_reuse_existing_branch(&scm, &never).await.unwrap();
        assert!(decision.reuse_existing_branch);

        scm.set_modified(BRANCH, true);
        let decision = should_reuse_existing_branch(&scm, &config()).await.unwrap();
        assert!(decision.reuse_existing_branch);
        assert_eq!(decision.is_modified, Some(true));
    }

    #[tokio::test]
    async fn test_mixed_range_strategies_regenerate() {
        let mut cfg = config();
        let mut a = Upgrade::new("a");
        a.package_file = Some("package.json".into());
        a.range_strategy = Some("update-lockfile".into());
        let mut b = Upgrade::new("b");
        b.package_file = Some("package.json".into());
        b.range_strategy = Some("bump".into());
        cfg.upgrades = vec![a.clone(), b];
        let decision = should_reuse_existing_branch(&scm(), &cfg).await.unwrap();
        assert!(!decision.reuse_existing_branch);

        let mut c = Upgrade::new("c");
        c.package_file = Some("other/package.json".into());
        c.range_strategy = Some("bump".into());
        cfg.upgrades = vec![a, c];
        let decision = should_reuse_existing_branch(&scm(), &cfg).await.unwrap();
        assert!(decision.reuse_existing_branch);
    }
}
