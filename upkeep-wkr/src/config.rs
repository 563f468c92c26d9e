//! Per-branch configuration handed to the worker.
//!
//! These objects arrive already validated; the worker only reads them.
//! Field names follow the camelCase JSON used by branch definition files.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Label that requests a rebase when present on the PR.
pub const DEFAULT_REBASE_LABEL: &str = "rebase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Once per upgrade.
    #[default]
    Update,
    /// Once per branch.
    Branch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostUpgradeTasks {
    pub commands: Vec<String>,
    /// Globs selecting which changed files become artifacts; `**/*` when empty.
    pub file_filters: Vec<String>,
    pub data_file_template: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
}

impl PostUpgradeTasks {
    pub fn is_branch_scoped(&self) -> bool {
        self.execution_mode == Some(ExecutionMode::Branch)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebaseWhen {
    #[default]
    Auto,
    Never,
    Conflicted,
    BehindBaseBranch,
    Automerging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecreateWhen {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrCreation {
    #[default]
    Immediate,
    NotPending,
    StatusSuccess,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutomergeType {
    #[default]
    Pr,
    Branch,
    PrComment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    #[default]
    Full,
    /// Report only; never creates branches on its own.
    Silent,
}

/// Notifications a repository can switch off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    PrIgnoreNotification,
    PrEditedNotification,
    ArtifactErrors,
    LockFileErrors,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "neutral")]
    Neutral,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "very high")]
    VeryHigh,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserStrings {
    /// Replaces the artifact error warning; `{{manager}}` is substituted.
    pub artifact_error_warning: Option<String>,
}

/// One dependency change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Upgrade {
    pub dep_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub versioning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_major: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_timestamp: Option<DateTime<Utc>>,
    /// Humantime duration such as `3 days`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_release_age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_confidence: Option<ConfidenceLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_upgrade_tasks: Option<PostUpgradeTasks>,
}

impl Upgrade {
    pub fn new(dep_name: impl Into<String>) -> Self {
        Self {
            dep_name: dep_name.into(),
            ..Default::default()
        }
    }

    /// Parsed `minimum_release_age`; unparsable values count as unset.
    pub fn minimum_release_age(&self) -> Option<Duration> {
        self.minimum_release_age
            .as_deref()
            .and_then(|raw| humantime::parse_duration(raw).ok())
    }

    /// Whether the release is younger than its required minimum age at `now`.
    pub fn is_too_young(&self, now: DateTime<Utc>) -> bool {
        let (Some(released), Some(minimum)) = (self.release_timestamp, self.minimum_release_age())
        else {
            return false;
        };
        let elapsed = now.signed_duration_since(released).to_std().unwrap_or_default();
        elapsed < minimum
    }

    pub fn has_update_tasks(&self) -> bool {
        self.post_upgrade_tasks
            .as_ref()
            .is_some_and(|t| !t.commands.is_empty() && !t.is_branch_scoped())
    }
}

/// Everything the branch processor needs to know about one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BranchConfig {
    pub branch_name: String,
    pub base_branch: String,
    /// Prefix used by earlier versions of the bot; the branch is looked up
    /// under it when missing under `branch_name`.
    pub branch_prefix: Option<String>,
    pub branch_prefix_old: Option<String>,
    pub manager: Option<String>,
    pub update_type: Option<String>,
    pub pr_title: Option<String>,
    pub commit_message: Option<String>,
    pub upgrades: Vec<Upgrade>,

    pub mode: RunMode,
    pub update_not_scheduled: bool,
    pub automerge: bool,
    pub automerge_type: AutomergeType,
    pub ignore_tests: bool,
    pub rebase_when: RebaseWhen,
    pub recreate_when: RecreateWhen,
    pub pr_creation: PrCreation,
    pub pending_checks: bool,

    pub stop_updating_label: Option<String>,
    pub keep_updated_label: Option<String>,
    pub rebase_label: Option<String>,

    pub dependency_dashboard_approval: bool,
    /// A dashboard checkbox for this branch is ticked.
    pub dependency_dashboard_check: bool,

    pub suppress_notifications: Vec<Notification>,
    pub user_strings: UserStrings,
    pub post_upgrade_tasks: Option<PostUpgradeTasks>,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            branch_name: String::new(),
            base_branch: String::new(),
            branch_prefix: None,
            branch_prefix_old: None,
            manager: None,
            update_type: None,
            pr_title: None,
            commit_message: None,
            upgrades: Vec::new(),
            mode: RunMode::Full,
            update_not_scheduled: true,
            automerge: false,
            automerge_type: AutomergeType::Pr,
            ignore_tests: false,
            rebase_when: RebaseWhen::Auto,
            recreate_when: RecreateWhen::Auto,
            pr_creation: PrCreation::Immediate,
            pending_checks: false,
            stop_updating_label: None,
            keep_updated_label: None,
            rebase_label: None,
            dependency_dashboard_approval: false,
            dependency_dashboard_check: false,
            suppress_notifications: Vec::new(),
            user_strings: UserStrings::default(),
            post_upgrade_tasks: None,
        }
    }
}

impl BranchConfig {
    pub fn new(branch_name: impl Into<String>, base_branch: impl Into<String>) -> Self {
        Self {
            branch_name: branch_name.into(),
            base_branch: base_branch.into(),
            ..Default::default()
        }
    }

    /// Load a JSON or TOML branch definition, chosen by extension.
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::error::WorkerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::WorkerError::io(&format!("reading {}", path.display()), e))?;
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        if is_toml {
            toml::from_str(&content).map_err(|e| crate::error::WorkerError::InvalidConfig(e.to_string()))
        } else {
            serde_json::from_str(&content)
                .map_err(|e| crate::error::WorkerError::InvalidConfig(e.to_string()))
        }
    }

    pub fn suppresses(&self, notification: Notification) -> bool {
        self.suppress_notifications.contains(&notification)
    }

    pub fn rebase_label(&self) -> &str {
        self.rebase_label.as_deref().unwrap_or(DEFAULT_REBASE_LABEL)
    }

    pub fn is_branch_automerge(&self) -> bool {
        self.automerge && self.automerge_type == AutomergeType::Branch
    }

    pub fn dep_names(&self) -> Vec<&str> {
        self.upgrades.iter().map(|u| u.dep_name.as_str()).collect()
    }

    pub fn commit_message(&self) -> String {
        match &self.commit_message {
            Some(message) => message.clone(),
            None => format!("chore(deps): update {}", self.dep_names().join(", ")),
        }
    }

    /// Same branch under the old prefix, when one is configured.
    pub fn old_prefix_branch_name(&self) -> Option<String> {
        let old = self.branch_prefix_old.as_deref()?;
        let current = self.branch_prefix.as_deref()?;
        if old == current {
            return None;
        }
        self.branch_name
            .strip_prefix(current)
            .map(|rest| format!("{old}{rest}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_branch_config_from_json_defaults() {
        let config: BranchConfig = serde_json::from_str(
            r#"{
                "branchName": "upkeep/lodash",
                "baseBranch": "main",
                "rebaseWhen": "behind-base-branch",
                "suppressNotifications": ["prEditedNotification"],
                "upgrades": [{"depName": "lodash", "minimumConfidence": "very high"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.rebase_when, RebaseWhen::BehindBaseBranch);
        assert!(config.update_not_scheduled);
        assert!(config.suppresses(Notification::PrEditedNotification));
        assert_eq!(
            config.upgrades[0].minimum_confidence,
            Some(ConfidenceLevel::VeryHigh)
        );
        assert_eq!(config.rebase_label(), "rebase");
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(ConfidenceLevel::Low < ConfidenceLevel::Neutral);
        assert!(ConfidenceLevel::High < ConfidenceLevel::VeryHigh);
    }

    #[test]
    fn test_release_age() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let mut upgrade = Upgrade::new("lodash");
        assert!(!upgrade.is_too_young(now));

        upgrade.minimum_release_age = Some("3 days".into());
        upgrade.release_timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 9, 0, 0, 0).unwrap());
        assert!(upgrade.is_too_young(now));

        upgrade.release_timestamp = Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        assert!(!upgrade.is_too_young(now));

        upgrade.minimum_release_age = Some("whenever".into());
        assert!(!upgrade.is_too_young(now));
    }

    #[test]
    fn test_old_prefix_branch_name() {
        let mut config = BranchConfig::new("upkeep/lodash", "main");
        assert_eq!(config.old_prefix_branch_name(), None);
        config.branch_prefix = Some("upkeep/".into());
        config.branch_prefix_old = Some("deps/".into());
        assert_eq!(config.old_prefix_branch_name().as_deref(), Some("deps/lodash"));
    }

    #[test]
    fn test_default_commit_message() {
        let mut config = BranchConfig::new("upkeep/js", "main");
        config.upgrades = vec![Upgrade::new("lodash"), Upgrade::new("react")];
        assert_eq!(config.commit_message(), "chore(deps): update lodash, react");
    }
}
