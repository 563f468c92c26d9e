//! PR comment topics and bodies posted by the branch processor.

use crate::config::BranchConfig;
use crate::ports::{ArtifactError, ArtifactNotice};
use std::fmt::Write;

pub const IGNORE_TOPIC: &str = "Upkeep Ignore Notification";
pub const EDITED_TOPIC: &str = "Edited/Blocked Notification";
pub const ARTIFACT_ERROR_TOPIC: &str = "⚠️ Artifact update problem";
pub const ARTIFACT_NOTICE_TOPIC: &str = "ℹ️ Artifact update notice";
pub const TASK_ERROR_TOPIC: &str = "⚠️ Post-upgrade task problem";

pub fn ignore_notification(config: &BranchConfig) -> String {
    let first = config.upgrades.first();
    let update_type = config
        .update_type
        .as_deref()
        .or_else(|| first.and_then(|u| u.update_type.as_deref()));

    let mut content = match update_type {
        Some("major") => {
            let major = first
                .and_then(|u| u.new_major)
                .map(|m| m.to_string())
                .unwrap_or_else(|| "new major".to_string());
            format!(
                "As this PR has been closed unmerged, Upkeep will ignore this upgrade and you will not receive PRs for *any* future {major}.x releases. \
                 But if you manually upgrade to {major}.x then Upkeep will re-enable minor and patch updates automatically."
            )
        }
        Some("digest") => {
            let dep = first.map(|u| u.dep_name.as_str()).unwrap_or_default();
            let current = first
                .and_then(|u| u.current_value.as_deref())
                .unwrap_or_default();
            format!(
                "As this PR has been closed unmerged, Upkeep will ignore this upgrade type and you will not receive PRs for *any* future {dep}:{current} digest updates. \
                 Digest updates will resume if you update the specified tag at any time."
            )
        }
        _ => {
            let new_value = first
                .and_then(|u| u.new_value.as_deref())
                .unwrap_or_default();
            format!(
                "As this PR has been closed unmerged, Upkeep will now ignore this update ({new_value}). \
                 You will still receive a PR once a newer version is released, so if you wish to permanently ignore this dependency, \
                 please add it to the `ignoreDeps` array of your configuration."
            )
        }
    };
    content.push_str(
        "\n\nIf you accidentally closed this PR, or if you changed your mind: rename this PR to get a fresh replacement PR.",
    );
    content
}

pub fn edited_notification() -> &'static str {
    "Upkeep will not automatically rebase this PR, because it does not recognize the last commit author and assumes somebody else may have edited the PR.\n\n\
     You can manually request rebase by checking the rebase/retry box above.\n\n\
     ⚠️ **Warning**: custom changes will be lost."
}

fn file_blocks(errors: &[ArtifactError]) -> String {
    let mut out = String::new();
    for error in errors {
        let _ = write!(
            out,
            "##### File name: {}\n\n```\n{}\n```\n\n",
            error.file_name, error.stderr
        );
    }
    out
}

pub fn artifact_errors(config: &BranchConfig, errors: &[ArtifactError]) -> String {
    let warning = match &config.user_strings.artifact_error_warning {
        Some(custom) => custom.replace("{{manager}}", config.manager.as_deref().unwrap_or_default()),
        None => "You probably do not want to merge this PR as-is.".to_string(),
    };
    let mut content = format!("### ⚠️ Artifact update problem\n\n{warning}\n\n");
    content.push_str(
        "♻ Upkeep will retry this branch, including artifacts, only when one of the following happens:\n\n\
         - any of the package files in this branch needs updating, or\n\
         - the branch becomes conflicted, or\n\
         - you click the rebase/retry checkbox if found above, or\n\
         - you rename this PR's title to start with \"rebase!\" to trigger it manually\n\n\
         The artifact failure details are included below:\n\n",
    );
    content.push_str(&file_blocks(errors));
    content
}

pub fn task_errors(errors: &[ArtifactError]) -> String {
    let mut content = String::from(
        "### ⚠️ Post-upgrade task problem\n\n\
         One or more post-upgrade commands did not complete. The files they were expected to change may be missing from this PR.\n\n",
    );
    content.push_str(&file_blocks(errors));
    content
}

pub fn artifact_notices(notices: &[ArtifactNotice]) -> String {
    let mut out = String::new();
    for notice in notices {
        let _ = writeln!(out, "##### File name: {}\n\n{}", notice.file, notice.message);
    }
    out
}
