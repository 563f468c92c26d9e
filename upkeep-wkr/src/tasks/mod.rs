//! Post-upgrade task runner.
//!
//! Runs allow-listed shell commands in the working copy after the package
//! files of a branch were regenerated, then turns whatever the commands
//! changed into artifacts for the branch commit. Update-scoped task sets
//! run once per upgrade, a branch-scoped set runs once per branch.
//!
//! Nothing here aborts branch processing: rejected commands and command
//! failures are collected as sanitized [`ArtifactError`]s which the
//! processor posts on the PR.

pub mod executor;
pub mod template;

pub use executor::{
    BASE_ENV_VARS, CommandExecutor, ExecError, ExecOptions, ExecOutput, MockCommandExecutor,
    ShellCommandExecutor, child_env,
};
pub use template::{Template, TemplateError, compile};

use crate::config::{BranchConfig, PostUpgradeTasks, Upgrade};
use crate::error::{Result, WorkerError};
use crate::ports::{ArtifactError, PackageFilesResult};
use glob::{MatchOptions, Pattern};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use upkeep_common::{ConfigError, FileChange, FileContents, GlobalConfig, Sanitizer, upsert_file_change};
use upkeep_git::Scm;

/// Environment variable carrying the data file path to the child.
pub const DATA_FILE_ENV: &str = "UPKEEP_POST_UPGRADE_COMMAND_DATA_FILE";

const DEFAULT_FILE_FILTER: &str = "**/*";

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Admin-level settings for task execution.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub allowed_commands: Vec<Regex>,
    pub allow_command_templating: bool,
    pub expose_all_env: bool,
    pub cache_dir: PathBuf,
}

impl TaskSettings {
    pub fn from_global(config: &GlobalConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            allowed_commands: config.compiled_allowed_commands()?,
            allow_command_templating: config.allow_command_templating,
            expose_all_env: config.expose_all_env,
            cache_dir: config.cache_dir.clone(),
        })
    }

    fn is_allowed(&self, command: &str) -> bool {
        self.allowed_commands.iter().any(|re| re.is_match(command))
    }
}

/// Files the tasks produced or changed, merged with what came in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostUpgradeResult {
    pub updated_package_files: Vec<FileChange>,
    pub updated_artifacts: Vec<FileChange>,
    pub artifact_errors: Vec<ArtifactError>,
}

/// One execution of a task set.
struct TaskUnit<'a> {
    tasks: &'a PostUpgradeTasks,
    /// Values visible to command and data file templates.
    context: Value,
    label: String,
    package_file: Option<String>,
}

pub struct PostUpgradeRunner {
    settings: TaskSettings,
    executor: Arc<dyn CommandExecutor>,
    sanitizer: Sanitizer,
}

impl PostUpgradeRunner {
    pub fn new(settings: TaskSettings, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            settings,
            executor,
            sanitizer: Sanitizer::new(),
        }
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Run every task set of `config` against the working copy.
    ///
    /// Returns `None` when there is nothing to run: no task set declared,
    /// no allow-list configured, or no files changed by the upstream steps.
    pub async fn execute_post_upgrade_commands(
        &self,
        scm: &dyn Scm,
        config: &BranchConfig,
        files: &PackageFilesResult,
    ) -> Result<Option<PostUpgradeResult>> {
        let branch_tasks = config
            .post_upgrade_tasks
            .as_ref()
            .filter(|t| t.is_branch_scoped() && !t.commands.is_empty());
        let update_upgrades: Vec<&Upgrade> = config
            .upgrades
            .iter()
            .filter(|u| u.has_update_tasks())
            .collect();

        if branch_tasks.is_none() && update_upgrades.is_empty() {
            return Ok(None);
        }
        if self.settings.allowed_commands.is_empty() {
            debug!(branch = %config.branch_name, "post-upgrade tasks declared but no commands are allowed");
            return Ok(None);
        }
        if files.updated_package_files.is_empty() && files.updated_artifacts.is_empty() {
            debug!(branch = %config.branch_name, "no updated files, skipping post-upgrade tasks");
            return Ok(None);
        }

        let branch_context = serde_json::to_value(config)
            .map_err(|e| WorkerError::InvalidConfig(e.to_string()))?;
        let mut result = PostUpgradeResult {
            updated_package_files: files.updated_package_files.clone(),
            updated_artifacts: files.updated_artifacts.clone(),
            artifact_errors: Vec::new(),
        };

        let mut seen = Vec::new();
        for upgrade in update_upgrades {
            if seen.contains(&upgrade.dep_name) {
                continue;
            }
            seen.push(upgrade.dep_name.clone());
            let Some(tasks) = upgrade.post_upgrade_tasks.as_ref() else {
                continue;
            };
            let upgrade_json = serde_json::to_value(upgrade)
                .map_err(|e| WorkerError::InvalidConfig(e.to_string()))?;
            let unit = TaskUnit {
                tasks,
                context: merge_context(&branch_context, &upgrade_json),
                label: upgrade.dep_name.clone(),
                package_file: upgrade.package_file.clone(),
            };
            self.run_unit(scm, &unit, &mut result).await?;
        }

        if let Some(tasks) = branch_tasks {
            let dep_names = config.dep_names().join(" ");
            let mut context = branch_context.clone();
            if let Value::Object(map) = &mut context {
                map.insert("depName".into(), Value::String(dep_names.clone()));
            }
            let unit = TaskUnit {
                tasks,
                context,
                label: dep_names,
                package_file: None,
            };
            self.run_unit(scm, &unit, &mut result).await?;
        }

        Ok(Some(result))
    }

    async fn run_unit(
        &self,
        scm: &dyn Scm,
        unit: &TaskUnit<'_>,
        result: &mut PostUpgradeResult,
    ) -> Result<()> {
        let local_dir = scm.local_dir().to_path_buf();
        write_existing_changes(&local_dir, result);

        let mut extra_env = Vec::new();
        let data_file = match &unit.tasks.data_file_template {
            Some(source) => match self.write_data_file(source, &unit.context) {
                Ok(path) => {
                    extra_env.push((DATA_FILE_ENV, path.to_string_lossy().into_owned()));
                    Some(path)
                }
                Err(err) => {
                    warn!(
                        dep = %unit.label,
                        error = %self.sanitizer.sanitize(&err.to_string()),
                        "failed to write post-upgrade data file, running without it"
                    );
                    None
                }
            },
            None => None,
        };
        let options = ExecOptions {
            cwd: local_dir.clone(),
            env: child_env(self.settings.expose_all_env, &extra_env),
        };

        for raw in &unit.tasks.commands {
            let command = if self.settings.allow_command_templating {
                compile(raw, &unit.context)?
            } else {
                raw.clone()
            };

            if !self.settings.is_allowed(&command) {
                let message = format!(
                    "Post-upgrade command '{command}' has not been added to the allowed list in allowedCommands"
                );
                warn!(dep = %unit.label, "{}", self.sanitizer.sanitize(&message));
                result.artifact_errors.push(ArtifactError {
                    file_name: unit.package_file.clone().unwrap_or_default(),
                    stderr: self.sanitizer.sanitize(&message),
                });
                continue;
            }

            info!(dep = %unit.label, command = %self.sanitizer.sanitize(&command), "executing post-upgrade task");
            match self.executor.exec(&command, &options).await {
                Ok(output) => {
                    trace!(stdout = %output.stdout, stderr = %output.stderr, "post-upgrade task finished");
                }
                Err(err) => {
                    let stderr = self.sanitizer.sanitize(&err.to_string());
                    warn!(dep = %unit.label, error = %stderr, "post-upgrade task failed");
                    result.artifact_errors.push(ArtifactError {
                        file_name: unit.package_file.clone().unwrap_or_default(),
                        stderr,
                    });
                }
            }
        }

        if let Some(path) = data_file
            && let Err(err) = std::fs::remove_file(&path)
        {
            debug!(path = %path.display(), error = %err, "could not remove post-upgrade data file");
        }

        let status = scm.get_repo_status(None).await?;
        let filters = compile_filters(&unit.tasks.file_filters);

        for path in status.modified.iter().chain(&status.not_added) {
            if !matches_any(&filters, path) {
                continue;
            }
            debug!(path = %path, "post-upgrade file saved");
            let change = read_change(&local_dir, path)?;
            record_change(result, change);
        }
        for path in &status.deleted {
            if !matches_any(&filters, path) {
                continue;
            }
            debug!(path = %path, "post-upgrade file removed");
            record_change(result, FileChange::deletion(path.clone()));
        }
        Ok(())
    }

    fn write_data_file(&self, source: &str, context: &Value) -> Result<PathBuf> {
        let rendered = self.sanitizer.sanitize(&compile(source, context)?);
        let dir = self.settings.cache_dir.join("upkeep");
        std::fs::create_dir_all(&dir)
            .map_err(|e| WorkerError::io(&format!("creating {}", dir.display()), e))?;
        let path = dir.join(format!(
            "post-upgrade-data-file-{:016x}.tmp",
            rand::random::<u64>()
        ));
        std::fs::write(&path, rendered)
            .map_err(|e| WorkerError::io(&format!("writing {}", path.display()), e))?;
        debug!(path = %path.display(), "wrote post-upgrade data file");
        Ok(path)
    }
}

/// Branch values overlaid with the upgrade's own fields.
fn merge_context(branch: &Value, upgrade: &Value) -> Value {
    let mut merged = branch.clone();
    if let (Value::Object(target), Value::Object(source)) = (&mut merged, upgrade) {
        for (key, value) in source {
            if !value.is_null() {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Make earlier additions visible to the commands. Only files that already
/// exist are overwritten; symlinks are left alone.
fn write_existing_changes(local_dir: &Path, result: &PostUpgradeResult) {
    for change in result
        .updated_package_files
        .iter()
        .chain(&result.updated_artifacts)
    {
        let FileChange::Addition {
            path,
            contents,
            is_symlink: false,
            ..
        } = change
        else {
            continue;
        };
        let full = local_dir.join(path);
        if !full.is_file() {
            continue;
        }
        if let Err(err) = std::fs::write(&full, contents.as_bytes()) {
            warn!(path = %path, error = %err, "failed to write updated file before post-upgrade tasks");
        }
    }
}

fn compile_filters(filters: &[String]) -> Vec<Pattern> {
    let sources: Vec<&str> = if filters.is_empty() {
        vec![DEFAULT_FILE_FILTER]
    } else {
        filters.iter().map(String::as_str).collect()
    };
    sources
        .into_iter()
        .filter_map(|source| match Pattern::new(source) {
            Ok(pattern) => Some(pattern),
            Err(err) => {
                warn!(filter = %source, error = %err, "ignoring invalid file filter");
                None
            }
        })
        .collect()
}

fn matches_any(filters: &[Pattern], path: &str) -> bool {
    filters.iter().any(|p| p.matches_with(path, GLOB_OPTIONS))
}

/// Current on-disk state of `path`; a vanished file is a deletion.
fn read_change(local_dir: &Path, path: &str) -> Result<FileChange> {
    let full = local_dir.join(path);
    let metadata = match std::fs::symlink_metadata(&full) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileChange::deletion(path));
        }
        Err(err) => return Err(WorkerError::io(&format!("reading {path}"), err)),
    };

    if metadata.file_type().is_symlink() {
        let target = std::fs::read_link(&full)
            .map_err(|e| WorkerError::io(&format!("reading link {path}"), e))?;
        return Ok(FileChange::Addition {
            path: path.to_string(),
            contents: FileContents::Text(target.to_string_lossy().into_owned()),
            is_executable: false,
            is_symlink: true,
        });
    }
    if !metadata.is_file() {
        return Ok(FileChange::deletion(path));
    }

    let bytes = std::fs::read(&full).map_err(|e| WorkerError::io(&format!("reading {path}"), e))?;
    Ok(FileChange::Addition {
        path: path.to_string(),
        contents: FileContents::from_bytes(bytes),
        is_executable: is_executable(&metadata),
        is_symlink: false,
    })
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

/// Last state per path wins. Package files stay package files; anything
/// else lands in the artifact list.
fn record_change(result: &mut PostUpgradeResult, change: FileChange) {
    let path = change.path().to_string();
    let is_package_file = result
        .updated_package_files
        .iter()
        .any(|f| f.path() == path);
    if is_package_file && !change.is_deletion() {
        upsert_file_change(&mut result.updated_package_files, change);
        result.updated_artifacts.retain(|f| f.path() != path);
    } else {
        result.updated_package_files.retain(|f| f.path() != path);
        upsert_file_change(&mut result.updated_artifacts, change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_filters_match_dot_files_and_nested_paths() {
        let filters = compile_filters(&[]);
        assert!(matches_any(&filters, "yarn.lock"));
        assert!(matches_any(&filters, ".yarn/cache/a.zip"));

        let filters = compile_filters(&["modified_file".into(), "*.lock".into()]);
        assert!(matches_any(&filters, "modified_file"));
        assert!(matches_any(&filters, "Cargo.lock"));
        assert!(!matches_any(&filters, "other_file"));
    }

    #[test]
    fn test_invalid_filter_is_skipped() {
        let filters = compile_filters(&["[".into(), "a".into()]);
        assert_eq!(filters.len(), 1);
    }

    #[test]
    fn test_merge_context_prefers_upgrade_values() {
        let merged = merge_context(
            &serde_json::json!({"versioning": "semver", "depName": "", "manager": "npm"}),
            &serde_json::json!({"depName": "lodash", "manager": null}),
        );
        assert_eq!(merged["depName"], "lodash");
        assert_eq!(merged["manager"], "npm");
        assert_eq!(merged["versioning"], "semver");
    }

    #[test]
    fn test_record_change_keeps_package_files_separate() {
        let mut result = PostUpgradeResult {
            updated_package_files: vec![FileChange::addition("package.json", "old")],
            ..Default::default()
        };
        record_change(&mut result, FileChange::addition("package.json", "new"));
        record_change(&mut result, FileChange::addition("yarn.lock", "lock"));
        assert_eq!(
            result.updated_package_files,
            vec![FileChange::addition("package.json", "new")]
        );
        assert_eq!(
            result.updated_artifacts,
            vec![FileChange::addition("yarn.lock", "lock")]
        );

        record_change(&mut result, FileChange::deletion("package.json"));
        assert!(result.updated_package_files.is_empty());
        assert_eq!(result.updated_artifacts.len(), 2);
    }

    #[test]
    fn test_read_change_detects_deleted_and_executable() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_change(dir.path(), "gone").unwrap(),
            FileChange::deletion("gone")
        );

        std::fs::write(dir.path().join("gradlew"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                dir.path().join("gradlew"),
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
        }
        match read_change(dir.path(), "gradlew").unwrap() {
            FileChange::Addition {
                contents,
                is_executable,
                ..
            } => {
                assert_eq!(contents.as_text(), Some("#!/bin/sh\n"));
                assert_eq!(is_executable, cfg!(unix));
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Write(u8),
        Delete,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![any::<u8>().prop_map(Step::Write), Just(Step::Delete)]
    }

    proptest! {
        #[test]
        fn prop_last_state_per_path_wins(steps in proptest::collection::vec((0usize..3, step()), 1..20)) {
            let paths = ["a.lock", "b.lock", "c.lock"];
            let mut result = PostUpgradeResult::default();
            let mut expected: [Option<Option<u8>>; 3] = [None, None, None];
            for (idx, step) in &steps {
                match step {
                    Step::Write(v) => {
                        record_change(&mut result, FileChange::addition(paths[*idx], v.to_string()));
                        expected[*idx] = Some(Some(*v));
                    }
                    Step::Delete => {
                        record_change(&mut result, FileChange::deletion(paths[*idx]));
                        expected[*idx] = Some(None);
                    }
                }
            }
            for (idx, path) in paths.iter().enumerate() {
                let entries: Vec<_> = result.updated_artifacts.iter().filter(|c| c.path() == *path).collect();
                match expected[idx] {
                    None => prop_assert!(entries.is_empty()),
                    Some(None) => {
                        prop_assert_eq!(entries.len(), 1);
                        prop_assert!(entries[0].is_deletion());
                    }
                    Some(Some(v)) => {
                        prop_assert_eq!(entries.len(), 1);
                        let text = v.to_string();
                        prop_assert_eq!(entries[0].contents().and_then(FileContents::as_text), Some(text.as_str()));
                    }
                }
            }
        }
    }
}
