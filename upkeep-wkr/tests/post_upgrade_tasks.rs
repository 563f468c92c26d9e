//! Post-upgrade tasks run as part of a branch pass.

mod common;

use common::{World, branch};
use regex::Regex;
use upkeep_common::RepoStatus;
use upkeep_common::testing::{TestPhase, init_global_test_logging, log_phase};
use upkeep_wkr::BranchResult;
use upkeep_wkr::config::{ExecutionMode, PostUpgradeTasks};
use upkeep_wkr::ports::PrAutomergeResult;
use upkeep_wkr::processor::comments;
use upkeep_wkr::tasks::DATA_FILE_ENV;

#[ctor::ctor]
fn setup() {
    init_global_test_logging();
}

fn tasks(commands: &[&str]) -> PostUpgradeTasks {
    PostUpgradeTasks {
        commands: commands.iter().map(|c| c.to_string()).collect(),
        ..PostUpgradeTasks::default()
    }
}

fn allow(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().map(|p| Regex::new(p).unwrap()).collect()
}

#[tokio::test]
async fn test_disallowed_command_is_reported_on_pr() {
    log_phase("allow_list", TestPhase::Setup, "one allowed and one disallowed command");
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^echo"]);
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(tasks(&["echo semver", "disallowed task"]));

    log_phase("allow_list", TestPhase::Execute, "processing branch");
    let result = world.worker().process_branch(&config).await.unwrap();

    log_phase("allow_list", TestPhase::Verify, "only echo ran, problem reported");
    assert_eq!(result.result, BranchResult::PrCreated);
    assert_eq!(world.executor.commands(), vec!["echo semver".to_string()]);
    let posted = world.platform.comments();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].topic, comments::TASK_ERROR_TOPIC);
    assert!(posted[0].content.contains(
        "Post-upgrade command 'disallowed task' has not been added to the allowed list in allowedCommands"
    ));
}

#[tokio::test]
async fn test_tasks_skipped_without_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new(dir.path());
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(tasks(&["echo semver"]));

    let result = world.worker().process_branch(&config).await.unwrap();

    assert_eq!(result.result, BranchResult::PrCreated);
    assert!(world.executor.calls().is_empty());
    assert!(world.platform.comments().is_empty());
}

#[tokio::test]
async fn test_commands_are_templated_and_run_in_working_copy() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^npx "]);
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks =
        Some(tasks(&["npx dedupe {{depName}}@{{newValue}}"]));

    world.worker().process_branch(&config).await.unwrap();

    let calls = world.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "npx dedupe lodash@4.17.21");
    assert_eq!(calls[0].1.cwd, dir.path());
}

#[tokio::test]
async fn test_data_file_is_exposed_then_removed() {
    log_phase("data_file", TestPhase::Setup, "task set with a data file template");
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^echo"]);
    let mut task_set = tasks(&["echo data"]);
    task_set.data_file_template = Some("{\"dep\":\"{{depName}}\"}".into());
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(task_set);

    log_phase("data_file", TestPhase::Execute, "processing branch");
    world.worker().process_branch(&config).await.unwrap();

    log_phase("data_file", TestPhase::Verify, "env var set, file gone");
    let calls = world.executor.calls();
    assert_eq!(calls.len(), 1);
    let path = calls[0]
        .1
        .env
        .get(DATA_FILE_ENV)
        .expect("data file env var")
        .clone();
    let pattern = Regex::new(r"post-upgrade-data-file-[a-f0-9]{16}\.tmp$").unwrap();
    assert!(pattern.is_match(&path), "unexpected data file path {path}");
    assert!(path.starts_with(world.cache_dir.to_string_lossy().as_ref()));
    assert!(!std::path::Path::new(&path).exists());
}

#[tokio::test]
async fn test_files_changed_by_tasks_are_committed() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^npm "]);
    std::fs::write(dir.path().join("package-lock.json"), "{\"lockfileVersion\":3}\n").unwrap();
    world.scm.push_status(RepoStatus {
        modified: vec!["package-lock.json".into()],
        ..RepoStatus::default()
    });
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(tasks(&["npm install --package-lock-only"]));

    let result = world.worker().process_branch(&config).await.unwrap();

    assert_eq!(result.result, BranchResult::PrCreated);
    let commits = world.scm.commits();
    assert_eq!(commits.len(), 1);
    let paths: Vec<&str> = commits[0].files.iter().map(|f| f.path()).collect();
    assert_eq!(paths, vec!["package.json", "package-lock.json"]);
    let lock = commits[0]
        .files
        .iter()
        .find(|f| f.path() == "package-lock.json")
        .and_then(|f| f.contents())
        .and_then(|c| c.as_text());
    assert_eq!(lock, Some("{\"lockfileVersion\":3}\n"));
}

#[tokio::test]
async fn test_file_filters_limit_collected_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^npm "]);
    std::fs::write(dir.path().join("package-lock.json"), "{}\n").unwrap();
    std::fs::write(dir.path().join("debug.log"), "noise\n").unwrap();
    world.scm.push_status(RepoStatus {
        modified: vec!["package-lock.json".into()],
        not_added: vec!["debug.log".into()],
        ..RepoStatus::default()
    });
    let mut task_set = tasks(&["npm install"]);
    task_set.file_filters = vec!["*.json".into()];
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(task_set);

    world.worker().process_branch(&config).await.unwrap();

    let commits = world.scm.commits();
    let paths: Vec<&str> = commits[0].files.iter().map(|f| f.path()).collect();
    assert!(paths.contains(&"package-lock.json"));
    assert!(!paths.contains(&"debug.log"));
}

#[tokio::test]
async fn test_branch_scoped_tasks_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^echo"]);
    let mut config = branch("upkeep/js", "lodash");
    let mut react = config.upgrades[0].clone();
    react.dep_name = "react".into();
    config.upgrades.push(react);
    let mut task_set = tasks(&["echo {{depName}}"]);
    task_set.execution_mode = Some(ExecutionMode::Branch);
    config.post_upgrade_tasks = Some(task_set);

    world.worker().process_branch(&config).await.unwrap();

    assert_eq!(world.executor.commands(), vec!["echo lodash react".to_string()]);
}

#[tokio::test]
async fn test_failed_task_blocks_pr_automerge() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^npm "]);
    world.executor.fail_matching("npm run build", "ERR! build failed");
    world.prs.set_automerge(PrAutomergeResult {
        automerged: true,
        reason: None,
    });
    let mut config = branch("upkeep/lodash", "lodash");
    config.automerge = true;
    config.ignore_tests = true;
    config.upgrades[0].post_upgrade_tasks = Some(tasks(&["npm run build"]));

    let result = world.worker().process_branch(&config).await.unwrap();

    assert_eq!(result.result, BranchResult::PrCreated);
    assert!(!result.automerged);
    assert!(world.prs.automerge_checks().is_empty());
    assert_eq!(world.platform.comment_topics(), vec![comments::TASK_ERROR_TOPIC]);
    assert!(world.platform.comments()[0].content.contains("ERR! build failed"));
}

#[tokio::test]
async fn test_unwritable_data_file_is_not_a_task_error() {
    log_phase("data_file_failure", TestPhase::Setup, "cache dir is a regular file");
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^echo"]);
    world.cache_dir = dir.path().join("not-a-dir");
    std::fs::write(&world.cache_dir, "occupied").unwrap();
    world.prs.set_automerge(PrAutomergeResult {
        automerged: true,
        reason: None,
    });
    let mut task_set = tasks(&["echo data"]);
    task_set.data_file_template = Some("{{depName}}".into());
    let mut config = branch("upkeep/lodash", "lodash");
    config.automerge = true;
    config.ignore_tests = true;
    config.upgrades[0].post_upgrade_tasks = Some(task_set);

    log_phase("data_file_failure", TestPhase::Execute, "processing branch");
    let result = world.worker().process_branch(&config).await.unwrap();

    log_phase("data_file_failure", TestPhase::Verify, "task ran without the variable");
    let calls = world.executor.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].1.env.contains_key(DATA_FILE_ENV));
    assert!(world.platform.comments().is_empty());
    assert_eq!(result.result, BranchResult::Done);
    assert!(result.automerged);
    assert_eq!(world.prs.automerge_checks(), vec![1]);
}

#[tokio::test]
async fn test_task_failure_comment_is_scrubbed() {
    let dir = tempfile::tempdir().unwrap();
    let mut world = World::new(dir.path());
    world.allowed_commands = allow(&["^npm "]);
    world.secrets = vec!["registry-pass-42".into()];
    world.executor.fail_matching(
        "npm install",
        "npm ERR! 401 using NPM_TOKEN=npm_s3cr3tVALUE1234 and --token ghp_abcdefSECRET (registry-pass-42)",
    );
    let mut config = branch("upkeep/lodash", "lodash");
    config.upgrades[0].post_upgrade_tasks = Some(tasks(&["npm install"]));

    world.worker().process_branch(&config).await.unwrap();

    let posted = world.platform.comments();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].topic, comments::TASK_ERROR_TOPIC);
    let content = &posted[0].content;
    assert!(!content.contains("npm_s3cr3tVALUE1234"));
    assert!(!content.contains("ghp_abcdefSECRET"));
    assert!(!content.contains("registry-pass-42"));
    assert!(content.contains("NPM_TOKEN=***"));
    assert!(content.contains("--token ***"));
    assert!(content.contains("**redacted**"));
}
