//! Shared wiring for the branch worker scenarios.

#![allow(dead_code)]

use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use upkeep_common::{FileChange, Sanitizer};
use upkeep_git::MockScm;
use upkeep_wkr::config::Upgrade;
use upkeep_wkr::ports::mock::{
    MockArtifactUpdater, MockMergeConfidence, MockPlatform, MockPrManager, MockSchedule,
};
use upkeep_wkr::ports::{CountingLimits, InMemoryBranchCache, PackageFilesResult};
use upkeep_wkr::tasks::MockCommandExecutor;
use upkeep_wkr::{BranchConfig, BranchWorker, Collaborators, PostUpgradeRunner, TaskSettings};

pub struct World {
    pub scm: MockScm,
    pub platform: MockPlatform,
    pub prs: MockPrManager,
    pub artifacts: MockArtifactUpdater,
    pub executor: MockCommandExecutor,
    pub schedule: MockSchedule,
    pub limits: Arc<CountingLimits>,
    pub cache: Arc<InMemoryBranchCache>,
    pub allowed_commands: Vec<Regex>,
    pub cache_dir: std::path::PathBuf,
    /// Values the task runner scrubs from its errors.
    pub secrets: Vec<String>,
}

impl World {
    pub fn new(local_dir: &Path) -> Self {
        Self {
            scm: MockScm::new(local_dir),
            platform: MockPlatform::new(),
            prs: MockPrManager::new(),
            artifacts: MockArtifactUpdater::new().returning(package_json_update()),
            executor: MockCommandExecutor::new(),
            schedule: MockSchedule::default(),
            limits: Arc::new(CountingLimits::new()),
            cache: Arc::new(InMemoryBranchCache::new()),
            allowed_commands: Vec::new(),
            cache_dir: local_dir.join(".cache"),
            secrets: Vec::new(),
        }
    }

    pub fn worker(&self) -> BranchWorker {
        let settings = TaskSettings {
            allowed_commands: self.allowed_commands.clone(),
            allow_command_templating: true,
            expose_all_env: false,
            cache_dir: self.cache_dir.clone(),
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
            PostUpgradeRunner::new(settings, Arc::new(self.executor.clone()))
                .with_sanitizer(Sanitizer::with_secrets(self.secrets.clone())),
        )
    }
}

pub fn package_json_update() -> PackageFilesResult {
    PackageFilesResult {
        updated_package_files: vec![FileChange::addition(
            "package.json",
            "{\"dependencies\":{\"lodash\":\"4.17.21\"}}\n",
        )],
        ..PackageFilesResult::default()
    }
}

pub fn branch(name: &str, dep: &str) -> BranchConfig {
    let mut config = BranchConfig::new(name, "main");
    let mut upgrade = Upgrade::new(dep);
    upgrade.package_file = Some("package.json".into());
    upgrade.current_value = Some("4.17.20".into());
    upgrade.new_value = Some("4.17.21".into());
    config.upgrades = vec![upgrade];
    config
}
