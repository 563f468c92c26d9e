//! Upkeep worker CLI
//!
//! Operator entry point for the git layer and the post-upgrade task
//! runner: sync a working copy, inspect branches, run the tasks of a
//! branch definition and browse the error catalog.

#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use upkeep_common::{ErrorCode, FileChange, GlobalConfig, LogConfig, init_logging};
use upkeep_git::{
    FingerprintCache, JsonFileFingerprintStore, ProcessGitRunner, StorageConfig, VcsManager,
};
use upkeep_wkr::ports::PackageFilesResult;
use upkeep_wkr::tasks::ShellCommandExecutor;
use upkeep_wkr::{BranchConfig, PostUpgradeRunner, TaskSettings};

#[derive(Parser)]
#[command(name = "upkeep-wkr")]
#[command(author, version, about = "Upkeep worker - git plumbing and post-upgrade tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Global configuration file (TOML)
    #[arg(long, global = true, env = "UPKEEP_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or refresh the working copy and print the current branch
    Sync {
        /// Remote repository URL
        #[arg(long)]
        url: String,

        /// Working directory (defaults to `local_dir` from the configuration)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// List the remote branch heads
    Branches {
        #[arg(long)]
        url: String,
    },

    /// Report whether a branch is behind, modified or conflicted
    Check {
        #[arg(long)]
        url: String,

        #[arg(long)]
        branch: String,

        /// Base branch to compare against
        #[arg(long)]
        base: String,
    },

    /// Run the post-upgrade tasks of a branch definition in the local directory
    Tasks {
        /// Branch definition (JSON or TOML)
        #[arg(long = "branch-config", value_name = "FILE")]
        branch_config: PathBuf,
    },

    /// Show error catalog entries
    Errors {
        /// Error code such as UPK-E101; lists every code when omitted
        code: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    let _logging_guards = init_logging(&log_config)?;

    if let Commands::Errors { code } = &cli.command {
        return print_errors(code.as_deref());
    }

    let (global, source) = GlobalConfig::resolve(cli.config.as_deref())?;
    debug!(%source, "loaded global configuration");

    match cli.command {
        Commands::Sync { url, dir } => {
            let dir = dir.unwrap_or_else(|| global.local_dir.clone());
            let manager = open_manager(&global, dir, &url, FingerprintCache::in_memory()).await?;
            manager.sync().await?;
            let branch = manager.current_branch().await.unwrap_or_default();
            let sha = manager.current_branch_sha().await.unwrap_or_default();
            println!("{branch} {sha}");
            Ok(())
        }
        Commands::Branches { url } => {
            let manager = open_manager(
                &global,
                global.local_dir.clone(),
                &url,
                FingerprintCache::in_memory(),
            )
            .await?;
            for branch in manager.get_branch_list().await {
                println!("{branch}");
            }
            Ok(())
        }
        Commands::Check { url, branch, base } => {
            let store = JsonFileFingerprintStore::open(global.cache_dir.join("fingerprints.json"));
            let cache = FingerprintCache::new(Arc::new(store));
            let manager = open_manager(&global, global.local_dir.clone(), &url, cache).await?;
            manager.sync().await?;
            let behind = manager.is_branch_behind_base(&branch, &base).await?;
            let modified = manager.is_branch_modified(&branch, &base).await?;
            let conflicted = manager.is_branch_conflicted(&base, &branch).await?;
            let report = serde_json::json!({
                "branch": branch,
                "base": base,
                "behind": behind,
                "modified": modified,
                "conflicted": conflicted,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Tasks { branch_config } => run_tasks(&global, &branch_config).await,
        Commands::Errors { .. } => Ok(()),
    }
}

async fn open_manager(
    global: &GlobalConfig,
    dir: PathBuf,
    url: &str,
    cache: FingerprintCache,
) -> Result<VcsManager> {
    let runner = Arc::new(ProcessGitRunner::new().with_timeout(global.git_timeout));
    let manager = VcsManager::from_config(global, dir, runner, cache)?;
    manager
        .init_repo(StorageConfig::from_global(url, global))
        .await?;
    manager
        .set_user_repo_config(global.git_author.as_deref(), global.ignored_authors.clone())
        .await?;
    Ok(manager)
}

/// Treat every file of the branch definition's upgrades as updated so the
/// tasks have something to work on.
async fn run_tasks(global: &GlobalConfig, path: &std::path::Path) -> Result<()> {
    let config = BranchConfig::from_file(path)
        .with_context(|| format!("loading branch definition {}", path.display()))?;
    let settings = TaskSettings::from_global(global)?;
    if settings.allowed_commands.is_empty() {
        bail!("no allowed_commands configured; post-upgrade tasks are disabled");
    }

    let local_dir = global.local_dir.clone();
    let mut files = PackageFilesResult::default();
    for package_file in config.upgrades.iter().filter_map(|u| u.package_file.as_deref()) {
        let contents = std::fs::read(local_dir.join(package_file))
            .with_context(|| format!("reading {package_file}"))?;
        files.updated_package_files.push(FileChange::addition(
            package_file,
            upkeep_common::FileContents::from_bytes(contents),
        ));
    }

    let manager = VcsManager::new(
        local_dir,
        Arc::new(ProcessGitRunner::new().with_timeout(global.git_timeout)),
        FingerprintCache::in_memory(),
    );
    let executor = ShellCommandExecutor::new();
    let runner = PostUpgradeRunner::new(settings, Arc::new(executor))
        .with_sanitizer(global.sanitizer(None));
    info!(branch = %config.branch_name, "running post-upgrade tasks");
    let result = runner
        .execute_post_upgrade_commands(&manager, &config, &files)
        .await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn print_errors(code: Option<&str>) -> Result<()> {
    match code {
        Some(raw) => {
            let Some(code) = ErrorCode::from_code_string(raw) else {
                bail!("unknown error code: {raw}");
            };
            println!("{}", code.entry().format_full());
        }
        None => {
            for code in ErrorCode::all() {
                println!("{}  {}", code.code_string(), code.entry().message);
            }
        }
    }
    Ok(())
}
