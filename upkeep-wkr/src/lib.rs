//! Upkeep branch worker.
//!
//! Runs the post-upgrade tasks of a branch and drives each branch through
//! the [`BranchWorker`] state machine against an [`upkeep_git::Scm`] and
//! the collaborator ports in [`ports`].

pub mod config;
pub mod error;
pub mod ports;
pub mod processor;
pub mod tasks;

pub use config::{BranchConfig, PostUpgradeTasks, Upgrade};
pub use error::{Result, WorkerError};
pub use processor::{BranchResult, BranchWorker, Collaborators, ProcessBranchResult, RunReport};
pub use tasks::{PostUpgradeResult, PostUpgradeRunner, TaskSettings};
