//! Configuration system for upkeep.
//!
//! - `UPKEEP_*` environment variable parsing with type safety
//! - the admin-level `config.toml` ([`GlobalConfig`])
//! - source tracking for debugging

pub mod env;
pub mod global;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use global::{ConfigError, DEFAULT_GIT_AUTHOR, GlobalConfig, NoVerify, RetryPolicy};
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
