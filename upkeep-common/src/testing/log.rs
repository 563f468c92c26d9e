//! Structured test logging for CI debugging.
//!
//! Install once per test binary:
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     upkeep_common::testing::init_global_test_logging();
//! }
//! ```
//!
//! Every tracing event emitted by the code under test then lands in
//! `target/test-logs/all_tests.jsonl`, and a compact copy is captured by
//! the test harness.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Initialize global JSONL logging for all tests.
///
/// Safe to call multiple times.
///
/// # Environment Variables
///
/// - `UPKEEP_TEST_LOG_FILE`: override the log file path
/// - `UPKEEP_TEST_LOG_LEVEL`: level filter (default: `debug`)
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let level = std::env::var("UPKEEP_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "upkeep_common={level},upkeep_git={level},upkeep_wkr={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Record a phase transition of a scenario test in the JSONL log.
pub fn log_phase(test_name: &str, phase: TestPhase, message: &str) {
    tracing::info!(target: "upkeep_common::testing", test = test_name, %phase, "{message}");
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var("UPKEEP_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("all_tests.jsonl"))
        .ok()
}

/// Find the target directory by searching up from current dir.
fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(TestPhase::Setup.to_string(), "setup");
        assert_eq!(TestPhase::Teardown.to_string(), "teardown");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_global_test_logging();
        init_global_test_logging();
        log_phase("test_init_is_idempotent", TestPhase::Verify, "logging ready");
    }
}
