//! Process execution for post-upgrade commands.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use upkeep_common::mask_sensitive_command;

/// Variables passed through when the full environment is not exposed.
pub const BASE_ENV_VARS: &[&str] = &["HOME", "PATH", "LANG", "LC_ALL"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub cwd: PathBuf,
    /// The complete child environment.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {}: {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Failed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput, ExecError>;
}

/// Child environment: selected variables (or everything) from the current
/// process plus `extra`.
pub fn child_env(expose_all: bool, extra: &[(&str, String)]) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = if expose_all {
        std::env::vars().collect()
    } else {
        BASE_ENV_VARS
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| ((*key).to_string(), v)))
            .collect()
    };
    for (key, value) in extra {
        env.insert((*key).to_string(), value.clone());
    }
    env
}

/// Runs commands through `sh -c`.
#[derive(Debug, Clone)]
pub struct ShellCommandExecutor {
    shell: PathBuf,
    timeout: Option<Duration>,
}

impl Default for ShellCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellCommandExecutor {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("sh"),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shell(mut self, shell: impl AsRef<Path>) -> Self {
        self.shell = shell.as_ref().to_path_buf();
        self
    }
}

#[async_trait]
impl CommandExecutor for ShellCommandExecutor {
    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput, ExecError> {
        let masked = mask_sensitive_command(command);
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&options.cwd)
            .env_clear()
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(cwd = %options.cwd.display(), command = %masked, "running post-upgrade command");
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ExecError::Timeout {
                        command: masked,
                        timeout: limit,
                    });
                }
            },
            None => cmd.output().await,
        }
        .map_err(|source| ExecError::Spawn {
            command: masked.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(ExecOutput { stdout, stderr })
        } else {
            Err(ExecError::Failed {
                command: masked,
                exit_code: output.status.code(),
                stderr: stderr.trim_end().to_string(),
            })
        }
    }
}

#[derive(Debug, Default)]
struct MockExecState {
    failures: Vec<(String, String)>,
    calls: Vec<(String, ExecOptions)>,
}

/// Records commands instead of running them. Commands containing a
/// registered needle fail with the given stderr.
#[derive(Debug, Clone, Default)]
pub struct MockCommandExecutor {
    state: Arc<Mutex<MockExecState>>,
}

impl MockCommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_matching(&self, needle: &str, stderr: &str) {
        self.state
            .lock()
            .expect("mock executor mutex poisoned")
            .failures
            .push((needle.to_string(), stderr.to_string()));
    }

    pub fn calls(&self) -> Vec<(String, ExecOptions)> {
        self.state
            .lock()
            .expect("mock executor mutex poisoned")
            .calls
            .clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|(command, _)| command).collect()
    }
}

#[async_trait]
impl CommandExecutor for MockCommandExecutor {
    async fn exec(&self, command: &str, options: &ExecOptions) -> Result<ExecOutput, ExecError> {
        let mut state = self.state.lock().expect("mock executor mutex poisoned");
        state.calls.push((command.to_string(), options.clone()));
        match state
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            Some((_, stderr)) => Err(ExecError::Failed {
                command: command.to_string(),
                exit_code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Ok(ExecOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_env_is_restricted() {
        let env = child_env(false, &[("UPKEEP_EXTRA", "1".to_string())]);
        assert!(
            env.keys()
                .all(|k| BASE_ENV_VARS.contains(&k.as_str()) || k == "UPKEEP_EXTRA")
        );
        assert_eq!(env.get("UPKEEP_EXTRA").map(String::as_str), Some("1"));
    }

    #[tokio::test]
    async fn test_shell_executor_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExecOptions {
            cwd: dir.path().to_path_buf(),
            env: child_env(false, &[]),
        };
        let executor = ShellCommandExecutor::new();

        let out = executor.exec("echo hello > out.txt && echo done", &options).await.unwrap();
        assert_eq!(out.stdout.trim(), "done");
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hello\n");

        let err = executor.exec("echo broken >&2; exit 3", &options).await.unwrap_err();
        match err {
            ExecError::Failed { exit_code, stderr, .. } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shell_executor_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExecOptions {
            cwd: dir.path().to_path_buf(),
            env: child_env(false, &[]),
        };
        let executor = ShellCommandExecutor::new().with_timeout(Some(Duration::from_millis(100)));
        let err = executor.exec("sleep 5", &options).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_mock_executor_records_and_fails() {
        let executor = MockCommandExecutor::new();
        executor.fail_matching("exit 1", "Meh, this went wrong!");
        let options = ExecOptions {
            cwd: PathBuf::from("/repo"),
            env: BTreeMap::new(),
        };
        assert!(executor.exec("echo ok", &options).await.is_ok());
        assert!(executor.exec("exit 1", &options).await.is_err());
        assert_eq!(executor.commands(), vec!["echo ok", "exit 1"]);
    }
}
