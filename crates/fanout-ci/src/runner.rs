//! External step execution.

use crate::error::StepError;
use crate::stage::StepConfig;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Lines of stderr kept in failure details.
const TAIL_LINES: usize = 20;

/// Result of a step execution.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,

    /// Exit code (-1 when terminated by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,

    pub success: bool,
}

impl StepResult {
    /// Whether this step passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Last lines of stderr, for error reports.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(TAIL_LINES);
        lines[start..].join("\n")
    }
}

/// Runs one external step to completion.
pub struct StepRunner;

impl StepRunner {
    /// Execute a step and capture its output.
    ///
    /// The child is killed when the returned future is dropped, so aborting
    /// the calling task also stops the process.
    pub async fn execute_step(config: &StepConfig) -> Result<StepResult, StepError> {
        let start = Instant::now();

        let (exe, args) = config
            .command
            .split_first()
            .ok_or_else(|| StepError::EmptyCommand {
                step: config.name.clone(),
            })?;

        debug!(step = %config.name, command = %config.display_command(), "spawning step");

        let mut command = Command::new(exe);
        command
            .args(args)
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| StepError::Spawn {
            step: config.name.clone(),
            program: exe.clone(),
            source,
        })?;

        let wait = child.wait_with_output();
        let waited = if config.timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(config.timeout_secs), wait)
                .await
                .map_err(|_| StepError::Timeout {
                    step: config.name.clone(),
                    secs: config.timeout_secs,
                })?
        } else {
            wait.await
        };
        let output = waited.map_err(|source| StepError::Wait {
            step: config.name.clone(),
            source,
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        Ok(StepResult {
            step_name: config.name.clone(),
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            success: output.status.success(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str, timeout_secs: u64) -> StepConfig {
        StepConfig::custom(
            name,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout_secs,
        )
    }

    #[test]
    fn test_step_result_passed() {
        let result = StepResult {
            step_name: "compile".to_string(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 100,
            success: true,
        };
        assert!(result.passed());
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let result = StepResult {
            step_name: "compile".to_string(),
            exit_code: 101,
            stdout: String::new(),
            stderr,
            duration_ms: 1,
            success: false,
        };
        let tail = result.stderr_tail();
        assert_eq!(tail.lines().count(), TAIL_LINES);
        assert!(tail.ends_with("line 49"));
        assert!(!tail.contains("line 29\n"));
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let result = StepRunner::execute_step(&sh("echo", "echo hello", 60))
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_execute_failing_command() {
        let result = StepRunner::execute_step(&sh("fail", "echo boom >&2; exit 3", 60))
            .await
            .expect("execute failed");
        assert!(!result.passed());
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stderr_tail(), "boom");
    }

    #[tokio::test]
    async fn test_env_and_workdir_applied() {
        let dir = tempfile::tempdir().unwrap();
        let step = sh("env", "printf '%s:' \"$FANOUT_TEST_VAR\"; pwd", 60)
            .with_env("FANOUT_TEST_VAR", "x86_64")
            .in_dir(dir.path());
        let result = StepRunner::execute_step(&step).await.unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(result.stdout.starts_with("x86_64:"));
        assert!(result.stdout.trim_end().ends_with(canonical.to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = StepRunner::execute_step(&sh("slow", "sleep 5", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Timeout { secs: 1, .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let step = StepConfig::custom(
            "prepare",
            vec!["fanout-definitely-not-installed".to_string()],
            5,
        );
        let err = StepRunner::execute_step(&step).await.unwrap_err();
        assert!(matches!(err, StepError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let step = StepConfig::custom("empty", vec![], 5);
        assert!(matches!(
            StepRunner::execute_step(&step).await,
            Err(StepError::EmptyCommand { .. })
        ));
    }
}
