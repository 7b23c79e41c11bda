use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid tool invocation: {0}")]
    InvalidInvocation(String),
    #[error("failed to launch {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} exited with {}: {stderr}", .path.display(), describe_exit(.exit_code))]
    Failure {
        path: PathBuf,
        exit_code: Option<i32>,
        stderr: String,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

impl ToolError {
    /// Diagnostic text of a failed run, suitable for surfacing to the user.
    pub fn diagnostic(&self) -> String {
        match self {
            ToolError::Failure { stderr, .. } => stderr.clone(),
            other => other.to_string(),
        }
    }
}

/// Runs external (usually privileged) executables and captures their output.
///
/// One process per call, no retries. Dropping the returned future abandons
/// the child without killing it unless `kill_on_cancel` is set: a format in
/// progress must be allowed to finish.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolGateway {
    kill_on_cancel: bool,
}

impl ToolGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kill_on_cancel(mut self, kill: bool) -> Self {
        self.kill_on_cancel = kill;
        self
    }

    /// Run `path args...` to completion and return its trimmed stdout.
    pub async fn execute<I, S>(&self, path: impl AsRef<Path>, args: I) -> Result<String, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ToolError::InvalidInvocation("empty tool path".to_string()));
        }
        let args: Vec<_> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();
        tracing::debug!(tool = %path.display(), ?args, "running tool");

        let output = Command::new(path)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(self.kill_on_cancel)
            .output()
            .await
            .map_err(|source| ToolError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.is_empty() {
            stderr = stdout;
        }
        tracing::warn!(
            tool = %path.display(),
            exit_code = ?output.status.code(),
            %stderr,
            "tool failed"
        );
        Err(ToolError::Failure {
            path: path.to_path_buf(),
            exit_code: output.status.code(),
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_trimmed_stdout() {
        let out = ToolGateway::new()
            .execute("echo", ["  hello tool  "])
            .await
            .unwrap();
        assert_eq!(out, "hello tool");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_code_and_stderr() {
        let err = ToolGateway::new()
            .execute("sh", ["-c", "echo 'disk busy' >&2; exit 3"])
            .await
            .unwrap_err();
        match err {
            ToolError::Failure {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "disk busy");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn stdout_is_used_when_stderr_is_silent() {
        let err = ToolGateway::new()
            .execute("sh", ["-c", "echo 'Error: -69877'; exit 1"])
            .await
            .unwrap_err();
        assert_eq!(err.diagnostic(), "Error: -69877");
    }

    #[tokio::test]
    async fn empty_path_is_rejected() {
        let err = ToolGateway::new()
            .execute("", Vec::<String>::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInvocation(_)));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let err = ToolGateway::new()
            .execute("/nonexistent/winstick-tool", ["x"])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[tokio::test]
    async fn abandoned_call_does_not_block_caller() {
        let gateway = ToolGateway::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), gateway.execute("sleep", ["2"])).await;
        assert!(result.is_err());
    }

    // A killed child is either reaped or left as a zombie.
    #[cfg(target_os = "linux")]
    fn is_running(pid: &str) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit(") ")
                .next()
                .is_some_and(|rest| !rest.starts_with('Z')),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn kill_on_cancel_stops_abandoned_child() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());

        let gateway = ToolGateway::new().kill_on_cancel(true);
        let result =
            tokio::time::timeout(Duration::from_millis(300), gateway.execute("sh", ["-c", &script]))
                .await;
        assert!(result.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let mut running = true;
        for _ in 0..50 {
            running = is_running(&pid);
            if !running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!running, "child {pid} survived cancellation");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn abandoned_child_keeps_running_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > '{}'; exec sleep 2", pid_file.display());

        let result = tokio::time::timeout(
            Duration::from_millis(300),
            ToolGateway::new().execute("sh", ["-c", &script]),
        )
        .await;
        assert!(result.is_err());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        assert!(is_running(&pid));
    }
}
