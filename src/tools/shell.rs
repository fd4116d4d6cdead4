//! Shell 协作者：阻塞 / 后台两种执行方式
//!
//! 阻塞执行通过 sh -c / cmd /C，带超时，返回 (退出码, stdout, stderr)；
//! 后台执行只负责拉起进程并立即返回 PID。危险子串（rm -rf、mkfs 等）直接拒绝。

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// 禁止的命令子串
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "chmod 777 /",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// 一次命令执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            code: 1,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Shell 协作者
#[async_trait]
pub trait Shell: Send + Sync {
    /// 执行命令；background=true 时不等待结束
    async fn execute(&self, command: &str, background: bool) -> ShellOutput;
}

/// 本机 Shell
pub struct SystemShell {
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl SystemShell {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout: Duration::from_secs(timeout_secs),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn check_forbidden(command: &str) -> Result<(), String> {
        let lower = command.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        Ok(())
    }

    fn build(&self, command: &str) -> Command {
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Shell for SystemShell {
    async fn execute(&self, command: &str, background: bool) -> ShellOutput {
        let command = command.trim();
        if command.is_empty() {
            return ShellOutput::failed("Empty command");
        }
        if let Err(e) = Self::check_forbidden(command) {
            tracing::warn!(command = %command, "{}", e);
            return ShellOutput::failed(e);
        }
        tracing::info!(command = %command, background, "Executing shell command");

        let mut cmd = self.build(command);
        if background {
            cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            return match cmd.spawn() {
                Ok(child) => {
                    let pid = child.id().unwrap_or_default();
                    tracing::info!(pid, "Started background process");
                    ShellOutput {
                        code: 0,
                        stdout: format!("Started background process PID={}", pid),
                        stderr: String::new(),
                    }
                }
                Err(e) => {
                    tracing::error!(command = %command, error = %e, "spawn failed");
                    ShellOutput::failed(e.to_string())
                }
            };
        }

        cmd.kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => ShellOutput::failed(format!(
                "Command timed out after {}s",
                self.timeout.as_secs()
            )),
            Ok(Err(e)) => {
                tracing::error!(command = %command, error = %e, "Error executing shell command");
                ShellOutput::failed(e.to_string())
            }
            Ok(Ok(output)) => {
                let out = ShellOutput {
                    code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };
                tracing::info!(command = %command, code = out.code, "Command finished");
                out
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_captures_output_and_code() {
        let shell = SystemShell::new(10);
        let ok = shell.execute("echo hi", false).await;
        assert_eq!(ok.code, 0);
        assert_eq!(ok.stdout.trim(), "hi");

        let bad = shell.execute("echo oops 1>&2; exit 3", false).await;
        assert_eq!(bad.code, 3);
        assert_eq!(bad.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_background_reports_pid() {
        let shell = SystemShell::new(10);
        let out = shell.execute("sleep 0", true).await;
        assert_eq!(out.code, 0);
        assert!(out.stdout.starts_with("Started background process PID="));
    }

    #[tokio::test]
    async fn test_forbidden_and_timeout() {
        let shell = SystemShell::new(1);
        assert_ne!(shell.execute("mkfs.ext4 /dev/null", false).await.code, 0);
        let slow = shell.execute("sleep 5", false).await;
        assert_eq!(slow.code, 1);
        assert!(slow.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_working_dir_is_used() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let shell = SystemShell::new(10).with_working_dir(dir.path());
        let out = shell.execute("ls", false).await;
        assert!(out.stdout.contains("marker.txt"));
    }
}
