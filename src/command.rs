//! Host command execution
//!
//! Everything the control plane does to the host (qemu-img, pgrep, ip, tc,
//! iptables, ...) goes through [`CommandRunner`]. Production code uses
//! [`SystemRunner`]; tests substitute a fake that emulates the tools.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::metrics::HOST_COMMANDS;

/// Captured result of a finished host command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output carrying `stdout`
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output carrying `stderr`
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs a program to completion and captures its output
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Spawn `program` with `args`, wait for it to exit.
    ///
    /// A non-zero exit is NOT an error at this level; only failure to spawn is.
    async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::PreconditionFailed(format!("{} is not installed", program))
                }
                std::io::ErrorKind::PermissionDenied => {
                    Error::PermissionDenied(format!("cannot execute {}: {}", program, e))
                }
                _ => Error::Unavailable(format!("failed to spawn {}: {}", program, e)),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Render a command line for logs and error messages
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Convert a `&[&str]` literal into owned arguments
pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Run a command and require a zero exit status
///
/// Non-zero exits become [`Error::CommandFailed`] with the tool's stderr
/// (falling back to stdout when stderr is empty).
pub async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[String],
) -> Result<CommandOutput> {
    let command = display_command(program, args);
    tracing::debug!(command = %command, "running host command");

    let output = match runner.output(program, args).await {
        Ok(output) => output,
        Err(e) => {
            HOST_COMMANDS.with_label_values(&[program, "error"]).inc();
            return Err(e);
        }
    };

    if !output.success {
        HOST_COMMANDS.with_label_values(&[program, "error"]).inc();
        let stderr = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        return Err(Error::CommandFailed { command, stderr });
    }

    HOST_COMMANDS.with_label_values(&[program, "ok"]).inc();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_command() {
        let line = display_command("ip", &args(&["link", "set", "br0", "up"]));
        assert_eq!(line, "ip link set br0 up");
    }

    #[tokio::test]
    async fn test_system_runner_captures_stdout() {
        let output = SystemRunner
            .output("sh", &args(&["-c", "echo hello"]))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_checked_maps_failure() {
        let err = run_checked(&SystemRunner, "sh", &args(&["-c", "echo nope >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            Error::CommandFailed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_precondition() {
        let err = SystemRunner
            .output("definitely-not-a-real-binary-qv", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));
    }
}
