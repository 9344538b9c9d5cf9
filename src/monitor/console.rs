//! Text console (HMP) client
//!
//! The human monitor has no message framing: the `(qemu)` prompt is the only
//! signal that the monitor is ready or that a command has finished. Each
//! command runs on its own connection:
//!
//! ```text
//! connect → buffer until first prompt → clear buffer (banner)
//!         → settle → write "<command>\n" → accumulate until complete
//!         → clean → close
//! ```
//!
//! Commands on one [`ConsoleClient`] are serialized; two commands in flight
//! on the same monitor would make the replies impossible to attribute.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::endpoint::Endpoint;
use crate::config::ConsoleConfig;
use crate::error::{Error, Result};
use crate::metrics::{CONSOLE_COMMANDS, CONSOLE_COMMAND_DURATION};

/// Prompt emitted by the monitor after every completed command
pub const PROMPT: &str = "(qemu)";

/// Commands that may print the prompt before they are actually finished
const LONG_RUNNING_COMMANDS: [&str; 4] = ["savevm", "loadvm", "delvm", "migrate"];

/// Case-insensitive substrings that mark a console reply as failed
pub const ERROR_MARKERS: [&str; 8] = [
    "error",
    "failed",
    "invalid",
    "not found",
    "cannot",
    "unknown",
    "undefined",
    "does not exist",
];

lazy_static! {
    static ref PROMPT_RE: Regex = Regex::new(r"\(qemu\)\s*").expect("static regex");
    static ref ESCAPE_RE: Regex = Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static regex");
}

/// Anything that can run one monitor command and return its cleaned reply
///
/// The snapshot orchestrator and ISO toggling only depend on this trait, so
/// they can be driven against a scripted console in tests.
#[async_trait]
pub trait Console: Send + Sync {
    async fn execute(&self, command: &str) -> Result<String>;
}

/// Client for one VM's text monitor socket
#[derive(Debug)]
pub struct ConsoleClient {
    endpoint: Endpoint,
    timeout: Duration,
    settle_delay: Duration,
    /// Held for the whole exchange; no pipelining
    serial: Mutex<()>,
}

impl ConsoleClient {
    pub fn new(endpoint: Endpoint, config: &ConsoleConfig) -> Self {
        Self {
            endpoint,
            timeout: config.command_timeout(),
            settle_delay: config.settle_delay(),
            serial: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run `command` with an explicit timeout instead of the configured one
    pub async fn execute_with_timeout(&self, command: &str, timeout: Duration) -> Result<String> {
        let _guard = self.serial.lock().await;
        let kind = if is_long_running(command) { "long" } else { "short" };
        let started = Instant::now();

        // Dropping the exchange future on timeout drops the socket with it
        let result = match tokio::time::timeout(timeout, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(endpoint = %self.endpoint, command, ?timeout, "console command timed out");
                CONSOLE_COMMANDS.with_label_values(&[kind, "timeout"]).inc();
                return Err(Error::timeout(format!("console command `{}`", command), timeout));
            }
        };

        CONSOLE_COMMAND_DURATION
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
        CONSOLE_COMMANDS
            .with_label_values(&[kind, crate::metrics::outcome(&result)])
            .inc();
        result
    }

    /// One connection, one command
    async fn exchange(&self, command: &str) -> Result<String> {
        let mut stream = self.endpoint.connect().await?;
        let mut raw: Vec<u8> = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        let mut command_sent = false;

        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::Protocol(format!(
                    "console {} closed before `{}` completed",
                    self.endpoint, command
                )));
            }
            raw.extend_from_slice(&chunk[..n]);
            let buffer = String::from_utf8_lossy(&raw);

            if !command_sent {
                if buffer.contains(PROMPT) {
                    // Banner and first prompt are not part of the reply
                    raw.clear();
                    tokio::time::sleep(self.settle_delay).await;
                    stream.write_all(format!("{}\n", command).as_bytes()).await?;
                    stream.flush().await?;
                    command_sent = true;
                    tracing::debug!(endpoint = %self.endpoint, command, "console command sent");
                }
                continue;
            }

            if is_complete(&buffer, command) {
                let cleaned = clean_response(&buffer, command);
                tracing::debug!(command, response = %cleaned, "console command complete");
                return Ok(cleaned);
            }
        }
    }

    /// True when the monitor answers `info version` within five seconds
    pub async fn check_connection(&self) -> bool {
        self.execute_with_timeout("info version", Duration::from_secs(5))
            .await
            .is_ok()
    }

    /// Raw `info status` reply, e.g. "VM status: running"
    pub async fn status(&self) -> Result<String> {
        self.execute("info status").await
    }

    /// Snapshots recorded in the guest disk image
    pub async fn snapshot_list(&self) -> Result<Vec<LiveSnapshot>> {
        let response = self.execute("info snapshots").await?;
        Ok(parse_snapshot_list(&response))
    }
}

#[async_trait]
impl Console for ConsoleClient {
    async fn execute(&self, command: &str) -> Result<String> {
        self.execute_with_timeout(command, self.timeout).await
    }
}

/// savevm, loadvm, delvm and migrate finish only on a trailing prompt
pub fn is_long_running(command: &str) -> bool {
    let command = command.trim();
    LONG_RUNNING_COMMANDS
        .iter()
        .any(|prefix| command.starts_with(prefix))
}

/// Decide whether the accumulated reply to `command` is finished
///
/// Nothing completes before some prompt has been seen. Ordinary commands are
/// then done. Long-running commands are done when an error keyword shows up
/// anywhere, or when the last non-empty line is exactly the prompt.
pub fn is_complete(buffer: &str, command: &str) -> bool {
    if !buffer.contains(PROMPT) {
        return false;
    }

    if !is_long_running(command) {
        return true;
    }

    if buffer.to_lowercase().contains("error") {
        return true;
    }

    buffer
        .split(&['\n', '\r'][..])
        .map(|line| ESCAPE_RE.replace_all(line, ""))
        .filter(|line| !line.trim().is_empty())
        .last()
        .map(|line| line.trim() == PROMPT)
        .unwrap_or(false)
}

/// Strip echoes, prompts and escape sequences; normalize line endings
pub fn clean_response(buffer: &str, command: &str) -> String {
    let mut cleaned = if command.is_empty() {
        buffer.to_string()
    } else {
        buffer.replace(command, "")
    };
    cleaned = PROMPT_RE.replace_all(&cleaned, "").into_owned();
    cleaned = ESCAPE_RE.replace_all(&cleaned, "").into_owned();
    cleaned = cleaned.replace("\r\n", "\n").replace('\r', "\n");
    cleaned.trim().to_string()
}

/// First error marker found in a reply, if any
pub fn find_error_marker(response: &str) -> Option<&'static str> {
    let lowered = response.to_lowercase();
    ERROR_MARKERS
        .iter()
        .copied()
        .find(|marker| lowered.contains(marker))
}

/// Fail with [`Error::Protocol`] when a reply carries any error marker
pub fn validate_response(response: &str, command: &str) -> Result<()> {
    match find_error_marker(response) {
        Some(marker) => {
            tracing::warn!(command, marker, response, "console reported an error");
            Err(Error::Protocol(format!("`{}` failed: {}", command, response)))
        }
        None => Ok(()),
    }
}

/// One row of `info snapshots`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSnapshot {
    pub id: String,
    pub tag: String,
    pub vm_size: String,
    pub date: String,
    pub time: String,
    pub vm_clock: String,
}

/// Parse the table printed by `info snapshots`
///
/// Header lines ("Snapshot list:", "List of snapshots ...", the "ID TAG ..."
/// column header) and anything too short to be a row are skipped. Newer
/// monitors print sizes with a separate unit ("1.2 MiB"), which is joined
/// back into one field.
pub fn parse_snapshot_list(response: &str) -> Vec<LiveSnapshot> {
    let mut snapshots = Vec::new();

    for line in response.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.contains("Snapshot list:")
            || line.starts_with("List of snapshots")
            || line.starts_with("ID")
            || line.starts_with("There is no snapshot")
        {
            continue;
        }

        let mut parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if parts.len() >= 7 && is_size_unit(&parts[3]) {
            let unit = parts.remove(3);
            parts[2] = format!("{} {}", parts[2], unit);
        }

        if parts.len() >= 6 {
            let mut fields = parts.into_iter();
            let mut next = || fields.next().unwrap_or_default();
            snapshots.push(LiveSnapshot {
                id: next(),
                tag: next(),
                vm_size: next(),
                date: next(),
                time: next(),
                vm_clock: next(),
            });
        }
    }

    snapshots
}

fn is_size_unit(token: &str) -> bool {
    matches!(
        token,
        "B" | "KiB" | "MiB" | "GiB" | "TiB" | "KB" | "MB" | "GB" | "TB"
    )
}
