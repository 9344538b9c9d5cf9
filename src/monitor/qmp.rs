//! JSON control channel (QMP) client
//!
//! ```text
//! Disconnected → Connecting → AwaitingGreeting → Ready → Disconnected
//! ```
//!
//! A background reader task owns the read half of the socket and demuxes
//! every inbound line by shape:
//!
//! - `{"QMP": {...}}`            greeting, completes `connect`
//! - `{"return": .., "id": n}`   resolves pending command `n`
//! - `{"error": {..}, "id": n}`  rejects pending command `n`
//! - `{"event": .., "data": ..}` broadcast to subscribers
//!
//! When the reader stops for any reason every pending command is failed with
//! [`Error::Disconnected`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use super::endpoint::{ControlStream, Endpoint};
use crate::config::QmpConfig;
use crate::error::{Error, Result};
use crate::metrics::{QMP_COMMANDS, QMP_EVENTS};

/// Connection state of a [`QmpClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    AwaitingGreeting,
    Ready,
}

/// Version and capability banner sent by QEMU on connect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QmpGreeting {
    #[serde(default)]
    pub version: Value,
    #[serde(default)]
    pub capabilities: Vec<Value>,
}

/// Asynchronous event pushed by QEMU (SHUTDOWN, STOP, RESUME, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QmpEvent {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Value,
}

/// Outgoing command line
#[derive(Debug, Serialize)]
struct QmpRequest<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
    id: u64,
}

/// Reply to `query-status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRunState {
    pub status: String,
    pub running: bool,
    #[serde(default)]
    pub singlestep: bool,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value>>>;

/// State shared between the client handle and its reader task
struct Shared {
    state: StdMutex<ChannelState>,
    pending: StdMutex<PendingMap>,
    events: broadcast::Sender<QmpEvent>,
}

impl Shared {
    fn set_state(&self, state: ChannelState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn state(&self) -> ChannelState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ChannelState::Disconnected)
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<Result<Value>>> {
        self.pending.lock().ok().and_then(|mut map| map.remove(&id))
    }

    /// Mark the channel closed and reject everything still in flight
    fn fail_all_pending(&self) {
        self.set_state(ChannelState::Disconnected);
        let drained: Vec<_> = match self.pending.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "QMP channel closed with pending commands");
        }
        for (_, slot) in drained {
            let _ = slot.send(Err(Error::Disconnected));
        }
    }
}

/// Client for one VM's QMP socket
pub struct QmpClient {
    endpoint: Endpoint,
    writer: Mutex<Option<WriteHalf<ControlStream>>>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    greeting: QmpGreeting,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl QmpClient {
    /// Open the socket and wait for the greeting
    ///
    /// Fails with [`Error::Disconnected`] when the peer closes before
    /// greeting, and [`Error::Timeout`] when no greeting arrives in time.
    pub async fn connect(endpoint: &Endpoint, config: &QmpConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(config.event_capacity);
        let shared = Arc::new(Shared {
            state: StdMutex::new(ChannelState::Connecting),
            pending: StdMutex::new(HashMap::new()),
            events,
        });

        let stream = match tokio::time::timeout(config.connect_timeout(), endpoint.connect()).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.set_state(ChannelState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                shared.set_state(ChannelState::Disconnected);
                return Err(Error::timeout(
                    format!("QMP connect to {}", endpoint),
                    config.connect_timeout(),
                ));
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (greeting_tx, greeting_rx) = oneshot::channel();
        shared.set_state(ChannelState::AwaitingGreeting);
        let reader = tokio::spawn(read_loop(read_half, shared.clone(), greeting_tx));

        let greeting = match tokio::time::timeout(config.connect_timeout(), greeting_rx).await {
            Ok(Ok(greeting)) => greeting,
            Ok(Err(_)) => {
                reader.abort();
                shared.set_state(ChannelState::Disconnected);
                return Err(Error::Disconnected);
            }
            Err(_) => {
                reader.abort();
                shared.set_state(ChannelState::Disconnected);
                return Err(Error::timeout(
                    format!("QMP greeting from {}", endpoint),
                    config.connect_timeout(),
                ));
            }
        };

        shared.set_state(ChannelState::Ready);
        tracing::debug!(endpoint = %endpoint, version = %greeting.version, "QMP channel ready");

        Ok(Self {
            endpoint: endpoint.clone(),
            writer: Mutex::new(Some(write_half)),
            shared,
            next_id: AtomicU64::new(0),
            greeting,
            command_timeout: config.command_timeout(),
            reader,
        })
    }

    /// Connect and leave capability negotiation mode
    pub async fn connect_negotiated(endpoint: &Endpoint, config: &QmpConfig) -> Result<Self> {
        let client = Self::connect(endpoint, config).await?;
        client.negotiate().await?;
        Ok(client)
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn greeting(&self) -> &QmpGreeting {
        &self.greeting
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Receiver for asynchronous events; events are never matched to commands
    pub fn subscribe(&self) -> broadcast::Receiver<QmpEvent> {
        self.shared.events.subscribe()
    }

    /// Events as a stream; lagged receivers silently skip what they missed
    pub fn events(&self) -> impl Stream<Item = QmpEvent> {
        BroadcastStream::new(self.subscribe()).filter_map(|item| item.ok())
    }

    /// Send one command and wait for its reply
    pub async fn send(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if self.state() != ChannelState::Ready {
            return Err(Error::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }
        // The reader may have drained the map between the check above and the insert
        if self.state() != ChannelState::Ready {
            self.shared.take_pending(id);
            return Err(Error::Disconnected);
        }

        let mut line = serde_json::to_string(&QmpRequest {
            execute: command,
            arguments,
            id,
        })?;
        line.push('\n');

        if let Err(e) = self.write_line(&line).await {
            self.shared.take_pending(id);
            QMP_COMMANDS.with_label_values(&[command, "error"]).inc();
            return Err(e);
        }
        tracing::trace!(command, id, "QMP command sent");

        let result = match tokio::time::timeout(self.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            // Slot dropped without a reply: the reader is gone
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.shared.take_pending(id);
                tracing::warn!(command, id, "QMP command timed out, closing channel");
                self.close().await;
                Err(Error::timeout(format!("QMP `{}`", command), self.command_timeout))
            }
        };

        QMP_COMMANDS
            .with_label_values(&[command, crate::metrics::outcome(&result)])
            .inc();
        result
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(line.as_bytes()).await.map_err(|e| {
            tracing::warn!(error = %e, "QMP write failed");
            Error::Disconnected
        })?;
        writer.flush().await.map_err(|_| Error::Disconnected)
    }

    /// Close the channel and fail all pending commands
    pub async fn close(&self) {
        self.reader.abort();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.fail_all_pending();
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Command helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// `qmp_capabilities`; required once before any other command
    pub async fn negotiate(&self) -> Result<()> {
        self.send("qmp_capabilities", None).await.map(|_| ())
    }

    pub async fn query_status(&self) -> Result<VmRunState> {
        let value = self.send("query-status", None).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn query_version(&self) -> Result<Value> {
        self.send("query-version", None).await
    }

    pub async fn query_kvm(&self) -> Result<Value> {
        self.send("query-kvm", None).await
    }

    pub async fn query_block(&self) -> Result<Value> {
        self.send("query-block", None).await
    }

    /// Resume a paused guest
    pub async fn cont(&self) -> Result<()> {
        self.send("cont", None).await.map(|_| ())
    }

    /// Pause the guest
    pub async fn stop(&self) -> Result<()> {
        self.send("stop", None).await.map(|_| ())
    }

    pub async fn system_reset(&self) -> Result<()> {
        self.send("system_reset", None).await.map(|_| ())
    }

    /// ACPI power button
    pub async fn system_powerdown(&self) -> Result<()> {
        self.send("system_powerdown", None).await.map(|_| ())
    }

    /// Ask QEMU to exit; the channel closes right after the reply
    pub async fn quit(&self) -> Result<()> {
        self.send("quit", None).await.map(|_| ())
    }

    pub async fn eject(&self, device: &str, force: bool) -> Result<()> {
        self.send("eject", Some(json!({ "device": device, "force": force })))
            .await
            .map(|_| ())
    }
}

impl Drop for QmpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for QmpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QmpClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

/// Reader task: demux lines until EOF or error, then fail what is pending
async fn read_loop(
    read_half: ReadHalf<ControlStream>,
    shared: Arc<Shared>,
    greeting_tx: oneshot::Sender<QmpGreeting>,
) {
    let mut greeting_tx = Some(greeting_tx);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "QMP read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, line = %line, "malformed QMP message");
                continue;
            }
        };

        dispatch(message, &shared, &mut greeting_tx);
    }

    shared.fail_all_pending();
}

fn dispatch(
    message: Value,
    shared: &Shared,
    greeting_tx: &mut Option<oneshot::Sender<QmpGreeting>>,
) {
    if let Some(banner) = message.get("QMP") {
        match greeting_tx.take() {
            Some(tx) => {
                let greeting = serde_json::from_value(banner.clone()).unwrap_or_default();
                let _ = tx.send(greeting);
            }
            None => tracing::debug!("ignoring repeated QMP greeting"),
        }
        return;
    }

    if let Some(event) = message.get("event").and_then(Value::as_str) {
        QMP_EVENTS.with_label_values(&[event]).inc();
        let event = QmpEvent {
            event: event.to_string(),
            data: message.get("data").cloned().unwrap_or(Value::Null),
            timestamp: message.get("timestamp").cloned().unwrap_or(Value::Null),
        };
        tracing::debug!(event = %event.event, "QMP event");
        // No subscribers is fine
        let _ = shared.events.send(event);
        return;
    }

    let id = match message.get("id").and_then(Value::as_u64) {
        Some(id) => id,
        None => {
            tracing::warn!(message = %message, "QMP reply without a usable id");
            return;
        }
    };

    let outcome = if let Some(result) = message.get("return") {
        Ok(result.clone())
    } else if let Some(error) = message.get("error") {
        let class = error
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError");
        let desc = error
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        Err(Error::Protocol(format!("{}: {}", class, desc)))
    } else {
        tracing::warn!(message = %message, "unrecognized QMP message");
        return;
    };

    match shared.take_pending(id) {
        Some(slot) => {
            let _ = slot.send(outcome);
        }
        None => tracing::debug!(id, "QMP reply for unknown or expired command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let line = serde_json::to_string(&QmpRequest {
            execute: "query-status",
            arguments: None,
            id: 7,
        })
        .unwrap();
        assert_eq!(line, r#"{"execute":"query-status","id":7}"#);

        let line = serde_json::to_string(&QmpRequest {
            execute: "eject",
            arguments: Some(json!({"device": "ide1-cd0"})),
            id: 8,
        })
        .unwrap();
        assert!(line.contains(r#""arguments":{"device":"ide1-cd0"}"#));
    }

    fn shared() -> Shared {
        let (events, _) = broadcast::channel(8);
        Shared {
            state: StdMutex::new(ChannelState::Ready),
            pending: StdMutex::new(HashMap::new()),
            events,
        }
    }

    #[tokio::test]
    async fn test_dispatch_resolves_and_rejects_by_id() {
        let shared = shared();
        let (ok_tx, ok_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(1, ok_tx);
        shared.pending.lock().unwrap().insert(2, err_tx);

        let mut greeting = None;
        dispatch(
            json!({"error": {"class": "CommandNotFound", "desc": "nope"}, "id": 2}),
            &shared,
            &mut greeting,
        );
        dispatch(json!({"return": {"status": "running"}, "id": 1}), &shared, &mut greeting);

        assert_eq!(ok_rx.await.unwrap().unwrap()["status"], "running");
        let err = err_rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("CommandNotFound: nope"));
        assert!(shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_broadcasts_events() {
        let shared = shared();
        let mut rx = shared.events.subscribe();
        let mut greeting = None;
        dispatch(
            json!({"event": "STOP", "data": {}, "timestamp": {"seconds": 1, "microseconds": 2}}),
            &shared,
            &mut greeting,
        );
        assert_eq!(rx.recv().await.unwrap().event, "STOP");
    }

    #[tokio::test]
    async fn test_fail_all_pending() {
        let shared = shared();
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().unwrap().insert(3, tx);
        shared.fail_all_pending();
        assert!(matches!(rx.await.unwrap(), Err(Error::Disconnected)));
        assert_eq!(shared.state(), ChannelState::Disconnected);
    }
}
