//! Integration tests for the QMP client against an in-process fake server

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio_stream::StreamExt;

use qemuvisor::config::QmpConfig;
use qemuvisor::monitor::{ChannelState, Endpoint, QmpClient};
use qemuvisor::Error;

const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 2, "minor": 2, "major": 8}, "package": ""}, "capabilities": ["oob"]}}"#;

fn config() -> QmpConfig {
    QmpConfig {
        connect_timeout_ms: 1_000,
        command_timeout_ms: 1_000,
        event_capacity: 16,
    }
}

/// Accept connections; greet unless `greet` is false, then answer by `execute`
fn spawn_qmp_server(path: &Path, greet: bool) {
    let listener = UnixListener::bind(path).unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            tokio::spawn(async move {
                if !greet {
                    return;
                }
                let (read, mut write) = stream.into_split();
                write
                    .write_all(format!("{}\r\n", GREETING).as_bytes())
                    .await
                    .unwrap();

                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let request: Value = serde_json::from_str(&line).unwrap();
                    let id = request["id"].clone();
                    let replies = match request["execute"].as_str().unwrap_or_default() {
                        "qmp_capabilities" => vec![json!({ "return": {}, "id": id })],
                        "query-status" => vec![json!({
                            "return": { "status": "running", "running": true, "singlestep": false },
                            "id": id,
                        })],
                        "stop" => vec![
                            json!({
                                "event": "STOP",
                                "data": {},
                                "timestamp": { "seconds": 1_700_000_000, "microseconds": 42 },
                            }),
                            json!({ "return": {}, "id": id }),
                        ],
                        "hang-up" => return,
                        "sleep" => continue,
                        other => vec![json!({
                            "error": {
                                "class": "CommandNotFound",
                                "desc": format!("The command {} has not been found", other),
                            },
                            "id": id,
                        })],
                    };
                    for reply in replies {
                        let mut text = reply.to_string();
                        text.push_str("\r\n");
                        if write.write_all(text.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
}

#[tokio::test]
async fn test_connect_reads_greeting() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    assert_eq!(client.state(), ChannelState::Ready);
    assert_eq!(client.greeting().version["qemu"]["major"], 8);
    assert_eq!(client.greeting().capabilities, vec![json!("oob")]);
}

#[tokio::test]
async fn test_negotiate_then_query_status() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect_negotiated(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    let status = client.query_status().await.unwrap();
    assert_eq!(status.status, "running");
    assert!(status.running);
}

#[tokio::test]
async fn test_error_reply_carries_class_and_description() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    match client.send("frobnicate", None).await {
        Err(Error::Protocol(message)) => {
            assert!(message.contains("CommandNotFound"));
            assert!(message.contains("frobnicate"));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    // The channel stays usable after an error reply
    assert!(client.query_status().await.is_ok());
}

#[tokio::test]
async fn test_events_reach_subscribers_not_commands() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    let mut receiver = client.subscribe();
    let stream = client.events();
    tokio::pin!(stream);

    client.stop().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event, "STOP");
    assert_eq!(event.timestamp["microseconds"], 42);

    let streamed = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(streamed.event, "STOP");
}

#[tokio::test]
async fn test_close_before_greeting_is_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, false);

    let result = QmpClient::connect(&Endpoint::unix(&socket), &config()).await;
    assert!(matches!(result, Err(Error::Disconnected)));
}

#[tokio::test]
async fn test_peer_hang_up_fails_pending_command() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    let result = client.send("hang-up", None).await;
    assert!(matches!(result, Err(Error::Disconnected)));
    assert_eq!(client.state(), ChannelState::Disconnected);

    let after = client.send("query-status", None).await;
    assert!(matches!(after, Err(Error::NotConnected)));
}

#[tokio::test]
async fn test_unanswered_command_times_out_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let mut settings = config();
    settings.command_timeout_ms = 200;
    let client = QmpClient::connect(&Endpoint::unix(&socket), &settings)
        .await
        .unwrap();

    let err = client.send("sleep", None).await.unwrap_err();
    assert_eq!(err.kind(), qemuvisor::ErrorKind::Timeout);
    assert_eq!(client.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_send_after_close_is_not_connected() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("qmp.sock");
    spawn_qmp_server(&socket, true);

    let client = QmpClient::connect(&Endpoint::unix(&socket), &config())
        .await
        .unwrap();
    client.close().await;
    assert_eq!(client.state(), ChannelState::Disconnected);
    assert!(matches!(
        client.send("query-status", None).await,
        Err(Error::NotConnected)
    ));
}
