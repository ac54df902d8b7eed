// Copyright (c) Microsoft Corporation. All rights reserved.

//! End-to-end session flow over an in-memory transport: initialize, start a
//! thread, run a turn during which the agent requests a command approval,
//! and stream the output back through subscriptions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_sdk::*;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

async fn send(write: &mut WriteHalf<DuplexStream>, value: Value) {
    write
        .write_all(format!("{value}\n").as_bytes())
        .await
        .expect("write to client");
}

/// A scripted agent: answers the session requests, and mid-turn asks for a
/// command approval before finishing with a delta, a nested event, and a
/// turn completion.
fn spawn_scripted_agent(stream: DuplexStream) {
    tokio::spawn(async move {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let msg: Value = serde_json::from_str(&line).expect("client sent invalid JSON");

            let Some(method) = msg.get("method").and_then(Value::as_str) else {
                // The client answering our approval request.
                assert_eq!(msg["id"], json!("agent-req-1"));
                assert_eq!(msg["result"]["decision"], json!("approved"));
                send(
                    &mut write,
                    json!({
                        "method": "item/agentMessage/delta",
                        "params": {"threadId": "t1", "delta": "done"}
                    }),
                )
                .await;
                send(
                    &mut write,
                    json!({
                        "method": "thread/event",
                        "params": {
                            "type": "item.completed",
                            "threadId": "t1",
                            "item": {"id": "i1", "kind": "agentMessage"}
                        }
                    }),
                )
                .await;
                send(
                    &mut write,
                    json!({
                        "method": "turn/completed",
                        "params": {"threadId": "t1", "turn": {"id": "turn-1", "status": "completed"}}
                    }),
                )
                .await;
                continue;
            };

            let id = msg["id"].clone();
            match method {
                "initialize" => {
                    send(
                        &mut write,
                        json!({"id": id, "result": {"userAgent": "scripted/1.0"}}),
                    )
                    .await;
                }
                "thread/start" => {
                    send(
                        &mut write,
                        json!({"id": id, "result": {"thread": {"id": "t1"}}}),
                    )
                    .await;
                }
                "turn/start" => {
                    assert_eq!(msg["params"]["threadId"], json!("t1"));
                    send(
                        &mut write,
                        json!({"id": id, "result": {"turn": {"id": "turn-1"}}}),
                    )
                    .await;
                    send(
                        &mut write,
                        json!({
                            "id": "agent-req-1",
                            "method": "command/requestApproval",
                            "params": {"threadId": "t1", "command": "cargo test"}
                        }),
                    )
                    .await;
                }
                other => {
                    send(
                        &mut write,
                        json!({
                            "id": id,
                            "error": {"code": -32601, "message": format!("method not found: {other}")}
                        }),
                    )
                    .await;
                }
            }
        }
    });
}

#[tokio::test]
async fn full_turn_with_mid_turn_approval() {
    let (local, remote) = duplex(64 * 1024);
    spawn_scripted_agent(remote);
    let (read, write) = tokio::io::split(local);
    let client = AgentClient::attached(read, write);

    // Handlers and subscriptions go in before the turn starts.
    let approved_commands: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    client.on_server_request("command/requestApproval", {
        let approved_commands = Arc::clone(&approved_commands);
        Arc::new(move |params| {
            let approved_commands = Arc::clone(&approved_commands);
            Box::pin(async move {
                let request: CommandApprovalRequest = serde_json::from_value(params)
                    .map_err(|e| AgentError::Serialization(e.to_string()))?;
                approved_commands.lock().unwrap().push(request.command);
                serde_json::to_value(ApprovalResponse {
                    decision: ApprovalDecision::Approved,
                })
                .map_err(|e| AgentError::Serialization(e.to_string()))
            })
        })
    });

    let transcript: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let _deltas = client.on_notification("item/agentMessage/delta", {
        let transcript = Arc::clone(&transcript);
        move |params| {
            if let Ok(delta) = serde_json::from_value::<AgentMessageDelta>(params) {
                transcript.lock().unwrap().push_str(&delta.delta);
            }
        }
    });

    let completed_items = Arc::new(AtomicUsize::new(0));
    let _items = client.on_event("item.completed", {
        let completed_items = Arc::clone(&completed_items);
        move |event| {
            assert_eq!(event.thread_id(), Some("t1"));
            completed_items.fetch_add(1, Ordering::SeqCst);
        }
    });

    let (done_tx, mut done_rx) = mpsc::channel::<TurnCompleted>(1);
    let _turns = client.on_notification("turn/completed", move |params| {
        if let Ok(completed) = serde_json::from_value::<TurnCompleted>(params) {
            let _ = done_tx.try_send(completed);
        }
    });

    client
        .initialize(
            ClientInfo {
                name: "session-flow-test".into(),
                title: None,
                version: None,
            },
            ClientCapabilities::default(),
        )
        .await
        .unwrap();

    let thread = client
        .start_thread(ThreadStartOptions::default())
        .await
        .unwrap();
    assert_eq!(thread.id(), "t1");

    let turn = thread
        .send_message(TurnOptions {
            prompt: "run the tests".into(),
            output_schema: None,
            instructions: None,
        })
        .await
        .unwrap();
    assert_eq!(turn.id, "turn-1");

    let completed = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .expect("turn should complete")
        .expect("turn/completed should be delivered");
    assert_eq!(completed.turn.status.as_deref(), Some("completed"));

    assert_eq!(*approved_commands.lock().unwrap(), vec!["cargo test"]);
    assert_eq!(transcript.lock().unwrap().as_str(), "done");
    assert_eq!(completed_items.load(Ordering::SeqCst), 1);

    client.dispose().await;
}
