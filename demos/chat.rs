// Copyright (c) Microsoft Corporation. All rights reserved.

//! Terminal chat against a coding agent running in app-server mode.
//!
//! This example shows how to:
//! - Create an AgentClient and initialize the session
//! - Register the approval and user-input handlers the agent depends on
//! - Subscribe to streaming notifications and typed events
//! - Forward terminal input as turns
//!
//! Run with `cargo run --example chat`. The agent command defaults to
//! `codex`; set `AGENT_CMD` to point at a different CLI.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use agent_sdk::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

/// How long a `user/requestInput` interaction may wait for a human answer
/// before it is failed.
const USER_INPUT_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AgentError> {
    let client = AgentClient::new(AgentClientOptions {
        command: std::env::var("AGENT_CMD").unwrap_or_else(|_| "codex".to_string()),
        ..Default::default()
    });

    // One reader owns the terminal; everything that needs a line of input
    // pulls from this channel.
    let (line_tx, line_rx) = mpsc::channel::<String>(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });
    let line_rx = Arc::new(Mutex::new(line_rx));

    // ========================================================================
    // 1. Server-request handlers
    //
    // These must be registered before the first turn starts; the agent
    // stalls on a method-not-found reply otherwise.
    // ========================================================================

    client.on_server_request(
        "command/requestApproval",
        Arc::new(|params| {
            Box::pin(async move {
                let request: CommandApprovalRequest = serde_json::from_value(params)
                    .map_err(|e| AgentError::Serialization(e.to_string()))?;
                println!("\n[approving command] {}", request.command);
                serde_json::to_value(ApprovalResponse {
                    decision: ApprovalDecision::Approved,
                })
                .map_err(|e| AgentError::Serialization(e.to_string()))
            })
        }),
    );

    client.on_server_request(
        "fileChange/requestApproval",
        Arc::new(|params| {
            Box::pin(async move {
                let request: FileChangeApprovalRequest = serde_json::from_value(params)
                    .map_err(|e| AgentError::Serialization(e.to_string()))?;
                println!("\n[approving changes to {} file(s)]", request.changes.len());
                for change in &request.changes {
                    println!("  {}", change.path);
                }
                serde_json::to_value(ApprovalResponse {
                    decision: ApprovalDecision::Approved,
                })
                .map_err(|e| AgentError::Serialization(e.to_string()))
            })
        }),
    );

    let input_lines = Arc::clone(&line_rx);
    client.on_server_request(
        "user/requestInput",
        Arc::new(move |params| {
            let input_lines = Arc::clone(&input_lines);
            Box::pin(async move {
                let request: UserInputRequest = serde_json::from_value(params)
                    .map_err(|e| AgentError::Serialization(e.to_string()))?;
                println!("\n[agent asks] {}", request.question);
                if let Some(choices) = &request.choices {
                    for choice in choices {
                        println!("  - {choice}");
                    }
                }
                print!("answer> ");
                let _ = std::io::stdout().flush();

                let answer = tokio::time::timeout(USER_INPUT_TIMEOUT, async {
                    input_lines.lock().await.recv().await
                })
                .await
                .map_err(|_| AgentError::Timeout(USER_INPUT_TIMEOUT.as_millis() as u64))?
                .ok_or(AgentError::ConnectionClosed)?;

                serde_json::to_value(UserInputResponse {
                    answer,
                    was_freeform: true,
                })
                .map_err(|e| AgentError::Serialization(e.to_string()))
            })
        }),
    );

    // ========================================================================
    // 2. Subscriptions
    // ========================================================================

    let _deltas = client.on_notification("item/agentMessage/delta", |params| {
        if let Ok(delta) = serde_json::from_value::<AgentMessageDelta>(params) {
            print!("{}", delta.delta);
            let _ = std::io::stdout().flush();
        }
    });

    let _items = client.on_event("item.completed", |event| {
        if let Some(item) = event.item() {
            if item.get("kind").and_then(|v| v.as_str()) == Some("commandExecution") {
                println!(
                    "\n[ran] {}",
                    item.get("command").and_then(|v| v.as_str()).unwrap_or("?")
                );
            }
        }
    });

    let _errors = client.on_error(|event| match event {
        ErrorEvent::MalformedLine { error, .. } => {
            eprintln!("\n[dropped malformed line: {error}]");
        }
        ErrorEvent::UnknownResponse { id } => {
            eprintln!("\n[unmatched response for id {id}]");
        }
        ErrorEvent::TransportClosed { reason } => {
            eprintln!("\n[session closed: {reason}]");
        }
    });

    let (done_tx, mut done_rx) = mpsc::channel::<()>(4);
    let _turns = client.on_notification("turn/completed", move |_params| {
        let _ = done_tx.try_send(());
    });

    // ========================================================================
    // 3. Session
    // ========================================================================

    client
        .initialize(
            ClientInfo {
                name: "agent-sdk-chat".to_string(),
                title: Some("Agent SDK chat demo".to_string()),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
            ClientCapabilities::default(),
        )
        .await?;

    let thread = client.start_thread(ThreadStartOptions::default()).await?;
    println!("connected; thread {}", thread.id());
    println!("type a message, or /quit to exit");

    loop {
        print!("\nyou> ");
        let _ = std::io::stdout().flush();

        let line = { line_rx.lock().await.recv().await };
        let Some(line) = line else {
            break; // stdin closed
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "/quit" {
            break;
        }

        thread
            .send_message(TurnOptions {
                prompt: prompt.to_string(),
                output_schema: None,
                instructions: None,
            })
            .await?;

        // Wait for the turn to finish before prompting again.
        if done_rx.recv().await.is_none() {
            break;
        }
        println!();
    }

    client.dispose().await;
    Ok(())
}
