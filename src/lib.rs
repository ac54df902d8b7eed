// Copyright (c) Microsoft Corporation. All rights reserved.

//! # Agent SDK for Rust
//!
//! A Rust client library for driving a coding-agent CLI running in
//! app-server mode, over line-delimited JSON-RPC on the child process's
//! standard streams.
//!
//! The SDK multiplexes three kinds of traffic over one connection:
//! requests issued by this process (correlated to their responses by id),
//! server-initiated requests that registered handlers must answer (command
//! and file-change approvals, user input), and one-way notifications and
//! typed events streamed to subscribers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_sdk::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AgentError> {
//!     let client = AgentClient::new(AgentClientOptions::default());
//!
//!     client
//!         .initialize(
//!             ClientInfo {
//!                 name: "my-app".to_string(),
//!                 title: None,
//!                 version: Some(env!("CARGO_PKG_VERSION").to_string()),
//!             },
//!             ClientCapabilities::default(),
//!         )
//!         .await?;
//!
//!     // Stream the agent's output as it is produced.
//!     let _deltas = client.on_notification("item/agentMessage/delta", |params| {
//!         if let Ok(delta) = serde_json::from_value::<AgentMessageDelta>(params) {
//!             print!("{}", delta.delta);
//!         }
//!     });
//!
//!     let thread = client.start_thread(ThreadStartOptions::default()).await?;
//!     thread
//!         .send_message(TurnOptions {
//!             prompt: "What does this repository do?".to_string(),
//!             output_schema: None,
//!             instructions: None,
//!         })
//!         .await?;
//!
//!     client.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod jsonrpc;
pub mod thread;
pub mod types;

// Re-export main types at crate root for convenience
pub use client::{shared, AgentClient, AgentClientOptions, SERVER_MODE_ARG};
pub use jsonrpc::{ErrorEvent, RequestHandler, Subscription};
pub use thread::ThreadHandle;
pub use types::*;

/// Error types for the Agent SDK.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Error response from the agent, correlated to a request we issued.
    #[error("agent error {code}: {message}")]
    JsonRpc {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The connection is closed; the envelope was never written.
    #[error("connection closed")]
    ConnectionClosed,

    /// The session terminated while the request was pending. Carries the
    /// agent's exit status when it is known.
    #[error("session terminated: {0}")]
    Terminated(String),

    /// Request timed out.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Protocol error (malformed messages, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The session has not been initialized.
    #[error("session not initialized. Call initialize() first.")]
    NotInitialized,

    /// The session is already initialized; dispose it before initializing
    /// again.
    #[error("session already initialized")]
    AlreadyInitialized,

    /// Failed to spawn the agent process.
    #[error("process spawn error: {0}")]
    ProcessSpawn(String),
}
