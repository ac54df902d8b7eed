// Copyright (c) Microsoft Corporation. All rights reserved.

//! ThreadHandle - a lightweight handle to one conversation thread.
//!
//! Handles are created by [`AgentClient::start_thread`] and
//! [`AgentClient::resume_thread`] and forward thread-scoped operations to
//! the wire; they hold no state beyond the thread id. Notifications and
//! events are session-wide and carry the thread id in their payloads, so
//! subscriptions live on the client, not here.
//!
//! [`AgentClient::start_thread`]: crate::client::AgentClient::start_thread
//! [`AgentClient::resume_thread`]: crate::client::AgentClient::resume_thread

use std::sync::Arc;
use std::time::Duration;

use crate::jsonrpc::JsonRpcClient;
use crate::types::{Turn, TurnOptions, TurnStartResponse};
use crate::AgentError;

/// A handle to one conversation thread hosted by the agent.
pub struct ThreadHandle {
    id: String,
    rpc: Arc<JsonRpcClient>,
    request_timeout: Option<Duration>,
}

impl ThreadHandle {
    pub(crate) fn new(
        id: String,
        rpc: Arc<JsonRpcClient>,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            rpc,
            request_timeout,
        }
    }

    /// Returns the thread id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Starts a turn on this thread with the given prompt.
    ///
    /// The turn runs asynchronously; subscribe to notifications and events
    /// on the client to stream its output. Returns the turn descriptor.
    pub async fn send_message(&self, options: TurnOptions) -> Result<Turn, AgentError> {
        let mut params = serde_json::to_value(&options)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        params["threadId"] = serde_json::Value::String(self.id.clone());
        let response = self
            .rpc
            .request("turn/start", params, self.request_timeout)
            .await?;
        let started: TurnStartResponse = serde_json::from_value(response)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        Ok(started.turn)
    }

    /// Interrupts the active turn on this thread.
    ///
    /// This is itself a request/response pair, not a cancellation of any
    /// request issued through the SDK.
    pub async fn interrupt(&self, turn_id: Option<&str>) -> Result<(), AgentError> {
        let mut params = serde_json::json!({"threadId": self.id});
        if let Some(turn_id) = turn_id {
            params["turnId"] = serde_json::Value::String(turn_id.to_string());
        }
        self.rpc
            .request("turn/interrupt", params, self.request_timeout)
            .await?;
        Ok(())
    }
}
