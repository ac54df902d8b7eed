// Copyright (c) Microsoft Corporation. All rights reserved.

//! Type definitions for the agent app-server protocol.
//!
//! These are the typed request/response and notification payloads exchanged
//! with the agent CLI. Unknown fields are tolerated on deserialization; a
//! few types keep a flattened map where the agent is known to grow its
//! payloads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Initialize
// ============================================================================

/// Identifies this client to the agent during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Capabilities advertised during `initialize`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

// ============================================================================
// Threads and Turns
// ============================================================================

/// A conversation thread hosted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Options for `thread/start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Options for `thread/resume`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadResumeOptions {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Result of `thread/start` and `thread/resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadStartResponse {
    pub thread: Thread,
}

/// A single turn within a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Options for `turn/start`.
///
/// `output_schema` is a JSON-schema object constraining the agent's final
/// message for this turn; `instructions` is free text prepended to the
/// turn's context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOptions {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Result of `turn/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartResponse {
    pub turn: Turn,
}

// ============================================================================
// Models / Login
// ============================================================================

/// An available model advertised by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Result of `model/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub models: Vec<ModelInfo>,
}

/// Options for `account/login`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

/// Result of `account/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
}

// ============================================================================
// Server Requests
// ============================================================================

/// Payload of a `command/requestApproval` server request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandApprovalRequest {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One file touched by a proposed change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Payload of a `fileChange/requestApproval` server request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChangeApprovalRequest {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    pub changes: Vec<FileChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Verdict on an approval request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Approved,
    ApprovedForSession,
    Denied,
    Abort,
}

/// Reply payload for both approval request methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
}

/// Payload of a `user/requestInput` server request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_freeform: Option<bool>,
}

/// Reply payload for `user/requestInput`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInputResponse {
    pub answer: String,
    pub was_freeform: bool,
}

// ============================================================================
// Notifications
// ============================================================================

/// Params of an `item/agentMessage/delta` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageDelta {
    pub thread_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub delta: String,
}

/// Params of a `turn/completed` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompleted {
    pub thread_id: String,
    pub turn: Turn,
}

// ============================================================================
// Typed Events
// ============================================================================

/// A typed event payload, discriminated by its `"type"` tag.
///
/// Events arrive either as top-level documents outside the request/response/
/// notification envelope shapes, or nested inside a notification's `params`.
/// The remaining fields vary by event type and are kept as raw JSON; use the
/// accessors or deserialize `data` into a concrete shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub data: serde_json::Map<String, Value>,
}

impl AgentEvent {
    /// Looks up a raw field of the payload.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// The thread this event belongs to, when the payload carries one.
    pub fn thread_id(&self) -> Option<&str> {
        self.data.get("threadId").and_then(Value::as_str)
    }

    /// The item payload for `item.*` events.
    pub fn item(&self) -> Option<&Value> {
        self.data.get("item")
    }

    /// The error message for `error` events.
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_event_round_trips_its_discriminator_and_payload() {
        let event: AgentEvent = serde_json::from_value(json!({
            "type": "item.completed",
            "threadId": "t1",
            "item": {"id": "i1", "kind": "agentMessage"}
        }))
        .unwrap();

        assert_eq!(event.event_type, "item.completed");
        assert_eq!(event.thread_id(), Some("t1"));
        assert_eq!(event.item().unwrap()["id"], json!("i1"));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back["type"], json!("item.completed"));
        assert_eq!(back["threadId"], json!("t1"));
    }

    #[test]
    fn optional_fields_are_omitted_from_the_wire() {
        let options = ThreadStartOptions::default();
        assert_eq!(serde_json::to_value(&options).unwrap(), json!({}));

        let turn = TurnOptions {
            prompt: "hello".into(),
            output_schema: None,
            instructions: None,
        };
        assert_eq!(
            serde_json::to_value(&turn).unwrap(),
            json!({"prompt": "hello"})
        );
    }

    #[test]
    fn approval_decisions_use_camel_case_on_the_wire() {
        assert_eq!(
            serde_json::to_value(ApprovalDecision::ApprovedForSession).unwrap(),
            json!("approvedForSession")
        );
        assert_eq!(
            serde_json::from_value::<ApprovalDecision>(json!("denied")).unwrap(),
            ApprovalDecision::Denied
        );
    }
}
