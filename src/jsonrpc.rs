// Copyright (c) Microsoft Corporation. All rights reserved.

//! Line-delimited JSON-RPC core for the agent app-server connection.
//!
//! One JSON document per line in both directions. The protocol is JSON-RPC
//! 2.0 flavored, but the `"jsonrpc"` field is not load-bearing for parsing,
//! and the agent also emits unsolicited typed event payloads (documents with
//! a top-level `"type"` tag and no `"method"`) alongside standard
//! notifications.
//!
//! Incoming lines are classified in order:
//! 1. id + result/error       -> response to one of our requests
//! 2. id + method             -> server request; we must reply
//! 3. method, no id           -> notification
//! 4. top-level `"type"` tag  -> typed event
//! 5. anything else           -> ignored (forward compatibility)
//!
//! A notification whose `params` carries its own `"type"` tag is dispatched
//! both ways: once to notification listeners for the method, once to event
//! listeners for the tag.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::types::AgentEvent;
use crate::AgentError;

/// Error code for a server request naming a method with no registered handler.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Error code for a server request whose handler failed.
pub const INTERNAL_ERROR: i32 = -32603;

/// Locks a registry mutex, recovering the guard if a listener panicked while
/// holding it. Dispatch must survive a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// JSON-RPC Message Types
// ============================================================================

/// A request envelope issued by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC Error {}: {}", self.code, self.message)
    }
}

/// Type alias for an async server-request handler.
/// Takes params and returns the result value to send back.
pub type RequestHandler = Arc<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, AgentError>> + Send>>
        + Send
        + Sync,
>;

/// A notification listener; receives the notification's `params`.
pub type NotificationListener = Arc<dyn Fn(Value) + Send + Sync>;

/// An event listener; receives the decoded typed payload.
pub type EventListener = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// An error-event listener.
pub type ErrorListener = Arc<dyn Fn(&ErrorEvent) + Send + Sync>;

/// Out-of-band faults reported to [`Registry::on_error`] subscribers.
///
/// None of these is fatal to the session except [`ErrorEvent::TransportClosed`],
/// which is emitted exactly once when the connection terminates.
#[derive(Debug, Clone)]
pub enum ErrorEvent {
    /// A line arrived that was not valid JSON. Subsequent lines are
    /// unaffected.
    MalformedLine { line: String, error: String },
    /// A response arrived for an id that is not pending: never issued,
    /// already completed, or not an integer.
    UnknownResponse { id: Value },
    /// The transport terminated; every pending request has been failed.
    TransportClosed { reason: String },
}

// ============================================================================
// Subscription
// ============================================================================

/// An RAII guard for a notification/event/error listener registration.
///
/// The listener is removed when the guard is dropped or when
/// [`Subscription::unsubscribe`] is called, whichever happens first.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Explicitly removes the listener.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Callback registry for server requests, notifications, events, and error
/// events.
///
/// The registry is created by the session facade and shared with the
/// connection, so handlers can be registered before the agent process is
/// spawned. Server-request handlers are single-slot per method name
/// (registering again replaces the previous handler); listeners are additive
/// and individually removable.
#[derive(Default)]
pub struct Registry {
    request_handlers: Mutex<HashMap<String, RequestHandler>>,
    // The listener maps are individually shared with the unsubscribe
    // closures handed out in Subscription guards.
    notification_listeners: Arc<Mutex<HashMap<String, Vec<(u64, NotificationListener)>>>>,
    event_listeners: Arc<Mutex<HashMap<String, Vec<(u64, EventListener)>>>>,
    error_listeners: Arc<Mutex<Vec<(u64, ErrorListener)>>>,
    next_listener_id: AtomicU64,
}

impl Registry {
    /// Registers the handler for a server-initiated request method,
    /// replacing any previous handler for that method.
    pub fn set_request_handler(&self, method: &str, handler: RequestHandler) {
        lock(&self.request_handlers).insert(method.to_string(), handler);
    }

    pub(crate) fn request_handler(&self, method: &str) -> Option<RequestHandler> {
        lock(&self.request_handlers).get(method).cloned()
    }

    /// Subscribes a listener to notifications with the exact method name.
    pub fn on_notification<F>(&self, method: &str, listener: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.notification_listeners)
            .entry(method.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        let listeners = Arc::clone(&self.notification_listeners);
        let method = method.to_string();
        Subscription::new(move || {
            if let Some(list) = lock(&listeners).get_mut(&method) {
                list.retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Subscribes a listener to typed events with the given discriminator.
    pub fn on_event<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.event_listeners)
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        let listeners = Arc::clone(&self.event_listeners);
        let event_type = event_type.to_string();
        Subscription::new(move || {
            if let Some(list) = lock(&listeners).get_mut(&event_type) {
                list.retain(|(listener_id, _)| *listener_id != id);
            }
        })
    }

    /// Subscribes a listener to out-of-band error events.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.error_listeners).push((id, Arc::new(listener)));

        let listeners = Arc::clone(&self.error_listeners);
        Subscription::new(move || {
            lock(&listeners).retain(|(listener_id, _)| *listener_id != id);
        })
    }

    /// Removes every handler and listener.
    pub fn clear(&self) {
        lock(&self.request_handlers).clear();
        lock(&self.notification_listeners).clear();
        lock(&self.event_listeners).clear();
        lock(&self.error_listeners).clear();
    }

    // Dispatch snapshots the listener list before invoking anything, so a
    // listener that unsubscribes itself (or anyone else) mid-dispatch cannot
    // corrupt the iteration.

    pub(crate) fn notify(&self, method: &str, params: &Value) {
        let listeners: Vec<NotificationListener> = lock(&self.notification_listeners)
            .get(method)
            .map(|list| list.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(params.clone());
        }
    }

    pub(crate) fn emit_event(&self, event: &AgentEvent) {
        let listeners: Vec<EventListener> = lock(&self.event_listeners)
            .get(&event.event_type)
            .map(|list| list.iter().map(|(_, listener)| Arc::clone(listener)).collect())
            .unwrap_or_default();
        for listener in listeners {
            listener(event);
        }
    }

    pub(crate) fn emit_error(&self, event: &ErrorEvent) {
        let listeners: Vec<ErrorListener> = lock(&self.error_listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

// ============================================================================
// Internal message for the write channel
// ============================================================================

enum WriteCommand {
    Line(String),
    Shutdown,
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, AgentError>>>;

// ============================================================================
// JSON-RPC Connection
// ============================================================================

/// A bidirectional JSON-RPC connection over a pair of byte streams,
/// newline-delimited, one JSON document per line.
///
/// This supports:
/// - Sending requests and awaiting their correlated responses
/// - Answering server-initiated requests through registered handlers
/// - Broadcasting notifications and typed events to subscribers
pub struct JsonRpcClient {
    /// Correlation ids are allocated from here; strictly increasing from 1.
    next_id: AtomicU64,
    /// Pending request completions, keyed by correlation id.
    pending: Arc<Mutex<PendingMap>>,
    /// Shared handler/listener registry.
    registry: Arc<Registry>,
    /// Channel to the writer task.
    write_tx: mpsc::Sender<WriteCommand>,
    /// Set once, by whichever side observes termination first.
    closed: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl JsonRpcClient {
    /// Creates a connection from async reader and writer streams, spawning
    /// the reader and writer tasks.
    ///
    /// # Arguments
    /// * `reader` - the agent's output stream (e.g. child stdout)
    /// * `writer` - the agent's input stream (e.g. child stdin)
    /// * `registry` - the shared handler/listener registry
    pub fn new<R, W>(reader: R, writer: W, registry: Arc<Registry>) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let (write_tx, write_rx) = mpsc::channel::<WriteCommand>(256);

        let writer_task = tokio::spawn(Self::writer_loop(writer, write_rx));
        let reader_task = tokio::spawn(Self::reader_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&registry),
            write_tx.clone(),
            Arc::clone(&closed),
        ));

        Self {
            next_id: AtomicU64::new(1),
            pending,
            registry,
            write_tx,
            closed,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        }
    }

    /// Returns the shared registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sends a request and waits for the correlated response.
    ///
    /// With a `timeout` of `None` the caller waits until the response
    /// arrives or the connection terminates; a timeout removes the pending
    /// entry, so a late response is reported as an anomaly rather than
    /// delivered.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, AgentError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AgentError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&envelope)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // Termination may have drained the ledger between the check above
        // and the insert; clean up our own entry in that case.
        if self.closed.load(Ordering::SeqCst) {
            lock(&self.pending).remove(&id);
            return Err(AgentError::ConnectionClosed);
        }

        if self.write_tx.send(WriteCommand::Line(line)).await.is_err() {
            lock(&self.pending).remove(&id);
            return Err(AgentError::ConnectionClosed);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    lock(&self.pending).remove(&id);
                    return Err(AgentError::Timeout(limit.as_millis() as u64));
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(result) => result,
            // Sender dropped without a verdict: the connection was torn down.
            Err(_) => Err(AgentError::ConnectionClosed),
        }
    }

    /// Fails every pending request with a termination error and marks the
    /// connection closed. The first caller wins; later calls are no-ops.
    pub fn close(&self, reason: &str) {
        Self::terminate(&self.pending, &self.registry, &self.closed, reason);
    }

    /// Closes the connection and stops the reader and writer tasks.
    pub async fn shutdown(&self, reason: &str) {
        self.close(reason);
        let _ = self.write_tx.send(WriteCommand::Shutdown).await;

        let writer = lock(&self.writer_task).take();
        if let Some(handle) = writer {
            let _ = handle.await;
        }
        let reader = lock(&self.reader_task).take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }
    }

    fn terminate(
        pending: &Mutex<PendingMap>,
        registry: &Registry,
        closed: &AtomicBool,
        reason: &str,
    ) {
        if closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let waiters: Vec<_> = lock(pending).drain().map(|(_, tx)| tx).collect();
        for tx in waiters {
            let _ = tx.send(Err(AgentError::Terminated(reason.to_string())));
        }
        registry.emit_error(&ErrorEvent::TransportClosed {
            reason: reason.to_string(),
        });
    }

    // ========================================================================
    // Internal: Writer loop
    // ========================================================================

    async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(
        mut writer: W,
        mut rx: mpsc::Receiver<WriteCommand>,
    ) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCommand::Line(line) => {
                    if writer.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    if writer.write_all(b"\n").await.is_err() {
                        break;
                    }
                    if writer.flush().await.is_err() {
                        break;
                    }
                }
                WriteCommand::Shutdown => break,
            }
        }
    }

    // ========================================================================
    // Internal: Reader loop
    // ========================================================================

    async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(
        reader: R,
        pending: Arc<Mutex<PendingMap>>,
        registry: Arc<Registry>,
        write_tx: mpsc::Sender<WriteCommand>,
        closed: Arc<AtomicBool>,
    ) {
        let mut reader = BufReader::new(reader);
        let mut buf = String::new();
        let reason = loop {
            buf.clear();
            match reader.read_line(&mut buf).await {
                Ok(0) => break "transport closed".to_string(),
                Ok(_) => {}
                Err(err) => break format!("transport read failed: {err}"),
            }

            let line = buf.trim();
            if line.is_empty() {
                continue;
            }

            let value: Value = match serde_json::from_str(line) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!("discarding malformed line from agent: {err}");
                    registry.emit_error(&ErrorEvent::MalformedLine {
                        line: line.to_string(),
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            Self::dispatch(value, &pending, &registry, &write_tx).await;
        };

        Self::terminate(&pending, &registry, &closed, &reason);
    }

    /// Classifies one decoded document and dispatches it.
    async fn dispatch(
        value: Value,
        pending: &Mutex<PendingMap>,
        registry: &Arc<Registry>,
        write_tx: &mpsc::Sender<WriteCommand>,
    ) {
        let Some(obj) = value.as_object() else {
            // Scalars and arrays carry nothing routable.
            return;
        };

        let id = obj.get("id").filter(|v| !v.is_null()).cloned();
        let method = obj.get("method").and_then(Value::as_str).map(str::to_string);
        let params = obj.get("params").cloned();
        let result = obj.get("result").cloned();
        let error = obj.get("error").cloned();
        let has_type_tag = obj.contains_key("type");

        if let Some(id) = id {
            if result.is_some() || error.is_some() {
                Self::complete_request(id, result, error, pending, registry);
                return;
            }
            if let Some(method) = method {
                let params = params.unwrap_or_else(|| Value::Object(Default::default()));
                Self::handle_server_request(id, method, params, registry, write_tx).await;
                return;
            }
            // An id with neither outcome nor method: fall through, the
            // document may still carry a typed event payload.
        } else if let Some(method) = method {
            let params = params.unwrap_or(Value::Null);
            registry.notify(&method, &params);
            // Dual dispatch: an event payload nested in notification params
            // is also delivered on the event channel.
            if params.get("type").is_some() {
                match serde_json::from_value::<AgentEvent>(params) {
                    Ok(event) => registry.emit_event(&event),
                    Err(err) => {
                        tracing::debug!("nested event payload did not decode: {err}");
                    }
                }
            }
            return;
        }

        if has_type_tag {
            match serde_json::from_value::<AgentEvent>(value) {
                Ok(event) => registry.emit_event(&event),
                Err(err) => tracing::debug!("typed payload did not decode: {err}"),
            }
            return;
        }
        // No recognizable shape: ignored, forward-compatible fields may appear.
    }

    fn complete_request(
        id: Value,
        result: Option<Value>,
        error: Option<Value>,
        pending: &Mutex<PendingMap>,
        registry: &Registry,
    ) {
        let Some(key) = id.as_u64() else {
            tracing::warn!("response with an id we could not have issued: {id}");
            registry.emit_error(&ErrorEvent::UnknownResponse { id });
            return;
        };

        // The entry is removed before the waiter runs, so a duplicate
        // response cannot resolve the same request twice.
        let Some(tx) = lock(pending).remove(&key) else {
            tracing::warn!(id = key, "response for a request that is not pending");
            registry.emit_error(&ErrorEvent::UnknownResponse { id });
            return;
        };

        let outcome = match error {
            Some(error) => match serde_json::from_value::<JsonRpcError>(error) {
                Ok(error) => Err(AgentError::JsonRpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
                Err(err) => Err(AgentError::Protocol(format!(
                    "malformed error object in response: {err}"
                ))),
            },
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }

    async fn handle_server_request(
        id: Value,
        method: String,
        params: Value,
        registry: &Arc<Registry>,
        write_tx: &mpsc::Sender<WriteCommand>,
    ) {
        match registry.request_handler(&method) {
            Some(handler) => {
                // Handlers run in their own task so one that suspends (e.g.
                // awaiting a human answer) never blocks dispatch; replies go
                // out in completion order.
                let write_tx = write_tx.clone();
                tokio::spawn(async move {
                    let outcome = handler(params).await.map_err(|err| JsonRpcError {
                        code: INTERNAL_ERROR,
                        message: err.to_string(),
                        data: None,
                    });
                    Self::write_response(&write_tx, id, outcome).await;
                });
            }
            None => {
                tracing::warn!(%method, "server request for unregistered method");
                let error = JsonRpcError {
                    code: METHOD_NOT_FOUND,
                    message: format!("method not found: {method}"),
                    data: None,
                };
                Self::write_response(write_tx, id, Err(error)).await;
            }
        }
    }

    /// Writes a response envelope echoing the server's request id verbatim
    /// (the remote allocates its own id space; we never reinterpret it).
    async fn write_response(
        write_tx: &mpsc::Sender<WriteCommand>,
        id: Value,
        outcome: Result<Value, JsonRpcError>,
    ) {
        let envelope = match outcome {
            Ok(result) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Err(error) => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        };
        match serde_json::to_string(&envelope) {
            Ok(line) => {
                let _ = write_tx.send(WriteCommand::Line(line)).await;
            }
            Err(err) => tracing::warn!("failed to serialize response envelope: {err}"),
        }
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.reader_task).take() {
            handle.abort();
        }
        // The writer exits once every clone of write_tx is gone.
    }
}
