// Copyright (c) Microsoft Corporation. All rights reserved.

//! AgentClient - the session facade of the SDK.
//!
//! An [`AgentClient`] owns one agent CLI subprocess running in app-server
//! mode and the JSON-RPC connection to it. It enforces the
//! initialize-before-use ordering, exposes typed convenience operations,
//! and forwards handler/listener registration to the shared registry.
//!
//! The client is an explicit, caller-owned object; construct one at
//! application start and hand out references. [`shared`] offers a
//! process-wide default instance as convenience sugar only.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::jsonrpc::{
    lock, ErrorEvent, JsonRpcClient, Registry, RequestHandler, Subscription,
};
use crate::thread::ThreadHandle;
use crate::types::*;
use crate::AgentError;

/// The fixed argument that puts the agent CLI into server mode.
pub const SERVER_MODE_ARG: &str = "app-server";

/// Options for creating an [`AgentClient`].
#[derive(Debug, Clone)]
pub struct AgentClientOptions {
    /// Agent CLI executable to spawn.
    pub command: String,
    /// Extra arguments, placed before the server-mode argument.
    pub args: Vec<String>,
    /// Working directory for the agent process.
    pub cwd: Option<String>,
    /// Environment variables for the agent process.
    pub env: Option<HashMap<String, String>>,
    /// Deadline applied to every request. `None` waits until the response
    /// arrives or the session terminates.
    pub request_timeout: Option<Duration>,
}

impl Default for AgentClientOptions {
    fn default() -> Self {
        Self {
            command: "codex".to_string(),
            args: Vec::new(),
            cwd: None,
            env: None,
            request_timeout: None,
        }
    }
}

/// Session facade over one agent subprocess.
///
/// # Examples
///
/// ```rust,no_run
/// # use agent_sdk::*;
/// # async fn example() -> Result<(), AgentError> {
/// let client = AgentClient::new(AgentClientOptions::default());
/// client
///     .initialize(
///         ClientInfo {
///             name: "my-app".into(),
///             title: None,
///             version: None,
///         },
///         ClientCapabilities::default(),
///     )
///     .await?;
///
/// let _deltas = client.on_notification("item/agentMessage/delta", |params| {
///     println!("{params}");
/// });
///
/// let thread = client.start_thread(ThreadStartOptions::default()).await?;
/// thread
///     .send_message(TurnOptions {
///         prompt: "Hello!".into(),
///         output_schema: None,
///         instructions: None,
///     })
///     .await?;
///
/// client.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct AgentClient {
    options: AgentClientOptions,
    registry: Arc<Registry>,
    rpc: tokio::sync::Mutex<Option<Arc<JsonRpcClient>>>,
    /// Tells the process watcher to kill the child on dispose.
    kill: Mutex<Option<oneshot::Sender<()>>>,
    initialized: AtomicBool,
    /// True when the transport was handed in instead of spawned; such a
    /// transport cannot be recreated after dispose.
    is_external_transport: bool,
}

impl AgentClient {
    /// Creates a client with the given options.
    ///
    /// The agent process is not spawned yet; that happens on
    /// [`AgentClient::initialize`]. Handlers and listeners may be
    /// registered before that.
    pub fn new(options: AgentClientOptions) -> Self {
        Self {
            options,
            registry: Arc::new(Registry::default()),
            rpc: tokio::sync::Mutex::new(None),
            kill: Mutex::new(None),
            initialized: AtomicBool::new(false),
            is_external_transport: false,
        }
    }

    /// Creates a client over a pre-connected transport instead of spawning
    /// a subprocess.
    pub fn attached<R, W>(reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::new(Registry::default());
        let rpc = Arc::new(JsonRpcClient::new(reader, writer, Arc::clone(&registry)));
        Self {
            options: AgentClientOptions::default(),
            registry,
            rpc: tokio::sync::Mutex::new(Some(rpc)),
            kill: Mutex::new(None),
            initialized: AtomicBool::new(false),
            is_external_transport: true,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the agent (unless a transport is already attached), issues the
    /// `initialize` request, and marks the session initialized.
    ///
    /// Fails with [`AgentError::AlreadyInitialized`] when called twice
    /// without an intervening [`AgentClient::dispose`].
    pub async fn initialize(
        &self,
        client_info: ClientInfo,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResponse, AgentError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Err(AgentError::AlreadyInitialized);
        }

        let rpc = self.ensure_transport().await?;
        let params = serde_json::json!({
            "clientInfo": client_info,
            "capabilities": capabilities,
        });
        let response = rpc
            .request("initialize", params, self.options.request_timeout)
            .await?;
        self.initialized.store(true, Ordering::SeqCst);
        serde_json::from_value(response).map_err(|e| AgentError::Serialization(e.to_string()))
    }

    /// Issues a raw request. Rejected with [`AgentError::NotInitialized`]
    /// until [`AgentClient::initialize`] has completed.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, AgentError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AgentError::NotInitialized);
        }
        let rpc = self.transport().await?;
        rpc.request(method, params, self.options.request_timeout).await
    }

    /// Tears the session down: kills the agent process, fails every pending
    /// request, clears all handler and listener registrations, and resets
    /// the initialized flag. Safe to call on an already-disposed session.
    pub async fn dispose(&self) {
        self.initialized.store(false, Ordering::SeqCst);

        // Kill the agent first so a writer blocked on a full pipe unwedges
        // before shutdown awaits it.
        if let Some(kill) = lock(&self.kill).take() {
            let _ = kill.send(());
        }
        let rpc = self.rpc.lock().await.take();
        if let Some(rpc) = rpc {
            rpc.shutdown("session disposed").await;
        }
        self.registry.clear();
    }

    // ========================================================================
    // Convenience operations
    // ========================================================================

    /// Starts a new conversation thread.
    pub async fn start_thread(
        &self,
        options: ThreadStartOptions,
    ) -> Result<ThreadHandle, AgentError> {
        let params = serde_json::to_value(&options)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        let response = self.request("thread/start", params).await?;
        let started: ThreadStartResponse = serde_json::from_value(response)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        self.thread(&started.thread.id).await
    }

    /// Resumes a conversation thread by its id.
    pub async fn resume_thread(
        &self,
        options: ThreadResumeOptions,
    ) -> Result<ThreadHandle, AgentError> {
        let params = serde_json::to_value(&options)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        let response = self.request("thread/resume", params).await?;
        let resumed: ThreadStartResponse = serde_json::from_value(response)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        self.thread(&resumed.thread.id).await
    }

    /// Returns a handle for an already-known thread id.
    pub async fn thread(&self, thread_id: &str) -> Result<ThreadHandle, AgentError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(AgentError::NotInitialized);
        }
        let rpc = self.transport().await?;
        Ok(ThreadHandle::new(
            thread_id.to_string(),
            rpc,
            self.options.request_timeout,
        ))
    }

    /// Starts a turn on the given thread. See [`ThreadHandle::send_message`].
    pub async fn send_message(
        &self,
        thread_id: &str,
        options: TurnOptions,
    ) -> Result<Turn, AgentError> {
        self.thread(thread_id).await?.send_message(options).await
    }

    /// Interrupts the active turn on the given thread.
    pub async fn interrupt_turn(
        &self,
        thread_id: &str,
        turn_id: Option<&str>,
    ) -> Result<(), AgentError> {
        self.thread(thread_id).await?.interrupt(turn_id).await
    }

    /// Lists the models the agent can run turns with.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, AgentError> {
        let response = self.request("model/list", serde_json::json!({})).await?;
        let listed: ListModelsResponse = serde_json::from_value(response)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        Ok(listed.models)
    }

    /// Authenticates the agent.
    pub async fn login(&self, options: LoginOptions) -> Result<LoginResponse, AgentError> {
        let params = serde_json::to_value(&options)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        let response = self.request("account/login", params).await?;
        serde_json::from_value(response).map_err(|e| AgentError::Serialization(e.to_string()))
    }

    // ========================================================================
    // Handler / listener registration
    // ========================================================================

    /// Registers the handler for a server-initiated request method,
    /// replacing any previous handler for that method.
    ///
    /// The upstream layer must register handlers for at least
    /// `command/requestApproval`, `fileChange/requestApproval`, and
    /// `user/requestInput` before starting a turn; the agent stalls on a
    /// method-not-found reply otherwise.
    pub fn on_server_request(&self, method: &str, handler: RequestHandler) {
        self.registry.set_request_handler(method, handler);
    }

    /// Subscribes to notifications with the exact method name.
    pub fn on_notification<F>(&self, method: &str, listener: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.registry.on_notification(method, listener)
    }

    /// Subscribes to typed events with the given discriminator.
    pub fn on_event<F>(&self, event_type: &str, listener: F) -> Subscription
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.registry.on_event(event_type, listener)
    }

    /// Subscribes to out-of-band error events.
    pub fn on_error<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ErrorEvent) + Send + Sync + 'static,
    {
        self.registry.on_error(listener)
    }

    // ========================================================================
    // Internal: transport
    // ========================================================================

    async fn transport(&self) -> Result<Arc<JsonRpcClient>, AgentError> {
        self.rpc
            .lock()
            .await
            .clone()
            .ok_or(AgentError::NotInitialized)
    }

    async fn ensure_transport(&self) -> Result<Arc<JsonRpcClient>, AgentError> {
        let mut rpc = self.rpc.lock().await;
        if let Some(existing) = rpc.as_ref() {
            return Ok(Arc::clone(existing));
        }
        if self.is_external_transport {
            // The attached transport was disposed; there is nothing to respawn.
            return Err(AgentError::ConnectionClosed);
        }
        let fresh = self.spawn_agent().await?;
        *rpc = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn spawn_agent(&self) -> Result<Arc<JsonRpcClient>, AgentError> {
        let mut cmd = Command::new(&self.options.command);
        cmd.args(&self.options.args)
            .arg(SERVER_MODE_ARG)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // stderr is the agent's own log stream; pass it through untouched.
            .stderr(Stdio::inherit());

        if let Some(ref cwd) = self.options.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = self.options.env {
            cmd.envs(env.iter());
        }

        let mut child = cmd.spawn().map_err(|e| {
            AgentError::ProcessSpawn(format!(
                "failed to spawn {} {}: {e}",
                self.options.command, SERVER_MODE_ARG
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::ProcessSpawn("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::ProcessSpawn("failed to capture stdout".to_string()))?;

        let rpc = Arc::new(JsonRpcClient::new(stdout, stdin, Arc::clone(&self.registry)));

        // The watcher owns the child: it reaps the process when it exits on
        // its own (failing pending requests with the exit status) and kills
        // it when dispose fires the kill channel.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        *lock(&self.kill) = Some(kill_tx);
        let watcher_rpc = Arc::clone(&rpc);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("agent process exited ({status})"),
                        Err(err) => format!("agent process wait failed: {err}"),
                    };
                    tracing::debug!("{reason}");
                    watcher_rpc.close(&reason);
                    return;
                }
                _ = kill_rx => {}
            }
            // Dispose fired the kill channel (or dropped it): kill and reap.
            let _ = child.kill().await;
        });

        Ok(rpc)
    }
}

/// Returns the process-wide default client, created with default options on
/// first use. Convenience sugar; prefer constructing an [`AgentClient`] and
/// owning its lifetime.
pub fn shared() -> &'static AgentClient {
    static SHARED: OnceLock<AgentClient> = OnceLock::new();
    SHARED.get_or_init(|| AgentClient::new(AgentClientOptions::default()))
}
