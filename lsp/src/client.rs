//! Client handle: owns one server process and its connection lifecycle.
//!
//! The engine is cooperative: nothing runs until the host calls one of the
//! `process_*` steps (see `scheduler.rs`) or the read helpers (see
//! `reader.rs`). Every step takes `&mut self`, so dispatch and sends never
//! interleave.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;

use crate::codec::{self, FrameDecoder};
use crate::error::{LspError, Rejected};
use crate::outbox::{Outbox, OutgoingNotification, OutgoingRequest, SentCallback};
use crate::process::{ChildProcess, Process};
use crate::protocol::{self, Notification, Request, ResponseError};
use crate::router::Handlers;
use crate::types::{ClientConfig, ClientEvent, EventKind, Lifecycle, ServerConfig, StopReason};

/// How long `exit` waits for the server to answer `shutdown`.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// A connection to one language server.
///
/// Generic over the [`Process`] so hosts and tests can supply their own
/// transport; [`LspClient::start`] launches a real subprocess.
pub struct LspClient<P: Process = ChildProcess> {
    pub(crate) name: String,
    pub(crate) config: ClientConfig,
    pub(crate) process: Option<P>,
    pub(crate) decoder: FrameDecoder,
    pub(crate) outbox: Outbox,
    pub(crate) handlers: Handlers,
}

impl LspClient<ChildProcess> {
    /// Spawn the configured server. The connection stays in
    /// [`Lifecycle::Created`] until [`LspClient::initialize`] is called.
    pub fn start(server: &ServerConfig, config: ClientConfig) -> Result<Self, LspError> {
        let process = ChildProcess::start(server)?;
        tracing::info!(
            "Started LSP server '{}' ({})",
            server.name(),
            server.command()
        );
        Ok(Self::with_process(server.name(), process, config))
    }
}

impl<P: Process> LspClient<P> {
    pub fn with_process(name: impl Into<String>, process: P, config: ClientConfig) -> Self {
        let outbox = Outbox::new(config.hitrate);
        Self {
            name: name.into(),
            config,
            process: Some(process),
            decoder: FrameDecoder::new(),
            outbox,
            handlers: Handlers::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.outbox.lifecycle()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.outbox.is_initialized()
    }

    #[must_use]
    pub fn server_capabilities(&self) -> Option<&serde_json::Value> {
        self.outbox.server_capabilities()
    }

    /// Whether the subprocess is still alive.
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(|p| p.running())
    }

    // ── Producer surface ──────────────────────────────────────────────

    pub fn push_request(&mut self, request: OutgoingRequest) -> Result<u64, Rejected> {
        self.outbox.push_request(request)
    }

    pub fn push_notification(
        &mut self,
        notification: OutgoingNotification,
    ) -> Result<(), Rejected> {
        self.outbox.push_notification(notification)
    }

    pub fn push_response(
        &mut self,
        id: serde_json::Value,
        outcome: Result<serde_json::Value, ResponseError>,
    ) -> Result<(), Rejected> {
        self.outbox.push_response(id, outcome)
    }

    pub fn push_raw(
        &mut self,
        name: impl Into<String>,
        body: impl Into<Vec<u8>>,
        on_sent: Option<SentCallback>,
    ) -> Result<(), Rejected> {
        self.outbox.push_raw(name, body, on_sent)
    }

    // ── Callback registration ─────────────────────────────────────────

    /// Register the callback for a lifecycle event, replacing any previous
    /// one for the same kind.
    pub fn register_event(
        &mut self,
        kind: EventKind,
        listener: impl FnMut(&mut Outbox, &ClientEvent) + 'static,
    ) {
        self.handlers.set_event(kind, listener);
    }

    /// Register the handler for notifications of `method`.
    pub fn register_message_listener(
        &mut self,
        method: impl Into<String>,
        listener: impl FnMut(&mut Outbox, Option<serde_json::Value>) + 'static,
    ) {
        self.handlers.set_message(method.into(), listener);
    }

    /// Register the handler for server-initiated requests of `method`. The
    /// handler is responsible for answering via [`Outbox::push_response`].
    pub fn register_request_listener(
        &mut self,
        method: impl Into<String>,
        listener: impl FnMut(&mut Outbox, serde_json::Value, Option<serde_json::Value>) + 'static,
    ) {
        self.handlers.set_request(method.into(), listener);
    }

    pub fn set_default_message_handler(
        &mut self,
        handler: impl FnMut(&mut Outbox, &str, Option<serde_json::Value>) + 'static,
    ) {
        self.handlers.set_default_message(handler);
    }

    pub fn set_unsolicited_handler(
        &mut self,
        handler: impl FnMut(&mut Outbox, Option<u64>, Result<serde_json::Value, ResponseError>)
        + 'static,
    ) {
        self.handlers.set_unsolicited(handler);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Queue the bootstrap `initialize` request for `workspace`. The
    /// handshake completes when the reply is dispatched by
    /// `process_responses`.
    pub fn initialize(
        &mut self,
        workspace: &Path,
        editor_name: &str,
        editor_version: &str,
    ) -> Result<u64, LspError> {
        let state = self.outbox.lifecycle();
        if state != Lifecycle::Created {
            return Err(LspError::AlreadyStarted(state.label()));
        }
        if !self.is_running() {
            return Err(LspError::ProcessDown);
        }

        let root_uri = protocol::path_to_file_uri(workspace)?;
        let workspace_name = workspace
            .file_name()
            .map_or_else(|| root_uri.to_string(), |n| n.to_string_lossy().into_owned());
        let params = protocol::initialize_params(
            root_uri.as_str(),
            &workspace_name,
            editor_name,
            editor_version,
        );

        // A caller may already have queued `initialize`; its params win.
        let id = match self.outbox.ledger.bootstrap_mut() {
            Some(entry) => {
                entry.params.get_or_insert(params);
                entry.id
            }
            None => self.outbox.ledger.insert_bootstrap(params, Instant::now()),
        };
        self.outbox.state.lifecycle = Lifecycle::Initializing;
        tracing::debug!(server = %self.name, root = %root_uri, "Queued initialize");
        Ok(id)
    }

    /// Finish the handshake once the bootstrap reply arrives.
    pub(crate) async fn complete_initialize(
        &mut self,
        outcome: Result<serde_json::Value, ResponseError>,
    ) {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("LSP server '{}' rejected initialize: {e}", self.name);
                self.stop_with(StopReason::InitializeFailed(e.message));
                return;
            }
        };

        let capabilities = match result.get("capabilities") {
            Some(caps) if !caps.is_null() => caps.clone(),
            _ => serde_json::json!({}),
        };
        self.outbox.state.capabilities = Some(capabilities.clone());

        let params = serde_json::json!({});
        let frame = match codec::encode_frame(&Notification::new("initialized", Some(&params))) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Encoding initialized notification: {e}");
                self.stop_with(StopReason::InitializeFailed(e.to_string()));
                return;
            }
        };
        // The server ignores everything else until it sees `initialized`, so
        // keep trying until it is written or the failure ceiling stops us.
        while let Err(e) = self.write_bytes(&frame).await {
            self.note_write_failure(&e);
            if self.outbox.lifecycle() != Lifecycle::Initializing {
                return;
            }
        }
        self.outbox.state.write_fails = 0;

        tokio::time::sleep(self.config.settle_delay).await;

        self.outbox.state.lifecycle = Lifecycle::Initialized;
        tracing::info!("LSP server '{}' initialized", self.name);
        let event = ClientEvent::Initialized { capabilities };
        self.handlers.emit(&mut self.outbox, &event);
    }

    /// Tear the connection down immediately: kill the subprocess, drop all
    /// queued traffic and reset connection state. Idempotent.
    pub fn stop(&mut self) {
        self.stop_with(StopReason::Requested);
    }

    pub(crate) fn stop_with(&mut self, reason: StopReason) {
        if self.outbox.lifecycle() == Lifecycle::Stopped {
            return;
        }
        if let Some(mut process) = self.process.take() {
            process.kill();
        }

        self.outbox.clear();
        self.outbox.state.lifecycle = Lifecycle::Stopped;
        self.outbox.state.capabilities = None;
        self.outbox.state.write_fails = 0;
        let discarded = self.decoder.clear();
        if !discarded.is_empty() {
            tracing::debug!(bytes = discarded.len(), "Discarding partial inbound frame");
        }

        tracing::info!("LSP server '{}' stopped ({reason:?})", self.name);
        let event = ClientEvent::Shutdown { reason };
        self.handlers.emit(&mut self.outbox, &event);
    }

    /// Polite shutdown: send `shutdown`, wait briefly for its reply, send
    /// `exit`, then [`stop`](Self::stop).
    pub async fn exit(&mut self) {
        let live = matches!(
            self.outbox.lifecycle(),
            Lifecycle::Initializing | Lifecycle::Initialized
        );
        if live && self.is_running() {
            self.outbox.state.lifecycle = Lifecycle::ShuttingDown;
            let id = self.outbox.ledger.allocate_id();
            match codec::encode_frame(&Request::new(id, "shutdown", None)) {
                Ok(frame) => match self.write_bytes(&frame).await {
                    Ok(()) => self.await_reply(id, SHUTDOWN_TIMEOUT).await,
                    Err(e) => tracing::debug!("LSP '{}' shutdown request failed: {e}", self.name),
                },
                Err(e) => tracing::debug!("Encoding shutdown request: {e}"),
            }

            if let Ok(frame) = codec::encode_frame(&Notification::new("exit", None))
                && let Err(e) = self.write_bytes(&frame).await
            {
                tracing::debug!("LSP '{}' exit notification failed: {e}", self.name);
            }
        }
        self.stop_with(StopReason::Requested);
    }

    /// Read until the reply to `id` arrives or `timeout` passes. Other
    /// inbound traffic is dropped: the connection is going away.
    async fn await_reply(&mut self, id: u64, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_responses(remaining).await {
                Ok(frames) => {
                    let answered = frames.iter().any(|f| {
                        f.get("method").is_none()
                            && f.get("id").and_then(serde_json::Value::as_u64) == Some(id)
                    });
                    if answered {
                        tracing::debug!("LSP server '{}' acknowledged shutdown", self.name);
                        return;
                    }
                }
                Err(LspError::ProcessDown) => return,
                Err(e) => tracing::debug!("Ignoring inbound error during shutdown: {e}"),
            }
            if Instant::now() >= deadline {
                tracing::debug!("LSP server '{}' did not answer shutdown in time", self.name);
                return;
            }
        }
    }
}
