//! Outbound queues and the producer side of the engine.
//!
//! [`Outbox`] owns connection state, the request ledger, and the
//! notification / response / raw queues. Callbacks receive `&mut Outbox`, so
//! handlers can queue follow-up traffic while the engine is dispatching.

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::error::{Rejected, RequestExpired};
use crate::hitrate::{Hitrate, TrafficClass};
use crate::ledger::RequestLedger;
use crate::protocol::ResponseError;
use crate::types::Lifecycle;

/// Receives the reply to a request.
pub type ResultCallback = Box<dyn FnOnce(&mut Outbox, Result<serde_json::Value, ResponseError>)>;

/// Runs once when a request is given up.
pub type ExpiredCallback = Box<dyn FnOnce(&mut Outbox, RequestExpired)>;

/// Runs once an item has been fully written.
pub type SentCallback = Box<dyn FnOnce(&mut Outbox)>;

/// A request under construction.
///
/// Opaque per-request data travels in the callbacks' captured state.
pub struct OutgoingRequest {
    pub(crate) method: String,
    pub(crate) params: Option<serde_json::Value>,
    pub(crate) overwrite: bool,
    pub(crate) on_result: Option<ResultCallback>,
    pub(crate) on_expired: Option<ExpiredCallback>,
    pub(crate) on_overwritten: Option<ResultCallback>,
}

impl OutgoingRequest {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            overwrite: false,
            on_result: None,
            on_expired: None,
            on_overwritten: None,
        }
    }

    #[must_use]
    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    /// Replace a pending request of the same method instead of queueing a
    /// duplicate.
    #[must_use]
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    #[must_use]
    pub fn on_result(
        mut self,
        f: impl FnOnce(&mut Outbox, Result<serde_json::Value, ResponseError>) + 'static,
    ) -> Self {
        self.on_result = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn on_expired(mut self, f: impl FnOnce(&mut Outbox, RequestExpired) + 'static) -> Self {
        self.on_expired = Some(Box::new(f));
        self
    }

    /// Receives the reply instead of `on_result` when this request was
    /// superseded by an overwrite after it had been sent.
    #[must_use]
    pub fn on_overwritten(
        mut self,
        f: impl FnOnce(&mut Outbox, Result<serde_json::Value, ResponseError>) + 'static,
    ) -> Self {
        self.on_overwritten = Some(Box::new(f));
        self
    }
}

/// A notification under construction.
pub struct OutgoingNotification {
    method: String,
    params: Option<serde_json::Value>,
    on_sent: Option<SentCallback>,
}

impl OutgoingNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            on_sent: None,
        }
    }

    #[must_use]
    pub fn params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    #[must_use]
    pub fn on_sent(mut self, f: impl FnOnce(&mut Outbox) + 'static) -> Self {
        self.on_sent = Some(Box::new(f));
        self
    }
}

pub(crate) struct QueuedNotification {
    pub method: String,
    pub params: Option<serde_json::Value>,
    pub on_sent: Option<SentCallback>,
}

pub(crate) struct QueuedResponse {
    pub id: serde_json::Value,
    pub outcome: Result<serde_json::Value, ResponseError>,
}

/// Pre-serialized JSON body streamed in chunks.
pub(crate) struct RawPayload {
    pub name: String,
    pub body: Vec<u8>,
    pub sending: bool,
    pub on_sent: Option<SentCallback>,
}

pub(crate) struct ServerState {
    pub lifecycle: Lifecycle,
    pub capabilities: Option<serde_json::Value>,
    /// Consecutive failed writes.
    pub write_fails: u32,
}

pub struct Outbox {
    pub(crate) state: ServerState,
    pub(crate) ledger: RequestLedger,
    pub(crate) notifications: VecDeque<QueuedNotification>,
    pub(crate) responses: VecDeque<QueuedResponse>,
    pub(crate) raw: VecDeque<RawPayload>,
    hitrate: Hitrate,
}

impl Outbox {
    pub(crate) fn new(hitrate: u32) -> Self {
        Self {
            state: ServerState {
                lifecycle: Lifecycle::Created,
                capabilities: None,
                write_fails: 0,
            },
            ledger: RequestLedger::new(),
            notifications: VecDeque::new(),
            responses: VecDeque::new(),
            raw: VecDeque::new(),
            hitrate: Hitrate::new(hitrate),
        }
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.state.lifecycle,
            Lifecycle::ShuttingDown | Lifecycle::Stopped
        )
    }

    /// Queue a request. Returns its id (the existing id when an unsent
    /// request was overwritten in place).
    ///
    /// Before the handshake completes only `initialize` is accepted, and it
    /// is merged into the connection's single bootstrap request.
    pub fn push_request(&mut self, request: OutgoingRequest) -> Result<u64, Rejected> {
        if self.is_closed() {
            return Err(Rejected::NotRunning);
        }
        if !self.is_initialized() && request.method != "initialize" {
            tracing::debug!(method = %request.method, "Request rejected before initialization");
            return Err(Rejected::NotInitialized);
        }
        let now = Instant::now();
        if !self.is_initialized() {
            return Ok(self.ledger.adopt_bootstrap(request, now));
        }
        if !self
            .hitrate
            .admit(TrafficClass::Request, &request.method, now)
        {
            tracing::debug!(method = %request.method, "Request rejected by hitrate");
            return Err(Rejected::RateLimited);
        }
        Ok(self.ledger.insert(request, now))
    }

    pub fn push_notification(
        &mut self,
        notification: OutgoingNotification,
    ) -> Result<(), Rejected> {
        if self.is_closed() {
            return Err(Rejected::NotRunning);
        }
        if !self.is_initialized() {
            return Err(Rejected::NotInitialized);
        }
        if !self.hitrate.admit(
            TrafficClass::Notification,
            &notification.method,
            Instant::now(),
        ) {
            tracing::debug!(method = %notification.method, "Notification rejected by hitrate");
            return Err(Rejected::RateLimited);
        }
        self.notifications.push_back(QueuedNotification {
            method: notification.method,
            params: notification.params,
            on_sent: notification.on_sent,
        });
        Ok(())
    }

    /// Queue the reply to a server-initiated request. `id` is echoed back
    /// verbatim.
    pub fn push_response(
        &mut self,
        id: serde_json::Value,
        outcome: Result<serde_json::Value, ResponseError>,
    ) -> Result<(), Rejected> {
        if self.is_closed() || self.state.lifecycle == Lifecycle::Created {
            return Err(Rejected::NotRunning);
        }
        self.responses.push_back(QueuedResponse { id, outcome });
        Ok(())
    }

    /// Queue a pre-serialized JSON body. A queued payload with the same
    /// `name` that has not started sending is replaced in place.
    pub fn push_raw(
        &mut self,
        name: impl Into<String>,
        body: impl Into<Vec<u8>>,
        on_sent: Option<SentCallback>,
    ) -> Result<(), Rejected> {
        if self.is_closed() {
            return Err(Rejected::NotRunning);
        }
        if !self.is_initialized() {
            return Err(Rejected::NotInitialized);
        }
        let name = name.into();
        let body = body.into();

        if let Some(existing) = self
            .raw
            .iter_mut()
            .find(|p| p.name == name && !p.sending)
        {
            tracing::trace!(name = %name, bytes = body.len(), "Overwriting queued raw payload");
            existing.body = body;
            existing.on_sent = on_sent;
            return Ok(());
        }

        self.raw.push_back(RawPayload {
            name,
            body,
            sending: false,
            on_sent,
        });
        Ok(())
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lifecycle == Lifecycle::Initialized
    }

    /// Capabilities from the server's `initialize` result.
    #[must_use]
    pub fn server_capabilities(&self) -> Option<&serde_json::Value> {
        self.state.capabilities.as_ref()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.ledger.len()
    }

    #[must_use]
    pub fn queued_notifications(&self) -> usize {
        self.notifications.len()
    }

    #[must_use]
    pub fn queued_responses(&self) -> usize {
        self.responses.len()
    }

    #[must_use]
    pub fn queued_raw(&self) -> usize {
        self.raw.len()
    }

    #[must_use]
    pub fn write_failures(&self) -> u32 {
        self.state.write_fails
    }

    /// Whether control traffic is queued or a request awaits its reply;
    /// raw payloads yield to it.
    pub(crate) fn has_control_traffic(&self) -> bool {
        !self.notifications.is_empty() || !self.responses.is_empty() || self.ledger.has_live()
    }

    /// Discard everything queued. In-flight items are dropped without their
    /// callbacks.
    pub(crate) fn clear(&mut self) {
        let requests = self.ledger.reset();
        let dropped =
            requests + self.notifications.len() + self.responses.len() + self.raw.len();
        if dropped > 0 {
            tracing::debug!(
                requests,
                notifications = self.notifications.len(),
                responses = self.responses.len(),
                raw = self.raw.len(),
                "Discarding queued traffic"
            );
        }
        self.notifications.clear();
        self.responses.clear();
        self.raw.clear();
        self.hitrate.reset();
    }
}
