//! Routes inbound messages to registered callbacks.

use std::collections::HashMap;

use crate::ledger::ResponseHandler;
use crate::outbox::{Outbox, ResultCallback};
use crate::protocol::{self, Incoming, ResponseError};
use crate::types::{ClientEvent, EventKind};

/// Handles a notification (or a request's params) for one method.
pub type MessageListener = Box<dyn FnMut(&mut Outbox, Option<serde_json::Value>)>;

/// Handles a server-initiated request. Receives the request id, which the
/// listener must answer through [`Outbox::push_response`].
pub type RequestListener =
    Box<dyn FnMut(&mut Outbox, serde_json::Value, Option<serde_json::Value>)>;

/// Receives lifecycle events.
pub type EventListener = Box<dyn FnMut(&mut Outbox, &ClientEvent)>;

/// Fallback for notifications with no listener; receives the method name.
pub type DefaultMessageHandler = Box<dyn FnMut(&mut Outbox, &str, Option<serde_json::Value>)>;

/// Receives replies that match no pending request.
pub type UnsolicitedHandler =
    Box<dyn FnMut(&mut Outbox, Option<u64>, Result<serde_json::Value, ResponseError>)>;

/// What the router could not finish on its own.
pub(crate) enum Dispatched {
    Handled,
    /// Reply to the bootstrap `initialize`; the client completes the
    /// handshake, then runs `on_result`.
    Bootstrap {
        outcome: Result<serde_json::Value, ResponseError>,
        on_result: Option<ResultCallback>,
    },
}

#[derive(Default)]
pub(crate) struct Handlers {
    events: HashMap<EventKind, EventListener>,
    messages: HashMap<String, MessageListener>,
    requests: HashMap<String, RequestListener>,
    default_message: Option<DefaultMessageHandler>,
    unsolicited: Option<UnsolicitedHandler>,
}

impl Handlers {
    pub fn set_event(
        &mut self,
        kind: EventKind,
        listener: impl FnMut(&mut Outbox, &ClientEvent) + 'static,
    ) {
        self.events.insert(kind, Box::new(listener));
    }

    pub fn set_message(
        &mut self,
        method: String,
        listener: impl FnMut(&mut Outbox, Option<serde_json::Value>) + 'static,
    ) {
        self.messages.insert(method, Box::new(listener));
    }

    pub fn set_request(
        &mut self,
        method: String,
        listener: impl FnMut(&mut Outbox, serde_json::Value, Option<serde_json::Value>) + 'static,
    ) {
        self.requests.insert(method, Box::new(listener));
    }

    pub fn set_default_message(
        &mut self,
        handler: impl FnMut(&mut Outbox, &str, Option<serde_json::Value>) + 'static,
    ) {
        self.default_message = Some(Box::new(handler));
    }

    pub fn set_unsolicited(
        &mut self,
        handler: impl FnMut(&mut Outbox, Option<u64>, Result<serde_json::Value, ResponseError>)
        + 'static,
    ) {
        self.unsolicited = Some(Box::new(handler));
    }

    pub fn emit(&mut self, outbox: &mut Outbox, event: &ClientEvent) {
        if let Some(listener) = self.events.get_mut(&event.kind()) {
            listener(outbox, event);
        }
    }

    pub fn dispatch(&mut self, outbox: &mut Outbox, frame: serde_json::Value) -> Dispatched {
        match protocol::classify(frame) {
            Incoming::Notification { method, params } => {
                self.on_notification(outbox, &method, params);
                Dispatched::Handled
            }
            Incoming::Response { id, outcome } => self.on_response(outbox, id, outcome),
            Incoming::ServerRequest { id, method, params } => {
                self.on_server_request(outbox, id, &method, params);
                Dispatched::Handled
            }
        }
    }

    fn on_notification(
        &mut self,
        outbox: &mut Outbox,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        if let Some(listener) = self.messages.get_mut(method) {
            listener(outbox, params);
        } else if let Some(handler) = &mut self.default_message {
            handler(outbox, method, params);
        } else {
            tracing::trace!(method, "Ignoring notification");
        }
    }

    fn on_response(
        &mut self,
        outbox: &mut Outbox,
        id: Option<u64>,
        outcome: Result<serde_json::Value, ResponseError>,
    ) -> Dispatched {
        let Some(pending) = id.and_then(|id| outbox.ledger.pop(id)) else {
            if let Some(handler) = &mut self.unsolicited {
                handler(outbox, id, outcome);
            } else {
                tracing::debug!(id, "Ignoring reply with no pending request");
            }
            return Dispatched::Handled;
        };

        if pending.overwritten {
            match pending.on_overwritten {
                Some(callback) => callback(outbox, outcome),
                None => tracing::debug!(
                    id = pending.id,
                    method = %pending.method,
                    "Dropping reply to superseded request"
                ),
            }
            return Dispatched::Handled;
        }

        match pending.handler {
            ResponseHandler::Bootstrap(on_result) => {
                return Dispatched::Bootstrap { outcome, on_result };
            }
            ResponseHandler::Callback(callback) => callback(outbox, outcome),
            ResponseHandler::Discard => {
                tracing::trace!(id = pending.id, method = %pending.method, "Reply discarded");
            }
        }
        Dispatched::Handled
    }

    fn on_server_request(
        &mut self,
        outbox: &mut Outbox,
        id: serde_json::Value,
        method: &str,
        params: Option<serde_json::Value>,
    ) {
        if let Some(listener) = self.requests.get_mut(method) {
            listener(outbox, id, params);
            return;
        }

        // Every server request gets a reply, or the server may block on it.
        tracing::debug!(method, "No listener for server request, replying method not found");
        if let Err(e) = outbox.push_response(id, Err(ResponseError::method_not_found())) {
            tracing::debug!(method, "Could not queue method-not-found reply: {e}");
        }
    }
}
