//! The host-driven processing steps.
//!
//! Each `process_*` call does a bounded amount of work and reports whether
//! it did anything, so the host can keep calling until everything is idle.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::LspClient;
use crate::codec::{self, FRAME_TRAILER};
use crate::error::{LspError, RequestExpired};
use crate::process::Process;
use crate::protocol::{Notification, Request, Response};
use crate::router::Dispatched;
use crate::types::{Lifecycle, StopReason};

/// Consecutive zero-byte writes before a write counts as failed. With the
/// linear backoff below this is roughly one second of a stuck pipe.
const MAX_EMPTY_WRITES: u32 = 19;

const WRITE_BACKOFF_STEP: Duration = Duration::from_millis(5);

/// How long a request whose write failed waits before its next attempt.
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);

impl<P: Process> LspClient<P> {
    fn is_live(&self) -> bool {
        matches!(
            self.outbox.lifecycle(),
            Lifecycle::Initializing | Lifecycle::Initialized
        )
    }

    /// Write all of `bytes`, retrying short writes with a growing pause.
    pub(crate) async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), LspError> {
        let Some(process) = self.process.as_mut() else {
            return Err(LspError::ProcessDown);
        };

        let mut written = 0;
        let mut empty_writes = 0;
        while written < bytes.len() {
            match process.write(&bytes[written..]) {
                Ok(0) => {
                    if !process.running() {
                        return Err(LspError::ProcessDown);
                    }
                    empty_writes += 1;
                    if empty_writes > MAX_EMPTY_WRITES {
                        return Err(LspError::WriteFailure(format!(
                            "pipe stalled after {written} of {} bytes",
                            bytes.len()
                        )));
                    }
                    tokio::time::sleep(WRITE_BACKOFF_STEP * empty_writes).await;
                }
                Ok(n) => {
                    written += n;
                    empty_writes = 0;
                }
                Err(e) if !process.running() => {
                    tracing::debug!("Write to exited LSP server: {e}");
                    return Err(LspError::ProcessDown);
                }
                Err(e) => return Err(LspError::WriteFailure(e.to_string())),
            }
        }
        Ok(())
    }

    /// Count a failed write; stop the client once failures hit the ceiling
    /// or the process is gone.
    pub(crate) fn note_write_failure(&mut self, err: &LspError) {
        if matches!(err, LspError::ProcessDown) {
            tracing::info!("LSP server '{}' is gone", self.name);
            self.stop_with(StopReason::ProcessExited);
            return;
        }

        self.outbox.state.write_fails += 1;
        let failures = self.outbox.state.write_fails;
        tracing::warn!(
            failures,
            ceiling = self.config.max_write_failures,
            "{err}"
        );
        if failures >= self.config.max_write_failures {
            tracing::error!(
                "LSP server '{}' failed {failures} writes in a row, stopping",
                self.name
            );
            self.stop_with(StopReason::WriteFailures);
        }
    }

    fn note_write_success(&mut self) {
        self.outbox.state.write_fails = 0;
    }

    /// Send the oldest queued notification. Returns whether a send was
    /// attempted.
    pub async fn process_notifications(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        let Some(front) = self.outbox.notifications.front() else {
            return false;
        };

        let notification = Notification::new(&front.method, front.params.as_ref());
        let frame = match codec::encode_frame(&notification) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(
                    method = %front.method,
                    "Dropping unencodable notification: {e}"
                );
                self.outbox.notifications.pop_front();
                return true;
            }
        };

        match self.write_bytes(&frame).await {
            Ok(()) => {
                self.note_write_success();
                if let Some(sent) = self.outbox.notifications.pop_front() {
                    tracing::trace!(method = %sent.method, "Sent notification");
                    if let Some(on_sent) = sent.on_sent {
                        on_sent(&mut self.outbox);
                    }
                }
            }
            Err(e) => self.note_write_failure(&e),
        }
        true
    }

    /// Send the oldest request that is due. Returns whether a send was
    /// attempted.
    ///
    /// A request stays in the ledger after it is written so it can be
    /// resent if no reply arrives; after `max_send_attempts` writes it is
    /// dropped and its expiry callback runs. The bootstrap `initialize` is
    /// resent every `initialize_retry` and never expires.
    pub async fn process_requests(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        let now = Instant::now();
        for stale in self.outbox.ledger.take_stale_overwritten(now) {
            tracing::trace!(
                id = stale.id,
                method = %stale.method,
                "Dropping superseded request"
            );
        }

        let Some(id) = self.outbox.ledger.next_due(now) else {
            return false;
        };
        let Some(entry) = self.outbox.ledger.get_mut(id) else {
            return false;
        };
        let request = Request::new(entry.id, &entry.method, entry.params.as_ref());
        let frame = match codec::encode_frame(&request) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(id, method = %entry.method, "Dropping unencodable request: {e}");
                self.outbox.ledger.pop(id);
                return true;
            }
        };

        if let Err(e) = self.write_bytes(&frame).await {
            if let Some(entry) = self.outbox.ledger.get_mut(id) {
                entry.timestamp = Instant::now() + WRITE_RETRY_DELAY;
            }
            self.note_write_failure(&e);
            return true;
        }
        self.note_write_success();

        let Some(entry) = self.outbox.ledger.get_mut(id) else {
            return true;
        };
        entry.times_sent += 1;
        tracing::trace!(id, method = %entry.method, attempt = entry.times_sent, "Sent request");

        if entry.is_bootstrap() {
            entry.timestamp = Instant::now() + self.config.initialize_retry;
        } else if entry.times_sent >= self.config.max_send_attempts {
            if let Some(expired) = self.outbox.ledger.pop(id) {
                tracing::debug!(
                    id,
                    method = %expired.method,
                    "Request expired without a reply"
                );
                if let Some(on_expired) = expired.on_expired {
                    let reason = RequestExpired {
                        id,
                        method: expired.method,
                        attempts: expired.times_sent,
                    };
                    on_expired(&mut self.outbox, reason);
                }
            }
        } else {
            entry.timestamp = Instant::now() + self.config.request_retry;
        }
        true
    }

    /// Read server output and dispatch every decoded message. Returns how
    /// many messages were dispatched.
    ///
    /// Malformed input is logged and skipped; a closed stdout stops the
    /// client.
    pub async fn process_responses(&mut self) -> usize {
        if !self.is_live() {
            return 0;
        }
        let frames = match self.read_responses(self.config.read_timeout).await {
            Ok(frames) => frames,
            Err(LspError::ProcessDown) => {
                tracing::info!("LSP server '{}' closed stdout", self.name);
                self.stop_with(StopReason::ProcessExited);
                return 0;
            }
            Err(e) => {
                tracing::warn!("LSP reader error for '{}': {e}", self.name);
                return 0;
            }
        };

        let mut dispatched = 0;
        for frame in frames {
            if self.outbox.lifecycle() == Lifecycle::Stopped {
                break;
            }
            dispatched += 1;
            if let Dispatched::Bootstrap { outcome, on_result } =
                self.handlers.dispatch(&mut self.outbox, frame)
            {
                self.complete_initialize(outcome.clone()).await;
                if let Some(on_result) = on_result {
                    on_result(&mut self.outbox, outcome);
                }
            }
        }
        dispatched
    }

    /// Send every queued reply to a server-initiated request, stopping at
    /// the first failed write. Returns whether anything was sent.
    pub async fn process_client_responses(&mut self) -> bool {
        if !self.is_live() {
            return false;
        }
        let mut sent = false;
        while let Some(front) = self.outbox.responses.front() {
            let frame = match codec::encode_frame(&Response::new(&front.id, &front.outcome)) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(id = %front.id, "Dropping unencodable response: {e}");
                    self.outbox.responses.pop_front();
                    continue;
                }
            };
            if let Err(e) = self.write_bytes(&frame).await {
                self.note_write_failure(&e);
                break;
            }
            self.note_write_success();
            if let Some(response) = self.outbox.responses.pop_front() {
                tracing::trace!(id = %response.id, "Sent response");
            }
            sent = true;
        }
        sent
    }

    /// Stream the oldest raw payload, once no control traffic is waiting.
    /// Returns whether a send was attempted.
    ///
    /// The header goes out in one write and the body in `raw_chunk_size`
    /// pieces, yielding to the runtime between pieces. A failure after the
    /// header has been written leaves the server mid-frame, so the client
    /// is stopped.
    pub async fn process_raw(&mut self) -> bool {
        if !self.outbox.is_initialized() || self.outbox.has_control_traffic() {
            return false;
        }
        let Some(payload) = self.outbox.raw.front_mut() else {
            return false;
        };
        if payload.sending {
            tracing::error!(
                name = %payload.name,
                "Raw payload was interrupted mid-send, discarding"
            );
            self.outbox.raw.pop_front();
            return true;
        }

        payload.sending = true;
        let mut body = std::mem::take(&mut payload.body);
        let header = codec::frame_header(body.len());

        if let Err(e) = self.write_bytes(header.as_bytes()).await {
            if let Some(payload) = self.outbox.raw.front_mut() {
                payload.body = body;
                payload.sending = false;
            }
            self.note_write_failure(&e);
            return true;
        }

        body.extend_from_slice(FRAME_TRAILER);
        for chunk in body.chunks(self.config.raw_chunk_size) {
            if let Err(e) = self.write_bytes(chunk).await {
                tracing::error!("Raw payload to '{}' broke off mid-frame: {e}", self.name);
                let reason = if matches!(e, LspError::ProcessDown) {
                    StopReason::ProcessExited
                } else {
                    StopReason::WriteFailures
                };
                self.stop_with(reason);
                return true;
            }
            tokio::task::yield_now().await;
        }
        self.note_write_success();

        if let Some(sent) = self.outbox.raw.pop_front() {
            tracing::trace!(name = %sent.name, bytes = body.len(), "Sent raw payload");
            if let Some(on_sent) = sent.on_sent {
                on_sent(&mut self.outbox);
            }
        }
        true
    }

    /// Forward server stderr to the log. Returns whether anything was read.
    pub async fn process_errors(&mut self) -> bool {
        let text = self.read_errors(Duration::ZERO).await;
        if text.is_empty() {
            return false;
        }
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(server = %self.name, "stderr: {line}");
        }
        true
    }
}
