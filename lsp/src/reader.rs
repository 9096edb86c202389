//! Turns subprocess output into decoded messages.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::LspClient;
use crate::codec::FrameDecoder;
use crate::error::LspError;
use crate::process::{Process, ReadOutcome};

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Sleep between polls of an empty pipe.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Move everything currently readable into `decoder`. Returns `true` once
/// stdout has reached EOF.
fn drain_stdout<P: Process>(
    process: &mut P,
    decoder: &mut FrameDecoder,
    raw: &mut Vec<u8>,
) -> bool {
    loop {
        match process.read_stdout(READ_CHUNK_BYTES) {
            ReadOutcome::Data(bytes) => {
                decoder.extend(&bytes);
                raw.extend_from_slice(&bytes);
            }
            ReadOutcome::Empty => return false,
            ReadOutcome::Closed => return true,
        }
    }
}

impl<P: Process> LspClient<P> {
    /// Read and decode whatever the server has written.
    ///
    /// Waits up to `timeout` for the first bytes (a zero timeout polls
    /// once), then drains the pipe. A frame whose header has arrived is
    /// waited on for up to `frame_timeout` before the call gives up and
    /// leaves it buffered for the next read. Frames are returned in arrival
    /// order.
    ///
    /// A malformed frame fails the whole read: nothing is delivered and
    /// every discarded byte, including a partial frame left over from an
    /// earlier read, is returned in [`LspError::DecodeFailure`].
    pub async fn read_responses(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<serde_json::Value>, LspError> {
        let Some(process) = self.process.as_mut() else {
            return Err(LspError::ProcessDown);
        };
        if !process.running() {
            return Err(LspError::ProcessDown);
        }

        let mut raw = self.decoder.pending().to_vec();
        let deadline = Instant::now() + timeout;
        let mut closed = loop {
            match process.read_stdout(READ_CHUNK_BYTES) {
                ReadOutcome::Data(bytes) => {
                    self.decoder.extend(&bytes);
                    raw.extend_from_slice(&bytes);
                    break drain_stdout(process, &mut self.decoder, &mut raw);
                }
                ReadOutcome::Empty => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                ReadOutcome::Closed => return Err(LspError::ProcessDown),
            }
        };

        let frame_deadline = Instant::now() + self.config.frame_timeout;
        let mut frames = Vec::new();
        loop {
            match self.decoder.decode_all() {
                Ok(mut batch) => frames.append(&mut batch),
                Err(e) => {
                    self.decoder.clear();
                    tracing::debug!(
                        discarded = raw.len(),
                        "Discarding undecodable input from '{}'",
                        self.name
                    );
                    return Err(LspError::DecodeFailure {
                        reason: e.to_string(),
                        raw,
                    });
                }
            }

            // One incomplete frame blocks everything behind it.
            let Some(missing) = self.decoder.missing_body_bytes() else {
                break;
            };
            if closed {
                break;
            }
            if Instant::now() >= frame_deadline {
                tracing::debug!(
                    missing,
                    "Frame from '{}' still incomplete, deferring",
                    self.name
                );
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            closed = drain_stdout(process, &mut self.decoder, &mut raw);
        }

        if closed && frames.is_empty() {
            return Err(LspError::ProcessDown);
        }
        tracing::trace!(
            frames = frames.len(),
            buffered = self.decoder.buffered(),
            "Read from '{}'",
            self.name
        );
        Ok(frames)
    }

    /// Read whatever the server has written to stderr, polling for up to
    /// `timeout`. Returns an empty string when nothing arrived.
    pub async fn read_errors(&mut self, timeout: Duration) -> String {
        let Some(process) = self.process.as_mut() else {
            return String::new();
        };

        let deadline = Instant::now() + timeout;
        let mut collected = Vec::new();
        loop {
            match process.read_stderr(READ_CHUNK_BYTES) {
                ReadOutcome::Data(bytes) => collected.extend_from_slice(&bytes),
                ReadOutcome::Empty if collected.is_empty() => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
                }
                ReadOutcome::Empty | ReadOutcome::Closed => break,
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }
}
