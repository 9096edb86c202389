//! Error taxonomy for the client engine.
//!
//! Transport and codec failures are handled inside the engine (logged,
//! counted, retried). Only sustained failure turns into a lifecycle
//! transition, which hosts observe through the shutdown event.

use crate::protocol::PathToUriError;

/// Failure of an engine operation.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    /// The subprocess exited, closed its stdout, or was never started.
    #[error("language server process is not running")]
    ProcessDown,

    #[error("failed to start language server `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// A write could not be completed within the retry budget.
    #[error("write to language server failed: {0}")]
    WriteFailure(String),

    /// A frame or its JSON body was malformed. `raw` holds every byte the
    /// failed read consumed; none of it was delivered.
    #[error("malformed frame from language server ({} bytes discarded): {reason}", raw.len())]
    DecodeFailure { reason: String, raw: Vec<u8> },

    #[error("serializing JSON-RPC message")]
    Encode(#[from] serde_json::Error),

    #[error("cannot initialize a client that is {0}")]
    AlreadyStarted(&'static str),

    #[error(transparent)]
    InvalidWorkspace(#[from] PathToUriError),
}

/// Handed to a request's expiry callback once it has used up its send
/// attempts without a reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("request {id} ({method}) expired after {attempts} send attempts")]
pub struct RequestExpired {
    pub id: u64,
    pub method: String,
    pub attempts: u32,
}

/// Why a `push_*` call declined to queue its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    /// Only `initialize` may be queued before the handshake completes.
    #[error("server is not initialized")]
    NotInitialized,
    /// The per-second hitrate for this traffic class is exhausted.
    #[error("hitrate exceeded")]
    RateLimited,
    /// No server connection is live.
    #[error("server is not running")]
    NotRunning,
}
