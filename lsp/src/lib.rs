//! Cooperative client engine for Language Server Protocol servers.
//!
//! An [`LspClient`] owns one server subprocess. The host drives it by calling
//! the `process_*` steps in a loop; nothing happens between calls. Producers
//! queue traffic through [`Outbox`], which is also what every callback
//! receives.

pub mod codec;
pub mod types;

pub(crate) mod hitrate;
pub(crate) mod ledger;
pub(crate) mod protocol;
pub(crate) mod router;

mod client;
mod error;
mod outbox;
mod process;
mod reader;
mod scheduler;

#[cfg(test)]
mod testing;

pub use client::LspClient;
pub use error::{LspError, Rejected, RequestExpired};
pub use outbox::{
    ExpiredCallback, Outbox, OutgoingNotification, OutgoingRequest, ResultCallback, SentCallback,
};
pub use process::{ChildProcess, Process, ReadOutcome};
pub use protocol::{PathToUriError, ResponseError, error_codes};
pub use types::{
    ClientConfig, ClientEvent, ConfigError, EventKind, Lifecycle, ServerConfig, StderrMode,
    StopReason,
};
