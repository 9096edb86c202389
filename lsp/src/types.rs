//! Public types shared with hosts.
//!
//! Hosts construct [`ServerConfig`] and [`ClientConfig`] (usually by
//! deserializing them from a config file), observe [`ClientEvent`]s, and
//! query [`Lifecycle`].
//!
//! Raw deserialization structs stay private; validation happens at the serde
//! boundary through `#[serde(try_from)]`, so a constructed config is a valid
//! one.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("server command must not be empty")]
    EmptyCommand,
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
}

// ── ServerConfig ───────────────────────────────────────────────────────

/// What happens to the server's diagnostic (stderr) stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Captured and drained by `process_errors`.
    #[default]
    Pipe,
    Null,
    Inherit,
}

#[derive(Deserialize)]
struct RawServerConfig {
    #[serde(default)]
    name: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    stderr: StderrMode,
}

/// How to launch a language server.
///
/// Invariant: `command` is non-empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub struct ServerConfig {
    name: String,
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: BTreeMap<String, String>,
    stderr: StderrMode,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ConfigError;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        if raw.command.trim().is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self {
            name: raw.name.unwrap_or_else(|| raw.command.clone()),
            command: raw.command,
            args: raw.args,
            cwd: raw.cwd,
            env: raw.env,
            stderr: raw.stderr,
        })
    }
}

impl ServerConfig {
    pub fn new(command: impl Into<String>) -> Result<Self, ConfigError> {
        Self::try_from(RawServerConfig {
            name: None,
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stderr: StderrMode::default(),
        })
    }

    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    /// Label used in logs; defaults to the command.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn cwd(&self) -> Option<&PathBuf> {
        self.cwd.as_ref()
    }

    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn stderr(&self) -> StderrMode {
        self.stderr
    }
}

// ── ClientConfig ───────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(default)]
struct RawClientConfig {
    hitrate: u32,
    max_send_attempts: u32,
    max_write_failures: u32,
    request_retry_ms: u64,
    initialize_retry_ms: u64,
    settle_delay_ms: u64,
    read_timeout_ms: u64,
    frame_timeout_ms: u64,
    raw_chunk_size: usize,
}

impl Default for RawClientConfig {
    fn default() -> Self {
        Self {
            hitrate: 16,
            max_send_attempts: 2,
            max_write_failures: 60,
            request_retry_ms: 5_000,
            initialize_retry_ms: 30_000,
            settle_delay_ms: 100,
            read_timeout_ms: 0,
            frame_timeout_ms: 5_000,
            raw_chunk_size: 8 * 1024,
        }
    }
}

/// Pacing and retry policy for one client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawClientConfig")]
pub struct ClientConfig {
    /// Requests (and, separately, notifications) admitted per one-second
    /// window.
    pub hitrate: u32,
    /// Successful writes after which an unanswered request is given up.
    pub max_send_attempts: u32,
    /// Write failures tolerated before the client force-stops.
    pub max_write_failures: u32,
    /// Delay before a sent request becomes eligible for its next attempt.
    pub request_retry: Duration,
    /// Same, for the bootstrap `initialize` request, which never expires.
    pub initialize_retry: Duration,
    /// Pause between sending `initialized` and declaring the server ready.
    pub settle_delay: Duration,
    /// How long `process_responses` polls for output before giving up.
    pub read_timeout: Duration,
    /// How long a read waits for the rest of a frame whose header arrived.
    pub frame_timeout: Duration,
    /// Bytes per write when streaming raw payloads.
    pub raw_chunk_size: usize,
}

impl TryFrom<RawClientConfig> for ClientConfig {
    type Error = ConfigError;

    fn try_from(raw: RawClientConfig) -> Result<Self, Self::Error> {
        if raw.hitrate == 0 {
            return Err(ConfigError::Zero("hitrate"));
        }
        if raw.max_send_attempts == 0 {
            return Err(ConfigError::Zero("max_send_attempts"));
        }
        if raw.max_write_failures == 0 {
            return Err(ConfigError::Zero("max_write_failures"));
        }
        if raw.raw_chunk_size == 0 {
            return Err(ConfigError::Zero("raw_chunk_size"));
        }
        Ok(Self {
            hitrate: raw.hitrate,
            max_send_attempts: raw.max_send_attempts,
            max_write_failures: raw.max_write_failures,
            request_retry: Duration::from_millis(raw.request_retry_ms),
            initialize_retry: Duration::from_millis(raw.initialize_retry_ms),
            settle_delay: Duration::from_millis(raw.settle_delay_ms),
            read_timeout: Duration::from_millis(raw.read_timeout_ms),
            frame_timeout: Duration::from_millis(raw.frame_timeout_ms),
            raw_chunk_size: raw.raw_chunk_size,
        })
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        match Self::try_from(RawClientConfig::default()) {
            Ok(config) => config,
            Err(e) => unreachable!("default client config is valid: {e}"),
        }
    }
}

// ── Lifecycle & events ─────────────────────────────────────────────────

/// Connection state. Transitions only move forward; a stopped client is
/// restarted by constructing a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Initializing,
    Initialized,
    ShuttingDown,
    Stopped,
}

impl Lifecycle {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        }
    }
}

/// Why a client stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` or `exit()` was called.
    Requested,
    ProcessExited,
    /// The write-failure ceiling was reached.
    WriteFailures,
    InitializeFailed(String),
}

/// Event delivered to callbacks registered with `register_event`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Initialized { capabilities: serde_json::Value },
    Shutdown { reason: StopReason },
}

impl ClientEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Initialized { .. } => EventKind::Initialized,
            Self::Shutdown { .. } => EventKind::Shutdown,
        }
    }
}

/// Slot names for event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Initialized,
    Shutdown,
}
