//! Subprocess abstraction the engine drives.
//!
//! Every method is non-blocking. The engine owns the waiting: it polls
//! [`Process::read_stdout`] and retries short [`Process::write`]s, yielding to
//! the async runtime in between.

use std::io;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::error::LspError;
use crate::types::{ServerConfig, StderrMode};

const PIPE_READ_BUF_BYTES: usize = 16 * 1024;

/// Writes queued for stdin before `write` starts reporting "would block".
const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Result of one non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing available right now.
    Empty,
    /// The stream reached EOF.
    Closed,
}

/// A language server subprocess as the engine sees it.
pub trait Process {
    fn running(&mut self) -> bool;

    /// Attempt to write `bytes`; returns how many were accepted. `Ok(0)`
    /// means the pipe cannot take data right now.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    fn read_stdout(&mut self, max_bytes: usize) -> ReadOutcome;

    fn read_stderr(&mut self, max_bytes: usize) -> ReadOutcome;

    fn kill(&mut self);
}

/// Output of a pipe, pumped by a reader task into a channel.
struct PipeReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    leftover: Vec<u8>,
}

impl PipeReceiver {
    fn spawn<R>(mut pipe: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; PIPE_READ_BUF_BYTES];
            loop {
                match pipe.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("LSP pipe read error: {e}");
                        break;
                    }
                }
            }
        });
        Self {
            rx,
            leftover: Vec::new(),
        }
    }

    fn read(&mut self, max_bytes: usize) -> ReadOutcome {
        if self.leftover.is_empty() {
            match self.rx.try_recv() {
                Ok(chunk) => self.leftover = chunk,
                Err(mpsc::error::TryRecvError::Empty) => return ReadOutcome::Empty,
                Err(mpsc::error::TryRecvError::Disconnected) => return ReadOutcome::Closed,
            }
        }

        if self.leftover.len() <= max_bytes {
            return ReadOutcome::Data(std::mem::take(&mut self.leftover));
        }
        let rest = self.leftover.split_off(max_bytes);
        ReadOutcome::Data(std::mem::replace(&mut self.leftover, rest))
    }
}

/// A real language server launched with `tokio::process`.
///
/// Must be started inside a tokio runtime: stdout and stderr are drained by
/// reader tasks and stdin is fed by a writer task.
pub struct ChildProcess {
    child: Child,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    stdout: PipeReceiver,
    stderr: Option<PipeReceiver>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
}

impl ChildProcess {
    pub fn start(config: &ServerConfig) -> Result<Self, LspError> {
        Self::spawn(config).map_err(|source| LspError::Spawn {
            command: config.command().to_string(),
            source,
        })
    }

    fn spawn(config: &ServerConfig) -> anyhow::Result<Self> {
        let resolved_cmd = which::which(config.command())
            .with_context(|| format!("{} not found in PATH", config.command()))?;
        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(config.args())
            .envs(config.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(match config.stderr() {
                StderrMode::Pipe => Stdio::piped(),
                StderrMode::Null => Stdio::null(),
                StderrMode::Inherit => Stdio::inherit(),
            })
            .kill_on_drop(true);
        if let Some(cwd) = config.cwd() {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", config.command()))?;

        let mut stdin = child.stdin.take().context("no stdin from child")?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stderr = child.stderr.take().map(PipeReceiver::spawn);

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::warn!("LSP write error: {e}");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::warn!("LSP flush error: {e}");
                    break;
                }
            }
        });

        tracing::debug!(
            server = config.name(),
            path = %resolved_cmd.display(),
            "Spawned language server"
        );

        Ok(Self {
            child,
            stdin_tx,
            stdout: PipeReceiver::spawn(stdout),
            stderr,
            writer_handle,
        })
    }
}

impl Process for ChildProcess {
    fn running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.stdin_tx.try_send(bytes.to_vec()) {
            Ok(()) => Ok(bytes.len()),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(0),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "language server stdin closed",
            )),
        }
    }

    fn read_stdout(&mut self, max_bytes: usize) -> ReadOutcome {
        self.stdout.read(max_bytes)
    }

    fn read_stderr(&mut self, max_bytes: usize) -> ReadOutcome {
        match &mut self.stderr {
            Some(stderr) => stderr.read(max_bytes),
            None => ReadOutcome::Closed,
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Killing language server failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_unknown_command_fails() {
        let config = ServerConfig::new("definitely-not-a-language-server-xyz").unwrap();
        let err = ChildProcess::start(&config).err().unwrap();
        assert!(matches!(
            err,
            LspError::Spawn { ref command, .. } if command == "definitely-not-a-language-server-xyz"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_written_bytes() {
        let config = ServerConfig::new("cat").unwrap();
        let mut process = ChildProcess::start(&config).unwrap();
        assert!(process.running());
        assert_eq!(process.write(b"hello").unwrap(), 5);

        let mut echoed = Vec::new();
        for _ in 0..200 {
            match process.read_stdout(2) {
                ReadOutcome::Data(bytes) => {
                    assert!(bytes.len() <= 2);
                    echoed.extend(bytes);
                    if echoed.len() == 5 {
                        break;
                    }
                }
                ReadOutcome::Empty => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                ReadOutcome::Closed => panic!("cat closed stdout early"),
            }
        }
        assert_eq!(echoed, b"hello");

        process.kill();
        for _ in 0..200 {
            if !process.running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!process.running());
    }

    #[tokio::test]
    async fn test_pipe_receiver_reports_closed_after_eof() {
        let mut pipe = PipeReceiver::spawn(&b"abc"[..]);
        let mut seen = Vec::new();
        loop {
            match pipe.read(64) {
                ReadOutcome::Data(bytes) => seen.extend(bytes),
                ReadOutcome::Empty => tokio::task::yield_now().await,
                ReadOutcome::Closed => break,
            }
        }
        assert_eq!(seen, b"abc");
    }
}
