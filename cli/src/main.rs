//! Tether CLI - runs one language server and drives its client engine.
//!
//! # Event Loop
//!
//! The engine only makes progress when the host calls it, so the CLI owns a
//! fixed 10ms tick:
//!
//! 1. Wait for the tick (or Ctrl-C, which triggers a polite `exit`)
//! 2. Forward server stderr to the log
//! 3. Read and dispatch server output
//! 4. Flush replies to server requests
//! 5. Send one notification, one request and one raw payload
//! 6. Quit once the client has stopped

mod config;

use std::{
    env,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_lsp::{ClientEvent, EventKind, Lifecycle, LspClient, Process};

use crate::config::TetherConfig;

const TICK_DURATION: Duration = Duration::from_millis(10);

const EDITOR_NAME: &str = "tether";

#[derive(Debug, Parser, PartialEq, Eq)]
#[command(name = "tether", version)]
#[command(about = "Drive a language server from the terminal")]
struct Args {
    /// Config file (default: ~/.tether/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Append logs to a file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Workspace root (default: current directory)
    workspace: Option<PathBuf>,
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("building log filter")?;

    if let Some(path) = log_file {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log file {}", path.display()))?;

        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();
        tracing::info!(path = %path.display(), "Logging initialized");
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref())?;

    let config = TetherConfig::load(args.config.as_deref())?;
    let Some(server) = config.server else {
        bail!("no [server] section configured (see --config)");
    };

    let workspace = match args.workspace {
        Some(path) => path,
        None => env::current_dir().context("reading current directory")?,
    };
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("resolving workspace {}", workspace.display()))?;

    let mut client = LspClient::start(&server, config.client)?;
    install_listeners(&mut client);
    client.initialize(&workspace, EDITOR_NAME, env!("CARGO_PKG_VERSION"))?;

    run(&mut client).await;
    Ok(())
}

fn install_listeners<P: Process>(client: &mut LspClient<P>) {
    client.register_event(EventKind::Initialized, |_, event| {
        if let ClientEvent::Initialized { capabilities } = event {
            let names: Vec<&str> = capabilities
                .as_object()
                .map(|caps| caps.keys().map(String::as_str).collect())
                .unwrap_or_default();
            tracing::info!("Server capabilities: {}", names.join(", "));
        }
    });
    client.register_event(EventKind::Shutdown, |_, event| {
        if let ClientEvent::Shutdown { reason } = event {
            tracing::info!("Server connection closed: {reason:?}");
        }
    });
    client.register_message_listener("window/logMessage", |_, params| {
        let message = params
            .as_ref()
            .and_then(|p| p.get("message"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        tracing::info!("server: {message}");
    });
    client.set_default_message_handler(|_, method, params| {
        let bytes = params.map_or(0, |p| p.to_string().len());
        tracing::info!(method, bytes, "Notification");
    });
}

async fn run<P: Process>(client: &mut LspClient<P>) {
    let mut ticks = tokio::time::interval(TICK_DURATION);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted, shutting down '{}'", client.name());
                client.exit().await;
                break;
            }
            _ = ticks.tick() => {}
        }

        tick(client).await;

        if client.lifecycle() == Lifecycle::Stopped {
            tracing::warn!("Language server '{}' stopped", client.name());
            break;
        }
    }
}

async fn tick<P: Process>(client: &mut LspClient<P>) {
    client.process_errors().await;
    client.process_responses().await;
    client.process_client_responses().await;
    client.process_notifications().await;
    client.process_requests().await;
    client.process_raw().await;
}
