//! Line-echo server demonstrating zero-downtime restarts.
//!
//! Every connection is greeted with `waddle-handoff pid=<pid>` and then has
//! its lines echoed back. Send `SIGUSR2` to restart without dropping the
//! listener, `SIGTERM` to stop.
//!
//! # Environment Variables
//!
//! - `WADDLE_HANDOFF_DEMO_ADDR`: Address to bind on cold start. Default: `127.0.0.1:9090`
//! - `WADDLE_DRAIN_TIMEOUT_SECS`: Drain timeout in seconds. Default: 30
//! - `RUST_LOG`: Log filter. Default: `info,waddle_handoff=debug`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use waddle_handoff::{
    detect, notify_parent, ControlLoop, HandoffVars, ProcessRelauncher, SignalRegistration,
};

/// Demo server configuration loaded from environment variables.
#[derive(Debug, Clone)]
struct DemoConfig {
    addr: SocketAddr,
    drain_timeout: Duration,
}

impl DemoConfig {
    fn from_env() -> Result<Self> {
        let addr = std::env::var("WADDLE_HANDOFF_DEMO_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:9090".to_string())
            .parse()
            .context("WADDLE_HANDOFF_DEMO_ADDR is not a socket address")?;

        let timeout_secs: u64 = std::env::var("WADDLE_DRAIN_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            addr,
            drain_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,waddle_handoff=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!(pid = std::process::id(), "waddle-handoff demo starting");

    // Register before binding: a SIGUSR2 with default disposition kills the process.
    let mut signals = SignalRegistration::register()?;

    let config = DemoConfig::from_env()?;
    let relauncher = ProcessRelauncher::from_env();
    relauncher.config().log_config();

    let (listener, parent) = acquire_listener(&config, &relauncher.config().vars).await?;
    let listener = Arc::new(listener);
    info!(addr = %listener.local_addr()?, "Serving");

    // We are serving on the inherited socket; the parent may stop.
    if let Some(parent_pid) = parent {
        if let Err(e) = notify_parent(parent_pid) {
            warn!(parent_pid, error = %e, "Could not notify parent process");
        }
    }

    let stop = CancellationToken::new();
    let tracker = TaskTracker::new();
    let accept = tokio::spawn(accept_loop(
        Arc::clone(&listener),
        stop.clone(),
        tracker.clone(),
    ));

    let outcome = loop {
        match ControlLoop::new(&mut signals, relauncher.clone())
            .run(&listener)
            .await
        {
            Ok(()) => break Ok(()),
            Err(e) if e.is_relaunch_failure() => {
                error!(error = %e, "Restart failed, continuing to serve");
            }
            Err(e) => break Err(e),
        }
    };

    info!("Stopping accept loop");
    stop.cancel();
    if let Err(e) = accept.await {
        error!(error = %e, "Accept loop task failed");
    }

    tracker.close();
    info!(
        active_connections = tracker.len(),
        timeout_secs = config.drain_timeout.as_secs(),
        "Draining connections"
    );
    if tokio::time::timeout(config.drain_timeout, tracker.wait())
        .await
        .is_err()
    {
        warn!(
            remaining_connections = tracker.len(),
            "Drain timeout expired, force-exiting"
        );
    }

    info!("Shutdown complete");
    outcome.context("control loop failed")
}

/// Take over the parent's listener, or bind a fresh one on cold start.
async fn acquire_listener(
    config: &DemoConfig,
    vars: &HandoffVars,
) -> Result<(TcpListener, Option<u32>)> {
    match detect(vars) {
        Ok(Some(inherited)) => {
            let parent_pid = inherited.parent_pid;
            let listener = inherited
                .into_tokio()
                .context("Failed to register inherited listener")?;
            Ok((listener, Some(parent_pid)))
        }
        Ok(None) => Ok((bind(config.addr).await?, None)),
        Err(e) if e.is_handoff_rejection() => {
            warn!(error = %e, "Ignoring invalid handoff, cold start");
            Ok((bind(config.addr).await?, None))
        }
        Err(e) => Err(e.into()),
    }
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Bound listener");
    Ok(listener)
}

async fn accept_loop(listener: Arc<TcpListener>, stop: CancellationToken, tracker: TaskTracker) {
    loop {
        tokio::select! {
            () = stop.cancelled() => {
                info!("Stopped accepting connections");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(serve(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn serve(stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = echo(stream).await {
        warn!(peer = %peer, error = %e, "Connection error");
    }
}

async fn echo(stream: TcpStream) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    writer
        .write_all(format!("waddle-handoff pid={}\n", std::process::id()).as_bytes())
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
    }
    Ok(())
}
