//! Guest agent for macOS and Linux VMs.
//!
//! Shares the clipboard with the host over the SPICE agent serial channel and
//! serves remote command execution over vsock. Each component runs in its own
//! restart loop until SIGINT or SIGTERM.

#![allow(clippy::missing_docs_in_private_items)]

mod clipboard;
mod exec;
mod host;
mod resolve;
mod serial;
mod server;
mod supervisor;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tga_spice::Agent;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::clipboard::SystemClipboard;
use crate::serial::SerialPort;

#[derive(Debug, Parser)]
#[command(
    name = "tga-guest",
    version,
    about = "Guest agent providing clipboard sharing and remote execution"
)]
struct Cli {
    /// Run the SPICE clipboard agent.
    #[arg(long)]
    run_vdagent: bool,

    /// Run the RPC service on AF_VSOCK.
    #[arg(long)]
    run_rpc: bool,

    /// Same as --run-vdagent --run-rpc.
    #[arg(long)]
    run_agent: bool,

    /// Vsock port of the RPC service.
    #[arg(long, value_name = "PORT", default_value_t = tga_proto::AGENT_PORT)]
    rpc_port: u32,

    /// Serial device of the SPICE agent channel.
    #[arg(long, value_name = "PATH", default_value = serial::DEFAULT_DEVICE)]
    spice_device: PathBuf,

    /// Start even when no host communication point is found.
    #[arg(long)]
    skip_host_check: bool,

    /// Enable debug logging (`RUST_LOG` takes precedence).
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    init_logging(cli.debug)?;

    if cli.run_agent {
        cli.run_vdagent = true;
        cli.run_rpc = true;
    }

    if !cli.skip_host_check {
        let Some(point) = host::locate_communication_point() else {
            // Not running under a compatible host: stop the service manager
            // from restarting us instead of touching the VM.
            warn!("no host communication point found, terminating parent process");
            host::terminate_parent().context("signalling parent process")?;
            return Ok(());
        };
        info!(path = %point.display(), "located host communication point");
    }

    let cancel = CancellationToken::new();
    let mut components = JoinSet::new();

    if cli.run_vdagent {
        let device = cli.spice_device.clone();
        components.spawn(supervisor::supervise(
            "vdagent",
            cancel.clone(),
            move |cancel| run_vdagent(device.clone(), cancel),
        ));
    }
    if cli.run_rpc {
        let port = cli.rpc_port;
        components.spawn(supervisor::supervise(
            "rpc",
            cancel.clone(),
            move |cancel| run_rpc(port, cancel),
        ));
    }
    if components.is_empty() {
        warn!("no components enabled, see --help");
        return Ok(());
    }

    wait_for_shutdown().await?;
    info!("shutting down");
    cancel.cancel();
    while components.join_next().await.is_some() {}
    Ok(())
}

fn init_logging(debug: bool) -> Result<()> {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("installing logger: {e}"))
}

/// Resolves on the first SIGINT or SIGTERM.
async fn wait_for_shutdown() -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

async fn run_vdagent(device: PathBuf, cancel: CancellationToken) -> Result<()> {
    let serial = open_serial(&device)?;
    let clipboard = SystemClipboard::detect();
    info!(
        device = %device.display(),
        clipboard = clipboard.paste_program(),
        "running vdagent"
    );
    Agent::new(serial, clipboard)
        .run(cancel)
        .await
        .context("running vdagent")
}

fn open_serial(device: &Path) -> Result<SerialPort> {
    SerialPort::open(device).with_context(|| format!("opening {}", device.display()))
}

#[cfg(target_os = "linux")]
async fn run_rpc(port: u32, cancel: CancellationToken) -> Result<()> {
    server::run(port, cancel)
        .await
        .with_context(|| format!("serving RPC on AF_VSOCK port {port}"))
}

#[cfg(not(target_os = "linux"))]
async fn run_rpc(port: u32, cancel: CancellationToken) -> Result<()> {
    let _ = cancel;
    anyhow::bail!("RPC on AF_VSOCK port {port} needs Linux")
}
