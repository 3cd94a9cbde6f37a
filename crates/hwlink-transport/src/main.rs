//! `hwlink` command-line entry point.
//!
//! # Usage
//!
//! ```text
//! hwlink [OPTIONS] <COMMAND>
//!
//! Commands:
//!   enumerate   One enumeration pass, printed as a result envelope
//!   watch       Print transport events as JSON lines until Ctrl-C
//!   call        Acquire a device, send one message, release
//!
//! Options:
//!   --config <FILE>            Config file [env: HWLINK_CONFIG]
//!   --backend <KIND,...>       Probe order override (bridge, hid, webusb)
//!   --bridge-url <URL>         Bridge daemon URL [env: HWLINK_BRIDGE_URL]
//!   --poll-interval-ms <MS>    Enumeration poll interval
//! ```
//!
//! Results go to stdout as JSON; logs go to stderr.  The log level comes from
//! `RUST_LOG`, falling back to `log_level` in the config file.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use hwlink_core::domain::BackendKind;
use hwlink_core::error::{ResultEnvelope, TransportError, TransportResult};
use hwlink_core::protocol::LogicalMessage;
use hwlink_transport::infrastructure::backend::factory::ConfiguredFactory;
use hwlink_transport::infrastructure::storage::config::{self, TransportConfig};
use hwlink_transport::{AcquireOptions, TransportFacade};

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "hwlink", about = "Hardware wallet transport tool", version)]
struct Cli {
    /// Config file; defaults to the platform config directory.
    #[arg(long, env = "HWLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Backend probe order, comma separated.
    #[arg(long, value_delimiter = ',')]
    backend: Vec<BackendKind>,

    #[arg(long, env = "HWLINK_BRIDGE_URL")]
    bridge_url: Option<String>,

    #[arg(long)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one enumeration pass.
    Enumerate,
    /// Stream transport events until interrupted.
    Watch,
    /// Send one message to a device and print the reply.
    Call {
        /// Device path as reported by `enumerate`.
        #[arg(long)]
        path: String,
        /// Message type id.
        #[arg(long = "type")]
        message_type: u16,
        /// Payload as a hex string.
        #[arg(long, default_value = "")]
        hex: String,
        /// Take the device even if another session holds it.
        #[arg(long)]
        force: bool,
    },
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<TransportConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_from(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => config::load_config().unwrap_or_else(|e| {
                eprintln!("hwlink: {e}; using defaults");
                TransportConfig::default()
            }),
        };
        if !self.backend.is_empty() {
            cfg.transport.backends = self.backend.clone();
        }
        if let Some(url) = &self.bridge_url {
            cfg.bridge.url = url.clone();
        }
        if let Some(ms) = self.poll_interval_ms {
            cfg.transport.poll_interval_ms = ms;
        }
        Ok(cfg)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallOutput {
    message_type: u16,
    payload: String,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = cli.load_config()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.transport.log_level)),
        )
        .init();

    let factory = ConfiguredFactory::new(cfg.bridge_settings(), cfg.usb_settings());
    let facade = TransportFacade::new(cfg.facade_settings(), factory);

    match cli.command {
        Command::Enumerate => {
            let result = match facade.start().await {
                Ok(_) => facade.enumerate().await,
                Err(e) => Err(e),
            };
            print_json(&ResultEnvelope::from(result))?;
        }
        Command::Watch => watch(&facade).await?,
        Command::Call {
            path,
            message_type,
            hex,
            force,
        } => {
            let payload = hex::decode(hex.trim()).context("--hex is not valid hex")?;
            let request = LogicalMessage::new(message_type, payload);
            let options = AcquireOptions { force };
            let result = call_once(&facade, &path, &request, options).await;
            print_json(&ResultEnvelope::from(result))?;
        }
    }

    facade.stop().await;
    Ok(())
}

async fn watch(facade: &TransportFacade) -> anyhow::Result<()> {
    let mut events = facade.subscribe();
    if let Err(e) = facade.start().await {
        warn!("transport did not start: {e}");
    }
    info!("watching transport events; press Ctrl-C to exit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => print_json(&event)?,
                None => break,
            },
        }
    }
    Ok(())
}

async fn call_once(
    facade: &TransportFacade,
    path: &str,
    request: &LogicalMessage,
    options: AcquireOptions,
) -> TransportResult<CallOutput> {
    facade.start().await?;
    let descriptor = facade
        .enumerate()
        .await?
        .into_iter()
        .find(|d| d.path == path)
        .ok_or_else(|| TransportError::unreachable(format!("no device at {path}")))?;

    let session = facade.acquire(&descriptor, options).await?;
    let response = facade.call(&session, request).await;
    if let Err(e) = facade.release(&session).await {
        warn!("release failed: {e}");
    }
    let response = response?;

    Ok(CallOutput {
        message_type: response.message_type,
        payload: hex::encode(&response.payload),
    })
}
