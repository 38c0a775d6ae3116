//! chainmux — shared chain connections for many apps
//!
//! A single-process server that lets many apps (tabs, processes) share one
//! connection per chain. Apps connect over WebSocket, attach to a chain by
//! well-known name or by chain spec, and exchange JSON-RPC through it; the
//! chain itself lives as long as some app holds it.
//!
//! Usage:
//!   chainmux                                              # Default port 9944, memory engine
//!   chainmux --port 8080                                  # Custom port
//!   chainmux --chain-spec westend=specs/westend.json \
//!            --upstream westend2=wss://westend-rpc.example  # Forward to a node
//!   chainmux --config chainmux.json                       # Settings from a file

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use chainmux_engine::memory::{self, MemoryEngine};
use chainmux_engine::upstream::{UpstreamConfig, UpstreamEngine};
use chainmux_engine::SharedEngine;
use chainmux_engine::well_known::DEFAULT_NAMES;
use chainmux_provider::ProviderConfig;
use chainmux_server::{ConnectionManager, ManagerConfig};
use chainmux_transport::{TransportConfig, TransportServer};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{EngineKind, FileConfig, Overrides, Settings, parse_pair};

#[derive(Parser, Debug)]
#[command(name = "chainmux", about = "chainmux — shared chain connections for many apps")]
struct Cli {
    /// JSON config file (flags override its values)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on (0 for OS-assigned) [default: 9944]
    #[arg(long)]
    port: Option<u16>,

    /// Hostname to bind to [default: 127.0.0.1]
    #[arg(long)]
    hostname: Option<String>,

    /// Maximum concurrent connections [default: 64]
    #[arg(long)]
    max_connections: Option<usize>,

    /// Engine running the chains
    #[arg(long, value_enum)]
    engine: Option<EngineKind>,

    /// Node endpoint for a chain, as CHAIN_ID=URL (repeatable)
    #[arg(long, value_parser = parse_pair)]
    upstream: Vec<(String, String)>,

    /// Well-known chain spec, as NAME=PATH (repeatable)
    #[arg(long, value_parser = parse_pair)]
    chain_spec: Vec<(String, String)>,

    /// Health poll interval in milliseconds [default: 10000]
    #[arg(long)]
    health_interval_ms: Option<u64>,

    /// Time a new port has to send add-chain, in milliseconds [default: 10000]
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Keep unused chains alive this long before releasing them [default: 0]
    #[arg(long)]
    teardown_grace_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Write logs to a file (defaults to ~/.chainmux/logs/chainmux.log if no path given)
    #[arg(long, default_missing_value = "DEFAULT", num_args = 0..=1)]
    log_file: Option<String>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            port: self.port,
            hostname: self.hostname.clone(),
            max_connections: self.max_connections,
            engine: self.engine,
            upstreams: self.upstream.clone(),
            chain_specs: self.chain_spec.clone(),
            health_interval_ms: self.health_interval_ms,
            handshake_timeout_ms: self.handshake_timeout_ms,
            teardown_grace_ms: self.teardown_grace_ms,
        }
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let Some(log_file_arg) = &cli.log_file else {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        if cli.json_logs {
            builder.json().init();
        } else {
            builder.init();
        }
        return Ok(());
    };

    let log_path = if log_file_arg == "DEFAULT" {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".chainmux/logs/chainmux.log")
    } else {
        PathBuf::from(log_file_arg)
    };
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", log_path.display()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false);
    if cli.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    eprintln!("Logging to {}", log_path.display());
    Ok(())
}

fn build_engine(settings: &Settings) -> SharedEngine {
    match settings.engine {
        EngineKind::Upstream => Arc::new(UpstreamEngine::new(UpstreamConfig {
            endpoints: settings.upstreams.clone().into_iter().collect(),
        })),
        EngineKind::Memory => Arc::new(MemoryEngine::with_responder(|method, _| match method {
            "system_health" => Some(memory::health(false, 1, true)),
            _ => None,
        })),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(file, cli.overrides());
    let well_known = settings.well_known_chains()?;
    for name in DEFAULT_NAMES {
        if !well_known.contains(name) {
            warn!("No chain spec for well-known chain {name}");
        }
    }

    println!();
    println!("  chainmux");
    println!();
    println!("  Engine:       {:?}", settings.engine);
    println!("  Well-known:   {}", well_known.names().join(", "));
    for (id, url) in &settings.upstreams {
        println!("  Upstream:     {id} → {url}");
    }
    println!();

    let manager = ConnectionManager::new(
        build_engine(&settings),
        well_known,
        ManagerConfig {
            provider: ProviderConfig {
                health_interval: settings.health_interval,
            },
            teardown_grace: settings.teardown_grace,
        },
    );

    let transport_config = TransportConfig {
        port: settings.port,
        hostname: settings.hostname.clone(),
        enable_cors: true,
        max_connections: Some(settings.max_connections),
        handshake_timeout: settings.handshake_timeout,
        verbose_logging: cli.verbose,
    };
    let mut transport = TransportServer::start(transport_config, manager.clone()).await?;

    println!("  WebSocket endpoint:");
    println!("    ws://{}:{}/ws?app=<name>&tab=<id>", settings.hostname, transport.port());
    println!("  State:");
    println!("    http://{}:{}/state", settings.hostname, transport.port());
    println!();
    println!("  Press Ctrl+C to stop.");
    println!();

    tokio::signal::ctrl_c().await?;

    println!();
    println!("  Shutting down...");
    manager.shutdown().await;
    transport.stop().await;
    info!("chainmux stopped");
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}
