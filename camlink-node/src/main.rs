//! camlink camera node: entry point.
//!
//! ```text
//! camlink-node                     Run in the foreground
//! camlink-node --config <path>     Load a custom config TOML
//! camlink-node --hub <host:port>   Override the hub address
//! camlink-node --frames <dir>      Override the frame directory
//! camlink-node --gen-config        Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use camlink_node::config::{LoggingConfig, NodeConfig};
use camlink_node::service::NodeService;
use camlink_node::source::DirectorySource;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camlink-node", about = "camlink camera node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camlink-node.toml")]
    config: PathBuf,

    /// Hub address, overriding `network.hub_address`.
    #[arg(long)]
    hub: Option<String>,

    /// Frame directory, overriding `capture.source_dir`.
    #[arg(long)]
    frames: Option<PathBuf>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&NodeConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = NodeConfig::load(&cli.config);
    if let Some(hub) = cli.hub {
        config.network.hub_address = hub;
    }
    if let Some(dir) = cli.frames {
        config.capture.source_dir = dir;
    }

    init_tracing(&config.logging)?;

    info!("camlink-node v{}", env!("CARGO_PKG_VERSION"));
    info!("hub: {} ({})", config.network.hub_address, config.network.transport);
    info!("target FPS: {}", config.capture.fps);

    let source = DirectorySource::open(&config.capture.source_dir)?;
    let mut service = NodeService::new(config, source);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        stop.store(false, Ordering::SeqCst);
    });

    service.run().await;
    let stats = service.stats();
    info!(
        "sent {} frames, {} skipped, {} dropped",
        stats.frames_sent, stats.captures_skipped, stats.frames_dropped
    );
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.file.is_empty() {
        builder.init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)?;
        builder.with_ansi(false).with_writer(Mutex::new(file)).init();
    }
    Ok(())
}
