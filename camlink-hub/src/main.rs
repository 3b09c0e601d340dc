//! camlink hub: entry point.
//!
//! ```text
//! camlink-hub                        Listen with defaults
//! camlink-hub --config <path>        Use custom config TOML
//! camlink-hub --listen <host:port>   Override the listen address
//! camlink-hub --snapshot <path>      Mirror the latest frame into a file
//! camlink-hub --gen-config           Dump default config and exit
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camlink_hub::config::{HubSettings, LoggingConfig};
use camlink_hub::console;
use camlink_hub::service::HubService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "camlink-hub", about = "camlink frame hub")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "camlink-hub.toml")]
    config: PathBuf,

    /// Listen address (overrides config). Example: 0.0.0.0:4444
    #[arg(short, long)]
    listen: Option<String>,

    /// Snapshot file (overrides config).
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Do not read operator commands from stdin.
    #[arg(long)]
    no_console: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&HubSettings::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut settings = HubSettings::load(&cli.config);
    if let Some(addr) = cli.listen {
        settings.network.listen_address = addr;
    }
    if let Some(path) = cli.snapshot {
        settings.snapshot.path = path;
    }

    init_tracing(&settings.logging)?;

    info!("camlink-hub v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "listening on {} ({})",
        settings.network.listen_address, settings.network.transport
    );

    let service = HubService::start(&settings).await?;
    let handle = service.handle();

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received; shutting down");
        ctrl_c_handle.stop();
    });

    if !cli.no_console {
        let lines = console::stdin_lines()?;
        let console_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = console::run(console_handle, lines, tokio::io::stdout()).await {
                warn!("console: {e}");
            }
        });
    }

    service.wait().await;
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
