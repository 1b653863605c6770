//! dfarm host — entry point.
//!
//! ```text
//! dfarm-host                      Mirror the configured fleet
//! dfarm-host --config <path>      Load a custom config TOML
//! dfarm-host --serial <id> ...    Override the configured serials
//! dfarm-host --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dfarm_host::config::HostConfig;
use dfarm_host::service::FarmService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dfarm-host", about = "Android device-farm mirroring host")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "dfarm-host.toml")]
    config: PathBuf,

    /// Device serial to mirror; repeat for several. Overrides the
    /// config file's serial list.
    #[arg(short, long = "serial")]
    serials: Vec<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&HostConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    // Load config.
    let mut config = HostConfig::load(&cli.config);
    if !cli.serials.is_empty() {
        config.farm.serials = cli.serials;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("dfarm-host v{}", env!("CARGO_PKG_VERSION"));
    info!("adb: {}", config.farm.adb_path.display());
    info!("agent: {}", config.farm.agent_path.display());
    info!("base port: {}", config.farm.base_port);
    info!("devices: {}", config.farm.serials.len());

    let service = FarmService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received — shutting down");
        stop_clone.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
