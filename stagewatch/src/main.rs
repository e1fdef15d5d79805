use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use stagewatch_core::{load_config, logging, Dashboard};

/// Live-event crew dashboard engine: monitors camera feeds, tells truly-live
/// encoder output apart from recorded tails, and handles producer-driven
/// break mode.
#[derive(Parser, Debug)]
#[command(name = "stagewatch", version, about)]
struct Args {
    /// Path to the configuration file (TOML)
    #[arg(short, long, env = "STAGEWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between feed status report lines
    #[arg(long, default_value_t = 30)]
    report_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration (the only hard failure besides event expiry)
    let mut config = load_config(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        event = %config.event.name,
        feeds = config.feeds.len(),
        api_base = %config.upstream.api_base,
        "Stagewatch starting"
    );

    // 3. Build and start the dashboard
    let dashboard = Dashboard::connect(config)?;
    dashboard.start().await?;

    // 4. Periodic status lines so a headless terminal shows feed state
    let reporter = dashboard.clone();
    let report_interval = Duration::from_secs(args.report_interval.max(1));
    let report_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(report_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            for snapshot in reporter.snapshots().await {
                info!(
                    feed = snapshot.index,
                    name = %snapshot.name,
                    phase = ?snapshot.phase,
                    blocked = snapshot.blocked,
                    health = ?snapshot.health,
                    bitrate = ?snapshot.bitrate_bps,
                    "Feed status"
                );
            }
        }
    });

    // 5. Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    report_task.abort();
    dashboard.shutdown().await;

    Ok(())
}
