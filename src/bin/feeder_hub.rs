//! feeder-hub binary: argument handling, config, logging, and the run loop
//!
//! Usage:
//!   feeder-hub                          # run with the default config path
//!   feeder-hub -c /path/to/config.yaml  # explicit config
//!   feeder-hub --check-config           # validate the config and exit
//!   feeder-hub --log-stats              # show log directory statistics

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use feeder_hub::common::{setup_shutdown, HubArgs};
use feeder_hub::config::Config;
use feeder_hub::coordinator::Coordinator;
use feeder_hub::logging;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = HubArgs::parse();

    let config_path = PathBuf::from(&args.common.config_file);
    let config = if config_path.exists() {
        Config::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        eprintln!(
            "config file {} not found, using defaults",
            config_path.display()
        );
        Config::default()
    };

    if args.check_config {
        println!("configuration OK: {}", config_path.display());
        return Ok(());
    }

    if args.log_stats {
        let stats = logging::log_stats(&config.logging.log_dir)?;
        println!("log directory: {}", config.logging.log_dir.display());
        println!(
            "{} files, {:.2} MB total",
            stats.files.len(),
            stats.total_size as f64 / 1024.0 / 1024.0
        );
        for file in &stats.files {
            println!("  {} ({:.2} KB)", file.path.display(), file.size as f64 / 1024.0);
        }
        return Ok(());
    }

    if args.archive_logs {
        let moved = logging::archive_logs(&config.logging.log_dir)
            .with_context(|| "archiving log files")?;
        println!("archived {moved} log file(s)");
        return Ok(());
    }

    let _log_guard = logging::init(&config.logging, args.common.verbose)
        .with_context(|| "initializing logging")?;
    if let Ok(removed) = logging::cleanup_old_logs(&config.logging.log_dir, config.logging.max_age_days) {
        if removed > 0 {
            info!(removed, "removed expired log files");
        }
    }

    info!(
        config = %config_path.display(),
        can_interface = %config.can.interface,
        moonraker = %config.klipper.url,
        "feeder-hub starting"
    );
    for sensor in &config.filament_runout.sensors {
        info!(sensor = %sensor.name, extruder = sensor.extruder, "runout sensor configured");
    }

    let (shutdown_tx, shutdown_rx) = setup_shutdown();
    let coordinator = Coordinator::new(
        config,
        config_path.exists().then(|| config_path.clone()),
        shutdown_tx,
    );

    if args.dry_run {
        info!("dry run: components initialized, not starting the bridge");
        drop(coordinator);
        return Ok(());
    }

    if let Err(err) = coordinator.run(shutdown_rx).await {
        warn!(error = %err, "coordinator exited with error");
        return Err(err.into());
    }

    info!("feeder-hub stopped");
    Ok(())
}
