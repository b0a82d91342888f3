//! facefind daemon: keeps the face index in step with the dataset.
//!
//! On startup the daemon assigns people to faces stored without one,
//! restores missing media files, then ingests the configured dataset in the
//! background while logging health. Searches made meanwhile (by the CLI
//! against the same database) see whatever has been indexed so far.
//!
//! ## Usage
//!
//! ```bash
//! facefind-daemon              # Run in foreground
//! facefind-daemon --once       # Ingest the dataset once and exit
//! ```

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use facefind::logging::{self, LogTarget};
use facefind::{Config, FaceFinder, ScanStatus};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Daemon configuration
#[derive(Debug, Default)]
struct DaemonArgs {
    /// Run once and exit
    once: bool,
    /// Rescan interval override (seconds)
    interval: Option<u64>,
    /// Config path override
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    logging::init(LogTarget::Service, None).context("Failed to initialize logging")?;

    info!("facefind daemon starting...");

    let config = match &args.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let rescan_every = args
        .interval
        .unwrap_or(config.dataset.rescan_interval_secs);

    let finder = FaceFinder::open(config).context("Failed to open the index")?;

    let backfilled = finder.backfill_person_ids().await?;
    if backfilled > 0 {
        info!(faces = backfilled, "Assigned people to unassigned faces");
    }
    let rehydrated = finder.rehydrate().await?;
    info!(
        restored = rehydrated.restored,
        still_missing = rehydrated.still_missing,
        "Media check finished"
    );
    info!(health = %finder.health()?, "Index ready");

    if args.once {
        info!("Running in single-shot mode");
        if finder.spawn_dataset_scan().is_none() {
            warn!("No dataset configured, nothing to do");
        }
        log_scan_result(&finder).await;
    } else {
        run_daemon_loop(&finder, rescan_every).await?;
    }

    info!("facefind daemon stopped");
    Ok(())
}

fn parse_args() -> DaemonArgs {
    let args: Vec<String> = std::env::args().skip(1).collect();
    parse_arg_list(&args).unwrap_or_else(|message| exit_with_usage(&message))
}

fn parse_arg_list(args: &[String]) -> Result<DaemonArgs, String> {
    let mut daemon_args = DaemonArgs::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--once" | "-1" => {
                daemon_args.once = true;
            }
            "--interval" | "-i" => {
                let raw = args
                    .get(i + 1)
                    .ok_or("--interval requires a number of seconds")?;
                let interval = raw
                    .parse()
                    .map_err(|_| format!("Invalid interval: {raw}"))?;
                daemon_args.interval = Some(interval);
                i += 1;
            }
            "--config" | "-c" => {
                let path = args.get(i + 1).ok_or("--config requires a path argument")?;
                daemon_args.config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => return Err(format!("Unknown argument: {other}")),
        }
        i += 1;
    }

    Ok(daemon_args)
}

fn exit_with_usage(message: &str) -> ! {
    eprintln!("{message}");
    print_help();
    std::process::exit(1);
}

fn print_help() {
    println!(
        r#"facefind-daemon - Background face indexer for facefind

USAGE:
    facefind-daemon [OPTIONS]

OPTIONS:
    --once, -1          Ingest dataset.path once and exit
    --interval, -i N    Rescan the dataset every N seconds (0 disables;
                        default: dataset.rescan_interval_secs)
    --config, -c PATH   Path to config file
    --help, -h          Show this help message

ENVIRONMENT:
    FACEFIND_CONFIG     Path to config file (overrides default location)
    FACEFIND_LOG        Log level (trace, debug, info, warn, error)

At startup the daemon assigns people to unassigned faces, restores missing
media files from their source paths and, when dataset.auto_ingest_on_startup
is set, ingests dataset.path in the background. Ctrl-C stops the scan after
the file in progress.
"#
    );
}

async fn run_daemon_loop(finder: &FaceFinder, rescan_every: u64) -> Result<()> {
    if finder.spawn_startup_ingest().is_none() {
        info!("Startup ingestion disabled or no dataset configured");
    }

    let rescan = (rescan_every > 0).then(|| Duration::from_secs(rescan_every));
    if let Some(every) = rescan {
        info!(seconds = every.as_secs(), "Periodic rescan enabled");
    }
    let mut last_scan = Instant::now();
    let mut ticker = tokio::time::interval(HEALTH_LOG_INTERVAL);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutdown requested");
                if finder.cancel_scan() {
                    info!("Waiting for the scan to stop after its current file");
                }
                log_scan_result(finder).await;
                return Ok(());
            }
            _ = ticker.tick() => {
                let health = finder.health()?;
                info!(%health, "Health");

                if matches!(health.scan, ScanStatus::Finished(_)) {
                    log_scan_result(finder).await;
                }

                let idle = !matches!(health.scan, ScanStatus::Running { .. });
                if let Some(every) = rescan {
                    if idle && last_scan.elapsed() >= every {
                        if finder.spawn_dataset_scan().is_some() {
                            last_scan = Instant::now();
                        }
                    }
                }
            }
        }
    }
}

async fn log_scan_result(finder: &FaceFinder) {
    match finder.wait_for_scan().await {
        Some(Ok(summary)) => {
            info!(%summary, "Dataset scan finished");
            for failure in &summary.failures {
                warn!(path = %failure.path.display(), error = %failure.error, "File not indexed");
            }
        }
        Some(Err(e)) => error!(error = %e, "Dataset scan failed"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<DaemonArgs, String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        parse_arg_list(&args)
    }

    #[test]
    fn test_parse_flags() {
        let args = parse(&["--once", "--interval", "60", "-c", "/etc/facefind.toml"]).unwrap();
        assert!(args.once);
        assert_eq!(args.interval, Some(60));
        assert_eq!(args.config_path, Some(PathBuf::from("/etc/facefind.toml")));
    }

    #[test]
    fn test_flag_without_value_is_rejected() {
        assert!(parse(&["--interval"]).unwrap_err().contains("--interval"));
        assert!(parse(&["--once", "--config"]).unwrap_err().contains("--config"));
    }

    #[test]
    fn test_invalid_interval_is_rejected() {
        assert_eq!(parse(&["-i", "soon"]).unwrap_err(), "Invalid interval: soon");
        assert!(parse(&["--bogus"]).is_err());
    }
}
