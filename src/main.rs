mod output;

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agquota_core::config::{CacheCommand, Command, Config, Settings};
use agquota_core::discovery::DiscoveryReport;
use agquota_core::monitor::Monitor;
use agquota_core::scheduler::Scheduler;
use agquota_core::utils::format_bytes;

/// Output of `agquota diagnose`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Diagnosis {
    found: bool,
    port: Option<u16>,
    report: DiscoveryReport,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Config::parse_args();

    // Load settings
    let mut settings = Settings::load(cli.config.as_ref())?;
    settings.merge_cli(&cli);
    settings.validate();

    // Setup logging
    setup_logging(settings.system.debug_mode);

    let monitor = Arc::new(Monitor::from_settings(settings.clone()));
    match cli.command() {
        Command::Run { json } => run(monitor, &settings, json).await,
        Command::Status { json } => status(&monitor, &settings, json).await,
        Command::Diagnose => diagnose(&monitor).await,
        Command::Cache { action } => cache(&monitor, &settings, action).await,
    }
}

fn setup_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("agquota=debug,agquota_core=debug")
        } else {
            EnvFilter::new("agquota=info,agquota_core=info")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Restore the last view, then refresh on schedule until Ctrl-C
async fn run(monitor: Arc<Monitor>, settings: &Settings, json: bool) -> Result<()> {
    let mut rx = monitor.subscribe();
    if monitor.restore_from_cache() {
        output::print_snapshot(&rx.borrow_and_update(), &settings.status, json)?;
    }

    let scheduler = Scheduler::logging();
    monitor.start(&scheduler);

    loop {
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = rx.borrow_and_update().clone();
                output::print_snapshot(&snapshot, &settings.status, json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    scheduler.dispose();
    Ok(())
}

async fn status(monitor: &Monitor, settings: &Settings, json: bool) -> Result<()> {
    if !monitor.refresh().await? {
        let snapshot = monitor.current();
        bail!(
            "No quota data: {}",
            snapshot.last_error.as_deref().unwrap_or("unknown error")
        );
    }
    output::print_snapshot(&monitor.current(), &settings.status, json)
}

async fn diagnose(monitor: &Monitor) -> Result<()> {
    let discovery = monitor.discover().await;
    let diagnosis = Diagnosis {
        found: discovery.connection.is_some(),
        port: discovery.connection.as_ref().map(|c| c.port),
        report: discovery.report,
    };
    println!("{}", serde_json::to_string_pretty(&diagnosis)?);
    Ok(())
}

async fn cache(monitor: &Monitor, settings: &Settings, action: CacheCommand) -> Result<()> {
    match action {
        CacheCommand::Info { json } => {
            let info = monitor.cache_info().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print!("{}", output::cache_summary(&info));
            }
        }
        CacheCommand::Clean { keep } => {
            let keep = keep.unwrap_or(settings.cache.keep_count);
            let report = monitor.clean_cache(keep).await?;
            println!(
                "Deleted {} task(s), freed {}",
                report.deleted_count,
                format_bytes(report.freed_bytes)
            );
        }
    }
    Ok(())
}
