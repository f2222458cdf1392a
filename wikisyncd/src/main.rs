use std::process::ExitCode;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use wikisyncd::daemon::{DaemonConfig, DaemonRuntime};
use wikisyncd::signals::ServiceSignals;
use wikisyncd::sync::engine::{SyncEngine, read_status};
use wikisyncd::sync::state::RunOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Service,
    Sync,
    Status,
    Cleanup,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Service;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--service" => mode = CliMode::Service,
            "--sync" => mode = CliMode::Sync,
            "--status" => mode = CliMode::Status,
            "--cleanup" => mode = CliMode::Cleanup,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = std::env::var("WIKISYNC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: wikisyncd [--service | --sync | --status | --cleanup]");
        println!("  --service  Run scheduled syncs until stopped (default)");
        println!("  --sync     Run one sync now and print the run record");
        println!("  --status   Print latest versions, last run and disk usage");
        println!("  --cleanup  Apply the retention policy and print what was removed");
        return Ok(ExitCode::SUCCESS);
    }

    init_tracing();
    let config = DaemonConfig::from_env()?;
    let signals = ServiceSignals::install().context("failed to register signal handlers")?;

    match mode {
        CliMode::Status => {
            let report = read_status(&config.engine)
                .await
                .context("failed to read status")?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        CliMode::Sync => {
            let engine = SyncEngine::open(config.engine, signals.shutdown()).await?;
            let run = engine.sync().await?;
            print_json(&run)?;
            Ok(match run.outcome {
                RunOutcome::Succeeded | RunOutcome::SkippedInsufficientResources => ExitCode::SUCCESS,
                RunOutcome::PartialFailure | RunOutcome::Cancelled => ExitCode::from(2),
                RunOutcome::Failed => ExitCode::FAILURE,
            })
        }
        CliMode::Cleanup => {
            let engine = SyncEngine::open(config.engine, signals.shutdown()).await?;
            let report = engine.cleanup().await?;
            print_json(&report)?;
            Ok(if report.failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        CliMode::Service | CliMode::Help => {
            let daemon = DaemonRuntime::bootstrap(config, signals).await?;
            daemon.run().await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
