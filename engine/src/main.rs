//! kindling drives storms of object mutations against a cluster control
//! plane and evaluates alerting rules afterwards.
#![deny(missing_docs)]
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::DateTime;
use clap::{Args, Parser, Subcommand};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kindling_engine::alert::{AlertManager, JobWindow};
use kindling_engine::config::Config;
use kindling_engine::error::{Error, RC_ERROR};
use kindling_engine::index::{Indexer, LocalIndexer};
use kindling_engine::prom::HttpPromClient;
use kindling_engine::runner::Runner;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Execute the jobs of a workload configuration
    Run(RunOpts),
    /// Evaluate an alert profile over a fixed time window
    CheckAlerts(CheckAlertsOpts),
}

#[derive(Args, Debug)]
struct RunOpts {
    /// Path to the workload configuration.
    #[arg(short, long, env = "KINDLING_CONFIG")]
    config: PathBuf,

    /// Unique id labeling everything this run creates. Random when omitted.
    #[arg(long, env = "KINDLING_UUID")]
    uuid: Option<String>,
}

#[derive(Args, Debug)]
struct CheckAlertsOpts {
    /// Path to the alert profile.
    #[arg(short = 'a', long, env = "KINDLING_ALERT_PROFILE")]
    alert_profile: PathBuf,

    /// Metrics backend URL.
    #[arg(short = 'u', long, env = "KINDLING_PROMETHEUS_URL")]
    prometheus_url: String,

    /// Range query step.
    #[arg(long, default_value = "30s")]
    step: humantime::Duration,

    /// Window start, unix seconds.
    #[arg(long)]
    start: i64,

    /// Window end, unix seconds.
    #[arg(long)]
    end: i64,

    /// Id attached to emitted alert documents.
    #[arg(long, default_value = "check-alerts")]
    uuid: String,

    /// Directory to index alert documents into.
    #[arg(long)]
    indexer_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = kindling_common::telemetry::init_tracing() {
        eprintln!("failed to initialize tracing: {err:#}");
        std::process::exit(RC_ERROR);
    }
    let args = Cli::parse();
    let code = match args.command {
        Command::Run(opts) => exit_code(run(opts).await),
        Command::CheckAlerts(opts) => exit_code(check_alerts(opts).await),
    };
    std::process::exit(code);
}

/// The single place fatal errors become process exit codes.
fn exit_code(result: Result<i32, Error>) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            err.exit_code()
        }
    }
}

async fn run(opts: RunOpts) -> Result<i32, Error> {
    let config = Config::load(&opts.config)?;
    let base_dir = opts
        .config
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let client = Client::try_default().await.map_err(Error::from)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("interrupt received, cancelling run");
        signal_cancel.cancel();
    });

    let runner = Runner::new(config, base_dir, opts.uuid, client, cancel);
    let report = runner.run().await?;
    info!(
        failures = report.failures,
        unmet = report.unmet,
        error_alerts = report.error_alerts,
        "run finished"
    );
    Ok(report.exit_code())
}

async fn check_alerts(opts: CheckAlertsOpts) -> Result<i32, Error> {
    let profile = std::fs::read_to_string(&opts.alert_profile).map_err(|err| {
        Error::Config(format!("reading {}: {err}", opts.alert_profile.display()))
    })?;
    let prom = HttpPromClient::new(&opts.prometheus_url, Duration::from_secs(15))
        .map_err(Error::Other)?;
    let manager = AlertManager::new(&profile, opts.uuid, Box::new(prom), opts.step.into())?;
    let indexer: Option<Box<dyn Indexer>> = match opts.indexer_dir {
        Some(dir) => Some(Box::new(LocalIndexer::new(dir).map_err(Error::Other)?)),
        None => None,
    };
    let window = JobWindow {
        name: None,
        start: DateTime::from_timestamp(opts.start, 0)
            .ok_or_else(|| Error::Config(format!("invalid start timestamp {}", opts.start)))?,
        end: DateTime::from_timestamp(opts.end, 0)
            .ok_or_else(|| Error::Config(format!("invalid end timestamp {}", opts.end)))?,
        churn_start: None,
        churn_end: None,
    };
    let error_alerts = manager.evaluate(&window, indexer.as_deref()).await?;
    Ok(if error_alerts > 0 { RC_ERROR } else { 0 })
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
