//! pubperf entry point.
//!
//! Wires the pieces together for one run: logging, CLI parsing, scenario
//! loading, the relay client, Ctrl-C handling through the shutdown token,
//! and the session itself. Session-establishment failures are the only
//! errors that reach this level; they are logged and turned into a non-zero
//! exit status.

use anyhow::{Context, Result};
use clap::Parser;
use pubperf::{
    cli::Args,
    logging,
    report::{ReportWriter, RunReport},
    scenario::Scenario,
    session::{PerfSession, SessionSettings, ShutdownToken},
    transport::LoopbackRelay,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.log_file.as_deref())
        .context("failed to initialize logging")?;

    info!("--------------------------------------------");
    info!("Starting pubperf {}", pubperf::VERSION);
    info!("  scenario file {}", args.scenario_file.display());
    info!("  connect uri   {}", args.connect_uri);
    info!("  endpoint      {}:{}", args.endpoint_id, args.instance_id);
    info!("  role          {}", args.role);
    info!("--------------------------------------------");

    let scenario = Scenario::load(&args.scenario_file)?;
    let relay = Arc::new(LoopbackRelay::new(Duration::from_secs(
        args.metrics_interval,
    )));

    let shutdown = ShutdownToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        });
    }

    let settings = SessionSettings::from(&args);
    let session = PerfSession::new(relay, scenario, settings, shutdown);

    match session.run().await {
        Ok((publishers, subscribers)) => {
            if let Some(path) = &args.output_file {
                let report = RunReport::new(args.role.to_string(), publishers, subscribers);
                ReportWriter::new(path).write(&report)?;
            }
            info!("pubperf run complete");
            Ok(())
        }
        Err(e) => {
            error!("session failed: {e:#}");
            Err(e)
        }
    }
}
