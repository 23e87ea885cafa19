//! cadence daemon: drives the batch engine against the in-memory cluster.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cd_core::clock::{Clock, SystemClock};
use cd_core::config::{expand_home, Config, ConfigSource};
use cd_daemon::daemon::Daemon;
use cd_daemon::income::IncomeLog;
use cd_daemon::sim::SimCluster;
use cd_telemetry::logging::LogFormat;
use clap::Parser;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// cadence -- batch scheduling and fleet allocation daemon.
#[derive(Parser)]
#[command(name = "cadence", version, about)]
struct Cli {
    /// Config file. Defaults to $CADENCE_CONFIG, then ~/.cadence/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run exactly one cycle, then exit.
    #[arg(long)]
    once: bool,

    /// Log one JSON object per line.
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let path = cli
        .config
        .or_else(|| std::env::var_os("CADENCE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(Config::default_path);
    let source = ConfigSource::new(path);

    if cli.print_config {
        println!("{}", source.current().to_toml()?);
        return Ok(());
    }

    let general = &source.current().general;
    cd_telemetry::logging::init(
        "cadence",
        &general.log_level,
        LogFormat::from_json_flag(cli.json_logs || general.json_logs),
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(source, cli.once))
}

async fn run(source: ConfigSource, once: bool) -> Result<()> {
    let config = source.current().clone();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sim = Arc::new(SimCluster::demo(
        clock.clone(),
        config.operations.clone(),
        &config.fleet.primary_node,
    ));
    let log = IncomeLog::new(expand_home(&config.income.log_path));

    let mut daemon = Daemon::new(sim.clone(), sim, clock, source).with_income_log(log)?;
    if once {
        daemon.set_one_shot(true);
    }

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("ctrl-c received, stopping after the current cycle");
                shutdown.trigger();
            }
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    let cycles = daemon.run().await?;
    info!(cycles, "cadence exiting");
    Ok(())
}
