use anyhow::Context;
use arrayguard::{
    config::read_config_file, observers::build_observers, reporter::Reporter, scheduler::Scheduler,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Evaluate observers but do not write to any sink
    #[arg(long)]
    dry_run: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("arrayguard", LevelFilter::TRACE),
        ("arrayguard_agent", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();

    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    let agent_config = config
        .agent
        .context("configuration has no \"agent\" section")?;

    let reporter = Reporter::new(&agent_config.reporter, args.dry_run);
    let mut scheduler = Scheduler::new(&agent_config, reporter);

    for observer in build_observers(&agent_config.observers) {
        scheduler.register(observer);
    }

    if scheduler.observer_count() == 0 {
        warn!("no observers enabled - the agent will idle");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("termination signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!("failed to listen for shutdown signal: {e}"),
        }
    });

    scheduler.run(shutdown_rx).await;

    Ok(())
}
