use std::sync::Arc;

use anyhow::Context;
use arrayguard::{
    config::{StorageConfig, read_config_file},
    lifecycle::AgentManager,
    remote::{OpenSshFactory, pool::ConnectionPool},
    storage::{AlertStore, create_store},
    sync::SyncEngine,
};
use clap::Parser;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Deploy and start the agent on hosts where it is not running
    #[arg(long)]
    supervise_agents: bool,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("arrayguard", LevelFilter::TRACE),
        ("arrayguard_hub", LevelFilter::TRACE),
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
    let hub_config = config.hub.context("configuration has no \"hub\" section")?;

    let pool = ConnectionPool::new(hub_config.pool.clone(), Box::new(OpenSshFactory));
    for host in &hub_config.hosts {
        pool.add_host(host.clone()).await;
    }
    info!("managing {} hosts", hub_config.hosts.len());

    let store: Arc<dyn AlertStore> = Arc::from(create_store(hub_config.storage.as_ref()).await?);

    let (alert_tx, _) = broadcast::channel(256);
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        store.clone(),
        alert_tx.clone(),
        hub_config.sync.clone(),
    ));

    let manager = AgentManager::new(pool.clone(), hub_config.agent.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bring remote agents up before the first sync pass.
    if args.supervise_agents {
        supervise_agents(&manager, &pool).await;
    }

    let reaper = pool.spawn_reaper(shutdown_rx.clone());
    let sync_task = tokio::spawn(engine.clone().run(shutdown_rx.clone()));

    // Stand-in for the out-of-scope UI: log every broadcast alert.
    let mut alert_rx = alert_tx.subscribe();
    let subscriber_task = tokio::spawn(async move {
        loop {
            match alert_rx.recv().await {
                Ok(event) => {
                    info!(
                        "alert: [{}] {} {}: {}",
                        event.host_id,
                        event.envelope.level,
                        event.envelope.observer_name,
                        event.envelope.message
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("alert subscriber lagged, skipped {skipped} alerts");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Retention enforcement for the persistent store.
    let retention_task = if let Some(StorageConfig::Sqlite { retention_days, .. }) =
        &hub_config.storage
    {
        let store = store.clone();
        let retention_days = *retention_days;
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff =
                            chrono::Utc::now() - chrono::Duration::days(retention_days as i64);
                        match store.cleanup_old(cutoff).await {
                            Ok(deleted) if deleted > 0 => {
                                info!("retention cleanup deleted {deleted} alerts");
                            }
                            Ok(_) => {}
                            Err(e) => error!("retention cleanup failed: {e}"),
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("termination signal received, shutting down");
    let _ = shutdown_tx.send(true);

    let _ = sync_task.await;
    let _ = reaper.await;
    if let Some(task) = retention_task {
        let _ = task.await;
    }
    subscriber_task.abort();

    pool.close_all().await;
    if let Err(e) = store.close().await {
        error!("error closing store: {e}");
    }

    Ok(())
}

/// One supervision pass: deploy where missing, start where stopped. Failures
/// are contained per host.
async fn supervise_agents(manager: &AgentManager, pool: &ConnectionPool) {
    for host_id in pool.host_ids().await {
        let status = match manager.status(&host_id).await {
            Ok(status) => status,
            Err(e) => {
                warn!("cannot query agent status on {host_id}: {e:#}");
                continue;
            }
        };

        if status.running {
            trace!("{host_id}: agent already running (pid {:?})", status.pid);
            continue;
        }

        if !status.deployed {
            if let Err(e) = manager.deploy(&host_id).await {
                error!("{e:#}");
                continue;
            }
        }

        match manager.start(&host_id).await {
            Ok(pid) => info!("{host_id}: agent started (pid {pid})"),
            Err(e) => error!("{e:#}"),
        }
    }
}
