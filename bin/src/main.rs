#![allow(clippy::cognitive_complexity)]
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

mod cli;
mod trace;

use cli::Parser;
use config::CoordinationConfig;
use coordination::{
    CancellationToken, CoordinationClient, CoordinationError, CoordinationEvent, ElectionState,
};
use tokio::{runtime::Builder, signal, sync::broadcast, task::JoinHandle};
use tracing::*;
use tracing_futures::Instrument;

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// how often a leader re-checks that it still holds the seat
const LEADERSHIP_CHECK: Duration = Duration::from_secs(5);
/// pause before campaigning again after a failed campaign
const CAMPAIGN_RETRY: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.tether_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start tether"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let coordination_cfg = match &config.config_path {
        Some(path) => {
            debug!(?path, "parsing coordination config");
            CoordinationConfig::parse(path)?
        }
        None => {
            info!("no config path set, using default coordination config");
            CoordinationConfig::default()
        }
    };
    info!(
        backend_mode = ?coordination_cfg.backend_mode(),
        tether_id = %config.tether_id,
        "starting tether"
    );

    let client = CoordinationClient::from_config(coordination_cfg)?;
    client
        .connect()
        .await
        .context("failed to connect to coordination service")?;
    let lease = client.lease()?;
    info!(lease_id = %lease.id(), ttl_secs = lease.ttl().as_secs(), "session established");

    let token = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<Result<()>>> = Vec::new();
    tasks.push(tokio::spawn(
        log_events(client.subscribe(), token.clone()).instrument(info_span!("events")),
    ));
    if let Some(election) = config.election.clone() {
        let span = info_span!("election", %election);
        tasks.push(tokio::spawn(
            campaign(
                client.clone(),
                election,
                config.tether_id.clone(),
                token.clone(),
            )
            .instrument(span),
        ));
    }
    if let Some(key) = config.lock_key.clone() {
        let span = info_span!("locked_job", %key);
        tasks.push(tokio::spawn(
            locked_job(client.clone(), key, config.lock_interval(), token.clone()).instrument(span),
        ));
    }

    let shutdown = shutdown_signal(token.clone()).await;
    info!("shutting down");
    token.cancel();
    for task in tasks {
        if let Err(err) = flatten(task).await {
            error!(?err, "task exited with error");
        }
    }
    if let Some(election) = &config.election {
        if let Err(err) = client.election(election).resign().await {
            warn!(%election, error = %err, "failed to resign on shutdown");
        }
    }
    client.disconnect().await;
    shutdown
}

/// Log lease loss and recovery until shutdown.
async fn log_events(
    mut events: broadcast::Receiver<CoordinationEvent>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        match event {
            Ok(CoordinationEvent::LeaseLost { lease_id, cause }) => {
                warn!(%lease_id, %cause, "session lease lost, locks and leadership released")
            }
            Ok(CoordinationEvent::LeaseReconnect { lease, cause }) => {
                info!(lease_id = %lease.id(), %cause, "session lease re-established")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "coordination events dropped")
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Campaign for `election` until shutdown, campaigning again whenever
/// leadership is lost.
async fn campaign(
    client: CoordinationClient,
    election: String,
    id: String,
    token: CancellationToken,
) -> Result<()> {
    let manager = client.election(&election);
    let observer = manager.observer();
    let mut leader = observer.subscribe();

    while !token.is_cancelled() {
        match manager.campaign(&id, Some(token.child_token())).await {
            Ok(()) => info!(%id, "elected leader"),
            Err(err) if err.is_aborted() => break,
            Err(err) => {
                warn!(%id, error = %err, "campaign failed");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(CAMPAIGN_RETRY) => continue,
                }
            }
        }

        while manager.state() == ElectionState::Leading {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                changed = leader.changed() => {
                    changed.map_err(|err| anyhow!(err))?;
                    let current = leader.borrow_and_update().clone();
                    info!(leader = ?current, status = ?observer.status(), "observed leader change");
                }
                _ = tokio::time::sleep(LEADERSHIP_CHECK) => {}
            }
        }
        if !token.is_cancelled() {
            warn!(%id, "leadership lost, campaigning again");
        }
    }
    Ok(())
}

/// Run a short job under `key` every `interval` until shutdown.
async fn locked_job(
    client: CoordinationClient,
    key: String,
    interval: Duration,
    token: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let job = client.with_lock(&key, |handle| async move {
            info!(
                lock = handle.name(),
                lease_id = %handle.lease_id(),
                ttl_secs = handle.ttl().as_secs(),
                "holding lock"
            );
            Ok::<_, CoordinationError>(())
        });
        let res = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = job => res,
        };
        if let Err(err) = res {
            warn!(error = %err, "locked job failed");
        }
    }
}

async fn flatten<T>(handle: JoinHandle<Result<T, anyhow::Error>>) -> Result<T, anyhow::Error> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err),
        Err(err) => Err(anyhow!(err)),
    }
}

#[cfg(unix)]
async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let ret = tokio::select! {
        ret = signal::ctrl_c() => ret.map_err(|err| anyhow!(err)),
        _ = terminate.recv() => Ok(()),
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    ret
}

#[cfg(not(unix))]
async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = tokio::select! {
        ret = signal::ctrl_c() => ret.map_err(|err| anyhow!(err)),
        _ = token.cancelled() => Ok(()),
    };
    token.cancel();
    ret
}
