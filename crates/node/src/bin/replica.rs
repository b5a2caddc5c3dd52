//! threechain replica binary.
//!
//! ```bash
//! threechain-replica --config replica.toml --idx 0
//! ```
//!
//! Configuration errors exit non-zero; SIGINT/SIGTERM shut down cleanly.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use threechain_consensus::RoundRobinPacemaker;
use threechain_fetcher::FetchConfig;
use threechain_node::{
    Cli, ClientGateway, FileConfig, PacemakerKind, PeerNetwork, ReplicaOptions,
    ReplicaStateMachine, ReplicaTimings, Runner, ShutdownHandle, TimerManager, VerifyPool,
    EVENT_QUEUE,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let file = FileConfig::load(&cli.config)?;
    let options = ReplicaOptions::resolve(cli, file).context("invalid configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("tokio runtime")?
        .block_on(run(options))
}

async fn run(options: ReplicaOptions) -> anyhow::Result<()> {
    let replicas = Arc::new(options.replicas.clone());
    let expected_key = replicas
        .public_key(options.idx)
        .expect("idx validated by config");
    anyhow::ensure!(
        options.privkey.public_key() == expected_key,
        "private key does not match the configured public key for idx {}",
        options.idx.0
    );

    info!(
        idx = options.idx.0,
        n = replicas.len(),
        blk_size = options.blk_size,
        "** starting the system with parameters **"
    );

    let pmaker = match options.pacemaker {
        PacemakerKind::RoundRobin => Box::new(RoundRobinPacemaker::new(
            options.idx,
            replicas.len() as u16,
            options.parent_limit,
        )),
    };

    let state = ReplicaStateMachine::new(
        options.idx,
        options.privkey.clone(),
        options.replicas.clone(),
        options.blk_size,
        pmaker,
        FetchConfig::default(),
        ReplicaTimings {
            impeach_timeout: options.impeach_timeout,
            stat_period: options.stat_period,
            fetch_tick: ReplicaTimings::default().fetch_tick,
        },
    );

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let timers = TimerManager::new(event_tx.clone());
    let verify = VerifyPool::new(options.nworker, replicas.clone(), event_tx.clone())
        .context("building verification pool")?;
    let peers = PeerNetwork::spawn(options.idx, replicas.clone(), event_tx.clone())
        .await
        .context("starting peer network")?;
    let clients = ClientGateway::spawn(options.cport, event_tx.clone())
        .await
        .context("starting client listener")?;

    let (shutdown, shutdown_rx) = ShutdownHandle::new();
    let runner = Runner::new(state, event_rx, timers, peers, clients, verify);
    let loop_task = tokio::spawn(runner.run(shutdown_rx));

    let mut sigint = signal(SignalKind::interrupt()).context("sigint handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("sigterm handler")?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT"),
        _ = sigterm.recv() => info!("SIGTERM"),
    }

    shutdown.shutdown();
    let _ = loop_task.await;
    Ok(())
}
