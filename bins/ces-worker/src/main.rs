mod archive;
mod classifier;
mod config;
mod demux;
mod docker;
mod engine;
mod flow;
mod health;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use ces_common::redis::RedisBroker;
use ces_common::{Publisher, QueueError, ReliableQueue};
use futures_util::future::join_all;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;
use crate::docker::DockerClient;
use crate::engine::ContainerEngine;
use crate::flow::ExecutionFlow;
use crate::storage::{ArtifactStore, LocalArtifactStore};

/// Back-off after the request queue fails to deliver
const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("CES Worker booting...");
    let config = Arc::new(WorkerConfig::from_env());

    // Refuse to start without a reachable daemon
    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerClient::new(&config.docker_socket));
    let ping = engine.ping().await.with_context(|| {
        format!(
            "Container engine unreachable at {}",
            config.docker_socket.display()
        )
    })?;
    if !ping.is_success() {
        bail!("Container engine refused ping with status {}", ping.status);
    }
    info!(socket = %config.docker_socket.display(), "Connected to container engine");

    let store = LocalArtifactStore::new(&config.storage.root);
    store
        .create_bucket(&config.storage.bucket)
        .await
        .context("Failed to prepare artifact bucket")?;
    tokio::fs::create_dir_all(&config.storage.scratch_dir)
        .await
        .context("Failed to prepare scratch directory")?;
    let store: Arc<dyn ArtifactStore> = Arc::new(store);

    let broker = Arc::new(
        RedisBroker::connect(&config.queue.redis_url)
            .await
            .context("Failed to connect to Redis")?,
    );
    info!("Connected to Redis: {}", config.queue.redis_url);

    let requests = Arc::new(ReliableQueue::consume(
        broker.clone(),
        &config.queue.request_queue,
        config.queue.request_prefetch,
    ));
    let responses = Arc::new(Publisher::new(broker, &config.queue.response_queue));

    let flow = Arc::new(ExecutionFlow::new(
        config.clone(),
        engine.clone(),
        requests.clone(),
        responses,
        store,
    ));

    let shutdown = CancellationToken::new();
    let health = tokio::spawn(health::serve(
        config.health_port,
        engine,
        shutdown.clone(),
    ));

    let loops: Vec<_> = (0..config.concurrency)
        .map(|index| tokio::spawn(worker_loop(index, flow.clone(), shutdown.clone())))
        .collect();
    info!(
        concurrency = config.concurrency,
        prefetch = config.queue.request_prefetch,
        queue = %config.queue.request_queue,
        "Listening for execution requests"
    );

    // Setup graceful shutdown
    match signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal, finishing in-flight executions..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }
    shutdown.cancel();

    for result in join_all(loops).await {
        if let Err(e) = result {
            error!(error = %e, "Worker loop aborted");
        }
    }
    requests
        .close()
        .await
        .context("Failed to hand back buffered requests")?;

    match health.await {
        Ok(Err(e)) => warn!(error = %e, "Health endpoint stopped with error"),
        Err(e) => warn!(error = %e, "Health endpoint task aborted"),
        Ok(Ok(())) => {}
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Pull, process and settle one request at a time until shutdown.
async fn worker_loop(index: usize, flow: Arc<ExecutionFlow>, shutdown: CancellationToken) {
    info!(worker = index, "Worker loop started");

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = flow.receive() => received,
        };

        match received {
            Ok(message) => flow.handle(message).await,
            Err(QueueError::Closed) => break,
            Err(e) => {
                error!(worker = index, error = %e, "Failed to receive request");
                tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
            }
        }
    }

    info!(worker = index, "Worker loop stopped");
}
