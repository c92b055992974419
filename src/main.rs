use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::lib::{
    cache::VolumeCache,
    config::WorkerConfig,
    features::FeatureRegistry,
    gc::GarbageCollector,
    queue::{HttpQueue, Queue},
    tasks::docker::{ContainerRuntime, DockerClient},
    worker::{
        api::TaskServer,
        listener::TaskListener,
        runtime::Runtime,
        secrets::NoPrivateKey,
        shutdown::{drain, wait_for_termination},
        stats::{DiskProbe, SysinfoDiskProbe},
    },
};

mod lib {
    pub mod cache;
    pub mod config;
    pub mod error;
    pub mod features;
    pub mod gc;
    pub mod queue;
    pub mod tasks;
    pub mod worker;

    #[cfg(test)]
    pub mod testing;
}

const ACCESS_TOKEN_ENV: &str = "DOCKWORKER_ACCESS_TOKEN";

/// Claims tasks from the queue and runs each one in a docker container.
#[derive(Debug, Parser)]
#[command(name = "dockworker", version)]
struct Args {
    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of tasks to run concurrently.
    #[arg(long)]
    capacity: Option<usize>,

    #[arg(long)]
    worker_id: Option<String>,

    #[arg(long)]
    worker_type: Option<String>,

    #[arg(long)]
    worker_group: Option<String>,

    #[arg(long)]
    provisioner_id: Option<String>,

    /// Address of the local status API.
    #[arg(long)]
    api_addr: Option<String>,
}

/// Defaults, then the config file, then the environment, then flags.
fn load_config(args: &Args) -> anyhow::Result<WorkerConfig> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };

    if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
        config.queue.access_token = Some(token);
    }

    if let Some(capacity) = args.capacity {
        config.capacity = capacity;
    }
    if let Some(worker_id) = &args.worker_id {
        config.identity.worker_id = worker_id.clone();
    }
    if let Some(worker_type) = &args.worker_type {
        config.identity.worker_type = worker_type.clone();
    }
    if let Some(worker_group) = &args.worker_group {
        config.identity.worker_group = worker_group.clone();
    }
    if let Some(provisioner_id) = &args.provisioner_id {
        config.identity.provisioner_id = provisioner_id.clone();
    }
    if let Some(api_addr) = &args.api_addr {
        config.api_addr = api_addr.clone();
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Ok(config.finalize(cpus)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = load_config(&args).context("failed to load configuration")?;
    tracing::info!(
        worker_id = %config.identity.worker_id,
        worker_type = %config.identity.worker_type,
        capacity = config.capacity,
        isolated_containers = config.isolated_containers,
        "starting worker"
    );

    let docker: Arc<dyn ContainerRuntime> =
        Arc::new(DockerClient::new().context("failed to connect to docker")?);
    let queue: Arc<dyn Queue> = Arc::new(HttpQueue::new(&config.queue, config.identity.clone()));
    let disk: Arc<dyn DiskProbe> = Arc::new(SysinfoDiskProbe::new(
        config.capacity_management.docker_volume.clone(),
    ));

    let volume_cache = Arc::new(VolumeCache::new(config.cache_dir.clone()));
    let restored = volume_cache
        .load_existing()
        .context("failed to load volume cache")?;
    tracing::info!(restored, cache_dir = %config.cache_dir.display(), "volume cache ready");

    let gc = Arc::new(GarbageCollector::new(
        &config.garbage_collection,
        docker.clone(),
        disk.clone(),
        config.capacity_management.diskspace_threshold,
    ));
    gc.add_manager(volume_cache.clone());

    let shutdown = config.shutdown.clone();
    let poll_interval = config.poll_interval();
    let gc_interval = config.gc_interval();
    let api_addr = config.api_addr.clone();

    let runtime = Arc::new(Runtime {
        config,
        queue,
        docker,
        volume_cache,
        gc: gc.clone(),
        decryptor: Arc::new(NoPrivateKey),
        disk,
        features: FeatureRegistry::standard(),
    });

    let stop = CancellationToken::new();
    let gc_loop = gc.spawn(gc_interval, stop.clone());
    let listener = TaskListener::new(runtime);
    let poll = listener.schedule_task_poll(poll_interval);
    let api = tokio::spawn(TaskServer::new(listener.clone(), &api_addr).start_server(stop.clone()));

    let cause = wait_for_termination(&shutdown).await;
    tracing::warn!(%cause, "shutting down");

    let drained = drain(&listener, Duration::from_millis(shutdown.grace_ms)).await;
    listener.close();
    stop.cancel();

    let _ = poll.await;
    match api.await {
        Ok(Err(e)) => tracing::error!(error = %e, "status api failed"),
        Err(e) => tracing::error!(error = %e, "status api task panicked"),
        Ok(Ok(())) => {}
    }
    let _ = gc_loop.await;
    // Pick up containers from the runs that just finished.
    gc.sweep().await;

    if !drained {
        tracing::warn!("exiting with tasks still running");
    }
    tracing::info!("worker stopped");
    Ok(())
}
