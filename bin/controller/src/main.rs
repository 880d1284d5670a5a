//! dockyard controller.
//!
//! Runs the job and replication controllers, the TTL collector and the
//! CronJob scheduler against in-memory stores until interrupted.

mod config;

use crate::config::ControllerConfig;
use dockyard_jobs::{
    Controller, Dispatcher, HandlerRegistry, Job, JobLifecycle, JobReconciler, JobType,
    TtlCollector, watch_keys,
};
use dockyard_registry::{
    InMemoryRegistry, JobStore, LocalSigner, ReplicateHandler, Replication,
    ReplicationReconciler, ReplicationStore, ScanHandler, SignHandler, StaticScanner,
    SynchronizeHandler, replication_triggers,
};
use dockyard_scheduler::{CronJob, CronJobScheduler};
use dockyard_store::MemoryStore;
use dockyard_workflow::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ControllerConfig::from_env().expect("failed to load configuration");
    tracing::info!(?config, "Loaded configuration");

    let jobs: Arc<JobStore> = Arc::new(MemoryStore::<Job>::new());
    let replications: Arc<ReplicationStore> = Arc::new(MemoryStore::<Replication>::new());
    let cron_jobs = Arc::new(MemoryStore::<CronJob>::new());
    let lifecycle = JobLifecycle::new(Arc::clone(&jobs));

    let registry_client = Arc::new(InMemoryRegistry::new());
    let signer = Arc::new(LocalSigner::new());
    let scanner = Arc::new(StaticScanner::new());

    let pool = Arc::new(WorkerPool::new(config.scan.queue_capacity));
    pool.start(config.scan.workers)
        .expect("failed to start scan workers");

    let handlers = HandlerRegistry::builder()
        .register(
            JobType::Synchronize,
            Arc::new(SynchronizeHandler::new(
                Arc::clone(&replications),
                registry_client.clone(),
            )),
        )
        .register(
            JobType::Replicate,
            Arc::new(ReplicateHandler::new(
                Arc::clone(&replications),
                registry_client.clone(),
            )),
        )
        .register(
            JobType::Sign,
            Arc::new(SignHandler::new(
                Arc::clone(&replications),
                Arc::clone(&jobs),
                signer,
            )),
        )
        .register(
            JobType::Scan,
            Arc::new(ScanHandler::new(
                Arc::clone(&replications),
                scanner,
                Arc::clone(&pool),
                lifecycle.clone(),
            )),
        )
        .build()
        .expect("failed to build handler registry");
    handlers
        .ensure_complete(&JobType::ALL)
        .expect("a job type has no handler");

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(handlers),
        lifecycle.clone(),
        config.max_in_flight_per_target,
    ));
    let requeue_delay = Duration::from_secs(config.requeue_delay_seconds);
    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    // Job controller
    let job_triggers = watch_keys::<Job, _>(jobs.as_ref())
        .await
        .expect("failed to watch jobs");
    let job_controller = Controller::new(
        Arc::new(JobReconciler::new(Arc::clone(&jobs), dispatcher)),
        requeue_delay,
    );
    let token = shutdown.clone();
    tasks.spawn(async move { job_controller.run(job_triggers, token).await });

    // Replication controller
    let replication_keys = replication_triggers(replications.as_ref(), jobs.as_ref())
        .await
        .expect("failed to watch replications");
    let replication_controller = Controller::new(
        Arc::new(ReplicationReconciler::new(
            Arc::clone(&replications),
            lifecycle.clone(),
        )),
        requeue_delay,
    );
    let token = shutdown.clone();
    tasks.spawn(async move { replication_controller.run(replication_keys, token).await });

    // TTL collector
    let collector = TtlCollector::new(Arc::clone(&jobs));
    let interval = Duration::from_secs(config.ttl_sweep_interval_seconds);
    let token = shutdown.clone();
    tasks.spawn(async move { collector.run(interval, token).await });

    // CronJob scheduler
    let scheduler = CronJobScheduler::new(cron_jobs, lifecycle);
    let interval = Duration::from_secs(config.cron_interval_seconds);
    let token = shutdown.clone();
    tasks.spawn(async move { scheduler.run(interval, token).await });

    tracing::info!("Controller running");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Loop ended abnormally");
        }
    }
    pool.stop().await;
    tracing::info!("Controller stopped");
}
