use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};

use common_health::HealthRegistry;
use common_redis::RedisBus;
use common_serve_metrics::setup_metrics_routes;
use conveyor_core::storage::{FileBackend, S3Backend, StorageRouter};
use conveyor_core::{QueueWorker, RetryPolicy};

mod config;
mod error;
mod invoker;
mod worker;

use config::Config;
use invoker::Invoker;
use worker::JobWorker;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

fn worker_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_owned());
    format!("{}-{}", host, std::process::id())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let pool = common_database::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to create postgres pool");
    let queue = Arc::new(QueueWorker::from_pool(pool, &worker_name()));

    let bus = Arc::new(
        RedisBus::new(config.redis_url.clone())
            .await
            .expect("failed to connect to redis"),
    );

    let s3 = if config.s3_enabled {
        Some(S3Backend::from_env(config.s3_endpoint_url.as_deref()).await)
    } else {
        None
    };
    let storage = Arc::new(StorageRouter::new(
        FileBackend::new(config.storage_roots()),
        s3,
    ));

    let invoker = Invoker {
        ffmpeg: PathBuf::from(&config.ffmpeg_path),
        ffprobe: PathBuf::from(&config.ffprobe_path),
        wall_clock: Duration::from_secs(config.transcode_wall_clock_seconds),
        inactivity: Duration::from_secs(config.transcode_inactivity_seconds),
        grace: Duration::from_secs(config.cancel_grace_seconds),
    };

    // Probe hardware capabilities once, up front; per-job selection reads
    // the cache.
    let caps = invoker::cached_encoder_caps(&invoker.ffmpeg).await;
    tracing::info!(
        "encoder probe done (h264 -> {:?})",
        caps.select("h264")
    );

    let retry_policy = RetryPolicy::build(
        2,
        Duration::from_secs(config.retry_initial_interval_seconds),
    )
    .maximum_interval(Duration::from_secs(config.retry_maximum_interval_seconds))
    .provide();

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker_loop", config.lease_ttl() * 2)
        .await;

    let worker = JobWorker::new(
        queue,
        storage,
        bus,
        invoker,
        PathBuf::from(&config.scratch_dir),
        config.poll_interval(),
        config.lease_ttl(),
        config.progress_debounce(),
        config.max_concurrent_jobs,
        retry_policy,
        worker_liveness,
    );

    let registry = liveness.clone();
    let app = setup_metrics_routes(Router::new().route(
        "/_liveness",
        get(move || {
            let registry = registry.clone();
            async move { registry.get_status() }
        }),
    ));
    let http_server = Box::pin(listen(app, config.bind()));
    let worker_loop = Box::pin(async move { worker.run().await });

    match select(http_server, worker_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start transcode-worker http server, {}", e),
        },
        Either::Right((worker_result, _)) => match worker_result {
            Ok(_) => {}
            Err(e) => tracing::error!("transcode-worker loop exited, {}", e),
        },
    };

    Ok(())
}
