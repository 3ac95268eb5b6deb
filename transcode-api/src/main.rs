use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;

use common_health::HealthRegistry;
use common_redis::RedisBus;
use common_serve_metrics::setup_metrics_routes;
use conveyor_core::storage::{FileBackend, S3Backend, StorageRouter};
use conveyor_core::{AdmissionLimits, JobManager};

mod auth;
mod config;
mod errors;
mod handlers;
mod limits;
mod router;

use auth::PgKeyStore;
use config::Config;
use limits::{RateGate, RateSettings};
use router::AppState;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
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
    let manager = Arc::new(JobManager::from_pool(pool.clone()));

    let bus = Arc::new(
        RedisBus::new(config.redis_url.clone())
            .await
            .expect("failed to connect to redis"),
    );

    let storage_roots = config.storage_roots();
    let s3 = if config.s3_enabled {
        Some(S3Backend::from_env(config.s3_endpoint_url.as_deref()).await)
    } else {
        None
    };
    let storage = Arc::new(StorageRouter::new(
        FileBackend::new(storage_roots.clone()),
        s3,
    ));

    let limits = Arc::new(AdmissionLimits {
        max_input_bytes: config.max_input_bytes,
        max_bitrate_bps: config.max_bitrate_bps,
        max_width: config.max_width,
        max_height: config.max_height,
        local_roots: storage_roots,
        s3_enabled: config.s3_enabled,
        max_attempts: config.max_attempts,
    });

    let gate = Arc::new(RateGate::new(RateSettings {
        convert_per_minute: config.rate_convert_per_minute,
        analyze_per_minute: config.rate_analyze_per_minute,
        stream_per_minute: config.rate_stream_per_minute,
        query_per_minute: config.rate_query_per_minute,
    }));

    let liveness = HealthRegistry::new("liveness");

    let state = AppState {
        manager,
        storage,
        bus,
        keys: Arc::new(PgKeyStore::new(pool)),
        gate,
        limits,
        liveness,
    };

    let app = setup_metrics_routes(router::add_routes(
        Router::new(),
        state,
        config.max_body_size,
    ));

    let bind = config.bind();
    tracing::info!("listening on {}", bind);
    listen(app, bind).await
}
