use std::time::Duration;

use axum::{routing::get, Router};
use chrono::Duration as ChronoDuration;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tokio::sync::Semaphore;
use tracing::{error, info};

use common_health::{HealthHandle, HealthRegistry};
use common_serve_metrics::setup_metrics_routes;
use conveyor_core::{Janitor, JanitorSettings};

mod config;

use config::Config;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

/// One full cleanup pass. Each phase is independent; a failure in one is
/// logged and the rest still run.
async fn cleanup(janitor: &Janitor) {
    match janitor.reset_stalled().await {
        Ok(reset) if reset > 0 => info!("returned {} stalled jobs to the queue", reset),
        Ok(_) => {}
        Err(err) => error!("failed to reset stalled jobs: {}", err),
    }

    match janitor.dead_letter_poison_pills().await {
        Ok(dead) if dead > 0 => info!("dead-lettered {} poison-pill jobs", dead),
        Ok(_) => {}
        Err(err) => error!("failed to dead-letter poison pills: {}", err),
    }

    match janitor.sweep_expired().await {
        Ok(swept) if swept > 0 => info!("swept {} expired jobs", swept),
        Ok(_) => {}
        Err(err) => error!("failed to sweep expired jobs: {}", err),
    }

    if let Err(err) = janitor.reset_stalled_deliveries().await {
        error!("failed to reset stalled deliveries: {}", err);
    }

    if let Err(err) = janitor.purge_finished_deliveries().await {
        error!("failed to purge finished deliveries: {}", err);
    }

    match janitor.waiting_jobs().await {
        Ok(depth) => metrics::gauge!("queue_depth").set(depth as f64),
        Err(err) => error!("failed to measure queue depth: {}", err),
    }
}

async fn cleanup_loop(janitor: Janitor, interval_secs: u64, liveness: HealthHandle) {
    let semaphore = Semaphore::new(1);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));

    loop {
        let _permit = semaphore.acquire().await;
        interval.tick().await;
        liveness.report_healthy().await;
        cleanup(&janitor).await;
        drop(_permit);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let settings = JanitorSettings {
        stalled_after: ChronoDuration::seconds(config.stalled_after_seconds),
        retention: ChronoDuration::days(config.retention_days),
        max_janitor_touches: config.max_janitor_touches,
        delivery_stalled_after: ChronoDuration::seconds(config.delivery_stalled_after_seconds),
        delivery_retention: ChronoDuration::days(config.delivery_retention_days),
    };
    let pool = common_database::get_pool(&config.database_url, config.max_pg_connections)
        .await
        .expect("failed to create postgres pool");
    let janitor = Janitor::from_pool(pool, settings);

    // The janitor owns schema migrations for the whole fabric.
    janitor.run_migrations().await;

    let liveness = HealthRegistry::new("liveness");
    let cleanup_liveness = liveness
        .register(
            "cleanup_loop",
            Duration::from_secs(config.cleanup_interval_secs * 2),
        )
        .await;

    let cleanup_loop = Box::pin(cleanup_loop(
        janitor,
        config.cleanup_interval_secs,
        cleanup_liveness,
    ));

    let registry = liveness.clone();
    let app = setup_metrics_routes(Router::new().route(
        "/_liveness",
        get(move || {
            let registry = registry.clone();
            async move { registry.get_status() }
        }),
    ));
    let http_server = Box::pin(listen(app, config.bind()));

    match select(http_server, cleanup_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start transcode-janitor http server, {}", e),
        },
        Either::Right((_, _)) => {
            tracing::error!("transcode-janitor cleanup task exited")
        }
    };
}
