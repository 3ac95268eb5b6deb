use std::time::Duration;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};

use common_health::HealthRegistry;
use common_serve_metrics::setup_metrics_routes;
use conveyor_core::RetryPolicy;

mod config;
mod error;
mod worker;

use config::Config;
use worker::WebhookDispatcher;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

fn dispatcher_name() -> String {
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

    let retry_policy = RetryPolicy::build(
        2,
        Duration::from_secs(config.retry_initial_interval_seconds),
    )
    .maximum_interval(Duration::from_secs(config.retry_maximum_interval_seconds))
    .provide();

    let liveness = HealthRegistry::new("liveness");
    let dispatcher_liveness = liveness
        .register("dispatcher_loop", config.poll_interval() * 20)
        .await;

    let dispatcher = WebhookDispatcher::new(
        &dispatcher_name(),
        pool,
        config.request_timeout(),
        config.poll_interval(),
        config.dequeue_batch_size,
        config.max_concurrent_deliveries,
        retry_policy,
        dispatcher_liveness,
        config.ssrf_guard,
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
    let dispatcher_loop = Box::pin(async move { dispatcher.run().await });

    match select(http_server, dispatcher_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start webhook-worker http server, {}", e),
        },
        Either::Right((loop_result, _)) => match loop_result {
            Ok(_) => {}
            Err(e) => tracing::error!("webhook-worker dispatcher loop exited, {}", e),
        },
    };

    Ok(())
}
