use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use http::StatusCode;
use reqwest::header;
use sha2::Sha256;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use common_dns::{TargetError, WebhookClient};
use common_health::HealthHandle;
use conveyor_core::deliveries;
use conveyor_core::{CircuitBreaker, CircuitBreakerConfig, Delivery, RetryPolicy};

use crate::error::{DeliveryError, DispatcherError};

type HmacSha256 = Hmac<Sha256>;

/// Retry-After hints beyond this are treated as noise; the backoff policy
/// owns the schedule.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// A worker to poll the delivery queue and POST webhook events with
/// at-least-once semantics: bounded retries with exponential backoff, then
/// dead-letter.
pub struct WebhookDispatcher {
    name: String,
    pool: PgPool,
    client: WebhookClient,
    poll_interval: Duration,
    batch_size: usize,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    breakers: BreakerMap,
}

/// One circuit breaker per webhook target host.
#[derive(Clone, Default)]
struct BreakerMap {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerMap {
    fn for_host(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().expect("poisoned breaker map");
        map.entry(host.to_owned())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("webhook:{host}"),
                    CircuitBreakerConfig::default(),
                ))
            })
            .clone()
    }
}

impl WebhookDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        pool: PgPool,
        request_timeout: Duration,
        poll_interval: Duration,
        batch_size: usize,
        max_concurrent: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
        ssrf_guard: bool,
    ) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = WebhookClient::builder(ssrf_guard)
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .expect("failed to construct http client for webhook dispatcher");

        Self {
            name: name.to_owned(),
            pool,
            client,
            poll_interval,
            batch_size,
            max_concurrent,
            retry_policy,
            liveness,
            breakers: BreakerMap::default(),
        }
    }

    /// Wait until deliveries become available in the queue.
    async fn wait_for_deliveries(&self) -> Result<Vec<Delivery>, DispatcherError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy().await;

            let batch =
                deliveries::dequeue_deliveries(&self.pool, &self.name, self.batch_size).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }

    /// Run this dispatcher to continuously process deliveries.
    pub async fn run(&self) -> Result<(), DispatcherError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        loop {
            let batch = self.wait_for_deliveries().await?;

            for delivery in batch {
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore has been closed");

                let pool = self.pool.clone();
                let client = self.client.clone();
                let retry_policy = self.retry_policy.clone();
                let breakers = self.breakers.clone();

                tokio::spawn(async move {
                    let id = delivery.id;
                    if let Err(err) =
                        process_delivery(&pool, &client, &retry_policy, &breakers, delivery).await
                    {
                        error!(delivery_id = id, "failed to settle delivery: {}", err);
                    }
                    drop(permit);
                });
            }
        }
    }
}

/// HMAC-SHA256 of the payload with the per-key secret; the receiver can
/// verify origin and integrity.
fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("t={timestamp},v1={hex}")
}

async fn owner_secret(pool: &PgPool, owner_id: &str) -> Option<String> {
    let secret: Option<String> =
        sqlx::query_scalar("SELECT secret FROM conveyor_api_keys WHERE owner_id = $1 LIMIT 1")
            .bind(owner_id)
            .fetch_optional(pool)
            .await
            .ok()
            .flatten();
    secret
}

async fn process_delivery(
    pool: &PgPool,
    client: &WebhookClient,
    retry_policy: &RetryPolicy,
    breakers: &BreakerMap,
    delivery: Delivery,
) -> Result<(), DispatcherError> {
    let labels = [("event", delivery.event.clone())];
    metrics::counter!("webhook_deliveries_total", &labels).increment(1);

    let host = url::Url::parse(&delivery.url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_else(|| "invalid".to_owned());
    let breaker = breakers.for_host(&host);

    if !breaker.can_execute() {
        // Don't waste an attempt while the target is known-bad; push the
        // delivery out by the policy's current backoff.
        let delay = retry_policy.retry_interval(delivery.attempt as u32, None);
        deliveries::retry_delivery(
            pool,
            delivery.id,
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60)),
            None,
            "circuit breaker open",
        )
        .await?;
        return Ok(());
    }

    let secret = owner_secret(pool, &delivery.owner_id).await;
    let outcome = send_webhook(client, &delivery, secret.as_deref()).await;

    match outcome {
        Ok(status) => {
            breaker.record_success();
            deliveries::complete_delivery(pool, delivery.id, status as i16).await?;
            metrics::counter!("webhook_deliveries_completed", &labels).increment(1);
            info!(delivery_id = delivery.id, status, "webhook delivered");
            Ok(())
        }
        Err(DeliveryError::Forbidden) | Err(DeliveryError::ParseUrl) => {
            // Re-validation failed at send time (DNS rebinding defense):
            // never retried.
            deliveries::dead_letter_delivery(pool, delivery.id, None, "target forbidden").await?;
            metrics::counter!("webhook_deliveries_dead", &labels).increment(1);
            Ok(())
        }
        Err(DeliveryError::Rejected { status }) => {
            breaker.record_success();
            deliveries::dead_letter_delivery(
                pool,
                delivery.id,
                Some(status as i16),
                "rejected by target",
            )
            .await?;
            metrics::counter!("webhook_deliveries_dead", &labels).increment(1);
            Ok(())
        }
        Err(DeliveryError::Retryable {
            reason,
            status,
            retry_after,
        }) => {
            breaker.record_failure();
            if delivery.attempt >= delivery.max_attempts {
                deliveries::dead_letter_delivery(
                    pool,
                    delivery.id,
                    status.map(|s| s as i16),
                    &reason,
                )
                .await?;
                metrics::counter!("webhook_deliveries_dead", &labels).increment(1);
                warn!(
                    delivery_id = delivery.id,
                    "retries exhausted, delivery dead-lettered"
                );
                return Ok(());
            }

            let delay = retry_policy.retry_interval(delivery.attempt as u32, retry_after);
            deliveries::retry_delivery(
                pool,
                delivery.id,
                Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60)),
                status.map(|s| s as i16),
                &reason,
            )
            .await?;
            metrics::counter!("webhook_deliveries_retried", &labels).increment(1);
            Ok(())
        }
    }
}

/// Make the HTTP request for one delivery. The client re-vets the target
/// (URL and DNS answers alike) at send time; redirects are not followed,
/// so a 3xx settles like any other non-2xx.
async fn send_webhook(
    client: &WebhookClient,
    delivery: &Delivery,
    secret: Option<&str>,
) -> Result<u16, DeliveryError> {
    let body = serde_json::to_vec(&delivery.payload.0).map_err(|_| DeliveryError::ParseUrl)?;

    let mut request = client.post(&delivery.url).map_err(|err| match err {
        TargetError::Forbidden(_) => DeliveryError::Forbidden,
        TargetError::Invalid(_) => DeliveryError::ParseUrl,
        TargetError::Http(_) => DeliveryError::Retryable {
            reason: "client error".to_owned(),
            status: None,
            retry_after: None,
        },
    })?;

    if let Some(secret) = secret {
        let signature = sign_payload(secret, Utc::now().timestamp(), &body);
        request = request.header("X-Conveyor-Signature", signature);
    }

    let response = request
        .header("X-Conveyor-Event", delivery.event.clone())
        .body(body)
        .send()
        .await
        .map_err(|err| {
            // The resolver refusing to hand out a private address surfaces
            // as a connect error; that is a policy verdict, not an outage.
            if err.to_string().contains("No public IPv4") {
                DeliveryError::Forbidden
            } else {
                DeliveryError::Retryable {
                    reason: sanitize_reqwest_error(&err),
                    status: None,
                    retry_after: None,
                }
            }
        })?;

    settle_status(response.status(), response.headers())
}

fn sanitize_reqwest_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_owned()
    } else if err.is_connect() {
        "connection failed".to_owned()
    } else {
        "request failed".to_owned()
    }
}

/// Fold an HTTP outcome into the delivery taxonomy. Throttling (429) and
/// server-side failure may clear up, so they reschedule; any other non-2xx
/// is the target telling us to stop, dead-lettered without burning the
/// remaining attempts.
fn settle_status(status: StatusCode, headers: &header::HeaderMap) -> Result<u16, DeliveryError> {
    if status.is_success() {
        return Ok(status.as_u16());
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(DeliveryError::Retryable {
            reason: format!("target answered {}", status.as_u16()),
            status: Some(status.as_u16()),
            retry_after: retry_after_hint(headers),
        })
    } else {
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
        })
    }
}

/// A target's Retry-After, honored only in its delta-seconds form and only
/// up to a sane ceiling. HTTP-date values and anything past the cap are
/// ignored: the backoff policy supplies the schedule either way, the header
/// merely nudges it within the policy's own bounds.
fn retry_after_hint(headers: &header::HeaderMap) -> Option<Duration> {
    let seconds: u64 = headers.get(header::RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    let hint = Duration::from_secs(seconds);
    (hint > Duration::ZERO && hint <= MAX_RETRY_AFTER).then_some(hint)
}
