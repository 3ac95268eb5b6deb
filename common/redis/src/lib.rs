//! Pub/sub plumbing for the progress bus.
//!
//! The bus is transient and best-effort: workers publish progress frames to
//! a per-job channel, API streamers subscribe while a client holds an SSE
//! connection open. Durable history lives in the job store's event ring,
//! not here. Subscribers that fall behind their bounded buffer are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::RedisError;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, warn};

const DEFAULT_PUBLISH_TIMEOUT_MILLISECS: u64 = 100;

/// Bounded per-subscriber buffer. A streamer that cannot drain this many
/// frames is dropped rather than allowed to apply backpressure to workers.
pub const SUBSCRIBER_BUFFER: usize = 64;

fn publish_timeout_ms() -> u64 {
    std::env::var("BUS_PUBLISH_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MILLISECS)
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("timeout error")]
    Timeout,
}

impl From<RedisError> for BusError {
    fn from(err: RedisError) -> Self {
        BusError::Redis(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for BusError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BusError::Timeout
    }
}

/// A subscription to a single channel. Dropping the handle tears the
/// forwarding task down.
pub struct Subscription {
    receiver: mpsc::Receiver<String>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn into_receiver(self) -> mpsc::Receiver<String> {
        self.receiver
    }
}

#[async_trait]
pub trait BusClient {
    async fn publish(&self, channel: String, payload: String) -> Result<(), BusError>;
    async fn subscribe(&self, channel: String) -> Result<Subscription, BusError>;
}

pub struct RedisBus {
    client: redis::Client,
    publish_conn: MultiplexedConnection,
}

impl RedisBus {
    pub async fn new(addr: String) -> Result<RedisBus, BusError> {
        let client = redis::Client::open(addr).map_err(BusError::from)?;
        let publish_conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisBus {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl BusClient for RedisBus {
    async fn publish(&self, channel: String, payload: String) -> Result<(), BusError> {
        let mut conn = self.publish_conn.clone();
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(&channel).arg(&payload);
        let fut = cmd.query_async::<()>(&mut conn);
        timeout(Duration::from_millis(publish_timeout_ms()), fut).await??;
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<Subscription, BusError> {
        // Pub/sub needs its own connection; the multiplexed one cannot enter
        // subscriber mode.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("dropping undecodable bus frame: {}", err);
                        continue;
                    }
                };
                match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow subscriber: drop it rather than buffer forever.
                        debug!(%channel, "bus subscriber fell behind, dropping");
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        Ok(Subscription { receiver: rx })
    }
}

/// In-memory bus for tests: a broadcast channel per subscribed channel name.
#[derive(Clone, Default)]
pub struct MockBusClient {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    published: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockBusClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().expect("poisoned MockBusClient lock");
        channels
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .clone()
    }

    /// Every publish observed, in order, for assertions.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .expect("poisoned MockBusClient lock")
            .clone()
    }
}

#[async_trait]
impl BusClient for MockBusClient {
    async fn publish(&self, channel: String, payload: String) -> Result<(), BusError> {
        self.published
            .lock()
            .expect("poisoned MockBusClient lock")
            .push((channel.clone(), payload.clone()));
        // A publish with no subscribers is fine, the bus is best-effort.
        drop(self.sender_for(&channel).send(payload));
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<Subscription, BusError> {
        let mut source = self.sender_for(&channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { receiver: rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_bus_roundtrip() {
        let bus = MockBusClient::new();
        let mut sub = bus.subscribe("progress:abc".to_string()).await.unwrap();

        bus.publish("progress:abc".to_string(), "one".to_string())
            .await
            .unwrap();
        bus.publish("progress:abc".to_string(), "two".to_string())
            .await
            .unwrap();

        assert_eq!(sub.recv().await.as_deref(), Some("one"));
        assert_eq!(sub.recv().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn mock_bus_channels_are_isolated() {
        let bus = MockBusClient::new();
        let mut sub_a = bus.subscribe("progress:a".to_string()).await.unwrap();
        let mut sub_b = bus.subscribe("progress:b".to_string()).await.unwrap();

        bus.publish("progress:a".to_string(), "for-a".to_string())
            .await
            .unwrap();
        bus.publish("progress:b".to_string(), "for-b".to_string())
            .await
            .unwrap();

        assert_eq!(sub_a.recv().await.as_deref(), Some("for-a"));
        assert_eq!(sub_b.recv().await.as_deref(), Some("for-b"));
    }

    #[tokio::test]
    async fn mock_bus_records_publishes() {
        let bus = MockBusClient::new();
        bus.publish("progress:x".to_string(), "frame".to_string())
            .await
            .unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "progress:x");
    }
}
