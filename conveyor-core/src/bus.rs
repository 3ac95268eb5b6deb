use common_redis::{BusClient, BusError, Subscription};
use tracing::warn;
use uuid::Uuid;

use crate::types::ProgressFrame;

/// Channel naming for the per-job progress feed.
pub fn progress_channel(job_id: Uuid) -> String {
    format!("conveyor:progress:{job_id}")
}

/// Publish a frame to the job's channel. The bus is best-effort: a publish
/// failure is logged and swallowed, because the durable event ring already
/// holds the frame and SSE replay will pick it up.
pub async fn publish_frame(bus: &(dyn BusClient + Send + Sync), frame: &ProgressFrame) {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(job_id = %frame.job_id, "failed to encode progress frame: {}", err);
            return;
        }
    };
    if let Err(err) = bus.publish(progress_channel(frame.job_id), payload).await {
        warn!(job_id = %frame.job_id, "failed to publish progress frame: {}", err);
    }
}

pub async fn subscribe_job(
    bus: &(dyn BusClient + Send + Sync),
    job_id: Uuid,
) -> Result<Subscription, BusError> {
    bus.subscribe(progress_channel(job_id)).await
}

pub fn decode_frame(payload: &str) -> Option<ProgressFrame> {
    match serde_json::from_str(payload) {
        Ok(frame) => Some(frame),
        Err(err) => {
            warn!("dropping undecodable progress frame: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common_redis::MockBusClient;

    fn frame(job_id: Uuid, seq: i64) -> ProgressFrame {
        ProgressFrame {
            job_id,
            seq,
            recorded_at: Utc::now(),
            percent: 10.0 * seq as f64,
            stage: "encode".to_string(),
            fps: Some(24.0),
            eta_seconds: Some(120),
            terminal: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn frames_roundtrip_over_the_bus() {
        let bus = MockBusClient::new();
        let job_id = Uuid::now_v7();
        let mut sub = subscribe_job(&bus, job_id).await.unwrap();

        publish_frame(&bus, &frame(job_id, 1)).await;
        publish_frame(&bus, &frame(job_id, 2)).await;

        let first = decode_frame(&sub.recv().await.unwrap()).unwrap();
        let second = decode_frame(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(first.job_id, job_id);
    }

    #[tokio::test]
    async fn channels_are_scoped_per_job() {
        let bus = MockBusClient::new();
        let job_a = Uuid::now_v7();
        let job_b = Uuid::now_v7();
        let mut sub_a = subscribe_job(&bus, job_a).await.unwrap();

        publish_frame(&bus, &frame(job_b, 1)).await;
        publish_frame(&bus, &frame(job_a, 1)).await;

        let received = decode_frame(&sub_a.recv().await.unwrap()).unwrap();
        assert_eq!(received.job_id, job_a);
    }
}
