use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the components of a service.
///
/// Every service in the fabric runs several asynchronous loops (queue
/// polling, cleanup, bus subscriptions), and the process should only be
/// considered alive while all of them keep making progress. Components
/// register against a `HealthRegistry` and periodically report in; a
/// component that stops reporting before its deadline flips the aggregate
/// status to unhealthy.
///
/// Liveness and readiness are deliberately kept as separate registry
/// instances; merging the two k8s concepts into one state invites
/// foot-guns.

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ComponentStatus {
    /// Set when a component registers, before its first report.
    Starting,
    /// Recently reported healthy; must report again before the deadline.
    #[serde(rename = "healthy")]
    HealthyUntil {
        #[serde(skip)]
        until: time::OffsetDateTime,
    },
    /// Reported unhealthy by the component itself.
    Unhealthy,
    /// The reporting deadline passed without a fresh report.
    Stalled,
}

#[derive(Debug, Default, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, Json(self)).into_response()
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Report healthy, extending the deadline. Must be called more
    /// frequently than the deadline registered for this component.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil {
            until: time::OffsetDateTime::now_utc().add(self.deadline),
        })
        .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: the probes will fail and the process restart
                    warn!("poisoned HealthRegistry lock");
                }
            }
        });

        registry
    }

    /// Registers a component. The returned handle should be passed into the
    /// component's loop so it can report on a schedule shorter than `deadline`.
    pub async fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.to_owned(),
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Aggregate status across all registered components. Usable directly as
    /// an axum handler through `IntoResponse`.
    pub fn get_status(&self) -> HealthStatus {
        let components = self.components.read().expect("poisoned HealthRegistry lock");

        // Unhealthy until at least one component has registered.
        let mut result = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };
        let now = time::OffsetDateTime::now_utc();

        for (name, status) in components.iter() {
            match status {
                ComponentStatus::HealthyUntil { until } if until.gt(&now) => {
                    _ = result.components.insert(name.clone(), status.clone());
                }
                ComponentStatus::HealthyUntil { .. } => {
                    result.healthy = false;
                    _ = result
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                other => {
                    result.healthy = false;
                    _ = result.components.insert(name.clone(), other.clone());
                }
            }
        }

        if !result.healthy {
            warn!(
                "{} health check failed: {:?}",
                self.name, result.components
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Sub;

    async fn assert_eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = time::OffsetDateTime::now_utc().add(time::Duration::seconds(5));
        while !check() && time::OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn single_component_lifecycle() {
        let registry = HealthRegistry::new("liveness");

        let handle = registry.register("queue", Duration::from_secs(30)).await;
        assert_eventually(|| registry.get_status().components.len() == 1).await;

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("queue"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        assert_eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn missed_deadline_is_stalled() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("store", Duration::from_secs(30)).await;

        handle.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        handle
            .report_status(ComponentStatus::HealthyUntil {
                until: time::OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            })
            .await;
        assert_eventually(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("store"),
            Some(&ComponentStatus::Stalled)
        );
    }

    #[tokio::test]
    async fn all_components_must_be_healthy() {
        let registry = HealthRegistry::new("liveness");
        let store = registry.register("store", Duration::from_secs(30)).await;
        let bus = registry.register("bus", Duration::from_secs(30)).await;
        assert_eventually(|| registry.get_status().components.len() == 2).await;

        store.report_healthy().await;
        assert_eventually(|| {
            registry.get_status().components.get("store") != Some(&ComponentStatus::Starting)
        })
        .await;
        assert!(!registry.get_status().healthy);

        bus.report_healthy().await;
        assert_eventually(|| registry.get_status().healthy).await;

        bus.report_status(ComponentStatus::Unhealthy).await;
        assert_eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn status_serializes_to_json_response() {
        let unhealthy = HealthStatus::default().into_response();
        assert_eq!(unhealthy.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let healthy = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(healthy.status(), StatusCode::OK);
    }
}
