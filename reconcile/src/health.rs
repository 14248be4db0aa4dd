use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::warn;

/// Liveness reporting for the long-running loops of the backfill binary.
///
/// Components register with a deadline and must re-report healthy before it
/// passes; a component that goes quiet is treated as stalled and fails the
/// probe, so a wedged loop cannot keep presenting as alive.

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True only if every registered component is currently healthy.
    pub healthy: bool,
    /// Per-component status, for the probe body.
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Registered but has not reported yet.
    Starting,
    /// Healthy until the deadline, must report again before it.
    HealthyUntil(DateTime<Utc>),
    /// Explicitly reported unhealthy.
    Unhealthy,
    /// Missed its reporting deadline.
    Stalled,
}

struct HealthReport {
    component: String,
    status: ComponentStatus,
}

pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthReport>,
}

impl HealthHandle {
    /// Report healthy. Must be called more often than the deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(Utc::now() + self.deadline))
            .await
    }

    pub async fn report_status(&self, status: ComponentStatus) {
        let report = HealthReport {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(report).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthReport>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> HealthRegistry {
        let (tx, mut rx) = mpsc::channel::<HealthReport>(16);
        let registry = HealthRegistry {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(report.component, report.status);
                } else {
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a component; hand the returned handle to its loop so it
    /// can report on schedule.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Overall process status; usable directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");
        let now = Utc::now();

        // Unhealthy until at least one component has registered.
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        for (name, component) in components.iter() {
            match component {
                ComponentStatus::HealthyUntil(until) if *until > now => {
                    _ = status.components.insert(name.clone(), component.clone());
                }
                ComponentStatus::HealthyUntil(_) => {
                    status.healthy = false;
                    _ = status
                        .components
                        .insert(name.clone(), ComponentStatus::Stalled);
                }
                _ => {
                    status.healthy = false;
                    _ = status.components.insert(name.clone(), component.clone());
                }
            }
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }

        status
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    use super::*;

    async fn eventually<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = Utc::now() + Duration::seconds(5);
        while !check() && Utc::now() < deadline {
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("backfill".to_owned(), Duration::seconds(30))
            .await;

        eventually(|| registry.get_status().components.len() == 1).await;
        assert!(!registry.get_status().healthy);

        handle.report_healthy().await;
        eventually(|| registry.get_status().healthy).await;

        handle.report_status(ComponentStatus::Unhealthy).await;
        eventually(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn stalled_component_fails_the_probe() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("backfill".to_owned(), Duration::seconds(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                Utc::now() - Duration::seconds(1),
            ))
            .await;
        eventually(|| {
            registry.get_status().components.get("backfill") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn status_maps_to_http_codes() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            components: Default::default(),
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }
}
