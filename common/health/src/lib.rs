use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

/// Health reporting for the long-running loops of a service.
///
/// The orchestrator is only trustworthy while every background loop
/// (failure detection, consistency checking, rebalancing) keeps running.
/// Each loop registers a component with a deadline and pings it once per
/// cycle; a component that misses its deadline is considered stalled.
///
/// The overall verdict is three-valued so the service can distinguish
/// "restart me" from "keep me running but raise an alarm":
///   - `Unhealthy` if any component explicitly reported itself down,
///   - `Degraded` if none did but at least one is stalled or still starting,
///   - `Healthy` otherwise.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    /// Set on registration, before the first ping.
    Starting,
    /// Pinged recently; must ping again before the instant.
    HealthyUntil(time::OffsetDateTime),
    /// The component reported itself down.
    Unhealthy,
    /// Deadline passed without a ping.
    Stalled,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub verdict: Verdict,
    pub components: HashMap<String, String>,
}

impl HealthStatus {
    pub fn healthy(&self) -> bool {
        self.verdict == Verdict::Healthy
    }
}

impl IntoResponse for HealthStatus {
    // 503 only when unhealthy; a degraded process keeps serving.
    fn into_response(self) -> Response {
        let code = match self.verdict {
            Verdict::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::OK,
        };
        let body = serde_json::to_string(&self).unwrap_or_else(|_| "{}".to_string());
        (code, body).into_response()
    }
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthHandle {
    /// Report healthy. Must be called more often than the registered deadline.
    pub fn report_healthy(&self) {
        self.report(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ));
    }

    pub fn report_unhealthy(&self) {
        self.report(ComponentStatus::Unhealthy);
    }

    fn report(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            // Poisoned lock: the probes will fail and the process restart.
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Register a component. The returned handle is given to the component
    /// so it can ping the registry from its loop.
    pub fn register(&self, component: impl Into<String>, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component: component.into(),
            deadline,
            components: self.components.clone(),
        };
        handle.report(ComponentStatus::Starting);
        handle
    }

    /// Compute the overall status from all registered components.
    /// Usable directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            return HealthStatus {
                verdict: Verdict::Unhealthy,
                components: HashMap::new(),
            };
        };

        let now = time::OffsetDateTime::now_utc();
        let mut any_down = false;
        let mut any_stale = components.is_empty();
        let mut component_display = HashMap::new();

        for (name, status) in components.iter() {
            let shown = match status {
                ComponentStatus::HealthyUntil(until) if *until > now => "healthy",
                ComponentStatus::HealthyUntil(_) | ComponentStatus::Stalled => {
                    any_stale = true;
                    "stalled"
                }
                ComponentStatus::Starting => {
                    any_stale = true;
                    "starting"
                }
                ComponentStatus::Unhealthy => {
                    any_down = true;
                    "unhealthy"
                }
            };
            component_display.insert(name.clone(), shown.to_string());
        }

        let verdict = if any_down {
            Verdict::Unhealthy
        } else if any_stale {
            Verdict::Degraded
        } else {
            Verdict::Healthy
        };

        if verdict != Verdict::Healthy {
            warn!(registry = %self.name, ?verdict, components = ?component_display, "health check not green");
        }

        HealthStatus {
            verdict,
            components: component_display,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_is_degraded() {
        let registry = HealthRegistry::new("liveness");
        assert_eq!(registry.get_status().verdict, Verdict::Degraded);
    }

    #[test]
    fn component_lifecycle() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("scanner", Duration::from_secs(30));

        // Registered components start as not-yet-healthy.
        assert_eq!(registry.get_status().verdict, Verdict::Degraded);

        handle.report_healthy();
        assert_eq!(registry.get_status().verdict, Verdict::Healthy);

        handle.report_unhealthy();
        assert_eq!(registry.get_status().verdict, Verdict::Unhealthy);

        handle.report_healthy();
        assert_eq!(registry.get_status().verdict, Verdict::Healthy);
    }

    #[test]
    fn stale_component_degrades() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("scanner", Duration::from_secs(30));
        handle.report(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc() - time::Duration::seconds(1),
        ));
        assert_eq!(registry.get_status().verdict, Verdict::Degraded);
    }

    #[test]
    fn one_bad_component_wins() {
        let registry = HealthRegistry::new("liveness");
        let a = registry.register("a", Duration::from_secs(30));
        let b = registry.register("b", Duration::from_secs(30));
        a.report_healthy();
        b.report_healthy();
        assert_eq!(registry.get_status().verdict, Verdict::Healthy);

        b.report_unhealthy();
        assert_eq!(registry.get_status().verdict, Verdict::Unhealthy);
    }

    #[test]
    fn into_response_codes() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("only", Duration::from_secs(30));

        handle.report_unhealthy();
        let resp = registry.get_status().into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        handle.report_healthy();
        let resp = registry.get_status().into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
