use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use conductor_core::{
    AssignmentStore, CatalogCache, ConsistencyChecker, FailureDetector, Gatekeeper,
    InstanceRegistry, Rebalancer, Settings,
};
use health::HealthRegistry;

use crate::api::types::StreamUpdateStatus;
use crate::config::Config;
use crate::idempotency::IdempotencyCache;

#[derive(Default)]
struct UpdateCounters {
    ok: u64,
    failed: u64,
    /// Last accepted report timestamp per stream, for `(stream, timestamp)`
    /// idempotence.
    last_seen: HashMap<i64, DateTime<Utc>>,
}

pub struct AppContext {
    pub config: Config,
    pub settings: Settings,
    pub gatekeeper: Arc<Gatekeeper>,
    pub registry: Arc<InstanceRegistry>,
    pub store: Arc<AssignmentStore>,
    pub catalog: Arc<CatalogCache>,
    pub rebalancer: Arc<Rebalancer>,
    pub checker: Arc<ConsistencyChecker>,
    pub detector: Arc<FailureDetector>,
    pub idempotency: IdempotencyCache,
    pub liveness: HealthRegistry,
    /// Flipped once the first background cycle completes; gates readiness.
    pub first_cycle_done: AtomicBool,
    update_tracker: Mutex<HashMap<String, UpdateCounters>>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self, sqlx::Error> {
        let settings = config.settings();

        // Lazy pools: the orchestrator comes up and serves health checks
        // even while the database is down; the breaker does the rest.
        let pool = config.pool_config().connect_lazy()?;
        let catalog_pool = config.catalog_pool_config().connect_lazy()?;

        let gatekeeper = Arc::new(Gatekeeper::new(pool, settings.clone()));
        let registry = Arc::new(InstanceRegistry::new(gatekeeper.clone()));
        let store = Arc::new(AssignmentStore::new(gatekeeper.clone()));
        let catalog = Arc::new(CatalogCache::new(catalog_pool));
        let rebalancer = Arc::new(Rebalancer::new(
            gatekeeper.clone(),
            store.clone(),
            catalog.clone(),
        ));
        let checker = Arc::new(ConsistencyChecker::new(gatekeeper.clone(), catalog.clone()));
        let detector = Arc::new(FailureDetector::new(
            gatekeeper.clone(),
            registry.clone(),
            store.clone(),
            rebalancer.clone(),
            checker.clone(),
        ));

        let idempotency =
            IdempotencyCache::new(Duration::from_secs(config.idempotency_ttl_s));

        Ok(Self {
            config,
            settings,
            gatekeeper,
            registry,
            store,
            catalog,
            rebalancer,
            checker,
            detector,
            idempotency,
            liveness: HealthRegistry::new("liveness"),
            first_cycle_done: AtomicBool::new(false),
            update_tracker: Mutex::new(HashMap::new()),
        })
    }

    /// Record one per-stream outcome report. Returns false for a duplicate
    /// or out-of-order report, which callers treat as a no-op.
    pub fn record_stream_update(
        &self,
        instance_id: &str,
        stream_id: i64,
        status: StreamUpdateStatus,
        timestamp: Option<DateTime<Utc>>,
    ) -> bool {
        let Ok(mut tracker) = self.update_tracker.lock() else {
            return false;
        };
        let counters = tracker.entry(instance_id.to_string()).or_default();

        if let Some(ts) = timestamp {
            if let Some(last) = counters.last_seen.get(&stream_id) {
                if ts <= *last {
                    return false;
                }
            }
            counters.last_seen.insert(stream_id, ts);
        }

        match status {
            StreamUpdateStatus::Completed => counters.ok += 1,
            StreamUpdateStatus::Failed => counters.failed += 1,
            StreamUpdateStatus::Processing => {}
        }
        true
    }

    /// Success ratio reported since the previous heartbeat, clipped to
    /// [0, 1]. With nothing reported the instance gets the benefit of the
    /// doubt. Draining resets the window.
    pub fn take_heartbeat_signal(&self, instance_id: &str) -> f64 {
        let Ok(mut tracker) = self.update_tracker.lock() else {
            return 1.0;
        };
        let Some(counters) = tracker.get_mut(instance_id) else {
            return 1.0;
        };
        let total = counters.ok + counters.failed;
        let signal = if total == 0 {
            1.0
        } else {
            counters.ok as f64 / total as f64
        };
        counters.ok = 0;
        counters.failed = 0;
        signal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envconfig::Envconfig;

    fn context() -> AppContext {
        let config = Config::init_from_hashmap(&Default::default()).unwrap();
        AppContext::new(config).unwrap()
    }

    #[tokio::test]
    async fn signal_defaults_to_full_marks() {
        let ctx = context();
        assert_eq!(ctx.take_heartbeat_signal("w1"), 1.0);
    }

    #[tokio::test]
    async fn signal_reflects_reported_outcomes() {
        let ctx = context();
        ctx.record_stream_update("w1", 1, StreamUpdateStatus::Completed, None);
        ctx.record_stream_update("w1", 2, StreamUpdateStatus::Completed, None);
        ctx.record_stream_update("w1", 3, StreamUpdateStatus::Failed, None);
        ctx.record_stream_update("w1", 4, StreamUpdateStatus::Processing, None);

        let signal = ctx.take_heartbeat_signal("w1");
        assert!((signal - 2.0 / 3.0).abs() < 1e-9);

        // The window resets after each heartbeat.
        assert_eq!(ctx.take_heartbeat_signal("w1"), 1.0);
    }

    #[tokio::test]
    async fn out_of_order_updates_are_dropped() {
        let ctx = context();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(10);

        assert!(ctx.record_stream_update("w1", 5, StreamUpdateStatus::Completed, Some(t1)));
        assert!(!ctx.record_stream_update("w1", 5, StreamUpdateStatus::Failed, Some(t0)));
        assert!(!ctx.record_stream_update("w1", 5, StreamUpdateStatus::Failed, Some(t1)));

        assert_eq!(ctx.take_heartbeat_signal("w1"), 1.0);
    }
}
