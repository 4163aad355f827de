use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::error::StoreError;
use crate::gatekeeper::Gatekeeper;
use crate::ops::registry::{self, HeartbeatResult, TransitionSweep};
use crate::types::{Instance, RegistrationOutcome};

/// Durable directory of workers. All reads and writes go through the
/// gatekeeper; this type owns no in-memory state of its own.
pub struct InstanceRegistry {
    gatekeeper: Arc<Gatekeeper>,
}

impl InstanceRegistry {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }

    pub async fn register(
        &self,
        id: &str,
        address: Option<String>,
        capacity_max: i32,
        metadata: Option<serde_json::Value>,
    ) -> Result<RegistrationOutcome, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let id = id.to_string();
        self.gatekeeper
            .run_write("register_instance", move || {
                let pool = pool.clone();
                let id = id.clone();
                let address = address.clone();
                let metadata = metadata.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let outcome = registry::register(
                        &mut txn,
                        &id,
                        address.as_deref(),
                        capacity_max,
                        metadata.as_ref(),
                        Utc::now(),
                    )
                    .await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(outcome)
                }
            })
            .await
    }

    /// Apply one heartbeat. `signal` is the worker's success/punctuality
    /// signal in [0, 1], already computed by the caller.
    pub async fn record_heartbeat(
        &self,
        id: &str,
        sent_at: Option<chrono::DateTime<Utc>>,
        signal: f64,
    ) -> Result<HeartbeatResult, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let settings = self.gatekeeper.settings().clone();
        let id = id.to_string();
        self.gatekeeper
            .run_write("record_heartbeat", move || {
                let pool = pool.clone();
                let id = id.clone();
                let settings = settings.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let result = registry::record_heartbeat(
                        &mut txn,
                        &id,
                        sent_at,
                        Utc::now(),
                        signal,
                        settings.score_alpha,
                        settings.recovering_heartbeats,
                    )
                    .await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(result)
                }
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let id = id.to_string();
        self.gatekeeper
            .run_read("get_instance", move || {
                let pool = pool.clone();
                let id = id.clone();
                async move { registry::get_instance(&pool, &id).await }
            })
            .await
    }

    pub async fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("list_instances", move || {
                let pool = pool.clone();
                async move { registry::list_instances(&pool).await }
            })
            .await
    }

    /// Instances eligible to receive new work (ACTIVE or RECOVERING).
    pub async fn list_eligible(&self) -> Result<Vec<Instance>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("list_eligible", move || {
                let pool = pool.clone();
                async move { registry::list_eligible(&pool).await }
            })
            .await
    }

    /// One heartbeat-silence sweep of the whole fleet.
    pub async fn scan_transitions(&self) -> Result<TransitionSweep, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let settings = self.gatekeeper.settings().clone();
        self.gatekeeper
            .run_write("scan_transitions", move || {
                let pool = pool.clone();
                let settings = settings.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let sweep = registry::scan_transitions(
                        &mut txn,
                        Utc::now(),
                        chrono::Duration::from_std(settings.warn_threshold)
                            .unwrap_or_else(|_| chrono::Duration::seconds(90)),
                        chrono::Duration::from_std(settings.inactive_threshold)
                            .unwrap_or_else(|_| chrono::Duration::seconds(180)),
                        chrono::Duration::from_std(settings.removal_timeout)
                            .unwrap_or_else(|_| chrono::Duration::seconds(86_400)),
                    )
                    .await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(sweep)
                }
            })
            .await
    }

    /// Attach the latest worker-reported metrics to the instance record.
    pub async fn store_metrics(
        &self,
        id: &str,
        metrics: serde_json::Value,
    ) -> Result<(), StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let id = id.to_string();
        self.gatekeeper
            .run_write("store_metrics", move || {
                let pool = pool.clone();
                let id = id.clone();
                let metrics = metrics.clone();
                async move { registry::store_metrics(&pool, &id, &metrics).await }
            })
            .await
    }

    pub async fn mark_inactive(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let owned_id = id.to_string();
        let owned_reason = reason.to_string();
        let changed = self
            .gatekeeper
            .run_write("mark_inactive", move || {
                let pool = pool.clone();
                let id = owned_id.clone();
                let reason = owned_reason.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let changed = registry::mark_inactive(&mut txn, &id, &reason).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(changed)
                }
            })
            .await?;
        if changed {
            info!(instance = %id, reason, "instance marked inactive");
        }
        Ok(changed)
    }

    pub async fn mark_removed(&self, id: &str) -> Result<bool, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let id = id.to_string();
        self.gatekeeper
            .run_write("mark_removed", move || {
                let pool = pool.clone();
                let id = id.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let changed = registry::mark_removed(&mut txn, &id).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(changed)
                }
            })
            .await
    }
}
