use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::assignments::AssignmentStore;
use crate::checker::ConsistencyChecker;
use crate::error::StoreError;
use crate::gatekeeper::Gatekeeper;
use crate::ops;
use crate::registry::InstanceRegistry;
use crate::rebalancer::Rebalancer;
use crate::types::RebalanceReason;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorPass {
    pub warned: Vec<String>,
    pub lost: Vec<String>,
    pub removed: Vec<String>,
    pub emergencies: Vec<String>,
}

/// Periodic scanner driving the instance state machine. Losing an instance
/// triggers redistribution of its streams; prolonged failure escalates to
/// emergency recovery.
pub struct FailureDetector {
    gatekeeper: Arc<Gatekeeper>,
    registry: Arc<InstanceRegistry>,
    store: Arc<AssignmentStore>,
    rebalancer: Arc<Rebalancer>,
    checker: Arc<ConsistencyChecker>,
}

impl FailureDetector {
    pub fn new(
        gatekeeper: Arc<Gatekeeper>,
        registry: Arc<InstanceRegistry>,
        store: Arc<AssignmentStore>,
        rebalancer: Arc<Rebalancer>,
        checker: Arc<ConsistencyChecker>,
    ) -> Self {
        Self {
            gatekeeper,
            registry,
            store,
            rebalancer,
            checker,
        }
    }

    pub async fn run_once(&self) -> Result<DetectorPass, StoreError> {
        let sweep = self.registry.scan_transitions().await?;
        let mut pass = DetectorPass {
            warned: sweep.warned,
            lost: sweep.lost,
            removed: sweep.removed,
            emergencies: Vec::new(),
        };

        for id in &pass.warned {
            warn!(instance = %id, "heartbeat overdue, instance moved to warning");
        }

        for id in &pass.removed {
            info!(instance = %id, "instance removed after prolonged inactivity");
            // Its rows become orphans the checker would catch; release them
            // now so the streams return to the very next plan.
            self.store.force_release_instance(id).await?;
        }

        if !pass.lost.is_empty() {
            warn!(instances = ?pass.lost, "instances lost, redistributing their streams");
            let redistribution = self
                .rebalancer
                .evaluate(RebalanceReason::LostInstance, true)
                .await;
            if let Err(e) = redistribution {
                if e.is_retryable() {
                    // Redistribution failed on infrastructure; escalate so
                    // the streams don't sit on a dead instance.
                    warn!(error = %e, "redistribution failed, escalating to emergency recovery");
                    for id in pass.lost.clone() {
                        self.emergency_recovery(&id, "redistribution failed on transient error")
                            .await?;
                        pass.emergencies.push(id);
                    }
                } else {
                    return Err(e);
                }
            }
        }

        for id in self.emergency_candidates().await? {
            self.emergency_recovery(&id, "inactive past emergency threshold")
                .await?;
            pass.emergencies.push(id);
        }

        Ok(pass)
    }

    /// Inactive instances silent far past the threshold but still holding
    /// live assignments.
    async fn emergency_candidates(&self) -> Result<Vec<String>, StoreError> {
        let settings = self.gatekeeper.settings().clone();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(settings.inactive_threshold + settings.emergency_threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(780));
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("emergency_candidates", move || {
                let pool = pool.clone();
                async move { ops::registry::list_emergency_candidates(&pool, cutoff).await }
            })
            .await
    }

    /// Force-release, re-plan, verify, reset. Every step is a no-op when
    /// already done, so running this twice for the same instance is safe.
    /// The reason is threaded through to the registry so the persisted row
    /// records why the instance was reset.
    pub async fn emergency_recovery(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        warn!(instance = %instance_id, reason, "running emergency recovery");

        let released = self.store.force_release_instance(instance_id).await?;
        if !released.is_empty() {
            info!(instance = %instance_id, streams = released.len(), "force-released streams");
        }

        let summary = self
            .rebalancer
            .evaluate(RebalanceReason::LostInstance, true)
            .await?;
        info!(
            instance = %instance_id,
            planned = summary.planned,
            applied = summary.applied,
            "emergency re-plan finished"
        );

        let defects = self.checker.run_once().await?;
        if !defects.is_empty() {
            warn!(instance = %instance_id, defects = defects.len(), "defects found during recovery verification");
        }

        self.registry
            .mark_inactive(instance_id, &format!("emergency recovery: {reason}"))
            .await?;
        info!(instance = %instance_id, "emergency recovery complete");
        Ok(())
    }
}
