use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::assignments::AssignmentStore;
use crate::balancer::{self, AssignmentSlot, ImbalanceReport, InstanceLoad, Snapshot};
use crate::catalog::CatalogCache;
use crate::error::StoreError;
use crate::gatekeeper::Gatekeeper;
use crate::ops;
use crate::types::{Move, RebalanceOutcome, RebalancePlan, RebalanceReason};

#[derive(Debug, Clone, Serialize)]
pub struct RebalanceSummary {
    pub reason: RebalanceReason,
    pub planned: usize,
    pub applied: usize,
    /// Set when no plan ran: "in_progress", "cooldown", "balanced" or "empty".
    pub skipped: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebalanceStats {
    pub total_events: usize,
    pub completed: usize,
    pub failed: usize,
    pub in_flight: usize,
    pub last_started_at: Option<chrono::DateTime<Utc>>,
}

/// Applies balancer plans to the stores: batched, rate-limited, audited, and
/// serialized so at most one plan is in flight per process.
pub struct Rebalancer {
    gatekeeper: Arc<Gatekeeper>,
    store: Arc<AssignmentStore>,
    catalog: Arc<CatalogCache>,
    run_guard: tokio::sync::Mutex<()>,
    last_completed: std::sync::Mutex<Option<Instant>>,
}

impl Rebalancer {
    pub fn new(
        gatekeeper: Arc<Gatekeeper>,
        store: Arc<AssignmentStore>,
        catalog: Arc<CatalogCache>,
    ) -> Self {
        Self {
            gatekeeper,
            store,
            catalog,
            run_guard: tokio::sync::Mutex::new(()),
            last_completed: std::sync::Mutex::new(None),
        }
    }

    pub async fn build_snapshot(&self) -> Result<Snapshot, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let (instances, assignments) = self
            .gatekeeper
            .run_read("balancer_snapshot", move || {
                let pool = pool.clone();
                async move {
                    let instances = ops::registry::list_eligible(&pool).await?;
                    let assignments = ops::assignments::list_live(&pool).await?;
                    Ok((instances, assignments))
                }
            })
            .await?;

        Ok(Snapshot {
            instances: instances
                .into_iter()
                .map(|i| InstanceLoad {
                    id: i.id,
                    capacity_max: i.capacity_max.max(0) as u32,
                    performance_score: i.performance_score,
                })
                .collect(),
            assignments: assignments
                .into_iter()
                .filter_map(|a| {
                    a.instance_id.map(|owner| AssignmentSlot {
                        stream_id: a.stream_id,
                        instance_id: owner,
                        assigned_at: a.assigned_at,
                    })
                })
                .collect(),
            catalog: self.catalog.snapshot().as_ref().clone(),
        })
    }

    /// Imbalance report without executing anything.
    pub async fn check(&self) -> Result<ImbalanceReport, StoreError> {
        let snapshot = self.build_snapshot().await?;
        let settings = self.gatekeeper.settings();
        Ok(balancer::detect_imbalance(
            &snapshot,
            settings.imbalance_threshold,
            settings.max_stream_difference as u32,
        ))
    }

    pub async fn stats(&self) -> Result<RebalanceStats, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let events = self
            .gatekeeper
            .run_read("rebalance_stats", move || {
                let pool = pool.clone();
                async move { ops::events::recent_events(&pool, 100).await }
            })
            .await?;

        Ok(RebalanceStats {
            total_events: events.len(),
            completed: events
                .iter()
                .filter(|e| e.outcome.as_deref() == Some("completed"))
                .count(),
            failed: events
                .iter()
                .filter(|e| e.outcome.as_deref() == Some("failed"))
                .count(),
            in_flight: events.iter().filter(|e| e.completed_at.is_none()).count(),
            last_started_at: events.first().map(|e| e.started_at),
        })
    }

    /// Evaluate the fleet and, when warranted, execute a plan.
    ///
    /// Concurrent triggers coalesce: whoever loses the guard returns
    /// immediately with `skipped = "in_progress"`. The cooldown only gates
    /// drift-triggered runs; instance churn and operators go straight through.
    pub async fn evaluate(
        &self,
        reason: RebalanceReason,
        bypass_cooldown: bool,
    ) -> Result<RebalanceSummary, StoreError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return Ok(RebalanceSummary {
                reason,
                planned: 0,
                applied: 0,
                skipped: Some("in_progress"),
            });
        };

        let settings = self.gatekeeper.settings().clone();
        if reason == RebalanceReason::Drift && !bypass_cooldown {
            let recent = self
                .last_completed
                .lock()
                .ok()
                .and_then(|g| *g)
                .map(|t| t.elapsed() < settings.rebalance_cooldown)
                .unwrap_or(false);
            if recent {
                return Ok(RebalanceSummary {
                    reason,
                    planned: 0,
                    applied: 0,
                    skipped: Some("cooldown"),
                });
            }
        }

        let snapshot = self.build_snapshot().await?;

        if reason == RebalanceReason::Drift {
            let report = balancer::detect_imbalance(
                &snapshot,
                settings.imbalance_threshold,
                settings.max_stream_difference as u32,
            );
            let needs_placement = snapshot.assignments.len() < snapshot.catalog.len();
            if !report.imbalanced && !needs_placement {
                return Ok(RebalanceSummary {
                    reason,
                    planned: 0,
                    applied: 0,
                    skipped: Some("balanced"),
                });
            }
        }

        let plan = balancer::plan(&snapshot, reason);
        if plan.is_empty() {
            return Ok(RebalanceSummary {
                reason,
                planned: 0,
                applied: 0,
                skipped: Some("empty"),
            });
        }

        let applied = self.execute(&snapshot, &plan).await?;
        if let Ok(mut guard) = self.last_completed.lock() {
            *guard = Some(Instant::now());
        }

        Ok(RebalanceSummary {
            reason,
            planned: plan.moves.len(),
            applied,
            skipped: None,
        })
    }

    /// Apply the plan in rate-limited batches, recording the audit event at
    /// start and completion. A group that fails (for example a capacity
    /// conflict from a concurrent change) is logged and skipped; the next
    /// evaluation picks the stream up again.
    async fn execute(&self, snapshot: &Snapshot, plan: &RebalancePlan) -> Result<usize, StoreError> {
        let settings = self.gatekeeper.settings().clone();
        let summary = plan.summary();
        let pool = self.gatekeeper.pool().clone();
        let reason = plan.reason;

        let event_id = self
            .gatekeeper
            .run_write("start_rebalance_event", move || {
                let pool = pool.clone();
                let summary = summary.clone();
                async move { ops::events::start_event(&pool, reason, &summary, Utc::now()).await }
            })
            .await?;

        info!(
            event = %event_id,
            reason = reason.as_str(),
            moves = plan.moves.len(),
            "executing rebalance plan"
        );

        let eligible: HashSet<&str> = snapshot.instances.iter().map(|i| i.id.as_str()).collect();
        let mut applied = 0usize;
        let mut errored = false;

        for (index, batch) in plan.moves.chunks(settings.migration_batch).enumerate() {
            if index > 0 {
                tokio::time::sleep(settings.migration_step).await;
                self.wait_for_migration_capacity().await;
            }

            // Group the batch so each (mechanism, source, target) pair is one
            // store transaction.
            let mut placements: BTreeMap<String, Vec<i64>> = BTreeMap::new();
            let mut forced: BTreeMap<String, Vec<i64>> = BTreeMap::new();
            let mut handoffs: BTreeMap<(String, String), Vec<i64>> = BTreeMap::new();
            for Move {
                stream_id,
                source,
                target,
            } in batch
            {
                match source {
                    None => placements.entry(target.clone()).or_default().push(*stream_id),
                    Some(src) if !eligible.contains(src.as_str()) => {
                        forced.entry(target.clone()).or_default().push(*stream_id)
                    }
                    Some(src) => handoffs
                        .entry((src.clone(), target.clone()))
                        .or_default()
                        .push(*stream_id),
                }
            }

            for (target, ids) in placements {
                match self.store.assign(&target, ids.clone()).await {
                    Ok(added) => applied += added.len(),
                    Err(e) => {
                        errored = true;
                        warn!(target, streams = ids.len(), error = %e, "placement failed");
                    }
                }
            }
            for (target, ids) in forced {
                match self.store.force_reassign(&target, ids.clone()).await {
                    Ok(moved) => applied += moved as usize,
                    Err(e) => {
                        errored = true;
                        warn!(target, streams = ids.len(), error = %e, "forced reassignment failed");
                    }
                }
            }
            for ((source, target), ids) in handoffs {
                match self.store.migrate(&source, &target, ids.clone()).await {
                    Ok(moved) => applied += moved as usize,
                    Err(e) => {
                        errored = true;
                        warn!(source, target, streams = ids.len(), error = %e, "migration failed");
                    }
                }
            }
        }

        let outcome = if errored {
            RebalanceOutcome::Failed
        } else {
            RebalanceOutcome::Completed
        };
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_write("complete_rebalance_event", move || {
                let pool = pool.clone();
                async move { ops::events::complete_event(&pool, event_id, outcome, Utc::now()).await }
            })
            .await?;

        info!(event = %event_id, applied, outcome = outcome.as_str(), "rebalance plan finished");
        Ok(applied)
    }

    /// Keep the number of in-flight migrations under the batch bound. Gives
    /// up after the migration timeout; the stuck-migration reaper will have
    /// resolved the stragglers by then.
    async fn wait_for_migration_capacity(&self) {
        let settings = self.gatekeeper.settings().clone();
        let deadline = Instant::now() + settings.migration_timeout;
        loop {
            let pool = self.gatekeeper.pool().clone();
            let in_flight = self
                .gatekeeper
                .run_read("migrating_count", move || {
                    let pool = pool.clone();
                    async move { ops::assignments::migrating_count(&pool).await }
                })
                .await
                .unwrap_or(0);

            if (in_flight as usize) < self.gatekeeper.settings().migration_batch
                || Instant::now() >= deadline
            {
                return;
            }
            tokio::time::sleep(settings.migration_step).await;
        }
    }
}
