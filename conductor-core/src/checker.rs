use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use crate::catalog::CatalogCache;
use crate::error::StoreError;
use crate::gatekeeper::Gatekeeper;
use crate::ops;
use crate::types::{DefectKind, DefectReport, InstanceStatus};

/// Detects and, where the resolution is unambiguous, repairs violations of
/// the assignment invariants. Every defect produces a structured report
/// whether or not a repair was applied.
pub struct ConsistencyChecker {
    gatekeeper: Arc<Gatekeeper>,
    catalog: Arc<CatalogCache>,
}

impl ConsistencyChecker {
    pub fn new(gatekeeper: Arc<Gatekeeper>, catalog: Arc<CatalogCache>) -> Self {
        Self { gatekeeper, catalog }
    }

    pub async fn run_once(&self) -> Result<Vec<DefectReport>, StoreError> {
        let mut reports = Vec::new();

        self.repair_orphans(&mut reports).await?;
        self.repair_duplicates(&mut reports).await?;
        self.repair_overflows(&mut reports).await?;
        self.resolve_stuck_migrations(&mut reports).await?;
        self.report_missing(&mut reports).await?;

        for report in &reports {
            warn!(
                kind = ?report.kind,
                streams = ?report.stream_ids,
                instances = ?report.instance_ids,
                action = %report.action,
                "consistency defect"
            );
        }

        Ok(reports)
    }

    async fn repair_orphans(&self, reports: &mut Vec<DefectReport>) -> Result<(), StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let released = self
            .gatekeeper
            .run_write("release_orphans", move || {
                let pool = pool.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let rows = ops::checker::release_orphans(&mut txn).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(rows)
                }
            })
            .await?;

        for (stream_id, instance_id) in released {
            reports.push(DefectReport {
                kind: DefectKind::OrphanAssignment,
                stream_ids: vec![stream_id],
                instance_ids: instance_id.into_iter().collect(),
                action: "released; stream returns to the next plan".to_string(),
            });
        }
        Ok(())
    }

    async fn repair_duplicates(&self, reports: &mut Vec<DefectReport>) -> Result<(), StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let duplicates = self
            .gatekeeper
            .run_read("list_duplicates", move || {
                let pool = pool.clone();
                async move { ops::assignments::list_duplicates(&pool).await }
            })
            .await?;

        for stream_id in duplicates {
            let pool = self.gatekeeper.pool().clone();
            let resolution = self
                .gatekeeper
                .run_write("resolve_duplicate", move || {
                    let pool = pool.clone();
                    async move {
                        let mut txn = pool.begin().await.map_err(StoreError::from)?;
                        let resolution = ops::checker::resolve_duplicate(&mut txn, stream_id).await?;
                        txn.commit().await.map_err(StoreError::from)?;
                        Ok(resolution)
                    }
                })
                .await?;

            if resolution.released.is_empty() {
                continue;
            }
            let action = match &resolution.kept {
                Some(kept) => format!("kept owner {kept}, released {} copies", resolution.released.len()),
                None => "no active owner; released all copies for re-planning".to_string(),
            };
            reports.push(DefectReport {
                kind: DefectKind::DuplicateAssignment,
                stream_ids: vec![stream_id],
                instance_ids: resolution.released,
                action,
            });
        }
        Ok(())
    }

    async fn repair_overflows(&self, reports: &mut Vec<DefectReport>) -> Result<(), StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let overflows = self
            .gatekeeper
            .run_read("capacity_overflows", move || {
                let pool = pool.clone();
                async move { ops::checker::capacity_overflows(&pool).await }
            })
            .await?;

        for (instance_id, owned, capacity) in overflows {
            let excess = owned - capacity;
            let pool = self.gatekeeper.pool().clone();
            let id = instance_id.clone();
            let released = self
                .gatekeeper
                .run_write("trim_overflow", move || {
                    let pool = pool.clone();
                    let id = id.clone();
                    async move {
                        let mut txn = pool.begin().await.map_err(StoreError::from)?;
                        let released = ops::checker::trim_overflow(&mut txn, &id, excess).await?;
                        txn.commit().await.map_err(StoreError::from)?;
                        Ok(released)
                    }
                })
                .await?;

            reports.push(DefectReport {
                kind: DefectKind::CapacityOverflow,
                stream_ids: released,
                instance_ids: vec![instance_id],
                action: format!("released {excess} most-recently-assigned streams over capacity {capacity}"),
            });
        }
        Ok(())
    }

    /// A migration past its deadline resolves deterministically: commit to
    /// the target when the target is ACTIVE (it is heartbeating and will see
    /// the stream on its next poll), otherwise revert to the source.
    async fn resolve_stuck_migrations(
        &self,
        reports: &mut Vec<DefectReport>,
    ) -> Result<(), StoreError> {
        let settings = self.gatekeeper.settings().clone();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(settings.migration_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let pool = self.gatekeeper.pool().clone();
        let stuck = self
            .gatekeeper
            .run_read("stale_migrations", move || {
                let pool = pool.clone();
                async move { ops::assignments::stale_migrations(&pool, cutoff).await }
            })
            .await?;

        for row in stuck {
            let pool = self.gatekeeper.pool().clone();
            let target = row.migration_target.clone();
            let stream_id = row.stream_id;
            let committed = self
                .gatekeeper
                .run_write("resolve_stuck_migration", move || {
                    let pool = pool.clone();
                    let target = target.clone();
                    async move {
                        let mut txn = pool.begin().await.map_err(StoreError::from)?;
                        let target_active = match &target {
                            Some(t) => ops::registry::get_instance(&mut *txn, t)
                                .await?
                                .map(|i| i.status == InstanceStatus::Active)
                                .unwrap_or(false),
                            None => false,
                        };
                        if target_active {
                            ops::assignments::commit_migration(&mut txn, stream_id, Utc::now())
                                .await?;
                        } else {
                            ops::assignments::revert_migration(&mut txn, stream_id, Utc::now())
                                .await?;
                        }
                        txn.commit().await.map_err(StoreError::from)?;
                        Ok(target_active)
                    }
                })
                .await?;

            let mut instance_ids: Vec<String> = row.instance_id.clone().into_iter().collect();
            instance_ids.extend(row.migration_target.clone());
            reports.push(DefectReport {
                kind: DefectKind::StuckMigration,
                stream_ids: vec![row.stream_id],
                instance_ids,
                action: if committed {
                    "committed to migration target".to_string()
                } else {
                    "reverted to source".to_string()
                },
            });
        }
        Ok(())
    }

    async fn report_missing(&self, reports: &mut Vec<DefectReport>) -> Result<(), StoreError> {
        let catalog = self.catalog.snapshot().as_ref().clone();
        if catalog.is_empty() {
            return Ok(());
        }
        let pool = self.gatekeeper.pool().clone();
        let missing = self
            .gatekeeper
            .run_read("unassigned_from", move || {
                let pool = pool.clone();
                let catalog = catalog.clone();
                async move { ops::assignments::unassigned_from(&pool, &catalog).await }
            })
            .await?;

        if !missing.is_empty() {
            reports.push(DefectReport {
                kind: DefectKind::MissingAssignment,
                stream_ids: missing,
                instance_ids: vec![],
                action: "queued for the balancer's next plan".to_string(),
            });
        }
        Ok(())
    }
}
