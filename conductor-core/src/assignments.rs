use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::gatekeeper::Gatekeeper;
use crate::ops::assignments as ops;
use crate::types::{ReleaseOutcome, StreamAssignment};

/// Sole owner of assignment rows. Enforces the single-owner and capacity
/// invariants under row locks; nothing else mutates the table.
pub struct AssignmentStore {
    gatekeeper: Arc<Gatekeeper>,
}

impl AssignmentStore {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }

    /// Atomically bind a batch of streams to an instance.
    pub async fn assign(
        &self,
        instance_id: &str,
        stream_ids: Vec<i64>,
    ) -> Result<Vec<i64>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let instance_id = instance_id.to_string();
        self.gatekeeper
            .run_write("assign_streams", move || {
                let pool = pool.clone();
                let instance_id = instance_id.clone();
                let stream_ids = stream_ids.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let added =
                        ops::assign(&mut txn, &instance_id, &stream_ids, Utc::now()).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(added)
                }
            })
            .await
    }

    /// Return ownership of a batch. Unowned rows are reported as ignored;
    /// releasing a MIGRATING row commits the handoff to its target.
    pub async fn release(
        &self,
        instance_id: &str,
        stream_ids: Vec<i64>,
    ) -> Result<ReleaseOutcome, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let instance_id = instance_id.to_string();
        self.gatekeeper
            .run_write("release_streams", move || {
                let pool = pool.clone();
                let instance_id = instance_id.clone();
                let stream_ids = stream_ids.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let outcome =
                        ops::release(&mut txn, &instance_id, &stream_ids, Utc::now()).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(outcome)
                }
            })
            .await
    }

    /// Phase one of a two-phase handoff from a live source.
    pub async fn migrate(
        &self,
        source: &str,
        target: &str,
        stream_ids: Vec<i64>,
    ) -> Result<u64, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let source = source.to_string();
        let target = target.to_string();
        self.gatekeeper
            .run_write("begin_migration", move || {
                let pool = pool.clone();
                let source = source.clone();
                let target = target.clone();
                let stream_ids = stream_ids.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let moved =
                        ops::begin_migration(&mut txn, &source, &target, &stream_ids, Utc::now())
                            .await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(moved)
                }
            })
            .await
    }

    /// Reassign streams whose owner is dead; no cooperative handoff.
    pub async fn force_reassign(
        &self,
        target: &str,
        stream_ids: Vec<i64>,
    ) -> Result<u64, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let target = target.to_string();
        self.gatekeeper
            .run_write("force_reassign", move || {
                let pool = pool.clone();
                let target = target.clone();
                let stream_ids = stream_ids.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let moved =
                        ops::force_reassign(&mut txn, &target, &stream_ids, Utc::now()).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(moved)
                }
            })
            .await
    }

    /// Release everything an instance owns. Idempotent.
    pub async fn force_release_instance(&self, instance_id: &str) -> Result<Vec<i64>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let instance_id = instance_id.to_string();
        self.gatekeeper
            .run_write("force_release_instance", move || {
                let pool = pool.clone();
                let instance_id = instance_id.clone();
                async move {
                    let mut txn = pool.begin().await.map_err(StoreError::from)?;
                    let released = ops::force_release_instance(&mut txn, &instance_id).await?;
                    txn.commit().await.map_err(StoreError::from)?;
                    Ok(released)
                }
            })
            .await
    }

    pub async fn list_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Vec<StreamAssignment>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let instance_id = instance_id.to_string();
        self.gatekeeper
            .run_read("list_by_instance", move || {
                let pool = pool.clone();
                let instance_id = instance_id.clone();
                async move { ops::list_by_instance(&pool, &instance_id).await }
            })
            .await
    }

    pub async fn list_live(&self) -> Result<Vec<StreamAssignment>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("list_live", move || {
                let pool = pool.clone();
                async move { ops::list_live(&pool).await }
            })
            .await
    }

    pub async fn list_orphans(&self) -> Result<Vec<StreamAssignment>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("list_orphans", move || {
                let pool = pool.clone();
                async move { ops::list_orphans(&pool).await }
            })
            .await
    }

    pub async fn list_duplicates(&self) -> Result<Vec<i64>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("list_duplicates", move || {
                let pool = pool.clone();
                async move { ops::list_duplicates(&pool).await }
            })
            .await
    }

    pub async fn counts_by_instance(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("counts_by_instance", move || {
                let pool = pool.clone();
                async move { ops::counts_by_instance(&pool).await }
            })
            .await
    }

    /// Catalog streams with no live assignment.
    pub async fn unassigned_from(&self, catalog: Vec<i64>) -> Result<Vec<i64>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("unassigned_from", move || {
                let pool = pool.clone();
                let catalog = catalog.clone();
                async move { ops::unassigned_from(&pool, &catalog).await }
            })
            .await
    }

    /// Streams being migrated toward this instance.
    pub async fn inbound_migrations(&self, instance_id: &str) -> Result<Vec<i64>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        let instance_id = instance_id.to_string();
        self.gatekeeper
            .run_read("inbound_migrations", move || {
                let pool = pool.clone();
                let instance_id = instance_id.clone();
                async move { ops::inbound_migrations(&pool, &instance_id).await }
            })
            .await
    }

    pub async fn stale_migrations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StreamAssignment>, StoreError> {
        let pool = self.gatekeeper.pool().clone();
        self.gatekeeper
            .run_read("stale_migrations", move || {
                let pool = pool.clone();
                async move { ops::stale_migrations(&pool, cutoff).await }
            })
            .await
    }
}
