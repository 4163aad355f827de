use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::StoreError;
use crate::types::{Instance, InstanceStatus, RegistrationOutcome};

pub async fn get_instance<'c, E>(executor: E, id: &str) -> Result<Option<Instance>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row = sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn list_instances<'c, E>(executor: E) -> Result<Vec<Instance>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, Instance>("SELECT * FROM instances ORDER BY id")
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// Instances eligible to receive new work: ACTIVE or RECOVERING.
pub async fn list_eligible<'c, E>(executor: E) -> Result<Vec<Instance>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, Instance>(
        "SELECT * FROM instances WHERE status IN ('active', 'recovering') ORDER BY id",
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Create-or-reattach. A returning worker keeps its `registered_at` and its
/// assignments; its failure count is forgiven and it restarts the state
/// machine from REGISTERED.
pub async fn register(
    conn: &mut PgConnection,
    id: &str,
    address: Option<&str>,
    capacity_max: i32,
    metadata: Option<&serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<RegistrationOutcome, StoreError> {
    let existing = sqlx::query_scalar::<_, String>("SELECT id FROM instances WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    if existing.is_some() {
        sqlx::query(
            r#"
UPDATE instances
SET address = $2,
    capacity_max = $3,
    status = 'registered',
    failure_count = 0,
    recovering_streak = 0,
    status_reason = NULL,
    metadata_json = COALESCE($4, metadata_json)
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(address)
        .bind(capacity_max)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
        Ok(RegistrationOutcome::Reattached)
    } else {
        sqlx::query(
            r#"
INSERT INTO instances
    (id, address, capacity_max, status, last_heartbeat, registered_at,
     failure_count, recovering_streak, performance_score, metadata_json)
VALUES
    ($1, $2, $3, 'registered', NULL, $4, 0, 0, 1.0, $5)
            "#,
        )
        .bind(id)
        .bind(address)
        .bind(capacity_max)
        .bind(now)
        .bind(metadata)
        .execute(&mut *conn)
        .await?;
        Ok(RegistrationOutcome::Registered)
    }
}

pub struct HeartbeatResult {
    pub instance: Instance,
    /// The heartbeat completed a REGISTERED->ACTIVE or RECOVERING->ACTIVE
    /// transition; the caller should evaluate a NEW_INSTANCE rebalance.
    pub became_active: bool,
}

/// Apply one heartbeat under a row lock: monotonicity check, state machine
/// step, and the performance-score EMA.
pub async fn record_heartbeat(
    conn: &mut PgConnection,
    id: &str,
    sent_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    signal: f64,
    alpha: f64,
    recovering_heartbeats: i32,
) -> Result<HeartbeatResult, StoreError> {
    let Some(current) =
        sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
    else {
        return Err(StoreError::UnknownInstance(id.to_string()));
    };

    if current.status == InstanceStatus::Removed {
        return Err(StoreError::UnknownInstance(id.to_string()));
    }

    // Out-of-order heartbeats never move the state machine backward.
    if let (Some(sent), Some(last)) = (sent_at, current.last_heartbeat) {
        if sent <= last {
            return Err(StoreError::StaleHeartbeat(id.to_string()));
        }
    }

    let mut streak = current.recovering_streak;
    let mut failure_count = current.failure_count;
    let next_status = match current.status {
        InstanceStatus::Registered | InstanceStatus::Warning => InstanceStatus::Active,
        InstanceStatus::Active => InstanceStatus::Active,
        InstanceStatus::Inactive => {
            streak = 1;
            InstanceStatus::Recovering
        }
        InstanceStatus::Recovering => {
            streak += 1;
            if streak >= recovering_heartbeats {
                // Clean recovery: the failure streak is forgiven.
                streak = 0;
                failure_count = 0;
                InstanceStatus::Active
            } else {
                InstanceStatus::Recovering
            }
        }
        InstanceStatus::Removed => unreachable!("rejected above"),
    };

    let became_active = next_status == InstanceStatus::Active
        && matches!(
            current.status,
            InstanceStatus::Registered | InstanceStatus::Recovering
        );

    let score = (alpha * signal.clamp(0.0, 1.0)) + ((1.0 - alpha) * current.performance_score);

    let instance = sqlx::query_as::<_, Instance>(
        r#"
UPDATE instances
SET status = $2,
    last_heartbeat = $3,
    recovering_streak = $4,
    failure_count = $5,
    performance_score = $6,
    status_reason = NULL
WHERE id = $1
RETURNING *
        "#,
    )
    .bind(id)
    .bind(next_status)
    .bind(now)
    .bind(streak)
    .bind(failure_count)
    .bind(score)
    .fetch_one(&mut *conn)
    .await?;

    Ok(HeartbeatResult {
        instance,
        became_active,
    })
}

#[derive(Debug, Default)]
pub struct TransitionSweep {
    pub warned: Vec<String>,
    pub lost: Vec<String>,
    pub removed: Vec<String>,
}

impl TransitionSweep {
    pub fn is_empty(&self) -> bool {
        self.warned.is_empty() && self.lost.is_empty() && self.removed.is_empty()
    }
}

/// One pass of the heartbeat-silence state machine. Returns which instances
/// moved so the failure detector can react (redistribute, log, audit).
pub async fn scan_transitions(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    warn_after: chrono::Duration,
    inactive_after: chrono::Duration,
    removal_after: chrono::Duration,
) -> Result<TransitionSweep, StoreError> {
    let warned: Vec<String> = sqlx::query_scalar(
        r#"
UPDATE instances
SET status = 'warning',
    status_reason = 'heartbeat overdue'
WHERE status = 'active' AND COALESCE(last_heartbeat, registered_at) < $1
RETURNING id
        "#,
    )
    .bind(now - warn_after)
    .fetch_all(&mut *conn)
    .await?;

    // REGISTERED instances that never sent a heartbeat go straight to
    // INACTIVE once the same silence budget is spent.
    let lost: Vec<String> = sqlx::query_scalar(
        r#"
UPDATE instances
SET status = 'inactive',
    failure_count = failure_count + 1,
    recovering_streak = 0,
    status_reason = 'heartbeat silence exceeded inactive threshold'
WHERE status IN ('warning', 'registered', 'recovering')
  AND COALESCE(last_heartbeat, registered_at) < $1
RETURNING id
        "#,
    )
    .bind(now - inactive_after)
    .fetch_all(&mut *conn)
    .await?;

    let removed: Vec<String> = sqlx::query_scalar(
        r#"
UPDATE instances
SET status = 'removed',
    status_reason = 'inactive past removal timeout'
WHERE status = 'inactive' AND COALESCE(last_heartbeat, registered_at) < $1
RETURNING id
        "#,
    )
    .bind(now - removal_after)
    .fetch_all(&mut *conn)
    .await?;

    Ok(TransitionSweep {
        warned,
        lost,
        removed,
    })
}

/// Merge the latest worker-reported system metrics into the instance's
/// metadata blob. Observability only; placement never reads this.
pub async fn store_metrics<'c, E>(
    executor: E,
    id: &str,
    metrics: &serde_json::Value,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE instances
SET metadata_json = jsonb_set(COALESCE(metadata_json, '{}'::jsonb), '{metrics}', $2)
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(metrics)
    .execute(executor)
    .await?;
    Ok(())
}

/// Inactive instances that have been silent since before `cutoff` yet still
/// hold live assignments. These are candidates for emergency recovery.
pub async fn list_emergency_candidates<'c, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<String>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let ids: Vec<String> = sqlx::query_scalar(
        r#"
SELECT DISTINCT i.id
FROM instances i
JOIN assignments a ON a.instance_id = i.id AND a.status <> 'released'
WHERE i.status = 'inactive' AND COALESCE(i.last_heartbeat, i.registered_at) < $1
ORDER BY i.id
        "#,
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await?;
    Ok(ids)
}

/// Idempotent: already-inactive and removed instances are left alone. The
/// reason is persisted on the row so the cause of the transition survives
/// the process that decided it.
pub async fn mark_inactive(
    conn: &mut PgConnection,
    id: &str,
    reason: &str,
) -> Result<bool, StoreError> {
    let updated = sqlx::query(
        r#"
UPDATE instances
SET status = 'inactive', recovering_streak = 0, status_reason = $2
WHERE id = $1 AND status NOT IN ('inactive', 'removed')
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(conn)
    .await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn mark_removed(conn: &mut PgConnection, id: &str) -> Result<bool, StoreError> {
    let updated = sqlx::query("UPDATE instances SET status = 'removed' WHERE id = $1 AND status <> 'removed'")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(updated.rows_affected() > 0)
}
