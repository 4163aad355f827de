use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{RebalanceEvent, RebalanceOutcome, RebalanceReason};

/// Append the audit record for a plan that is starting. The row is updated
/// exactly once when the plan concludes and is immutable thereafter.
pub async fn start_event<'c, E>(
    executor: E,
    reason: RebalanceReason,
    plan_summary: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<Uuid, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let id = Uuid::now_v7();
    sqlx::query(
        r#"
INSERT INTO rebalance_events (id, started_at, completed_at, reason, plan_summary_json, outcome)
VALUES ($1, $2, NULL, $3, $4, NULL)
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(reason.as_str())
    .bind(plan_summary)
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn complete_event<'c, E>(
    executor: E,
    id: Uuid,
    outcome: RebalanceOutcome,
    now: DateTime<Utc>,
) -> Result<(), StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE rebalance_events
SET completed_at = $2, outcome = $3
WHERE id = $1 AND completed_at IS NULL
        "#,
    )
    .bind(id)
    .bind(now)
    .bind(outcome.as_str())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn recent_events<'c, E>(
    executor: E,
    limit: i64,
) -> Result<Vec<RebalanceEvent>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, RebalanceEvent>(
        "SELECT * FROM rebalance_events ORDER BY started_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// True while a started plan has not yet recorded its outcome.
pub async fn has_in_flight_event<'c, E>(executor: E) -> Result<bool, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM rebalance_events WHERE completed_at IS NULL")
            .fetch_one(executor)
            .await?;
    Ok(count > 0)
}
