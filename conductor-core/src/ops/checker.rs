use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::StoreError;
use crate::types::InstanceStatus;

/// Release every live assignment that references a missing or removed
/// instance. Returns (stream_id, former instance id) pairs.
pub async fn release_orphans(
    conn: &mut PgConnection,
) -> Result<Vec<(i64, Option<String>)>, StoreError> {
    let rows = sqlx::query_as::<_, (i64, Option<String>)>(
        r#"
WITH orphaned AS (
    SELECT a.id
    FROM assignments a
    LEFT JOIN instances i ON i.id = a.instance_id
    WHERE a.status <> 'released' AND (i.id IS NULL OR i.status = 'removed')
    ORDER BY a.stream_id, a.id
    FOR UPDATE OF a
)
UPDATE assignments
SET status = 'released', migration_target = NULL
FROM orphaned
WHERE assignments.id = orphaned.id
RETURNING assignments.stream_id, assignments.instance_id
        "#,
    )
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateRow {
    id: i64,
    instance_id: Option<String>,
    instance_status: Option<InstanceStatus>,
    last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct DuplicateResolution {
    pub kept: Option<String>,
    pub released: Vec<String>,
}

/// Resolve a stream with more than one live row: keep the copy on the
/// most-recently-heartbeating ACTIVE instance, release the rest. With no
/// ACTIVE candidate everything is released and the stream goes back to the
/// balancer's next plan.
pub async fn resolve_duplicate(
    conn: &mut PgConnection,
    stream_id: i64,
) -> Result<DuplicateResolution, StoreError> {
    let rows = sqlx::query_as::<_, DuplicateRow>(
        r#"
SELECT a.id, a.instance_id, i.status AS instance_status, i.last_heartbeat
FROM assignments a
LEFT JOIN instances i ON i.id = a.instance_id
WHERE a.stream_id = $1 AND a.status <> 'released'
ORDER BY a.id
FOR UPDATE OF a
        "#,
    )
    .bind(stream_id)
    .fetch_all(&mut *conn)
    .await?;

    if rows.len() < 2 {
        // Repaired concurrently; nothing to do.
        return Ok(DuplicateResolution {
            kept: rows.first().and_then(|r| r.instance_id.clone()),
            released: Vec::new(),
        });
    }

    let keeper = rows
        .iter()
        .filter(|r| r.instance_status == Some(InstanceStatus::Active))
        .max_by_key(|r| (r.last_heartbeat, std::cmp::Reverse(r.id)))
        .map(|r| r.id);

    let mut released = Vec::new();
    for row in &rows {
        if Some(row.id) == keeper {
            continue;
        }
        sqlx::query(
            "UPDATE assignments SET status = 'released', migration_target = NULL WHERE id = $1",
        )
        .bind(row.id)
        .execute(&mut *conn)
        .await?;
        released.push(row.instance_id.clone().unwrap_or_default());
    }

    let kept = keeper.and_then(|id| {
        rows.iter()
            .find(|r| r.id == id)
            .and_then(|r| r.instance_id.clone())
    });

    Ok(DuplicateResolution { kept, released })
}

/// Instances holding more live assignments than their capacity allows.
pub async fn capacity_overflows<'c, E>(executor: E) -> Result<Vec<(String, i64, i64)>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, (String, i64, i64)>(
        r#"
SELECT i.id, COUNT(a.id), i.capacity_max::bigint
FROM instances i
JOIN assignments a ON a.instance_id = i.id AND a.status <> 'released'
GROUP BY i.id, i.capacity_max
HAVING COUNT(a.id) > i.capacity_max
ORDER BY i.id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Shed the most-recently-assigned excess streams from an overloaded
/// instance so the oldest work stays put.
pub async fn trim_overflow(
    conn: &mut PgConnection,
    instance_id: &str,
    excess: i64,
) -> Result<Vec<i64>, StoreError> {
    let released: Vec<i64> = sqlx::query_scalar(
        r#"
WITH excess AS (
    SELECT id
    FROM assignments
    WHERE instance_id = $1 AND status <> 'released'
    ORDER BY assigned_at DESC, stream_id DESC
    LIMIT $2
    FOR UPDATE
)
UPDATE assignments
SET status = 'released', migration_target = NULL
FROM excess
WHERE assignments.id = excess.id
RETURNING assignments.stream_id
        "#,
    )
    .bind(instance_id)
    .bind(excess)
    .fetch_all(conn)
    .await?;
    Ok(released)
}
