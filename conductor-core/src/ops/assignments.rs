use chrono::{DateTime, Utc};
use sqlx::PgConnection;

use crate::error::StoreError;
use crate::types::{Instance, InstanceStatus, ReleaseOutcome, StreamAssignment};

/// Lock the instance row first, then assignment rows in ascending stream id.
/// Every multi-row mutation in this module follows that order, which is what
/// keeps concurrent assignment traffic deadlock-free in the common case.
async fn lock_instance(conn: &mut PgConnection, id: &str) -> Result<Instance, StoreError> {
    sqlx::query_as::<_, Instance>("SELECT * FROM instances WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| StoreError::UnknownInstance(id.to_string()))
}

async fn lock_live_rows(
    conn: &mut PgConnection,
    stream_ids: &[i64],
) -> Result<Vec<StreamAssignment>, StoreError> {
    let rows = sqlx::query_as::<_, StreamAssignment>(
        r#"
SELECT stream_id, instance_id, status, assigned_at, migration_target
FROM assignments
WHERE stream_id = ANY($1) AND status <> 'released'
ORDER BY stream_id, id
FOR UPDATE
        "#,
    )
    .bind(stream_ids.to_vec())
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

pub async fn owned_count<'c, E>(executor: E, instance_id: &str) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assignments WHERE instance_id = $1 AND status <> 'released'",
    )
    .bind(instance_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

pub async fn counts_by_instance<'c, E>(executor: E) -> Result<Vec<(String, i64)>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, (String, i64)>(
        r#"
SELECT instance_id, COUNT(*)
FROM assignments
WHERE status <> 'released' AND instance_id IS NOT NULL
GROUP BY instance_id
ORDER BY instance_id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn list_by_instance<'c, E>(
    executor: E,
    instance_id: &str,
) -> Result<Vec<StreamAssignment>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, StreamAssignment>(
        r#"
SELECT stream_id, instance_id, status, assigned_at, migration_target
FROM assignments
WHERE instance_id = $1 AND status <> 'released'
ORDER BY stream_id
        "#,
    )
    .bind(instance_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn list_live<'c, E>(executor: E) -> Result<Vec<StreamAssignment>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, StreamAssignment>(
        r#"
SELECT stream_id, instance_id, status, assigned_at, migration_target
FROM assignments
WHERE status <> 'released'
ORDER BY stream_id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Non-released assignments pointing at a missing or removed instance.
pub async fn list_orphans<'c, E>(executor: E) -> Result<Vec<StreamAssignment>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, StreamAssignment>(
        r#"
SELECT a.stream_id, a.instance_id, a.status, a.assigned_at, a.migration_target
FROM assignments a
LEFT JOIN instances i ON i.id = a.instance_id
WHERE a.status <> 'released' AND (i.id IS NULL OR i.status = 'removed')
ORDER BY a.stream_id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Stream ids with more than one live assignment row.
pub async fn list_duplicates<'c, E>(executor: E) -> Result<Vec<i64>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows: Vec<i64> = sqlx::query_scalar(
        r#"
SELECT stream_id
FROM assignments
WHERE status <> 'released'
GROUP BY stream_id
HAVING COUNT(*) > 1
ORDER BY stream_id
        "#,
    )
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Catalog streams with no live assignment.
pub async fn unassigned_from<'c, E>(executor: E, catalog: &[i64]) -> Result<Vec<i64>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows: Vec<i64> = sqlx::query_scalar(
        r#"
SELECT s.stream_id
FROM unnest($1::bigint[]) AS s(stream_id)
WHERE NOT EXISTS (
    SELECT 1 FROM assignments a
    WHERE a.stream_id = s.stream_id AND a.status <> 'released'
)
ORDER BY s.stream_id
        "#,
    )
    .bind(catalog.to_vec())
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

/// Assign a batch to one instance. Atomic: if any stream is owned elsewhere
/// or the batch would push the instance past its capacity, nothing happens.
/// Returns the ids that were newly bound (already-owned ones are skipped).
pub async fn assign(
    conn: &mut PgConnection,
    instance_id: &str,
    stream_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<Vec<i64>, StoreError> {
    let mut ids: Vec<i64> = stream_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let instance = lock_instance(conn, instance_id).await?;
    if !instance.status.accepts_assignments() {
        return Err(StoreError::NotEligible {
            instance_id: instance_id.to_string(),
            status: status_name(instance.status),
        });
    }

    let live = lock_live_rows(conn, &ids).await?;
    for row in &live {
        if row.instance_id.as_deref() != Some(instance_id) {
            return Err(StoreError::AlreadyAssigned {
                stream_id: row.stream_id,
                owner: row.instance_id.clone().unwrap_or_default(),
            });
        }
    }

    let already_owned: std::collections::HashSet<i64> =
        live.iter().map(|r| r.stream_id).collect();
    let to_add: Vec<i64> = ids
        .iter()
        .copied()
        .filter(|id| !already_owned.contains(id))
        .collect();

    let owned = owned_count(&mut *conn, instance_id).await?;
    if owned + to_add.len() as i64 > instance.capacity_max as i64 {
        return Err(StoreError::CapacityExceeded {
            instance_id: instance_id.to_string(),
            capacity: instance.capacity_max as i64,
            requested: owned + to_add.len() as i64,
        });
    }

    if !to_add.is_empty() {
        sqlx::query(
            r#"
INSERT INTO assignments (stream_id, instance_id, status, assigned_at, migration_target)
SELECT s, $2, 'assigned', $3, NULL FROM unnest($1::bigint[]) s
            "#,
        )
        .bind(to_add.clone())
        .bind(instance_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    Ok(to_add)
}

/// Release streams owned by the caller. Rows the caller does not own are
/// reported back as ignored, which makes retries harmless.
///
/// A release of a MIGRATING row is the source confirming the handoff, so it
/// commits phase two: ownership moves to the migration target.
pub async fn release(
    conn: &mut PgConnection,
    instance_id: &str,
    stream_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<ReleaseOutcome, StoreError> {
    let mut ids: Vec<i64> = stream_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let live = lock_live_rows(conn, &ids).await?;
    let mut outcome = ReleaseOutcome::default();
    let mut to_release: Vec<i64> = Vec::new();
    let mut to_commit: Vec<i64> = Vec::new();

    let owned: std::collections::HashMap<i64, &StreamAssignment> = live
        .iter()
        .filter(|r| r.instance_id.as_deref() == Some(instance_id))
        .map(|r| (r.stream_id, r))
        .collect();

    for id in &ids {
        match owned.get(id) {
            Some(row) if row.migration_target.is_some() => to_commit.push(*id),
            Some(_) => to_release.push(*id),
            None => outcome.ignored.push(*id),
        }
    }

    if !to_release.is_empty() {
        sqlx::query(
            r#"
UPDATE assignments
SET status = 'released', migration_target = NULL
WHERE stream_id = ANY($1) AND instance_id = $2 AND status <> 'released'
            "#,
        )
        .bind(to_release.clone())
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;
    }

    if !to_commit.is_empty() {
        sqlx::query(
            r#"
UPDATE assignments
SET instance_id = migration_target,
    status = 'assigned',
    assigned_at = $3,
    migration_target = NULL
WHERE stream_id = ANY($1) AND instance_id = $2 AND status = 'migrating'
            "#,
        )
        .bind(to_commit.clone())
        .bind(instance_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    outcome.released.extend(to_release);
    outcome.released.extend(to_commit);
    outcome.released.sort_unstable();
    Ok(outcome)
}

/// Phase one of a migration: mark rows owned by `source` as MIGRATING toward
/// `target`. Ownership moves when the source releases or the stuck-migration
/// reaper resolves the row. Returns how many rows entered migration.
pub async fn begin_migration(
    conn: &mut PgConnection,
    source: &str,
    target: &str,
    stream_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut ids: Vec<i64> = stream_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let instance = lock_instance(conn, target).await?;
    if !instance.status.accepts_assignments() {
        return Err(StoreError::NotEligible {
            instance_id: target.to_string(),
            status: status_name(instance.status),
        });
    }

    // Inbound migrations count against the target's capacity up front so
    // committing phase two can never overflow it.
    let inbound: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assignments WHERE migration_target = $1 AND status = 'migrating'",
    )
    .bind(target)
    .fetch_one(&mut *conn)
    .await?;
    let owned = owned_count(&mut *conn, target).await?;
    if owned + inbound + ids.len() as i64 > instance.capacity_max as i64 {
        return Err(StoreError::CapacityExceeded {
            instance_id: target.to_string(),
            capacity: instance.capacity_max as i64,
            requested: owned + inbound + ids.len() as i64,
        });
    }

    let updated = sqlx::query(
        r#"
UPDATE assignments
SET status = 'migrating', migration_target = $3, assigned_at = $4
WHERE stream_id = ANY($1) AND instance_id = $2 AND status = 'assigned'
        "#,
    )
    .bind(ids)
    .bind(source)
    .bind(target)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(updated.rows_affected())
}

/// Move streams to `target` regardless of their current owner. Used when the
/// source is dead and a cooperative handoff is pointless: old rows are
/// released and fresh ownership rows are written in one transaction.
pub async fn force_reassign(
    conn: &mut PgConnection,
    target: &str,
    stream_ids: &[i64],
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut ids: Vec<i64> = stream_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();

    let instance = lock_instance(conn, target).await?;
    if !instance.status.accepts_assignments() {
        return Err(StoreError::NotEligible {
            instance_id: target.to_string(),
            status: status_name(instance.status),
        });
    }

    let _live = lock_live_rows(conn, &ids).await?;
    let owned = owned_count(&mut *conn, target).await?;
    if owned + ids.len() as i64 > instance.capacity_max as i64 {
        return Err(StoreError::CapacityExceeded {
            instance_id: target.to_string(),
            capacity: instance.capacity_max as i64,
            requested: owned + ids.len() as i64,
        });
    }

    sqlx::query(
        r#"
UPDATE assignments
SET status = 'released', migration_target = NULL
WHERE stream_id = ANY($1) AND status <> 'released' AND instance_id IS DISTINCT FROM $2
        "#,
    )
    .bind(ids.clone())
    .bind(target)
    .execute(&mut *conn)
    .await?;

    let inserted = sqlx::query(
        r#"
INSERT INTO assignments (stream_id, instance_id, status, assigned_at, migration_target)
SELECT s, $2, 'assigned', $3, NULL
FROM unnest($1::bigint[]) s
WHERE NOT EXISTS (
    SELECT 1 FROM assignments a WHERE a.stream_id = s AND a.status <> 'released'
)
        "#,
    )
    .bind(ids)
    .bind(target)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(inserted.rows_affected())
}

/// Release everything an instance owns, including in-flight outbound
/// migrations. Safe to repeat; releasing nothing is a no-op.
pub async fn force_release_instance(
    conn: &mut PgConnection,
    instance_id: &str,
) -> Result<Vec<i64>, StoreError> {
    let released: Vec<i64> = sqlx::query_scalar(
        r#"
UPDATE assignments
SET status = 'released', migration_target = NULL
WHERE instance_id = $1 AND status <> 'released'
RETURNING stream_id
        "#,
    )
    .bind(instance_id)
    .fetch_all(conn)
    .await?;
    Ok(released)
}

/// Rows being handed to this instance (it is the migration target).
pub async fn inbound_migrations<'c, E>(
    executor: E,
    instance_id: &str,
) -> Result<Vec<i64>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows: Vec<i64> = sqlx::query_scalar(
        r#"
SELECT stream_id FROM assignments
WHERE migration_target = $1 AND status = 'migrating'
ORDER BY stream_id
        "#,
    )
    .bind(instance_id)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn migrating_count<'c, E>(executor: E) -> Result<i64, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM assignments WHERE status = 'migrating'")
            .fetch_one(executor)
            .await?;
    Ok(count)
}

/// Rows stuck in MIGRATING since before `cutoff`.
pub async fn stale_migrations<'c, E>(
    executor: E,
    cutoff: DateTime<Utc>,
) -> Result<Vec<StreamAssignment>, StoreError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows = sqlx::query_as::<_, StreamAssignment>(
        r#"
SELECT stream_id, instance_id, status, assigned_at, migration_target
FROM assignments
WHERE status = 'migrating' AND assigned_at < $1
ORDER BY stream_id
        "#,
    )
    .bind(cutoff)
    .fetch_all(executor)
    .await?;
    Ok(rows)
}

pub async fn commit_migration(
    conn: &mut PgConnection,
    stream_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let updated = sqlx::query(
        r#"
UPDATE assignments
SET instance_id = migration_target,
    status = 'assigned',
    assigned_at = $2,
    migration_target = NULL
WHERE stream_id = $1 AND status = 'migrating' AND migration_target IS NOT NULL
        "#,
    )
    .bind(stream_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(updated.rows_affected() > 0)
}

pub async fn revert_migration(
    conn: &mut PgConnection,
    stream_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let updated = sqlx::query(
        r#"
UPDATE assignments
SET status = 'assigned', assigned_at = $2, migration_target = NULL
WHERE stream_id = $1 AND status = 'migrating'
        "#,
    )
    .bind(stream_id)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(updated.rows_affected() > 0)
}

fn status_name(status: InstanceStatus) -> &'static str {
    match status {
        InstanceStatus::Registered => "registered",
        InstanceStatus::Active => "active",
        InstanceStatus::Warning => "warning",
        InstanceStatus::Inactive => "inactive",
        InstanceStatus::Recovering => "recovering",
        InstanceStatus::Removed => "removed",
    }
}
