use sqlx::PgPool;

use crate::error::StoreError;

/// Session application_name set on every pooled connection; the reaper uses
/// it to recognise its own backends.
pub const APP_NAME: &str = "conductor";

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Fatal(format!("failed to run migrations: {e}")))
}

/// The externally managed stream catalog. Strictly read-only: the
/// orchestrator never writes to this table.
pub async fn fetch_catalog(pool: &PgPool) -> Result<Vec<i64>, StoreError> {
    let ids: Vec<i64> = sqlx::query_scalar("SELECT DISTINCT id FROM streams ORDER BY id")
        .fetch_all(pool)
        .await?;
    Ok(ids)
}

/// Kill any of our own backends whose transaction has outlived the budget.
pub async fn terminate_long_transactions(
    pool: &PgPool,
    app_name: &str,
    max_secs: f64,
) -> Result<u64, StoreError> {
    let killed: Vec<bool> = sqlx::query_scalar(
        r#"
SELECT pg_terminate_backend(pid)
FROM pg_stat_activity
WHERE datname = current_database()
  AND application_name = $1
  AND pid <> pg_backend_pid()
  AND xact_start IS NOT NULL
  AND now() - xact_start > make_interval(secs => $2)
        "#,
    )
    .bind(app_name)
    .bind(max_secs)
    .fetch_all(pool)
    .await?;

    Ok(killed.into_iter().filter(|k| *k).count() as u64)
}
