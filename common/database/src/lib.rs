use std::time::Duration;

use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    Error as SqlxError,
};

/// Session-level timeouts applied to every pooled connection.
///
/// The orchestrator holds row locks across multi-row updates, so the
/// statement budget is generous but bounded; a leaked transaction is killed
/// by the idle-in-transaction timeout even if the reaper misses it.
#[derive(Debug, Clone, Copy)]
pub struct DatabaseTimeouts {
    pub statement_timeout: Duration,
    pub lock_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_in_transaction_session_timeout: Duration,
}

pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    statement_timeout: Duration::from_secs(30),
    lock_timeout: Duration::from_secs(5),
    acquire_timeout: Duration::from_secs(5),
    idle_timeout: Duration::from_secs(300),
    max_lifetime: Duration::from_secs(1800),
    idle_in_transaction_session_timeout: Duration::from_secs(60),
};

#[derive(Debug, Clone)]
pub struct PoolStats {
    pub size: u32,
    pub num_idle: usize,
}

pub fn pool_stats(pool: &PgPool) -> PoolStats {
    PoolStats {
        size: pool.size(),
        num_idle: pool.num_idle(),
    }
}

pub async fn get_pool(
    url: &str,
    app_name: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    get_pool_with_timeouts(url, app_name, max_connections, DEFAULT_TIMEOUTS).await
}

pub async fn get_pool_with_timeouts(
    url: &str,
    app_name: &str,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, sqlx::Error> {
    pool_options(app_name, max_connections, timeouts)
        .connect(url)
        .await
}

/// Like `get_pool`, but does not require the database to be reachable at
/// startup; connections are established on first use.
pub fn get_pool_lazy(
    url: &str,
    app_name: &str,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<PgPool, sqlx::Error> {
    Ok(pool_options(app_name, max_connections, timeouts).connect_lazy(url)?)
}

fn pool_options(app_name: &str, max_connections: u32, timeouts: DatabaseTimeouts) -> PgPoolOptions {
    let app_name = app_name.to_owned();
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        .idle_timeout(timeouts.idle_timeout)
        .max_lifetime(timeouts.max_lifetime)
        .after_connect(move |conn, _meta| {
            let app_name = app_name.clone();
            Box::pin(async move {
                let stmt_ms: i64 = timeouts
                    .statement_timeout
                    .as_millis()
                    .try_into()
                    .expect("statement_timeout too large");
                let lock_ms: i64 = timeouts
                    .lock_timeout
                    .as_millis()
                    .try_into()
                    .expect("lock_timeout too large");
                let idle_tx_secs: i64 = timeouts
                    .idle_in_transaction_session_timeout
                    .as_secs()
                    .try_into()
                    .expect("idle_in_transaction_session_timeout too large");

                // SET commands don't accept bind parameters.
                sqlx::query(&format!("SET statement_timeout = '{stmt_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!("SET lock_timeout = '{lock_ms}ms'"))
                    .execute(&mut *conn)
                    .await?;
                sqlx::query(&format!(
                    "SET idle_in_transaction_session_timeout = '{idle_tx_secs}s'"
                ))
                .execute(&mut *conn)
                .await?;
                // Lets the long-transaction reaper recognise its own backends.
                sqlx::query(&format!(
                    "SET application_name = '{}'",
                    app_name.replace('\'', "")
                ))
                .execute(&mut *conn)
                .await?;

                Ok(())
            })
        })
}

/// True for deadlocks and serialization failures, which deserve an
/// immediate first retry before any backoff.
pub fn is_deadlock_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();
                // 40P01 deadlock_detected, 40001 serialization_failure
                code == "40P01" || code == "40001"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("deadlock") || msg.contains("serialization")
            }
        }
        _ => false,
    }
}

/// Determines if a sqlx::Error represents a timeout-related failure
pub fn is_timeout_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::PoolTimedOut => true,
        SqlxError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => true,
        SqlxError::Protocol(msg) => msg.to_lowercase().contains("timeout"),
        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();
                // 57014 query_canceled (statement_timeout)
                // 55P03 lock_not_available (lock_timeout)
                // 25P03 idle_in_transaction_session_timeout
                code == "57014" || code == "55P03" || code == "25P03"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("timeout") || msg.contains("canceling")
            }
        }
        _ => false,
    }
}

/// Determines if a sqlx::Error represents a transient failure worth retrying
pub fn is_transient_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Io(_)
        | SqlxError::PoolTimedOut
        | SqlxError::PoolClosed
        | SqlxError::Tls(_) => true,

        SqlxError::Database(db_error) => {
            if let Some(code) = db_error.code() {
                let code = code.as_ref();
                // SQLSTATE classes, see the PostgreSQL errcodes appendix:
                // 08***  Connection Exception
                // 53***  Insufficient Resources
                // 57***  Operator Intervention
                // 58***  System Error
                // 40001  Serialization Failure
                // 40P01  Deadlock Detected
                code.starts_with("08")
                    || code.starts_with("53")
                    || code.starts_with("57")
                    || code.starts_with("58")
                    || code == "40001"
                    || code == "40P01"
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("connection")
                    || msg.contains("timeout")
                    || msg.contains("timed out")
                    || msg.contains("deadlock")
                    || msg.contains("serialization")
                    || msg.contains("terminating connection due to")
            }
        }

        SqlxError::Protocol(msg) => {
            let m = msg.to_lowercase();
            m.contains("connection") || m.contains("timeout")
        }

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::{borrow::Cow, error::Error as StdError, fmt};

    #[derive(Debug)]
    struct MockDbError {
        msg: &'static str,
        code: Option<&'static str>,
    }

    impl fmt::Display for MockDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.msg)
        }
    }

    impl StdError for MockDbError {}

    impl DatabaseError for MockDbError {
        fn message(&self) -> &str {
            self.msg
        }
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::from)
        }
        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }
        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }
        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }
    }

    fn db_err(msg: &'static str, code: Option<&'static str>) -> SqlxError {
        SqlxError::from(MockDbError { msg, code })
    }

    #[test]
    fn transient_connection_errors() {
        assert!(is_transient_error(&SqlxError::PoolTimedOut));
        assert!(is_transient_error(&SqlxError::PoolClosed));
        assert!(is_transient_error(&SqlxError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ))));
    }

    #[test]
    fn transient_sqlstate_classes() {
        assert!(is_transient_error(&db_err("connection dropped", Some("08006"))));
        assert!(is_transient_error(&db_err("no space left", Some("53100"))));
        assert!(is_transient_error(&db_err("statement timeout", Some("57014"))));
        assert!(is_transient_error(&db_err("deadlock detected", Some("40P01"))));
        assert!(is_transient_error(&db_err(
            "could not serialize access",
            Some("40001")
        )));
    }

    #[test]
    fn permanent_errors_not_transient() {
        assert!(!is_transient_error(&db_err(
            "duplicate key value violates unique constraint",
            Some("23505")
        )));
        assert!(!is_transient_error(&db_err("syntax error", Some("42601"))));
        assert!(!is_transient_error(&SqlxError::RowNotFound));
    }

    #[test]
    fn deadlock_detection() {
        assert!(is_deadlock_error(&db_err("deadlock detected", Some("40P01"))));
        assert!(is_deadlock_error(&db_err(
            "could not serialize access",
            Some("40001")
        )));
        assert!(!is_deadlock_error(&db_err("statement timeout", Some("57014"))));
        assert!(!is_deadlock_error(&SqlxError::PoolTimedOut));
    }

    #[test]
    fn timeout_detection() {
        assert!(is_timeout_error(&SqlxError::PoolTimedOut));
        assert!(is_timeout_error(&db_err(
            "canceling statement due to statement timeout",
            Some("57014")
        )));
        assert!(is_timeout_error(&db_err("lock not available", Some("55P03"))));
        assert!(!is_timeout_error(&db_err(
            "duplicate key value",
            Some("23505")
        )));
    }
}
