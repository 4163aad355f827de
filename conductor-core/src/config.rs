use std::time::Duration;

use common_database::{DatabaseTimeouts, DEFAULT_TIMEOUTS};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

// A pool config object, designed to be passable across API boundaries
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    pub db_url: String,
    pub app_name: String,
    pub max_connections: Option<u32>, // Default to 10
    pub acquire_timeout: Option<Duration>,
    pub statement_timeout: Option<Duration>,
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, sqlx::Error> {
        common_database::get_pool_with_timeouts(
            &self.db_url,
            &self.app_name,
            self.max_connections.unwrap_or(10),
            self.timeouts(),
        )
        .await
    }

    /// Build the pool without requiring the database to be up yet; the
    /// circuit breaker absorbs the failures until it is.
    pub fn connect_lazy(&self) -> Result<PgPool, sqlx::Error> {
        common_database::get_pool_lazy(
            &self.db_url,
            &self.app_name,
            self.max_connections.unwrap_or(10),
            self.timeouts(),
        )
    }

    fn timeouts(&self) -> DatabaseTimeouts {
        DatabaseTimeouts {
            acquire_timeout: self.acquire_timeout.unwrap_or(DEFAULT_TIMEOUTS.acquire_timeout),
            statement_timeout: self
                .statement_timeout
                .unwrap_or(DEFAULT_TIMEOUTS.statement_timeout),
            ..DEFAULT_TIMEOUTS
        }
    }
}

/// Tuning knobs of the control plane. Every field has the documented default
/// and is overridable from the server's environment config.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cadence advertised to workers on register.
    pub heartbeat_interval: Duration,
    /// Heartbeat silence before ACTIVE moves to WARNING.
    pub warn_threshold: Duration,
    /// Heartbeat silence before WARNING moves to INACTIVE.
    pub inactive_threshold: Duration,
    /// Silence in INACTIVE before the instance is removed.
    pub removal_timeout: Duration,
    /// Margin past `inactive_threshold` that triggers emergency recovery.
    pub emergency_threshold: Duration,
    /// Budget for moving an inactive instance's streams elsewhere.
    pub redistribution_deadline: Duration,
    /// Consecutive heartbeats required to leave RECOVERING.
    pub recovering_heartbeats: i32,
    /// EMA weight for the performance score.
    pub score_alpha: f64,

    /// Population stddev of load factors above which the fleet has drifted.
    pub imbalance_threshold: f64,
    /// Absolute stream-count spread tolerated regardless of stddev.
    pub max_stream_difference: u32,
    pub migration_batch: usize,
    pub migration_step: Duration,
    pub migration_timeout: Duration,
    pub rebalance_cooldown: Duration,

    pub txn_max_duration: Duration,
    pub pool_wait: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    pub breaker_failure_threshold: usize,
    pub breaker_recovery_timeout: Duration,
    pub breaker_success_threshold: usize,

    pub detector_interval: Duration,
    pub checker_interval: Duration,
    pub balancer_tick: Duration,
    pub catalog_refresh: Duration,
    pub reaper_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            warn_threshold: Duration::from_secs(90),
            inactive_threshold: Duration::from_secs(180),
            removal_timeout: Duration::from_secs(86_400),
            emergency_threshold: Duration::from_secs(600),
            redistribution_deadline: Duration::from_secs(60),
            recovering_heartbeats: 2,
            score_alpha: 0.3,

            imbalance_threshold: 0.15,
            max_stream_difference: 3,
            migration_batch: 50,
            migration_step: Duration::from_millis(500),
            migration_timeout: Duration::from_secs(30),
            rebalance_cooldown: Duration::from_secs(300),

            txn_max_duration: Duration::from_secs(30),
            pool_wait: Duration::from_secs(5),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(2),

            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(60),
            breaker_success_threshold: 3,

            detector_interval: Duration::from_secs(30),
            checker_interval: Duration::from_secs(120),
            balancer_tick: Duration::from_secs(60),
            catalog_refresh: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(s.warn_threshold, Duration::from_secs(90));
        assert_eq!(s.inactive_threshold, Duration::from_secs(180));
        assert_eq!(s.removal_timeout, Duration::from_secs(86_400));
        assert_eq!(s.imbalance_threshold, 0.15);
        assert_eq!(s.max_stream_difference, 3);
        assert_eq!(s.migration_batch, 50);
        assert_eq!(s.migration_step, Duration::from_millis(500));
        assert_eq!(s.migration_timeout, Duration::from_secs(30));
        assert_eq!(s.rebalance_cooldown, Duration::from_secs(300));
        assert_eq!(s.breaker_failure_threshold, 5);
        assert_eq!(s.breaker_recovery_timeout, Duration::from_secs(60));
        assert_eq!(s.breaker_success_threshold, 3);
        assert_eq!(s.recovering_heartbeats, 2);
    }
}
