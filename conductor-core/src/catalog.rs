use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::error::StoreError;
use crate::ops::meta;

/// Read-only cache of the externally managed stream catalog.
///
/// The `streams` table belongs to another system; the orchestrator only ever
/// reads it, on a slow tick, and works from the cached snapshot in between.
/// The cache may be served from a different database than the control tables,
/// so it holds its own pool handle.
pub struct CatalogCache {
    pool: PgPool,
    cache: RwLock<Arc<Vec<i64>>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl CatalogCache {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: RwLock::new(Arc::new(Vec::new())),
            refreshed_at: RwLock::new(None),
        }
    }

    pub async fn refresh(&self) -> Result<usize, StoreError> {
        let ids = meta::fetch_catalog(&self.pool).await?;
        let count = ids.len();
        if let Ok(mut guard) = self.cache.write() {
            *guard = Arc::new(ids);
        }
        if let Ok(mut guard) = self.refreshed_at.write() {
            *guard = Some(Utc::now());
        }
        info!(streams = count, "stream catalog refreshed");
        Ok(count)
    }

    /// Current snapshot; empty until the first successful refresh.
    pub fn snapshot(&self) -> Arc<Vec<i64>> {
        self.cache
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at.read().ok().and_then(|g| *g)
    }

    #[doc(hidden)]
    pub fn set_for_tests(&self, ids: Vec<i64>) {
        if let Ok(mut guard) = self.cache.write() {
            *guard = Arc::new(ids);
        }
    }
}
