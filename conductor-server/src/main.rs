use std::sync::Arc;
use std::time::Duration;

use conductor_server::app_context::AppContext;
use conductor_server::config::Config;
use conductor_server::{http, tasks};
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MIGRATION_ATTEMPTS: u32 = 30;
const MIGRATION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bring the schema up, waiting out a database that is still booting. The
/// process starts serving either way; until migrations land, the breaker
/// absorbs the failures.
async fn run_migrations_with_retry(context: &AppContext) {
    for attempt in 1..=MIGRATION_ATTEMPTS {
        match conductor_core::run_migrations(context.gatekeeper.pool()).await {
            Ok(()) => {
                info!("database migrations applied");
                return;
            }
            Err(e) if attempt < MIGRATION_ATTEMPTS => {
                warn!(attempt, error = %e, "migrations failed, retrying");
                tokio::time::sleep(MIGRATION_RETRY_DELAY).await;
            }
            Err(e) => {
                error!(error = %e, "migrations failed, continuing degraded");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");
    let bind = config.bind();

    let context = Arc::new(AppContext::new(config).expect("failed to build app context"));
    info!("starting conductor orchestrator");

    run_migrations_with_retry(&context).await;

    // Warm the catalog before anything consults the balancer.
    if let Err(e) = context.catalog.refresh().await {
        warn!(error = %e, "initial catalog refresh failed, continuing with empty catalog");
    }

    let background = tasks::spawn_all(context.clone());

    let app = http::router(context);
    info!(%bind, "listening");
    let server = tokio::spawn(http::listen(app, bind));

    tokio::select! {
        res = server => {
            error!("http server exited");
            if let Ok(Err(e)) = res {
                error!("server failed with: {e}");
            }
        }
        // Every loop runs forever, so the first handle to resolve means a
        // task died (most likely a panic); surface it instead of limping on
        // with one loop fewer.
        (res, index, _) = futures::future::select_all(background) => {
            error!(task = index, "background task exited unexpectedly");
            if let Err(e) = res {
                error!("task failed with: {e}");
            }
        }
    }

    info!("exiting");
    Ok(())
}
