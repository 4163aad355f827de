use std::sync::atomic::Ordering;
use std::sync::Arc;

use conductor_core::RebalanceReason;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::app_context::AppContext;
use crate::metrics_consts::*;

/// Spawn every background loop. Each loop pings its own liveness component
/// once per cycle, logs-and-continues on error, and yields to API traffic
/// when the connection pool is saturated.
pub fn spawn_all(context: Arc<AppContext>) -> Vec<JoinHandle<()>> {
    vec![
        spawn_detector(context.clone()),
        spawn_checker(context.clone()),
        spawn_balancer_tick(context.clone()),
        spawn_catalog_refresh(context.clone()),
        spawn_reaper(context),
    ]
}

fn spawn_detector(context: Arc<AppContext>) -> JoinHandle<()> {
    let interval = context.settings.detector_interval;
    let handle = context
        .liveness
        .register("failure_detector", interval * 4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if context.gatekeeper.pool_saturated() {
                info!("pool saturated, skipping failure detector cycle");
                handle.report_healthy();
                continue;
            }

            match context.detector.run_once().await {
                Ok(pass) => {
                    common_metrics::inc(DETECTOR_RUNS, &[], 1);
                    common_metrics::inc(DETECTOR_LOST_INSTANCES, &[], pass.lost.len() as u64);
                    common_metrics::inc(DETECTOR_EMERGENCIES, &[], pass.emergencies.len() as u64);
                    context.first_cycle_done.store(true, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "failure detector cycle failed"),
            }
            handle.report_healthy();
        }
    })
}

fn spawn_checker(context: Arc<AppContext>) -> JoinHandle<()> {
    let interval = context.settings.checker_interval;
    let handle = context
        .liveness
        .register("consistency_checker", interval * 4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if context.gatekeeper.pool_saturated() {
                info!("pool saturated, skipping consistency check");
                handle.report_healthy();
                continue;
            }

            match context.checker.run_once().await {
                Ok(defects) => {
                    common_metrics::inc(CHECKER_RUNS, &[], 1);
                    common_metrics::inc(CHECKER_DEFECTS, &[], defects.len() as u64);
                    context.first_cycle_done.store(true, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "consistency check failed"),
            }
            handle.report_healthy();
        }
    })
}

fn spawn_balancer_tick(context: Arc<AppContext>) -> JoinHandle<()> {
    let interval = context.settings.balancer_tick;
    let handle = context.liveness.register("balancer_tick", interval * 4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if context.gatekeeper.pool_saturated() {
                info!("pool saturated, skipping balancer tick");
                handle.report_healthy();
                continue;
            }

            match context
                .rebalancer
                .evaluate(RebalanceReason::Drift, false)
                .await
            {
                Ok(summary) if summary.skipped.is_none() => {
                    common_metrics::inc(REBALANCE_RUNS, &[], 1);
                    common_metrics::inc(REBALANCE_MOVES, &[], summary.applied as u64);
                    info!(?summary, "periodic rebalance applied");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "periodic rebalance failed"),
            }
            handle.report_healthy();
        }
    })
}

fn spawn_catalog_refresh(context: Arc<AppContext>) -> JoinHandle<()> {
    let interval = context.settings.catalog_refresh;
    let handle = context.liveness.register("catalog_refresh", interval * 4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match context.catalog.refresh().await {
                Ok(count) => {
                    common_metrics::gauge(CATALOG_STREAMS, &[], count as f64);
                }
                Err(e) => warn!(error = %e, "catalog refresh failed"),
            }
            handle.report_healthy();
        }
    })
}

fn spawn_reaper(context: Arc<AppContext>) -> JoinHandle<()> {
    let interval = context.settings.reaper_interval;
    let handle = context.liveness.register("txn_reaper", interval * 4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match context.gatekeeper.reap_long_transactions().await {
                Ok(0) => {}
                Ok(killed) => {
                    common_metrics::inc(REAPED_TRANSACTIONS, &[], killed);
                    warn!(killed, "terminated long-running transactions");
                }
                Err(e) => warn!(error = %e, "transaction reaper failed"),
            }
            handle.report_healthy();
        }
    })
}
