pub const REGISTRATIONS_COUNT: &str = "conductor_registrations_total";
pub const HEARTBEATS_COUNT: &str = "conductor_heartbeats_total";
pub const STALE_HEARTBEATS_COUNT: &str = "conductor_stale_heartbeats_total";
pub const STREAMS_ASSIGNED_COUNT: &str = "conductor_streams_assigned_total";
pub const STREAMS_RELEASED_COUNT: &str = "conductor_streams_released_total";

pub const DETECTOR_RUNS: &str = "conductor_detector_runs_total";
pub const DETECTOR_LOST_INSTANCES: &str = "conductor_detector_lost_instances_total";
pub const DETECTOR_EMERGENCIES: &str = "conductor_detector_emergencies_total";

pub const CHECKER_RUNS: &str = "conductor_checker_runs_total";
pub const CHECKER_DEFECTS: &str = "conductor_checker_defects_total";

pub const REBALANCE_RUNS: &str = "conductor_rebalance_runs_total";
pub const REBALANCE_MOVES: &str = "conductor_rebalance_moves_total";

pub const CATALOG_STREAMS: &str = "conductor_catalog_streams";
pub const REAPED_TRANSACTIONS: &str = "conductor_reaped_transactions_total";
