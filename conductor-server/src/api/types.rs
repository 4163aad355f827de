use chrono::{DateTime, Utc};
use conductor_core::{
    DefectReport, GatekeeperHealth, InstanceStatus, RegistrationOutcome, WorkerCommand,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub id: String,
    pub capacity_max: u32,
    pub address: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub outcome: RegistrationOutcome,
    pub heartbeat_interval_s: u64,
    /// Streams the worker already owns (survives re-registration).
    pub initial_assignment: Vec<i64>,
    pub commands: Vec<WorkerCommand>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub id: String,
    #[serde(default)]
    pub load: u32,
    pub available_capacity: Option<u32>,
    /// Worker-side send time; used for monotonicity, not for health.
    pub sent_at: Option<DateTime<Utc>>,
    /// Opaque system metrics (cpu, memory, ...) surfaced on the instance
    /// detail endpoint.
    pub metrics: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: InstanceStatus,
    pub commands: Vec<WorkerCommand>,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub id: String,
    pub desired_count: u32,
}

#[derive(Debug, Serialize)]
pub struct AssignResponse {
    pub stream_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub id: String,
    pub stream_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReleaseResponse {
    pub released: Vec<i64>,
    pub ignored: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamUpdateStatus {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStreamRequest {
    pub id: String,
    pub stream_id: i64,
    pub status: StreamUpdateStatus,
    pub result: Option<serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ForceRecoveryRequest {
    pub id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AssignmentsQuery {
    pub instance: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AssignmentsEntry {
    pub stream_id: i64,
    pub instance_id: Option<String>,
    pub status: conductor_core::AssignmentStatus,
    pub migration_target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub status: InstanceStatus,
    pub capacity_max: i32,
    pub load: i64,
    pub performance_score: f64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct InstanceDetail {
    #[serde(flatten)]
    pub summary: InstanceSummary,
    pub registered_at: DateTime<Utc>,
    pub failure_count: i32,
    /// Why the instance last left the healthy path, when it has.
    pub status_reason: Option<String>,
    pub stream_ids: Vec<i64>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub overall: &'static str,
    pub gatekeeper: GatekeeperHealth,
    pub components: std::collections::HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub defects: Vec<DefectReport>,
}
