use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
pub enum InstanceStatus {
    Registered,
    Active,
    Warning,
    Inactive,
    Recovering,
    Removed,
}

impl InstanceStatus {
    /// Eligible to receive new work.
    pub fn accepts_assignments(&self) -> bool {
        matches!(self, InstanceStatus::Active | InstanceStatus::Recovering)
    }
}

impl FromStr for InstanceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(InstanceStatus::Registered),
            "active" => Ok(InstanceStatus::Active),
            "warning" => Ok(InstanceStatus::Warning),
            "inactive" => Ok(InstanceStatus::Inactive),
            "recovering" => Ok(InstanceStatus::Recovering),
            "removed" => Ok(InstanceStatus::Removed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "assignment_status", rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Migrating,
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Instance {
    pub id: String,
    pub address: Option<String>,
    pub capacity_max: i32,
    pub status: InstanceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
    pub failure_count: i32,
    pub recovering_streak: i32,
    /// Why the instance last went WARNING/INACTIVE/REMOVED; cleared on the
    /// way back to ACTIVE.
    pub status_reason: Option<String>,
    pub performance_score: f64,
    #[sqlx(rename = "metadata_json")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StreamAssignment {
    pub stream_id: i64,
    pub instance_id: Option<String>,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
    pub migration_target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceReason {
    NewInstance,
    LostInstance,
    Drift,
    Manual,
}

impl RebalanceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceReason::NewInstance => "new_instance",
            RebalanceReason::LostInstance => "lost_instance",
            RebalanceReason::Drift => "drift",
            RebalanceReason::Manual => "manual",
        }
    }
}

impl FromStr for RebalanceReason {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new_instance" => Ok(RebalanceReason::NewInstance),
            "lost_instance" => Ok(RebalanceReason::LostInstance),
            "drift" => Ok(RebalanceReason::Drift),
            "manual" => Ok(RebalanceReason::Manual),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceOutcome {
    Completed,
    Failed,
    Aborted,
}

impl RebalanceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebalanceOutcome::Completed => "completed",
            RebalanceOutcome::Failed => "failed",
            RebalanceOutcome::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RebalanceEvent {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub reason: String,
    #[sqlx(rename = "plan_summary_json")]
    pub plan_summary: serde_json::Value,
    pub outcome: Option<String>,
}

/// One ownership move in a balancer plan. `source` is `None` when the stream
/// is currently unowned and is simply being placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Move {
    pub stream_id: i64,
    pub source: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebalancePlan {
    pub reason: RebalanceReason,
    pub moves: Vec<Move>,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    /// Count of moves per (source, target) pair, for the audit record.
    pub fn summary(&self) -> serde_json::Value {
        let mut counts: std::collections::BTreeMap<String, u64> = Default::default();
        for m in &self.moves {
            let key = format!(
                "{}->{}",
                m.source.as_deref().unwrap_or("(unassigned)"),
                m.target
            );
            *counts.entry(key).or_default() += 1;
        }
        serde_json::json!({ "total": self.moves.len(), "moves": counts })
    }
}

/// What a worker reports alongside a heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub load: u32,
    pub available_capacity: Option<u32>,
    /// Per-stream outcomes reported since the previous heartbeat.
    #[serde(default)]
    pub streams_ok: u32,
    #[serde(default)]
    pub streams_failed: u32,
}

/// Server-side instruction returned to a worker on heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerCommand {
    AddStream { stream_id: i64 },
    RemoveStream { stream_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    OrphanAssignment,
    DuplicateAssignment,
    CapacityOverflow,
    StuckMigration,
    MissingAssignment,
}

/// Structured record of one detected invariant violation and the repair
/// applied (or suggested, when no unambiguous repair exists).
#[derive(Debug, Clone, Serialize)]
pub struct DefectReport {
    pub kind: DefectKind,
    pub stream_ids: Vec<i64>,
    pub instance_ids: Vec<String>,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered,
    Reattached,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReleaseOutcome {
    pub released: Vec<i64>,
    /// Rows the caller did not own; releasing them is a no-op.
    pub ignored: Vec<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            InstanceStatus::Registered,
            InstanceStatus::Active,
            InstanceStatus::Warning,
            InstanceStatus::Inactive,
            InstanceStatus::Recovering,
            InstanceStatus::Removed,
        ] {
            let text = serde_json::to_string(&s).unwrap();
            let text = text.trim_matches('"');
            assert_eq!(text.parse::<InstanceStatus>().unwrap(), s);
        }
    }

    #[test]
    fn only_active_and_recovering_accept_work() {
        assert!(InstanceStatus::Active.accepts_assignments());
        assert!(InstanceStatus::Recovering.accepts_assignments());
        assert!(!InstanceStatus::Registered.accepts_assignments());
        assert!(!InstanceStatus::Warning.accepts_assignments());
        assert!(!InstanceStatus::Inactive.accepts_assignments());
        assert!(!InstanceStatus::Removed.accepts_assignments());
    }

    #[test]
    fn plan_summary_counts_moves_per_edge() {
        let plan = RebalancePlan {
            reason: RebalanceReason::Manual,
            moves: vec![
                Move {
                    stream_id: 1,
                    source: Some("a".into()),
                    target: "b".into(),
                },
                Move {
                    stream_id: 2,
                    source: Some("a".into()),
                    target: "b".into(),
                },
                Move {
                    stream_id: 3,
                    source: None,
                    target: "c".into(),
                },
            ],
        };
        let summary = plan.summary();
        assert_eq!(summary["total"], 3);
        assert_eq!(summary["moves"]["a->b"], 2);
        assert_eq!(summary["moves"]["(unassigned)->c"], 1);
    }

    #[test]
    fn worker_command_wire_format() {
        let cmd = WorkerCommand::AddStream { stream_id: 42 };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "add_stream");
        assert_eq!(json["stream_id"], 42);
    }
}
