mod ops;

// We do this pattern (privately use a module, then re-export parts of it) so
// the internals can be reshuffled without breaking the public API.

// Types
mod types;
pub use types::AssignmentStatus;
pub use types::DefectKind;
pub use types::DefectReport;
pub use types::Instance;
pub use types::InstanceStatus;
pub use types::LoadReport;
pub use types::Move;
pub use types::RebalanceEvent;
pub use types::RebalanceOutcome;
pub use types::RebalancePlan;
pub use types::RebalanceReason;
pub use types::RegistrationOutcome;
pub use types::ReleaseOutcome;
pub use types::StreamAssignment;
pub use types::WorkerCommand;

// Errors
mod error;
pub use error::StoreError;

// Configuration
mod config;
pub use config::PoolConfig;
pub use config::Settings;

// Gatekeeper and its circuit breaker
mod breaker;
pub use breaker::BreakerState;
mod gatekeeper;
pub use gatekeeper::Gatekeeper;
pub use gatekeeper::GatekeeperHealth;

// Pure planner
pub mod balancer;

// Stores
mod assignments;
pub use assignments::AssignmentStore;
mod registry;
pub use registry::InstanceRegistry;
pub use ops::registry::HeartbeatResult;
pub use ops::registry::TransitionSweep;

// Catalog, plan execution, failure handling, reconciliation
mod catalog;
pub use catalog::CatalogCache;
mod rebalancer;
pub use rebalancer::RebalanceStats;
pub use rebalancer::RebalanceSummary;
pub use rebalancer::Rebalancer;
mod detector;
pub use detector::DetectorPass;
pub use detector::FailureDetector;
mod checker;
pub use checker::ConsistencyChecker;

// Schema management
pub use ops::meta::run_migrations;
pub use ops::meta::APP_NAME;
