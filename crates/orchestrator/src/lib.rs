//! Execution side of shardboot: readiness probing, the idempotent
//! initialization actions, and the run orchestrator that ties them to a
//! bootstrap plan.

pub mod executor;
pub mod orchestrator;
pub mod prober;
pub mod settings;

pub use orchestrator::Orchestrator;
pub use settings::BootstrapSettings;
