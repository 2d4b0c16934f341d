//! Pure domain logic for bootstrapping a sharded cluster.
//!
//! Topology model and validation, the step planner, step records and the
//! run state machine. Nothing in this crate performs I/O; the command
//! boundary lives in `shardboot-mongo` and execution in
//! `shardboot-orchestrator`.

pub mod declaration;
pub mod error;
pub mod planner;
pub mod records;
pub mod report;
pub mod state;
pub mod topology;
pub mod types;
