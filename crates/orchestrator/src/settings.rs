//! Runtime knobs for a bootstrap run.

use std::time::Duration;

use serde::Serialize;
use shardboot_core::planner::FailurePolicy;
use shardboot_mongo::mongosh::DEFAULT_COMMAND_TIMEOUT;

use crate::executor::RetryPolicy;
use crate::prober::ProbeConfig;

/// Every knob of a run. `Default` matches the CLI defaults.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapSettings {
    pub probe: ProbeConfig,
    pub retry: RetryPolicy,
    /// Whether failed shard steps abort the run or only degrade it.
    pub policy: FailurePolicy,
    /// Passed to the admin client; not enforced by the orchestrator.
    pub command_timeout: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            retry: RetryPolicy::default(),
            policy: FailurePolicy::Abort,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}
