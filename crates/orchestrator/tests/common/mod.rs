#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use shardboot_core::planner::FailurePolicy;
use shardboot_core::topology::{
    ClusterTopology, GroupKind, NodeAddress, ReplicaGroupSpec, RouterSpec,
};
use shardboot_core::types::NodeId;
use shardboot_mongo::admin::AdminClient;
use shardboot_mongo::testing::SimulatedCluster;
use shardboot_orchestrator::executor::RetryPolicy;
use shardboot_orchestrator::prober::{Backoff, ProbeConfig};
use shardboot_orchestrator::{BootstrapSettings, Orchestrator};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("localhost", port)
}

pub fn group(id: &str, kind: GroupKind, first_port: u16) -> ReplicaGroupSpec {
    ReplicaGroupSpec::new(
        id,
        kind,
        (0..3u16).map(|i| (i as NodeId, addr(first_port + i))),
    )
}

/// `configReplSet` on 27020-27022, `shardN` on 27023+3(N-1), router on 27017.
pub fn topology(shards: usize) -> ClusterTopology {
    let shards = (0..shards)
        .map(|i| group(&format!("shard{}", i + 1), GroupKind::ShardSet, 27023 + 3 * i as u16))
        .collect();
    ClusterTopology::new(
        group("configReplSet", GroupKind::ConfigServerSet, 27020),
        shards,
        RouterSpec::new(addr(27017)),
    )
    .expect("test topology is valid")
}

/// Short timeouts so paused-clock tests finish quickly.
pub fn fast_settings(policy: FailurePolicy) -> BootstrapSettings {
    BootstrapSettings {
        probe: ProbeConfig {
            timeout: PROBE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            backoff: Backoff::Fixed,
            max_consecutive_protocol_errors: 3,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            step: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        policy,
        ..Default::default()
    }
}

pub fn probe_config() -> ProbeConfig {
    fast_settings(FailurePolicy::Abort).probe
}

pub fn simulated(topology: &ClusterTopology) -> Arc<SimulatedCluster> {
    Arc::new(SimulatedCluster::from_topology(topology))
}

pub fn client(sim: &Arc<SimulatedCluster>) -> Arc<dyn AdminClient> {
    Arc::clone(sim) as Arc<dyn AdminClient>
}

pub fn orchestrator(sim: &Arc<SimulatedCluster>, policy: FailurePolicy) -> Orchestrator {
    Orchestrator::new(client(sim), fast_settings(policy))
}
