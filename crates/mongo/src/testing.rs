//! In-memory [`AdminClient`] for tests.
//!
//! `SimulatedCluster` keeps a model of every node (reachability, replica
//! set config, elected primary) and of the router's shard registry, and
//! answers admin commands the way a real deployment does, including the
//! error codes the orchestrator reacts to. Faults are injected per address.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use shardboot_core::topology::{ClusterTopology, NodeAddress, SeedList, ShardRegistration};
use shardboot_core::types::GroupId;

use crate::admin::{
    AdminClient, MemberStatus, RegisteredShard, ReplicaSetConfig, ReplicaSetStatus, STATE_PRIMARY,
    STATE_SECONDARY,
};
use crate::error::{codes, CommandError};

/// Simulated time an `addShard` call holds the router.
const ADD_SHARD_LATENCY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimCommand {
    Ping,
    Status,
    Initiate,
    AddShard,
    ListShards,
}

#[derive(Debug, Default)]
struct SimNode {
    /// Never answers.
    unreachable: bool,
    /// Pings to refuse before the node comes up.
    refuse_pings: u32,
    /// Pings to answer with a protocol error.
    protocol_errors: u32,
    config: Option<ReplicaSetConfig>,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: HashMap<NodeAddress, SimNode>,
    router: Option<NodeAddress>,
    /// Status polls left before a set elects its primary.
    election_delay: HashMap<GroupId, u32>,
    shards: BTreeMap<String, SeedList>,
    /// Registered shards `listShards` leaves out.
    hidden_shards: HashSet<String>,
    /// Successful `addShard` calls left before the router goes down.
    router_outage_after: Option<u32>,
    calls: HashMap<SimCommand, u32>,
    add_shard_in_flight: u32,
    max_add_shard_in_flight: u32,
}

impl SimState {
    fn record(&mut self, command: SimCommand) {
        *self.calls.entry(command).or_default() += 1;
    }

    fn node_mut(&mut self, address: &NodeAddress) -> &mut SimNode {
        self.nodes.entry(address.clone()).or_default()
    }

    fn reachable(&self, address: &NodeAddress) -> Result<(), CommandError> {
        match self.nodes.get(address) {
            Some(node) if !node.unreachable && node.refuse_pings == 0 => Ok(()),
            _ => Err(CommandError::Unreachable {
                address: address.to_string(),
                message: "connect ECONNREFUSED".to_string(),
            }),
        }
    }

    fn has_primary(&self, set: &str) -> bool {
        self.election_delay.get(set).copied().unwrap_or(0) == 0
    }
}

/// Simulated sharded deployment.
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// Every node and the router of `topology`, reachable and blank.
    pub fn from_topology(topology: &ClusterTopology) -> Self {
        let mut state = SimState::default();
        for node in topology.all_nodes() {
            state.nodes.insert(node.address, SimNode::default());
        }
        state.router = Some(topology.router().address.clone());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Fault injection ----------------------------------------------------

    pub fn set_unreachable(&self, address: &NodeAddress) {
        self.lock().node_mut(address).unreachable = true;
    }

    pub fn set_reachable(&self, address: &NodeAddress) {
        let mut state = self.lock();
        let node = state.node_mut(address);
        node.unreachable = false;
        node.refuse_pings = 0;
    }

    /// Refuse the first `pings` pings, then come up.
    pub fn reachable_after_pings(&self, address: &NodeAddress, pings: u32) {
        self.lock().node_mut(address).refuse_pings = pings;
    }

    /// Answer the next `count` pings with an `Unauthorized` error.
    pub fn inject_protocol_errors(&self, address: &NodeAddress, count: u32) {
        self.lock().node_mut(address).protocol_errors = count;
    }

    /// The set reports no primary for its first `polls` status queries
    /// after initiation.
    pub fn delay_primary(&self, set: &str, polls: u32) {
        self.lock().election_delay.insert(set.to_string(), polls);
    }

    /// Mark `config` as already applied on every member it names.
    pub fn preinitiate(&self, config: &ReplicaSetConfig) {
        let mut state = self.lock();
        for member in &config.members {
            if let Ok(address) = member.host.parse::<NodeAddress>() {
                state.node_mut(&address).config = Some(config.clone());
            }
        }
    }

    pub fn preregister_shard(&self, name: &str, seed_list: SeedList) {
        self.lock().shards.insert(name.to_string(), seed_list);
    }

    /// Keep `name` registered but leave it out of `listShards` replies.
    pub fn hide_shard(&self, name: &str) {
        self.lock().hidden_shards.insert(name.to_string());
    }

    /// The router stops answering once `registrations` shards have been
    /// added through it.
    pub fn router_down_after_registrations(&self, registrations: u32) {
        self.lock().router_outage_after = Some(registrations);
    }

    // -- Inspection ---------------------------------------------------------

    pub fn calls(&self, command: SimCommand) -> u32 {
        self.lock().calls.get(&command).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.lock().calls.values().sum()
    }

    pub fn is_initiated(&self, address: &NodeAddress) -> bool {
        self.lock()
            .nodes
            .get(address)
            .is_some_and(|n| n.config.is_some())
    }

    pub fn registered_shards(&self) -> BTreeMap<String, SeedList> {
        self.lock().shards.clone()
    }

    /// Highest number of `addShard` calls observed running at once.
    pub fn max_concurrent_add_shard(&self) -> u32 {
        self.lock().max_add_shard_in_flight
    }
}

#[async_trait]
impl AdminClient for SimulatedCluster {
    async fn ping(&self, target: &NodeAddress) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.record(SimCommand::Ping);
        let refused = || CommandError::Unreachable {
            address: target.to_string(),
            message: "connect ECONNREFUSED".to_string(),
        };
        let Some(node) = state.nodes.get_mut(target) else {
            return Err(refused());
        };
        if node.unreachable {
            return Err(refused());
        }
        if node.refuse_pings > 0 {
            node.refuse_pings -= 1;
            return Err(refused());
        }
        if node.protocol_errors > 0 {
            node.protocol_errors -= 1;
            return Err(CommandError::server(
                codes::UNAUTHORIZED,
                "Unauthorized",
                "command ping requires authentication",
            ));
        }
        Ok(())
    }

    async fn replica_set_status(
        &self,
        target: &NodeAddress,
    ) -> Result<Option<ReplicaSetStatus>, CommandError> {
        let mut state = self.lock();
        state.record(SimCommand::Status);
        state.reachable(target)?;
        let Some(config) = state.nodes.get(target).and_then(|n| n.config.clone()) else {
            return Ok(None);
        };

        let elected = state.has_primary(&config.id);
        if let Some(remaining) = state.election_delay.get_mut(&config.id) {
            *remaining = remaining.saturating_sub(1);
        }

        // The first reachable member wins the election.
        let primary = config.members.iter().find(|m| {
            m.host
                .parse::<NodeAddress>()
                .is_ok_and(|a| state.reachable(&a).is_ok())
        });
        let members = config
            .members
            .iter()
            .map(|m| {
                let is_primary = elected && primary.is_some_and(|p| p.id == m.id);
                let up = m
                    .host
                    .parse::<NodeAddress>()
                    .is_ok_and(|a| state.reachable(&a).is_ok());
                MemberStatus {
                    id: m.id,
                    name: m.host.clone(),
                    state_str: match (is_primary, up) {
                        (true, _) => STATE_PRIMARY.to_string(),
                        (false, true) => STATE_SECONDARY.to_string(),
                        (false, false) => "(not reachable/healthy)".to_string(),
                    },
                    health: if up { 1.0 } else { 0.0 },
                }
            })
            .collect();

        Ok(Some(ReplicaSetStatus {
            set_name: config.id.clone(),
            members,
        }))
    }

    async fn initiate_replica_set(
        &self,
        target: &NodeAddress,
        config: &ReplicaSetConfig,
    ) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.record(SimCommand::Initiate);
        state.reachable(target)?;

        if state.nodes.get(target).is_some_and(|n| n.config.is_some()) {
            return Err(CommandError::server(
                codes::ALREADY_INITIALIZED,
                "AlreadyInitialized",
                "already initialized",
            ));
        }

        let mut hosts = HashSet::new();
        let mut addresses = Vec::with_capacity(config.members.len());
        for member in &config.members {
            let address: NodeAddress = member.host.parse().map_err(|_| {
                CommandError::server(
                    codes::INVALID_REPLICA_SET_CONFIG,
                    "InvalidReplicaSetConfig",
                    format!("bad host {}", member.host),
                )
            })?;
            if !hosts.insert(address.clone()) {
                return Err(CommandError::server(
                    codes::INVALID_REPLICA_SET_CONFIG,
                    "InvalidReplicaSetConfig",
                    format!("duplicate host {address}"),
                ));
            }
            addresses.push(address);
        }

        if !addresses.contains(target) {
            return Err(CommandError::server(
                codes::INVALID_REPLICA_SET_CONFIG,
                "InvalidReplicaSetConfig",
                format!("{target} is not a member of the new config"),
            ));
        }

        if let Some(down) = addresses.iter().find(|a| state.reachable(a).is_err()) {
            return Err(CommandError::server(
                codes::NODE_NOT_FOUND,
                "NodeNotFound",
                format!("replSetInitiate quorum check failed because not all proposed set members responded affirmatively: {down} failed"),
            ));
        }

        for address in &addresses {
            state.node_mut(address).config = Some(config.clone());
        }
        Ok(())
    }

    async fn add_shard(
        &self,
        router: &NodeAddress,
        registration: &ShardRegistration,
    ) -> Result<(), CommandError> {
        {
            let mut state = self.lock();
            state.record(SimCommand::AddShard);
            state.reachable(router)?;
            state.add_shard_in_flight += 1;
            state.max_add_shard_in_flight = state.max_add_shard_in_flight.max(state.add_shard_in_flight);
        }

        tokio::time::sleep(ADD_SHARD_LATENCY).await;

        let mut state = self.lock();
        state.add_shard_in_flight -= 1;
        let set = registration.seed_list.set_name().to_string();

        if let Some(existing) = state.shards.get(&registration.shard_name) {
            if existing.is_equivalent(&registration.seed_list) {
                return Ok(());
            }
            return Err(CommandError::server(
                codes::OPERATION_FAILED,
                "OperationFailed",
                format!(
                    "A shard named {} already exists with host {existing}",
                    registration.shard_name
                ),
            ));
        }

        let initiated = registration.seed_list.hosts().iter().any(|a| {
            state
                .nodes
                .get(a)
                .and_then(|n| n.config.as_ref())
                .is_some_and(|c| c.id == set)
        });
        if !initiated || !state.has_primary(&set) {
            return Err(CommandError::server(
                codes::FAILED_TO_SATISFY_READ_PREFERENCE,
                "FailedToSatisfyReadPreference",
                format!("Could not find host matching read preference {{ mode: \"primary\" }} for set {set}"),
            ));
        }

        state
            .shards
            .insert(registration.shard_name.clone(), registration.seed_list.clone());
        if let Some(remaining) = state.router_outage_after.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.router_outage_after = None;
                state.node_mut(router).unreachable = true;
            }
        }
        Ok(())
    }

    async fn list_shards(&self, router: &NodeAddress) -> Result<Vec<RegisteredShard>, CommandError> {
        let mut state = self.lock();
        state.record(SimCommand::ListShards);
        state.reachable(router)?;
        Ok(state
            .shards
            .iter()
            .filter(|(name, _)| !state.hidden_shards.contains(*name))
            .map(|(name, seeds)| RegisteredShard {
                id: name.clone(),
                host: seeds.to_string(),
                state: Some(1),
            })
            .collect())
    }
}
