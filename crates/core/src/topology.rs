//! Declarative cluster topology: nodes, replica groups, router.
//!
//! A [`ClusterTopology`] is built once from configuration and never
//! mutated afterwards. Construction runs the structural checks, so holding
//! a `ClusterTopology` means the shape is valid: no empty groups, no
//! duplicate names, ids or addresses.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::types::{GroupId, NodeId};

/// Fewer members than this still works but cannot survive a node loss.
pub const RECOMMENDED_MIN_MEMBERS: usize = 3;

/// Group id used for the router when the topology does not name it.
pub const DEFAULT_ROUTER_NAME: &str = "router";

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

/// Network address of a single node, rendered as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    host: String,
    port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TopologyError::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(value: NodeAddress) -> Self {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Nodes and groups
// ---------------------------------------------------------------------------

/// What a node runs as; decides its launch flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ConfigServer,
    ShardMember,
    Router,
}

impl NodeRole {
    /// Name used in logs and the topology file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigServer => "config_server",
            Self::ShardMember => "shard_member",
            Self::Router => "router",
        }
    }
}

/// One database node process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub address: NodeAddress,
    pub role: NodeRole,
    /// Owning replica group, or the router name for the router.
    pub group_id: GroupId,
    /// Data directory used when the node is launched locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Config-server set or shard set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    ConfigServerSet,
    ShardSet,
}

impl GroupKind {
    /// Role of every member of a group of this kind.
    pub fn member_role(&self) -> NodeRole {
        match self {
            Self::ConfigServerSet => NodeRole::ConfigServer,
            Self::ShardSet => NodeRole::ShardMember,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigServerSet => "config_server_set",
            Self::ShardSet => "shard_set",
        }
    }
}

/// A replica group: the config-server set or one shard set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaGroupSpec {
    pub id: GroupId,
    pub kind: GroupKind,
    pub members: Vec<NodeSpec>,
    /// Declared size; fewer than three members only logs a warning.
    pub target_member_count: usize,
    /// Shard groups only: failure stays fatal even when the run tolerates
    /// optional shard failures.
    #[serde(default)]
    pub required: bool,
}

impl ReplicaGroupSpec {
    /// Build a group from `(id, address)` pairs, assigning role and owner.
    pub fn new(
        id: impl Into<GroupId>,
        kind: GroupKind,
        members: impl IntoIterator<Item = (NodeId, NodeAddress)>,
    ) -> Self {
        let id = id.into();
        let members: Vec<NodeSpec> = members
            .into_iter()
            .map(|(node_id, address)| NodeSpec {
                id: node_id,
                address,
                role: kind.member_role(),
                group_id: id.clone(),
                data_dir: None,
            })
            .collect();
        Self {
            target_member_count: members.len(),
            id,
            kind,
            members,
            required: false,
        }
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn is_config_server_set(&self) -> bool {
        self.kind == GroupKind::ConfigServerSet
    }

    /// Member that receives the initiate command.
    pub fn seed_member(&self) -> Option<&NodeSpec> {
        self.members.first()
    }

    pub fn addresses(&self) -> impl Iterator<Item = &NodeAddress> {
        self.members.iter().map(|m| &m.address)
    }

    /// All members, in declaration order.
    pub fn seed_list(&self) -> SeedList {
        SeedList::new(self.id.clone(), self.addresses().cloned())
    }

    /// The `addShard` request for this group.
    pub fn registration(&self) -> ShardRegistration {
        ShardRegistration {
            shard_name: self.id.clone(),
            seed_list: self.seed_list(),
        }
    }
}

/// The `mongos` routing process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSpec {
    pub name: String,
    pub address: NodeAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl RouterSpec {
    pub fn new(address: NodeAddress) -> Self {
        Self {
            name: DEFAULT_ROUTER_NAME.to_string(),
            address,
            data_dir: None,
        }
    }

    /// View the router as a node owned by a group named after itself.
    pub fn node_spec(&self) -> NodeSpec {
        NodeSpec {
            id: 0,
            address: self.address.clone(),
            role: NodeRole::Router,
            group_id: self.name.clone(),
            data_dir: self.data_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Seed lists and registrations
// ---------------------------------------------------------------------------

/// Replica set connection string in `name/host:port,host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeedList {
    set_name: GroupId,
    hosts: Vec<NodeAddress>,
}

impl SeedList {
    pub fn new(set_name: impl Into<GroupId>, hosts: impl IntoIterator<Item = NodeAddress>) -> Self {
        Self {
            set_name: set_name.into(),
            hosts: hosts.into_iter().collect(),
        }
    }

    pub fn set_name(&self) -> &str {
        &self.set_name
    }

    pub fn hosts(&self) -> &[NodeAddress] {
        &self.hosts
    }

    /// Same set name and the same addresses, in any order.
    pub fn is_equivalent(&self, other: &SeedList) -> bool {
        if self.set_name != other.set_name {
            return false;
        }
        let ours: BTreeSet<&NodeAddress> = self.hosts.iter().collect();
        let theirs: BTreeSet<&NodeAddress> = other.hosts.iter().collect();
        ours == theirs
    }
}

impl fmt::Display for SeedList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.set_name)?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{host}")?;
        }
        Ok(())
    }
}

impl FromStr for SeedList {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (set_name, hosts) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| TopologyError::InvalidAddress(s.to_string()))?;
        if set_name.is_empty() {
            return Err(TopologyError::InvalidAddress(s.to_string()));
        }
        let hosts = hosts
            .split(',')
            .filter(|h| !h.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<NodeAddress>, _>>()?;
        Ok(Self::new(set_name, hosts))
    }
}

impl TryFrom<String> for SeedList {
    type Error = TopologyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeedList> for String {
    fn from(value: SeedList) -> Self {
        value.to_string()
    }
}

/// Request to add one shard group to the router's routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegistration {
    pub shard_name: GroupId,
    pub seed_list: SeedList,
}

// ---------------------------------------------------------------------------
// ClusterTopology
// ---------------------------------------------------------------------------

/// Full declared cluster: config-server set, shard sets, router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterTopology {
    config_servers: ReplicaGroupSpec,
    shards: Vec<ReplicaGroupSpec>,
    router: RouterSpec,
}

impl ClusterTopology {
    /// Assemble and validate a topology.
    pub fn new(
        config_servers: ReplicaGroupSpec,
        shards: Vec<ReplicaGroupSpec>,
        router: RouterSpec,
    ) -> Result<Self, TopologyError> {
        let topology = Self {
            config_servers,
            shards,
            router,
        };
        topology.validate()?;
        Ok(topology)
    }

    pub fn config_servers(&self) -> &ReplicaGroupSpec {
        &self.config_servers
    }

    pub fn shards(&self) -> &[ReplicaGroupSpec] {
        &self.shards
    }

    /// The router shards are registered with.
    pub fn router(&self) -> &RouterSpec {
        &self.router
    }

    /// Config-server set first, then shard sets in declaration order.
    pub fn groups(&self) -> impl Iterator<Item = &ReplicaGroupSpec> {
        std::iter::once(&self.config_servers).chain(self.shards.iter())
    }

    /// Look up the config-server set or a shard by id.
    pub fn group(&self, id: &str) -> Option<&ReplicaGroupSpec> {
        self.groups().find(|g| g.id == id)
    }

    /// Every data-bearing node followed by the router.
    pub fn all_nodes(&self) -> Vec<NodeSpec> {
        self.groups()
            .flat_map(|g| g.members.iter().cloned())
            .chain(std::iter::once(self.router.node_spec()))
            .collect()
    }

    fn validate(&self) -> Result<(), TopologyError> {
        for group in self.groups() {
            validate_group(group)?;
        }

        let mut shard_names = HashSet::new();
        for shard in &self.shards {
            if !shard_names.insert(shard.id.as_str()) {
                return Err(TopologyError::DuplicateShardName(shard.id.clone()));
            }
        }

        if shard_names.contains(self.config_servers.id.as_str()) {
            return Err(TopologyError::DuplicateGroupId(self.config_servers.id.clone()));
        }

        let mut addresses = HashSet::new();
        for node in self.all_nodes() {
            if !addresses.insert(node.address.clone()) {
                return Err(TopologyError::DuplicateAddress {
                    address: node.address.to_string(),
                });
            }
        }

        for group in self.groups() {
            if group.members.len() < RECOMMENDED_MIN_MEMBERS {
                tracing::warn!(
                    group = %group.id,
                    members = group.members.len(),
                    "Replica group has fewer than {RECOMMENDED_MIN_MEMBERS} members and cannot tolerate a node failure",
                );
            }
        }

        Ok(())
    }
}

/// Replica set names end up inside seed lists, so `/`, `,` and whitespace
/// are not allowed.
fn validate_group_id(id: &str) -> Result<(), TopologyError> {
    if id.is_empty() {
        return Err(TopologyError::Validation(
            "Group id must not be empty".to_string(),
        ));
    }
    if id.chars().any(|c| c == '/' || c == ',' || c.is_whitespace()) {
        return Err(TopologyError::Validation(format!(
            "Group id '{id}' may not contain '/', ',' or whitespace"
        )));
    }
    Ok(())
}

fn validate_group(group: &ReplicaGroupSpec) -> Result<(), TopologyError> {
    validate_group_id(&group.id)?;
    if group.members.is_empty() {
        return Err(TopologyError::EmptyGroup(group.id.clone()));
    }
    let mut ids = HashSet::new();
    for member in &group.members {
        if !ids.insert(member.id) {
            return Err(TopologyError::DuplicateNodeId {
                group: group.id.clone(),
                node_id: member.id,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
