//! The administrative command boundary.
//!
//! [`AdminClient`] is the only way the orchestrator talks to the database:
//! two topology-changing commands (`replSetInitiate`, `addShard`) and three
//! read-only queries (`ping`, `replSetGetStatus`, `listShards`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardboot_core::error::TopologyError;
use shardboot_core::topology::{NodeAddress, ReplicaGroupSpec, SeedList, ShardRegistration};
use shardboot_core::types::{GroupId, NodeId};

use crate::error::CommandError;

/// `stateStr` reported by the elected primary.
pub const STATE_PRIMARY: &str = "PRIMARY";
/// `stateStr` of a healthy member that is not primary.
pub const STATE_SECONDARY: &str = "SECONDARY";

// ---------------------------------------------------------------------------
// replSetInitiate document
// ---------------------------------------------------------------------------

/// One entry of the `members` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    #[serde(rename = "_id")]
    pub id: NodeId,
    /// `host:port` the other members use to reach this one.
    pub host: String,
}

/// Replica set configuration passed to `replSetInitiate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetConfig {
    #[serde(rename = "_id")]
    pub id: GroupId,
    /// Set only for the config-server replica set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub configsvr: bool,
    pub members: Vec<MemberConfig>,
}

impl ReplicaSetConfig {
    /// Initial config for `group`, members in declaration order.
    pub fn for_group(group: &ReplicaGroupSpec) -> Self {
        Self {
            id: group.id.clone(),
            configsvr: group.is_config_server_set(),
            members: group
                .members
                .iter()
                .map(|m| MemberConfig {
                    id: m.id,
                    host: m.address.to_string(),
                })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status replies
// ---------------------------------------------------------------------------

/// One member as seen by `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberStatus {
    #[serde(rename = "_id")]
    pub id: NodeId,
    /// Member address as `host:port`.
    pub name: String,
    /// `PRIMARY`, `SECONDARY`, `STARTUP2`, ...
    #[serde(rename = "stateStr", default)]
    pub state_str: String,
    /// `1` when the reporting node can reach the member.
    #[serde(default)]
    pub health: f64,
}

impl MemberStatus {
    pub fn is_primary(&self) -> bool {
        self.state_str == STATE_PRIMARY
    }
}

/// `replSetGetStatus` reply of an initiated member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    /// Name the set was initiated under.
    #[serde(rename = "set")]
    pub set_name: String,
    #[serde(default)]
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    /// The elected primary, if any.
    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.is_primary())
    }
}

/// One entry of the router's `listShards` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredShard {
    #[serde(rename = "_id")]
    pub id: String,
    /// Seed list in `name/host:port,...` form.
    pub host: String,
    /// `1` once the shard is active.
    #[serde(default)]
    pub state: Option<i32>,
}

impl RegisteredShard {
    /// Parse `host` back into a seed list for comparison.
    pub fn seed_list(&self) -> Result<SeedList, TopologyError> {
        self.host.parse()
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Administrative commands against one node or router.
///
/// Implementations classify failures into [`CommandError`] variants; the
/// callers decide what is retried.
#[async_trait]
pub trait AdminClient: Send + Sync {
    /// Lightweight liveness command (`{ping: 1}`).
    async fn ping(&self, target: &NodeAddress) -> Result<(), CommandError>;

    /// `replSetGetStatus`; `None` while the node has no replica set config.
    async fn replica_set_status(
        &self,
        target: &NodeAddress,
    ) -> Result<Option<ReplicaSetStatus>, CommandError>;

    /// `replSetInitiate` with `config`, sent to `target`.
    async fn initiate_replica_set(
        &self,
        target: &NodeAddress,
        config: &ReplicaSetConfig,
    ) -> Result<(), CommandError>;

    async fn add_shard(
        &self,
        router: &NodeAddress,
        registration: &ShardRegistration,
    ) -> Result<(), CommandError>;

    async fn list_shards(&self, router: &NodeAddress) -> Result<Vec<RegisteredShard>, CommandError>;
}
