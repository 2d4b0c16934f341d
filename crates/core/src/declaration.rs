//! On-disk topology file format.
//!
//! The file is a JSON document mirroring the cluster layout:
//!
//! ```json
//! {
//!   "config_servers": {
//!     "id": "configReplSet",
//!     "members": [{ "id": 0, "host": "localhost", "port": 27020 }]
//!   },
//!   "shards": [
//!     { "id": "shard1", "members": [{ "id": 0, "host": "localhost", "port": 27023 }] }
//!   ],
//!   "router": { "host": "localhost", "port": 27017 }
//! }
//! ```
//!
//! Field-level rules are declared with `validator`; structural rules
//! (duplicates, empty groups) run when the declaration is converted into a
//! [`ClusterTopology`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::TopologyError;
use crate::topology::{
    ClusterTopology, GroupKind, NodeAddress, NodeSpec, ReplicaGroupSpec, RouterSpec,
    DEFAULT_ROUTER_NAME,
};
use crate::types::NodeId;

/// Root of a topology file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TopologyFile {
    /// The config-server replica set.
    #[validate(nested)]
    pub config_servers: GroupDecl,
    /// Shard replica sets, in the order they are initiated. May be empty.
    #[serde(default)]
    #[validate(nested)]
    pub shards: Vec<ShardDecl>,
    /// The `mongos` router shards are registered with.
    #[validate(nested)]
    pub router: RouterDecl,
}

/// A replica group as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GroupDecl {
    /// Replica set name (`_id` of its config).
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(nested)]
    pub members: Vec<MemberDecl>,
}

/// A shard replica set as written in the file.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ShardDecl {
    /// Shard name; also the replica set name.
    #[validate(length(min = 1, max = 128))]
    pub id: String,
    #[validate(nested)]
    pub members: Vec<MemberDecl>,
    /// Keep this shard fatal even when optional shard failures are tolerated.
    #[serde(default)]
    pub required: bool,
}

/// One replica set member.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MemberDecl {
    /// Member `_id`, unique within its group.
    pub id: NodeId,
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    /// Overrides the directory derived from `--data-root` when launching.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// The router entry. `name` defaults to `router`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RouterDecl {
    #[serde(default = "default_router_name")]
    #[validate(length(min = 1, max = 128))]
    pub name: String,
    #[validate(length(min = 1, max = 255))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

fn default_router_name() -> String {
    DEFAULT_ROUTER_NAME.to_string()
}

impl TopologyFile {
    /// Parse without validating.
    pub fn from_json_str(json: &str) -> Result<Self, TopologyError> {
        serde_json::from_str(json).map_err(|e| TopologyError::Parse(e.to_string()))
    }

    /// Run field and structural validation and build the topology.
    pub fn into_topology(self) -> Result<ClusterTopology, TopologyError> {
        self.validate()
            .map_err(|e| TopologyError::Validation(e.to_string()))?;

        let config_servers = build_group(
            self.config_servers.id,
            GroupKind::ConfigServerSet,
            self.config_servers.members,
        );
        let shards = self
            .shards
            .into_iter()
            .map(|s| build_group(s.id, GroupKind::ShardSet, s.members).with_required(s.required))
            .collect();
        let router = RouterSpec {
            name: self.router.name,
            address: NodeAddress::new(self.router.host, self.router.port),
            data_dir: self.router.data_dir,
        };

        ClusterTopology::new(config_servers, shards, router)
    }
}

impl ClusterTopology {
    /// Parse and validate a JSON topology document.
    pub fn from_json_str(json: &str) -> Result<Self, TopologyError> {
        TopologyFile::from_json_str(json)?.into_topology()
    }
}

fn build_group(id: String, kind: GroupKind, members: Vec<MemberDecl>) -> ReplicaGroupSpec {
    let members: Vec<NodeSpec> = members
        .into_iter()
        .map(|m| NodeSpec {
            id: m.id,
            address: NodeAddress::new(m.host, m.port),
            role: kind.member_role(),
            group_id: id.clone(),
            data_dir: m.data_dir,
        })
        .collect();
    ReplicaGroupSpec {
        target_member_count: members.len(),
        id,
        kind,
        members,
        required: false,
    }
}
