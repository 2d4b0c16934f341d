//! Topology Planner: turns a [`ClusterTopology`] into an ordered,
//! dependency-annotated list of bootstrap steps.
//!
//! Steps are declared group by group (the config-server set first, then
//! each shard set in file order): an `initiate` step for every replica
//! group, followed by a `register_shard` step for every shard group. A
//! registration depends on its own group's initiate step and on the
//! config-server initiate step, since the router persists shard metadata in
//! the config-server set.
//!
//! The execution order is a Kahn topological sort where ties between
//! ready steps go to the one declared first, so the same topology always
//! yields the same plan.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;
use crate::topology::{ClusterTopology, ReplicaGroupSpec, ShardRegistration};
use crate::types::GroupId;

// ---------------------------------------------------------------------------
// Step identity and policy
// ---------------------------------------------------------------------------

/// Index of a step in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub usize);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the run treats failures of shard steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed step fails the whole run.
    #[default]
    Abort,
    /// Shard groups not declared `required` are optional: their failure
    /// leaves the run `PartiallyComplete` instead of `Failed`.
    TolerateOptionalShards,
}

impl FailurePolicy {
    fn is_mandatory(&self, group: &ReplicaGroupSpec) -> bool {
        if group.is_config_server_set() {
            return true;
        }
        match self {
            Self::Abort => true,
            Self::TolerateOptionalShards => group.required,
        }
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Coarse step type recorded on each `StepRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Initiate,
    RegisterShard,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiate => "initiate",
            Self::RegisterShard => "register_shard",
        }
    }
}

/// What a step does to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// `replSetInitiate` on the group's first member.
    InitiateReplicaGroup { group: GroupId },
    /// `addShard` on the router.
    RegisterShard { registration: ShardRegistration },
}

impl StepAction {
    pub fn kind(&self) -> StepKind {
        match self {
            Self::InitiateReplicaGroup { .. } => StepKind::Initiate,
            Self::RegisterShard { .. } => StepKind::RegisterShard,
        }
    }

    /// Replica group the step acts on.
    pub fn group_id(&self) -> &str {
        match self {
            Self::InitiateReplicaGroup { group } => group,
            Self::RegisterShard { registration } => &registration.shard_name,
        }
    }

    /// Human-readable action, e.g. `register shard shard1`.
    pub fn label(&self) -> String {
        match self {
            Self::InitiateReplicaGroup { group } => format!("initiate {group}"),
            Self::RegisterShard { registration } => {
                format!("register shard {}", registration.shard_name)
            }
        }
    }
}

/// One node of the plan's dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    pub id: StepId,
    pub action: StepAction,
    /// Steps that must succeed (or be already done) first.
    pub depends_on: Vec<StepId>,
    /// A failure aborts the whole run.
    pub mandatory: bool,
    /// Node the step's command is sent to (`host:port`).
    pub target: String,
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Ordered bootstrap steps for one topology.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapPlan {
    /// Steps indexed by [`StepId`] (declaration order).
    declared: Vec<PlannedStep>,
    /// Execution order.
    order: Vec<StepId>,
    policy: FailurePolicy,
}

impl BootstrapPlan {
    /// Steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &PlannedStep> {
        self.order.iter().map(|id| &self.declared[id.0])
    }

    pub fn step(&self, id: StepId) -> Option<&PlannedStep> {
        self.declared.get(id.0)
    }

    /// Deterministic execution order.
    pub fn order(&self) -> &[StepId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Steps that directly depend on `id`.
    pub fn dependents(&self, id: StepId) -> impl Iterator<Item = &PlannedStep> {
        self.declared
            .iter()
            .filter(move |s| s.depends_on.contains(&id))
    }

    /// Dependency layers: every step sits one layer after its deepest
    /// prerequisite. Steps within a layer are independent of each other.
    pub fn waves(&self) -> Vec<Vec<StepId>> {
        let mut depth = vec![0usize; self.declared.len()];
        let mut waves: Vec<Vec<StepId>> = Vec::new();
        for id in &self.order {
            let step = &self.declared[id.0];
            let d = step
                .depends_on
                .iter()
                .map(|dep| depth[dep.0] + 1)
                .max()
                .unwrap_or(0);
            depth[id.0] = d;
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(*id);
        }
        waves
    }
}

/// Compute the bootstrap plan for a validated topology.
pub fn plan(
    topology: &ClusterTopology,
    policy: FailurePolicy,
) -> Result<BootstrapPlan, TopologyError> {
    let mut declared: Vec<PlannedStep> = Vec::new();

    let config = topology.config_servers();
    let config_step = push_initiate(&mut declared, config, policy);

    for shard in topology.shards() {
        let initiate = push_initiate(&mut declared, shard, policy);
        let id = StepId(declared.len());
        declared.push(PlannedStep {
            id,
            action: StepAction::RegisterShard {
                registration: shard.registration(),
            },
            depends_on: vec![config_step, initiate],
            mandatory: policy.is_mandatory(shard),
            target: topology.router().address.to_string(),
        });
    }

    let order = topological_order(&declared)?;

    tracing::debug!(
        steps = declared.len(),
        shards = topology.shards().len(),
        ?policy,
        "Bootstrap plan computed",
    );

    Ok(BootstrapPlan {
        declared,
        order,
        policy,
    })
}

fn push_initiate(
    declared: &mut Vec<PlannedStep>,
    group: &ReplicaGroupSpec,
    policy: FailurePolicy,
) -> StepId {
    let id = StepId(declared.len());
    let target = group
        .seed_member()
        .map(|m| m.address.to_string())
        .unwrap_or_default();
    declared.push(PlannedStep {
        id,
        action: StepAction::InitiateReplicaGroup {
            group: group.id.clone(),
        },
        depends_on: Vec::new(),
        mandatory: policy.is_mandatory(group),
        target,
    });
    id
}

/// Kahn's algorithm with a min-heap so the earliest-declared ready step
/// always goes next.
fn topological_order(steps: &[PlannedStep]) -> Result<Vec<StepId>, TopologyError> {
    let mut in_degree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
    let mut ready: BinaryHeap<Reverse<StepId>> = steps
        .iter()
        .filter(|s| s.depends_on.is_empty())
        .map(|s| Reverse(s.id))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for dependent in steps.iter().filter(|s| s.depends_on.contains(&id)) {
            in_degree[dependent.id.0] -= 1;
            if in_degree[dependent.id.0] == 0 {
                ready.push(Reverse(dependent.id));
            }
        }
    }

    if order.len() != steps.len() {
        return Err(TopologyError::Validation(
            "Step dependencies contain a cycle".to_string(),
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::topology::{GroupKind, NodeAddress, RouterSpec};
    use crate::types::NodeId;

    fn group(id: &str, kind: GroupKind, first_port: u16, count: u16) -> ReplicaGroupSpec {
        ReplicaGroupSpec::new(
            id,
            kind,
            (0..count).map(|i| (i as NodeId, NodeAddress::new("localhost", first_port + i))),
        )
    }

    fn topology(shards: usize) -> ClusterTopology {
        let shards = (0..shards)
            .map(|i| group(&format!("shard{}", i + 1), GroupKind::ShardSet, 27023 + 3 * i as u16, 3))
            .collect();
        ClusterTopology::new(
            group("configReplSet", GroupKind::ConfigServerSet, 27020, 3),
            shards,
            RouterSpec::new(NodeAddress::new("localhost", 27017)),
        )
        .unwrap()
    }

    fn positions(plan: &BootstrapPlan) -> HashMap<StepId, usize> {
        plan.order().iter().enumerate().map(|(i, id)| (*id, i)).collect()
    }

    #[test]
    fn registrations_follow_their_initiate_steps() {
        for shards in 0..5 {
            let plan = plan(&topology(shards), FailurePolicy::Abort).unwrap();
            let pos = positions(&plan);
            for step in plan.steps() {
                for dep in &step.depends_on {
                    assert!(pos[dep] < pos[&step.id], "{dep} must precede {}", step.id);
                }
                if let StepAction::RegisterShard { registration } = &step.action {
                    let initiate = plan
                        .steps()
                        .find(|s| {
                            s.action
                                == StepAction::InitiateReplicaGroup {
                                    group: registration.shard_name.clone(),
                                }
                        })
                        .unwrap();
                    assert!(pos[&initiate.id] < pos[&step.id]);
                }
            }
        }
    }

    #[test]
    fn zero_shards_plans_single_initiate() {
        let plan = plan(&topology(0), FailurePolicy::Abort).unwrap();
        assert_eq!(plan.len(), 1);
        let step = plan.steps().next().unwrap();
        assert_eq!(step.action.kind(), StepKind::Initiate);
        assert_eq!(step.action.group_id(), "configReplSet");
        assert!(step.mandatory);
    }

    #[test]
    fn order_is_declaration_stable() {
        let plan = plan(&topology(2), FailurePolicy::Abort).unwrap();
        let labels: Vec<String> = plan.steps().map(|s| s.action.label()).collect();
        assert_eq!(
            labels,
            [
                "initiate configReplSet",
                "initiate shard1",
                "register shard shard1",
                "initiate shard2",
                "register shard shard2",
            ]
        );
    }

    #[test]
    fn waves_separate_initiates_from_registrations() {
        let plan = plan(&topology(2), FailurePolicy::Abort).unwrap();
        let waves = plan.waves();
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0], vec![StepId(0), StepId(1), StepId(3)]);
        assert_eq!(waves[1], vec![StepId(2), StepId(4)]);
    }

    #[test]
    fn registration_targets_router_with_full_seed_list() {
        let plan = plan(&topology(1), FailurePolicy::Abort).unwrap();
        let register = plan.step(StepId(2)).unwrap();
        assert_eq!(register.target, "localhost:27017");
        assert_eq!(register.depends_on, vec![StepId(0), StepId(1)]);
        match &register.action {
            StepAction::RegisterShard { registration } => assert_eq!(
                registration.seed_list.to_string(),
                "shard1/localhost:27023,localhost:27024,localhost:27025"
            ),
            other => panic!("unexpected action {other:?}"),
        }
        let dependents: Vec<StepId> = plan.dependents(StepId(1)).map(|s| s.id).collect();
        assert_eq!(dependents, vec![StepId(2)]);
    }

    #[test]
    fn tolerate_policy_makes_unrequired_shards_optional() {
        let base = topology(2);
        let shards = vec![
            base.shards()[0].clone().with_required(true),
            base.shards()[1].clone(),
        ];
        let topo = ClusterTopology::new(
            base.config_servers().clone(),
            shards,
            base.router().clone(),
        )
        .unwrap();

        let tolerant = plan(&topo, FailurePolicy::TolerateOptionalShards).unwrap();
        let mandatory: Vec<(String, bool)> = tolerant
            .steps()
            .map(|s| (s.action.label(), s.mandatory))
            .collect();
        assert_eq!(
            mandatory,
            [
                ("initiate configReplSet".to_string(), true),
                ("initiate shard1".to_string(), true),
                ("register shard shard1".to_string(), true),
                ("initiate shard2".to_string(), false),
                ("register shard shard2".to_string(), false),
            ]
        );

        let strict = plan(&topo, FailurePolicy::Abort).unwrap();
        assert!(strict.steps().all(|s| s.mandatory));
    }

    #[test]
    fn kahn_detects_cycles() {
        let steps = vec![
            PlannedStep {
                id: StepId(0),
                action: StepAction::InitiateReplicaGroup { group: "a".into() },
                depends_on: vec![StepId(1)],
                mandatory: true,
                target: String::new(),
            },
            PlannedStep {
                id: StepId(1),
                action: StepAction::InitiateReplicaGroup { group: "b".into() },
                depends_on: vec![StepId(0)],
                mandatory: true,
                target: String::new(),
            },
        ];
        assert!(topological_order(&steps).is_err());
    }
}
