//! End-to-end bootstrap runs against a simulated cluster.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use shardboot_core::error::TopologyError;
use shardboot_core::planner::{FailurePolicy, StepKind};
use shardboot_core::records::{FailureKind, StepOutcome, StepRecord};
use shardboot_core::state::BootstrapState;
use shardboot_core::topology::{ClusterTopology, GroupKind, RouterSpec, SeedList};
use shardboot_mongo::admin::ReplicaSetConfig;
use shardboot_mongo::testing::SimCommand;
use tokio_util::sync::CancellationToken;

use common::*;

fn record<'a>(steps: &'a [StepRecord], action: &str) -> &'a StepRecord {
    steps
        .iter()
        .find(|r| r.action == action)
        .unwrap_or_else(|| panic!("no record for '{action}'"))
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

/// Config set + one shard + router, all reachable: the cluster ends ready
/// with two initiate records and one registration record, all succeeded.
#[tokio::test(start_paused = true)]
async fn fresh_cluster_becomes_ready() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let orchestrator = orchestrator(&sim, FailurePolicy::Abort);
    let mut states = orchestrator.subscribe();

    let report = orchestrator
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Ready);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(*states.borrow_and_update(), BootstrapState::Ready);
    assert_eq!(orchestrator.state(), BootstrapState::Ready);

    let initiates: Vec<_> = report
        .steps
        .iter()
        .filter(|r| r.kind == StepKind::Initiate)
        .collect();
    let registrations: Vec<_> = report
        .steps
        .iter()
        .filter(|r| r.kind == StepKind::RegisterShard)
        .collect();
    assert_eq!(initiates.len(), 2);
    assert_eq!(registrations.len(), 1);
    assert!(report.steps.iter().all(|r| r.outcome == StepOutcome::Succeeded));
    assert!(report
        .steps
        .iter()
        .all(|r| r.started_at.is_some() && r.finished_at >= r.started_at));

    assert!(sim.is_initiated(&addr(27020)));
    assert!(sim.is_initiated(&addr(27025)));
    assert!(sim.registered_shards()["shard1"].is_equivalent(&topo.shards()[0].seed_list()));
    assert!(report.unverified_shards.is_empty());
}

/// Re-running against a bootstrapped cluster changes nothing.
#[tokio::test(start_paused = true)]
async fn rerun_skips_everything() {
    let topo = topology(2);
    let sim = simulated(&topo);
    let orchestrator = orchestrator(&sim, FailurePolicy::Abort);

    let first = orchestrator.run(&topo, CancellationToken::new()).await.unwrap();
    assert_eq!(first.state, BootstrapState::Ready);
    let initiates = sim.calls(SimCommand::Initiate);
    let adds = sim.calls(SimCommand::AddShard);

    let second = orchestrator.run(&topo, CancellationToken::new()).await.unwrap();
    assert_eq!(second.state, BootstrapState::Ready);
    assert!(second
        .steps
        .iter()
        .all(|r| r.outcome == StepOutcome::SkippedAlreadyDone));
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(sim.calls(SimCommand::Initiate), initiates);
    assert_eq!(sim.calls(SimCommand::AddShard), adds);
}

/// Zero shards: only the config set is initiated and nothing is verified.
#[tokio::test(start_paused = true)]
async fn config_only_topology() {
    let topo = topology(0);
    let sim = simulated(&topo);

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Ready);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(sim.calls(SimCommand::ListShards), 0);
}

/// Nodes that come up late and a slow election only delay the run.
#[tokio::test(start_paused = true)]
async fn slow_nodes_and_delayed_election() {
    let topo = topology(1);
    let sim = simulated(&topo);
    sim.reachable_after_pings(&addr(27024), 5);
    sim.reachable_after_pings(&addr(27017), 8);
    sim.delay_primary("shard1", 6);

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Ready);
    assert_eq!(sim.registered_shards().len(), 1);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// A shard member that never answers fails the run when shards are
/// mandatory; the config set is still initiated.
#[tokio::test(start_paused = true)]
async fn unreachable_shard_member_fails_mandatory_run() {
    let topo = topology(1);
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27023));

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        record(&report.steps, "initiate configReplSet").outcome,
        StepOutcome::Succeeded
    );
    assert_eq!(
        record(&report.steps, "initiate shard1").outcome.failure_kind(),
        Some(FailureKind::NodeUnreachable)
    );
    assert_eq!(
        record(&report.steps, "register shard shard1").outcome.failure_kind(),
        Some(FailureKind::Aborted)
    );
    assert_eq!(sim.calls(SimCommand::AddShard), 0);
}

/// The same failure with optional shards leaves the run partially complete.
#[tokio::test(start_paused = true)]
async fn unreachable_optional_shard_is_partial() {
    let topo = topology(2);
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27023));

    let report = orchestrator(&sim, FailurePolicy::TolerateOptionalShards)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::PartiallyComplete);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(
        record(&report.steps, "initiate configReplSet").outcome,
        StepOutcome::Succeeded
    );
    assert_eq!(
        record(&report.steps, "initiate shard1").outcome.failure_kind(),
        Some(FailureKind::NodeUnreachable)
    );
    assert_eq!(
        record(&report.steps, "register shard shard1").outcome.failure_kind(),
        Some(FailureKind::PrerequisiteFailed)
    );
    assert_eq!(
        record(&report.steps, "register shard shard2").outcome,
        StepOutcome::Succeeded
    );
    let blocking: Vec<&str> = report.blocking_steps().map(|r| r.action.as_str()).collect();
    assert_eq!(blocking, ["initiate shard1"]);
}

/// A required shard stays fatal even when optional failures are tolerated.
#[tokio::test(start_paused = true)]
async fn required_shard_failure_is_fatal_under_tolerance() {
    let base = topology(1);
    let topo = ClusterTopology::new(
        base.config_servers().clone(),
        vec![base.shards()[0].clone().with_required(true)],
        base.router().clone(),
    )
    .unwrap();
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27024));

    let report = orchestrator(&sim, FailurePolicy::TolerateOptionalShards)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
}

/// A shard already registered with a different seed list is a conflict and
/// is left untouched.
#[tokio::test(start_paused = true)]
async fn conflicting_registration_fails_run() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let elsewhere: SeedList = "shard1/db9:27017".parse().unwrap();
    sim.preregister_shard("shard1", elsewhere.clone());

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(
        record(&report.steps, "register shard shard1").outcome.failure_kind(),
        Some(FailureKind::ConflictingState)
    );
    assert_eq!(sim.calls(SimCommand::AddShard), 0);
    assert_eq!(sim.registered_shards()["shard1"], elsewhere);
}

/// A config set already running under another name is a conflict.
#[tokio::test(start_paused = true)]
async fn config_set_under_foreign_name_fails_run() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let foreign = group("oldConfig", GroupKind::ConfigServerSet, 27020);
    sim.preinitiate(&ReplicaSetConfig::for_group(&foreign));

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(
        record(&report.steps, "initiate configReplSet").outcome.failure_kind(),
        Some(FailureKind::ConflictingState)
    );
    assert_eq!(sim.calls(SimCommand::AddShard), 0);
}

/// Two shard groups with the same name are rejected before any node is
/// contacted.
#[tokio::test(start_paused = true)]
async fn duplicate_shard_names_rejected_before_contact() {
    let valid = topology(1);
    let sim = simulated(&valid);

    let duplicate = ClusterTopology::new(
        valid.config_servers().clone(),
        vec![
            group("shard1", GroupKind::ShardSet, 27023),
            group("shard1", GroupKind::ShardSet, 27026),
        ],
        RouterSpec::new(addr(27017)),
    );

    assert_matches!(duplicate, Err(TopologyError::DuplicateShardName(ref name)) if name == "shard1");
    assert_eq!(sim.total_calls(), 0);
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// A router that goes down after the last registration fails the run even
/// when shard failures are tolerated; every registered shard is unverified.
#[tokio::test(start_paused = true)]
async fn router_lost_before_verification_fails_run() {
    let topo = topology(2);
    let sim = simulated(&topo);
    sim.router_down_after_registrations(2);

    let report = orchestrator(&sim, FailurePolicy::TolerateOptionalShards)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert!(report.steps.iter().all(|r| r.outcome == StepOutcome::Succeeded));
    assert_eq!(report.unverified_shards, ["shard1", "shard2"]);
    assert_eq!(sim.registered_shards().len(), 2);
}

/// A mandatory shard the router does not list fails the run.
#[tokio::test(start_paused = true)]
async fn unlisted_mandatory_shard_fails_verification() {
    let topo = topology(1);
    let sim = simulated(&topo);
    sim.hide_shard("shard1");

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        record(&report.steps, "register shard shard1").outcome,
        StepOutcome::Succeeded
    );
    assert_eq!(report.unverified_shards, ["shard1"]);
    assert_eq!(sim.calls(SimCommand::ListShards), 2);
}

/// An optional shard the router does not list leaves the run partially
/// complete; the listed shard is verified.
#[tokio::test(start_paused = true)]
async fn unlisted_optional_shard_is_partial() {
    let topo = topology(2);
    let sim = simulated(&topo);
    sim.hide_shard("shard2");

    let report = orchestrator(&sim, FailurePolicy::TolerateOptionalShards)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::PartiallyComplete);
    assert_eq!(report.exit_code(), 2);
    assert!(report.steps.iter().all(|r| r.outcome == StepOutcome::Succeeded));
    assert_eq!(report.unverified_shards, ["shard2"]);
}

/// With nothing to list, the router must still answer before the cluster
/// is declared ready.
#[tokio::test(start_paused = true)]
async fn config_only_run_requires_reachable_router() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.set_unreachable(&topo.router().address);

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.steps[0].outcome, StepOutcome::Succeeded);
    assert!(report.unverified_shards.is_empty());
    assert_eq!(sim.calls(SimCommand::ListShards), 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cancelling mid-run aborts steps that were still waiting; none of them is
/// recorded as succeeded.
#[tokio::test(start_paused = true)]
async fn cancellation_aborts_in_flight_steps() {
    let topo = topology(1);
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27025));
    let orchestrator = orchestrator(&sim, FailurePolicy::Abort);
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        })
    };
    let report = orchestrator.run(&topo, cancel).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    let shard_init = record(&report.steps, "initiate shard1");
    assert_eq!(shard_init.outcome.failure_kind(), Some(FailureKind::Aborted));
    assert_eq!(
        record(&report.steps, "register shard shard1").outcome.failure_kind(),
        Some(FailureKind::Aborted)
    );
    assert!(report
        .steps
        .iter()
        .all(|r| r.outcome.is_terminal()));
    assert!(!sim.is_initiated(&addr(27023)));
}

/// A token cancelled before the run starts leaves the cluster untouched.
#[tokio::test(start_paused = true)]
async fn cancelled_before_start() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator(&sim, FailurePolicy::Abort)
        .run(&topo, cancel)
        .await
        .unwrap();

    assert_eq!(report.state, BootstrapState::Failed);
    assert!(report
        .steps
        .iter()
        .all(|r| r.outcome.failure_kind() == Some(FailureKind::Aborted)));
    assert_eq!(sim.total_calls(), 0);
}
