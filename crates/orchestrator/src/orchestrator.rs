//! Bootstrap Orchestrator: drives one run from plan to terminal state.
//!
//! Steps whose prerequisites have all succeeded are spawned on a
//! [`JoinSet`], so independent initiate steps run concurrently. A failed
//! mandatory step cancels the run's child token: in-flight steps stop at
//! their next probe or retry, and every step that has not finished is
//! recorded as `aborted`. A failed optional step only fails its dependents.
//!
//! The run state is published on a [`watch`] channel; every transition is
//! checked against [`BootstrapState::can_transition_to`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use shardboot_core::error::TopologyError;
use shardboot_core::planner::{plan, BootstrapPlan, PlannedStep, StepAction, StepId};
use shardboot_core::records::{FailureKind, StepLog, StepOutcome};
use shardboot_core::report::RunReport;
use shardboot_core::state::BootstrapState;
use shardboot_core::topology::{ClusterTopology, ShardRegistration};
use shardboot_core::types::GroupId;
use shardboot_mongo::admin::AdminClient;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{Executed, InitializationExecutor, InitiateOutcome, RegisterOutcome};
use crate::prober::{ProbeOutcome, ReadinessProber};
use crate::settings::BootstrapSettings;

/// Runs bootstrap plans against one admin client.
///
/// A single orchestrator may run the same topology repeatedly; every run
/// starts again from `Planning`.
pub struct Orchestrator {
    prober: ReadinessProber,
    executor: Arc<InitializationExecutor>,
    settings: BootstrapSettings,
    state_tx: watch::Sender<BootstrapState>,
}

/// Terminal result of one step task.
struct StepResult {
    id: StepId,
    outcome: StepOutcome,
    attempts: u32,
}

/// What the Verifying phase found.
struct Verification {
    router_ready: bool,
    unverified_shards: Vec<GroupId>,
}

/// Everything a spawned step task needs.
#[derive(Clone)]
struct StepContext {
    prober: ReadinessProber,
    executor: Arc<InitializationExecutor>,
    topology: Arc<ClusterTopology>,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn AdminClient>, settings: BootstrapSettings) -> Self {
        let (state_tx, _) = watch::channel(BootstrapState::Planning);
        Self {
            prober: ReadinessProber::new(Arc::clone(&client), settings.probe.clone()),
            executor: Arc::new(InitializationExecutor::new(client, settings.retry.clone())),
            settings,
            state_tx,
        }
    }

    pub fn settings(&self) -> &BootstrapSettings {
        &self.settings
    }

    /// Receive every state transition of the current run.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.state_tx.subscribe()
    }

    /// State of the current or last run.
    pub fn state(&self) -> BootstrapState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: BootstrapState) {
        self.state_tx.send_if_modified(|state| match state.transition_to(next) {
            Ok(next) => {
                tracing::info!(from = state.as_str(), to = next.as_str(), "Bootstrap state changed");
                *state = next;
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "Rejected bootstrap state transition");
                false
            }
        });
    }

    /// Bootstrap `topology`. Only a topology that cannot be planned is an
    /// error; every execution failure ends up in the returned report.
    pub async fn run(
        &self,
        topology: &ClusterTopology,
        cancel: CancellationToken,
    ) -> Result<RunReport, TopologyError> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let clock = Instant::now();
        self.state_tx.send_replace(BootstrapState::Planning);

        let plan = match plan(topology, self.settings.policy) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::error!(%run_id, error = %e, "Topology rejected");
                self.transition(BootstrapState::Failed);
                return Err(e);
            }
        };

        tracing::info!(
            %run_id,
            steps = plan.len(),
            shards = topology.shards().len(),
            policy = ?plan.policy(),
            "Starting bootstrap run",
        );

        let log = StepLog::new(&plan);
        let mut unverified_shards = Vec::new();

        let final_state = if cancel.is_cancelled() {
            abort_unfinished(&plan, &log, "run cancelled before execution started");
            BootstrapState::Failed
        } else {
            self.transition(BootstrapState::Executing);
            let aborted = self
                .execute(Arc::new(topology.clone()), &plan, &log, &cancel)
                .await;

            if aborted {
                BootstrapState::Failed
            } else {
                self.transition(BootstrapState::Verifying);
                let verification = self.verify(topology, &plan, &log, &cancel).await;
                let state = settle(&plan, &log, &verification, &cancel);
                unverified_shards = verification.unverified_shards;
                state
            }
        };
        self.transition(final_state);

        let report = RunReport {
            run_id,
            state: final_state,
            started_at,
            finished_at: Utc::now(),
            steps: log.records(),
            unverified_shards,
        };

        let summary = report.summary();
        let elapsed_ms = clock.elapsed().as_millis() as u64;
        match final_state {
            BootstrapState::Ready => tracing::info!(
                %run_id,
                succeeded = summary.succeeded,
                skipped = summary.skipped_already_done,
                elapsed_ms,
                "Cluster ready",
            ),
            _ => tracing::error!(
                %run_id,
                state = final_state.as_str(),
                succeeded = summary.succeeded,
                skipped = summary.skipped_already_done,
                failed = summary.failed,
                unverified = report.unverified_shards.len(),
                elapsed_ms,
                "Bootstrap did not complete",
            ),
        }

        Ok(report)
    }

    /// Run every step to a terminal outcome. Returns `true` if the run was
    /// aborted by a mandatory failure or by cancellation.
    async fn execute(
        &self,
        topology: Arc<ClusterTopology>,
        plan: &BootstrapPlan,
        log: &StepLog,
        cancel: &CancellationToken,
    ) -> bool {
        let run_cancel = cancel.child_token();
        let ctx = StepContext {
            prober: self.prober.clone(),
            executor: Arc::clone(&self.executor),
            topology,
        };
        let mut tasks: JoinSet<StepResult> = JoinSet::new();
        let mut launched: HashSet<StepId> = HashSet::new();
        let mut aborted = false;

        loop {
            if !aborted && run_cancel.is_cancelled() {
                tracing::warn!("Bootstrap run cancelled");
                aborted = true;
            }

            if !aborted {
                for step in plan.steps() {
                    if aborted {
                        break;
                    }
                    if launched.contains(&step.id) || log.is_complete(step.id) {
                        continue;
                    }
                    if let Some(failed) = step.depends_on.iter().find(|d| log.outcome(**d).is_failure()) {
                        let reason = format!("prerequisite step {failed} failed");
                        if step.mandatory {
                            tracing::error!(step = %step.id, action = %step.action.label(), %reason, "Mandatory step cannot run");
                            aborted = true;
                            run_cancel.cancel();
                        }
                        record(log, step.id, StepOutcome::failed(FailureKind::PrerequisiteFailed, reason), 0);
                        continue;
                    }
                    if step.depends_on.iter().all(|d| log.outcome(*d).is_success()) {
                        launched.insert(step.id);
                        if let Err(e) = log.mark_started(step.id) {
                            tracing::error!(step = %step.id, error = %e, "Failed to mark step started");
                        }
                        tasks.spawn(run_step(ctx.clone(), step.clone(), run_cancel.clone()));
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            match joined {
                Ok(result) => {
                    let mandatory = plan.step(result.id).is_some_and(|s| s.mandatory);
                    if let StepOutcome::Failed { kind, reason } = &result.outcome {
                        if mandatory && !aborted {
                            tracing::error!(
                                step = %result.id,
                                kind = kind.as_str(),
                                %reason,
                                "Mandatory step failed, aborting run",
                            );
                            aborted = true;
                            run_cancel.cancel();
                        } else if !mandatory {
                            tracing::warn!(
                                step = %result.id,
                                kind = kind.as_str(),
                                %reason,
                                "Optional step failed",
                            );
                        }
                    }
                    record(log, result.id, result.outcome, result.attempts);
                }
                Err(e) => {
                    tracing::error!(error = %e, "Step task did not complete");
                    aborted = true;
                    run_cancel.cancel();
                }
            }
        }

        abort_unfinished(plan, log, "run aborted before the step finished");
        aborted
    }

    /// Confirm the router answers and lists every shard registered by this
    /// run (or found already registered).
    async fn verify(
        &self,
        topology: &ClusterTopology,
        plan: &BootstrapPlan,
        log: &StepLog,
        cancel: &CancellationToken,
    ) -> Verification {
        let expected: Vec<ShardRegistration> = plan
            .steps()
            .filter(|s| log.outcome(s.id).is_success())
            .filter_map(|s| match &s.action {
                StepAction::RegisterShard { registration } => Some(registration.clone()),
                StepAction::InitiateReplicaGroup { .. } => None,
            })
            .collect();
        let unreachable = || Verification {
            router_ready: false,
            unverified_shards: expected.iter().map(|r| r.shard_name.clone()).collect(),
        };

        let router = &topology.router().address;
        let probe = self.prober.wait_ready(router, cancel).await;
        if !probe.is_ready() {
            tracing::error!(router = %router, outcome = ?probe, "Router unreachable during verification");
            return unreachable();
        }
        if expected.is_empty() {
            tracing::info!(router = %router, "Router reachable, no shards to verify");
            return Verification {
                router_ready: true,
                unverified_shards: Vec::new(),
            };
        }

        match self.executor.unverified_shards(router, &expected, cancel).await.into_result() {
            Ok(unverified) => {
                for name in &unverified {
                    tracing::error!(shard = %name, router = %router, "Router does not list registered shard");
                }
                if unverified.is_empty() {
                    tracing::info!(shards = expected.len(), router = %router, "All registered shards verified");
                }
                Verification {
                    router_ready: true,
                    unverified_shards: unverified,
                }
            }
            Err(e) => {
                tracing::error!(router = %router, error = %e, "Failed to list shards during verification");
                unreachable()
            }
        }
    }
}

/// Terminal state after a run that was not aborted.
fn settle(
    plan: &BootstrapPlan,
    log: &StepLog,
    verification: &Verification,
    cancel: &CancellationToken,
) -> BootstrapState {
    if cancel.is_cancelled() || !verification.router_ready {
        return BootstrapState::Failed;
    }
    let unverified_shards = &verification.unverified_shards;
    let mandatory_unverified = plan.steps().any(|s| {
        s.mandatory
            && matches!(&s.action, StepAction::RegisterShard { registration }
                if unverified_shards.contains(&registration.shard_name))
    });
    if mandatory_unverified {
        return BootstrapState::Failed;
    }
    let any_failed = plan.order().iter().any(|id| log.outcome(*id).is_failure());
    if any_failed || !unverified_shards.is_empty() {
        BootstrapState::PartiallyComplete
    } else {
        BootstrapState::Ready
    }
}

fn record(log: &StepLog, id: StepId, outcome: StepOutcome, attempts: u32) {
    match log.complete(id, outcome, attempts) {
        Ok(record) => tracing::info!(
            step = %id,
            action = %record.action,
            outcome = record.outcome.as_str(),
            attempts,
            "Step finished",
        ),
        Err(e) => tracing::error!(step = %id, error = %e, "Failed to record step outcome"),
    }
}

fn abort_unfinished(plan: &BootstrapPlan, log: &StepLog, reason: &str) {
    for id in plan.order() {
        if !log.is_complete(*id) {
            record(log, *id, StepOutcome::failed(FailureKind::Aborted, reason), 0);
        }
    }
}

// ---------------------------------------------------------------------------
// Step tasks
// ---------------------------------------------------------------------------

async fn run_step(ctx: StepContext, step: PlannedStep, cancel: CancellationToken) -> StepResult {
    tracing::info!(
        step = %step.id,
        action = %step.action.label(),
        target = %step.target,
        mandatory = step.mandatory,
        "Step started",
    );
    let (outcome, attempts) = match &step.action {
        StepAction::InitiateReplicaGroup { group } => ctx.initiate(group, &cancel).await,
        StepAction::RegisterShard { registration } => ctx.register(registration, &cancel).await,
    };
    StepResult {
        id: step.id,
        outcome,
        attempts,
    }
}

impl StepContext {
    async fn initiate(&self, group_id: &str, cancel: &CancellationToken) -> (StepOutcome, u32) {
        let Some(group) = self.topology.group(group_id) else {
            return (unknown_group(group_id), 0);
        };

        let probes = join_all(group.addresses().map(|a| self.prober.wait_ready(a, cancel))).await;
        let failure = group
            .addresses()
            .zip(probes)
            .find_map(|(address, probe)| self.probe_failure(&address.to_string(), probe, cancel));
        if let Some(failure) = failure {
            return (failure, 0);
        }

        let Executed { result, attempts } = self.executor.initiate_replica_group(group, cancel).await;
        let outcome = match result {
            Ok(InitiateOutcome::Success) => StepOutcome::Succeeded,
            Ok(InitiateOutcome::AlreadyInitiated) => StepOutcome::SkippedAlreadyDone,
            Err(e) => StepOutcome::failed(e.failure_kind(), e.to_string()),
        };
        (outcome, attempts)
    }

    async fn register(
        &self,
        registration: &ShardRegistration,
        cancel: &CancellationToken,
    ) -> (StepOutcome, u32) {
        let Some(group) = self.topology.group(&registration.shard_name) else {
            return (unknown_group(&registration.shard_name), 0);
        };
        let router = &self.topology.router().address;

        let probe = self.prober.wait_ready(router, cancel).await;
        if let Some(failure) = self.probe_failure(&format!("router {router}"), probe, cancel) {
            return (failure, 0);
        }

        let probe = self.prober.wait_primary(group, cancel).await;
        if let Some(failure) = self.probe_failure(&format!("{} primary", group.id), probe, cancel) {
            return (failure, 0);
        }

        let Executed { result, attempts } = self.executor.register_shard(router, registration, cancel).await;
        let outcome = match result {
            Ok(RegisterOutcome::Success) => StepOutcome::Succeeded,
            Ok(RegisterOutcome::AlreadyRegistered) => StepOutcome::SkippedAlreadyDone,
            Err(e) => StepOutcome::failed(e.failure_kind(), e.to_string()),
        };
        (outcome, attempts)
    }

    /// Failed outcome for a probe that did not end `Ready`.
    fn probe_failure(
        &self,
        what: &str,
        outcome: ProbeOutcome,
        cancel: &CancellationToken,
    ) -> Option<StepOutcome> {
        let cancelled = || {
            StepOutcome::failed(FailureKind::Aborted, format!("cancelled while waiting for {what}"))
        };
        match outcome {
            ProbeOutcome::Ready => None,
            _ if cancel.is_cancelled() => Some(cancelled()),
            ProbeOutcome::Cancelled => Some(cancelled()),
            ProbeOutcome::TimedOut { last_error } => {
                let mut reason = format!(
                    "{what} not ready within {}s",
                    self.prober.config().timeout.as_secs()
                );
                if let Some(last) = last_error {
                    reason.push_str(": ");
                    reason.push_str(&last);
                }
                Some(StepOutcome::failed(FailureKind::NodeUnreachable, reason))
            }
            ProbeOutcome::Fatal { reason } => Some(StepOutcome::failed(
                FailureKind::ProbeFatal,
                format!("{what}: {reason}"),
            )),
        }
    }
}

fn unknown_group(group_id: &str) -> StepOutcome {
    StepOutcome::failed(
        FailureKind::CommandRejected,
        format!("replica group '{group_id}' is not part of the topology"),
    )
}
