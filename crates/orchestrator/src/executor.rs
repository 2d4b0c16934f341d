//! Initialization Executor: the two idempotent, topology-changing actions.
//!
//! Both actions query current state first and only issue their command when
//! the cluster does not already hold the desired configuration. A different
//! configuration under the same name is reported as
//! [`ExecutionError::ConflictingState`] and never overwritten.
//!
//! Transient failures (elections in progress, members not yet reachable)
//! are retried with linear backoff up to [`RetryPolicy::max_attempts`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use shardboot_core::records::FailureKind;
use shardboot_core::topology::{NodeAddress, ReplicaGroupSpec, ShardRegistration};
use shardboot_core::types::GroupId;
use shardboot_mongo::admin::{AdminClient, RegisteredShard, ReplicaSetConfig, ReplicaSetStatus};
use shardboot_mongo::error::{codes, CommandError};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_STEP: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded linear retry for transient command failures.
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    /// Total command attempts, including the first.
    pub max_attempts: u32,
    /// Delay after attempt `n` is `n * step`, capped at `max_delay`.
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            step: DEFAULT_RETRY_STEP,
            max_delay: DEFAULT_RETRY_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

/// Result of a successful `initiate_replica_group`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiateOutcome {
    Success,
    /// The group already runs under the declared name; nothing was sent.
    AlreadyInitiated,
}

/// Result of a successful `register_shard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Success,
    /// The router already lists the shard with an equivalent seed list.
    AlreadyRegistered,
}

/// Why an executor operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The cluster holds a different configuration under the same name.
    #[error("Conflicting state: {0}")]
    ConflictingState(String),

    /// A retriable failure persisted through every attempt.
    #[error("Command still failing after {attempts} attempts: {source}")]
    TransientCommandFailure {
        attempts: u32,
        #[source]
        source: CommandError,
    },

    /// The node rejected the command.
    #[error("Command rejected: {0}")]
    Command(#[source] CommandError),

    #[error("Replica group '{0}' has no members")]
    NoMembers(GroupId),

    #[error("Cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// Failure kind recorded on the step.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::ConflictingState(_) => FailureKind::ConflictingState,
            Self::TransientCommandFailure { .. } => FailureKind::TransientCommandFailure,
            Self::Command(_) | Self::NoMembers(_) => FailureKind::CommandRejected,
            Self::Cancelled => FailureKind::Aborted,
        }
    }
}

/// An executor result together with the number of attempts it took.
#[derive(Debug)]
pub struct Executed<T> {
    pub result: Result<T, ExecutionError>,
    pub attempts: u32,
}

impl<T> Executed<T> {
    pub fn into_result(self) -> Result<T, ExecutionError> {
        self.result
    }
}

/// Failure of a single attempt.
enum AttemptError {
    Conflict(String),
    Command(CommandError),
}

impl From<CommandError> for AttemptError {
    fn from(err: CommandError) -> Self {
        Self::Command(err)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Applies initiate and registration steps idempotently.
pub struct InitializationExecutor {
    client: Arc<dyn AdminClient>,
    retry: RetryPolicy,
    /// One registration at a time per router.
    router_locks: Mutex<HashMap<NodeAddress, Arc<tokio::sync::Mutex<()>>>>,
}

impl InitializationExecutor {
    pub fn new(client: Arc<dyn AdminClient>, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            router_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Make sure `group` runs as a replica set under its declared name.
    pub async fn initiate_replica_group(
        &self,
        group: &ReplicaGroupSpec,
        cancel: &CancellationToken,
    ) -> Executed<InitiateOutcome> {
        let Some(seed) = group.seed_member().map(|m| &m.address) else {
            return Executed {
                result: Err(ExecutionError::NoMembers(group.id.clone())),
                attempts: 0,
            };
        };
        let config = ReplicaSetConfig::for_group(group);
        let executed = self
            .with_retry(&group.id, cancel, || self.initiate_once(group, seed, &config))
            .await;

        match &executed.result {
            Ok(InitiateOutcome::Success) => {
                tracing::info!(group = %group.id, target = %seed, attempts = executed.attempts, "Replica group initiated");
            }
            Ok(InitiateOutcome::AlreadyInitiated) => {
                tracing::info!(group = %group.id, target = %seed, "Replica group already initiated");
            }
            Err(_) => {}
        }
        executed
    }

    async fn initiate_once(
        &self,
        group: &ReplicaGroupSpec,
        seed: &NodeAddress,
        config: &ReplicaSetConfig,
    ) -> Result<InitiateOutcome, AttemptError> {
        if let Some(status) = self.client.replica_set_status(seed).await? {
            return resolve_existing(group, seed, &status);
        }

        match self.client.initiate_replica_set(seed, config).await {
            Ok(()) => Ok(InitiateOutcome::Success),
            // Lost a race with another initiator; look at what won.
            Err(e) if e.is_already_initialized() => match self.client.replica_set_status(seed).await? {
                Some(status) => resolve_existing(group, seed, &status),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Make sure the router lists `registration` as a shard.
    ///
    /// Registrations against the same router are serialized.
    pub async fn register_shard(
        &self,
        router: &NodeAddress,
        registration: &ShardRegistration,
        cancel: &CancellationToken,
    ) -> Executed<RegisterOutcome> {
        let lock = self.router_lock(router);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Executed { result: Err(ExecutionError::Cancelled), attempts: 0 };
            }
            guard = lock.lock() => guard,
        };

        let executed = self
            .with_retry(&registration.shard_name, cancel, || {
                self.register_once(router, registration)
            })
            .await;

        match &executed.result {
            Ok(RegisterOutcome::Success) => tracing::info!(
                shard = %registration.shard_name,
                seed_list = %registration.seed_list,
                router = %router,
                attempts = executed.attempts,
                "Shard registered",
            ),
            Ok(RegisterOutcome::AlreadyRegistered) => tracing::info!(
                shard = %registration.shard_name,
                router = %router,
                "Shard already registered",
            ),
            Err(_) => {}
        }
        executed
    }

    async fn register_once(
        &self,
        router: &NodeAddress,
        registration: &ShardRegistration,
    ) -> Result<RegisterOutcome, AttemptError> {
        let listed = self.client.list_shards(router).await?;
        if let Some(existing) = listed.iter().find(|s| s.id == registration.shard_name) {
            return resolve_registered(registration, existing);
        }

        match self.client.add_shard(router, registration).await {
            Ok(()) => Ok(RegisterOutcome::Success),
            Err(e) if e.code() == Some(codes::OPERATION_FAILED) => {
                // The name may have been taken meanwhile.
                let listed = self.client.list_shards(router).await?;
                match listed.iter().find(|s| s.id == registration.shard_name) {
                    Some(existing) => resolve_registered(registration, existing),
                    None => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shards from `expected` that the router does not list with an
    /// equivalent seed list.
    pub async fn unverified_shards(
        &self,
        router: &NodeAddress,
        expected: &[ShardRegistration],
        cancel: &CancellationToken,
    ) -> Executed<Vec<GroupId>> {
        let executed = self
            .with_retry("listShards", cancel, move || async move {
                Ok::<_, AttemptError>(self.client.list_shards(router).await?)
            })
            .await;
        let attempts = executed.attempts;
        let result = executed.result.map(|listed| {
            expected
                .iter()
                .filter(|reg| {
                    !listed.iter().any(|s| {
                        s.id == reg.shard_name
                            && s.seed_list().is_ok_and(|seeds| seeds.is_equivalent(&reg.seed_list))
                    })
                })
                .map(|reg| reg.shard_name.clone())
                .collect()
        });
        Executed { result, attempts }
    }

    fn router_lock(&self, router: &NodeAddress) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.router_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(router.clone()).or_default())
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut attempt: F) -> Executed<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempts = 0u32;
        let result = loop {
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ExecutionError::Cancelled),
                r = attempt() => r,
            };

            match outcome {
                Ok(value) => break Ok(value),
                Err(AttemptError::Conflict(msg)) => break Err(ExecutionError::ConflictingState(msg)),
                Err(AttemptError::Command(e)) if !e.is_transient() => break Err(ExecutionError::Command(e)),
                Err(AttemptError::Command(e)) if attempts >= self.retry.max_attempts => {
                    break Err(ExecutionError::TransientCommandFailure { attempts, source: e });
                }
                Err(AttemptError::Command(e)) => {
                    let delay = self.retry.delay_after(attempts);
                    tracing::warn!(
                        target_name = what,
                        attempt = attempts,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient command failure, retrying",
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Err(ExecutionError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        Executed { result, attempts }
    }
}

fn resolve_existing(
    group: &ReplicaGroupSpec,
    seed: &NodeAddress,
    status: &ReplicaSetStatus,
) -> Result<InitiateOutcome, AttemptError> {
    if status.set_name != group.id {
        return Err(AttemptError::Conflict(format!(
            "{seed} already belongs to replica set '{}', expected '{}'",
            status.set_name, group.id
        )));
    }

    let declared: BTreeSet<String> = group.addresses().map(ToString::to_string).collect();
    let running: BTreeSet<String> = status.members.iter().map(|m| m.name.clone()).collect();
    if declared != running {
        tracing::warn!(
            group = %group.id,
            declared = ?declared,
            running = ?running,
            "Replica group is initiated with a different member list",
        );
    }
    Ok(InitiateOutcome::AlreadyInitiated)
}

fn resolve_registered(
    registration: &ShardRegistration,
    existing: &RegisteredShard,
) -> Result<RegisterOutcome, AttemptError> {
    match existing.seed_list() {
        Ok(seeds) if seeds.is_equivalent(&registration.seed_list) => Ok(RegisterOutcome::AlreadyRegistered),
        _ => Err(AttemptError::Conflict(format!(
            "shard '{}' is registered as {}, declared {}",
            registration.shard_name, existing.host, registration.seed_list
        ))),
    }
}
