//! Readiness Prober: bounded polling until a node (or a replica group's
//! primary) is able to take commands.
//!
//! Connection failures mean "not up yet" and are retried silently until the
//! deadline. Explicit protocol errors are tolerated for a configured number
//! of consecutive polls, then the probe gives up as [`ProbeOutcome::Fatal`].
//! Every wait selects on the run's [`CancellationToken`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use shardboot_core::topology::{NodeAddress, ReplicaGroupSpec};
use shardboot_mongo::admin::AdminClient;
use shardboot_mongo::error::CommandError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Overall readiness deadline per node.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(120);
/// Delay between polls, matching a `sleep 2` health loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_PROTOCOL_ERRORS: u32 = 5;
/// Deadline used when the configured timeout does not fit the clock.
const MAX_PROBE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How the delay between polls evolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Always wait `poll_interval`.
    Fixed,
    /// Grow the delay by `step` after every poll, up to `max`.
    Linear { step: Duration, max: Duration },
}

/// Timing of readiness probes.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeConfig {
    /// Overall deadline for one wait.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub backoff: Backoff,
    /// Consecutive protocol errors tolerated before the probe is fatal.
    pub max_consecutive_protocol_errors: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            backoff: Backoff::Fixed,
            max_consecutive_protocol_errors: DEFAULT_MAX_PROTOCOL_ERRORS,
        }
    }
}

/// Delay to use after `current`.
pub fn next_delay(current: Duration, config: &ProbeConfig) -> Duration {
    match config.backoff {
        Backoff::Fixed => config.poll_interval,
        Backoff::Linear { step, max } => current.saturating_add(step).min(max.max(config.poll_interval)),
    }
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// The deadline passed; `last_error` is the final poll's failure.
    TimedOut { last_error: Option<String> },
    /// Repeated protocol errors, or a client that cannot run at all.
    Fatal { reason: String },
    Cancelled,
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Result of a single poll.
enum Poll {
    Ready,
    NotReady(String),
    ProtocolError(String),
    Fatal(String),
}

impl From<CommandError> for Poll {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Spawn(_) => Poll::Fatal(err.to_string()),
            e if e.is_connectivity() => Poll::NotReady(e.to_string()),
            e => Poll::ProtocolError(e.to_string()),
        }
    }
}

/// Polls nodes until they answer, or a group until it has a primary.
#[derive(Clone)]
pub struct ReadinessProber {
    client: Arc<dyn AdminClient>,
    config: ProbeConfig,
}

impl ReadinessProber {
    pub fn new(client: Arc<dyn AdminClient>, config: ProbeConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Ping `target` until it answers, the deadline passes, or `cancel`
    /// fires.
    pub async fn wait_ready(&self, target: &NodeAddress, cancel: &CancellationToken) -> ProbeOutcome {
        let label = target.to_string();
        self.poll_until(&label, cancel, move || async move {
            match self.client.ping(target).await {
                Ok(()) => Poll::Ready,
                Err(e) => e.into(),
            }
        })
        .await
    }

    /// Poll the group's members until one reports an elected primary.
    pub async fn wait_primary(
        &self,
        group: &ReplicaGroupSpec,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let label = format!("{} primary", group.id);
        self.poll_until(&label, cancel, move || async move {
            let mut last = Poll::NotReady(format!("no member of {} answered", group.id));
            for address in group.addresses() {
                match self.client.replica_set_status(address).await {
                    Ok(Some(status)) if status.primary().is_some() => return Poll::Ready,
                    Ok(Some(_)) => last = Poll::NotReady("no primary elected yet".to_string()),
                    Ok(None) => last = Poll::NotReady(format!("{address} is not initiated")),
                    Err(e) => match Poll::from(e) {
                        fatal @ Poll::Fatal(_) => return fatal,
                        // An answering member outranks an unreachable one.
                        Poll::NotReady(msg) if !matches!(last, Poll::NotReady(_)) => {
                            tracing::trace!(%address, error = %msg, "Member unreachable");
                        }
                        other => last = other,
                    },
                }
            }
            last
        })
        .await
    }

    async fn poll_until<F, Fut>(&self, what: &str, cancel: &CancellationToken, mut poll: F) -> ProbeOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Poll>,
    {
        let start = Instant::now();
        let deadline = start
            .checked_add(self.config.timeout)
            .unwrap_or(start + MAX_PROBE_TIMEOUT);
        let mut delay = self.config.poll_interval;
        let mut protocol_errors = 0u32;
        let mut attempt = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                r = tokio::time::timeout_at(deadline, poll()) => r,
            };

            match result {
                Err(_elapsed) => break,
                Ok(Poll::Ready) => {
                    tracing::debug!(
                        target_node = what,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Ready",
                    );
                    return ProbeOutcome::Ready;
                }
                Ok(Poll::NotReady(msg)) => {
                    protocol_errors = 0;
                    tracing::debug!(target_node = what, attempt, error = %msg, "Not ready yet");
                    last_error = Some(msg);
                }
                Ok(Poll::ProtocolError(msg)) => {
                    protocol_errors += 1;
                    tracing::debug!(
                        target_node = what,
                        attempt,
                        protocol_errors,
                        error = %msg,
                        "Probe returned a protocol error",
                    );
                    if protocol_errors >= self.config.max_consecutive_protocol_errors {
                        return ProbeOutcome::Fatal {
                            reason: format!("{protocol_errors} consecutive protocol errors, last: {msg}"),
                        };
                    }
                    last_error = Some(msg);
                }
                Ok(Poll::Fatal(reason)) => return ProbeOutcome::Fatal { reason },
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let sleep_for = delay.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(sleep_for) => {}
            }
            delay = next_delay(delay, &self.config);
        }

        tracing::debug!(
            target_node = what,
            attempt,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "Probe timed out",
        );
        ProbeOutcome::TimedOut { last_error }
    }
}
