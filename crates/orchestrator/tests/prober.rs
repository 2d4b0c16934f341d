//! Readiness prober timing and failure classification, on a paused clock.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use shardboot_mongo::admin::ReplicaSetConfig;
use shardboot_mongo::testing::SimCommand;
use shardboot_orchestrator::prober::{ProbeConfig, ProbeOutcome, ReadinessProber};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::*;

/// A node that comes up after a few refused pings is reported ready.
#[tokio::test(start_paused = true)]
async fn node_reachable_within_timeout_is_ready() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.reachable_after_pings(&addr(27020), 3);
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let start = Instant::now();
    let outcome = prober.wait_ready(&addr(27020), &CancellationToken::new()).await;

    assert_eq!(outcome, ProbeOutcome::Ready);
    assert_eq!(sim.calls(SimCommand::Ping), 4);
    assert_eq!(start.elapsed(), POLL_INTERVAL * 3);
}

/// A node that never answers times out, and no later than the bound.
#[tokio::test(start_paused = true)]
async fn unreachable_node_times_out_at_deadline() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27021));
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let start = Instant::now();
    let outcome = prober.wait_ready(&addr(27021), &CancellationToken::new()).await;
    let elapsed = start.elapsed();

    assert_matches!(outcome, ProbeOutcome::TimedOut { last_error: Some(_) });
    assert!(elapsed >= PROBE_TIMEOUT, "returned early after {elapsed:?}");
    assert!(
        elapsed <= PROBE_TIMEOUT + Duration::from_millis(1),
        "overshot the deadline: {elapsed:?}"
    );
}

/// Consecutive protocol errors beyond the bound are fatal.
#[tokio::test(start_paused = true)]
async fn repeated_protocol_errors_are_fatal() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.inject_protocol_errors(&addr(27020), 10);
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let outcome = prober.wait_ready(&addr(27020), &CancellationToken::new()).await;

    assert_matches!(outcome, ProbeOutcome::Fatal { ref reason } if reason.contains("Unauthorized"));
    assert_eq!(sim.calls(SimCommand::Ping), 3);
}

/// Fewer protocol errors than the bound are treated as "not ready yet".
#[tokio::test(start_paused = true)]
async fn sporadic_protocol_errors_are_tolerated() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.inject_protocol_errors(&addr(27020), 2);
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let outcome = prober.wait_ready(&addr(27020), &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Ready);
}

/// Cancelling the token abandons the wait immediately.
#[tokio::test(start_paused = true)]
async fn cancellation_abandons_probe() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.set_unreachable(&addr(27020));
    let prober = ReadinessProber::new(client(&sim), probe_config());
    let cancel = CancellationToken::new();

    let waiter = {
        let cancel = cancel.clone();
        tokio::spawn(async move { prober.wait_ready(&addr(27020), &cancel).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    let start = Instant::now();
    cancel.cancel();

    let outcome = waiter.await.unwrap();
    assert_eq!(outcome, ProbeOutcome::Cancelled);
    assert!(start.elapsed() < POLL_INTERVAL);
}

/// Waiting for a primary survives a delayed election.
#[tokio::test(start_paused = true)]
async fn waits_for_delayed_primary() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let shard = &topo.shards()[0];
    sim.preinitiate(&ReplicaSetConfig::for_group(shard));
    sim.delay_primary("shard1", 4);
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let outcome = prober.wait_primary(shard, &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Ready);
}

/// A group that is never initiated never reports a primary.
#[tokio::test(start_paused = true)]
async fn uninitiated_group_has_no_primary() {
    let topo = topology(1);
    let sim = simulated(&topo);
    let prober = ReadinessProber::new(client(&sim), probe_config());

    let outcome = prober
        .wait_primary(&topo.shards()[0], &CancellationToken::new())
        .await;
    assert_matches!(outcome, ProbeOutcome::TimedOut { last_error: Some(ref e) } if e.contains("not initiated"));
}

/// A timeout too large for the clock still probes normally.
#[tokio::test(start_paused = true)]
async fn oversized_timeout_is_clamped() {
    let topo = topology(0);
    let sim = simulated(&topo);
    sim.reachable_after_pings(&addr(27020), 2);
    let config = ProbeConfig {
        timeout: Duration::from_secs(u64::MAX),
        ..probe_config()
    };
    let prober = ReadinessProber::new(client(&sim), config);

    let outcome = prober.wait_ready(&addr(27020), &CancellationToken::new()).await;
    assert_eq!(outcome, ProbeOutcome::Ready);
}
