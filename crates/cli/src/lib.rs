//! `shardboot` command-line front end.
//!
//! Argument parsing, topology loading, dry-run plan rendering and the run
//! driver live here so they can be tested without spawning the binary.
//! `main.rs` only sets up logging and the interrupt handler.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use shardboot_core::error::TopologyError;
use shardboot_core::planner::{plan, BootstrapPlan, FailurePolicy};
use shardboot_core::records::StepOutcome;
use shardboot_core::report::RunReport;
use shardboot_core::state::{BootstrapState, EXIT_INVALID_TOPOLOGY, EXIT_READY};
use shardboot_core::topology::ClusterTopology;
use shardboot_mongo::mongosh::MongoshClient;
use shardboot_mongo::process::{LaunchSettings, ProcessManager};
use shardboot_orchestrator::executor::RetryPolicy;
use shardboot_orchestrator::prober::{Backoff, ProbeConfig};
use shardboot_orchestrator::{BootstrapSettings, Orchestrator};
use tokio_util::sync::CancellationToken;

/// Log output format on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Bootstrap a sharded MongoDB cluster from a declarative topology file.
#[derive(Parser, Debug)]
#[command(name = "shardboot", version)]
pub struct Args {
    /// Topology file (JSON)
    pub topology: PathBuf,

    /// Readiness deadline per node
    #[arg(long, env = "SHARDBOOT_TIMEOUT", default_value = "120s", value_parser = parse_duration)]
    pub timeout: Duration,

    /// Delay between readiness polls
    #[arg(long, env = "SHARDBOOT_POLL_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// Grow the poll delay by this much after every failed poll
    #[arg(long, value_parser = parse_duration)]
    pub poll_backoff_step: Option<Duration>,

    /// Upper bound for the grown poll delay
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    pub poll_backoff_max: Duration,

    /// Consecutive protocol errors before a node is given up on
    #[arg(long, default_value_t = shardboot_orchestrator::prober::DEFAULT_MAX_PROTOCOL_ERRORS)]
    pub max_protocol_errors: u32,

    /// Attempts per command when failures are transient
    #[arg(long, default_value_t = shardboot_orchestrator::executor::DEFAULT_MAX_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Limit for a single admin command
    #[arg(long, env = "SHARDBOOT_COMMAND_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub command_timeout: Duration,

    /// Print the plan and exit without contacting any node
    #[arg(long)]
    pub dry_run: bool,

    /// Let shards not marked `required` fail without failing the run
    #[arg(long)]
    pub tolerate_optional_failures: bool,

    /// Start mongod/mongos processes for every node before bootstrapping
    #[arg(long, requires = "data_root")]
    pub launch: bool,

    /// Parent directory for data and logs of launched nodes
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    #[arg(long, env = "SHARDBOOT_MONGOSH", default_value = shardboot_mongo::mongosh::DEFAULT_MONGOSH)]
    pub mongosh: PathBuf,

    #[arg(long, env = "SHARDBOOT_MONGOD", default_value = shardboot_mongo::process::DEFAULT_MONGOD)]
    pub mongod: PathBuf,

    #[arg(long, env = "SHARDBOOT_MONGOS", default_value = shardboot_mongo::process::DEFAULT_MONGOS)]
    pub mongos: PathBuf,

    /// Write the run report as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Runtime settings for the orchestrator.
    pub fn settings(&self) -> BootstrapSettings {
        let backoff = match self.poll_backoff_step {
            Some(step) => Backoff::Linear {
                step,
                max: self.poll_backoff_max,
            },
            None => Backoff::Fixed,
        };
        BootstrapSettings {
            probe: ProbeConfig {
                timeout: self.timeout,
                poll_interval: self.poll_interval,
                backoff,
                max_consecutive_protocol_errors: self.max_protocol_errors.max(1),
            },
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                ..Default::default()
            },
            policy: if self.tolerate_optional_failures {
                FailurePolicy::TolerateOptionalShards
            } else {
                FailurePolicy::Abort
            },
            command_timeout: self.command_timeout,
        }
    }
}

/// Parse `500ms`, `2s`, `1m` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => input.split_at(pos),
        None => (input, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{input}' is too large")),
        _ => Err(format!("invalid duration unit in '{input}' (use ms, s or m)")),
    }
}

/// Read and validate a topology file. Unreadable files count as invalid
/// topologies.
pub fn load_topology(path: &Path) -> Result<ClusterTopology, TopologyError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| TopologyError::Parse(format!("{}: {e}", path.display())))?;
    ClusterTopology::from_json_str(&text)
}

/// Dry-run output: steps grouped into dependency waves.
pub fn render_plan(plan: &BootstrapPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Bootstrap plan: {} steps, policy {:?}",
        plan.len(),
        plan.policy()
    );
    for (i, wave) in plan.waves().iter().enumerate() {
        let _ = writeln!(out, "wave {}:", i + 1);
        for id in wave {
            let Some(step) = plan.step(*id) else { continue };
            let _ = write!(out, "  {} {} -> {}", step.id, step.action.label(), step.target);
            if !step.depends_on.is_empty() {
                let deps: Vec<String> = step.depends_on.iter().map(ToString::to_string).collect();
                let _ = write!(out, " (after {})", deps.join(", "));
            }
            if !step.mandatory {
                out.push_str(" [optional]");
            }
            out.push('\n');
        }
    }
    out
}

/// One line per step, failures with their kind and reason.
pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {}: {}", report.run_id, report.state.as_str());
    for step in &report.steps {
        let _ = write!(
            out,
            "  {:<22} {:<32} {}",
            step.outcome.as_str(),
            step.action,
            step.target
        );
        if let StepOutcome::Failed { kind, reason } = &step.outcome {
            let _ = write!(out, "  [{}] {reason}", kind.as_str());
        }
        out.push('\n');
    }
    if !report.unverified_shards.is_empty() {
        let _ = writeln!(
            out,
            "  unverified shards: {}",
            report.unverified_shards.join(", ")
        );
    }
    out
}

pub fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize run report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write run report to {}", path.display()))
}

/// Print the run summary and write the JSON report if asked to. A report
/// that cannot be written is logged; the exit code stays the run's own.
pub fn publish_report(report: &RunReport, path: Option<&Path>) -> u8 {
    print!("{}", render_report(report));
    if let Some(path) = path {
        match write_report(path, report) {
            Ok(()) => tracing::info!(path = %path.display(), "Run report written"),
            Err(e) => tracing::error!(error = %format!("{e:#}"), "Run report not written"),
        }
    }
    report.exit_code()
}

/// Execute the command described by `args` and return the process exit code.
pub async fn run(args: &Args, cancel: CancellationToken) -> anyhow::Result<u8> {
    let topology = match load_topology(&args.topology) {
        Ok(topology) => topology,
        Err(e) => {
            tracing::error!(path = %args.topology.display(), error = %e, "Invalid topology");
            return Ok(EXIT_INVALID_TOPOLOGY);
        }
    };
    let settings = args.settings();

    if args.dry_run {
        return match plan(&topology, settings.policy) {
            Ok(plan) => {
                print!("{}", render_plan(&plan));
                Ok(EXIT_READY)
            }
            Err(e) => {
                tracing::error!(error = %e, "Invalid topology");
                Ok(EXIT_INVALID_TOPOLOGY)
            }
        };
    }

    let launched = if args.launch {
        let data_root = args
            .data_root
            .clone()
            .context("--launch requires --data-root")?;
        let manager = ProcessManager::for_topology(
            LaunchSettings {
                mongod_binary: args.mongod.clone(),
                mongos_binary: args.mongos.clone(),
                ..LaunchSettings::new(data_root)
            },
            &topology,
        );
        let handles = manager
            .start_all(&topology)
            .await
            .context("Failed to launch node processes")?;
        Some((manager, handles))
    } else {
        None
    };

    let client = Arc::new(MongoshClient::new(&args.mongosh, settings.command_timeout));
    let orchestrator = Orchestrator::new(client, settings);

    let code = match orchestrator.run(&topology, cancel.clone()).await {
        Ok(report) => publish_report(&report, args.report.as_deref()),
        Err(e) => {
            tracing::error!(error = %e, "Invalid topology");
            EXIT_INVALID_TOPOLOGY
        }
    };

    if let Some((manager, handles)) = launched {
        if orchestrator.state() != BootstrapState::Failed && !cancel.is_cancelled() {
            tracing::info!(
                processes = handles.len(),
                data_root = %manager.data_root().display(),
                "Cluster processes running; interrupt to stop them",
            );
            cancel.cancelled().await;
        }
        manager.stop_all(handles).await;
    }

    Ok(code)
}
