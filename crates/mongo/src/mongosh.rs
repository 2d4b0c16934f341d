//! [`AdminClient`] implementation that shells out to `mongosh`.
//!
//! Each command spawns `mongosh --quiet --norc <uri> --eval <script>`. The
//! script wraps `db.adminCommand` in a `try`/`catch` so that both success
//! and server errors print exactly one JSON document on stdout. When the
//! shell cannot reach the node it exits non-zero before evaluating the
//! script, which is reported as [`CommandError::Unreachable`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use shardboot_core::topology::{NodeAddress, ShardRegistration};
use tokio::process::Command;

use crate::admin::{AdminClient, RegisteredShard, ReplicaSetConfig, ReplicaSetStatus};
use crate::error::CommandError;
use crate::reply;

/// Default binary name, resolved through `PATH`.
pub const DEFAULT_MONGOSH: &str = "mongosh";

/// Default wall-clock limit for a single shell invocation.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Server selection timeout passed in the connection string, so an
/// unreachable node fails fast instead of hanging until the command timeout.
const SERVER_SELECTION_TIMEOUT_MS: u64 = 5_000;

/// stderr fragments that mean "could not connect".
const CONNECTIVITY_MARKERS: &[&str] = &[
    "ECONNREFUSED",
    "ECONNRESET",
    "ENOTFOUND",
    "EHOSTUNREACH",
    "MongoNetworkError",
    "MongoServerSelectionError",
    "connection refused",
    "timed out",
];

/// [`AdminClient`] that shells out to `mongosh`, one process per command.
///
/// Each command runs with `--quiet --norc` against a direct connection to
/// the target and is killed if it outlives `command_timeout`.
pub struct MongoshClient {
    binary: PathBuf,
    command_timeout: Duration,
}

impl Default for MongoshClient {
    fn default() -> Self {
        Self::new(DEFAULT_MONGOSH, DEFAULT_COMMAND_TIMEOUT)
    }
}

impl MongoshClient {
    pub fn new(binary: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    /// Path of the `mongosh` executable.
    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    /// Run one admin command and return its reply document (not yet
    /// checked for `ok`).
    async fn run_admin_command(
        &self,
        target: &NodeAddress,
        command: &Value,
    ) -> Result<Value, CommandError> {
        let script = eval_script(command);
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--quiet")
            .arg("--norc")
            .arg(connection_uri(target))
            .arg("--eval")
            .arg(&script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(target = %target, command = %command, "Running admin command");

        let start = Instant::now();
        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(CommandError::Spawn(format!(
                    "{}: {e}",
                    self.binary.display()
                )))
            }
            Err(_) => {
                return Err(CommandError::Timeout {
                    address: target.to_string(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reply = interpret_output(target, output.status.success(), &stdout, &stderr)?;
        tracing::debug!(
            target = %target,
            elapsed_ms = start.elapsed().as_millis() as u64,
            reply = %reply,
            "Admin command replied",
        );
        Ok(reply)
    }
}

/// Direct connection so that members of an uninitiated set still answer.
pub fn connection_uri(target: &NodeAddress) -> String {
    format!(
        "mongodb://{target}/admin?directConnection=true&serverSelectionTimeoutMS={SERVER_SELECTION_TIMEOUT_MS}"
    )
}

/// Script that prints the command reply, or the thrown server error, as a
/// single relaxed-EJSON line.
pub fn eval_script(command: &Value) -> String {
    format!(
        "try {{ print(EJSON.stringify(db.adminCommand({command}), {{ relaxed: true }})); }} \
         catch (e) {{ print(EJSON.stringify({{ ok: 0, code: e.code ?? -1, \
         codeName: e.codeName ?? e.name ?? 'ClientError', errmsg: String(e.message ?? e) }})); }}"
    )
}

/// Classify a finished shell invocation.
///
/// The last stdout line that parses as a JSON object is the reply. Without
/// one, a non-zero exit whose stderr mentions a network failure means the
/// node is unreachable.
pub fn interpret_output(
    target: &NodeAddress,
    exited_ok: bool,
    stdout: &str,
    stderr: &str,
) -> Result<Value, CommandError> {
    let reply = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .find_map(|line| serde_json::from_str::<Value>(line).ok().filter(Value::is_object));

    if let Some(reply) = reply {
        return Ok(reply);
    }

    let stderr = stderr.trim();
    if !exited_ok && CONNECTIVITY_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Err(CommandError::Unreachable {
            address: target.to_string(),
            message: last_line(stderr).to_string(),
        });
    }

    Err(CommandError::MalformedReply(if stderr.is_empty() {
        format!("no reply from {target}")
    } else {
        last_line(stderr).to_string()
    }))
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or(text)
}

#[async_trait]
impl AdminClient for MongoshClient {
    async fn ping(&self, target: &NodeAddress) -> Result<(), CommandError> {
        let reply = self.run_admin_command(target, &json!({ "ping": 1 })).await?;
        reply::check_ok(&reply)
    }

    async fn replica_set_status(
        &self,
        target: &NodeAddress,
    ) -> Result<Option<ReplicaSetStatus>, CommandError> {
        let reply = self
            .run_admin_command(target, &json!({ "replSetGetStatus": 1 }))
            .await?;
        reply::parse_status(reply)
    }

    async fn initiate_replica_set(
        &self,
        target: &NodeAddress,
        config: &ReplicaSetConfig,
    ) -> Result<(), CommandError> {
        let config = serde_json::to_value(config)
            .map_err(|e| CommandError::MalformedReply(e.to_string()))?;
        let reply = self
            .run_admin_command(target, &json!({ "replSetInitiate": config }))
            .await?;
        reply::check_ok(&reply)
    }

    async fn add_shard(
        &self,
        router: &NodeAddress,
        registration: &ShardRegistration,
    ) -> Result<(), CommandError> {
        let command = json!({
            "addShard": registration.seed_list.to_string(),
            "name": registration.shard_name,
        });
        let reply = self.run_admin_command(router, &command).await?;
        reply::check_ok(&reply)
    }

    async fn list_shards(&self, router: &NodeAddress) -> Result<Vec<RegisteredShard>, CommandError> {
        let reply = self
            .run_admin_command(router, &json!({ "listShards": 1 }))
            .await?;
        reply::parse_shards(reply)
    }
}
