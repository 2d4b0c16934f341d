//! Node Process Manager: launches local `mongod`/`mongos` processes for a
//! topology.
//!
//! Only used when the operator asks the CLI to start the nodes itself. The
//! command lines mirror a classic single-host deployment: every data node
//! gets its own `--dbpath` under the data root and logs next to it.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use shardboot_core::topology::{ClusterTopology, NodeRole, NodeSpec, SeedList};
use tokio::process::{Child, Command};

pub const DEFAULT_MONGOD: &str = "mongod";
pub const DEFAULT_MONGOS: &str = "mongos";

/// How long `stop` waits for a killed process to be reaped.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A process still running this long after spawn counts as started.
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Failures starting or stopping node processes.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {program} for {node}: {source}")]
    Spawn {
        program: PathBuf,
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process for {node} exited early with {status}")]
    ExitedEarly { node: String, status: String },

    #[error("Process for {node} did not stop within {timeout_secs}s")]
    StopTimeout { node: String, timeout_secs: u64 },

    #[error("Failed to stop process for {node}: {source}")]
    Stop {
        node: String,
        #[source]
        source: std::io::Error,
    },
}

/// Binaries and directories used to launch nodes.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub mongod_binary: PathBuf,
    pub mongos_binary: PathBuf,
    /// Parent directory for per-node data directories and log files.
    pub data_root: PathBuf,
    /// Exiting within this window after spawn is a launch failure.
    pub startup_grace: Duration,
}

impl LaunchSettings {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            mongod_binary: PathBuf::from(DEFAULT_MONGOD),
            mongos_binary: PathBuf::from(DEFAULT_MONGOS),
            data_root: data_root.into(),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Fully resolved command line for one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Directory created before spawning.
    pub data_dir: PathBuf,
    pub log_path: PathBuf,
}

fn node_label(node: &NodeSpec) -> String {
    format!("{}-{}", node.group_id, node.id)
}

/// Build the command line for `node`. The router needs the config-server
/// seed list for `--configdb`.
pub fn launch_command(node: &NodeSpec, settings: &LaunchSettings, config_db: &SeedList) -> LaunchCommand {
    let port = node.address.port().to_string();
    let bind_ip = node.address.host().to_string();

    match node.role {
        NodeRole::Router => {
            let data_dir = node
                .data_dir
                .clone()
                .unwrap_or_else(|| settings.data_root.clone());
            let log_path = data_dir.join("router.log");
            LaunchCommand {
                program: settings.mongos_binary.clone(),
                args: vec![
                    "--configdb".into(),
                    config_db.to_string(),
                    "--port".into(),
                    port,
                    "--bind_ip".into(),
                    bind_ip,
                    "--logpath".into(),
                    log_path.display().to_string(),
                ],
                data_dir,
                log_path,
            }
        }
        NodeRole::ConfigServer | NodeRole::ShardMember => {
            let label = node_label(node);
            let data_dir = node
                .data_dir
                .clone()
                .unwrap_or_else(|| settings.data_root.join(&label));
            let log_path = data_dir.join(format!("{label}.log"));
            let role_flag = if node.role == NodeRole::ConfigServer {
                "--configsvr"
            } else {
                "--shardsvr"
            };
            LaunchCommand {
                program: settings.mongod_binary.clone(),
                args: vec![
                    role_flag.into(),
                    "--replSet".into(),
                    node.group_id.clone(),
                    "--port".into(),
                    port,
                    "--bind_ip".into(),
                    bind_ip,
                    "--dbpath".into(),
                    data_dir.display().to_string(),
                    "--logpath".into(),
                    log_path.display().to_string(),
                ],
                data_dir,
                log_path,
            }
        }
    }
}

/// A running node process. Dropping the handle kills the process.
#[derive(Debug)]
pub struct ProcessHandle {
    node: String,
    child: Child,
}

impl ProcessHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Starts and stops the processes of one topology.
pub struct ProcessManager {
    settings: LaunchSettings,
    config_db: SeedList,
}

impl ProcessManager {
    pub fn for_topology(settings: LaunchSettings, topology: &ClusterTopology) -> Self {
        Self {
            settings,
            config_db: topology.config_servers().seed_list(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.settings.data_root
    }

    /// Create the node's data directory and spawn its process.
    pub async fn start(&self, node: &NodeSpec) -> Result<ProcessHandle, LaunchError> {
        let command = launch_command(node, &self.settings, &self.config_db);
        let label = format!("{} ({})", node_label(node), node.address);

        tokio::fs::create_dir_all(&command.data_dir)
            .await
            .map_err(|source| LaunchError::DataDir {
                path: command.data_dir.clone(),
                source,
            })?;

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: command.program.clone(),
                node: label.clone(),
                source,
            })?;

        // A bad flag or an occupied port makes the process exit right away.
        match tokio::time::timeout(self.settings.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                return Err(LaunchError::ExitedEarly {
                    node: label,
                    status: status.to_string(),
                });
            }
            Ok(Err(source)) => {
                return Err(LaunchError::Spawn {
                    program: command.program,
                    node: label,
                    source,
                });
            }
            Err(_) => {}
        }

        tracing::info!(
            node = %label,
            role = node.role.as_str(),
            pid = child.id(),
            log = %command.log_path.display(),
            "Node process started",
        );

        Ok(ProcessHandle { node: label, child })
    }

    /// Start every node of the topology: data nodes first, router last.
    /// Processes already started are killed if a later one fails.
    pub async fn start_all(&self, topology: &ClusterTopology) -> Result<Vec<ProcessHandle>, LaunchError> {
        let mut handles = Vec::new();
        for node in topology.all_nodes() {
            handles.push(self.start(&node).await?);
        }
        Ok(handles)
    }

    /// Kill the process and wait for it to exit.
    pub async fn stop(&self, mut handle: ProcessHandle) -> Result<(), LaunchError> {
        if let Err(source) = handle.child.start_kill() {
            // Already exited.
            if source.kind() != std::io::ErrorKind::InvalidInput {
                return Err(LaunchError::Stop {
                    node: handle.node,
                    source,
                });
            }
        }
        match tokio::time::timeout(STOP_TIMEOUT, handle.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(node = %handle.node, %status, "Node process stopped");
                Ok(())
            }
            Ok(Err(source)) => Err(LaunchError::Stop {
                node: handle.node,
                source,
            }),
            Err(_) => Err(LaunchError::StopTimeout {
                node: handle.node,
                timeout_secs: STOP_TIMEOUT.as_secs(),
            }),
        }
    }

    /// Stop in reverse start order, router first. Failures are logged.
    pub async fn stop_all(&self, handles: Vec<ProcessHandle>) {
        for handle in handles.into_iter().rev() {
            if let Err(e) = self.stop(handle).await {
                tracing::warn!(error = %e, "Failed to stop node process");
            }
        }
    }
}
