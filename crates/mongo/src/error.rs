//! Errors from the database command boundary.

/// Server error codes the orchestrator reacts to.
pub mod codes {
    pub const HOST_UNREACHABLE: i32 = 6;
    pub const HOST_NOT_FOUND: i32 = 7;
    pub const UNAUTHORIZED: i32 = 13;
    pub const ALREADY_INITIALIZED: i32 = 23;
    pub const NODE_NOT_FOUND: i32 = 74;
    pub const NETWORK_TIMEOUT: i32 = 89;
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub const INVALID_REPLICA_SET_CONFIG: i32 = 93;
    pub const NOT_YET_INITIALIZED: i32 = 94;
    pub const OPERATION_FAILED: i32 = 96;
    pub const FAILED_TO_SATISFY_READ_PREFERENCE: i32 = 133;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
    pub const NOT_PRIMARY_NO_SECONDARY_OK: i32 = 13435;
    pub const NOT_PRIMARY_OR_SECONDARY: i32 = 13436;

    /// Codes that clear up on their own once elections and heartbeats settle.
    pub const TRANSIENT: &[i32] = &[
        HOST_UNREACHABLE,
        HOST_NOT_FOUND,
        NODE_NOT_FOUND,
        NETWORK_TIMEOUT,
        SHUTDOWN_IN_PROGRESS,
        FAILED_TO_SATISFY_READ_PREFERENCE,
        PRIMARY_STEPPED_DOWN,
        NOT_WRITABLE_PRIMARY,
        INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
        NOT_PRIMARY_NO_SECONDARY_OK,
        NOT_PRIMARY_OR_SECONDARY,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// Connection refused, DNS failure or server selection timeout.
    #[error("Node {address} unreachable: {message}")]
    Unreachable { address: String, message: String },

    /// The command did not finish within the client-side timeout.
    #[error("Command against {address} timed out after {elapsed_ms}ms")]
    Timeout { address: String, elapsed_ms: u64 },

    /// The server answered with `ok: 0`.
    #[error("Server error {code_name} ({code}): {message}")]
    Server {
        code: i32,
        code_name: String,
        message: String,
    },

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    /// The shell client itself could not be started.
    #[error("Failed to run admin client: {0}")]
    Spawn(String),
}

impl CommandError {
    pub fn server(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The node could not be talked to at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// Worth retrying after a short wait.
    pub fn is_transient(&self) -> bool {
        self.is_connectivity()
            || self
                .code()
                .is_some_and(|code| codes::TRANSIENT.contains(&code))
    }

    pub fn is_already_initialized(&self) -> bool {
        self.code() == Some(codes::ALREADY_INITIALIZED)
    }
}
