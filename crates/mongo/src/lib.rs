//! Database command boundary for shardboot.
//!
//! - [`admin`]: the [`AdminClient`](admin::AdminClient) trait and the
//!   command/reply documents it exchanges.
//! - [`mongosh`]: production client that drives `mongosh` subprocesses.
//! - [`process`]: launches local `mongod`/`mongos` processes.
//! - `testing` (feature `testing`): an in-memory simulated cluster.

pub mod admin;
pub mod error;
pub mod mongosh;
pub mod process;
pub mod reply;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
