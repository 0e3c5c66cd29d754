//! forkcache: an import cache for a serverless lambda worker
//!
//! Maintains a forest of pre-initialized interpreter processes (fork
//! servers), each holding a set of already-imported packages, and forks
//! lambda processes out of the best-matching ancestor instead of
//! cold-starting an interpreter per invocation.

pub mod cgroup;
pub mod config;
pub mod evictor;
pub mod manager;
pub mod matcher;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod sizes;
pub mod testing;
pub mod types;
