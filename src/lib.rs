//! Taskmesh - distributed task-execution runtime
//!
//! An actor-style, location-transparent RPC-and-scheduling substrate:
//! clients submit asynchronous tasks addressed to a logical container of a
//! pool, and the runtime schedules, executes, replicates, and returns
//! results across a cluster of worker processes.

pub mod alloc;
pub mod client;
pub mod config;
pub mod domain;
pub mod lane;
pub mod modules;
pub mod pool;
pub mod remote;
pub mod runtime;
pub mod task;
pub mod transport;
pub mod worker;

pub use client::Client;
pub use runtime::Runtime;

/// Install the global tracing subscriber, honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
