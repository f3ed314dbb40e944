//! Remote sandbox access and the runner pool.
//!
//! `client` defines the provider RPC surface and `http` its REST binding.
//! `provision` brings one sandbox to a clean checkpoint; `pool` keeps a fixed
//! set of them warm and hands them out one caller at a time.

pub mod backoff;
pub mod client;
pub mod http;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod pool;
pub mod provision;

pub use {
    client::{ExecOptions, ExecOutput, SandboxClient, SandboxError},
    http::HttpSandboxClient,
    pool::{
        PoolError, PoolSettings, PoolStats, RunnerLease, RunnerPool, RunnerState, RunnerStatus,
    },
};
