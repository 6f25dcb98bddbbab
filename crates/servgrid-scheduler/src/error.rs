//! Scheduler error types.

use thiserror::Error;

/// Errors raised inside the scheduler. Creation and lifecycle requests
/// report their outcome as values instead; these stay component-internal.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("state store error: {0}")]
    State(#[from] servgrid_state::StateError),

    #[error("runtime error: {0}")]
    Runtime(#[from] servgrid_runtime::RuntimeError),

    #[error("cluster error: {0}")]
    Cluster(#[from] servgrid_cluster::ClusterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
