use std::path::PathBuf;

use thiserror::Error;

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no application artifact found in {0}")]
    ApplicationNotFound(PathBuf),

    #[error("application {path} is unusable: {reason}")]
    InvalidApplication { path: PathBuf, reason: String },

    #[error("launcher not found at {0}")]
    LauncherNotFound(PathBuf),

    #[error("no runtime named '{0}'")]
    UnknownRuntime(String),

    #[error("process is not running")]
    NotRunning,

    #[error("spawned process reported no pid")]
    MissingProcessId,

    #[error("command line is empty")]
    EmptyCommandLine,
}
