use thiserror::Error;

use servgrid_state::StateError;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("node '{0}' is not reachable")]
    Unreachable(String),

    #[error("node '{0}' is not a cluster member")]
    UnknownNode(String),
}
