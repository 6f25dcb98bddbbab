use thiserror::Error;

pub type PlacementResult<T> = Result<T, PlacementError>;

/// Why no node was chosen. Both cases are transient from the caller's view.
#[derive(Debug, Error, PartialEq)]
pub enum PlacementError {
    #[error("pinned node '{0}' is not connected or is draining")]
    PinnedNodeUnavailable(String),

    #[error("no eligible node for service '{0}'")]
    NoEligibleNode(String),
}
