//! ServGrid placement: picks the node that should run a service.
//!
//! This crate only decides. It never starts anything: the creation protocol
//! in `servgrid-scheduler` feeds it a view of the cluster and acts on the
//! answer.
//!
//! # Components
//!
//! - **`scorer`**: Node candidates and the comparison chain
//!   (reserved memory %, then CPU load)
//! - **`selector`**: `select_node_for_service` and warm-slot reuse via
//!   `select_prepared_service`
//! - **`convert`**: Candidates from node records and service snapshots

pub mod convert;
pub mod error;
pub mod scorer;
pub mod selector;

pub use convert::{node_candidates, node_info_to_candidate};
pub use error::{PlacementError, PlacementResult};
pub use scorer::{NodeCandidate, compare_by_memory_usage, compare_by_reserved_memory};
pub use selector::{select_node_for_service, select_prepared_service};
