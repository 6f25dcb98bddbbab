//! servgrid-state: service data model and embedded configuration store.
//!
//! The data model describes a service from submission to deletion:
//!
//! ```text
//!   ServiceConfiguration ──(placement + lifecycle)──▶ ServiceInfoSnapshot
//!        │  ServiceId                                     │ lifecycle
//!        │  ProcessConfiguration                          │ ProcessSnapshot
//!        │  templates / inclusions / deployments          │ configuration
//!        └─ RetryConfiguration                            └─ properties
//! ```
//!
//! Configurations and ids are immutable once built; snapshots are replaced,
//! never edited. Tasks, groups and node records are persisted in
//! [redb](https://docs.rs/redb) as JSON values so operators can manage them
//! across restarts. Services themselves are never persisted.

pub mod configuration;
pub mod error;
pub mod resources;
pub mod store;
pub mod tables;
pub mod task;
pub mod types;

pub use configuration::*;
pub use error::{StateError, StateResult};
pub use resources::*;
pub use store::StateStore;
pub use task::*;
pub use types::*;
