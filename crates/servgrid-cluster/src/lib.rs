//! servgrid-cluster: peer clustering for ServGrid nodes.
//!
//! Every node runs the same components; the head node is simply the
//! connected member with the earliest startup time.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── MembershipManager
//!   │   ├── join / heartbeat / drain / leave
//!   │   ├── Detects dead nodes (missed heartbeats)
//!   │   ├── Elects the head node
//!   │   └── Persists to StateStore
//!   ├── NodeAgent
//!   │   ├── Publishes the local NodeInfo on every beat
//!   │   └── Reaps dead members and reports them
//!   └── Transport (send / send_query)
//!       ├── Target::Node(id) | Target::Service(uuid) | Target::All
//!       ├── ClusterMessage payloads
//!       └── MessageHandler on the receiving side
//! ```
//!
//! The wire encoding of the transport is outside this crate.
//! [`InMemoryNetwork`] connects nodes living in one process and backs
//! standalone mode and the tests.

pub mod agent;
pub mod error;
pub mod membership;
pub mod message;
pub mod network;
pub mod transport;

pub use agent::{AgentConfig, NodeAgent, NodeInfoSource, NodeLostCallback};
pub use error::{ClusterError, ClusterResult};
pub use membership::{Member, MemberStatus, MembershipManager};
pub use message::{ClusterMessage, OperationOutcome, ServiceOperation};
pub use network::{InMemoryNetwork, InMemoryTransport};
pub use transport::{MessageHandler, Target, Transport};
