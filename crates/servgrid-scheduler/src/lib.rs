//! servgrid-scheduler: service lifecycle, registry and cross-node creation.
//!
//! Every node runs one [`Node`]. The head node (earliest connected member)
//! places new services; other nodes forward creation requests to it.
//!
//! # Architecture
//!
//! ```text
//! Node
//!   ├── ServiceRegistry (local + remote providers, keyed by unique id)
//!   ├── ServiceFactory
//!   │     ├── placement (servgrid-placement)
//!   │     ├── HeadToNodeStartService / FinishServiceRegistration
//!   │     └── RetryQueue (deferred creations)
//!   ├── LocalService
//!   │     ├── lifecycle: DEFINED → PREPARED ⇄ RUNNING → STOPPED → DELETED
//!   │     ├── templates, inclusions, deployments
//!   │     └── ServiceRuntime (servgrid-runtime)
//!   ├── NodeMessageHandler (cluster messages)
//!   └── NodeAgent (heartbeats, membership)
//! ```

pub mod bootstrap;
pub mod context;
pub mod error;
pub mod events;
pub mod factory;
pub mod handler;
pub mod inclusion;
pub mod node;
pub mod preparer;
pub mod provisioning;
pub mod registry;
pub mod retry;
pub mod service;
pub mod storage;
pub mod tick;
pub mod watchdog;

pub use bootstrap::{BootstrapDescriptor, SslMaterial};
pub use context::ServiceContext;
pub use error::{SchedulerError, SchedulerResult};
pub use events::{EventManager, NodeSelection, ServiceListener};
pub use factory::ServiceFactory;
pub use handler::NodeMessageHandler;
pub use node::{Node, NodeBuilder, await_creation};
pub use preparer::{ConfigurationPreparer, PreparerRegistry, PropertiesPreparer};
pub use registry::{RemoteService, ServiceFilter, ServiceProvider, ServiceRegistry};
pub use retry::{RetryTracker, retry_delay};
pub use service::LocalService;
pub use storage::{LocalTemplateStorage, TemplateStorage, TemplateStorageRegistry};
