pub mod config;
pub mod types;

pub use config::NodeConfig;
pub use types::*;
