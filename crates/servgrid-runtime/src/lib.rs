//! servgrid-runtime: turns a prepared service directory into a running,
//! observable OS process.
//!
//! # Architecture
//!
//! ```text
//! ServiceRuntime (one per runtime name, e.g. "jvm")
//!   └── launch(LaunchRequest, ConsoleLog) ──▶ ServiceProcess
//!         ├── write_line   stdin
//!         ├── alive        handle liveness
//!         └── stop         shutdown commands, bounded wait, kill
//!
//! OsProcess ── stdout/stderr ──▶ ConsoleLog (bounded cache + broadcast)
//! SystemMonitor ── CPU load, process usage (sysinfo)
//! ```

pub mod arguments;
pub mod console;
pub mod error;
pub mod jvm;
pub mod process;
pub mod system;
pub mod traits;

pub use console::{ConsoleLine, ConsoleLog};
pub use error::{RuntimeError, RuntimeResult};
pub use jvm::JvmRuntime;
pub use process::OsProcess;
pub use system::{SysinfoMonitor, SystemMonitor};
pub use traits::{LaunchRequest, ServiceProcess, ServiceRuntime};
