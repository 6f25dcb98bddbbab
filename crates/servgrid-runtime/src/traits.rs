//! Runtime trait definitions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use servgrid_core::config::EnvironmentSettings;
use servgrid_state::ServiceConfiguration;

use crate::console::ConsoleLog;
use crate::error::RuntimeResult;

/// Everything a runtime needs to start one service.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub configuration: ServiceConfiguration,
    /// Working directory of the process.
    pub working_dir: PathBuf,
    pub environment: EnvironmentSettings,
    /// Resolved executable (service override or node default).
    pub java_command: String,
}

impl LaunchRequest {
    pub fn service_name(&self) -> String {
        self.configuration.name()
    }
}

/// Starts processes of one kind.
///
/// Runtimes are pure launchers; registry and lifecycle bookkeeping stay with
/// the caller.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Name services select the runtime by, e.g. `"jvm"`.
    fn name(&self) -> &'static str;

    /// Start the process. Output goes to `console`.
    async fn launch(
        &self,
        request: &LaunchRequest,
        console: Arc<ConsoleLog>,
    ) -> RuntimeResult<Arc<dyn ServiceProcess>>;
}

/// Handle to a started process.
#[async_trait]
pub trait ServiceProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    async fn alive(&self) -> bool;

    /// Write `line` plus a newline to the process input.
    async fn write_line(&self, line: &str) -> RuntimeResult<()>;

    /// Send `shutdown_commands`, wait up to `timeout`, then kill.
    async fn stop(&self, shutdown_commands: &[String], timeout: Duration);
}
