//! JVM runtime: starts services through the bootstrap launcher.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use servgrid_core::config::LauncherConfig;

use crate::arguments::{
    build_jvm_arguments, find_application_artifact, read_application_manifest, read_dependency_classpath,
};
use crate::console::ConsoleLog;
use crate::error::{RuntimeError, RuntimeResult};
use crate::process::OsProcess;
use crate::traits::{LaunchRequest, ServiceProcess, ServiceRuntime};

#[derive(Clone)]
pub struct JvmRuntime {
    launcher: LauncherConfig,
}

impl JvmRuntime {
    pub fn new(launcher: LauncherConfig) -> Self {
        Self { launcher }
    }

    /// Resolve the full command line for `request`.
    pub fn command_line(&self, request: &LaunchRequest) -> RuntimeResult<Vec<String>> {
        if !self.launcher.jar.exists() {
            return Err(RuntimeError::LauncherNotFound(self.launcher.jar.clone()));
        }
        let application = find_application_artifact(
            &request.working_dir,
            request.configuration.environment(),
            &request.environment.application_names,
        )
        .ok_or_else(|| RuntimeError::ApplicationNotFound(request.working_dir.clone()))?;

        let manifest = read_application_manifest(&application)?;
        let dependencies = read_dependency_classpath(&self.launcher)?;
        Ok(build_jvm_arguments(
            request,
            &self.launcher,
            &dependencies,
            &application,
            &manifest,
        ))
    }
}

fn split_command(args: &[String]) -> RuntimeResult<(&String, &[String])> {
    args.split_first().ok_or(RuntimeError::EmptyCommandLine)
}

#[async_trait]
impl ServiceRuntime for JvmRuntime {
    fn name(&self) -> &'static str {
        "jvm"
    }

    async fn launch(
        &self,
        request: &LaunchRequest,
        console: Arc<ConsoleLog>,
    ) -> RuntimeResult<Arc<dyn ServiceProcess>> {
        let args = {
            let runtime = self.clone();
            let request = request.clone();
            tokio::task::spawn_blocking(move || runtime.command_line(&request))
                .await
                .map_err(std::io::Error::other)??
        };
        let (program, rest) = split_command(&args)?;
        debug!(service = %request.service_name(), ?args, "launching jvm service");

        let process = OsProcess::spawn(
            request.service_name(),
            program,
            rest,
            &request.working_dir,
            &request.configuration.process.environment_variables,
            console,
        )?;
        Ok(Arc::new(process))
    }
}
