//! Template, inclusion and deployment handling of local services.
//!
//! Items wait in per-service queues until the service prepares (or an
//! operation asks for them); a processed item moves to the matching
//! installed set. Failures skip the item and are logged.

use tracing::{debug, warn};

use servgrid_state::{
    ServiceConfiguration, ServiceDeployment, ServiceRemoteInclusion, ServiceTemplate,
};

use crate::inclusion;
use crate::service::LocalService;
use crate::storage::{DeploymentFilter, blocking, child_path};

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[derive(Debug, Default)]
pub struct ProvisioningQueues {
    pub waiting_templates: Vec<ServiceTemplate>,
    pub waiting_inclusions: Vec<ServiceRemoteInclusion>,
    pub waiting_deployments: Vec<ServiceDeployment>,
    pub installed_templates: Vec<ServiceTemplate>,
    pub installed_inclusions: Vec<ServiceRemoteInclusion>,
    pub installed_deployments: Vec<ServiceDeployment>,
}

impl ProvisioningQueues {
    /// Queue everything the configuration itself names.
    pub fn enqueue_configured(&mut self, configuration: &ServiceConfiguration) {
        for template in &configuration.templates {
            push_unique(&mut self.waiting_templates, template.clone());
        }
        for inclusion in &configuration.inclusions {
            push_unique(&mut self.waiting_inclusions, inclusion.clone());
        }
        for deployment in &configuration.deployments {
            push_unique(&mut self.waiting_deployments, deployment.clone());
        }
    }

    pub fn clear_installed(&mut self) {
        self.installed_templates.clear();
        self.installed_inclusions.clear();
        self.installed_deployments.clear();
    }

    /// Remove and return the waiting templates that may copy now, ordered
    /// by priority. The rest stay queued.
    pub fn take_templates(&mut self, force: bool, static_service: bool) -> Vec<ServiceTemplate> {
        let (mut ready, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiting_templates)
            .into_iter()
            .partition(|t| force || !static_service || t.always_copy_to_static_services);
        self.waiting_templates = keep;
        ready.sort();
        ready
    }
}

impl LocalService {
    pub fn add_template(&self, template: ServiceTemplate) {
        push_unique(&mut self.queues().waiting_templates, template);
    }

    pub fn add_inclusion(&self, inclusion: ServiceRemoteInclusion) {
        push_unique(&mut self.queues().waiting_inclusions, inclusion);
    }

    pub fn add_deployment(&self, deployment: ServiceDeployment) {
        push_unique(&mut self.queues().waiting_deployments, deployment);
    }

    pub fn waiting_templates(&self) -> Vec<ServiceTemplate> {
        self.queues().waiting_templates.clone()
    }

    pub fn waiting_inclusions(&self) -> Vec<ServiceRemoteInclusion> {
        self.queues().waiting_inclusions.clone()
    }

    pub fn waiting_deployments(&self) -> Vec<ServiceDeployment> {
        self.queues().waiting_deployments.clone()
    }

    pub fn installed_templates(&self) -> Vec<ServiceTemplate> {
        self.queues().installed_templates.clone()
    }

    pub fn installed_inclusions(&self) -> Vec<ServiceRemoteInclusion> {
        self.queues().installed_inclusions.clone()
    }

    pub fn installed_deployments(&self) -> Vec<ServiceDeployment> {
        self.queues().installed_deployments.clone()
    }

    /// Copy waiting templates into the service directory.
    ///
    /// Static services only take templates flagged to always copy, unless
    /// `force` is set.
    pub async fn include_waiting_templates(&self, force: bool) {
        let static_service = self.configuration().static_service;
        let templates = self.queues().take_templates(force, static_service);

        for template in templates {
            if self.ctx.events.template_load(&self.snapshot(), &template) {
                debug!(service = %self.name(), %template, "template load cancelled");
                continue;
            }
            let Some(storage) = self.ctx.storages.get(&template.storage) else {
                warn!(service = %self.name(), %template, "unknown template storage");
                continue;
            };
            let destination = self.directory().to_path_buf();
            let pulled = {
                let template = template.clone();
                blocking(move || storage.pull(&template, &destination)).await
            };
            match pulled {
                Ok(()) => {
                    debug!(service = %self.name(), %template, "template copied");
                    push_unique(&mut self.queues().installed_templates, template);
                }
                Err(e) => warn!(service = %self.name(), %template, error = %e, "template copy failed"),
            }
        }
    }

    /// Download (or reuse) waiting inclusions and copy them in place.
    pub async fn include_waiting_inclusions(&self) {
        let inclusions = std::mem::take(&mut self.queues().waiting_inclusions);

        for item in inclusions {
            if self.ctx.events.inclusion_load(&self.snapshot(), &item) {
                debug!(service = %self.name(), url = %item.url, "inclusion cancelled");
                continue;
            }
            let installed = async {
                let cached = inclusion::fetch_cached(&item, &self.ctx.config.inclusion_cache_dir).await?;
                inclusion::install(&item, &cached, self.directory()).await
            }
            .await;
            match installed {
                Ok(target) => {
                    debug!(service = %self.name(), url = %item.url, target = ?target, "inclusion installed");
                    push_unique(&mut self.queues().installed_inclusions, item);
                }
                Err(e) => warn!(service = %self.name(), url = %item.url, error = %e, "inclusion failed"),
            }
        }
    }

    /// Push the service directory to each waiting deployment's template.
    /// With `remove` the queue is emptied.
    pub async fn execute_deployments(&self, remove: bool) {
        let deployments = {
            let mut queues = self.queues();
            if remove {
                std::mem::take(&mut queues.waiting_deployments)
            } else {
                queues.waiting_deployments.clone()
            }
        };

        for deployment in deployments {
            if self.ctx.events.deployment(&self.snapshot(), &deployment) {
                debug!(service = %self.name(), template = %deployment.template, "deployment cancelled");
                continue;
            }
            let Some(storage) = self.ctx.storages.get(&deployment.template.storage) else {
                warn!(service = %self.name(), template = %deployment.template, "unknown template storage");
                continue;
            };
            let filter = DeploymentFilter::new(&deployment);
            let source = self.directory().to_path_buf();
            let template = deployment.template.clone();
            let deployed = blocking(move || {
                storage.deploy_directory(&template, &source, &|p| filter.accepts(p))
            })
            .await;
            match deployed {
                Ok(()) => {
                    debug!(service = %self.name(), template = %deployment.template, "deployment executed");
                    push_unique(&mut self.queues().installed_deployments, deployment);
                }
                Err(e) => warn!(
                    service = %self.name(),
                    template = %deployment.template,
                    error = %e,
                    "deployment failed"
                ),
            }
        }
    }

    /// Delete the configured transient files inside the service directory.
    pub(crate) async fn remove_files_after_stop(&self) {
        let configuration = self.configuration();
        for file in &configuration.deleted_files_after_stop {
            let Some(path) = child_path(self.directory(), file) else {
                warn!(service = %self.name(), %file, "refusing to delete outside the service directory");
                continue;
            };
            let removed = match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
                Ok(_) => tokio::fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => debug!(service = %self.name(), %file, "file removed after stop"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(service = %self.name(), %file, error = %e, "removing file failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_services_only_take_always_copied_templates() {
        let mut queues = ProvisioningQueues::default();
        let configuration = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .templates([
                ServiceTemplate::new("Lobby", "world").with_priority(5),
                ServiceTemplate::new("Global", "plugins")
                    .with_priority(1)
                    .always_copied(),
            ])
            .build()
            .unwrap();
        queues.enqueue_configured(&configuration);
        queues.enqueue_configured(&configuration);
        assert_eq!(queues.waiting_templates.len(), 2);

        let taken = queues.take_templates(false, true);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].name, "plugins");
        assert_eq!(queues.waiting_templates.len(), 1);

        let forced = queues.take_templates(true, true);
        assert_eq!(forced[0].name, "world");
        assert!(queues.waiting_templates.is_empty());
    }

    #[test]
    fn templates_are_taken_in_priority_order() {
        let mut queues = ProvisioningQueues::default();
        queues.waiting_templates = vec![
            ServiceTemplate::new("Lobby", "late").with_priority(10),
            ServiceTemplate::new("Lobby", "early").with_priority(-1),
            ServiceTemplate::new("Lobby", "middle"),
        ];
        let names: Vec<String> = queues
            .take_templates(false, false)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, ["early", "middle", "late"]);
    }
}
