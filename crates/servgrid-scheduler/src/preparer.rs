//! Environment-specific configuration files written before a start.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use servgrid_core::config::{NodeConfig, PropertiesRewrite};
use servgrid_state::ServiceInfoSnapshot;

/// Adjusts files inside a prepared service directory.
pub trait ConfigurationPreparer: Send + Sync {
    fn configure(&self, directory: &Path, snapshot: &ServiceInfoSnapshot) -> io::Result<()>;
}

/// Rewrites host and port keys of a `key=value` properties file, creating
/// it when absent.
pub struct PropertiesPreparer {
    rewrite: PropertiesRewrite,
}

impl PropertiesPreparer {
    pub fn new(rewrite: PropertiesRewrite) -> Self {
        Self { rewrite }
    }

    fn rewrite(&self, content: &str, host: &str, port: u16) -> String {
        let mut overrides: Vec<(&str, String)> = vec![(self.rewrite.port_key.as_str(), port.to_string())];
        if let Some(host_key) = &self.rewrite.host_key {
            overrides.push((host_key.as_str(), host.to_string()));
        }

        let mut seen = vec![false; overrides.len()];
        let mut out: Vec<String> = content
            .lines()
            .map(|line| {
                let key = line.split_once('=').map(|(k, _)| k.trim());
                match overrides.iter().position(|(k, _)| Some(*k) == key) {
                    Some(i) => {
                        seen[i] = true;
                        format!("{}={}", overrides[i].0, overrides[i].1)
                    }
                    None => line.to_string(),
                }
            })
            .collect();
        for (i, (key, value)) in overrides.iter().enumerate() {
            if !seen[i] {
                out.push(format!("{key}={value}"));
            }
        }
        let mut result = out.join("\n");
        result.push('\n');
        result
    }
}

impl ConfigurationPreparer for PropertiesPreparer {
    fn configure(&self, directory: &Path, snapshot: &ServiceInfoSnapshot) -> io::Result<()> {
        let path = directory.join(&self.rewrite.file);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let rewritten = self.rewrite(&content, &snapshot.address.host, snapshot.address.port);
        std::fs::write(path, rewritten)
    }
}

/// Preparers by environment name.
#[derive(Default, Clone)]
pub struct PreparerRegistry {
    preparers: HashMap<String, Arc<dyn ConfigurationPreparer>>,
}

impl PreparerRegistry {
    /// One [`PropertiesPreparer`] per environment with a rewrite rule.
    pub fn from_config(config: &NodeConfig) -> Self {
        let mut registry = Self::default();
        for (environment, settings) in &config.environments {
            if let Some(rewrite) = &settings.properties_rewrite {
                registry.register(
                    environment.clone(),
                    Arc::new(PropertiesPreparer::new(rewrite.clone())),
                );
            }
        }
        registry
    }

    pub fn register(&mut self, environment: impl Into<String>, preparer: Arc<dyn ConfigurationPreparer>) {
        self.preparers.insert(environment.into(), preparer);
    }

    pub fn get(&self, environment: &str) -> Option<Arc<dyn ConfigurationPreparer>> {
        self.preparers.get(environment).cloned()
    }
}
