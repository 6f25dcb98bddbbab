//! node.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{HostAndPort, NodeId, is_valid_name};

/// Static configuration of one cluster node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Addresses services connect back to after they boot.
    pub listeners: Vec<HostAndPort>,
    /// Memory (MB) this node may hand out as service heap.
    pub max_memory_mb: u64,
    /// CPU load percentage at or above which new starts are refused.
    pub max_cpu_usage_to_start_services: f64,
    /// Re-queue refused starts onto the next tick instead of dropping them.
    pub run_blocked_service_start_later: bool,
    pub process_termination_timeout_secs: u64,
    pub java_command: String,
    pub temp_services_dir: PathBuf,
    pub persistent_services_dir: PathBuf,
    pub inclusion_cache_dir: PathBuf,
    pub template_dir: PathBuf,
    /// redb file for tasks, groups and node records. `None` keeps them in memory.
    pub state_path: Option<PathBuf>,
    /// Bound on synchronous cross-node start requests.
    pub start_timeout_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub log_cache_lines: usize,
    pub launcher: LauncherConfig,
    pub ssl: SslConfig,
    pub environments: BTreeMap<String, EnvironmentSettings>,
    pub api: ApiConfig,
}

/// Location of the bootstrap launcher that wraps every JVM service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LauncherConfig {
    pub jar: PathBuf,
    pub main_class: String,
    /// Text manifest listing `include <repo> <group> <name> <version> <file-version> [classifier]`.
    pub dependency_manifest: PathBuf,
    pub libs_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub trust_certificate: Option<PathBuf>,
}

/// Per-environment process settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentSettings {
    pub default_process_arguments: Vec<String>,
    /// Substrings identifying the application artifact in a service directory.
    pub application_names: Vec<String>,
    /// Console commands sent before the process is killed.
    pub shutdown_commands: Vec<String>,
    pub properties_rewrite: Option<PropertiesRewrite>,
}

/// Host/port keys rewritten inside a `key=value` file before start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropertiesRewrite {
    pub file: String,
    pub host_key: Option<String>,
    pub port_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let mut environments = BTreeMap::new();
        environments.insert(
            "MINECRAFT_SERVER".to_string(),
            EnvironmentSettings {
                default_process_arguments: vec!["nogui".to_string()],
                application_names: vec!["paper".to_string(), "spigot".to_string()],
                properties_rewrite: Some(PropertiesRewrite {
                    file: "server.properties".to_string(),
                    host_key: Some("server-ip".to_string()),
                    port_key: "server-port".to_string(),
                }),
                ..EnvironmentSettings::default()
            },
        );
        environments.insert(
            "MINECRAFT_PROXY".to_string(),
            EnvironmentSettings {
                application_names: vec!["velocity".to_string(), "bungee".to_string()],
                ..EnvironmentSettings::default()
            },
        );

        Self {
            node_id: "node-1".to_string(),
            listeners: vec![HostAndPort::new("0.0.0.0", 1410)],
            max_memory_mb: 2048,
            max_cpu_usage_to_start_services: 90.0,
            run_blocked_service_start_later: true,
            process_termination_timeout_secs: 10,
            java_command: "java".to_string(),
            temp_services_dir: PathBuf::from("temp/services"),
            persistent_services_dir: PathBuf::from("local/services"),
            inclusion_cache_dir: PathBuf::from("temp/caches/inclusions"),
            template_dir: PathBuf::from("local/templates"),
            state_path: None,
            start_timeout_secs: 20,
            heartbeat_timeout_secs: 30,
            log_cache_lines: 128,
            launcher: LauncherConfig::default(),
            ssl: SslConfig::default(),
            environments,
            api: ApiConfig::default(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            jar: PathBuf::from("launcher/wrapper.jar"),
            main_class: "servgrid.wrapper.Main".to_string(),
            dependency_manifest: PathBuf::from("launcher/wrapper.cnl"),
            libs_dir: PathBuf::from("launcher/libs"),
        }
    }
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            default_process_arguments: Vec::new(),
            application_names: Vec::new(),
            shutdown_commands: vec!["end".to_string(), "stop".to_string()],
            properties_rewrite: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 2812,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_name(&self.node_id) {
            anyhow::bail!("invalid node id '{}'", self.node_id);
        }
        if self.listeners.is_empty() {
            anyhow::bail!("node '{}' has no listeners", self.node_id);
        }
        if self.max_memory_mb == 0 {
            anyhow::bail!("max_memory_mb must be greater than zero");
        }
        Ok(())
    }

    /// Settings for `environment`, falling back to defaults for unknown names.
    pub fn environment(&self, environment: &str) -> EnvironmentSettings {
        self.environments
            .get(environment)
            .cloned()
            .unwrap_or_default()
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn process_termination_timeout(&self) -> Duration {
        Duration::from_secs(self.process_termination_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
node_id = "node-2"
max_memory_mb = 8192

[[listeners]]
host = "10.0.0.2"
port = 1410
"#;
        let config: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node_id, "node-2");
        assert_eq!(config.max_memory_mb, 8192);
        assert_eq!(config.start_timeout_secs, 20);
        assert_eq!(config.listeners[0].port, 1410);
        assert!(config.environments.contains_key("MINECRAFT_SERVER"));
        config.validate().unwrap();
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        let config = NodeConfig::default();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = NodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_rejects_invalid_node_id() {
        let config = NodeConfig {
            node_id: "node 1".to_string(),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_environment_uses_defaults() {
        let config = NodeConfig::default();
        let env = config.environment("GLOWSTONE");
        assert_eq!(env.shutdown_commands, vec!["end", "stop"]);
        assert!(env.default_process_arguments.is_empty());
    }
}
