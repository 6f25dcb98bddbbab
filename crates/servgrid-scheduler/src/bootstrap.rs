//! Descriptor the launched process reads to connect back to its node.

use std::io;
use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use servgrid_core::HostAndPort;
use servgrid_core::config::SslConfig;
use servgrid_state::{ServiceConfiguration, ServiceInfoSnapshot};

/// Directory inside every service holding launcher-owned files.
pub const WRAPPER_DIR: &str = ".wrapper";
pub const DESCRIPTOR_FILE: &str = "wrapper.json";

/// SSL material copied into [`WRAPPER_DIR`], as paths relative to the
/// service directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SslMaterial {
    pub certificate: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub trust_certificate: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapDescriptor {
    pub target_listener: HostAndPort,
    pub connection_key: String,
    pub service_info_snapshot: ServiceInfoSnapshot,
    pub service_configuration: ServiceConfiguration,
    pub ssl_configuration: Option<SslMaterial>,
}

impl BootstrapDescriptor {
    pub fn path(service_dir: &Path) -> PathBuf {
        service_dir.join(WRAPPER_DIR).join(DESCRIPTOR_FILE)
    }

    pub fn write_to(&self, service_dir: &Path) -> io::Result<PathBuf> {
        let path = Self::path(service_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn read_from(service_dir: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(Self::path(service_dir))?;
        serde_json::from_slice(&bytes).map_err(io::Error::other)
    }
}

/// Random node listener, rewritten to an address a local process can dial.
pub fn select_connect_listener(listeners: &[HostAndPort]) -> Option<HostAndPort> {
    listeners
        .choose(&mut rand::thread_rng())
        .map(HostAndPort::to_connectable)
}

/// Copy configured SSL files into the service's [`WRAPPER_DIR`] under fixed
/// names. Missing source files are skipped.
pub fn copy_ssl_material(ssl: &SslConfig, service_dir: &Path) -> io::Result<Option<SslMaterial>> {
    if !ssl.enabled {
        return Ok(None);
    }
    let wrapper = service_dir.join(WRAPPER_DIR);
    std::fs::create_dir_all(&wrapper)?;

    let copy = |source: &Option<PathBuf>, name: &str| -> io::Result<Option<PathBuf>> {
        match source {
            Some(source) if source.exists() => {
                std::fs::copy(source, wrapper.join(name))?;
                Ok(Some(Path::new(WRAPPER_DIR).join(name)))
            }
            _ => Ok(None),
        }
    };

    Ok(Some(SslMaterial {
        certificate: copy(&ssl.certificate, "certificate")?,
        private_key: copy(&ssl.private_key, "privateKey")?,
        trust_certificate: copy(&ssl.trust_certificate, "trustCertificate")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use servgrid_state::ServiceLifecycle;

    #[test]
    fn wildcard_listeners_become_loopback() {
        let listener = select_connect_listener(&[HostAndPort::new("0.0.0.0", 1410)]).unwrap();
        assert_eq!(listener, HostAndPort::new("127.0.0.1", 1410));
        assert!(select_connect_listener(&[]).is_none());
    }

    #[test]
    fn descriptor_is_readable_by_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = ServiceConfiguration::builder("Lobby", "MINECRAFT_SERVER")
            .build()
            .unwrap();
        let descriptor = BootstrapDescriptor {
            target_listener: HostAndPort::new("127.0.0.1", 1410),
            connection_key: "k".repeat(64),
            service_info_snapshot: ServiceInfoSnapshot {
                creation_time: 1,
                address: HostAndPort::new("127.0.0.1", 44955),
                connected_time: -1,
                lifecycle: ServiceLifecycle::Prepared,
                process: Default::default(),
                configuration: configuration.clone(),
                properties: Default::default(),
            },
            service_configuration: configuration,
            ssl_configuration: None,
        };

        let path = descriptor.write_to(dir.path()).unwrap();
        assert!(path.ends_with(".wrapper/wrapper.json"));
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw.get("connectionKey").is_some());
        assert_eq!(BootstrapDescriptor::read_from(dir.path()).unwrap(), descriptor);
    }

    #[test]
    fn ssl_files_land_in_wrapper_dir() {
        let source = tempfile::tempdir().unwrap();
        let cert = source.path().join("node.pem");
        std::fs::write(&cert, "cert").unwrap();
        let service = tempfile::tempdir().unwrap();

        let ssl = SslConfig {
            enabled: true,
            certificate: Some(cert),
            ..SslConfig::default()
        };
        let material = copy_ssl_material(&ssl, service.path()).unwrap().unwrap();
        assert_eq!(material.certificate, Some(PathBuf::from(".wrapper/certificate")));
        assert!(material.private_key.is_none());
        assert!(service.path().join(".wrapper/certificate").exists());

        assert!(copy_ssl_material(&SslConfig::default(), service.path()).unwrap().is_none());
    }
}
