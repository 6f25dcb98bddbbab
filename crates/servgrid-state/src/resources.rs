//! Provisioning resources: templates, remote inclusions and deployments.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Storage name used when a template does not name one.
pub const LOCAL_STORAGE: &str = "local";

/// A directory in a template storage copied into a service directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceTemplate {
    pub prefix: String,
    pub name: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    /// Lower priorities copy first, so higher ones overwrite their files.
    #[serde(default)]
    pub priority: i32,
    /// Copy on every start, even into an already provisioned static service.
    #[serde(default)]
    pub always_copy_to_static_services: bool,
}

fn default_storage() -> String {
    LOCAL_STORAGE.to_string()
}

impl ServiceTemplate {
    pub fn new(prefix: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            storage: default_storage(),
            priority: 0,
            always_copy_to_static_services: false,
        }
    }

    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn always_copied(mut self) -> Self {
        self.always_copy_to_static_services = true;
        self
    }

    /// `prefix/name`, the path of the template inside its storage.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.prefix, self.name)
    }
}

impl fmt::Display for ServiceTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.storage, self.prefix, self.name)
    }
}

impl PartialOrd for ServiceTemplate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceTemplate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.storage.cmp(&other.storage))
            .then_with(|| self.prefix.cmp(&other.prefix))
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// A file fetched over HTTP and copied into a service directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceRemoteInclusion {
    pub url: String,
    /// Path relative to the service directory.
    pub destination: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ServiceRemoteInclusion {
    pub fn new(url: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for ServiceRemoteInclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.url, self.destination)
    }
}

/// Pushes a service directory back into a template.
///
/// Paths are matched relative to the service directory, directories with a
/// trailing `/`. Any exclude match drops the path; an empty include list
/// accepts everything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceDeployment {
    pub template: ServiceTemplate,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub includes: Vec<String>,
}

impl ServiceDeployment {
    pub fn new(template: ServiceTemplate) -> Self {
        Self {
            template,
            excludes: Vec::new(),
            includes: Vec::new(),
        }
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }
}
