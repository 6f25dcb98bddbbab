//! Template storages and deployment filtering.
//!
//! A storage resolves `prefix/name` templates to directory trees. The node
//! ships with [`LocalTemplateStorage`]; more can be registered by name.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use servgrid_state::{LOCAL_STORAGE, ServiceDeployment, ServiceTemplate};

/// Copies templates into service directories and back.
pub trait TemplateStorage: Send + Sync {
    fn name(&self) -> &str;

    fn has(&self, template: &ServiceTemplate) -> bool;

    /// Copy the template's content into `destination`. A missing template
    /// copies nothing.
    fn pull(&self, template: &ServiceTemplate, destination: &Path) -> io::Result<()>;

    /// Copy every file of `source` accepted by `filter` into the template.
    /// The filter sees `/`-separated relative paths; directories end in `/`.
    fn deploy_directory(
        &self,
        template: &ServiceTemplate,
        source: &Path,
        filter: &dyn Fn(&str) -> bool,
    ) -> io::Result<()>;
}

/// Templates stored under a directory on this node.
pub struct LocalTemplateStorage {
    root: PathBuf,
}

impl LocalTemplateStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn template_dir(&self, template: &ServiceTemplate) -> PathBuf {
        self.root.join(&template.prefix).join(&template.name)
    }
}

impl TemplateStorage for LocalTemplateStorage {
    fn name(&self) -> &str {
        LOCAL_STORAGE
    }

    fn has(&self, template: &ServiceTemplate) -> bool {
        self.template_dir(template).is_dir()
    }

    fn pull(&self, template: &ServiceTemplate, destination: &Path) -> io::Result<()> {
        let source = self.template_dir(template);
        if !source.is_dir() {
            debug!(%template, "template does not exist, nothing to copy");
            return Ok(());
        }
        copy_tree(&source, destination, &|_| true)
    }

    fn deploy_directory(
        &self,
        template: &ServiceTemplate,
        source: &Path,
        filter: &dyn Fn(&str) -> bool,
    ) -> io::Result<()> {
        copy_tree(source, &self.template_dir(template), filter)
    }
}

fn relative_key(relative: &Path, is_dir: bool) -> String {
    let mut key = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if is_dir {
        key.push('/');
    }
    key
}

/// Recursive copy honoring `filter`. A rejected directory skips its subtree.
pub fn copy_tree(source: &Path, destination: &Path, filter: &dyn Fn(&str) -> bool) -> io::Result<()> {
    std::fs::create_dir_all(destination)?;
    let mut walker = WalkDir::new(source).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry.path().strip_prefix(source).map_err(io::Error::other)?;
        let is_dir = entry.file_type().is_dir();
        if !filter(&relative_key(relative, is_dir)) {
            if is_dir {
                walker.skip_current_dir();
            }
            continue;
        }
        let target = destination.join(relative);
        if is_dir {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Run a filesystem job on the blocking pool.
pub(crate) async fn blocking<T, F>(job: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)))
}

/// Resolve `relative` under `base` without escaping it.
pub fn child_path(base: &Path, relative: &str) -> Option<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    let mut path = base.to_path_buf();
    path.extend(parts);
    Some(path)
}

// ── Deployment filter ──────────────────────────────────────────────

/// Include/exclude patterns of one deployment, matched against whole
/// relative paths.
pub struct DeploymentFilter {
    excludes: Vec<Regex>,
    includes: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(&format!("^(?:{p})$")) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring invalid deployment pattern");
                None
            }
        })
        .collect()
}

impl DeploymentFilter {
    pub fn new(deployment: &ServiceDeployment) -> Self {
        Self {
            excludes: compile(&deployment.excludes),
            includes: compile(&deployment.includes),
        }
    }

    /// Excludes win; an empty include list accepts everything else.
    pub fn accepts(&self, path: &str) -> bool {
        if self.excludes.iter().any(|r| r.is_match(path)) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|r| r.is_match(path))
    }
}

// ── Registry ───────────────────────────────────────────────────────

/// Storages by name.
#[derive(Default, Clone)]
pub struct TemplateStorageRegistry {
    storages: HashMap<String, Arc<dyn TemplateStorage>>,
}

impl TemplateStorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, storage: Arc<dyn TemplateStorage>) {
        self.storages.insert(storage.name().to_string(), storage);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TemplateStorage>> {
        self.storages.get(name).cloned()
    }
}
