//! Launch argument assembly for JVM services.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use servgrid_core::config::LauncherConfig;

use crate::error::{RuntimeError, RuntimeResult};
use crate::traits::LaunchRequest;

/// System properties every JVM service starts with.
pub const DEFAULT_SYSTEM_PROPERTIES: [&str; 5] = [
    "-Dfile.encoding=UTF-8",
    "-Dclient.encoding.override=UTF-8",
    "-DIReallyKnowWhatIAmDoingISwear=true",
    "-Djline.terminal=jline.UnsupportedTerminal",
    "-Dlog4j2.formatMsgNoLookups=true",
];

/// Jar paths listed by a dependency manifest.
///
/// Each `include <repo> <group> <name> <version> <file-version> [classifier]`
/// line maps to `libs/<group as path>/<name>/<version>/<name>-<file-version>[-classifier].jar`.
/// Other lines are ignored.
pub fn parse_dependency_manifest(content: &str, libs_dir: &Path) -> Vec<PathBuf> {
    content
        .lines()
        .filter(|line| line.starts_with("include "))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() != 6 && parts.len() != 7 {
                return None;
            }
            let (group, name, version, file_version) = (parts[2], parts[3], parts[4], parts[5]);
            let file = match parts.get(6) {
                Some(classifier) => format!("{name}-{file_version}-{classifier}.jar"),
                None => format!("{name}-{file_version}.jar"),
            };
            let mut path = libs_dir.to_path_buf();
            path.extend(group.split('.'));
            path.push(name);
            path.push(version);
            path.push(file);
            Some(path)
        })
        .collect()
}

/// Read the launcher's dependency manifest. A missing manifest yields no
/// extra dependencies.
pub fn read_dependency_classpath(launcher: &LauncherConfig) -> RuntimeResult<Vec<PathBuf>> {
    if !launcher.dependency_manifest.exists() {
        warn!(manifest = ?launcher.dependency_manifest, "dependency manifest missing");
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&launcher.dependency_manifest)?;
    Ok(parse_dependency_manifest(&content, &launcher.libs_dir))
}

const MANIFEST_ENTRY: &str = "META-INF/MANIFEST.MF";

/// Entry points an application jar declares in its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationManifest {
    pub main_class: String,
    /// `Premain-Class`, or the older `Launcher-Agent-Class`.
    pub agent_class: Option<String>,
}

/// Main section attributes of a jar manifest.
///
/// Lines starting with a single space continue the previous value; the
/// first blank line ends the main section.
pub fn parse_manifest_attributes(content: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut current: Option<(String, String)> = None;
    for line in content.lines() {
        if line.is_empty() {
            break;
        }
        if let Some(rest) = line.strip_prefix(' ') {
            if let Some((_, value)) = current.as_mut() {
                value.push_str(rest);
            }
            continue;
        }
        if let Some((key, value)) = current.take() {
            attributes.insert(key, value);
        }
        current = line
            .split_once(':')
            .map(|(key, value)| (key.trim().to_string(), value.trim_start().to_string()));
    }
    if let Some((key, value)) = current {
        attributes.insert(key, value);
    }
    attributes
}

/// Read the entry points out of `jar`'s manifest.
pub fn read_application_manifest(jar: &Path) -> RuntimeResult<ApplicationManifest> {
    let invalid = |reason: String| RuntimeError::InvalidApplication {
        path: jar.to_path_buf(),
        reason,
    };

    let mut archive = zip::ZipArchive::new(File::open(jar)?).map_err(|e| invalid(e.to_string()))?;
    let mut entry = archive
        .by_name(MANIFEST_ENTRY)
        .map_err(|e| invalid(format!("{MANIFEST_ENTRY}: {e}")))?;
    let mut content = String::new();
    entry.read_to_string(&mut content)?;

    let mut attributes = parse_manifest_attributes(&content);
    let main_class = attributes
        .remove("Main-Class")
        .ok_or_else(|| invalid("manifest has no Main-Class".to_string()))?;
    let agent_class = attributes
        .remove("Premain-Class")
        .or_else(|| attributes.remove("Launcher-Agent-Class"));
    Ok(ApplicationManifest { main_class, agent_class })
}

fn leading_number(name: &str) -> Option<u64> {
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Ascending by leading number; names without one are not ordered.
fn compare_versions(a: &str, b: &str) -> Ordering {
    match (leading_number(a), leading_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => Ordering::Equal,
    }
}

/// Best application jar directly inside `dir`.
///
/// A jar qualifies when its lowercase file name contains one of `names`,
/// the lowercase `environment`, or `application`.
pub fn find_application_artifact(
    dir: &Path,
    environment: &str,
    names: &[String],
) -> Option<PathBuf> {
    let mut needles: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
    needles.push(environment.to_lowercase());
    needles.push("application".to_string());

    let mut jars: Vec<(String, PathBuf)> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let file_name = e.file_name().to_string_lossy().to_lowercase();
            let matches = file_name.ends_with(".jar")
                && needles.iter().any(|needle| file_name.contains(needle.as_str()));
            matches.then(|| (file_name, e.into_path()))
        })
        .collect();

    jars.sort_by(|a, b| a.0.cmp(&b.0));
    jars.into_iter()
        .min_by(|a, b| compare_versions(&a.0, &b.0))
        .map(|(_, path)| path)
}

/// Full command line (executable first) for a JVM service.
///
/// After the launcher's main class come the application's main class, its
/// agent class (`null` when absent) and the application jar; the launcher
/// consumes these three before handing control to the application.
pub fn build_jvm_arguments(
    request: &LaunchRequest,
    launcher: &LauncherConfig,
    dependencies: &[PathBuf],
    application: &Path,
    manifest: &ApplicationManifest,
) -> Vec<String> {
    let process = &request.configuration.process;
    let heap = process.max_heap_memory_mb;

    let mut classpath: Vec<PathBuf> = Vec::with_capacity(dependencies.len() + 2);
    classpath.push(launcher.jar.clone());
    classpath.extend(dependencies.iter().cloned());
    classpath.push(application.to_path_buf());
    let classpath = std::env::join_paths(&classpath)
        .map(|joined| joined.to_string_lossy().into_owned())
        .unwrap_or_else(|_| {
            classpath
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(":")
        });

    let mut args = vec![request.java_command.clone()];
    args.extend(process.jvm_options.iter().cloned());
    args.push(format!("-Xmx{heap}M"));
    args.push(format!("-Xms{heap}M"));
    args.extend(DEFAULT_SYSTEM_PROPERTIES.iter().map(|p| p.to_string()));
    args.push(format!("-javaagent:{}", launcher.jar.display()));
    args.push("-cp".to_string());
    args.push(classpath);
    args.push(launcher.main_class.clone());
    args.push(manifest.main_class.clone());
    args.push(manifest.agent_class.clone().unwrap_or_else(|| "null".to_string()));
    args.push(application.display().to_string());
    args.extend(request.environment.default_process_arguments.iter().cloned());
    args.extend(process.process_parameters.iter().cloned());
    args
}
