//! Locating the worker entry script and the runtime that executes it.

use crate::config::SidecarConfig;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

#[cfg(windows)]
const RUNTIME_BINARY: &str = "node.exe";
#[cfg(not(windows))]
const RUNTIME_BINARY: &str = "node";

pub fn runtime_binary_name() -> &'static str {
    RUNTIME_BINARY
}

/// Bundled `<resource_dir>/sidecar/<script>` first, then each source checkout.
pub fn resolve_script(config: &SidecarConfig) -> Option<PathBuf> {
    let bundled = config
        .resource_dir
        .as_ref()
        .map(|dir| dir.join("sidecar").join(&config.script_name));
    bundled
        .into_iter()
        .chain(config.source_dirs.iter().map(|dir| dir.join(&config.script_name)))
        .find(|candidate| candidate.is_file())
}

/// Install locations checked after the override and the bundle.
pub fn default_known_runtime_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    #[cfg(not(windows))]
    {
        paths.push(PathBuf::from("/opt/homebrew/bin").join(RUNTIME_BINARY));
        paths.push(PathBuf::from("/usr/local/bin").join(RUNTIME_BINARY));
        paths.push(PathBuf::from("/usr/bin").join(RUNTIME_BINARY));
    }
    #[cfg(windows)]
    {
        paths.push(PathBuf::from(r"C:\Program Files\nodejs").join(RUNTIME_BINARY));
    }
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".volta").join("bin").join(RUNTIME_BINARY));
        paths.push(home.join(".local").join("bin").join(RUNTIME_BINARY));
    }
    paths
}

/// Override → bundled runtime → known install locations → `PATH`.
pub fn resolve_runtime(
    config: &SidecarConfig,
    known_paths: &[PathBuf],
    path_var: Option<&OsStr>,
) -> Option<PathBuf> {
    if let Some(path) = config.runtime_override.as_ref() {
        if path.is_file() {
            return Some(path.clone());
        }
        tracing::warn!(
            "Runtime override {} does not exist; falling back to discovery",
            path.display()
        );
    }

    if let Some(dir) = config.resource_dir.as_ref() {
        let bundled = dir.join("runtime").join(RUNTIME_BINARY);
        if bundled.is_file() {
            return Some(bundled);
        }
    }

    if let Some(found) = known_paths.iter().find(|p| p.is_file()) {
        return Some(found.clone());
    }

    path_var.and_then(|paths| find_in_path(RUNTIME_BINARY, paths))
}

fn find_in_path(binary: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_runnable(candidate))
}

#[cfg(unix)]
fn is_runnable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_runnable(path: &Path) -> bool {
    path.is_file()
}
