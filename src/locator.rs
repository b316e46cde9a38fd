use crate::env::Environment;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Suffixes probed, in order, for every directory on the search path.
#[cfg(windows)]
const EXECUTABLE_SUFFIXES: &[&str] = &[".exe", ".cmd", ".bat", ".com", ".ps1", ""];
#[cfg(not(windows))]
const EXECUTABLE_SUFFIXES: &[&str] = &[""];

/// Finds the file a bare command name refers to.
///
/// Lookups of bare names are memoized for the lifetime of the locator,
/// misses included. The cache is never invalidated: a `PATH` change or a
/// newly installed tool during a session is not seen until restart.
#[derive(Debug, Clone)]
pub struct Locator {
    dirs: Vec<PathBuf>,
    fallbacks: Vec<(String, Vec<PathBuf>)>,
    cache: HashMap<String, Option<PathBuf>>,
}

impl Locator {
    /// Builds a locator from `PATH` in `env`, with the platform's critical
    /// system directories moved to the front when missing from it.
    pub fn from_env(env: &Environment) -> Self {
        let search_path = env.get_var("PATH").unwrap_or_default();
        let mut dirs = split_search_path(OsStr::new(&search_path));

        let critical: Vec<PathBuf> = critical_dirs(env)
            .into_iter()
            .filter(|d| d.is_dir() && !dirs.contains(d))
            .collect();
        dirs.splice(0..0, critical);

        for extra in trailing_dirs(env) {
            if extra.is_dir() && !dirs.contains(&extra) {
                dirs.push(extra);
            }
        }

        Self {
            dirs,
            fallbacks: well_known_fallbacks(env),
            cache: HashMap::new(),
        }
    }

    /// Builds a locator that searches exactly `dirs`, with no fallbacks.
    pub fn with_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            dirs,
            fallbacks: Vec::new(),
            cache: HashMap::new(),
        }
    }

    /// Adds fallback locations tried for `name` after the search path.
    pub fn with_fallback(mut self, name: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        self.fallbacks.push((name.into(), paths));
        self
    }

    /// Directories searched, in priority order.
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Resolves `name` to a runnable file.
    ///
    /// Behavior:
    /// - A name containing a path separator is taken as a path and accepted if
    ///   it is a runnable file. Such names are not cached since they depend on
    ///   the working directory.
    /// - A bare name is probed in each search directory with each executable
    ///   suffix, then in the hard-coded fallback locations. The answer is cached.
    pub fn locate(&mut self, name: &str) -> Option<PathBuf> {
        if name.is_empty() {
            return None;
        }

        let path = Path::new(name);
        if path.components().count() > 1 || path.is_absolute() {
            return find_by_path(path).map(Path::to_path_buf);
        }

        if let Some(hit) = self.cache.get(name) {
            tracing::debug!(name, found = ?hit, "locator cache hit");
            return hit.clone();
        }

        let found = find_in_dirs(&self.dirs, name).or_else(|| self.find_fallback(name));
        tracing::debug!(name, found = ?found, "locator scan");
        self.cache.insert(name.to_string(), found.clone());
        found
    }

    fn find_fallback(&self, name: &str) -> Option<PathBuf> {
        self.fallbacks
            .iter()
            .filter(|(tool, _)| tool.eq_ignore_ascii_case(name))
            .flat_map(|(_, paths)| paths.iter())
            .find_map(|p| find_by_path(p).map(Path::to_path_buf))
    }
}

fn split_search_path(search_path: &OsStr) -> Vec<PathBuf> {
    std::env::split_paths(search_path)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

fn find_in_dirs(dirs: &[PathBuf], cmd: &str) -> Option<PathBuf> {
    for dir in dirs {
        if !dir.is_dir() {
            continue;
        }
        for suffix in EXECUTABLE_SUFFIXES {
            let path = dir.join(format!("{cmd}{suffix}"));
            if let Some(path) = find_by_path(&path) {
                return Some(path.to_owned());
            }
        }
    }
    None
}

fn find_by_path(path: &Path) -> Option<&Path> {
    if path.is_file() && is_executable(path) {
        Some(path)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

#[cfg(windows)]
fn critical_dirs(env: &Environment) -> Vec<PathBuf> {
    let root = PathBuf::from(
        env.get_var("SystemRoot")
            .unwrap_or_else(|| "C:\\Windows".to_string()),
    );
    vec![
        root.join("System32"),
        root.join("System32").join("WindowsPowerShell").join("v1.0"),
        root.join("System32").join("Wbem"),
    ]
}

#[cfg(not(windows))]
fn critical_dirs(_env: &Environment) -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/bin"), PathBuf::from("/bin")]
}

#[cfg(windows)]
fn trailing_dirs(env: &Environment) -> Vec<PathBuf> {
    ["ProgramFiles", "ProgramFiles(x86)"]
        .iter()
        .filter_map(|var| env.get_var(var))
        .map(|base| PathBuf::from(base).join("nodejs"))
        .collect()
}

#[cfg(not(windows))]
fn trailing_dirs(_env: &Environment) -> Vec<PathBuf> {
    Vec::new()
}

#[cfg(windows)]
fn well_known_fallbacks(env: &Environment) -> Vec<(String, Vec<PathBuf>)> {
    let mut npm = Vec::new();
    if let Some(appdata) = env.get_var("APPDATA") {
        let dir = PathBuf::from(appdata).join("npm");
        npm.push(dir.join("npm.cmd"));
        npm.push(dir.join("npm"));
    }
    let program_files = ["ProgramFiles", "ProgramFiles(x86)"]
        .iter()
        .filter_map(|var| env.get_var(var))
        .chain(["C:\\Program Files".to_string(), "C:\\Program Files (x86)".to_string()]);
    for base in program_files {
        let dir = PathBuf::from(base).join("nodejs");
        npm.push(dir.join("npm.cmd"));
        npm.push(dir.join("npm"));
    }
    vec![("npm".to_string(), npm)]
}

#[cfg(not(windows))]
fn well_known_fallbacks(_env: &Environment) -> Vec<(String, Vec<PathBuf>)> {
    vec![(
        "npm".to_string(),
        vec![
            PathBuf::from("/usr/local/bin/npm"),
            PathBuf::from("/opt/homebrew/bin/npm"),
        ],
    )]
}
