//! Locating a Chrome/Chromium executable for the bridge to drive.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Env vars that name a browser executable outright, in priority order.
pub const EXECUTABLE_ENV_VARS: [&str; 3] =
    ["CHROME_PATH", "PUPPETEER_EXECUTABLE_PATH", "GOOGLE_CHROME_BIN"];

const CACHE_DIR_ENV: &str = "PUPPETEER_CACHE_DIR";

const SYSTEM_PATHS: &[&str] = &[
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

const PATH_BINARIES: &[&str] = &["google-chrome", "chromium", "chromium-browser"];

/// Source of browser executables to try when starting a connection.
pub trait ExecutableResolver: Send + Sync {
    /// Existing executables, best candidate first.
    fn candidates(&self) -> Vec<PathBuf>;

    /// Everything that was looked at, for troubleshooting.
    fn diagnostics(&self) -> ResolverDiagnostics;
}

#[derive(Clone, Debug, Default)]
pub struct ResolverSettings {
    /// Configured executable, tried before anything else.
    pub executable: Option<PathBuf>,
    pub extra_paths: Vec<PathBuf>,
    /// Browser download cache. Falls back to `$PUPPETEER_CACHE_DIR`, then
    /// `~/.cache/puppeteer`.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckedPath {
    pub path: PathBuf,
    /// Which strategy produced this path (`config`, `env:CHROME_PATH`, `cache`, ...)
    pub source: String,
    pub exists: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolverDiagnostics {
    pub env: Vec<EnvEntry>,
    pub cache_dir: Option<PathBuf>,
    pub checked: Vec<CheckedPath>,
    pub candidates: Vec<PathBuf>,
    pub selected: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: Option<String>,
}

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolver probing config, environment, well-known install locations, the
/// puppeteer download cache and `PATH`, in that order.
#[derive(Clone)]
pub struct EnvExecutableResolver {
    settings: ResolverSettings,
    env: EnvLookup,
    search_path: bool,
}

impl EnvExecutableResolver {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            settings,
            env: Arc::new(|name: &str| std::env::var(name).ok()),
            search_path: true,
        }
    }

    /// Resolver reading variables from `env` instead of the process
    /// environment. System locations and `PATH` are skipped.
    pub fn with_env<F>(settings: ResolverSettings, env: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            settings,
            env: Arc::new(env),
            search_path: false,
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        (self.env)(name).filter(|v| !v.trim().is_empty())
    }

    fn cache_dir(&self) -> Option<PathBuf> {
        self.settings
            .cache_dir
            .clone()
            .or_else(|| self.var(CACHE_DIR_ENV).map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|home| home.join(".cache").join("puppeteer")))
    }

    fn search(&self) -> Vec<CheckedPath> {
        let mut found: Vec<(PathBuf, String)> = Vec::new();

        if let Some(path) = &self.settings.executable {
            found.push((path.clone(), "config".to_string()));
        }
        for name in EXECUTABLE_ENV_VARS {
            if let Some(value) = self.var(name) {
                found.push((PathBuf::from(value), format!("env:{}", name)));
            }
        }
        for path in &self.settings.extra_paths {
            found.push((path.clone(), "extra".to_string()));
        }
        if self.search_path {
            for path in SYSTEM_PATHS {
                found.push((PathBuf::from(path), "system".to_string()));
            }
        }
        if let Some(dir) = self.cache_dir() {
            for path in scan_cache(&dir) {
                found.push((path, "cache".to_string()));
            }
        }
        if self.search_path {
            for name in PATH_BINARIES {
                if let Ok(path) = which::which(name) {
                    found.push((path, "path".to_string()));
                }
            }
        }

        found
            .into_iter()
            .map(|(path, source)| CheckedPath {
                exists: path.is_file(),
                path,
                source,
            })
            .collect()
    }
}

impl ExecutableResolver for EnvExecutableResolver {
    fn candidates(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let candidates: Vec<PathBuf> = self
            .search()
            .into_iter()
            .filter(|p| p.exists)
            .map(|p| p.path)
            .filter(|path| seen.insert(path.clone()))
            .collect();
        debug!(count = candidates.len(), "Resolved browser executable candidates");
        candidates
    }

    fn diagnostics(&self) -> ResolverDiagnostics {
        let env = EXECUTABLE_ENV_VARS
            .iter()
            .chain(std::iter::once(&CACHE_DIR_ENV))
            .map(|name: &&str| EnvEntry {
                name: name.to_string(),
                value: (self.env)(*name),
            })
            .collect();
        let candidates = self.candidates();
        ResolverDiagnostics {
            env,
            cache_dir: self.cache_dir(),
            checked: self.search(),
            selected: candidates.first().cloned(),
            candidates,
        }
    }
}

/// Chrome-for-testing builds under `<cache>/chrome/<version>/chrome-linux64/chrome`,
/// newest version first.
fn scan_cache(cache_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(cache_dir.join("chrome")) else {
        return Vec::new();
    };
    let mut versions: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    versions.sort_by_cached_key(|dir| {
        let name = dir.file_name().map(|n| n.to_string_lossy().into_owned());
        Reverse((name.as_deref().and_then(build_version), name))
    });
    versions
        .into_iter()
        .map(|dir| dir.join("chrome-linux64").join("chrome"))
        .filter(|path| path.is_file())
        .collect()
}

/// Numeric components of a cache entry such as `linux-121.0.6167.85`.
/// Entries without a parseable version sort after every versioned one.
fn build_version(dir_name: &str) -> Option<Vec<u64>> {
    let (_, version) = dir_name.rsplit_once('-')?;
    version.split('.').map(|part| part.parse().ok()).collect()
}
