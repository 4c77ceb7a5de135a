//! Engine configuration and filesystem conventions.
//!
//! `config.toml` in the config dir tunes the daemon; everything has a
//! default so a missing file is fine. The same module owns the path layout
//! (sockets, PID file, rule layers) and the environment allow-list that
//! bounds what callers may forward.

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the config directory; documented for tests and scripting.
pub const CONFIG_DIR_ENV: &str = "SHELLGATE_CONFIG_DIR";

/// Marker variable that identifies AI-agent callers (set by Claude Code).
pub const AI_MARKER_ENV: &str = "CLAUDECODE";

/// Environment variables a caller may forward to the engine. Everything
/// else is dropped when building a [`crate::models::CommandContext`], both
/// to bound request size and to keep secrets out of the event stream.
pub const ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "PWD",
    "EDITOR",
    "VISUAL",
    "TMPDIR",
    "CI",
    AI_MARKER_ENV,
];

/// Keep only allow-listed variables.
pub fn filter_environment(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(k, _)| ENV_ALLOWLIST.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Tunable engine settings, from `<config_dir>/config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Seconds a pending approval waits before resolving as timeout.
    pub approval_timeout_secs: u64,
    /// Delegate shell invoked as `<shell> -c <command>`.
    pub shell: String,
    /// Soft cap on simultaneous client connections.
    pub max_connections: usize,
    /// Seconds a git branch/repo lookup stays cached.
    pub git_cache_ttl_secs: u64,
    /// Commands the shim installer symlinks by default.
    pub shim_commands: Vec<String>,
    /// Builtins the shell-integration snippet wraps.
    pub wrapped_builtins: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 300,
            shell: default_shell(),
            max_connections: 256,
            git_cache_ttl_secs: 10,
            shim_commands: ["rm", "git", "dd", "mkfs", "shred", "chmod", "chown", "kubectl"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            wrapped_builtins: vec!["eval".to_string(), "source".to_string()],
        }
    }
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl EngineConfig {
    /// Load from the conventional location, falling back to defaults when
    /// the file is absent. A present-but-broken file is an error; silently
    /// downgrading configuration is worse than refusing to start.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn git_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.git_cache_ttl_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The shellgate config directory, honoring the test override.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("shellgate")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Everything shellgate keeps on disk, rooted at one directory. Constructed
/// once and passed around so tests can point an engine at a scratch dir.
#[derive(Debug, Clone)]
pub struct Paths {
    pub dir: PathBuf,
}

impl Paths {
    /// The conventional per-user location (or the env override).
    pub fn resolve() -> Self {
        Self { dir: config_dir() }
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    /// The user's global rule layer.
    pub fn global_rules(&self) -> PathBuf {
        self.dir.join("rules.yaml")
    }

    /// Client endpoint socket.
    pub fn engine_socket(&self) -> PathBuf {
        self.dir.join("engine.sock")
    }

    /// Observer endpoint socket.
    pub fn observer_socket(&self) -> PathBuf {
        self.dir.join("observer.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("engine.pid")
    }

    /// Directory holding the generated shim script and its symlinks.
    pub fn shim_dir(&self) -> PathBuf {
        self.dir.join("shim")
    }

    pub fn shim_script(&self) -> PathBuf {
        self.shim_dir().join("shellgate-shim")
    }

    pub fn integration_script(&self) -> PathBuf {
        self.dir.join("integration.bash")
    }
}

/// Name of the repo-layer rule file.
pub const REPO_RULES_FILE: &str = ".shellgate.yaml";

/// Find the nearest repo-layer rule file at or above `working_dir`.
pub fn discover_repo_rules(working_dir: &Path) -> Option<PathBuf> {
    let mut dir = Some(working_dir);
    while let Some(current) = dir {
        let candidate = current.join(REPO_RULES_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}
