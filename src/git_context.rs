//! Short-TTL cache of git branch/repo lookups, keyed by working directory.
//!
//! This is the only place in the evaluation pipeline allowed to spawn a
//! subprocess. Lookups are bounded by a short deadline; any failure (not a
//! repo, git missing, timeout) is a positive `(false, none)` result and is
//! cached like a success so a broken git never gets polled per request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Hard deadline on one `git` invocation.
const GIT_DEADLINE: Duration = Duration::from_millis(200);

/// Entries beyond this are pruned opportunistically on insert.
const MAX_ENTRIES: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitContext {
    pub in_repo: bool,
    pub branch: Option<String>,
}

pub struct GitContextCache {
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, (Instant, GitContext)>>,
}

impl GitContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Branch and repo status for `working_dir`, cached for the TTL.
    pub async fn lookup(&self, working_dir: &Path) -> GitContext {
        let key = working_dir
            .canonicalize()
            .unwrap_or_else(|_| working_dir.to_path_buf());

        if let Some(cached) = self.get_fresh(&key) {
            return cached;
        }

        let resolved = resolve(&key).await;

        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, (at, _)| at.elapsed() < ttl);
        }
        entries.insert(key, (Instant::now(), resolved.clone()));
        resolved
    }

    fn get_fresh(&self, key: &Path) -> Option<GitContext> {
        let entries = self.entries.lock().unwrap();
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, ctx)| ctx.clone())
    }
}

async fn resolve(dir: &Path) -> GitContext {
    let child = Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(GIT_DEADLINE, child).await {
        Ok(Ok(output)) => output,
        // Deadline hit or spawn failed: treated as "not a repo".
        _ => return GitContext::default(),
    };

    if !output.status.success() {
        return GitContext::default();
    }

    let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if branch.is_empty() {
        return GitContext::default();
    }
    GitContext {
        in_repo: true,
        branch: Some(branch),
    }
}
