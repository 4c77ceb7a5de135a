//! Rule cache: keeps the compiled [`RuleSet`] hot across requests while
//! staying coherent with on-disk edits.
//!
//! Coherence is two-stage: a cheap (mtime, size) check per acquire, and a
//! content hash only when the metadata moved (editors that rewrite files
//! without changing bytes then skip the rebuild). One async mutex guards the
//! whole cache, so concurrent misses coalesce into a single rebuild and
//! waiters simply pick up the finished slot. A failed rebuild surfaces to
//! the caller that triggered it and is remembered by stamp, so the last-good
//! set keeps serving without re-parsing a known-bad file on every request.

use crate::rules::{self, LoadError, LoadInputs, RuleSet};
use crate::settings;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("{path}: {message}")]
    Read { path: PathBuf, message: String },
}

/// (mtime, size) of a layer file; `None` when the file does not exist.
type Metadata = Option<(SystemTime, u64)>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ContentStamp {
    global: Option<String>,
    repo: Option<String>,
}

#[derive(Debug, Clone)]
struct SourceState {
    global_meta: Metadata,
    repo_meta: Metadata,
    content: ContentStamp,
}

struct CachedEntry {
    ruleset: Arc<RuleSet>,
    state: SourceState,
    /// Content stamp of the most recent failed rebuild, if any.
    failed: Option<ContentStamp>,
}

/// Cache keyed by the discovered repo-layer file (requests from different
/// repositories see different merged sets).
pub struct RuleCache {
    global_path: PathBuf,
    entries: Mutex<HashMap<Option<PathBuf>, CachedEntry>>,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::with_global_path(settings::Paths::resolve().global_rules())
    }

    pub fn with_global_path(global_path: PathBuf) -> Self {
        Self {
            global_path,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the active rule set for a request from `working_dir`,
    /// rebuilding if a source layer changed since the last load.
    pub async fn acquire(&self, working_dir: &Path) -> Result<Arc<RuleSet>, CacheError> {
        self.acquire_inner(working_dir, false).await
    }

    /// `RELOAD_RULES`: rebuild unconditionally, retaining last-good on
    /// failure. The error goes to the reloader; other callers keep the
    /// previous set.
    pub async fn reload(&self, working_dir: &Path) -> Result<Arc<RuleSet>, CacheError> {
        self.acquire_inner(working_dir, true).await
    }

    async fn acquire_inner(
        &self,
        working_dir: &Path,
        force: bool,
    ) -> Result<Arc<RuleSet>, CacheError> {
        let repo_path = settings::discover_repo_rules(working_dir);
        let key = repo_path.clone();

        let mut entries = self.entries.lock().await;

        let global_meta = file_metadata(&self.global_path);
        let repo_meta = repo_path.as_deref().map(file_metadata).unwrap_or(None);

        if !force {
            if let Some(entry) = entries.get(&key) {
                if entry.state.global_meta == global_meta && entry.state.repo_meta == repo_meta {
                    return Ok(Arc::clone(&entry.ruleset));
                }
            }
        }

        // Metadata moved (or reload requested): read and hash the blobs.
        let global_blob = read_layer(&self.global_path)?;
        let repo_blob = match &repo_path {
            Some(path) => read_layer(path)?,
            None => None,
        };
        let content = ContentStamp {
            global: global_blob.as_deref().map(content_hash),
            repo: repo_blob.as_deref().map(content_hash),
        };

        if let Some(entry) = entries.get_mut(&key) {
            if !force && entry.state.content == content {
                // Touched but unchanged: refresh metadata, skip the rebuild.
                entry.state.global_meta = global_meta;
                entry.state.repo_meta = repo_meta;
                return Ok(Arc::clone(&entry.ruleset));
            }
            if !force && entry.failed.as_ref() == Some(&content) {
                // Known-bad sources: keep serving last-good quietly.
                return Ok(Arc::clone(&entry.ruleset));
            }
        }

        match rules::load(LoadInputs {
            defaults: rules::DEFAULT_RULES,
            global: global_blob.as_deref(),
            repo: repo_blob.as_deref(),
        }) {
            Ok(ruleset) => {
                let ruleset = Arc::new(ruleset);
                entries.insert(
                    key,
                    CachedEntry {
                        ruleset: Arc::clone(&ruleset),
                        state: SourceState {
                            global_meta,
                            repo_meta,
                            content,
                        },
                        failed: None,
                    },
                );
                Ok(ruleset)
            }
            Err(err) => {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.failed = Some(content);
                }
                tracing::error!(error = %err, "rule reload failed; retaining previous rule set");
                Err(err.into())
            }
        }
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

fn file_metadata(path: &Path) -> Metadata {
    fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok().map(|mtime| (mtime, m.len())))
}

fn read_layer(path: &Path) -> Result<Option<String>, CacheError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

fn content_hash(blob: &str) -> String {
    hex::encode(Sha256::digest(blob.as_bytes()))
}
