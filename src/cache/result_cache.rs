// src/cache/result_cache.rs

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cache::remote::RemoteCache;
use crate::dag::Task;

const META_FILE: &str = "meta.json";
const TERMINAL_OUTPUT_FILE: &str = "terminalOutput";
const OUTPUTS_DIR: &str = "outputs";
const TERMINAL_OUTPUTS_DIR: &str = "terminalOutputs";
const COMMIT_SUFFIX: &str = ".commit";
const STAGING_SUFFIX: &str = ".staging";

/// A committed cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub terminal_output: String,
    pub code: i32,
    /// Declared output paths recorded when the entry was written.
    pub outputs: Vec<String>,
    /// Directory holding the captured output artifacts.
    pub outputs_path: PathBuf,
    /// Whether the entry was fetched through the remote cache.
    pub remote: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheMeta {
    hash: String,
    code: i32,
    #[serde(default)]
    outputs: Vec<String>,
    created_at: DateTime<Utc>,
}

/// Result store keyed by task hash.
///
/// Layout under the cache directory:
///
/// ```text
/// <hash>/meta.json
/// <hash>/terminalOutput
/// <hash>/outputs/...
/// <hash>.commit                 written last; entries without it are invisible
/// terminalOutputs/<hash>        scratch terminal output for a running task
/// ```
///
/// Committed entries are never overwritten.
#[derive(Clone)]
pub struct ResultCache {
    cache_dir: PathBuf,
    workspace_root: PathBuf,
    max_age: Duration,
    remote: Option<Arc<dyn RemoteCache>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("cache_dir", &self.cache_dir)
            .field("workspace_root", &self.workspace_root)
            .field("max_age", &self.max_age)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl ResultCache {
    pub fn new(cache_dir: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            workspace_root: workspace_root.into(),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            remote: None,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Look up the entry for `task.hash`.
    ///
    /// Missing, uncommitted or corrupt entries are a miss. Entries with a
    /// non-zero code are returned; replay policy is the caller's call.
    pub fn get(&self, task: &Task) -> Option<CacheEntry> {
        let hash = task.hash.as_deref()?;

        match self.read_entry(hash, false) {
            Ok(Some(entry)) => return Some(entry),
            Ok(None) => {}
            Err(err) => {
                warn!(task = %task.id, hash = %hash, error = %format!("{err:#}"), "unreadable cache entry; treating as miss");
                return None;
            }
        }

        let remote = self.remote.as_ref()?;
        match remote.retrieve(hash, &self.cache_dir) {
            Ok(true) => match self.read_entry(hash, true) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(task = %task.id, hash = %hash, error = %format!("{err:#}"), "unreadable remote cache entry; treating as miss");
                    None
                }
            },
            Ok(false) => None,
            Err(err) => {
                warn!(task = %task.id, hash = %hash, error = %format!("{err:#}"), "remote cache lookup failed");
                None
            }
        }
    }

    /// Persist a new entry for `task.hash`.
    ///
    /// The entry is staged in a scratch directory and made visible by the
    /// commit marker, so a crash mid-write leaves no partial entry behind.
    pub fn put(
        &self,
        task: &Task,
        terminal_output: Option<&str>,
        outputs: &[String],
        code: i32,
    ) -> Result<()> {
        let hash = task
            .hash
            .as_deref()
            .with_context(|| format!("task '{}' has no hash", task.id))?;

        if self.commit_path(hash).exists() {
            debug!(task = %task.id, hash = %hash, "cache entry already committed; not overwriting");
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir)
            .with_context(|| format!("creating cache directory at {:?}", self.cache_dir))?;

        let staging = self
            .cache_dir
            .join(format!("{hash}.{}{STAGING_SUFFIX}", std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        let staged_outputs = staging.join(OUTPUTS_DIR);
        fs::create_dir_all(&staged_outputs)
            .with_context(|| format!("creating staging directory at {:?}", staging))?;

        for output in outputs {
            let src = self.workspace_root.join(output);
            if src.exists() {
                copy_recursively(&src, &staged_outputs.join(output))
                    .with_context(|| format!("capturing output {:?}", src))?;
            }
        }

        let terminal_output = terminal_output.unwrap_or_default();
        fs::write(staging.join(TERMINAL_OUTPUT_FILE), terminal_output)?;

        let meta = CacheMeta {
            hash: hash.to_string(),
            code,
            outputs: outputs.to_vec(),
            created_at: Utc::now(),
        };
        fs::write(staging.join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;

        let entry_dir = self.entry_dir(hash);
        if entry_dir.exists() {
            // leftover from a crashed write
            fs::remove_dir_all(&entry_dir)?;
        }
        fs::rename(&staging, &entry_dir)
            .with_context(|| format!("moving staged entry into {:?}", entry_dir))?;

        let mirror = self.cache_dir.join(TERMINAL_OUTPUTS_DIR).join(hash);
        if let Some(parent) = mirror.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&mirror, terminal_output)?;

        fs::write(self.commit_path(hash), meta.created_at.to_rfc3339())
            .with_context(|| format!("committing cache entry {hash}"))?;

        info!(task = %task.id, hash = %hash, code, "stored cache entry");

        if let Some(remote) = &self.remote {
            if let Err(err) = remote.store(hash, &self.cache_dir) {
                warn!(task = %task.id, hash = %hash, error = %format!("{err:#}"), "storing entry in remote cache failed");
            }
        }

        Ok(())
    }

    /// Restore the captured artifacts of `entry` into the workspace.
    ///
    /// Each existing output is removed first so stale files do not survive.
    pub fn copy_files_from_cache(&self, hash: &str, entry: &CacheEntry, outputs: &[String]) -> Result<()> {
        for output in outputs {
            let cached = entry.outputs_path.join(output);
            let dst = self.workspace_root.join(output);

            if dst.is_dir() {
                fs::remove_dir_all(&dst)?;
            } else if dst.exists() {
                fs::remove_file(&dst)?;
            }

            if cached.exists() {
                copy_recursively(&cached, &dst)
                    .with_context(|| format!("restoring output {output} from cache entry {hash}"))?;
            }
        }
        debug!(hash = %hash, outputs = outputs.len(), "restored outputs from cache");
        Ok(())
    }

    /// Scratch file for a task's terminal output while it runs.
    ///
    /// Depends only on the task hash (or id when unhashed), never on whether
    /// the result is eventually cached.
    pub fn temporary_output_path(&self, task: &Task) -> PathBuf {
        let key = match &task.hash {
            Some(hash) => hash.clone(),
            None => task.id.replace([':', '/', '\\'], "_"),
        };
        self.cache_dir.join(TERMINAL_OUTPUTS_DIR).join(key)
    }

    /// Delete committed entries older than the retention period, together
    /// with their mirrored terminal output. Stale staging directories and
    /// scratch terminal output without a committed entry go too.
    ///
    /// Returns the number of committed entries removed.
    pub fn remove_old_cache_records(&self) -> Result<usize> {
        if !self.cache_dir.is_dir() {
            return Ok(0);
        }

        let now = SystemTime::now();
        let is_expired = |path: &Path| -> bool {
            fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.max_age)
        };

        let mut removed = 0;
        for entry in fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();

            if let Some(hash) = name.strip_suffix(COMMIT_SUFFIX) {
                if !is_expired(&path) {
                    continue;
                }
                let entry_dir = self.entry_dir(hash);
                if entry_dir.exists() {
                    fs::remove_dir_all(&entry_dir)?;
                }
                let mirror = self.cache_dir.join(TERMINAL_OUTPUTS_DIR).join(hash);
                if mirror.exists() {
                    fs::remove_file(&mirror)?;
                }
                fs::remove_file(&path)?;
                debug!(hash = %hash, "removed expired cache entry");
                removed += 1;
            } else if name.ends_with(STAGING_SUFFIX) && is_expired(&path) {
                fs::remove_dir_all(&path)?;
                debug!(path = ?path, "removed stale staging directory");
            }
        }

        let scratch = self.remove_orphaned_terminal_outputs(&is_expired)?;

        if removed > 0 || scratch > 0 {
            info!(removed, scratch, "removed old cache records");
        }
        Ok(removed)
    }

    /// Scratch output of runs that never produced an entry has no commit
    /// marker; it ages out on the same schedule.
    fn remove_orphaned_terminal_outputs(&self, is_expired: &dyn Fn(&Path) -> bool) -> Result<usize> {
        let dir = self.cache_dir.join(TERMINAL_OUTPUTS_DIR);
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&dir).with_context(|| format!("reading {:?}", dir))? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.commit_path(&name).exists() || !is_expired(&path) {
                continue;
            }
            fs::remove_file(&path).with_context(|| format!("removing {:?}", path))?;
            debug!(path = ?path, "removed orphaned terminal output");
            removed += 1;
        }
        Ok(removed)
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(hash)
    }

    fn commit_path(&self, hash: &str) -> PathBuf {
        self.cache_dir.join(format!("{hash}{COMMIT_SUFFIX}"))
    }

    fn read_entry(&self, hash: &str, remote: bool) -> Result<Option<CacheEntry>> {
        if !self.commit_path(hash).exists() {
            return Ok(None);
        }

        let dir = self.entry_dir(hash);
        let meta_path = dir.join(META_FILE);
        let meta: CacheMeta = serde_json::from_slice(
            &fs::read(&meta_path).with_context(|| format!("reading {:?}", meta_path))?,
        )
        .with_context(|| format!("parsing {:?}", meta_path))?;

        if meta.hash != hash {
            anyhow::bail!("cache entry {hash} records hash {}", meta.hash);
        }

        let terminal_output = match fs::read(dir.join(TERMINAL_OUTPUT_FILE)) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Some(CacheEntry {
            terminal_output,
            code: meta.code,
            outputs: meta.outputs,
            outputs_path: dir.join(OUTPUTS_DIR),
            remote,
        }))
    }
}

/// Copy a file, or a directory tree, to `dst`.
pub(crate) fn copy_recursively(src: &Path, dst: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst).with_context(|| format!("copying {:?} to {:?}", src, dst))?;
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {:?} to {:?}", entry.path(), target))?;
        }
    }
    Ok(())
}
