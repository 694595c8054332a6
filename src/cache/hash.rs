// src/cache/hash.rs

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use blake3::Hasher;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::dag::{Task, TaskId};

/// Turns a task into its cache key.
///
/// `dependency_hashes` holds the already-computed hashes of the task's
/// direct dependencies, sorted by id.
pub trait TaskHasher: Send + Sync {
    fn hash_task(&self, task: &Task, dependency_hashes: &[(TaskId, String)]) -> Result<String>;
}

/// Default hasher: static task attributes, input file contents and
/// dependency hashes, digested with blake3.
#[derive(Debug, Clone)]
pub struct Blake3TaskHasher {
    workspace_root: PathBuf,
}

impl Blake3TaskHasher {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    /// Files under the task's project root matching its input globs.
    fn input_files(&self, task: &Task) -> Result<Vec<PathBuf>> {
        if task.inputs.is_empty() {
            return Ok(Vec::new());
        }

        let set = build_globset(&task.inputs)?;
        let project_root = self.workspace_root.join(&task.project_root);

        let mut files = Vec::new();
        for entry in WalkDir::new(&project_root).follow_links(false) {
            let entry = entry
                .with_context(|| format!("walking inputs of task '{}' under {:?}", task.id, project_root))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&project_root)
                .unwrap_or(entry.path());
            if set.is_match(rel) {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }
}

impl TaskHasher for Blake3TaskHasher {
    fn hash_task(&self, task: &Task, dependency_hashes: &[(TaskId, String)]) -> Result<String> {
        let files = self.input_files(task)?;
        let inputs_hash = compute_hash_for_paths(&files)?;

        let mut hasher = Hasher::new();
        hash_static_attributes(&mut hasher, task, dependency_hashes)?;
        hasher.update(b"inputs\0");
        hasher.update(inputs_hash.as_bytes());

        let hash = hasher.finalize().to_hex().to_string();
        debug!(task = %task.id, hash = %hash, files = files.len(), "computed task hash");
        Ok(hash)
    }
}

/// Digest of everything about a task that does not touch the filesystem.
///
/// Used when the configured hasher fails, so the run can still proceed with
/// a stable key.
pub fn fallback_hash(task: &Task, dependency_hashes: &[(TaskId, String)]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"fallback\0");
    if hash_static_attributes(&mut hasher, task, dependency_hashes).is_err() {
        hasher.update(task.id.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn hash_static_attributes(
    hasher: &mut Hasher,
    task: &Task,
    dependency_hashes: &[(TaskId, String)],
) -> Result<()> {
    hasher.update(b"executor\0");
    hasher.update(task.executor.as_bytes());
    hasher.update(b"\0target\0");
    hasher.update(task.target.task_id().as_bytes());

    // BTreeMap keys serialize in order, which keeps this canonical.
    let overrides = serde_json::to_vec(&task.overrides).context("serializing task overrides")?;
    hasher.update(b"\0overrides\0");
    hasher.update(&overrides);

    hasher.update(b"\0outputs\0");
    for output in &task.outputs {
        hasher.update(output.as_bytes());
        hasher.update(b"\0");
    }

    let mut deps: Vec<&(TaskId, String)> = dependency_hashes.iter().collect();
    deps.sort_by(|a, b| a.0.cmp(&b.0));
    hasher.update(b"deps\0");
    for (id, hash) in deps {
        hasher.update(id.as_bytes());
        hasher.update(b"=");
        hasher.update(hash.as_bytes());
        hasher.update(b"\0");
    }
    Ok(())
}

/// Compute the hash of a single file.
pub fn compute_file_hash(path: &Path) -> Result<String> {
    let mut hasher = Hasher::new();
    let mut file =
        File::open(path).with_context(|| format!("opening file for hashing: {:?}", path))?;
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Compute a deterministic hash over the contents of the given files.
///
/// Order of `paths` does not matter; they are sorted before hashing.
/// Paths that are not regular files are ignored.
pub fn compute_hash_for_paths<I, P>(paths: I) -> Result<String>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut hasher = Hasher::new();

    let mut paths_vec: Vec<PathBuf> = paths
        .into_iter()
        .map(|p| p.as_ref().to_path_buf())
        .collect();
    paths_vec.sort();

    for path in paths_vec {
        if path.is_file() {
            let file_hash = compute_file_hash(&path)?;
            hasher.update(file_hash.as_bytes());
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

pub(crate) fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat).with_context(|| format!("invalid glob pattern: {pat}"))?;
        builder.add(glob);
    }
    builder.build().context("building globset")
}
