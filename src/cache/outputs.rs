// src/cache/outputs.rs

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

/// Relative path (from the workspace root) to the outputs-hashes file.
pub const OUTPUTS_HASHES_PATH: &str = ".dagrun/outputs-hashes";

/// Remembers which task hash produced the outputs currently on disk.
///
/// When a cache hit is replayed and every declared output is already the
/// product of the same hash, the copy-out can be skipped.
pub trait OutputsCoordinator: Send + Sync {
    /// True iff every output exists in the workspace and was last recorded
    /// with `hash`.
    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> Result<bool>;

    fn record_outputs_hash(&self, outputs: &[String], hash: &str) -> Result<()>;
}

fn all_match(
    workspace_root: &Path,
    map: &HashMap<String, String>,
    outputs: &[String],
    hash: &str,
) -> bool {
    outputs.iter().all(|output| {
        workspace_root.join(output).exists() && map.get(output).is_some_and(|h| h == hash)
    })
}

/// Stores outputs hashes in `<workspace>/.dagrun/outputs-hashes`.
pub struct FileOutputsStore {
    workspace_root: PathBuf,
    lock: Mutex<()>,
}

impl FileOutputsStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self) -> PathBuf {
        self.workspace_root.join(OUTPUTS_HASHES_PATH)
    }
}

impl OutputsCoordinator for FileOutputsStore {
    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let map = load_all_hashes(&self.path())?;
        Ok(all_match(&self.workspace_root, &map, outputs, hash))
    }

    fn record_outputs_hash(&self, outputs: &[String], hash: &str) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path();
        let mut map = load_all_hashes(&path)?;
        for output in outputs {
            map.insert(output.clone(), hash.to_string());
        }
        save_all_hashes(&path, &map)?;
        debug!(hash = %hash, outputs = outputs.len(), "recorded outputs hash (file)");
        Ok(())
    }
}

/// Stores outputs hashes in memory only.
pub struct MemoryOutputsStore {
    workspace_root: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl MemoryOutputsStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl OutputsCoordinator for MemoryOutputsStore {
    fn outputs_hashes_match(&self, outputs: &[String], hash: &str) -> Result<bool> {
        let map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        Ok(all_match(&self.workspace_root, &map, outputs, hash))
    }

    fn record_outputs_hash(&self, outputs: &[String], hash: &str) -> Result<()> {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        for output in outputs {
            map.insert(output.clone(), hash.to_string());
        }
        debug!(hash = %hash, outputs = outputs.len(), "recorded outputs hash (memory)");
        Ok(())
    }
}

fn load_all_hashes(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let file = File::open(path).with_context(|| format!("opening outputs-hashes file at {:?}", path))?;
    let reader = BufReader::new(file);

    let mut map = HashMap::new();
    for line_res in reader.lines() {
        let line = line_res?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // hash first: output paths may contain whitespace
        if let Some((hash, output)) = trimmed.split_once(char::is_whitespace) {
            map.insert(output.trim().to_string(), hash.to_string());
        }
    }

    Ok(map)
}

fn save_all_hashes(path: &Path, map: &HashMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating outputs-hashes directory at {:?}", parent))?;
    }

    let mut entries: Vec<(&String, &String)> = map.iter().collect();
    entries.sort();

    let file = File::create(path).with_context(|| format!("creating outputs-hashes file at {:?}", path))?;
    let mut writer = BufWriter::new(file);
    for (output, hash) in entries {
        writeln!(writer, "{} {}", hash, output)?;
    }
    writer.flush()?;
    Ok(())
}
