// src/cache/remote.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::cache::result_cache::copy_recursively;

/// Shares committed cache entries with other machines or workspaces.
///
/// Both operations work on the on-disk layout of the local cache directory:
/// `retrieve` materializes `<cache_dir>/<hash>` and its commit marker,
/// `store` publishes them. Each returns whether anything was transferred.
pub trait RemoteCache: Send + Sync {
    fn retrieve(&self, hash: &str, cache_dir: &Path) -> Result<bool>;
    fn store(&self, hash: &str, cache_dir: &Path) -> Result<bool>;
}

/// Remote cache backed by a shared directory (network mount, CI volume, ...).
#[derive(Debug, Clone)]
pub struct DirectoryRemoteCache {
    root: PathBuf,
}

impl DirectoryRemoteCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl RemoteCache for DirectoryRemoteCache {
    fn retrieve(&self, hash: &str, cache_dir: &Path) -> Result<bool> {
        if !transfer(hash, &self.root, cache_dir)? {
            return Ok(false);
        }
        debug!(hash = %hash, root = ?self.root, "retrieved entry from remote cache");
        Ok(true)
    }

    fn store(&self, hash: &str, cache_dir: &Path) -> Result<bool> {
        if commit_marker(&self.root, hash).exists() {
            return Ok(false);
        }
        if !transfer(hash, cache_dir, &self.root)? {
            return Ok(false);
        }
        debug!(hash = %hash, root = ?self.root, "stored entry in remote cache");
        Ok(true)
    }
}

fn commit_marker(dir: &Path, hash: &str) -> PathBuf {
    dir.join(format!("{hash}.commit"))
}

/// Copy a committed entry from `from` to `to`, committing it last.
fn transfer(hash: &str, from: &Path, to: &Path) -> Result<bool> {
    let src_commit = commit_marker(from, hash);
    let src_dir = from.join(hash);
    if !src_commit.exists() || !src_dir.is_dir() {
        return Ok(false);
    }

    fs::create_dir_all(to).with_context(|| format!("creating cache directory at {:?}", to))?;

    let staging = to.join(format!("{hash}.remote.staging"));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    copy_recursively(&src_dir, &staging)?;

    let dst_dir = to.join(hash);
    if dst_dir.exists() {
        fs::remove_dir_all(&dst_dir)?;
    }
    fs::rename(&staging, &dst_dir)
        .with_context(|| format!("moving transferred entry into {:?}", dst_dir))?;
    fs::copy(&src_commit, commit_marker(to, hash))
        .with_context(|| format!("committing transferred entry {hash}"))?;
    Ok(true)
}
