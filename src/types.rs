use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Terminal status recorded for every task in a run.
///
/// Exactly one status is recorded per task id; later writes are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Success,
    Failure,
    Skipped,
    LocalCache,
    LocalCacheKeptExisting,
    RemoteCache,
}

impl TaskStatus {
    /// Whether the status was produced by replaying a cache entry.
    pub fn is_cache_hit(self) -> bool {
        matches!(
            self,
            TaskStatus::LocalCache | TaskStatus::LocalCacheKeptExisting | TaskStatus::RemoteCache
        )
    }

    /// Whether dependents must be skipped (or the run bailed) after this status.
    pub fn is_failure_or_skip(self) -> bool {
        matches!(self, TaskStatus::Failure | TaskStatus::Skipped)
    }

    /// Exit code reported to life cycles for this status.
    pub fn code(self) -> i32 {
        match self {
            TaskStatus::Success
            | TaskStatus::LocalCache
            | TaskStatus::LocalCacheKeptExisting
            | TaskStatus::RemoteCache => 0,
            TaskStatus::Failure | TaskStatus::Skipped => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Skipped => "skipped",
            TaskStatus::LocalCache => "local-cache",
            TaskStatus::LocalCacheKeptExisting => "local-cache-kept-existing",
            TaskStatus::RemoteCache => "remote-cache",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a single task's terminal output is captured.
///
/// - `Pipe`: the manager reads the child's stdout/stderr and buffers them.
/// - `Direct`: the child's output goes straight into the scratch file at the
///   cache's temporary output path, which is read back after exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCapture {
    Pipe,
    Direct,
}

impl Default for OutputCapture {
    fn default() -> Self {
        OutputCapture::Pipe
    }
}

impl FromStr for OutputCapture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pipe" => Ok(OutputCapture::Pipe),
            "direct" => Ok(OutputCapture::Direct),
            other => Err(format!(
                "invalid output_capture: {other} (expected \"pipe\" or \"direct\")"
            )),
        }
    }
}

/// Where recorded outputs hashes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputsTracking {
    /// Store hashes in a file (`.dagrun/outputs-hashes`).
    File,
    /// Store hashes in memory only (lost on exit).
    Memory,
    /// No coordinator: cached outputs are always copied.
    None,
}

impl Default for OutputsTracking {
    fn default() -> Self {
        OutputsTracking::File
    }
}
