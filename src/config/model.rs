// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::types::{OutputCapture, OutputsTracking};

/// Top-level configuration as read from a TOML file, before validation.
///
/// ```toml
/// [config]
/// parallel = 4
/// cache_directory = ".dagrun/cache"
///
/// [executor.jest]
/// batch_worker = "node tools/jest-worker.js"
///
/// [task."app:build"]
/// options = { command = "cargo build" }
/// outputs = ["target/debug/app"]
///
/// [task."app:test"]
/// executor = "jest"
/// after = ["app:build"]
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    /// Run options from `[config]`.
    #[serde(default)]
    pub config: ConfigSection,

    /// Executors from `[executor.<name>]`.
    #[serde(default)]
    pub executor: BTreeMap<String, ExecutorConfig>,

    /// All tasks from `[task."<id>"]`, keyed by task id.
    #[serde(default)]
    pub task: BTreeMap<String, TaskConfig>,

    /// Task ids in file order, filled in by the loader. Ids missing here
    /// sort after the listed ones, alphabetically.
    #[serde(skip)]
    pub task_order: Vec<String>,
}

/// Validated configuration.
///
/// Can only be obtained through `TryFrom<RawConfigFile>`, so holding one
/// means the dependency graph is acyclic and every reference resolves.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: ConfigSection,
    pub executor: BTreeMap<String, ExecutorConfig>,
    pub task: BTreeMap<String, TaskConfig>,
    /// Task ids in file order.
    order: Vec<String>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        config: ConfigSection,
        executor: BTreeMap<String, ExecutorConfig>,
        task: BTreeMap<String, TaskConfig>,
        order: Vec<String>,
    ) -> Self {
        Self {
            config,
            executor,
            task,
            order,
        }
    }

    /// Task ids in the order they are declared.
    pub fn task_ids(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }
}

/// `[config]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigSection {
    /// Number of concurrent execution slots.
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    #[serde(default)]
    pub bail: bool,

    #[serde(default)]
    pub skip_cache: bool,

    /// Persist results of failed tasks too.
    #[serde(default)]
    pub cache_failures: bool,

    /// Group tasks of batch-capable executors.
    #[serde(default = "default_true")]
    pub batch_mode: bool,

    /// Relative to the workspace root.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    /// Shared directory used as a remote cache.
    #[serde(default)]
    pub remote_cache_directory: Option<PathBuf>,

    #[serde(default = "default_max_cache_age_days")]
    pub max_cache_age_days: u64,

    /// Also write stderr into the terminal output file in direct mode.
    #[serde(default)]
    pub capture_stderr: bool,

    #[serde(default = "default_true")]
    pub load_dot_env_files: bool,

    #[serde(default)]
    pub stream_output: bool,

    /// Prefix streamed lines with the task's project name.
    #[serde(default)]
    pub prefix_output: bool,

    #[serde(default)]
    pub outputs_tracking: OutputsTracking,

    /// Project whose tasks always stream their output.
    #[serde(default)]
    pub initiating_project: Option<String>,

    #[serde(default)]
    pub verbose: bool,
}

fn default_parallel() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".dagrun/cache")
}

fn default_max_cache_age_days() -> u64 {
    7
}

impl Default for ConfigSection {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            bail: false,
            skip_cache: false,
            cache_failures: false,
            batch_mode: true,
            cache_directory: default_cache_directory(),
            remote_cache_directory: None,
            max_cache_age_days: default_max_cache_age_days(),
            capture_stderr: false,
            load_dot_env_files: true,
            stream_output: false,
            prefix_output: false,
            outputs_tracking: OutputsTracking::default(),
            initiating_project: None,
            verbose: false,
        }
    }
}

/// `[executor.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Command line of the batch worker. Its presence makes the executor
    /// batch-capable.
    #[serde(default)]
    pub batch_worker: Option<String>,

    #[serde(default = "default_true")]
    pub cacheable: bool,

    #[serde(default)]
    pub output_capture: OutputCapture,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            batch_worker: None,
            cacheable: true,
            output_capture: OutputCapture::default(),
        }
    }
}

/// `[task."<id>"]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    /// Defaults to the part of the id before the first `:`.
    #[serde(default)]
    pub project: Option<String>,

    /// Defaults to the second `:`-separated part of the id.
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub configuration: Option<String>,

    /// Executor name; `shell` when omitted.
    #[serde(default)]
    pub executor: Option<String>,

    /// Relative to the workspace root.
    #[serde(default)]
    pub project_root: Option<PathBuf>,

    /// Executor options. The `shell` executor reads `command` and `cwd`.
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Globs relative to `project_root`.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Ids of tasks this task waits for.
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub cache: Option<bool>,
}
