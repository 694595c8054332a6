// src/exec/executor.rs

//! Executor capabilities and the name → implementation registry.
//!
//! An executor is resolved by name once, when the registry is built; an
//! unknown name is a configuration error, never a runtime crash.
//!
//! Executors do not run anything themselves: they describe the process the
//! [`WorkerProcessManager`](super::process::WorkerProcessManager) should
//! spawn, either for one task ([`Executor`]) or for a whole batch
//! ([`BatchExecutor`]).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dag::{Task, TaskGraph};
use crate::errors::{DagrunError, Result};
use crate::types::OutputCapture;

/// Name of the executor every registry knows about.
pub const SHELL_EXECUTOR: &str = "shell";

/// Context handed to executors when they build a command.
#[derive(Debug, Clone)]
pub struct ExecutorContext {
    pub workspace_root: PathBuf,
    pub cwd: PathBuf,
    pub task_graph: Arc<TaskGraph>,
    pub is_verbose: bool,
}

/// A fully-resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ProcessCommand {
    /// Run `script` through the platform shell.
    pub fn shell(script: &str, cwd: PathBuf) -> Self {
        if cfg!(windows) {
            Self {
                program: "cmd".to_string(),
                args: vec!["/C".to_string(), script.to_string()],
                cwd,
            }
        } else {
            Self {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                cwd,
            }
        }
    }
}

/// Builds the process that runs a single task.
pub trait Executor: Send + Sync {
    fn command(&self, task: &Task, ctx: &ExecutorContext) -> Result<ProcessCommand>;
}

/// Builds the worker process that runs a whole batch.
///
/// The worker speaks the line-delimited protocol in
/// [`messages`](super::messages).
pub trait BatchExecutor: Send + Sync {
    fn worker_command(&self, executor_name: &str, ctx: &ExecutorContext) -> Result<ProcessCommand>;
}

/// Static facts about an executor that drive scheduling and caching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorMetadata {
    pub name: String,
    pub batch: bool,
    pub cacheable: bool,
    pub output_capture: OutputCapture,
}

/// Runs `options.command` through the shell, in `options.cwd` (relative to
/// the workspace root) or the workspace root itself.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor;

impl Executor for ShellExecutor {
    fn command(&self, task: &Task, ctx: &ExecutorContext) -> Result<ProcessCommand> {
        let script = match task.overrides.get("command") {
            Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s.clone(),
            _ => {
                return Err(DagrunError::ConfigError(format!(
                    "task '{}' uses the '{}' executor but has no `command` option",
                    task.id, SHELL_EXECUTOR
                )));
            }
        };

        let cwd = match task.overrides.get("cwd") {
            Some(serde_json::Value::String(dir)) => ctx.workspace_root.join(dir),
            _ => ctx.workspace_root.clone(),
        };

        Ok(ProcessCommand::shell(&script, cwd))
    }
}

/// Batch executor backed by a worker command line from the config.
#[derive(Debug, Clone)]
pub struct CommandBatchExecutor {
    worker: String,
}

impl CommandBatchExecutor {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }
}

impl BatchExecutor for CommandBatchExecutor {
    fn worker_command(&self, _executor_name: &str, ctx: &ExecutorContext) -> Result<ProcessCommand> {
        Ok(ProcessCommand::shell(&self.worker, ctx.workspace_root.clone()))
    }
}

#[derive(Clone)]
struct RegisteredExecutor {
    metadata: ExecutorMetadata,
    single: Arc<dyn Executor>,
    batch: Option<Arc<dyn BatchExecutor>>,
}

/// Registry mapping executor names to implementations.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    entries: BTreeMap<String, RegisteredExecutor>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("executors", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell` executor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(SHELL_EXECUTOR, ShellExecutor, true, OutputCapture::Pipe);
        registry
    }

    /// Register (or replace) a single-task executor.
    pub fn register<E>(&mut self, name: &str, executor: E, cacheable: bool, output_capture: OutputCapture)
    where
        E: Executor + 'static,
    {
        self.entries.insert(
            name.to_string(),
            RegisteredExecutor {
                metadata: ExecutorMetadata {
                    name: name.to_string(),
                    batch: false,
                    cacheable,
                    output_capture,
                },
                single: Arc::new(executor),
                batch: None,
            },
        );
    }

    /// Make an already-registered executor batch-capable.
    pub fn register_batch<B>(&mut self, name: &str, batch: B) -> Result<()>
    where
        B: BatchExecutor + 'static,
    {
        let entry = self.entries.get_mut(name).ok_or_else(|| {
            DagrunError::ConfigError(format!(
                "cannot attach a batch implementation to unknown executor '{name}'"
            ))
        })?;
        entry.metadata.batch = true;
        entry.batch = Some(Arc::new(batch));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn metadata(&self, name: &str) -> Option<&ExecutorMetadata> {
        self.entries.get(name).map(|e| &e.metadata)
    }

    /// Metadata for the executor of `task`.
    pub fn metadata_for(&self, task: &Task) -> Result<&ExecutorMetadata> {
        self.metadata(&task.executor)
            .ok_or_else(|| unknown_executor(task))
    }

    pub fn executor_for(&self, task: &Task) -> Result<Arc<dyn Executor>> {
        self.entries
            .get(&task.executor)
            .map(|e| Arc::clone(&e.single))
            .ok_or_else(|| unknown_executor(task))
    }

    pub fn batch_executor(&self, name: &str) -> Result<Arc<dyn BatchExecutor>> {
        self.entries
            .get(name)
            .and_then(|e| e.batch.clone())
            .ok_or_else(|| {
                DagrunError::ConfigError(format!("executor '{name}' has no batch implementation"))
            })
    }

    /// Check every task in `graph` against the registry.
    pub fn validate_graph(&self, graph: &TaskGraph) -> Result<()> {
        for task in graph.iter() {
            if !self.contains(&task.executor) {
                return Err(unknown_executor(task));
            }
        }
        Ok(())
    }
}

fn unknown_executor(task: &Task) -> DagrunError {
    DagrunError::UnknownExecutor {
        task: task.id.clone(),
        executor: task.executor.clone(),
    }
}
