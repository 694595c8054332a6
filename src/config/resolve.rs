// src/config/resolve.rs

//! Turn a validated [`ConfigFile`] into the runtime pieces: the task graph,
//! the executor registry and the run options.

use std::collections::BTreeMap;

use tracing::debug;

use crate::config::model::{ConfigFile, TaskConfig};
use crate::dag::{Task, TaskGraph, TaskTarget};
use crate::engine::RunOptions;
use crate::errors::{DagrunError, Result};
use crate::exec::executor::{CommandBatchExecutor, ExecutorRegistry, SHELL_EXECUTOR, ShellExecutor};

/// Target triple of a task: explicit `project`/`target`/`configuration`
/// fields win over the `project:target[:configuration]` parts of its id.
pub(crate) fn task_target(id: &str, task: &TaskConfig) -> Option<TaskTarget> {
    let parts: Vec<&str> = id.splitn(3, ':').collect();

    let project = task
        .project
        .clone()
        .or_else(|| parts.first().map(|s| s.to_string()))?;
    let target = task
        .target
        .clone()
        .or_else(|| parts.get(1).map(|s| s.to_string()))?;
    if project.is_empty() || target.is_empty() {
        return None;
    }

    let configuration = task
        .configuration
        .clone()
        .or_else(|| parts.get(2).map(|s| s.to_string()));

    let mut resolved = TaskTarget::new(project, target);
    resolved.configuration = configuration;
    Some(resolved)
}

impl ConfigFile {
    /// Build the task graph, tasks in declaration order.
    pub fn task_graph(&self) -> Result<TaskGraph> {
        let mut tasks = Vec::with_capacity(self.task.len());
        let mut dependencies = Vec::with_capacity(self.task.len());

        for id in self.task_ids() {
            let Some(cfg) = self.task.get(id) else {
                continue;
            };
            let target = task_target(id, cfg).ok_or_else(|| {
                DagrunError::ConfigError(format!("task '{id}' has no project/target"))
            })?;

            let mut task = Task::new(target, cfg.executor.as_deref().unwrap_or(SHELL_EXECUTOR));
            task.id = id.clone();
            task.project_root = cfg.project_root.clone().unwrap_or_default();
            task.outputs = cfg.outputs.clone();
            task.inputs = cfg.inputs.clone();
            task.cache = cfg.cache;
            task.overrides = cfg
                .options
                .iter()
                .map(|(k, v)| Ok((k.clone(), serde_json::to_value(v)?)))
                .collect::<Result<BTreeMap<_, _>>>()?;

            tasks.push(task);
            dependencies.push((id.clone(), cfg.after.clone()));
        }

        let graph = TaskGraph::new(tasks, dependencies)?;
        debug!(tasks = graph.len(), roots = ?graph.roots, "resolved task graph");
        Ok(graph)
    }

    /// Registry with the built-in `shell` executor plus every
    /// `[executor.<name>]`.
    ///
    /// Configured executors run their single tasks through the shell with
    /// `options.command`, like `shell` does; a `batch_worker` makes them
    /// batch-capable.
    pub fn executor_registry(&self) -> Result<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::with_builtins();

        for (name, cfg) in self.executor.iter() {
            registry.register(name, ShellExecutor, cfg.cacheable, cfg.output_capture);
            if let Some(worker) = &cfg.batch_worker {
                registry.register_batch(name, CommandBatchExecutor::new(worker.clone()))?;
            }
            debug!(executor = %name, batch = cfg.batch_worker.is_some(), "registered executor");
        }

        Ok(registry)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            parallel: self.config.parallel,
            bail: self.config.bail,
            skip_cache: self.config.skip_cache,
            cache_failures: self.config.cache_failures,
            batch_mode: self.config.batch_mode,
            stream_output: self.config.stream_output,
            initiating_project: self.config.initiating_project.clone(),
        }
    }
}
