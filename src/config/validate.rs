// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, ConfigSection, RawConfigFile};
use crate::config::resolve::task_target;
use crate::errors::{DagrunError, Result};
use crate::exec::executor::SHELL_EXECUTOR;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = DagrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let order = declaration_order(&raw);
        Ok(ConfigFile::new_unchecked(raw.config, raw.executor, raw.task, order))
    }
}

/// Run every check against an already-validated config again.
///
/// Useful after CLI or environment overrides were applied to `config`.
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    validate_global_config(&cfg.config)
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_tasks(cfg)?;
    validate_global_config(&cfg.config)?;
    validate_task_ids(cfg)?;
    validate_executors(cfg)?;
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    Ok(())
}

fn ensure_has_tasks(cfg: &RawConfigFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(DagrunError::ConfigError(
            "config must contain at least one [task.\"<id>\"] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &ConfigSection) -> Result<()> {
    if cfg.parallel == 0 {
        return Err(DagrunError::ConfigError(
            "[config].parallel must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.max_cache_age_days == 0 {
        return Err(DagrunError::ConfigError(
            "[config].max_cache_age_days must be >= 1 (got 0)".to_string(),
        ));
    }

    Ok(())
}

/// Every task needs a project and a target, either explicit or from its id.
fn validate_task_ids(cfg: &RawConfigFile) -> Result<()> {
    for (id, task) in cfg.task.iter() {
        if id.trim().is_empty() {
            return Err(DagrunError::ConfigError(
                "task ids must not be empty".to_string(),
            ));
        }
        if task_target(id, task).is_none() {
            return Err(DagrunError::ConfigError(format!(
                "task '{id}' needs `project` and `target`, or an id of the form project:target"
            )));
        }
    }
    Ok(())
}

fn validate_executors(cfg: &RawConfigFile) -> Result<()> {
    for (name, executor) in cfg.executor.iter() {
        if name == SHELL_EXECUTOR && executor.batch_worker.is_some() {
            return Err(DagrunError::ConfigError(format!(
                "the built-in '{SHELL_EXECUTOR}' executor cannot have a batch worker"
            )));
        }
        if let Some(worker) = &executor.batch_worker {
            if worker.trim().is_empty() {
                return Err(DagrunError::ConfigError(format!(
                    "executor '{name}' has an empty `batch_worker`"
                )));
            }
        }
    }

    for (id, task) in cfg.task.iter() {
        let executor = task.executor.as_deref().unwrap_or(SHELL_EXECUTOR);
        if executor != SHELL_EXECUTOR && !cfg.executor.contains_key(executor) {
            return Err(DagrunError::UnknownExecutor {
                task: id.clone(),
                executor: executor.to_string(),
            });
        }
        // Batch workers get the task through the protocol; everything else
        // runs `options.command` in a shell.
        let runs_command = cfg
            .executor
            .get(executor)
            .is_none_or(|e| e.batch_worker.is_none());
        if runs_command && !task.options.contains_key("command") {
            return Err(DagrunError::ConfigError(format!(
                "task '{id}' uses the '{executor}' executor but has no `options.command`"
            )));
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (id, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            if !cfg.task.contains_key(dep) {
                return Err(DagrunError::ConfigError(format!(
                    "task '{}' has unknown dependency '{}' in `after`",
                    id, dep
                )));
            }
            if dep == id {
                return Err(DagrunError::ConfigError(format!(
                    "task '{}' cannot depend on itself in `after`",
                    id
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for id in cfg.task.keys() {
        graph.add_node(id.as_str());
    }

    for (id, task) in cfg.task.iter() {
        for dep in task.after.iter() {
            graph.add_edge(dep.as_str(), id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => {
            let node = cycle.node_id();
            Err(DagrunError::DagCycle(format!(
                "cycle detected in task graph involving task '{}'",
                node
            )))
        }
    }
}

fn declaration_order(cfg: &RawConfigFile) -> Vec<String> {
    let mut order: Vec<String> = Vec::with_capacity(cfg.task.len());
    for id in &cfg.task_order {
        if cfg.task.contains_key(id) && !order.contains(id) {
            order.push(id.clone());
        }
    }
    for id in cfg.task.keys() {
        if !order.contains(id) {
            order.push(id.clone());
        }
    }
    order
}
