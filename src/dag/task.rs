// src/dag/task.rs

//! Tasks and the task graph consumed by the orchestrator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{DagrunError, Result};

/// Canonical task id type used throughout the crate.
pub type TaskId = String;

/// The (project, target, configuration) triple a task was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskTarget {
    pub project: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

impl TaskTarget {
    pub fn new(project: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            target: target.into(),
            configuration: None,
        }
    }

    pub fn with_configuration(mut self, configuration: impl Into<String>) -> Self {
        self.configuration = Some(configuration.into());
        self
    }

    /// Id of the task derived from this target: `project:target[:configuration]`.
    pub fn task_id(&self) -> TaskId {
        match &self.configuration {
            Some(c) => format!("{}:{}:{}", self.project, self.target, c),
            None => format!("{}:{}", self.project, self.target),
        }
    }
}

impl fmt::Display for TaskTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task_id())
    }
}

/// One schedulable unit of work.
///
/// `hash` is filled in by the schedule right before the task (or the batch
/// containing it) is handed out; `start_time` / `end_time` are stamped by the
/// orchestrator or reported by batch workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub target: TaskTarget,
    pub executor: String,
    #[serde(default)]
    pub overrides: BTreeMap<String, serde_json::Value>,
    /// Project root, relative to the workspace root.
    #[serde(default)]
    pub project_root: PathBuf,
    /// Declared output paths, relative to the workspace root.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Input globs, relative to the project root.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Per-task cache opt-out (`Some(false)`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(target: TaskTarget, executor: impl Into<String>) -> Self {
        Self {
            id: target.task_id(),
            target,
            executor: executor.into(),
            overrides: BTreeMap::new(),
            project_root: PathBuf::new(),
            outputs: Vec::new(),
            inputs: Vec::new(),
            cache: None,
            hash: None,
            start_time: None,
            end_time: None,
        }
    }

    /// Serve-like tasks that never finish on their own are never cached and
    /// always stream their output.
    pub fn is_long_running(&self) -> bool {
        let watch = matches!(self.overrides.get("watch"), Some(serde_json::Value::Bool(true)));
        watch || matches!(self.target.target.as_str(), "serve" | "dev" | "start")
    }

    /// Human-readable command line used in terminal headers.
    pub fn printable_command(&self) -> String {
        let mut cmd = format!("dagrun run {}", self.target);
        for (key, value) in &self.overrides {
            match value {
                serde_json::Value::String(s) => cmd.push_str(&format!(" --{key}={s}")),
                other => cmd.push_str(&format!(" --{key}={other}")),
            }
        }
        cmd
    }
}

/// Directed acyclic graph of tasks.
///
/// `dependencies[id]` lists the ids `id` depends on; `roots` are the tasks
/// with no dependencies inside this graph. Declaration order is preserved
/// and used for deterministic iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub roots: Vec<TaskId>,
    pub tasks: BTreeMap<TaskId, Task>,
    pub dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    #[serde(default)]
    order: Vec<TaskId>,
}

impl TaskGraph {
    /// Build a graph from tasks in declaration order and their dependency
    /// lists.
    ///
    /// Every referenced dependency must be one of `tasks`; duplicates are
    /// dropped. Acyclicity is the caller's responsibility.
    pub fn new<I>(tasks: Vec<Task>, dependencies: I) -> Result<Self>
    where
        I: IntoIterator<Item = (TaskId, Vec<TaskId>)>,
    {
        let mut deps_by_id: HashMap<TaskId, Vec<TaskId>> = dependencies.into_iter().collect();

        let mut order = Vec::with_capacity(tasks.len());
        let mut task_map = BTreeMap::new();
        for task in tasks {
            if task_map.contains_key(&task.id) {
                return Err(DagrunError::ConfigError(format!(
                    "task '{}' is declared more than once",
                    task.id
                )));
            }
            order.push(task.id.clone());
            task_map.insert(task.id.clone(), task);
        }

        if let Some(unknown) = deps_by_id.keys().find(|id| !task_map.contains_key(*id)) {
            return Err(DagrunError::TaskNotFound(unknown.clone()));
        }

        let mut dep_map = BTreeMap::new();
        for id in &order {
            let mut seen = HashSet::new();
            let mut deps = Vec::new();
            for dep in deps_by_id.remove(id).unwrap_or_default() {
                if !task_map.contains_key(&dep) {
                    return Err(DagrunError::ConfigError(format!(
                        "task '{id}' depends on unknown task '{dep}'"
                    )));
                }
                if seen.insert(dep.clone()) {
                    deps.push(dep);
                }
            }
            dep_map.insert(id.clone(), deps);
        }

        Ok(Self::from_parts(order, task_map, dep_map))
    }

    /// Assemble a graph whose invariants the caller already guarantees and
    /// recompute its roots.
    pub(crate) fn from_parts(
        order: Vec<TaskId>,
        tasks: BTreeMap<TaskId, Task>,
        dependencies: BTreeMap<TaskId, Vec<TaskId>>,
    ) -> Self {
        let roots = order
            .iter()
            .filter(|id| dependencies.get(*id).is_none_or(|d| d.is_empty()))
            .cloned()
            .collect();
        Self {
            roots,
            tasks,
            dependencies,
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Task ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter()
    }

    /// Tasks in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Immediate dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> &[TaskId] {
        self.dependencies
            .get(id)
            .map(|d| d.as_slice())
            .unwrap_or(&[])
    }

    /// Map of task id to the tasks that directly depend on it, each list in
    /// declaration order.
    pub fn reverse_dependencies(&self) -> HashMap<TaskId, Vec<TaskId>> {
        let mut reverse: HashMap<TaskId, Vec<TaskId>> =
            self.order.iter().map(|id| (id.clone(), Vec::new())).collect();

        for id in &self.order {
            for dep in self.dependencies_of(id) {
                if let Some(list) = reverse.get_mut(dep) {
                    list.push(id.clone());
                }
            }
        }

        reverse
    }

    /// Copy of this graph with `ids` removed, dangling dependency edges
    /// dropped and roots recomputed.
    pub fn without_tasks<'a, I>(&self, ids: I) -> TaskGraph
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let removed: HashSet<&TaskId> = ids.into_iter().collect();

        let order: Vec<TaskId> = self
            .order
            .iter()
            .filter(|id| !removed.contains(id))
            .cloned()
            .collect();

        let tasks = order
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| (id.clone(), t.clone())))
            .collect();

        let dependencies = order
            .iter()
            .map(|id| {
                let deps = self
                    .dependencies_of(id)
                    .iter()
                    .filter(|d| !removed.contains(d))
                    .cloned()
                    .collect();
                (id.clone(), deps)
            })
            .collect();

        TaskGraph::from_parts(order, tasks, dependencies)
    }
}
