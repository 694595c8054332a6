#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use dagrun::config::{ConfigFile, ConfigSection, ExecutorConfig, RawConfigFile, TaskConfig};
use dagrun::dag::{Task, TaskGraph, TaskTarget};
use dagrun::exec::{CommandBatchExecutor, ExecutorRegistry, ShellExecutor};
use dagrun::types::OutputCapture;

/// Builder for a single `Task` plus its dependency list.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    task: Task,
    after: Vec<String>,
}

impl TaskBuilder {
    /// `id` is `project:target[:configuration]`. The executor defaults to
    /// `shell` with `options.command = "true"`.
    pub fn new(id: &str) -> Self {
        let mut parts = id.splitn(3, ':');
        let project = parts.next().unwrap_or(id);
        let target = parts.next().unwrap_or("build");
        let mut target = TaskTarget::new(project, target);
        if let Some(configuration) = parts.next() {
            target = target.with_configuration(configuration);
        }

        let mut task = Task::new(target, "shell");
        task.id = id.to_string();
        task.overrides
            .insert("command".to_string(), serde_json::Value::String("true".to_string()));
        Self {
            task,
            after: Vec::new(),
        }
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.after.push(dep.to_string());
        self
    }

    pub fn executor(mut self, name: &str) -> Self {
        self.task.executor = name.to_string();
        self
    }

    pub fn command(mut self, command: &str) -> Self {
        self.task.overrides.insert(
            "command".to_string(),
            serde_json::Value::String(command.to_string()),
        );
        self
    }

    pub fn option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.task.overrides.insert(key.to_string(), value);
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.task.outputs.push(path.to_string());
        self
    }

    pub fn input(mut self, glob: &str) -> Self {
        self.task.inputs.push(glob.to_string());
        self
    }

    pub fn project_root(mut self, root: &str) -> Self {
        self.task.project_root = PathBuf::from(root);
        self
    }

    pub fn cache(mut self, val: bool) -> Self {
        self.task.cache = Some(val);
        self
    }

    pub fn hash(mut self, hash: &str) -> Self {
        self.task.hash = Some(hash.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for a `TaskGraph`; tasks keep the order they are added in.
#[derive(Debug, Clone, Default)]
pub struct TaskGraphBuilder {
    tasks: Vec<TaskBuilder>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_task(mut self, task: TaskBuilder) -> Self {
        self.tasks.push(task);
        self
    }

    /// Shorthand for a default shell task with dependencies.
    pub fn task(self, id: &str, after: &[&str]) -> Self {
        let mut builder = TaskBuilder::new(id);
        for dep in after {
            builder = builder.after(dep);
        }
        self.with_task(builder)
    }

    pub fn build(self) -> TaskGraph {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut dependencies = Vec::with_capacity(self.tasks.len());
        for builder in self.tasks {
            dependencies.push((builder.task.id.clone(), builder.after));
            tasks.push(builder.task);
        }
        TaskGraph::new(tasks, dependencies).expect("Failed to build valid task graph from builder")
    }
}

/// Builder for an `ExecutorRegistry` on top of the built-ins.
#[derive(Debug)]
pub struct RegistryBuilder {
    registry: ExecutorRegistry,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            registry: ExecutorRegistry::with_builtins(),
        }
    }

    /// Single-task executor running `options.command` through the shell.
    pub fn executor(mut self, name: &str, cacheable: bool, capture: OutputCapture) -> Self {
        self.registry.register(name, ShellExecutor, cacheable, capture);
        self
    }

    /// Batch-capable executor whose worker is `worker` (a shell command).
    pub fn batch_executor(mut self, name: &str, worker: &str) -> Self {
        self.registry
            .register(name, ShellExecutor, true, OutputCapture::Pipe);
        self.registry
            .register_batch(name, CommandBatchExecutor::new(worker))
            .expect("batch executor registers after its single-task half");
        self
    }

    pub fn build(self) -> ExecutorRegistry {
        self.registry
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ConfigFile` to simplify config tests.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                config: ConfigSection::default(),
                executor: BTreeMap::new(),
                task: BTreeMap::new(),
                task_order: Vec::new(),
            },
        }
    }

    /// Shell task with `options.command = command`.
    pub fn with_shell_task(mut self, id: &str, command: &str, after: &[&str]) -> Self {
        let mut task = TaskConfig::default();
        task.options
            .insert("command".to_string(), toml::Value::String(command.to_string()));
        task.after = after.iter().map(|s| s.to_string()).collect();
        self.config.task_order.push(id.to_string());
        self.config.task.insert(id.to_string(), task);
        self
    }

    pub fn with_task(mut self, id: &str, task: TaskConfig) -> Self {
        self.config.task_order.push(id.to_string());
        self.config.task.insert(id.to_string(), task);
        self
    }

    pub fn with_executor(mut self, name: &str, executor: ExecutorConfig) -> Self {
        self.config.executor.insert(name.to_string(), executor);
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.config.config.parallel = parallel;
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
