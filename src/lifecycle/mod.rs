// src/lifecycle/mod.rs

//! Run observers.
//!
//! The orchestrator reports what happens through a [`LifeCycle`]; it never
//! reads anything back. Every method has a no-op default so observers only
//! implement the events they care about.

pub mod profiling;
pub mod static_output;
pub mod timings;

use std::sync::Arc;

use crate::dag::Task;
use crate::types::TaskStatus;

pub use profiling::TaskProfilingLifeCycle;
pub use static_output::StaticRunTerminalOutputLifeCycle;
pub use timings::TaskTimingsLifeCycle;

/// Final result of one task, as reported to `end_tasks`.
#[derive(Debug, Clone)]
pub struct TaskRunResult {
    pub task: Task,
    pub status: TaskStatus,
    pub code: i32,
    pub terminal_output: Option<String>,
}

/// Which execution slot ran a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskMetadata {
    pub group_id: usize,
}

pub trait LifeCycle: Send + Sync {
    fn start_command(&self) {}

    fn end_command(&self) {}

    fn start_tasks(&self, _tasks: &[Task], _metadata: TaskMetadata) {}

    fn end_tasks(&self, _results: &[TaskRunResult], _metadata: TaskMetadata) {}

    fn print_task_terminal_output(&self, _task: &Task, _status: TaskStatus, _output: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyLifeCycle;

impl LifeCycle for EmptyLifeCycle {}

/// Fans every event out to a list of observers, in order.
#[derive(Clone, Default)]
pub struct CompositeLifeCycle {
    life_cycles: Vec<Arc<dyn LifeCycle>>,
}

impl CompositeLifeCycle {
    pub fn new(life_cycles: Vec<Arc<dyn LifeCycle>>) -> Self {
        Self { life_cycles }
    }

    pub fn push(&mut self, life_cycle: Arc<dyn LifeCycle>) {
        self.life_cycles.push(life_cycle);
    }

    pub fn len(&self) -> usize {
        self.life_cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.life_cycles.is_empty()
    }
}

impl LifeCycle for CompositeLifeCycle {
    fn start_command(&self) {
        for l in &self.life_cycles {
            l.start_command();
        }
    }

    fn end_command(&self) {
        for l in &self.life_cycles {
            l.end_command();
        }
    }

    fn start_tasks(&self, tasks: &[Task], metadata: TaskMetadata) {
        for l in &self.life_cycles {
            l.start_tasks(tasks, metadata);
        }
    }

    fn end_tasks(&self, results: &[TaskRunResult], metadata: TaskMetadata) {
        for l in &self.life_cycles {
            l.end_tasks(results, metadata);
        }
    }

    fn print_task_terminal_output(&self, task: &Task, status: TaskStatus, output: &str) {
        for l in &self.life_cycles {
            l.print_task_terminal_output(task, status, output);
        }
    }
}
