use std::sync::Mutex;

use dagrun::dag::{Task, TaskId};
use dagrun::lifecycle::{LifeCycle, TaskMetadata, TaskRunResult};
use dagrun::types::TaskStatus;

/// One observed lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum LifeCycleEvent {
    StartCommand,
    EndCommand,
    StartTasks { ids: Vec<TaskId>, group_id: usize },
    EndTask { id: TaskId, status: TaskStatus, code: i32, group_id: usize },
    PrintOutput { id: TaskId, status: TaskStatus, output: String },
}

/// Lifecycle observer that records every event.
#[derive(Debug, Default)]
pub struct RecordingLifeCycle {
    events: Mutex<Vec<LifeCycleEvent>>,
}

impl RecordingLifeCycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifeCycleEvent> {
        self.events.lock().unwrap().clone()
    }

    /// `(id, status, code)` of every `end_tasks` entry, in order.
    pub fn ended(&self) -> Vec<(TaskId, TaskStatus, i32)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LifeCycleEvent::EndTask { id, status, code, .. } => Some((id, status, code)),
                _ => None,
            })
            .collect()
    }

    pub fn end_count(&self, id: &str) -> usize {
        self.ended().iter().filter(|(e, _, _)| e == id).count()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.ended()
            .into_iter()
            .find(|(e, _, _)| e == id)
            .map(|(_, status, _)| status)
    }

    pub fn group_ids(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LifeCycleEvent::StartTasks { group_id, .. } => Some(group_id),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: LifeCycleEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl LifeCycle for RecordingLifeCycle {
    fn start_command(&self) {
        self.push(LifeCycleEvent::StartCommand);
    }

    fn end_command(&self) {
        self.push(LifeCycleEvent::EndCommand);
    }

    fn start_tasks(&self, tasks: &[Task], metadata: TaskMetadata) {
        self.push(LifeCycleEvent::StartTasks {
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
            group_id: metadata.group_id,
        });
    }

    fn end_tasks(&self, results: &[TaskRunResult], metadata: TaskMetadata) {
        for r in results {
            self.push(LifeCycleEvent::EndTask {
                id: r.task.id.clone(),
                status: r.status,
                code: r.code,
                group_id: metadata.group_id,
            });
        }
    }

    fn print_task_terminal_output(&self, task: &Task, status: TaskStatus, output: &str) {
        self.push(LifeCycleEvent::PrintOutput {
            id: task.id.clone(),
            status,
            output: output.to_string(),
        });
    }
}
