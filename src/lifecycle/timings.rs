// src/lifecycle/timings.rs

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::dag::{Task, TaskId};
use crate::lifecycle::{LifeCycle, TaskMetadata, TaskRunResult};

#[derive(Debug, Clone, Copy)]
struct Timing {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
}

/// Prints a JSON map of task id to duration in milliseconds when the
/// command ends. Tasks that never ended map to `null`.
pub struct TaskTimingsLifeCycle {
    timings: Mutex<BTreeMap<TaskId, Timing>>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl Default for TaskTimingsLifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTimingsLifeCycle {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            timings: Mutex::new(BTreeMap::new()),
            out: Mutex::new(out),
        }
    }

    /// Durations recorded so far.
    pub fn durations(&self) -> BTreeMap<TaskId, Option<i64>> {
        let timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        timings
            .iter()
            .map(|(id, t)| (id.clone(), t.end.map(|end| (end - t.start).num_milliseconds())))
            .collect()
    }
}

impl LifeCycle for TaskTimingsLifeCycle {
    fn start_tasks(&self, tasks: &[Task], _metadata: TaskMetadata) {
        let now = Utc::now();
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        for t in tasks {
            timings.insert(t.id.clone(), Timing { start: now, end: None });
        }
    }

    fn end_tasks(&self, results: &[TaskRunResult], _metadata: TaskMetadata) {
        let now = Utc::now();
        let mut timings = self.timings.lock().unwrap_or_else(|e| e.into_inner());
        for r in results {
            let timing = timings
                .entry(r.task.id.clone())
                .or_insert(Timing { start: now, end: None });
            if let Some(start) = r.task.start_time {
                timing.start = start;
            }
            timing.end = Some(r.task.end_time.unwrap_or(now));
        }
    }

    fn end_command(&self) {
        let durations = self.durations();
        if let Ok(json) = serde_json::to_string_pretty(&durations) {
            let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
            let _ = writeln!(out, "{json}");
            let _ = out.flush();
        }
    }
}
