// src/lifecycle/profiling.rs

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{Value, json};
use tracing::{info, warn};

use crate::dag::{Task, TaskId};
use crate::lifecycle::{LifeCycle, TaskMetadata, TaskRunResult};

#[derive(Default)]
struct Profile {
    starts: HashMap<TaskId, f64>,
    events: Vec<Value>,
    groups: HashSet<usize>,
}

/// Writes a Chrome trace (`chrome://tracing`, Perfetto) of the run, with
/// one thread row per execution slot.
pub struct TaskProfilingLifeCycle {
    path: PathBuf,
    origin: Instant,
    profile: Mutex<Profile>,
}

impl TaskProfilingLifeCycle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin: Instant::now(),
            profile: Mutex::new(Profile::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Microseconds since the observer was created.
    fn now_us(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1_000_000.0
    }

    /// Trace events recorded so far.
    pub fn events(&self) -> Vec<Value> {
        let profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());
        profile.events.clone()
    }
}

impl LifeCycle for TaskProfilingLifeCycle {
    fn start_tasks(&self, tasks: &[Task], metadata: TaskMetadata) {
        let now = self.now_us();
        let mut profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());

        if profile.groups.insert(metadata.group_id) {
            profile.events.push(json!({
                "name": "thread_name",
                "ph": "M",
                "pid": std::process::id(),
                "tid": metadata.group_id,
                "ts": 0,
                "args": { "name": format!("Group #{}", metadata.group_id + 1) },
            }));
        }
        for t in tasks {
            profile.starts.insert(t.id.clone(), now);
        }
    }

    fn end_tasks(&self, results: &[TaskRunResult], metadata: TaskMetadata) {
        let now = self.now_us();
        let mut profile = self.profile.lock().unwrap_or_else(|e| e.into_inner());

        for r in results {
            let start = profile.starts.get(&r.task.id).copied().unwrap_or(now);
            profile.events.push(json!({
                "name": r.task.id,
                "cat": r.task.target.task_id().replace(':', ","),
                "ph": "X",
                "ts": start,
                "dur": (now - start).max(0.0),
                "pid": std::process::id(),
                "tid": metadata.group_id,
                "args": {
                    "target": r.task.target,
                    "status": r.status,
                },
            }));
        }
    }

    fn end_command(&self) {
        let events = self.events();
        let written = serde_json::to_vec_pretty(&events)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, bytes)?;
                Ok(())
            });

        match written {
            Ok(()) => info!(path = ?self.path, "wrote performance profile"),
            Err(err) => warn!(path = ?self.path, error = %format!("{err:#}"), "failed to write performance profile"),
        }
    }
}
