// src/exec/messages.rs

//! Control-plane messages exchanged with batch workers.
//!
//! Each message is one JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"run_tasks","executor_name":"jest","batch_task_graph":{..},"full_task_graph":{..}}
//! {"type":"complete_task","task":"app:test","result":{"success":true}}
//! {"type":"complete_batch_execution","results":{"app:test":{"success":true}}}
//! {"type":"stdout","message":"..."}
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{TaskGraph, TaskId};

/// Outcome of one task as reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ExecutorResult {
    pub fn success() -> Self {
        Self {
            success: true,
            terminal_output: None,
            start_time: None,
            end_time: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            ..Self::success()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.terminal_output = Some(output.into());
        self
    }
}

/// Per-task results of one batch invocation, keyed by task id.
pub type BatchResults = BTreeMap<TaskId, ExecutorResult>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Parent → worker: run the batch.
    RunTasks {
        executor_name: String,
        batch_task_graph: TaskGraph,
        full_task_graph: TaskGraph,
    },
    /// Worker → parent: one task finished.
    CompleteTask { task: TaskId, result: ExecutorResult },
    /// Worker → parent: the whole batch finished. Sent once, last.
    CompleteBatchExecution { results: BatchResults },
    /// Worker → parent: a log line to forward.
    Stdout { message: String },
    Stderr { message: String },
}

impl WorkerMessage {
    /// Parse one line of worker output. `None` means "not a protocol
    /// message", to be forwarded verbatim.
    pub fn parse_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
