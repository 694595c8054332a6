// src/engine/mod.rs

//! Orchestration engine.
//!
//! The pure completion state lives in [`state`]; the async shell that runs
//! the worker slots is [`orchestrator`].

use std::collections::BTreeMap;

use crate::dag::TaskId;
use crate::exec::pool::TerminationSignal;
use crate::types::TaskStatus;

pub mod orchestrator;
pub mod state;

pub use orchestrator::TaskOrchestrator;
pub use state::RunState;

/// Run-wide options for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Number of concurrent execution slots. Must be at least 1.
    pub parallel: usize,
    /// Stop dispatching new work after the first failure.
    pub bail: bool,
    /// Neither read nor write the result cache.
    pub skip_cache: bool,
    /// Also persist results with a non-zero exit code.
    pub cache_failures: bool,
    /// Group ready tasks of batch-capable executors into batches.
    pub batch_mode: bool,
    /// Stream every task's output live.
    pub stream_output: bool,
    /// Project the user asked to run; its tasks stream live.
    pub initiating_project: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            parallel: 3,
            bail: false,
            skip_cache: false,
            cache_failures: false,
            batch_mode: true,
            stream_output: false,
            initiating_project: None,
        }
    }
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Status of every task that reached one. Tasks never dispatched
    /// because of a bail are absent.
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    /// Exit codes of executed tasks.
    pub exit_codes: BTreeMap<TaskId, i32>,
    /// Signal that interrupted the run, if any.
    pub interrupted: Option<TerminationSignal>,
    order: Vec<TaskId>,
}

impl RunOutcome {
    pub(crate) fn new(
        statuses: BTreeMap<TaskId, TaskStatus>,
        exit_codes: BTreeMap<TaskId, i32>,
        interrupted: Option<TerminationSignal>,
        order: Vec<TaskId>,
    ) -> Self {
        Self {
            statuses,
            exit_codes,
            interrupted,
            order,
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.statuses.get(id).copied()
    }

    pub fn has_failures(&self) -> bool {
        self.statuses.values().any(|s| *s == TaskStatus::Failure)
    }

    /// Process exit code for the run.
    ///
    /// `128 + N` when interrupted by signal N; otherwise the exit code of
    /// the first failed task in declaration order (1 if it has none), or 0.
    pub fn exit_code(&self) -> i32 {
        if let Some(signal) = self.interrupted {
            return signal.exit_code();
        }

        self.order
            .iter()
            .find(|id| self.status(id) == Some(TaskStatus::Failure))
            .map(|id| {
                self.exit_codes
                    .get(id)
                    .copied()
                    .filter(|code| *code != 0)
                    .unwrap_or(1)
            })
            .unwrap_or(0)
    }
}
