// src/engine/state.rs

//! Pure per-run completion state.
//!
//! No Tokio, no IO: the orchestrator feeds results in and gets back the
//! statuses that were actually recorded, which makes the propagation and
//! at-most-once rules easy to test on their own.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::dag::{TaskGraph, TaskId};
use crate::engine::RunOutcome;
use crate::exec::pool::TerminationSignal;
use crate::types::TaskStatus;

#[derive(Debug)]
pub struct RunState {
    order: Vec<TaskId>,
    reverse_deps: HashMap<TaskId, Vec<TaskId>>,
    completed: BTreeMap<TaskId, TaskStatus>,
    exit_codes: BTreeMap<TaskId, i32>,
    bail: bool,
    bailed: bool,
}

impl RunState {
    /// The reverse-dependency map is computed once here; the graph is not
    /// expected to change during a run.
    pub fn new(graph: &TaskGraph, bail: bool) -> Self {
        Self {
            order: graph.ids().cloned().collect(),
            reverse_deps: graph.reverse_dependencies(),
            completed: BTreeMap::new(),
            exit_codes: BTreeMap::new(),
            bail,
            bailed: false,
        }
    }

    /// Record results and propagate failures.
    ///
    /// Only the first status per id is kept. A `failure` or `skipped`
    /// status either sets the bail flag (bail mode) or marks every direct
    /// and transitive dependent as `skipped`.
    ///
    /// Returns every newly recorded `(id, status)`, propagated skips
    /// included, in recording order.
    pub fn complete(&mut self, results: &[(TaskId, TaskStatus)]) -> Vec<(TaskId, TaskStatus)> {
        let mut recorded = Vec::new();
        for (id, status) in results {
            self.complete_one(id, *status, &mut recorded);
        }
        recorded
    }

    fn complete_one(&mut self, id: &TaskId, status: TaskStatus, recorded: &mut Vec<(TaskId, TaskStatus)>) {
        if self.completed.contains_key(id) {
            debug!(task = %id, status = %status, "task already completed; ignoring");
            return;
        }

        self.completed.insert(id.clone(), status);
        recorded.push((id.clone(), status));
        debug!(task = %id, status = %status, "recorded task status");

        if !status.is_failure_or_skip() {
            return;
        }

        if self.bail {
            if !self.bailed {
                info!(task = %id, "bailing: no new work will be dispatched");
            }
            self.bailed = true;
            return;
        }

        let dependents = self.reverse_deps.get(id).cloned().unwrap_or_default();
        for dependent in &dependents {
            self.complete_one(dependent, TaskStatus::Skipped, recorded);
        }
    }

    /// Remember the exit code of an executed task. First write wins.
    pub fn record_exit_code(&mut self, id: &TaskId, code: i32) {
        self.exit_codes.entry(id.clone()).or_insert(code);
    }

    /// Stop dispatching new work regardless of the bail setting.
    pub fn halt(&mut self) {
        self.bailed = true;
    }

    pub fn is_bailed(&self) -> bool {
        self.bailed
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.completed.get(id).copied()
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains_key(id)
    }

    pub fn statuses(&self) -> &BTreeMap<TaskId, TaskStatus> {
        &self.completed
    }

    pub fn outcome(&self, interrupted: Option<TerminationSignal>) -> RunOutcome {
        RunOutcome::new(
            self.completed.clone(),
            self.exit_codes.clone(),
            interrupted,
            self.order.clone(),
        )
    }
}
