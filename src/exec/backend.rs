// src/exec/backend.rs

//! Pluggable worker abstraction.
//!
//! The orchestrator talks to a [`TaskWorker`] instead of spawning processes
//! itself. Production code uses
//! [`WorkerProcessManager`](super::process::WorkerProcessManager); tests can
//! provide a fake that records invocations and scripts outcomes.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use crate::dag::{Batch, Task, TaskGraph};
use crate::errors::Result;
use crate::exec::messages::BatchResults;
use crate::types::OutputCapture;

/// Boxed future returned by [`TaskWorker`] methods.
pub type WorkerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How to run a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleRunOptions {
    pub capture: OutputCapture,
    pub stream_output: bool,
    /// Scratch file for the task's terminal output.
    pub temporary_output_path: PathBuf,
}

/// Exit code and captured output of a single task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunOutput {
    pub code: i32,
    pub terminal_output: String,
}

/// Trait abstracting how units of work are executed.
///
/// An `Err` means the unit could not be run at all (spawn failure, broken
/// worker); the orchestrator converts it into `failure` statuses.
pub trait TaskWorker: Send + Sync {
    /// Run one task to completion.
    fn run_task<'a>(&'a self, task: &'a Task, opts: SingleRunOptions) -> WorkerFuture<'a, TaskRunOutput>;

    /// Run a batch in one worker. The result may cover only part of the
    /// batch; missing ids are still pending.
    fn run_batch<'a>(&'a self, batch: &'a Batch, full_graph: &'a TaskGraph) -> WorkerFuture<'a, BatchResults>;
}
