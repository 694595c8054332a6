// src/exec/mod.rs

//! Process execution layer.
//!
//! - [`executor`] holds the executor capability traits and the name →
//!   implementation registry.
//! - [`messages`] defines the line protocol spoken with batch workers.
//! - [`env`] builds child environments (dotenv files, identity variables).
//! - [`output`] renders live output prefixes and command headers.
//! - [`pool`] tracks live children and fans out termination signals.
//! - [`process`] runs tasks and batches as OS processes.
//! - [`backend`] provides the [`TaskWorker`] seam the orchestrator runs
//!   against, which tests replace with a fake.

pub mod backend;
pub mod env;
pub mod executor;
pub mod messages;
pub mod output;
pub mod pool;
pub mod process;

pub use backend::{SingleRunOptions, TaskRunOutput, TaskWorker, WorkerFuture};
pub use executor::{
    BatchExecutor, CommandBatchExecutor, Executor, ExecutorContext, ExecutorMetadata,
    ExecutorRegistry, ProcessCommand, SHELL_EXECUTOR, ShellExecutor,
};
pub use messages::{BatchResults, ExecutorResult, WorkerMessage};
pub use pool::{TerminationSignal, WorkerPool, wait_for_termination_signal};
pub use process::{ProcessState, WorkerProcessManager};
