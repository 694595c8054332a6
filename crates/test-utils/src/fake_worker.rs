use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dagrun::dag::{Batch, Task, TaskGraph, TaskId};
use dagrun::errors::DagrunError;
use dagrun::exec::{
    BatchResults, ExecutorResult, SingleRunOptions, TaskRunOutput, TaskWorker, WorkerFuture,
};

/// Scripted result for one task.
#[derive(Debug, Clone)]
pub struct FakeOutcome {
    pub code: i32,
    pub output: String,
    pub delay: Option<Duration>,
    /// Running the task fails before it starts.
    pub spawn_error: bool,
}

impl Default for FakeOutcome {
    fn default() -> Self {
        Self {
            code: 0,
            output: String::new(),
            delay: None,
            spawn_error: false,
        }
    }
}

/// One call into the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Task { id: TaskId, opts: SingleRunOptions },
    Batch { executor: String, ids: Vec<TaskId> },
}

type Hook = Arc<dyn Fn(&Task) + Send + Sync>;

#[derive(Default)]
struct State {
    outcomes: HashMap<TaskId, FakeOutcome>,
    invocations: Vec<Invocation>,
    executed: Vec<TaskId>,
    /// Max tasks reported per batch invocation.
    batch_limit: Option<usize>,
    failing_batches: Vec<String>,
}

/// A fake worker that:
/// - records every task and batch it is asked to run
/// - returns scripted codes and output (success with empty output by default)
/// - can report batches partially or fail to start them
/// - tracks the highest number of units running at once
#[derive(Clone, Default)]
pub struct FakeWorker {
    state: Arc<Mutex<State>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    hook: Option<Hook>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outcome(self, id: &str, outcome: FakeOutcome) -> Self {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .insert(id.to_string(), outcome);
        self
    }

    pub fn failing(self, id: &str, code: i32) -> Self {
        self.with_outcome(
            id,
            FakeOutcome {
                code,
                ..FakeOutcome::default()
            },
        )
    }

    pub fn with_output(self, id: &str, output: &str) -> Self {
        self.with_outcome(
            id,
            FakeOutcome {
                output: output.to_string(),
                ..FakeOutcome::default()
            },
        )
    }

    pub fn with_delay(self, id: &str, delay: Duration) -> Self {
        self.with_outcome(
            id,
            FakeOutcome {
                delay: Some(delay),
                ..FakeOutcome::default()
            },
        )
    }

    pub fn with_spawn_error(self, id: &str) -> Self {
        self.with_outcome(
            id,
            FakeOutcome {
                spawn_error: true,
                ..FakeOutcome::default()
            },
        )
    }

    /// Report at most `limit` tasks per batch invocation.
    pub fn with_batch_limit(self, limit: usize) -> Self {
        self.state.lock().unwrap().batch_limit = Some(limit);
        self
    }

    /// Batches of `executor` fail to start.
    pub fn with_failing_batches(self, executor: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_batches
            .push(executor.to_string());
        self
    }

    /// Called for every task the worker actually runs, e.g. to write output
    /// files.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    /// Ids of tasks run so far, in completion order.
    pub fn executed(&self) -> Vec<TaskId> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn run_count(&self, id: &str) -> usize {
        self.executed().iter().filter(|e| *e == id).count()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn outcome_for(&self, id: &str) -> FakeOutcome {
        self.state
            .lock()
            .unwrap()
            .outcomes
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn record_executed(&self, task: &Task) {
        if let Some(hook) = &self.hook {
            hook(task);
        }
        self.state.lock().unwrap().executed.push(task.id.clone());
    }
}

impl TaskWorker for FakeWorker {
    fn run_task<'a>(&'a self, task: &'a Task, opts: SingleRunOptions) -> WorkerFuture<'a, TaskRunOutput> {
        Box::pin(async move {
            self.state.lock().unwrap().invocations.push(Invocation::Task {
                id: task.id.clone(),
                opts,
            });

            let outcome = self.outcome_for(&task.id);
            if outcome.spawn_error {
                return Err(DagrunError::WorkerError(format!(
                    "failed to spawn '{}'",
                    task.id
                )));
            }

            self.enter();
            if let Some(delay) = outcome.delay {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }
            self.record_executed(task);
            self.exit();

            Ok(TaskRunOutput {
                code: outcome.code,
                terminal_output: outcome.output,
            })
        })
    }

    fn run_batch<'a>(&'a self, batch: &'a Batch, _full_graph: &'a TaskGraph) -> WorkerFuture<'a, BatchResults> {
        Box::pin(async move {
            let ids: Vec<TaskId> = batch.task_graph.ids().cloned().collect();
            let (limit, fails) = {
                let mut state = self.state.lock().unwrap();
                state.invocations.push(Invocation::Batch {
                    executor: batch.executor_name.clone(),
                    ids: ids.clone(),
                });
                (
                    state.batch_limit,
                    state.failing_batches.contains(&batch.executor_name),
                )
            };
            if fails {
                return Err(DagrunError::WorkerError(format!(
                    "\"{}\" exited unexpectedly with code: 1",
                    batch.executor_name
                )));
            }

            self.enter();
            tokio::task::yield_now().await;

            let mut results = BTreeMap::new();
            for task in batch.task_graph.iter().take(limit.unwrap_or(usize::MAX)) {
                let outcome = self.outcome_for(&task.id);
                if let Some(delay) = outcome.delay {
                    tokio::time::sleep(delay).await;
                }
                self.record_executed(task);
                let result = if outcome.code == 0 {
                    ExecutorResult::success()
                } else {
                    ExecutorResult::failure()
                };
                results.insert(task.id.clone(), result.with_output(outcome.output));
            }

            self.exit();
            Ok(results)
        })
    }
}
