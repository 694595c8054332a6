// src/engine/orchestrator.rs

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::{OutputsCoordinator, ResultCache, TaskHasher};
use crate::dag::{Batch, Task, TaskGraph, TaskId, TaskSchedule};
use crate::engine::{RunOptions, RunOutcome, RunState};
use crate::errors::{DagrunError, Result};
use crate::exec::backend::{SingleRunOptions, TaskWorker};
use crate::exec::executor::ExecutorRegistry;
use crate::exec::pool::{TerminationSignal, WorkerPool};
use crate::lifecycle::{EmptyLifeCycle, LifeCycle, TaskMetadata, TaskRunResult};
use crate::types::{OutputCapture, TaskStatus};

/// Everything the slots share, behind one mutex.
struct Shared {
    schedule: TaskSchedule,
    state: RunState,
    in_flight: usize,
    interrupted: Option<TerminationSignal>,
}

enum Dequeued {
    Done,
    Batch(Batch),
    Task(Task),
    Wait,
}

/// Top-level run loop.
///
/// `parallel` slots run the same loop concurrently: dequeue a batch or a
/// task, replay it from the cache or hand it to the [`TaskWorker`], record
/// the results, wake the other slots. Slots only communicate through the
/// shared schedule and completion state.
pub struct TaskOrchestrator<W: TaskWorker> {
    graph: Arc<TaskGraph>,
    registry: Arc<ExecutorRegistry>,
    worker: W,
    cache: ResultCache,
    outputs: Option<Arc<dyn OutputsCoordinator>>,
    lifecycle: Arc<dyn LifeCycle>,
    options: RunOptions,
    pool: WorkerPool,
    shared: Mutex<Shared>,
    wake: Notify,
}

impl<W: TaskWorker> fmt::Debug for TaskOrchestrator<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskOrchestrator")
            .field("tasks", &self.graph.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<W: TaskWorker> TaskOrchestrator<W> {
    /// Build an orchestrator for `graph`.
    ///
    /// Fails if a task names an unknown executor or `parallel` is zero.
    pub fn new(
        graph: Arc<TaskGraph>,
        registry: Arc<ExecutorRegistry>,
        hasher: Arc<dyn TaskHasher>,
        worker: W,
        cache: ResultCache,
        options: RunOptions,
    ) -> Result<Self> {
        if options.parallel == 0 {
            return Err(DagrunError::ConfigError(
                "parallel must be at least 1".to_string(),
            ));
        }
        registry.validate_graph(&graph)?;

        let schedule = TaskSchedule::new(
            Arc::clone(&graph),
            Arc::clone(&registry),
            hasher,
            options.batch_mode,
        );
        let state = RunState::new(&graph, options.bail);

        Ok(Self {
            graph,
            registry,
            worker,
            cache,
            outputs: None,
            lifecycle: Arc::new(EmptyLifeCycle),
            options,
            pool: WorkerPool::new(),
            shared: Mutex::new(Shared {
                schedule,
                state,
                in_flight: 0,
                interrupted: None,
            }),
            wake: Notify::new(),
        })
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifeCycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_outputs_coordinator(mut self, outputs: Arc<dyn OutputsCoordinator>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    /// Share the pool the worker registers its children with, so signals
    /// reach them.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn worker(&self) -> &W {
        &self.worker
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run every task to a terminal status (or until a bail) and return the
    /// outcome. Old cache records are pruned once, after all slots finish.
    pub async fn run(&self) -> RunOutcome {
        self.schedule_next_tasks().await;

        info!(
            tasks = self.graph.len(),
            parallel = self.options.parallel,
            bail = self.options.bail,
            "starting run"
        );

        join_all((0..self.options.parallel).map(|slot| self.run_slot(slot))).await;

        let outcome = {
            let shared = self.lock();
            shared.state.outcome(shared.interrupted)
        };

        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.remove_old_cache_records()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %format!("{err:#}"), "failed to remove old cache records"),
            Err(err) => warn!(error = %err, "cache cleanup task panicked"),
        }

        info!(
            completed = outcome.statuses.len(),
            failed = outcome.has_failures(),
            exit_code = outcome.exit_code(),
            "run finished"
        );
        outcome
    }

    /// Like [`run`](Self::run), but when `signal` resolves first, forward it
    /// to every live worker, stop dispatching and let in-flight units
    /// finish.
    pub async fn run_until_signal<F>(&self, signal: F) -> RunOutcome
    where
        F: Future<Output = TerminationSignal>,
    {
        let run = self.run();
        tokio::pin!(run);

        tokio::select! {
            outcome = &mut run => outcome,
            received = signal => {
                self.interrupt(received);
                run.await
            }
        }
    }

    /// Fan `signal` out to live workers and halt dispatch.
    pub fn interrupt(&self, signal: TerminationSignal) {
        {
            let mut shared = self.lock();
            shared.interrupted.get_or_insert(signal);
            shared.state.halt();
        }
        warn!(signal = %signal, "run interrupted");
        self.pool.terminate_all(signal);
        self.wake.notify_waiters();
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_slot(&self, slot: usize) {
        let metadata = TaskMetadata { group_id: slot };

        loop {
            // Register interest before checking, so a completion between the
            // check and the await is not missed.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut shared = self.lock();
                if !shared.schedule.has_tasks() || shared.state.is_bailed() {
                    Dequeued::Done
                } else if let Some(batch) = shared.schedule.next_batch() {
                    shared.in_flight += 1;
                    Dequeued::Batch(batch)
                } else if let Some(task) = shared.schedule.next_task() {
                    shared.in_flight += 1;
                    Dequeued::Task(task)
                } else if shared.in_flight == 0 {
                    warn!(slot, "tasks remain but none can become ready; stopping slot");
                    Dequeued::Done
                } else {
                    Dequeued::Wait
                }
            };

            match next {
                Dequeued::Done => {
                    debug!(slot, "slot finished");
                    self.wake.notify_waiters();
                    return;
                }
                Dequeued::Wait => {
                    debug!(slot, "waiting for a completion");
                    notified.await;
                }
                Dequeued::Batch(batch) => {
                    self.apply_from_cache_or_run_batch(batch, metadata).await;
                    self.lock().in_flight -= 1;
                    self.wake.notify_waiters();
                }
                Dequeued::Task(task) => {
                    self.apply_from_cache_or_run_task(task, metadata).await;
                    self.lock().in_flight -= 1;
                    self.wake.notify_waiters();
                }
            }
        }
    }

    fn do_not_skip_cache(&self) -> bool {
        !self.options.skip_cache
    }

    // region single task

    async fn apply_from_cache_or_run_task(&self, mut task: Task, metadata: TaskMetadata) {
        self.lifecycle.start_tasks(std::slice::from_ref(&task), metadata);

        let mut results = if self.do_not_skip_cache() {
            self.apply_cached_results(std::slice::from_ref(&task)).await
        } else {
            Vec::new()
        };

        if results.is_empty() {
            task.start_time = Some(Utc::now());
            let (code, terminal_output) = self.run_task_in_worker(&task).await;
            task.end_time = Some(Utc::now());

            let status = if code == 0 {
                TaskStatus::Success
            } else {
                TaskStatus::Failure
            };
            results.push(TaskRunResult {
                task,
                status,
                code,
                terminal_output,
            });
        }

        self.post_run_steps(results, metadata).await;
    }

    async fn run_task_in_worker(&self, task: &Task) -> (i32, Option<String>) {
        let opts = SingleRunOptions {
            capture: self.output_capture(task),
            stream_output: self.should_stream_output(task),
            temporary_output_path: self.cache.temporary_output_path(task),
        };

        match self.worker.run_task(task, opts).await {
            Ok(output) => (output.code, Some(output.terminal_output)),
            Err(err) => {
                error!(task = %task.id, error = %err, "failed to run task");
                (1, None)
            }
        }
    }

    // endregion

    // region batch

    /// Run a batch until every member has a status.
    ///
    /// Each round replays cache hits, runs the rest in one worker and drops
    /// whatever completed; the remainder is resubmitted unless the run has
    /// bailed or been interrupted. A round that completes nothing fails the
    /// remainder, so the loop always shrinks.
    async fn apply_from_cache_or_run_batch(&self, mut batch: Batch, metadata: TaskMetadata) {
        loop {
            let tasks: Vec<Task> = batch.task_graph.iter().cloned().collect();
            if tasks.is_empty() {
                return;
            }
            self.lifecycle.start_tasks(&tasks, metadata);

            let mut results = if self.do_not_skip_cache() {
                self.apply_cached_results(&tasks).await
            } else {
                Vec::new()
            };

            if results.len() != tasks.len() {
                let cached: Vec<TaskId> = results.iter().map(|r| r.task.id.clone()).collect();
                let unrun = Batch {
                    executor_name: batch.executor_name.clone(),
                    task_graph: batch.task_graph.without_tasks(&cached),
                };
                results.extend(self.run_batch_in_worker(&unrun).await);
            }

            self.post_run_steps(results, metadata).await;

            let (completed, halted) = {
                let shared = self.lock();
                let completed: Vec<TaskId> = batch
                    .task_graph
                    .ids()
                    .filter(|id| shared.state.is_completed(id))
                    .cloned()
                    .collect();
                (completed, shared.state.is_bailed())
            };

            if completed.len() == batch.len() {
                return;
            }

            // A resubmission is new work; the remainder stays without a status.
            if halted {
                debug!(
                    executor = %batch.executor_name,
                    remaining = batch.len() - completed.len(),
                    "run halted; not resubmitting rest of batch"
                );
                return;
            }

            if completed.is_empty() {
                warn!(
                    executor = %batch.executor_name,
                    pending = batch.len(),
                    "batch round completed no tasks; failing the remainder"
                );
                let failures = tasks
                    .into_iter()
                    .map(|task| TaskRunResult {
                        task,
                        status: TaskStatus::Failure,
                        code: 1,
                        terminal_output: None,
                    })
                    .collect();
                self.post_run_steps(failures, metadata).await;
                return;
            }

            debug!(
                executor = %batch.executor_name,
                completed = completed.len(),
                remaining = batch.len() - completed.len(),
                "resubmitting rest of batch"
            );
            batch = Batch {
                executor_name: batch.executor_name,
                task_graph: batch.task_graph.without_tasks(&completed),
            };
        }
    }

    async fn run_batch_in_worker(&self, batch: &Batch) -> Vec<TaskRunResult> {
        match self.worker.run_batch(batch, &self.graph).await {
            Ok(results) => results
                .into_iter()
                .filter_map(|(id, result)| {
                    let Some(task) = batch.task_graph.task(&id) else {
                        warn!(task = %id, executor = %batch.executor_name, "worker reported a task outside the batch");
                        return None;
                    };
                    let mut task = task.clone();
                    task.start_time = result.start_time;
                    task.end_time = result.end_time;
                    let (status, code) = if result.success {
                        (TaskStatus::Success, 0)
                    } else {
                        (TaskStatus::Failure, 1)
                    };
                    Some(TaskRunResult {
                        task,
                        status,
                        code,
                        terminal_output: result.terminal_output,
                    })
                })
                .collect(),
            Err(err) => {
                error!(executor = %batch.executor_name, error = %err, "batch execution failed");
                batch
                    .task_graph
                    .roots
                    .iter()
                    .filter_map(|id| batch.task_graph.task(id))
                    .map(|task| TaskRunResult {
                        task: task.clone(),
                        status: TaskStatus::Failure,
                        code: 1,
                        terminal_output: None,
                    })
                    .collect()
            }
        }
    }

    // endregion

    // region cache

    async fn apply_cached_results(&self, tasks: &[Task]) -> Vec<TaskRunResult> {
        let mut results = Vec::new();
        for task in tasks.iter().filter(|t| self.is_cacheable(t)) {
            if let Some(result) = self.apply_cached_result(task).await {
                results.push(result);
            }
        }
        results
    }

    async fn apply_cached_result(&self, task: &Task) -> Option<TaskRunResult> {
        let hash = task.hash.clone()?;
        let start = Utc::now();

        let cache = self.cache.clone();
        let lookup = task.clone();
        let entry = match tokio::task::spawn_blocking(move || cache.get(&lookup)).await {
            Ok(entry) => entry?,
            Err(err) => {
                warn!(task = %task.id, error = %err, "cache lookup panicked; treating as miss");
                return None;
            }
        };

        if entry.code != 0 {
            debug!(task = %task.id, hash = %hash, code = entry.code, "cached result failed; not replaying");
            return None;
        }

        let outputs = task.outputs.clone();
        let should_copy = !outputs.is_empty() && self.should_copy_outputs_from_cache(&outputs, &hash);
        if should_copy {
            let cache = self.cache.clone();
            let copy_entry = entry.clone();
            let copy_hash = hash.clone();
            let copied = tokio::task::spawn_blocking(move || {
                cache.copy_files_from_cache(&copy_hash, &copy_entry, &outputs)
            })
            .await;
            match copied {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(task = %task.id, hash = %hash, error = %format!("{err:#}"), "restoring outputs failed; running task");
                    return None;
                }
                Err(err) => {
                    warn!(task = %task.id, hash = %hash, error = %err, "restoring outputs panicked; running task");
                    return None;
                }
            }
        }

        let status = if entry.remote {
            TaskStatus::RemoteCache
        } else if should_copy {
            TaskStatus::LocalCache
        } else {
            TaskStatus::LocalCacheKeptExisting
        };

        let mut task = task.clone();
        task.start_time = Some(start);
        task.end_time = Some(Utc::now());

        info!(task = %task.id, hash = %hash, status = %status, "replayed from cache");
        self.lifecycle
            .print_task_terminal_output(&task, status, &entry.terminal_output);

        Some(TaskRunResult {
            task,
            status,
            code: 0,
            terminal_output: Some(entry.terminal_output),
        })
    }

    fn should_copy_outputs_from_cache(&self, outputs: &[String], hash: &str) -> bool {
        match &self.outputs {
            Some(coordinator) => match coordinator.outputs_hashes_match(outputs, hash) {
                Ok(matches) => !matches,
                Err(err) => {
                    debug!(hash = %hash, error = %format!("{err:#}"), "outputs coordinator failed; copying");
                    true
                }
            },
            None => true,
        }
    }

    async fn store_results(&self, results: &[TaskRunResult]) {
        let puts: Vec<_> = results
            .iter()
            .filter(|r| !r.status.is_cache_hit() && r.status != TaskStatus::Skipped)
            .filter(|r| self.should_cache_task_result(&r.task, r.status.code()))
            .filter(|r| {
                r.terminal_output.as_deref().is_some_and(|o| !o.is_empty()) || !r.task.outputs.is_empty()
            })
            .map(|r| {
                let cache = self.cache.clone();
                let task = r.task.clone();
                let terminal_output = r.terminal_output.clone();
                let code = r.status.code();
                tokio::task::spawn_blocking(move || {
                    let outputs = task.outputs.clone();
                    (task.id.clone(), cache.put(&task, terminal_output.as_deref(), &outputs, code))
                })
            })
            .collect();

        for joined in join_all(puts).await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(err))) => warn!(task = %id, error = %format!("{err:#}"), "failed to store cache entry"),
                Err(err) => warn!(error = %err, "cache store panicked"),
            }
        }
    }

    // endregion

    // region post-run

    async fn post_run_steps(&self, results: Vec<TaskRunResult>, metadata: TaskMetadata) {
        if let Some(coordinator) = &self.outputs {
            for r in results
                .iter()
                .filter(|r| r.status == TaskStatus::Success || r.status.is_cache_hit())
            {
                if let Some(hash) = &r.task.hash {
                    if let Err(err) = coordinator.record_outputs_hash(&r.task.outputs, hash) {
                        warn!(task = %r.task.id, error = %format!("{err:#}"), "failed to record outputs hash");
                    }
                }
            }
        }

        if self.do_not_skip_cache() {
            self.store_results(&results).await;
        }

        let recorded = {
            let mut shared = self.lock();
            for r in &results {
                if matches!(r.status, TaskStatus::Success | TaskStatus::Failure) {
                    shared.state.record_exit_code(&r.task.id, r.code);
                }
            }
            let statuses: Vec<(TaskId, TaskStatus)> =
                results.iter().map(|r| (r.task.id.clone(), r.status)).collect();
            let recorded = shared.state.complete(&statuses);
            shared.schedule.complete(statuses.iter().map(|(id, _)| id));
            shared.schedule.complete(recorded.iter().map(|(id, _)| id));
            recorded
        };

        let reported = self.reportable(results, &recorded);
        if !reported.is_empty() {
            self.lifecycle.end_tasks(&reported, metadata);
        }

        self.schedule_next_tasks().await;
        self.wake.notify_waiters();
    }

    /// Queue newly ready work. Hashes are computed on a blocking thread
    /// with the shared state unlocked; tasks another slot is still hashing
    /// are queued by that slot once it records them.
    async fn schedule_next_tasks(&self) {
        loop {
            let request = {
                let mut shared = self.lock();
                match shared.schedule.hash_request() {
                    Some(request) => request,
                    None => {
                        shared.schedule.schedule_next_tasks();
                        return;
                    }
                }
            };

            let requested = request.ids().to_vec();
            debug!(tasks = requested.len(), "hashing ready tasks");
            let hashes = match tokio::task::spawn_blocking(move || request.compute()).await {
                Ok(hashes) => hashes,
                Err(err) => {
                    warn!(error = %err, "hashing task panicked; hashing under the lock");
                    let mut shared = self.lock();
                    shared.schedule.record_hashes(&requested, Default::default());
                    shared.schedule.schedule_next_tasks();
                    return;
                }
            };
            self.lock().schedule.record_hashes(&requested, hashes);
        }
    }

    /// Results to report through `end_tasks`: the first status of each task
    /// in `recorded`, with propagated skips appended.
    fn reportable(&self, results: Vec<TaskRunResult>, recorded: &[(TaskId, TaskStatus)]) -> Vec<TaskRunResult> {
        let mut by_id: std::collections::HashMap<TaskId, TaskRunResult> =
            results.into_iter().map(|r| (r.task.id.clone(), r)).collect();

        recorded
            .iter()
            .filter_map(|(id, status)| match by_id.remove(id) {
                Some(r) if r.status == *status => Some(r),
                Some(_) => None,
                None => self.graph.task(id).map(|task| TaskRunResult {
                    task: task.clone(),
                    status: *status,
                    code: status.code(),
                    terminal_output: None,
                }),
            })
            .collect()
    }

    // endregion

    // region policy

    fn is_cacheable(&self, task: &Task) -> bool {
        let executor_cacheable = self
            .registry
            .metadata(&task.executor)
            .is_some_and(|m| m.cacheable);
        executor_cacheable && task.cache != Some(false) && !task.is_long_running()
    }

    fn should_cache_task_result(&self, task: &Task, code: i32) -> bool {
        self.is_cacheable(task) && (self.options.cache_failures || code == 0)
    }

    fn should_stream_output(&self, task: &Task) -> bool {
        self.options.stream_output
            || task.is_long_running()
            || self
                .options
                .initiating_project
                .as_deref()
                .is_some_and(|p| p == task.target.project)
    }

    fn output_capture(&self, task: &Task) -> OutputCapture {
        let declared = self
            .registry
            .metadata(&task.executor)
            .map(|m| m.output_capture)
            .unwrap_or(OutputCapture::Direct);
        if declared == OutputCapture::Pipe || self.options.stream_output {
            OutputCapture::Pipe
        } else {
            OutputCapture::Direct
        }
    }

    // endregion
}
