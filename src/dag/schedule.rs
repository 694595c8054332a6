// src/dag/schedule.rs

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::hash::{TaskHasher, fallback_hash};
use crate::dag::task::{Task, TaskGraph, TaskId};
use crate::exec::executor::ExecutorRegistry;

/// A group of ready tasks sharing one batch-capable executor.
///
/// `task_graph` only contains the batch members; its dependency edges are
/// restricted to members, so its roots are the members that can start
/// immediately.
#[derive(Debug, Clone)]
pub struct Batch {
    pub executor_name: String,
    pub task_graph: TaskGraph,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.task_graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_graph.is_empty()
    }
}

/// Ready-queue bookkeeping over a task graph.
///
/// The schedule is not internally synchronized: the orchestrator owns it
/// behind its state mutex and is the only caller.
///
/// Lifecycle of a task id:
///
/// 1. starts in the not-scheduled graph,
/// 2. moves to the task queue (or into a queued [`Batch`]) once every
///    dependency in the full graph is completed,
/// 3. is handed out by [`next_task`](Self::next_task) or
///    [`next_batch`](Self::next_batch),
/// 4. is marked completed through [`complete`](Self::complete).
///
/// Skipped tasks jump from step 1 or 2 straight to step 4.
pub struct TaskSchedule {
    graph: Arc<TaskGraph>,
    registry: Arc<ExecutorRegistry>,
    hasher: Arc<dyn TaskHasher>,
    reverse_deps: HashMap<TaskId, Vec<TaskId>>,
    not_scheduled: TaskGraph,
    completed: HashSet<TaskId>,
    hashes: HashMap<TaskId, String>,
    hashing: HashSet<TaskId>,
    scheduled_tasks: VecDeque<TaskId>,
    scheduled_batches: VecDeque<Batch>,
    batch_mode: bool,
}

impl TaskSchedule {
    pub fn new(
        graph: Arc<TaskGraph>,
        registry: Arc<ExecutorRegistry>,
        hasher: Arc<dyn TaskHasher>,
        batch_mode: bool,
    ) -> Self {
        let reverse_deps = graph.reverse_dependencies();
        let not_scheduled = (*graph).clone();
        Self {
            graph,
            registry,
            hasher,
            reverse_deps,
            not_scheduled,
            completed: HashSet::new(),
            hashes: HashMap::new(),
            hashing: HashSet::new(),
            scheduled_tasks: VecDeque::new(),
            scheduled_batches: VecDeque::new(),
            batch_mode,
        }
    }

    /// Move every task whose dependencies are all completed out of the
    /// not-scheduled graph and into the batch or task queue.
    ///
    /// Idempotent: calling it twice without an intervening
    /// [`complete`](Self::complete) schedules nothing new. Tasks whose hash
    /// is still being computed from a [`HashRequest`] are left for a later
    /// pass.
    pub fn schedule_next_tasks(&mut self) {
        if self.batch_mode {
            self.schedule_batches();
        }

        let ready: Vec<TaskId> = self
            .not_scheduled
            .roots
            .iter()
            .filter(|id| self.can_be_scheduled(id) && !self.hashing.contains(*id))
            .cloned()
            .collect();

        if ready.is_empty() {
            return;
        }

        for id in &ready {
            self.ensure_hashed(id);
            debug!(task = %id, "scheduled task");
            self.scheduled_tasks.push_back(id.clone());
        }
        self.not_scheduled = self.not_scheduled.without_tasks(&ready);
    }

    /// True iff a queued task, a queued batch or a not-yet-scheduled task
    /// remains.
    pub fn has_tasks(&self) -> bool {
        !self.scheduled_tasks.is_empty()
            || !self.scheduled_batches.is_empty()
            || !self.not_scheduled.is_empty()
    }

    /// Pop the oldest queued batch.
    pub fn next_batch(&mut self) -> Option<Batch> {
        self.scheduled_batches.pop_front()
    }

    /// Pop the oldest queued task, with its hash filled in.
    pub fn next_task(&mut self) -> Option<Task> {
        let id = self.scheduled_tasks.pop_front()?;
        self.hashed_task(&id)
    }

    /// Mark `ids` as completed so their dependents can be scheduled by the
    /// next [`schedule_next_tasks`](Self::schedule_next_tasks) pass.
    ///
    /// Completed ids still waiting in the queue are dropped from it.
    pub fn complete<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a TaskId>,
    {
        let ids: Vec<&TaskId> = ids.into_iter().collect();
        if ids.is_empty() {
            return;
        }

        for id in &ids {
            self.completed.insert((*id).clone());
        }
        if ids.iter().any(|id| self.not_scheduled.contains(id)) {
            self.not_scheduled = self.not_scheduled.without_tasks(ids.iter().copied());
        }
        self.scheduled_tasks.retain(|queued| !self.completed.contains(queued));
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.contains(id)
    }

    /// Hash assigned to `id`, once it has been scheduled.
    pub fn hash_of(&self, id: &str) -> Option<&str> {
        self.hashes.get(id).map(String::as_str)
    }

    /// Ids currently waiting in the single-task queue, front first.
    pub fn queued_task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.scheduled_tasks.iter()
    }

    /// Hashing work for the tasks the next
    /// [`schedule_next_tasks`](Self::schedule_next_tasks) pass would queue,
    /// or `None` when they are all hashed or already requested.
    ///
    /// The request owns everything it needs, so the caller can compute it
    /// without holding the schedule. Requested ids are not scheduled until
    /// [`record_hashes`](Self::record_hashes) releases them.
    pub fn hash_request(&mut self) -> Option<HashRequest> {
        let ids: Vec<TaskId> = self
            .ready_ids()
            .into_iter()
            .filter(|id| !self.hashes.contains_key(id) && !self.hashing.contains(id))
            .collect();
        if ids.is_empty() {
            return None;
        }
        self.hashing.extend(ids.iter().cloned());
        Some(HashRequest {
            graph: Arc::clone(&self.graph),
            hasher: Arc::clone(&self.hasher),
            known: self.hashes.clone(),
            ids,
        })
    }

    /// Store hashes computed for `requested` and release those ids for
    /// scheduling. Existing hashes win; ids left without a hash are hashed
    /// in place by the next scheduling pass.
    pub fn record_hashes(&mut self, requested: &[TaskId], hashes: HashMap<TaskId, String>) {
        for id in requested {
            self.hashing.remove(id);
        }
        for (id, hash) in hashes {
            self.hashes.entry(id).or_insert(hash);
        }
    }

    /// Ids the next scheduling pass would move out of the not-scheduled
    /// graph: batch members first, then ready single tasks.
    fn ready_ids(&self) -> Vec<TaskId> {
        let mut batched: Vec<TaskId> = Vec::new();
        if self.batch_mode {
            let mut batches: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
            for root in &self.not_scheduled.roots {
                if let Some(task) = self.graph.task(root) {
                    self.collect_batch_members(&mut batches, root, &task.executor);
                }
            }
            batched = batches.into_values().flatten().collect();
        }

        let singles: Vec<TaskId> = self
            .not_scheduled
            .roots
            .iter()
            .filter(|id| !batched.contains(*id) && self.can_be_scheduled(id))
            .cloned()
            .collect();
        batched.extend(singles);
        batched
    }

    fn can_be_scheduled(&self, id: &str) -> bool {
        self.graph
            .dependencies_of(id)
            .iter()
            .all(|dep| self.completed.contains(dep))
    }

    fn schedule_batches(&mut self) {
        // executor name -> members in discovery order
        let mut batches: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
        let mut executor_order: Vec<String> = Vec::new();

        let roots = self.not_scheduled.roots.clone();
        for root in &roots {
            let Some(task) = self.graph.task(root) else {
                continue;
            };
            let executor = task.executor.clone();
            self.collect_batch_members(&mut batches, root, &executor);
            if batches.contains_key(&executor) && !executor_order.contains(&executor) {
                executor_order.push(executor);
            }
        }

        for executor in executor_order {
            if let Some(members) = batches.remove(&executor) {
                self.schedule_batch(executor, members);
            }
        }
    }

    fn collect_batch_members(
        &self,
        batches: &mut BTreeMap<String, Vec<TaskId>>,
        id: &TaskId,
        root_executor: &str,
    ) {
        let members = batches.get(root_executor);
        if members.is_some_and(|m| m.contains(id)) {
            return;
        }
        if !self.not_scheduled.contains(id) || self.hashing.contains(id) {
            return;
        }
        if !self.can_batch_task_be_scheduled(id, members.map(Vec::as_slice).unwrap_or(&[])) {
            return;
        }

        let Some(task) = self.graph.task(id) else {
            return;
        };
        if task.executor != root_executor {
            return;
        }
        let batch_capable = self
            .registry
            .metadata(&task.executor)
            .is_some_and(|m| m.batch);
        if !batch_capable {
            return;
        }

        batches
            .entry(root_executor.to_string())
            .or_default()
            .push(id.clone());

        let dependents = self.reverse_deps.get(id).cloned().unwrap_or_default();
        for dependent in &dependents {
            self.collect_batch_members(batches, dependent, root_executor);
        }
    }

    /// Every dependency is either completed or already part of the batch.
    fn can_batch_task_be_scheduled(&self, id: &str, members: &[TaskId]) -> bool {
        self.graph
            .dependencies_of(id)
            .iter()
            .all(|dep| self.completed.contains(dep) || members.contains(dep))
    }

    fn schedule_batch(&mut self, executor_name: String, members: Vec<TaskId>) {
        let member_set: HashSet<&TaskId> = members.iter().collect();

        // Declaration order, so batch roots and iteration are deterministic.
        let order: Vec<TaskId> = self
            .graph
            .ids()
            .filter(|id| member_set.contains(id))
            .cloned()
            .collect();

        for id in &order {
            self.ensure_hashed(id);
        }

        let mut tasks = BTreeMap::new();
        let mut dependencies = BTreeMap::new();
        for id in &order {
            if let Some(task) = self.hashed_task(id) {
                tasks.insert(id.clone(), task);
            }
            let deps: Vec<TaskId> = self
                .graph
                .dependencies_of(id)
                .iter()
                .filter(|d| member_set.contains(d))
                .cloned()
                .collect();
            dependencies.insert(id.clone(), deps);
        }

        debug!(executor = %executor_name, tasks = order.len(), "scheduled batch");

        self.not_scheduled = self.not_scheduled.without_tasks(&order);
        self.scheduled_batches.push_back(Batch {
            executor_name,
            task_graph: TaskGraph::from_parts(order, tasks, dependencies),
        });
    }

    /// Hash `id` (and, first, any unhashed dependency).
    fn ensure_hashed(&mut self, id: &TaskId) {
        hash_into(&self.graph, self.hasher.as_ref(), &mut self.hashes, id);
    }

    fn hashed_task(&self, id: &str) -> Option<Task> {
        let mut task = self.graph.task(id)?.clone();
        task.hash = self.hashes.get(id).cloned();
        Some(task)
    }
}

/// Hashes owed by a [`TaskSchedule`], detached from it.
///
/// Hashing reads input files, so the orchestrator computes requests on a
/// blocking thread and hands the result back through
/// [`TaskSchedule::record_hashes`].
pub struct HashRequest {
    graph: Arc<TaskGraph>,
    hasher: Arc<dyn TaskHasher>,
    known: HashMap<TaskId, String>,
    ids: Vec<TaskId>,
}

impl HashRequest {
    pub fn ids(&self) -> &[TaskId] {
        &self.ids
    }

    /// Hash every requested id, plus any unhashed dependency on the way.
    /// Only newly computed hashes are returned.
    pub fn compute(self) -> HashMap<TaskId, String> {
        let mut hashes = self.known.clone();
        for id in &self.ids {
            hash_into(&self.graph, self.hasher.as_ref(), &mut hashes, id);
        }
        hashes.retain(|id, _| !self.known.contains_key(id));
        hashes
    }
}

fn hash_into(
    graph: &TaskGraph,
    hasher: &dyn TaskHasher,
    hashes: &mut HashMap<TaskId, String>,
    id: &TaskId,
) {
    if hashes.contains_key(id) {
        return;
    }

    let deps: Vec<TaskId> = graph.dependencies_of(id).to_vec();
    for dep in &deps {
        hash_into(graph, hasher, hashes, dep);
    }

    let mut dependency_hashes: Vec<(TaskId, String)> = deps
        .iter()
        .filter_map(|d| hashes.get(d).map(|h| (d.clone(), h.clone())))
        .collect();
    dependency_hashes.sort();

    let Some(task) = graph.task(id) else {
        return;
    };

    let hash = match hasher.hash_task(task, &dependency_hashes) {
        Ok(hash) => hash,
        Err(err) => {
            warn!(task = %id, error = %format!("{err:#}"), "hashing failed; using fallback digest");
            fallback_hash(task, &dependency_hashes)
        }
    };

    debug!(task = %id, hash = %hash, "hashed task");
    hashes.insert(id.clone(), hash);
}
