use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dagrun::cache::{
    Blake3TaskHasher, MemoryOutputsStore, OutputsCoordinator, ResultCache, TaskHasher,
};
use dagrun::dag::{Task, TaskGraph, TaskId};
use dagrun::engine::{RunOptions, TaskOrchestrator};
use dagrun::errors::DagrunError;
use dagrun::exec::{ExecutorRegistry, TerminationSignal};
use dagrun::types::{OutputCapture, TaskStatus};
use dagrun_test_utils::{
    FakeOutcome, FakeWorker, Invocation, LifeCycleEvent, RecordingLifeCycle, RegistryBuilder,
    TaskBuilder, TaskGraphBuilder, init_tracing, with_timeout,
};
use tempfile::TempDir;

struct Harness {
    workspace: TempDir,
    lifecycle: Arc<RecordingLifeCycle>,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        Self {
            workspace: tempfile::tempdir().unwrap(),
            lifecycle: Arc::new(RecordingLifeCycle::new()),
        }
    }

    fn root(&self) -> &Path {
        self.workspace.path()
    }

    fn cache(&self) -> ResultCache {
        ResultCache::new(self.root().join(".dagrun/cache"), self.root())
    }

    fn orchestrator(
        &self,
        graph: TaskGraph,
        registry: ExecutorRegistry,
        worker: FakeWorker,
        options: RunOptions,
    ) -> TaskOrchestrator<FakeWorker> {
        TaskOrchestrator::new(
            Arc::new(graph),
            Arc::new(registry),
            Arc::new(Blake3TaskHasher::new(self.root())),
            worker,
            self.cache(),
            options,
        )
        .unwrap()
        .with_lifecycle(self.lifecycle.clone())
    }
}

fn options(parallel: usize) -> RunOptions {
    RunOptions {
        parallel,
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn runs_a_chain_in_dependency_order() {
    let h = Harness::new();
    let graph = TaskGraphBuilder::new()
        .task("app:build", &["lib:build"])
        .task("lib:build", &[])
        .task("app:test", &["app:build"])
        .build();
    let worker = FakeWorker::new();

    let orch = h.orchestrator(graph, ExecutorRegistry::with_builtins(), worker.clone(), options(3));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(worker.executed(), vec!["lib:build", "app:build", "app:test"]);
    for id in ["lib:build", "app:build", "app:test"] {
        assert_eq!(outcome.status(id), Some(TaskStatus::Success), "{id}");
        assert_eq!(h.lifecycle.end_count(id), 1, "{id}");
    }
    assert_eq!(outcome.exit_code(), 0);
}

#[tokio::test]
async fn failure_skips_dependents_and_reports_them_once() {
    let h = Harness::new();
    let graph = TaskGraphBuilder::new()
        .task("lib:build", &[])
        .task("app:build", &["lib:build"])
        .task("app:test", &["app:build"])
        .task("docs:build", &[])
        .build();
    let worker = FakeWorker::new().failing("lib:build", 2);

    let orch = h.orchestrator(graph, ExecutorRegistry::with_builtins(), worker.clone(), options(2));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(outcome.status("lib:build"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::Skipped));
    assert_eq!(outcome.status("app:test"), Some(TaskStatus::Skipped));
    assert_eq!(outcome.status("docs:build"), Some(TaskStatus::Success));
    assert_eq!(worker.run_count("app:build"), 0);
    assert_eq!(worker.run_count("app:test"), 0);

    let ended = h.lifecycle.ended();
    assert!(ended.contains(&("app:build".to_string(), TaskStatus::Skipped, 1)));
    assert!(ended.contains(&("app:test".to_string(), TaskStatus::Skipped, 1)));
    for id in ["lib:build", "app:build", "app:test", "docs:build"] {
        assert_eq!(h.lifecycle.end_count(id), 1, "{id}");
    }
    assert_eq!(outcome.exit_code(), 2);
}

#[tokio::test]
async fn bail_stops_dispatching_after_the_first_failure() {
    let h = Harness::new();
    let graph = TaskGraphBuilder::new()
        .task("a:build", &[])
        .task("b:build", &[])
        .task("c:build", &[])
        .build();
    let worker = FakeWorker::new().failing("a:build", 1);

    let orch = h.orchestrator(
        graph,
        ExecutorRegistry::with_builtins(),
        worker.clone(),
        RunOptions {
            parallel: 1,
            bail: true,
            ..RunOptions::default()
        },
    );
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(worker.executed(), vec!["a:build"]);
    assert_eq!(outcome.status("a:build"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("b:build"), None, "never dispatched, no status");
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn every_task_runs_at_most_once_under_parallelism() {
    let h = Harness::new();
    let mut builder = TaskGraphBuilder::new();
    for i in 0..12 {
        let id = format!("p{i}:build");
        let deps: Vec<String> = (0..i).filter(|d| (i + d) % 3 == 0).map(|d| format!("p{d}:build")).collect();
        let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
        builder = builder.task(&id, &deps);
    }
    let worker = FakeWorker::new();

    let orch = h.orchestrator(builder.build(), ExecutorRegistry::with_builtins(), worker.clone(), options(4));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(outcome.statuses.len(), 12);
    for i in 0..12 {
        assert_eq!(worker.run_count(&format!("p{i}:build")), 1);
    }
}

#[tokio::test]
async fn concurrency_never_exceeds_parallel() {
    let h = Harness::new();
    let mut builder = TaskGraphBuilder::new();
    let mut worker = FakeWorker::new();
    for i in 0..6 {
        let id = format!("p{i}:build");
        builder = builder.task(&id, &[]);
        worker = worker.with_delay(&id, Duration::from_millis(30));
    }

    let orch = h.orchestrator(builder.build(), ExecutorRegistry::with_builtins(), worker.clone(), options(2));
    with_timeout(orch.run()).await;

    assert!(worker.max_concurrency() <= 2, "saw {}", worker.max_concurrency());
    assert!(h.lifecycle.group_ids().iter().all(|g| *g < 2));
}

#[tokio::test]
async fn spawn_errors_become_failures() {
    let h = Harness::new();
    let graph = TaskGraphBuilder::new()
        .task("a:build", &[])
        .task("b:build", &["a:build"])
        .build();
    let worker = FakeWorker::new().with_spawn_error("a:build");

    let orch = h.orchestrator(graph, ExecutorRegistry::with_builtins(), worker, options(1));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(outcome.status("a:build"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("b:build"), Some(TaskStatus::Skipped));
    assert_eq!(outcome.exit_code(), 1);
}

#[tokio::test]
async fn second_run_replays_terminal_output_from_cache() {
    let h = Harness::new();
    let graph = || TaskGraphBuilder::new().task("app:build", &[]).build();

    let first = FakeWorker::new().with_output("app:build", "compiled\n");
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), first.clone(), options(1));
    let outcome = with_timeout(orch.run()).await;
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::Success));

    let second = FakeWorker::new();
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), second.clone(), options(1));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(second.run_count("app:build"), 0);
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::LocalCacheKeptExisting));
    assert!(h.lifecycle.events().contains(&LifeCycleEvent::PrintOutput {
        id: "app:build".to_string(),
        status: TaskStatus::LocalCacheKeptExisting,
        output: "compiled\n".to_string(),
    }));
}

#[tokio::test]
async fn cached_outputs_are_restored_only_when_missing() {
    let h = Harness::new();
    let graph = || {
        TaskGraphBuilder::new()
            .with_task(TaskBuilder::new("app:build").output("dist/app.txt"))
            .build()
    };
    let outputs: Arc<dyn OutputsCoordinator> = Arc::new(MemoryOutputsStore::new(h.root()));
    let artifact = h.root().join("dist/app.txt");

    let root = h.root().to_path_buf();
    let first = FakeWorker::new().with_hook(move |_| {
        std::fs::create_dir_all(root.join("dist")).unwrap();
        std::fs::write(root.join("dist/app.txt"), "artifact").unwrap();
    });
    let orch = h
        .orchestrator(graph(), ExecutorRegistry::with_builtins(), first, options(1))
        .with_outputs_coordinator(outputs.clone());
    with_timeout(orch.run()).await;

    std::fs::remove_file(&artifact).unwrap();

    let second = FakeWorker::new();
    let orch = h
        .orchestrator(graph(), ExecutorRegistry::with_builtins(), second.clone(), options(1))
        .with_outputs_coordinator(outputs.clone());
    let outcome = with_timeout(orch.run()).await;
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::LocalCache));
    assert_eq!(std::fs::read_to_string(&artifact).unwrap(), "artifact");
    assert_eq!(second.run_count("app:build"), 0);

    let third = FakeWorker::new();
    let orch = h
        .orchestrator(graph(), ExecutorRegistry::with_builtins(), third, options(1))
        .with_outputs_coordinator(outputs);
    let outcome = with_timeout(orch.run()).await;
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::LocalCacheKeptExisting));
}

#[tokio::test]
async fn failed_results_are_never_replayed() {
    let h = Harness::new();
    let graph = || TaskGraphBuilder::new().task("app:build", &[]).build();
    let opts = RunOptions {
        parallel: 1,
        cache_failures: true,
        ..RunOptions::default()
    };

    let first = FakeWorker::new().with_outcome(
        "app:build",
        FakeOutcome {
            code: 1,
            output: "boom".to_string(),
            ..FakeOutcome::default()
        },
    );
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), first, opts.clone());
    with_timeout(orch.run()).await;

    let second = FakeWorker::new();
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), second.clone(), opts);
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(second.run_count("app:build"), 1);
    assert_eq!(outcome.status("app:build"), Some(TaskStatus::Success));
}

#[tokio::test]
async fn skip_cache_and_cache_opt_out_always_execute() {
    let h = Harness::new();
    let graph = || {
        TaskGraphBuilder::new()
            .with_task(TaskBuilder::new("app:build"))
            .with_task(TaskBuilder::new("app:lint").cache(false))
            .build()
    };
    let worker = || {
        FakeWorker::new()
            .with_output("app:build", "built")
            .with_output("app:lint", "linted")
    };

    let skip = RunOptions {
        parallel: 1,
        skip_cache: true,
        ..RunOptions::default()
    };
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), worker(), skip);
    with_timeout(orch.run()).await;
    assert!(
        !h.root().join(".dagrun/cache").exists(),
        "skip_cache writes nothing"
    );

    let first = worker();
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), first.clone(), options(1));
    with_timeout(orch.run()).await;
    assert_eq!(first.run_count("app:build"), 1);

    let second = worker();
    let orch = h.orchestrator(graph(), ExecutorRegistry::with_builtins(), second.clone(), options(1));
    with_timeout(orch.run()).await;
    assert_eq!(second.run_count("app:build"), 0, "cached");
    assert_eq!(second.run_count("app:lint"), 1, "opted out of caching");
}

#[tokio::test]
async fn long_running_tasks_are_streamed_and_never_cached() {
    let h = Harness::new();
    let registry = RegistryBuilder::new()
        .executor("direct", true, OutputCapture::Direct)
        .build();
    let graph = || {
        TaskGraphBuilder::new()
            .with_task(TaskBuilder::new("app:serve"))
            .with_task(TaskBuilder::new("lib:build").executor("direct"))
            .with_task(TaskBuilder::new("web:build").executor("direct"))
            .build()
    };
    let worker = || {
        FakeWorker::new()
            .with_output("app:serve", "listening")
            .with_output("lib:build", "ok")
            .with_output("web:build", "ok")
    };
    let opts = RunOptions {
        parallel: 1,
        initiating_project: Some("web".to_string()),
        ..RunOptions::default()
    };

    let first = worker();
    let orch = h.orchestrator(graph(), registry.clone(), first.clone(), opts.clone());
    with_timeout(orch.run()).await;

    let opts_of = |id: &str| {
        first
            .invocations()
            .into_iter()
            .find_map(|i| match i {
                Invocation::Task { id: tid, opts } if tid == id => Some(opts),
                _ => None,
            })
            .unwrap()
    };
    assert!(opts_of("app:serve").stream_output);
    assert_eq!(opts_of("app:serve").capture, OutputCapture::Pipe);
    assert!(!opts_of("lib:build").stream_output);
    assert_eq!(opts_of("lib:build").capture, OutputCapture::Direct);
    assert!(opts_of("web:build").stream_output, "initiating project streams");

    let second = worker();
    let orch = h.orchestrator(graph(), registry, second.clone(), opts);
    with_timeout(orch.run()).await;
    assert_eq!(second.run_count("app:serve"), 1);
    assert_eq!(second.run_count("lib:build"), 0);
}

#[tokio::test]
async fn batches_resubmit_the_unfinished_remainder() {
    let h = Harness::new();
    let registry = RegistryBuilder::new().batch_executor("jest", "true").build();
    let graph = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:test").executor("jest"))
        .with_task(TaskBuilder::new("b:test").executor("jest").after("a:test"))
        .with_task(TaskBuilder::new("c:test").executor("jest").after("b:test"))
        .build();
    let worker = FakeWorker::new().with_batch_limit(1);

    let orch = h.orchestrator(graph, registry, worker.clone(), options(2));
    let outcome = with_timeout(orch.run()).await;

    let batches: Vec<Vec<String>> = worker
        .invocations()
        .into_iter()
        .filter_map(|i| match i {
            Invocation::Batch { ids, .. } => Some(ids),
            _ => None,
        })
        .collect();
    assert_eq!(
        batches,
        vec![
            vec!["a:test".to_string(), "b:test".to_string(), "c:test".to_string()],
            vec!["b:test".to_string(), "c:test".to_string()],
            vec!["c:test".to_string()],
        ]
    );
    for id in ["a:test", "b:test", "c:test"] {
        assert_eq!(outcome.status(id), Some(TaskStatus::Success));
        assert_eq!(h.lifecycle.end_count(id), 1);
    }
}

fn batch_ids(worker: &FakeWorker) -> Vec<Vec<String>> {
    worker
        .invocations()
        .into_iter()
        .filter_map(|i| match i {
            Invocation::Batch { ids, .. } => Some(ids),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn bail_stops_batch_resubmission() {
    let h = Harness::new();
    let registry = RegistryBuilder::new().batch_executor("jest", "true").build();
    let graph = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:test").executor("jest"))
        .with_task(TaskBuilder::new("b:test").executor("jest").after("a:test"))
        .build();
    let worker = FakeWorker::new().failing("a:test", 1).with_batch_limit(1);

    let orch = h.orchestrator(
        graph,
        registry,
        worker.clone(),
        RunOptions {
            parallel: 1,
            bail: true,
            ..RunOptions::default()
        },
    );
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(batch_ids(&worker), vec![vec!["a:test".to_string(), "b:test".to_string()]]);
    assert_eq!(worker.run_count("b:test"), 0);
    assert_eq!(outcome.status("a:test"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("b:test"), None);
}

#[tokio::test]
async fn an_interrupt_stops_batch_resubmission() {
    let h = Harness::new();
    let registry = RegistryBuilder::new().batch_executor("jest", "true").build();
    let graph = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:test").executor("jest"))
        .with_task(TaskBuilder::new("b:test").executor("jest").after("a:test"))
        .build();
    let worker = FakeWorker::new()
        .with_delay("a:test", Duration::from_millis(200))
        .with_batch_limit(1);

    let orch = h.orchestrator(graph, registry, worker.clone(), options(1));
    let signal = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        TerminationSignal::Terminate
    };
    let outcome = with_timeout(orch.run_until_signal(signal)).await;

    assert_eq!(batch_ids(&worker).len(), 1);
    assert_eq!(worker.run_count("b:test"), 0);
    assert_eq!(outcome.status("b:test"), None);
    assert_eq!(outcome.exit_code(), 143);
}

#[tokio::test]
async fn a_batch_round_without_progress_fails_the_remainder() {
    let h = Harness::new();
    let registry = RegistryBuilder::new().batch_executor("jest", "true").build();
    let graph = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:test").executor("jest"))
        .with_task(TaskBuilder::new("b:test").executor("jest"))
        .build();
    let worker = FakeWorker::new().with_batch_limit(0);

    let orch = h.orchestrator(graph, registry, worker.clone(), options(1));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(worker.invocations().len(), 1);
    assert_eq!(outcome.status("a:test"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("b:test"), Some(TaskStatus::Failure));
}

#[tokio::test]
async fn a_batch_that_cannot_start_fails_its_roots() {
    let h = Harness::new();
    let registry = RegistryBuilder::new().batch_executor("jest", "true").build();
    let graph = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:test").executor("jest"))
        .with_task(TaskBuilder::new("b:test").executor("jest").after("a:test"))
        .build();
    let worker = FakeWorker::new().with_failing_batches("jest");

    let orch = h.orchestrator(graph, registry, worker, options(1));
    let outcome = with_timeout(orch.run()).await;

    assert_eq!(outcome.status("a:test"), Some(TaskStatus::Failure));
    assert_eq!(outcome.status("b:test"), Some(TaskStatus::Skipped));
}

#[tokio::test]
async fn a_signal_stops_dispatch_and_sets_the_exit_code() {
    let h = Harness::new();
    let graph = TaskGraphBuilder::new()
        .task("a:build", &[])
        .task("b:build", &[])
        .build();
    let worker = FakeWorker::new().with_delay("a:build", Duration::from_millis(200));

    let orch = h.orchestrator(graph, ExecutorRegistry::with_builtins(), worker.clone(), options(1));
    let signal = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        TerminationSignal::Interrupt
    };
    let outcome = with_timeout(orch.run_until_signal(signal)).await;

    assert_eq!(outcome.interrupted, Some(TerminationSignal::Interrupt));
    assert_eq!(outcome.exit_code(), 130);
    assert_eq!(worker.run_count("b:build"), 0);
    assert_eq!(orch.pool().terminated_by(), Some(TerminationSignal::Interrupt));
}

#[test]
fn rejects_unknown_executors_and_zero_parallelism() {
    init_tracing();
    let workspace = tempfile::tempdir().unwrap();
    let build = |graph: TaskGraph, parallel: usize| {
        TaskOrchestrator::new(
            Arc::new(graph),
            Arc::new(ExecutorRegistry::with_builtins()),
            Arc::new(Blake3TaskHasher::new(workspace.path())),
            FakeWorker::new(),
            ResultCache::new(workspace.path().join("cache"), workspace.path()),
            options(parallel),
        )
    };

    let unknown = TaskGraphBuilder::new()
        .with_task(TaskBuilder::new("a:build").executor("gradle"))
        .build();
    match build(unknown, 1) {
        Err(DagrunError::UnknownExecutor { task, executor }) => {
            assert_eq!(task, "a:build");
            assert_eq!(executor, "gradle");
        }
        other => panic!("expected UnknownExecutor, got {other:?}"),
    }

    let fine = TaskGraphBuilder::new().task("a:build", &[]).build();
    assert!(matches!(build(fine, 0), Err(DagrunError::ConfigError(_))));
}

/// Hasher that blocks on one task until the gate opens.
#[derive(Default)]
struct GatedHasher {
    gated: String,
    open: Mutex<bool>,
    opened: Condvar,
    timed_out: AtomicBool,
}

impl GatedHasher {
    fn gating(id: &str) -> Self {
        Self {
            gated: id.to_string(),
            ..Self::default()
        }
    }

    fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl TaskHasher for GatedHasher {
    fn hash_task(&self, task: &Task, _deps: &[(TaskId, String)]) -> anyhow::Result<String> {
        if task.id == self.gated {
            let open = self.open.lock().unwrap();
            let (open, _) = self
                .opened
                .wait_timeout_while(open, Duration::from_secs(3), |open| !*open)
                .unwrap();
            if !*open {
                self.timed_out.store(true, Ordering::SeqCst);
            }
        }
        Ok(format!("h-{}", task.id))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_hashing_does_not_block_other_slots() {
    let h = Harness::new();
    let hasher = Arc::new(GatedHasher::gating("slow:build"));
    let graph = TaskGraphBuilder::new()
        .task("a:build", &[])
        .task("b:build", &[])
        .task("slow:build", &["a:build"])
        .task("c:build", &["b:build"])
        .build();
    let gate = hasher.clone();
    let worker = FakeWorker::new()
        .with_delay("b:build", Duration::from_millis(100))
        .with_hook(move |task| {
            if task.id == "c:build" {
                gate.open();
            }
        });

    let orch = TaskOrchestrator::new(
        Arc::new(graph),
        Arc::new(ExecutorRegistry::with_builtins()),
        hasher.clone(),
        worker.clone(),
        h.cache(),
        options(2),
    )
    .unwrap();
    let outcome = with_timeout(orch.run()).await;

    assert!(
        !hasher.timed_out.load(Ordering::SeqCst),
        "c:build ran while slow:build was being hashed"
    );
    for id in ["a:build", "b:build", "slow:build", "c:build"] {
        assert_eq!(outcome.status(id), Some(TaskStatus::Success), "{id}");
    }
    let executed = worker.executed();
    let pos = |id: &str| executed.iter().position(|e| e == id).unwrap();
    assert!(pos("c:build") < pos("slow:build"));
}
