// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod lifecycle;
pub mod logging;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cache::{
    Blake3TaskHasher, DirectoryRemoteCache, FileOutputsStore, MemoryOutputsStore,
    OutputsCoordinator, ResultCache,
};
use crate::cli::CliArgs;
use crate::config::loader::{apply_env_overrides, load_and_validate};
use crate::config::model::ConfigFile;
use crate::config::validate_config;
use crate::dag::TaskGraph;
use crate::engine::TaskOrchestrator;
use crate::exec::env::{EnvOptions, ambient_env};
use crate::exec::executor::ExecutorRegistry;
use crate::exec::pool::{TerminationSignal, WorkerPool, wait_for_termination_signal};
use crate::exec::process::WorkerProcessManager;
use crate::lifecycle::{
    CompositeLifeCycle, LifeCycle, StaticRunTerminalOutputLifeCycle, TaskProfilingLifeCycle,
    TaskTimingsLifeCycle,
};
use crate::types::OutputsTracking;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading (file, then `DAGRUN_*` env, then CLI flags)
/// - task graph + executor registry
/// - result cache, remote cache and outputs coordinator
/// - lifecycle observers
/// - the process manager and the orchestrator
/// - SIGHUP / SIGINT / SIGTERM forwarding
///
/// Returns the process exit code for the run.
pub async fn run(args: CliArgs) -> Result<i32> {
    let config_path = PathBuf::from(&args.config);
    let mut cfg = load_and_validate(&config_path)?;
    let ambient = ambient_env();

    apply_env_overrides(&mut cfg.config, &ambient);
    apply_cli_overrides(&mut cfg, &args);
    validate_config(&cfg)?;

    let workspace_root = config_root_dir(&config_path);
    let graph = Arc::new(cfg.task_graph()?);
    let registry = Arc::new(cfg.executor_registry()?);

    if args.dry_run {
        print_dry_run(&cfg, &graph, &registry);
        return Ok(0);
    }

    let cache = build_cache(&cfg, &workspace_root);
    let outputs = build_outputs_coordinator(cfg.config.outputs_tracking, &workspace_root);
    let lifecycle = build_lifecycle(&cfg, &args, graph.len());

    let pool = WorkerPool::new();
    let manager = WorkerProcessManager::new(
        Arc::clone(&registry),
        Arc::clone(&graph),
        pool.clone(),
        Arc::clone(&lifecycle),
        EnvOptions {
            workspace_root: workspace_root.clone(),
            load_dot_env_files: cfg.config.load_dot_env_files,
            skip_cache: cfg.config.skip_cache,
            capture_stderr: cfg.config.capture_stderr,
        },
    )
    .with_ambient_env(ambient)
    .with_prefix_output(cfg.config.prefix_output)
    .with_verbose(cfg.config.verbose);

    let mut orchestrator = TaskOrchestrator::new(
        Arc::clone(&graph),
        registry,
        Arc::new(Blake3TaskHasher::new(&workspace_root)),
        manager,
        cache,
        cfg.run_options(),
    )?
    .with_lifecycle(Arc::clone(&lifecycle))
    .with_pool(pool);
    if let Some(outputs) = outputs {
        orchestrator = orchestrator.with_outputs_coordinator(outputs);
    }

    info!(
        workspace = ?workspace_root,
        tasks = graph.len(),
        roots = graph.roots.len(),
        "starting dagrun"
    );

    lifecycle.start_command();
    let outcome = orchestrator.run_until_signal(termination_signal()).await;
    lifecycle.end_command();

    let code = outcome.exit_code();
    debug!(code, interrupted = ?outcome.interrupted, "run complete");
    Ok(code)
}

fn apply_cli_overrides(cfg: &mut ConfigFile, args: &CliArgs) {
    if let Some(parallel) = args.parallel {
        cfg.config.parallel = parallel;
    }
    if args.bail {
        cfg.config.bail = true;
    }
    if args.skip_cache {
        cfg.config.skip_cache = true;
    }
    if args.verbose {
        cfg.config.verbose = true;
    }
    if let Some(project) = &args.project {
        cfg.config.initiating_project = Some(project.clone());
    }
}

/// Resolves on the first SIGHUP/SIGINT/SIGTERM. If signal handlers cannot
/// be installed the run simply cannot be interrupted.
async fn termination_signal() -> TerminationSignal {
    match wait_for_termination_signal().await {
        Ok(signal) => signal,
        Err(err) => {
            warn!(error = %err, "failed to install signal handlers");
            std::future::pending().await
        }
    }
}

fn build_cache(cfg: &ConfigFile, workspace_root: &Path) -> ResultCache {
    let cache_dir = workspace_root.join(&cfg.config.cache_directory);
    let mut cache = ResultCache::new(cache_dir, workspace_root)
        .with_max_age(Duration::from_secs(cfg.config.max_cache_age_days * SECONDS_PER_DAY));

    if let Some(remote) = &cfg.config.remote_cache_directory {
        let remote = workspace_root.join(remote);
        debug!(remote = ?remote, "using directory remote cache");
        cache = cache.with_remote(Arc::new(DirectoryRemoteCache::new(remote)));
    }

    cache
}

fn build_outputs_coordinator(
    tracking: OutputsTracking,
    workspace_root: &Path,
) -> Option<Arc<dyn OutputsCoordinator>> {
    match tracking {
        OutputsTracking::File => Some(Arc::new(FileOutputsStore::new(workspace_root))),
        OutputsTracking::Memory => Some(Arc::new(MemoryOutputsStore::new(workspace_root))),
        OutputsTracking::None => None,
    }
}

fn build_lifecycle(cfg: &ConfigFile, args: &CliArgs, total_tasks: usize) -> Arc<dyn LifeCycle> {
    let mut composite = CompositeLifeCycle::new(vec![Arc::new(
        StaticRunTerminalOutputLifeCycle::new(cfg.config.initiating_project.clone(), total_tasks),
    )]);

    if args.timings {
        composite.push(Arc::new(TaskTimingsLifeCycle::new()));
    }
    if let Some(path) = &args.profile {
        composite.push(Arc::new(TaskProfilingLifeCycle::new(path)));
    }

    Arc::new(composite)
}

/// Directory holding the config file; the workspace root.
///
/// - If the config path has a non-empty parent (e.g. "ci/Dagrun.toml"),
///   we use that directory.
/// - If it's just a bare filename like "Dagrun.toml" (parent = ""),
///   we fall back to the current working directory.
fn config_root_dir(config_path: &Path) -> PathBuf {
    let dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    dir.canonicalize().unwrap_or(dir)
}

/// Dry-run output: tasks in declaration order with executor and
/// dependencies.
fn print_dry_run(cfg: &ConfigFile, graph: &TaskGraph, registry: &ExecutorRegistry) {
    println!("dagrun dry-run");
    println!("  config.parallel = {}", cfg.config.parallel);
    println!("  config.bail = {}", cfg.config.bail);
    println!("  config.batch_mode = {}", cfg.config.batch_mode);
    println!("  config.cache_directory = {:?}", cfg.config.cache_directory);
    println!();

    println!("tasks ({}):", graph.len());
    for task in graph.iter() {
        let batch = registry.metadata(&task.executor).is_some_and(|m| m.batch);
        println!("  - {}", task.id);
        println!("      executor: {}{}", task.executor, if batch { " (batch)" } else { "" });
        if let Some(serde_json::Value::String(command)) = task.overrides.get("command") {
            println!("      command: {command}");
        }
        let deps = graph.dependencies_of(&task.id);
        if !deps.is_empty() {
            println!("      after: {:?}", deps);
        }
        if !task.outputs.is_empty() {
            println!("      outputs: {:?}", task.outputs);
        }
        if !task.inputs.is_empty() {
            println!("      inputs: {:?}", task.inputs);
        }
        if task.cache == Some(false) {
            println!("      cache: false");
        }
    }

    debug!("dry-run complete (no execution)");
}
