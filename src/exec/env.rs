// src/exec/env.rs

//! Environment construction for child processes.
//!
//! Precedence, lowest first: dotenv files, the ambient environment, then the
//! variables injected here. Dotenv files never override a key that is
//! already set, and the most specific file is loaded first.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::dag::Task;

pub const TASK_TARGET_PROJECT: &str = "DAGRUN_TASK_TARGET_PROJECT";
pub const TASK_TARGET_TARGET: &str = "DAGRUN_TASK_TARGET_TARGET";
pub const TASK_TARGET_CONFIGURATION: &str = "DAGRUN_TASK_TARGET_CONFIGURATION";
pub const TASK_HASH: &str = "DAGRUN_TASK_HASH";
pub const WORKSPACE_ROOT: &str = "DAGRUN_WORKSPACE_ROOT";
pub const SKIP_CACHE: &str = "DAGRUN_SKIP_CACHE";
pub const TERMINAL_OUTPUT_PATH: &str = "DAGRUN_TERMINAL_OUTPUT_PATH";
pub const TERMINAL_CAPTURE_STDERR: &str = "DAGRUN_TERMINAL_CAPTURE_STDERR";
pub const STREAM_OUTPUT: &str = "DAGRUN_STREAM_OUTPUT";
pub const PREFIX_OUTPUT: &str = "DAGRUN_PREFIX_OUTPUT";
pub const FORCE_COLOR: &str = "FORCE_COLOR";

/// Variables describing the parent run that must not leak into a nested
/// invocation.
const STRIPPED: &[&str] = &["DAGRUN_BASE", "DAGRUN_HEAD", "DAGRUN_SET_CLI"];

/// Run-wide inputs to environment construction.
#[derive(Debug, Clone, Default)]
pub struct EnvOptions {
    pub workspace_root: PathBuf,
    pub load_dot_env_files: bool,
    pub skip_cache: bool,
    pub capture_stderr: bool,
}

/// Per-invocation inputs.
#[derive(Debug, Clone, Default)]
pub struct ChildEnv<'a> {
    /// Default `FORCE_COLOR=true` unless the ambient environment sets it.
    pub force_color: bool,
    /// Scratch file for direct output capture.
    pub terminal_output_path: Option<&'a Path>,
    pub stream_output: bool,
}

/// Snapshot of the current process environment.
pub fn ambient_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// Environment for a single task process.
pub fn build_task_env(
    ambient: &BTreeMap<String, String>,
    task: &Task,
    opts: &EnvOptions,
    child: &ChildEnv<'_>,
) -> BTreeMap<String, String> {
    let mut env = ambient.clone();

    if opts.load_dot_env_files {
        for file in dot_env_files_for_task(task) {
            load_dot_env_file(&opts.workspace_root.join(&file), &mut env);
        }
    }

    inject_run_vars(&mut env, opts, child);

    env.insert(TASK_TARGET_PROJECT.to_string(), task.target.project.clone());
    env.insert(TASK_TARGET_TARGET.to_string(), task.target.target.clone());
    match &task.target.configuration {
        Some(c) => {
            env.insert(TASK_TARGET_CONFIGURATION.to_string(), c.clone());
        }
        None => {
            env.remove(TASK_TARGET_CONFIGURATION);
        }
    }
    match &task.hash {
        Some(h) => {
            env.insert(TASK_HASH.to_string(), h.clone());
        }
        None => {
            env.remove(TASK_HASH);
        }
    }

    if child.terminal_output_path.is_none() {
        env.remove(TERMINAL_OUTPUT_PATH);
        env.remove(STREAM_OUTPUT);
        env.remove(PREFIX_OUTPUT);
    }
    for key in STRIPPED {
        env.remove(*key);
    }

    env
}

/// Environment for a batch worker process. No task identity is injected;
/// workers learn their tasks from the `run_tasks` message.
pub fn build_worker_env(ambient: &BTreeMap<String, String>, opts: &EnvOptions) -> BTreeMap<String, String> {
    let mut env = ambient.clone();
    inject_run_vars(
        &mut env,
        opts,
        &ChildEnv {
            force_color: true,
            terminal_output_path: None,
            stream_output: false,
        },
    );
    for key in [TASK_TARGET_PROJECT, TASK_TARGET_TARGET, TASK_TARGET_CONFIGURATION, TASK_HASH] {
        env.remove(key);
    }
    for key in STRIPPED {
        env.remove(*key);
    }
    env
}

fn inject_run_vars(env: &mut BTreeMap<String, String>, opts: &EnvOptions, child: &ChildEnv<'_>) {
    if child.force_color && !env.contains_key(FORCE_COLOR) {
        env.insert(FORCE_COLOR.to_string(), "true".to_string());
    }
    env.insert(
        WORKSPACE_ROOT.to_string(),
        opts.workspace_root.to_string_lossy().into_owned(),
    );
    if opts.skip_cache {
        env.insert(SKIP_CACHE.to_string(), "true".to_string());
    } else {
        env.remove(SKIP_CACHE);
    }

    if let Some(path) = child.terminal_output_path {
        env.insert(
            TERMINAL_OUTPUT_PATH.to_string(),
            path.to_string_lossy().into_owned(),
        );
        if opts.capture_stderr {
            env.insert(TERMINAL_CAPTURE_STDERR.to_string(), "true".to_string());
        }
        if child.stream_output {
            env.insert(STREAM_OUTPUT.to_string(), "true".to_string());
        }
    }
}

/// Dotenv files that may pertain to `task`, relative to the workspace root,
/// most specific first.
pub fn dot_env_files_for_task(task: &Task) -> Vec<PathBuf> {
    let target = &task.target.target;
    let root = &task.project_root;
    let mut files = Vec::new();

    if let Some(c) = &task.target.configuration {
        files.push(root.join(format!(".env.{target}.{c}")));
        files.push(root.join(format!(".env.{c}")));
        files.push(root.join(format!(".{target}.{c}.env")));
        files.push(root.join(format!(".{c}.env")));
    }
    files.push(root.join(format!(".env.{target}")));
    files.push(root.join(format!(".{target}.env")));
    files.push(root.join(".env.local"));
    files.push(root.join(".local.env"));
    files.push(root.join(".env"));

    if let Some(c) = &task.target.configuration {
        files.push(PathBuf::from(format!(".env.{target}.{c}")));
        files.push(PathBuf::from(format!(".env.{c}")));
        files.push(PathBuf::from(format!(".{target}.{c}.env")));
        files.push(PathBuf::from(format!(".{c}.env")));
    }
    files.push(PathBuf::from(format!(".env.{target}")));
    files.push(PathBuf::from(format!(".{target}.env")));
    files.push(PathBuf::from(".env"));
    files.push(PathBuf::from(".local.env"));
    files.push(PathBuf::from(".env.local"));

    // project_root may be empty, which makes the two halves overlap
    let mut seen = std::collections::HashSet::new();
    files.retain(|f| seen.insert(f.clone()));
    files
}

/// Merge `path` into `env` without overriding existing keys. A missing file
/// is not an error; an unparsable one is logged and skipped.
fn load_dot_env_file(path: &Path, env: &mut BTreeMap<String, String>) {
    if !path.is_file() {
        return;
    }
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(err) => {
            warn!(path = ?path, error = %err, "failed to open dotenv file");
            return;
        }
    };

    let mut loaded = 0usize;
    for item in iter {
        match item {
            Ok((key, value)) => {
                if !env.contains_key(&key) {
                    env.insert(key, value);
                    loaded += 1;
                }
            }
            Err(err) => {
                warn!(path = ?path, error = %err, "skipping malformed dotenv line");
            }
        }
    }
    debug!(path = ?path, loaded, "loaded dotenv file");
}
