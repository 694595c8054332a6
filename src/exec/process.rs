// src/exec/process.rs

//! OS process execution for single tasks and batches.
//!
//! Every child runs in its own process group, is registered with the
//! [`WorkerPool`] while alive, and is killed when its handle is dropped, so
//! nothing outlives the parent.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dag::{Batch, Task, TaskGraph};
use crate::errors::{DagrunError, Result};
use crate::exec::backend::{SingleRunOptions, TaskRunOutput, TaskWorker, WorkerFuture};
use crate::exec::env::{ChildEnv, EnvOptions, ambient_env, build_task_env, build_worker_env};
use crate::exec::executor::{ExecutorContext, ExecutorRegistry, ProcessCommand};
use crate::exec::messages::{BatchResults, WorkerMessage};
use crate::exec::output::{LinePrefixer, batch_header, command_header};
use crate::exec::pool::{TerminationSignal, WorkerPool, signal_exit_code};
use crate::lifecycle::LifeCycle;
use crate::types::{OutputCapture, TaskStatus};

/// How long to keep reading output after the child exited, in case a
/// grandchild still holds the pipe open.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// State of one spawned process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Spawned { pid: Option<u32> },
    Running,
    Exited(i32),
    /// Killed by the given signal number.
    Terminated(i32),
    Errored(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Exited(_) | ProcessState::Terminated(_) | ProcessState::Errored(_)
        )
    }

    /// Exit code of a finished process; signals map to `128 + signo`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessState::Exited(code) => Some(*code),
            ProcessState::Terminated(signo) => Some(signal_exit_code(*signo)),
            _ => None,
        }
    }

    pub fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ProcessState::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signo) = status.signal() {
                return ProcessState::Terminated(signo);
            }
        }
        ProcessState::Terminated(0)
    }
}

/// Tracks the state of one process and rejects transitions out of a
/// terminal state.
#[derive(Debug)]
struct ProcessMonitor {
    label: String,
    state: ProcessState,
}

impl ProcessMonitor {
    fn spawned(label: &str, pid: Option<u32>) -> Self {
        debug!(worker = %label, pid = ?pid, "process spawned");
        Self {
            label: label.to_string(),
            state: ProcessState::Spawned { pid },
        }
    }

    fn transition(&mut self, next: ProcessState) {
        if self.state.is_terminal() {
            warn!(worker = %self.label, state = ?self.state, next = ?next, "ignoring transition out of terminal state");
            return;
        }
        debug!(worker = %self.label, from = ?self.state, to = ?next, "process state");
        self.state = next;
    }
}

enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

enum Incoming {
    Message(WorkerMessage),
    Raw(String),
}

/// Runs tasks and batches as child processes.
pub struct WorkerProcessManager {
    registry: Arc<ExecutorRegistry>,
    task_graph: Arc<TaskGraph>,
    pool: WorkerPool,
    lifecycle: Arc<dyn LifeCycle>,
    env_options: EnvOptions,
    ambient: BTreeMap<String, String>,
    prefix_output: bool,
    is_verbose: bool,
}

impl WorkerProcessManager {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        task_graph: Arc<TaskGraph>,
        pool: WorkerPool,
        lifecycle: Arc<dyn LifeCycle>,
        env_options: EnvOptions,
    ) -> Self {
        Self {
            registry,
            task_graph,
            pool,
            lifecycle,
            env_options,
            ambient: ambient_env(),
            prefix_output: false,
            is_verbose: false,
        }
    }

    /// Replace the ambient environment children inherit.
    pub fn with_ambient_env(mut self, ambient: BTreeMap<String, String>) -> Self {
        self.ambient = ambient;
        self
    }

    pub fn with_prefix_output(mut self, prefix_output: bool) -> Self {
        self.prefix_output = prefix_output;
        self
    }

    pub fn with_verbose(mut self, is_verbose: bool) -> Self {
        self.is_verbose = is_verbose;
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn context(&self) -> ExecutorContext {
        ExecutorContext {
            workspace_root: self.env_options.workspace_root.clone(),
            cwd: self.env_options.workspace_root.clone(),
            task_graph: Arc::clone(&self.task_graph),
            is_verbose: self.is_verbose,
        }
    }

    /// Run one task, capturing its output through a pipe or a scratch file.
    pub async fn run_single(&self, task: &Task, opts: SingleRunOptions) -> Result<TaskRunOutput> {
        let executor = self.registry.executor_for(task)?;
        let command = executor.command(task, &self.context())?;

        if opts.stream_output {
            write_stdout(&command_header(task));
        }

        let direct = opts.capture == OutputCapture::Direct;
        let output_path = opts.temporary_output_path.as_path();
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating terminal output directory {:?}", parent))?;
        }

        let env = build_task_env(
            &self.ambient,
            task,
            &self.env_options,
            &ChildEnv {
                force_color: !direct,
                terminal_output_path: direct.then_some(output_path),
                stream_output: opts.stream_output,
            },
        );

        let mut cmd = build_command(&command, &env);
        cmd.stdin(Stdio::null());
        if direct {
            let file = std::fs::File::create(output_path)
                .with_context(|| format!("creating terminal output file {:?}", output_path))?;
            let stderr = if self.env_options.capture_stderr {
                Stdio::from(file.try_clone()?)
            } else {
                Stdio::inherit()
            };
            cmd.stdout(Stdio::from(file)).stderr(stderr);
        } else {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|e| {
            DagrunError::WorkerError(format!("spawning process for task '{}': {e}", task.id))
        })?;

        let pid = child.id();
        let mut monitor = ProcessMonitor::spawned(&task.id, pid);
        let (_guard, term_rx) = self.pool.register(task.id.clone(), pid);
        monitor.transition(ProcessState::Running);
        info!(task = %task.id, pid = ?pid, program = %command.program, capture = ?opts.capture, "started task process");

        let (code, terminal_output) = if direct {
            let code = supervise::<(), _>(&mut child, &mut monitor, term_rx, None, |_| {}).await?;
            let terminal_output = match tokio::fs::read(output_path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(err) => {
                    warn!(task = %task.id, exit_code = code, error = %err, "unable to read terminal output");
                    String::new()
                }
            };
            if opts.stream_output {
                write_stdout(&terminal_output);
            }
            (code, terminal_output)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Some(stdout) = child.stdout.take() {
                spawn_chunk_reader(stdout, tx.clone(), Chunk::Stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_chunk_reader(stderr, tx.clone(), Chunk::Stderr);
            }
            drop(tx);

            let prefixers = (opts.stream_output && self.prefix_output).then(|| {
                (
                    LinePrefixer::new(&task.target.project, true),
                    LinePrefixer::new(&task.target.project, false),
                )
            });

            let mut captured = Vec::new();
            let code = supervise(&mut child, &mut monitor, term_rx, Some(rx), |chunk| {
                let (bytes, is_stderr) = match chunk {
                    Chunk::Stdout(b) => (b, false),
                    Chunk::Stderr(b) => (b, true),
                };
                if opts.stream_output {
                    let prefixer = prefixers.as_ref().map(|(out, err)| if is_stderr { err } else { out });
                    echo_chunk(&bytes, is_stderr, prefixer);
                }
                captured.extend_from_slice(&bytes);
            })
            .await?;

            let terminal_output = String::from_utf8_lossy(&captured).into_owned();
            if let Err(err) = tokio::fs::write(output_path, terminal_output.as_bytes()).await {
                warn!(task = %task.id, path = ?output_path, error = %err, "failed to write terminal output");
            }
            (code, terminal_output)
        };

        info!(task = %task.id, exit_code = code, "task process exited");

        if !opts.stream_output {
            let status = if code == 0 {
                TaskStatus::Success
            } else {
                TaskStatus::Failure
            };
            self.lifecycle.print_task_terminal_output(task, status, &terminal_output);
        }

        Ok(TaskRunOutput {
            code,
            terminal_output,
        })
    }

    /// Run a batch in one worker process speaking the line protocol.
    ///
    /// Returns the results the worker reported. If the worker exits before
    /// its final message, whatever it completed so far is returned; if it
    /// completed nothing, the batch is an error.
    pub async fn run_batch(&self, batch: &Batch, full_graph: &TaskGraph) -> Result<BatchResults> {
        let batch_executor = self.registry.batch_executor(&batch.executor_name)?;
        let command = batch_executor.worker_command(&batch.executor_name, &self.context())?;

        match batch.task_graph.iter().next() {
            Some(task) if batch.len() == 1 => write_stdout(&command_header(task)),
            _ => write_stdout(&batch_header(&batch.executor_name, batch.len())),
        }

        let env = build_worker_env(&self.ambient, &self.env_options);
        let mut cmd = build_command(&command, &env);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let label = format!("batch:{}", batch.executor_name);
        let mut child = cmd.spawn().map_err(|e| {
            DagrunError::WorkerError(format!(
                "spawning batch worker for '{}': {e}",
                batch.executor_name
            ))
        })?;

        let pid = child.id();
        let mut monitor = ProcessMonitor::spawned(&label, pid);
        let (_guard, term_rx) = self.pool.register(label.clone(), pid);
        monitor.transition(ProcessState::Running);
        info!(executor = %batch.executor_name, tasks = batch.len(), pid = ?pid, "started batch worker");

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_message_reader(stdout, tx);
        } else {
            drop(tx);
        }

        let request = WorkerMessage::RunTasks {
            executor_name: batch.executor_name.clone(),
            batch_task_graph: batch.task_graph.clone(),
            full_task_graph: full_graph.clone(),
        }
        .to_line()?;
        if let Some(mut stdin) = child.stdin.take() {
            let label = label.clone();
            tokio::spawn(async move {
                // closing stdin after the request tells the worker nothing else follows
                if let Err(err) = stdin.write_all(request.as_bytes()).await {
                    debug!(worker = %label, error = %err, "worker closed stdin before reading request");
                }
            });
        }

        let mut partial = BatchResults::new();
        let mut final_results: Option<BatchResults> = None;
        let code = supervise(&mut child, &mut monitor, term_rx, Some(rx), |incoming| match incoming {
            Incoming::Message(WorkerMessage::CompleteTask { task, result }) => {
                debug!(task = %task, success = result.success, "batch task completed");
                partial.insert(task, result);
            }
            Incoming::Message(WorkerMessage::CompleteBatchExecution { results }) => {
                debug!(results = results.len(), "batch execution completed");
                final_results = Some(results);
            }
            Incoming::Message(WorkerMessage::Stdout { message }) | Incoming::Raw(message) => {
                write_stdout(&format!("{message}\n"));
            }
            Incoming::Message(WorkerMessage::Stderr { message }) => {
                write_stderr(&format!("{message}\n"));
            }
            Incoming::Message(WorkerMessage::RunTasks { .. }) => {}
        })
        .await?;

        match final_results {
            Some(results) => {
                partial.extend(results);
                Ok(partial)
            }
            None if !partial.is_empty() => {
                warn!(
                    executor = %batch.executor_name,
                    exit_code = code,
                    completed = partial.len(),
                    pending = batch.len().saturating_sub(partial.len()),
                    "batch worker exited before completing the batch"
                );
                Ok(partial)
            }
            None => Err(DagrunError::WorkerError(format!(
                "\"{}\" exited unexpectedly with code: {code}",
                batch.executor_name
            ))),
        }
    }
}

impl TaskWorker for WorkerProcessManager {
    fn run_task<'a>(&'a self, task: &'a Task, opts: SingleRunOptions) -> WorkerFuture<'a, TaskRunOutput> {
        Box::pin(self.run_single(task, opts))
    }

    fn run_batch<'a>(&'a self, batch: &'a Batch, full_graph: &'a TaskGraph) -> WorkerFuture<'a, BatchResults> {
        Box::pin(WorkerProcessManager::run_batch(self, batch, full_graph))
    }
}

fn build_command(command: &ProcessCommand, env: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.cwd)
        .env_clear()
        .envs(env)
        .kill_on_drop(true);
    #[cfg(unix)]
    {
        // own group, so signals reach grandchildren too
        cmd.process_group(0);
    }
    cmd
}

/// Drive a child to completion while dispatching its output events and
/// forwarding a termination request. Returns the translated exit code.
async fn supervise<T, F>(
    child: &mut Child,
    monitor: &mut ProcessMonitor,
    mut term_rx: oneshot::Receiver<TerminationSignal>,
    mut events: Option<mpsc::UnboundedReceiver<T>>,
    mut on_event: F,
) -> Result<i32>
where
    F: FnMut(T),
{
    let pid = child.id();
    let mut status: Option<ExitStatus> = None;
    let mut signal_armed = true;

    loop {
        if status.is_some() && events.is_none() {
            break;
        }

        tokio::select! {
            event = recv_event(&mut events) => match event {
                Some(event) => on_event(event),
                None => events = None,
            },

            res = child.wait(), if status.is_none() => match res {
                Ok(s) => status = Some(s),
                Err(err) => {
                    monitor.transition(ProcessState::Errored(err.to_string()));
                    return Err(DagrunError::WorkerError(format!(
                        "waiting for process of '{}': {err}",
                        monitor.label
                    )));
                }
            },

            signal = &mut term_rx, if signal_armed => {
                signal_armed = false;
                if let Ok(signal) = signal {
                    forward_signal(child, pid, signal);
                }
            },

            _ = tokio::time::sleep(DRAIN_GRACE), if status.is_some() => {
                warn!(worker = %monitor.label, "output still open after exit; detaching");
                events = None;
            },
        }
    }

    let Some(status) = status else {
        return Err(DagrunError::WorkerError(format!(
            "process of '{}' finished without an exit status",
            monitor.label
        )));
    };
    monitor.transition(ProcessState::from_exit_status(status));
    monitor.state.exit_code().ok_or_else(|| {
        DagrunError::WorkerError(format!("process of '{}' has no exit code", monitor.label))
    })
}

async fn recv_event<T>(events: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn forward_signal(child: &mut Child, pid: Option<u32>, signal: TerminationSignal) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let sig = match signal {
            TerminationSignal::Hangup => Signal::SIGHUP,
            TerminationSignal::Interrupt => Signal::SIGINT,
            TerminationSignal::Terminate => Signal::SIGTERM,
        };
        if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
            match killpg(Pid::from_raw(raw), sig) {
                Ok(()) => {
                    debug!(pid = raw, signal = %signal, "signalled process group");
                    return;
                }
                Err(err) => {
                    warn!(pid = raw, signal = %signal, error = %err, "failed to signal process group; killing child");
                }
            }
        }
    }

    if let Err(err) = child.start_kill() {
        warn!(pid = ?pid, signal = %signal, error = %err, "failed to kill child process");
    }
}

fn spawn_chunk_reader<R>(reader: R, tx: mpsc::UnboundedSender<Chunk>, wrap: fn(Vec<u8>) -> Chunk)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(wrap(buf)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(error = %err, "output stream closed with error");
                    break;
                }
            }
        }
    });
}

fn spawn_message_reader<R>(reader: R, tx: mpsc::UnboundedSender<Incoming>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let incoming = match WorkerMessage::parse_line(&line) {
                        Some(message) => Incoming::Message(message),
                        None => Incoming::Raw(line),
                    };
                    if tx.send(incoming).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "worker stdout closed with error");
                    break;
                }
            }
        }
    });
}

fn echo_chunk(bytes: &[u8], is_stderr: bool, prefixer: Option<&LinePrefixer>) {
    let text = String::from_utf8_lossy(bytes);
    let rendered = match prefixer {
        Some(p) => p.apply(&text),
        None => text.into_owned(),
    };
    if is_stderr {
        write_stderr(&rendered);
    } else {
        write_stdout(&rendered);
    }
}

fn write_stdout(text: &str) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

fn write_stderr(text: &str) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(text.as_bytes());
    let _ = err.flush();
}
