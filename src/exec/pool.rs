// src/exec/pool.rs

//! Registry of live worker processes owned by one orchestrator.
//!
//! Every spawned child registers itself for as long as it runs. When the
//! parent receives a termination signal, [`WorkerPool::terminate_all`] fans
//! it out to every registered child; children registered afterwards are
//! signalled immediately.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, info};

/// Signals the parent forwards to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl TerminationSignal {
    pub fn number(self) -> i32 {
        match self {
            TerminationSignal::Hangup => 1,
            TerminationSignal::Interrupt => 2,
            TerminationSignal::Terminate => 15,
        }
    }

    /// Conventional exit code for a process killed by this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TerminationSignal::Hangup => "SIGHUP",
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exit code for a child terminated by signal number `signo`.
pub fn signal_exit_code(signo: i32) -> i32 {
    128 + signo
}

struct LiveWorker {
    label: String,
    pid: Option<u32>,
    notify: Option<oneshot::Sender<TerminationSignal>>,
}

#[derive(Default)]
struct PoolInner {
    next_id: u64,
    live: HashMap<u64, LiveWorker>,
    terminated: Option<TerminationSignal>,
}

/// Shared handle to the set of live workers.
#[derive(Clone, Default)]
pub struct WorkerPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("WorkerPool")
            .field("live", &inner.live.len())
            .field("terminated", &inner.terminated)
            .finish()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live worker.
    ///
    /// The receiver resolves when the pool is asked to terminate; the
    /// worker is expected to forward the signal to its process. Dropping the
    /// guard unregisters the worker.
    pub fn register(
        &self,
        label: impl Into<String>,
        pid: Option<u32>,
    ) -> (WorkerGuard, oneshot::Receiver<TerminationSignal>) {
        let (tx, rx) = oneshot::channel();
        let label = label.into();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let id = inner.next_id;
        inner.next_id += 1;

        let notify = match inner.terminated {
            Some(signal) => {
                debug!(worker = %label, signal = %signal, "pool already terminated; signalling new worker");
                let _ = tx.send(signal);
                None
            }
            None => Some(tx),
        };

        debug!(worker = %label, pid = ?pid, "registered worker");
        inner.live.insert(id, LiveWorker { label, pid, notify });

        (
            WorkerGuard {
                id,
                pool: self.clone(),
            },
            rx,
        )
    }

    /// Forward `signal` to every live worker and remember it for workers
    /// registered later. Only the first signal is remembered.
    pub fn terminate_all(&self, signal: TerminationSignal) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.terminated.get_or_insert(signal);

        let mut notified = 0;
        for worker in inner.live.values_mut() {
            if let Some(tx) = worker.notify.take() {
                if tx.send(signal).is_ok() {
                    notified += 1;
                }
                debug!(worker = %worker.label, pid = ?worker.pid, signal = %signal, "forwarded signal");
            }
        }
        info!(signal = %signal, workers = notified, "terminating live workers");
        notified
    }

    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.live.len()
    }

    /// The signal the pool was terminated with, if any.
    pub fn terminated_by(&self) -> Option<TerminationSignal> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.terminated
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = inner.live.remove(&id) {
            debug!(worker = %worker.label, "unregistered worker");
        }
    }
}

/// Keeps a worker registered until dropped.
pub struct WorkerGuard {
    id: u64,
    pool: WorkerPool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.pool.unregister(self.id);
    }
}

/// Wait for SIGHUP, SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_termination_signal() -> std::io::Result<TerminationSignal> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let received = tokio::select! {
        _ = hangup.recv() => TerminationSignal::Hangup,
        _ = interrupt.recv() => TerminationSignal::Interrupt,
        _ = terminate.recv() => TerminationSignal::Terminate,
    };
    info!(signal = %received, "received termination signal");
    Ok(received)
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn wait_for_termination_signal() -> std::io::Result<TerminationSignal> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    Ok(TerminationSignal::Interrupt)
}
