// src/lifecycle/static_output.rs

use std::io::{self, Write};
use std::sync::Mutex;

use console::Style;

use crate::dag::{Task, TaskId};
use crate::lifecycle::{LifeCycle, TaskMetadata, TaskRunResult};
use crate::types::TaskStatus;

#[derive(Default)]
struct Summary {
    failed: Vec<TaskId>,
    cached: Vec<TaskId>,
}

/// Append-only terminal output, suitable for CI logs.
///
/// Prints each task's header and buffered output when it is reported, and a
/// summary when the command ends.
pub struct StaticRunTerminalOutputLifeCycle {
    initiating_project: Option<String>,
    total_tasks: usize,
    summary: Mutex<Summary>,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StaticRunTerminalOutputLifeCycle {
    pub fn new(initiating_project: Option<String>, total_tasks: usize) -> Self {
        Self::with_writer(initiating_project, total_tasks, Box::new(io::stdout()))
    }

    pub fn with_writer(
        initiating_project: Option<String>,
        total_tasks: usize,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            initiating_project,
            total_tasks,
            summary: Mutex::new(Summary::default()),
            out: Mutex::new(out),
        }
    }

    fn write(&self, text: &str) {
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        // terminal output is best effort
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

impl LifeCycle for StaticRunTerminalOutputLifeCycle {
    fn start_command(&self) {
        if self.total_tasks > 1 {
            let cyan = Style::new().cyan().bold();
            self.write(&format!(
                "\n{} Running {} tasks:\n",
                cyan.apply_to(">"),
                self.total_tasks
            ));
        }
    }

    fn end_command(&self) {
        let summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        let dim = Style::new().dim();

        let mut text = String::from("\n");
        if summary.failed.is_empty() {
            let green = Style::new().green().bold();
            text.push_str(&format!(
                "{} Successfully ran {} tasks\n",
                green.apply_to(">"),
                self.total_tasks
            ));
            if !summary.cached.is_empty() {
                text.push_str(&format!(
                    "\n  {}\n",
                    dim.apply_to(format!(
                        "Read the output from the cache instead of running the command for {} out of {} tasks.",
                        summary.cached.len(),
                        self.total_tasks
                    ))
                ));
            }
        } else {
            let red = Style::new().red().bold();
            text.push_str(&format!(
                "{} Running {} tasks failed\n\n  {}\n\n",
                red.apply_to(">"),
                self.total_tasks,
                dim.apply_to("Failed tasks:")
            ));
            for id in &summary.failed {
                text.push_str(&format!("  {} {}\n", dim.apply_to("-"), id));
            }
            text.push_str(&format!(
                "\n  {} --verbose {}\n",
                dim.apply_to("Hint: run the command with"),
                dim.apply_to("for more details.")
            ));
        }
        drop(summary);
        self.write(&text);
    }

    fn end_tasks(&self, results: &[TaskRunResult], _metadata: TaskMetadata) {
        let mut summary = self.summary.lock().unwrap_or_else(|e| e.into_inner());
        for r in results {
            match r.status {
                TaskStatus::Failure => summary.failed.push(r.task.id.clone()),
                s if s.is_cache_hit() => summary.cached.push(r.task.id.clone()),
                _ => {}
            }
        }
    }

    fn print_task_terminal_output(&self, task: &Task, status: TaskStatus, output: &str) {
        let from_initiating = self
            .initiating_project
            .as_deref()
            .is_some_and(|p| p == task.target.project);

        if matches!(status, TaskStatus::Success | TaskStatus::Failure) || from_initiating {
            let marker = match status {
                TaskStatus::Failure => Style::new().red().apply_to("✖"),
                s if s.is_cache_hit() => Style::new().dim().apply_to("[cache]"),
                TaskStatus::Skipped => Style::new().dim().apply_to("[skipped]"),
                _ => Style::new().green().apply_to("✔"),
            };
            self.write(&format!(
                "\n{} {} {}\n\n{}",
                Style::new().dim().apply_to(">"),
                Style::new().bold().apply_to(task.printable_command()),
                marker,
                output
            ));
        }
    }
}
