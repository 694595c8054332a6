// src/exec/output.rs

//! Live output helpers: project-colored line prefixes and command headers.

use console::Style;

use crate::dag::Task;

const CLEAR_LINE: &str = "\x1b[2K";
const CURSOR_TO_COLUMN_ONE: &str = "\x1b[1G";

/// Stable color for a project, picked from its name.
pub fn project_color(project: &str) -> Style {
    let code: u32 = project.chars().map(|c| c as u32).sum();
    let base = Style::new();
    match code % 10 {
        0 => base.green(),
        1 => base.green().bright(),
        2 => base.red(),
        3 => base.red().bright(),
        4 => base.cyan(),
        5 => base.cyan().bright(),
        6 => base.yellow(),
        7 => base.yellow().bright(),
        8 => base.magenta(),
        _ => base.magenta().bright(),
    }
}

/// Prefixes every streamed line with `project:`.
#[derive(Debug, Clone)]
pub struct LinePrefixer {
    prefix: String,
}

impl LinePrefixer {
    /// Stdout prefixes are bold, stderr prefixes are not.
    pub fn new(project: &str, bold: bool) -> Self {
        let mut style = project_color(project);
        if bold {
            style = style.bold();
        }
        Self {
            prefix: format!("{} ", style.apply_to(format!("{project}:"))),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix one line.
    ///
    /// A clear-line sequence followed by a return to column one would wipe
    /// the prefix, so the prefix is repeated after it.
    pub fn apply(&self, line: &str) -> String {
        let clear_then_home = format!("{CLEAR_LINE}{CURSOR_TO_COLUMN_ONE}");
        let body = if line.contains(&clear_then_home) {
            line.replace(&clear_then_home, &format!("{clear_then_home}{}", self.prefix))
        } else {
            line.to_string()
        };
        format!("{}{}", self.prefix, body)
    }
}

/// Header printed before a task's streamed output.
pub fn command_header(task: &Task) -> String {
    let style = Style::new().bold();
    format!("\n{} {}\n", Style::new().dim().apply_to(">"), style.apply_to(task.printable_command()))
}

/// Header printed before a batch's output.
pub fn batch_header(executor_name: &str, count: usize) -> String {
    let bold = Style::new().bold();
    format!(
        "\n{} Running {} {} with {}\n",
        Style::new().dim().apply_to(">"),
        bold.apply_to(count),
        bold.apply_to("tasks"),
        bold.apply_to(executor_name)
    )
}
