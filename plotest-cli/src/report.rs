//! Human-readable run reporting on stderr.

use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use plotest::{Reporter, Status, Summary, TestResult};

use crate::use_fancy_output;

/// Draws flash progress and one line per test.
pub(crate) struct ConsoleReporter {
    quiet: bool,
    fancy: bool,
    bar: Option<ProgressBar>,
    step: String,
}

impl ConsoleReporter {
    pub(crate) fn new(quiet: bool) -> Self {
        Self {
            quiet,
            fancy: use_fancy_output(),
            bar: None,
            step: String::new(),
        }
    }

    fn progress_bar(&mut self) -> &ProgressBar {
        let (quiet, fancy) = (self.quiet, self.fancy);
        self.bar
            .get_or_insert_with(|| {
                if quiet || !fancy {
                    return ProgressBar::hidden();
                }
                let pb = ProgressBar::new(100);
                #[allow(clippy::unwrap_used)] // Static template string
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                        .unwrap()
                        .progress_chars("#>-"),
                );
                pb.set_draw_target(ProgressDrawTarget::stderr());
                pb
            })
    }

    fn finish_flash(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish_with_message("flashed");
        }
    }
}

/// One result line without colors: `name: STATUS [STAGE] message`.
pub(crate) fn result_line(name: &str, result: &TestResult) -> String {
    let mut line = format!("{name}: {}", result.status);
    if let Some(stage) = result.stage {
        line.push_str(&format!(" [{stage}]"));
    }
    if !result.message.is_empty() {
        line.push(' ');
        line.push_str(&result.message);
    }
    line
}

impl Reporter for ConsoleReporter {
    fn flash_progress(&mut self, step: &str, done: u64, total: u64) {
        if step != self.step {
            self.step = step.to_string();
            self.progress_bar()
                .set_message(step.to_string());
        }
        if total > 0 {
            let pb = self.progress_bar();
            pb.set_position(done.saturating_mul(100) / total);
        }
    }

    fn test_started(&mut self, name: &str) {
        self.finish_flash();
        if !self.quiet {
            eprintln!("{} {name}", style("▶").cyan());
        }
    }

    fn test_finished(&mut self, name: &str, result: &TestResult) {
        if result.status == Status::Ok && self.quiet {
            return;
        }
        if !self.fancy {
            eprintln!("  {}", result_line(name, result));
            return;
        }
        let status = match result.status {
            Status::Ok => style("OK").green().bold(),
            Status::Fail => style("FAIL").red().bold(),
            Status::Skip => style("SKIP").yellow(),
        };
        let stage = result
            .stage
            .map_or_else(String::new, |s| format!(" [{s}]"));
        let message = if result.message.is_empty() {
            String::new()
        } else {
            format!(" {}", style(&result.message).dim())
        };
        eprintln!("  {name}: {status}{stage}{message}");
        for sub in &result.subresults {
            if sub.status == Status::Fail {
                eprintln!("    {} {}: {}", style("✗").red(), sub.name, sub.message);
            }
        }
    }

    fn summary(&mut self, summary: &Summary) {
        self.finish_flash();
        if summary.total() == 0 {
            return;
        }
        let line = format!(
            "{} passed, {} failed, {} skipped",
            summary.passed, summary.failed, summary.skipped
        );
        if summary.is_success() {
            eprintln!("\n{} {}", style("✓").green().bold(), line);
        } else {
            eprintln!("\n{} {}", style("✗").red().bold(), line);
        }
    }
}
