//! CLI output formatting

use crate::core::{ExecutionStatus, StepResult};
use crate::error::PipelineFailure;
use crate::execution::ExecutionEvent;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "! ");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "- ");

/// Create a progress bar over root-level steps
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PipelineStarted {
            run_id,
            pipeline_id,
            depth,
            total_steps,
        } => {
            if *depth == 0 {
                format!(
                    "{} Starting pipeline {} ({}, {} steps)",
                    ROCKET,
                    style(pipeline_id).bold(),
                    style(&run_id.to_string()[..8]).dim(),
                    total_steps
                )
            } else {
                format!(
                    "{}{} Entering {} ({} steps)",
                    indent(*depth),
                    INFO,
                    style(pipeline_id).bold(),
                    total_steps
                )
            }
        }
        ExecutionEvent::StepStarted {
            step_name,
            kind,
            depth,
            ..
        } => format!(
            "{}{} {} {}",
            indent(*depth),
            SPINNER,
            style(step_name).cyan(),
            style(format!("[{}]", kind)).dim()
        ),
        ExecutionEvent::StepSkipped {
            step_name, depth, ..
        } => format!(
            "{}{} {} {}",
            indent(*depth),
            SKIP,
            style(step_name).dim(),
            style("(condition not met)").dim()
        ),
        ExecutionEvent::StepCompleted {
            step_name,
            depth,
            duration_ms,
            degraded,
            ..
        } => {
            let line = format!(
                "{}{} {} {}",
                indent(*depth),
                CHECK,
                style(step_name).green(),
                style(format!("({}ms)", duration_ms)).dim()
            );
            if *degraded {
                format!("{} {}", line, style("degraded").yellow())
            } else {
                line
            }
        }
        ExecutionEvent::StepFailed {
            step_name,
            depth,
            error,
            continued,
            ..
        } => {
            let line = format!(
                "{}{} {}: {}",
                indent(*depth),
                CROSS,
                style(step_name).red(),
                style(error).dim()
            );
            if *continued {
                format!("{} {}", line, style("(continuing)").yellow())
            } else {
                line
            }
        }
        ExecutionEvent::PipelineCompleted {
            run_id,
            pipeline_id,
            depth,
            status,
        } => format!(
            "{}{} Pipeline {} ({}) {}",
            indent(*depth),
            INFO,
            style(pipeline_id).bold(),
            style(&run_id.to_string()[..8]).dim(),
            format_status(*status)
        ),
    }
}

/// One summary line per recorded step
pub fn format_step_result(result: &StepResult) -> String {
    if result.success {
        format!(
            "  {} {} {}",
            CHECK,
            style(&result.step_name).green(),
            style(format!("{}ms", result.duration_ms)).dim()
        )
    } else {
        format!(
            "  {} {} {}",
            CROSS,
            style(&result.step_name).red(),
            style(result.error.as_deref().unwrap_or("failed")).dim()
        )
    }
}

/// The failing step path, chain and causes of a failed run
pub fn format_failure(failure: &PipelineFailure) -> String {
    let innermost = failure.innermost();
    let mut lines = vec![
        format!(
            "{} Failed at {}",
            CROSS,
            style(failure.step_path().join(" > ")).red().bold()
        ),
        format!(
            "  Pipeline chain: {}",
            style(innermost.pipeline_chain.join(" -> ")).dim()
        ),
    ];
    for (i, cause) in failure.error_chain().iter().enumerate() {
        lines.push(format!("  {}{}", indent(i), cause));
    }
    lines.join("\n")
}

/// Format step output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
