//! Batch executor - bounded-concurrency execution of independent tasks

use crate::core::context::CancellationFlag;
use crate::core::step::{BatchConfig, BatchTask};
use crate::core::template::stringify;
use crate::error::EngineError;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use tokio::sync::Semaphore;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Payload fields that name a processed file
const FILE_FIELDS: [&str; 3] = ["file", "path", "filename"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Error,
    Timeout,
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStatistics {
    /// Wall-clock time of the whole batch
    pub total_ms: u64,
    pub average_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Aggregated result of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// In input order
    pub results: Vec<TaskOutcome>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    pub timeout_tasks: usize,
    pub performance_statistics: PerformanceStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consolidated: Option<ConsolidatedReport>,
}

/// Merged view produced with `consolidate_results`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    pub report: String,
    pub files_processed: Vec<String>,
    /// status -> task ids
    pub task_breakdown: Map<String, Value>,
}

impl BatchReport {
    fn from_outcomes(
        tasks: &[BatchTask],
        results: Vec<TaskOutcome>,
        elapsed: Duration,
        consolidate: bool,
    ) -> Self {
        let count = |status| results.iter().filter(|r| r.status == status).count();
        let successful_tasks = count(TaskStatus::Success);
        let failed_tasks = count(TaskStatus::Error);
        let timeout_tasks = count(TaskStatus::Timeout);

        let durations: Vec<u64> = results.iter().map(|r| r.duration_ms).collect();
        let performance_statistics = PerformanceStatistics {
            total_ms: elapsed.as_millis() as u64,
            average_ms: if durations.is_empty() {
                0.0
            } else {
                durations.iter().sum::<u64>() as f64 / durations.len() as f64
            },
            min_ms: durations.iter().copied().min().unwrap_or(0),
            max_ms: durations.iter().copied().max().unwrap_or(0),
        };

        let consolidated = consolidate.then(|| consolidate_outcomes(tasks, &results));

        Self {
            total_tasks: results.len(),
            successful_tasks,
            failed_tasks,
            timeout_tasks,
            performance_statistics,
            consolidated,
            results,
        }
    }

    /// Counts placed in step metadata
    pub fn metadata(&self) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("total_tasks".to_string(), json!(self.total_tasks));
        metadata.insert("successful_tasks".to_string(), json!(self.successful_tasks));
        metadata.insert("failed_tasks".to_string(), json!(self.failed_tasks));
        metadata.insert("timeout_tasks".to_string(), json!(self.timeout_tasks));
        metadata.insert(
            "performance_statistics".to_string(),
            serde_json::to_value(self.performance_statistics).unwrap_or(Value::Null),
        );
        metadata
    }

    /// Step output: the per-task array, or the full report when consolidated
    pub fn to_output(&self) -> Value {
        let results = serde_json::to_value(&self.results).unwrap_or(Value::Null);
        match &self.consolidated {
            None => results,
            Some(consolidated) => json!({
                "results": results,
                "summary": {
                    "total_tasks": self.total_tasks,
                    "successful_tasks": self.successful_tasks,
                    "failed_tasks": self.failed_tasks,
                    "timeout_tasks": self.timeout_tasks,
                },
                "performance_statistics": self.performance_statistics,
                "consolidated_report": consolidated.report,
                "metadata": {
                    "files_processed": consolidated.files_processed,
                    "task_breakdown": consolidated.task_breakdown,
                },
            }),
        }
    }
}

fn consolidate_outcomes(tasks: &[BatchTask], results: &[TaskOutcome]) -> ConsolidatedReport {
    let mut report = String::new();
    for outcome in results {
        let status = serde_json::to_value(outcome.status)
            .map(|v| stringify(&v))
            .unwrap_or_default();
        report.push_str(&format!("## {} ({})\n", outcome.task_id, status));
        match &outcome.error {
            Some(error) => report.push_str(&format!("Error: {}\n\n", error)),
            None => report.push_str(&format!("{}\n\n", stringify(&outcome.output))),
        }
    }

    let files_processed = tasks
        .iter()
        .filter_map(|task| {
            FILE_FIELDS
                .iter()
                .find_map(|field| task.payload.get(field).and_then(Value::as_str))
                .map(str::to_string)
        })
        .collect();

    let mut task_breakdown = Map::new();
    for (status, key) in [
        (TaskStatus::Success, "successful"),
        (TaskStatus::Error, "failed"),
        (TaskStatus::Timeout, "timeout"),
    ] {
        let ids: Vec<Value> = results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| json!(r.task_id))
            .collect();
        task_breakdown.insert(key.to_string(), Value::Array(ids));
    }

    ConsolidatedReport {
        report: report.trim_end().to_string(),
        files_processed,
        task_breakdown,
    }
}

/// Runs tasks with at most `max_parallel` in flight
pub struct BatchExecutor;

impl BatchExecutor {
    /// Run every task through `runner`; outcomes keep the input order
    ///
    /// A task's failure or timeout never affects the others. Safety violations
    /// and cancellation are not task-scoped: once every task has settled, the
    /// first such error in input order is returned instead of a report. Tasks
    /// that have not started when the run is cancelled never run.
    pub async fn execute<F, Fut>(
        tasks: &[BatchTask],
        config: BatchConfig,
        cancellation: &CancellationFlag,
        runner: F,
    ) -> Result<BatchReport, EngineError>
    where
        F: Fn(BatchTask) -> Fut,
        Fut: Future<Output = Result<Value, EngineError>>,
    {
        let max_parallel = config.max_parallel.max(1);
        let semaphore = Semaphore::new(max_parallel);
        let started = Instant::now();
        info!(
            "Running batch of {} task(s) with max_parallel {}",
            tasks.len(),
            max_parallel
        );

        let runner = &runner;
        let semaphore = &semaphore;
        let handles = tasks.iter().cloned().map(|task| async move {
            let task_id = task.id.clone();
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(e) => return Ok(Self::errored(task_id, e.to_string(), 0)),
            };
            if cancellation.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let task_started = Instant::now();
            let result = if config.timeout_per_task_ms > 0 {
                let limit = Duration::from_millis(config.timeout_per_task_ms);
                match tokio::time::timeout(limit, runner(task)).await {
                    Ok(result) => result,
                    Err(_) => Err(EngineError::TaskTimeout {
                        task_id: task_id.clone(),
                        timeout_ms: config.timeout_per_task_ms,
                    }),
                }
            } else {
                runner(task).await
            };
            let duration_ms = task_started.elapsed().as_millis() as u64;

            match result {
                Ok(output) => {
                    debug!("Batch task {} succeeded in {}ms", task_id, duration_ms);
                    Ok(TaskOutcome {
                        task_id,
                        status: TaskStatus::Success,
                        output,
                        error: None,
                        duration_ms,
                    })
                }
                Err(e @ EngineError::TaskTimeout { .. }) => {
                    warn!("Batch task {} timed out", task_id);
                    Ok(TaskOutcome {
                        task_id,
                        status: TaskStatus::Timeout,
                        output: Value::Null,
                        error: Some(e.to_string()),
                        duration_ms,
                    })
                }
                Err(e) if e.is_safety_violation() || e.is_cancellation() => {
                    error!("Batch task {} hit a fatal error: {}", task_id, e);
                    Err(e)
                }
                Err(e) => {
                    warn!("Batch task {} failed: {}", task_id, e);
                    Ok(Self::errored(task_id, e.to_string(), duration_ms))
                }
            }
        });

        let mut results = Vec::with_capacity(tasks.len());
        for settled in join_all(handles).await {
            results.push(settled?);
        }
        let report = BatchReport::from_outcomes(
            tasks,
            results,
            started.elapsed(),
            config.consolidate_results,
        );
        info!(
            "Batch finished: {} succeeded, {} failed, {} timed out",
            report.successful_tasks, report.failed_tasks, report.timeout_tasks
        );
        Ok(report)
    }

    fn errored(task_id: String, error: String, duration_ms: u64) -> TaskOutcome {
        TaskOutcome {
            task_id,
            status: TaskStatus::Error,
            output: Value::Null,
            error: Some(error),
            duration_ms,
        }
    }
}
