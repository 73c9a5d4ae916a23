//! Metrics definitions for task orchestration monitoring.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

/// Label for the worker index in metrics.
pub const WORKER_LABEL: &str = "worker";

/// Label for the stage name in metrics.
pub const STAGE_LABEL: &str = "stage";

/// Label for error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the outcome of a processed item.
pub const OUTCOME_LABEL: &str = "outcome";

// Worker pool metrics

/// Counter for tasks that completed successfully.
pub const TASKFLOW_TASKS_COMPLETED_TOTAL: &str = "taskflow_tasks_completed_total";

/// Counter for tasks that failed or panicked.
pub const TASKFLOW_TASKS_FAILED_TOTAL: &str = "taskflow_tasks_failed_total";

/// Gauge for tasks currently executing on a worker.
pub const TASKFLOW_TASKS_IN_FLIGHT: &str = "taskflow_tasks_in_flight";

/// Histogram for task execution duration in seconds.
pub const TASKFLOW_TASK_DURATION_SECONDS: &str = "taskflow_task_duration_seconds";

// Rate limiter metrics

/// Counter for admissions granted by rate limiters.
pub const TASKFLOW_ADMISSIONS_TOTAL: &str = "taskflow_admissions_total";

// Pipeline metrics

/// Counter for items emitted by pipeline stages.
pub const TASKFLOW_STAGE_ITEMS_TOTAL: &str = "taskflow_stage_items_total";

/// Registers descriptions for every metric emitted by this crate.
///
/// Safe to call multiple times; the descriptions are registered once.
pub fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            TASKFLOW_TASKS_COMPLETED_TOTAL,
            Unit::Count,
            "Total number of tasks that completed successfully"
        );

        describe_counter!(
            TASKFLOW_TASKS_FAILED_TOTAL,
            Unit::Count,
            "Total number of tasks that failed or panicked"
        );

        describe_gauge!(
            TASKFLOW_TASKS_IN_FLIGHT,
            Unit::Count,
            "Number of tasks currently executing on a pool worker"
        );

        describe_histogram!(
            TASKFLOW_TASK_DURATION_SECONDS,
            Unit::Seconds,
            "Time taken to execute a single task"
        );

        describe_counter!(
            TASKFLOW_ADMISSIONS_TOTAL,
            Unit::Count,
            "Total number of admissions granted by rate limiters"
        );

        describe_counter!(
            TASKFLOW_STAGE_ITEMS_TOTAL,
            Unit::Count,
            "Total number of items handled by pipeline stages, by outcome"
        );
    });
}
