pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use errors::{ErrorCategory, SchedulerError, SchedulerResult};
pub use models::{
    event_sources, event_types, priority, BatchStatus, ConcurrencyPolicy, CronExecution,
    CronExecutionStatus, CronJob, ExecutorKind, QueueConfig, QueueItem, QueueStats,
    RetryBackoff, ScheduleKind, Task, TaskBatch, TaskEvent, TaskResult, TaskStatus,
    TaskTemplate, DEFAULT_QUEUE, DEFAULT_TIMEOUT_SECONDS,
};
pub use traits::{
    CronExecutionFilter, CronExecutionRepository, CronJobFilter, CronJobRepository,
    CronOutcomeRecorder, ExecutionControl, LeaderElection, QueueBackend, Repositories, SingleNodeLeader,
    TaskBatchRepository, TaskEventFilter, TaskEventRepository, TaskFilter, TaskRepository,
};
