pub mod batch;
pub mod cron;
pub mod event;
pub mod queue;
pub mod result;
pub mod task;

pub use batch::{BatchStatus, TaskBatch};
pub use cron::{ConcurrencyPolicy, CronExecution, CronExecutionStatus, CronJob, TaskTemplate};
pub use event::{event_sources, event_types, TaskEvent};
pub use queue::{QueueConfig, QueueItem, QueueStats};
pub use result::TaskResult;
pub use task::{
    priority, ExecutorKind, RetryBackoff, ScheduleKind, Task, TaskStatus, DEFAULT_QUEUE,
    DEFAULT_TIMEOUT_SECONDS,
};
