pub mod execution;
pub mod leader;
pub mod queue;
pub mod repository;

pub use execution::{CronOutcomeRecorder, ExecutionControl};
pub use leader::{LeaderElection, SingleNodeLeader};
pub use queue::QueueBackend;
pub use repository::{
    CronExecutionFilter, CronExecutionRepository, CronJobFilter, CronJobRepository,
    Repositories, TaskBatchRepository, TaskEventFilter, TaskEventRepository, TaskFilter,
    TaskRepository,
};
