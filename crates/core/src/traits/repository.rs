//! 记录存储接口
//!
//! 作业中心只依赖这里定义的增删改查接口，具体存储由外部实现提供。
//! 每个实体都提供 create / get_by_id / list / update / delete。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::SchedulerResult;
use crate::models::{
    CronExecution, CronJob, ExecutorKind, TaskBatch, TaskEvent, Task, TaskStatus,
};

/// 任务过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub statuses: Option<Vec<TaskStatus>>,
    pub queue_name: Option<String>,
    pub executor: Option<ExecutorKind>,
    pub cron_job_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub idempotency_key: Option<String>,
    pub created_since: Option<DateTime<Utc>>,
    pub updated_since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if self.status.is_some_and(|s| s != task.status) {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if self
            .queue_name
            .as_ref()
            .is_some_and(|q| *q != task.queue_name)
        {
            return false;
        }
        if let Some(kind) = self.executor {
            if task.executor_kind().ok() != Some(kind) {
                return false;
            }
        }
        if self.cron_job_id.is_some() && self.cron_job_id != task.cron_job_id {
            return false;
        }
        if self.batch_id.is_some() && self.batch_id != task.batch_id {
            return false;
        }
        if self.idempotency_key.is_some() && self.idempotency_key != task.idempotency_key {
            return false;
        }
        if self.created_since.is_some_and(|t| task.created_at < t) {
            return false;
        }
        if self.updated_since.is_some_and(|t| task.updated_at < t) {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct CronJobFilter {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub limit: Option<usize>,
}

impl CronJobFilter {
    pub fn matches(&self, job: &CronJob) -> bool {
        self.enabled.map_or(true, |e| e == job.enabled)
            && self
                .name
                .as_ref()
                .map_or(true, |n| job.name.contains(n.as_str()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct CronExecutionFilter {
    pub cron_job_id: Option<i64>,
    pub task_id: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct TaskEventFilter {
    pub task_id: Option<i64>,
    pub event_type: Option<String>,
    pub limit: Option<usize>,
}

/// 任务仓储
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建任务并返回带ID的记录
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    async fn update(&self, task: &Task) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize> {
        Ok(self.list(filter).await?.len())
    }
}

/// 定时作业仓储
#[async_trait]
pub trait CronJobRepository: Send + Sync {
    async fn create(&self, job: &CronJob) -> SchedulerResult<CronJob>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<CronJob>>;

    async fn list(&self, filter: &CronJobFilter) -> SchedulerResult<Vec<CronJob>>;

    async fn update(&self, job: &CronJob) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;
}

/// 定时作业触发记录仓储
#[async_trait]
pub trait CronExecutionRepository: Send + Sync {
    async fn create(&self, execution: &CronExecution) -> SchedulerResult<CronExecution>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<CronExecution>>;

    /// 按时间倒序返回
    async fn list(&self, filter: &CronExecutionFilter) -> SchedulerResult<Vec<CronExecution>>;

    async fn update(&self, execution: &CronExecution) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;
}

/// 任务事件仓储，事件只追加
#[async_trait]
pub trait TaskEventRepository: Send + Sync {
    async fn create(&self, event: &TaskEvent) -> SchedulerResult<TaskEvent>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<TaskEvent>>;

    /// 按创建顺序返回
    async fn list(&self, filter: &TaskEventFilter) -> SchedulerResult<Vec<TaskEvent>>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;
}

#[async_trait]
pub trait TaskBatchRepository: Send + Sync {
    async fn create(&self, batch: &TaskBatch) -> SchedulerResult<TaskBatch>;

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<TaskBatch>>;

    async fn list(&self) -> SchedulerResult<Vec<TaskBatch>>;

    async fn update(&self, batch: &TaskBatch) -> SchedulerResult<()>;

    async fn delete(&self, id: i64) -> SchedulerResult<()>;
}

/// 各组件共享的仓储集合
#[derive(Clone)]
pub struct Repositories {
    pub tasks: Arc<dyn TaskRepository>,
    pub cron_jobs: Arc<dyn CronJobRepository>,
    pub cron_executions: Arc<dyn CronExecutionRepository>,
    pub events: Arc<dyn TaskEventRepository>,
    pub batches: Arc<dyn TaskBatchRepository>,
}

impl Repositories {
    /// 追加事件
    pub async fn record_event(&self, event: TaskEvent) -> SchedulerResult<TaskEvent> {
        self.events.create(&event).await
    }

    pub async fn require_task(&self, id: i64) -> SchedulerResult<Task> {
        self.tasks
            .get_by_id(id)
            .await?
            .ok_or(crate::errors::SchedulerError::TaskNotFound { id })
    }

    pub async fn require_cron_job(&self, id: i64) -> SchedulerResult<CronJob> {
        self.cron_jobs
            .get_by_id(id)
            .await?
            .ok_or(crate::errors::SchedulerError::CronJobNotFound { id })
    }
}
