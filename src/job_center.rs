//! 作业中心
//!
//! 进程的组合根：显式构造队列、执行器、定时调度器与消费者池，并对外提供
//! 定时作业、任务提交、查询与控制的全部操作。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobcenter_core::{
    config::AppConfig, event_sources, event_types, CronExecution, CronExecutionFilter, CronJob,
    CronJobFilter, LeaderElection, QueueBackend, QueueItem, QueueStats, Repositories,
    SchedulerError, SchedulerResult, SingleNodeLeader, Task, TaskBatch, TaskEvent,
    TaskEventFilter, TaskFilter, TaskResult, TaskStatus, TaskTemplate,
};
use jobcenter_dispatcher::{CronExpression, CronScheduler, FireOutcome};
use jobcenter_infrastructure::{BatchEnqueueOutcome, MemoryQueueBackend, TaskQueue};
use jobcenter_worker::{
    BatchExecutor, HandlerRegistry, IdempotencyGuard, RetryHandler, TaskExecutor, WorkerPool,
    WorkerPoolStats,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Running {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct JobCenterBuilder {
    config: AppConfig,
    repos: Repositories,
    backend: Option<Arc<dyn QueueBackend>>,
    handlers: Option<HandlerRegistry>,
    leader: Option<Arc<dyn LeaderElection>>,
}

impl JobCenterBuilder {
    pub fn queue_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn leader_election(mut self, leader: Arc<dyn LeaderElection>) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn build(self) -> JobCenter {
        let config = self.config;
        let repos = self.repos;

        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryQueueBackend::new()));
        let queue = Arc::new(TaskQueue::new(backend, repos.clone()));
        queue.register_queues(config.queues.iter().cloned());

        let handlers = self
            .handlers
            .unwrap_or_else(|| HandlerRegistry::new(&config.executor));
        let executor = Arc::new(TaskExecutor::new(
            repos.clone(),
            handlers,
            config.executor.finished_history,
        ));
        let retry = Arc::new(RetryHandler::new(executor.clone(), config.retry.clone()));
        let idempotency = Arc::new(IdempotencyGuard::new(
            retry.clone(),
            config.idempotency.clone(),
        ));
        let batch = BatchExecutor::from_config(executor.clone(), &config.batch);

        let scheduler = Arc::new(
            CronScheduler::new(Arc::clone(&queue), repos.clone(), config.scheduler.clone())
                .with_leader_election(self.leader.unwrap_or_else(|| Arc::new(SingleNodeLeader)))
                .with_execution_control(executor.clone()),
        );
        let pool = WorkerPool::new(Arc::clone(&queue), executor.clone(), config.worker.clone())
            .with_cron_recorder(scheduler.clone());

        JobCenter {
            config,
            repos,
            queue,
            executor,
            retry,
            idempotency,
            batch,
            scheduler,
            pool,
            running: tokio::sync::Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }
}

pub struct JobCenter {
    config: AppConfig,
    repos: Repositories,
    queue: Arc<TaskQueue>,
    executor: Arc<TaskExecutor>,
    retry: Arc<RetryHandler>,
    idempotency: Arc<IdempotencyGuard>,
    batch: BatchExecutor,
    scheduler: Arc<CronScheduler>,
    pool: WorkerPool,
    running: tokio::sync::Mutex<Option<Running>>,
    // 消费者池停止后不可复用
    stopped: AtomicBool,
}

impl JobCenter {
    pub fn builder(config: AppConfig, repos: Repositories) -> JobCenterBuilder {
        JobCenterBuilder {
            config,
            repos,
            backend: None,
            handlers: None,
            leader: None,
        }
    }

    /// 使用内存队列与默认处理器
    pub fn new(config: AppConfig, repos: Repositories) -> Self {
        Self::builder(config, repos).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.scheduler
    }

    // ---- 生命周期 ----

    /// 加载启用的定时作业，启动各队列消费者、调度时钟与幂等记录清理
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut running = self.running.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SchedulerError::Internal(
                "作业中心已停止，不能再次启动".to_string(),
            ));
        }
        if running.is_some() {
            warn!("作业中心已在运行");
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        if self.config.scheduler.enabled {
            self.scheduler.load_jobs().await?;
            handles.push(self.scheduler.start(shutdown.child_token()));
        }
        if self.config.worker.enabled {
            for name in self.queue.queue_names() {
                let workers = self.queue.queue_config(&name).max_workers;
                self.pool.start(&name, workers)?;
            }
        }
        handles.push(self.idempotency.start_cleanup(shutdown.child_token()));

        *running = Some(Running { shutdown, handles });
        info!(
            queues = self.queue.queue_names().len(),
            cron_jobs = self.scheduler.job_count(),
            "作业中心已启动"
        );
        Ok(())
    }

    /// 停止调度时钟、清理任务与全部消费者
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        self.stopped.store(true, Ordering::SeqCst);
        running.shutdown.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {e}");
            }
        }
        self.pool.stop().await;
        info!("作业中心已停止");
    }

    // ---- 定时作业 ----

    /// 校验表达式、时区与任务模板；不合法的作业不会被创建
    fn validate_cron_job(job: &CronJob) -> SchedulerResult<()> {
        if job.name.trim().is_empty() {
            return Err(SchedulerError::validation("定时作业名称不能为空"));
        }
        let expression = CronExpression::parse_with_timezone(&job.cron_expr, &job.timezone)?;
        if expression.next_execution_time(Utc::now()).is_none() {
            return Err(SchedulerError::invalid_cron(&job.cron_expr, "表达式不会再触发"));
        }
        TaskTemplate::parse(&job.task_template)?;
        Ok(())
    }

    pub async fn create_cron_job(&self, job: CronJob) -> SchedulerResult<CronJob> {
        Self::validate_cron_job(&job)?;
        let created = self.repos.cron_jobs.create(&job).await?;
        info!(cron_job_id = created.id, name = %created.name, "创建定时作业");
        if created.enabled {
            return self.scheduler.add_job(created).await;
        }
        Ok(created)
    }

    pub async fn get_cron_job(&self, id: i64) -> SchedulerResult<CronJob> {
        self.repos.require_cron_job(id).await
    }

    pub async fn list_cron_jobs(&self, filter: &CronJobFilter) -> SchedulerResult<Vec<CronJob>> {
        self.repos.cron_jobs.list(filter).await
    }

    /// 更新定义；运行统计沿用存储中的值
    pub async fn update_cron_job(&self, mut job: CronJob) -> SchedulerResult<CronJob> {
        Self::validate_cron_job(&job)?;
        let existing = self.repos.require_cron_job(job.id).await?;
        job.run_count = existing.run_count;
        job.success_count = existing.success_count;
        job.fail_count = existing.fail_count;
        job.last_run_at = existing.last_run_at;
        job.prev_run_at = existing.prev_run_at;
        job.created_at = existing.created_at;
        job.updated_at = Utc::now();
        if !job.enabled {
            job.next_run_at = None;
        }
        self.repos.cron_jobs.update(&job).await?;
        self.scheduler.update_job(job).await
    }

    pub async fn delete_cron_job(&self, id: i64) -> SchedulerResult<()> {
        self.repos.require_cron_job(id).await?;
        self.scheduler.remove_job(id)?;
        self.repos.cron_jobs.delete(id).await?;
        info!(cron_job_id = id, "删除定时作业");
        Ok(())
    }

    pub async fn enable_cron_job(&self, id: i64) -> SchedulerResult<CronJob> {
        let mut job = self.repos.require_cron_job(id).await?;
        job.enabled = true;
        self.update_cron_job(job).await
    }

    pub async fn disable_cron_job(&self, id: i64) -> SchedulerResult<CronJob> {
        let mut job = self.repos.require_cron_job(id).await?;
        job.enabled = false;
        self.update_cron_job(job).await
    }

    /// 手动触发一次，不影响计划时间
    pub async fn trigger_cron_job(&self, id: i64) -> SchedulerResult<FireOutcome> {
        self.scheduler.trigger_job(id).await
    }

    pub async fn get_cron_executions(
        &self,
        job_id: i64,
        limit: usize,
    ) -> SchedulerResult<Vec<CronExecution>> {
        self.repos
            .cron_executions
            .list(&CronExecutionFilter {
                cron_job_id: Some(job_id),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }

    pub fn get_next_runs(&self, job_id: i64, count: usize) -> SchedulerResult<Vec<DateTime<Utc>>> {
        Ok(self.scheduler.get_next_runs(job_id, count)?.collect())
    }

    // ---- 任务提交 ----

    pub async fn enqueue_task(&self, task: Task) -> SchedulerResult<Task> {
        self.queue.enqueue_task(task).await
    }

    pub async fn batch_enqueue(&self, tasks: Vec<Task>) -> BatchEnqueueOutcome {
        self.queue.batch_enqueue(tasks).await
    }

    pub async fn delayed_enqueue(&self, task: Task, delay: Duration) -> SchedulerResult<Task> {
        self.queue.delayed_enqueue(task, delay).await
    }

    pub async fn priority_enqueue(&self, task: Task) -> SchedulerResult<Task> {
        self.queue.priority_enqueue(task).await
    }

    pub async fn dedup_enqueue(
        &self,
        task: Task,
        key: &str,
        window: Duration,
    ) -> SchedulerResult<Task> {
        self.queue.dedup_enqueue(task, key, window).await
    }

    /// 以批次形式提交一组任务，批次进度由消费者在任务结束时刷新
    pub async fn submit_batch(
        &self,
        mut batch: TaskBatch,
        tasks: Vec<Task>,
    ) -> SchedulerResult<TaskBatch> {
        if tasks.is_empty() {
            return Err(SchedulerError::validation("批次中没有任务"));
        }
        batch.total = tasks.len();
        let batch = self.repos.batches.create(&batch).await?;

        let tasks = tasks
            .into_iter()
            .map(|mut t| {
                t.batch_id = Some(batch.id);
                t
            })
            .collect();
        let outcome = self.queue.batch_enqueue(tasks).await;
        for err in &outcome.errors {
            warn!(
                batch_id = batch.id,
                index = err.index,
                task = %err.task_name,
                "批次任务入队失败: {}",
                err.error
            );
        }

        let rejected = outcome.errors.len();
        if outcome.task_ids.is_empty() {
            return Err(outcome
                .errors
                .into_iter()
                .next()
                .map(|e| e.error)
                .unwrap_or_else(|| SchedulerError::validation("批次中没有任务")));
        }

        // 消费者可能已经刷新过进度，以存储中的计数为准
        let mut batch = self.get_batch(batch.id).await?;
        batch.total = outcome.task_ids.len();
        batch.task_ids = outcome.task_ids;
        batch.refresh_status();
        self.repos.batches.update(&batch).await?;
        info!(
            batch_id = batch.id,
            total = batch.total,
            rejected,
            "批次已提交"
        );
        Ok(batch)
    }

    pub async fn get_batch(&self, id: i64) -> SchedulerResult<TaskBatch> {
        self.repos
            .batches
            .get_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::validation(format!("批次不存在: {id}")))
    }

    /// 不经过队列，按分组直接执行一组任务，结果与输入顺序一致
    pub async fn execute_batch(&self, tasks: Vec<Task>) -> Vec<SchedulerResult<TaskResult>> {
        let mut items = Vec::with_capacity(tasks.len());
        let mut rejected = Vec::new();
        for (index, task) in tasks.into_iter().enumerate() {
            match self.persist_for_direct_run(task).await {
                Ok(item) => items.push((index, item)),
                Err(e) => rejected.push((index, e)),
            }
        }

        let positions: Vec<usize> = items.iter().map(|(i, _)| *i).collect();
        let executed = self
            .batch
            .execute_batch(items.into_iter().map(|(_, item)| item).collect())
            .await;

        let mut results: Vec<Option<SchedulerResult<TaskResult>>> =
            (0..positions.len() + rejected.len()).map(|_| None).collect();
        for (position, result) in positions.into_iter().zip(executed) {
            results[position] = Some(result);
        }
        for (position, err) in rejected {
            results[position] = Some(Err(err));
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(SchedulerError::Internal("批量结果缺失".to_string()))))
            .collect()
    }

    /// 同一幂等键在 ttl 内只执行一次，失败按重试配置重试
    pub async fn execute_idempotent(
        &self,
        key: &str,
        task: Task,
        ttl: Option<Duration>,
    ) -> SchedulerResult<TaskResult> {
        task.validate()?;
        let ttl = ttl.unwrap_or_else(|| self.config.idempotency.default_ttl());
        // 只有取得执行权的调用才落库任务
        self.idempotency
            .execute_prepared(key, ttl, || self.persist_for_direct_run(task))
            .await
    }

    /// 直接执行并按重试配置重试
    pub async fn execute_with_retry(&self, task: Task) -> SchedulerResult<TaskResult> {
        let item = self.persist_for_direct_run(task).await?;
        self.retry.execute_with_retry(&item).await
    }

    async fn persist_for_direct_run(&self, mut task: Task) -> SchedulerResult<QueueItem> {
        task.validate()?;
        let config = self.queue.queue_config(&task.queue_name);
        if task.priority.is_none() {
            task.priority = Some(config.priority);
        }
        if task.timeout_seconds.is_none() {
            task.timeout_seconds = Some(config.timeout_seconds);
        }
        task.status = TaskStatus::Pending;
        let created = self.repos.tasks.create(&task).await?;
        Ok(QueueItem::new(
            created.id,
            created.queue_name.clone(),
            created.effective_priority(),
        ))
    }

    // ---- 查询 ----

    pub async fn get_queue_stats(&self, queue_name: &str) -> SchedulerResult<QueueStats> {
        self.queue.get_queue_stats(queue_name).await
    }

    pub async fn get_all_queue_stats(&self) -> SchedulerResult<Vec<QueueStats>> {
        self.queue.get_all_queue_stats().await
    }

    pub async fn get_task_events(&self, task_id: i64) -> SchedulerResult<Vec<TaskEvent>> {
        self.repos
            .events
            .list(&TaskEventFilter {
                task_id: Some(task_id),
                ..Default::default()
            })
            .await
    }

    pub async fn get_task(&self, id: i64) -> SchedulerResult<Task> {
        self.repos.require_task(id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<(Vec<Task>, usize)> {
        let total = self.repos.tasks.count(filter).await?;
        let tasks = self.repos.tasks.list(filter).await?;
        Ok((tasks, total))
    }

    pub fn get_worker_stats(&self, queue_name: &str) -> Option<WorkerPoolStats> {
        self.pool.stats(queue_name)
    }

    pub fn get_all_worker_stats(&self) -> Vec<WorkerPoolStats> {
        self.pool.all_stats()
    }

    pub fn scale_workers(&self, queue_name: &str, workers: usize) -> SchedulerResult<()> {
        self.pool.scale(queue_name, workers)
    }

    // ---- 执行控制 ----

    pub fn cancel(&self, execution_id: &str) -> SchedulerResult<()> {
        self.executor.cancel(execution_id)
    }

    pub fn get_status(&self, execution_id: &str) -> SchedulerResult<TaskStatus> {
        self.executor.get_status(execution_id)
    }

    /// 取消任务：未开始的从队列移除，运行中的通过在途执行取消
    pub async fn cancel_task(&self, task_id: i64) -> SchedulerResult<Task> {
        let task = self.repos.require_task(task_id).await?;
        match task.status {
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                self.queue.cancel_pending(task_id, "操作员取消").await?;
            }
            TaskStatus::Running => {
                let canceled = self.executor.cancel_task(task_id)?;
                // 执行器可能已先行写入终态
                let mut task = self.repos.require_task(task_id).await?;
                if task.status == TaskStatus::Running {
                    task.transition_to(TaskStatus::Canceled)?;
                    task.error_message = Some("操作员取消".to_string());
                    self.repos.tasks.update(&task).await?;
                }
                self.record_event(task_id, event_types::CANCELED, "操作员取消运行中的任务", json!({
                    "executions": canceled,
                }))
                .await;
            }
            status => {
                return Err(SchedulerError::InvalidStatusTransition {
                    task_id,
                    from: status.to_string(),
                    to: TaskStatus::Canceled.to_string(),
                });
            }
        }
        info!(task_id, "任务已取消");
        self.repos.require_task(task_id).await
    }

    /// 手动重试失败或超时的任务，不受重试次数限制
    pub async fn retry_task(&self, task_id: i64) -> SchedulerResult<Task> {
        let mut task = self.repos.require_task(task_id).await?;
        task.transition_to(TaskStatus::Retrying)?;
        task.retry_count += 1;
        self.repos.tasks.update(&task).await?;
        self.record_event(
            task_id,
            event_types::RETRY_SCHEDULED,
            "手动重试",
            json!({ "retry_count": task.retry_count }),
        )
        .await;
        self.queue.requeue(task_id).await?;
        info!(task_id, retry_count = task.retry_count, "任务已重新入队");
        self.repos.require_task(task_id).await
    }

    /// 以原任务的回滚命令创建回滚任务，原任务标记为 rolledback
    pub async fn rollback_task(&self, task_id: i64) -> SchedulerResult<Task> {
        let mut task = self.repos.require_task(task_id).await?;
        if !task.status.can_transition_to(TaskStatus::Rolledback) {
            return Err(SchedulerError::InvalidStatusTransition {
                task_id,
                from: task.status.to_string(),
                to: TaskStatus::Rolledback.to_string(),
            });
        }
        let command = match task.rollback_command.as_deref() {
            Some(cmd) if task.rollback_enabled && !cmd.trim().is_empty() => cmd.to_string(),
            _ => {
                return Err(SchedulerError::validation(format!(
                    "任务 {task_id} 未配置回滚命令"
                )))
            }
        };

        let mut rollback = Task::new(format!("{}-rollback", task.name), &task.executor, command)
            .with_queue(&task.queue_name);
        rollback.params = task.params.clone();
        rollback.server_id = task.server_id;
        rollback.timeout_seconds = task.timeout_seconds;
        rollback.parent_task_id = Some(task_id);
        let rollback = self.queue.enqueue_task(rollback).await?;

        task.transition_to(TaskStatus::Rolledback)?;
        self.repos.tasks.update(&task).await?;
        self.record_event(
            task_id,
            event_types::ROLLBACK,
            format!("已创建回滚任务 {}", rollback.id),
            json!({ "rollback_task_id": rollback.id }),
        )
        .await;
        info!(task_id, rollback_task_id = rollback.id, "回滚任务已提交");
        Ok(rollback)
    }

    async fn record_event<M: Into<String>>(
        &self,
        task_id: i64,
        event_type: &str,
        message: M,
        data: serde_json::Value,
    ) {
        let event = TaskEvent::new(task_id, event_type, event_sources::JOB_CENTER, message)
            .with_data(data);
        if let Err(e) = self.repos.events.create(&event).await {
            error!(task_id, event_type, "写入任务事件失败: {e}");
        }
    }
}
