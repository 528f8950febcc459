//! 队列消费者池
//!
//! 每个队列一组消费者，循环 dequeue -> execute -> ack/nack。失败或超时的任务在
//! 未用尽重试次数时按退避时间重新入队；定时作业产生的任务在结束时回写触发记录。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use jobcenter_core::{
    config::WorkerConfig, event_sources, event_types, CronExecutionStatus, CronOutcomeRecorder,
    QueueItem, Repositories, SchedulerError, SchedulerResult, Task, TaskEvent, TaskFilter,
    TaskResult, TaskStatus,
};
use jobcenter_infrastructure::TaskQueue;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::ItemExecutor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerPoolStats {
    pub queue_name: String,
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub handled: u64,
    pub failed: u64,
}

#[derive(Default)]
struct QueueCounters {
    busy: AtomicUsize,
    handled: AtomicU64,
    failed: AtomicU64,
}

struct WorkerHandle {
    id: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueWorkers {
    workers: Vec<WorkerHandle>,
    counters: Arc<QueueCounters>,
    next_index: usize,
}

/// 单个消费者循环共享的依赖
#[derive(Clone)]
struct WorkerContext {
    queue: Arc<TaskQueue>,
    executor: Arc<dyn ItemExecutor>,
    repos: Repositories,
    config: WorkerConfig,
    cron_recorder: Option<Arc<dyn CronOutcomeRecorder>>,
}

pub struct WorkerPool {
    ctx: WorkerContext,
    shutdown: CancellationToken,
    groups: Mutex<HashMap<String, QueueWorkers>>,
    host: String,
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

impl WorkerPool {
    pub fn new(
        queue: Arc<TaskQueue>,
        executor: Arc<dyn ItemExecutor>,
        config: WorkerConfig,
    ) -> Self {
        let repos = queue.repositories().clone();
        Self {
            ctx: WorkerContext {
                queue,
                executor,
                repos,
                config,
                cron_recorder: None,
            },
            shutdown: CancellationToken::new(),
            groups: Mutex::new(HashMap::new()),
            host: local_hostname(),
        }
    }

    /// 定时作业计数交给调度器写回
    pub fn with_cron_recorder(mut self, recorder: Arc<dyn CronOutcomeRecorder>) -> Self {
        self.ctx.cron_recorder = Some(recorder);
        self
    }

    fn groups(
        &self,
    ) -> SchedulerResult<std::sync::MutexGuard<'_, HashMap<String, QueueWorkers>>> {
        self.groups
            .lock()
            .map_err(|_| SchedulerError::Internal("消费者池锁已中毒".to_string()))
    }

    /// 为队列追加 `count` 个消费者
    pub fn start(&self, queue_name: &str, count: usize) -> SchedulerResult<()> {
        let mut groups = self.groups()?;
        let group = groups.entry(queue_name.to_string()).or_default();
        for _ in 0..count {
            let id = format!("{}-{}-{}", self.host, queue_name, group.next_index);
            group.next_index += 1;
            let token = self.shutdown.child_token();
            let handle = tokio::spawn(run_worker(
                self.ctx.clone(),
                queue_name.to_string(),
                id.clone(),
                Arc::clone(&group.counters),
                token.clone(),
            ));
            group.workers.push(WorkerHandle { id, token, handle });
        }
        gauge!("jobcenter_workers", "queue" => queue_name.to_string())
            .set(group.workers.len() as f64);
        info!(queue = queue_name, workers = group.workers.len(), "队列消费者已启动");
        Ok(())
    }

    /// 调整队列的消费者数量；缩容的消费者处理完当前任务后退出
    pub fn scale(&self, queue_name: &str, target: usize) -> SchedulerResult<()> {
        let current = self
            .groups()?
            .get(queue_name)
            .map(|g| g.workers.len())
            .unwrap_or(0);
        if target > current {
            return self.start(queue_name, target - current);
        }

        let mut groups = self.groups()?;
        if let Some(group) = groups.get_mut(queue_name) {
            while group.workers.len() > target {
                if let Some(worker) = group.workers.pop() {
                    debug!(worker_id = %worker.id, "停止消费者");
                    worker.token.cancel();
                }
            }
            gauge!("jobcenter_workers", "queue" => queue_name.to_string())
                .set(group.workers.len() as f64);
        }
        info!(queue = queue_name, from = current, to = target, "消费者数量已调整");
        Ok(())
    }

    /// 停止全部消费者并等待其退出
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.groups() {
            Ok(mut groups) => groups
                .values_mut()
                .flat_map(|g| g.workers.drain(..).map(|w| w.handle))
                .collect(),
            Err(e) => {
                error!("停止消费者失败: {e}");
                return;
            }
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("消费者异常退出: {e}");
            }
        }
        info!("全部队列消费者已停止");
    }

    pub fn stats(&self, queue_name: &str) -> Option<WorkerPoolStats> {
        let groups = self.groups().ok()?;
        groups.get(queue_name).map(|g| group_stats(queue_name, g))
    }

    pub fn all_stats(&self) -> Vec<WorkerPoolStats> {
        let Ok(groups) = self.groups() else {
            return Vec::new();
        };
        let mut stats: Vec<_> = groups
            .iter()
            .map(|(name, g)| group_stats(name, g))
            .collect();
        stats.sort_by(|a, b| a.queue_name.cmp(&b.queue_name));
        stats
    }
}

fn group_stats(queue_name: &str, group: &QueueWorkers) -> WorkerPoolStats {
    let total = group.workers.len();
    let busy = group.counters.busy.load(Ordering::SeqCst).min(total);
    WorkerPoolStats {
        queue_name: queue_name.to_string(),
        total,
        busy,
        idle: total - busy,
        handled: group.counters.handled.load(Ordering::SeqCst),
        failed: group.counters.failed.load(Ordering::SeqCst),
    }
}

async fn run_worker(
    ctx: WorkerContext,
    queue_name: String,
    worker_id: String,
    counters: Arc<QueueCounters>,
    token: CancellationToken,
) {
    debug!(worker_id = %worker_id, queue = %queue_name, "消费者开始运行");
    let poll = ctx.config.dequeue_timeout();
    let backoff = Duration::from_millis(ctx.config.error_backoff_ms);

    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = ctx.queue.dequeue(&queue_name, poll) => item,
        };
        let item = match item {
            Ok(item) => item,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(worker_id = %worker_id, queue = %queue_name, "取任务失败: {e}");
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => continue,
                }
            }
        };

        counters.busy.fetch_add(1, Ordering::SeqCst);
        let result = ctx.executor.execute(&item).await;
        counters.busy.fetch_sub(1, Ordering::SeqCst);
        counters.handled.fetch_add(1, Ordering::SeqCst);

        let succeeded = matches!(&result, Ok(r) if r.is_success());
        if !succeeded {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        if let Err(e) = ctx.complete(&item, result).await {
            error!(
                worker_id = %worker_id,
                task_id = item.task_id,
                execution_id = %item.execution_id,
                "处理执行结果失败: {e}"
            );
        }
    }
    debug!(worker_id = %worker_id, queue = %queue_name, "消费者已退出");
}

impl WorkerContext {
    async fn complete(
        &self,
        item: &QueueItem,
        result: SchedulerResult<TaskResult>,
    ) -> SchedulerResult<()> {
        match &result {
            Ok(r) if r.is_success() => self.queue.ack(item).await?,
            Ok(r) => {
                let reason = r.error_message.clone().unwrap_or_else(|| r.status.to_string());
                self.queue.nack(item, &reason).await?;
            }
            Err(e) => {
                error!(task_id = item.task_id, "执行任务失败: {e}");
                self.queue.nack(item, &e.to_string()).await?;
            }
        }

        let Some(task) = self.repos.tasks.get_by_id(item.task_id).await? else {
            return Ok(());
        };
        if matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout)
            && self.resubmit(task.clone()).await?
        {
            return Ok(());
        }
        if task.cron_job_id.is_some() {
            self.record_cron_outcome(&task).await?;
        }
        if let Some(batch_id) = task.batch_id {
            self.refresh_batch(batch_id).await?;
        }
        Ok(())
    }

    /// 未用尽重试次数时 failed/timeout -> retrying，并在退避后重新入队
    async fn resubmit(&self, mut task: Task) -> SchedulerResult<bool> {
        if task.retry_count >= task.max_retries_or_zero() {
            return Ok(false);
        }
        task.retry_count += 1;
        task.transition_to(TaskStatus::Retrying)?;
        self.repos.tasks.update(&task).await?;

        let delay = task.retry_backoff.delay_for(
            Duration::from_secs(task.retry_delay_seconds),
            task.retry_count,
        );
        let event = TaskEvent::new(
            task.id,
            event_types::RETRY_SCHEDULED,
            event_sources::WORKER,
            format!(
                "第 {}/{} 次重试，{}ms 后入队",
                task.retry_count,
                task.max_retries_or_zero(),
                delay.as_millis()
            ),
        )
        .with_data(json!({
            "retry_count": task.retry_count,
            "delay_ms": delay.as_millis() as u64,
        }));
        if let Err(e) = self.repos.events.create(&event).await {
            error!(task_id = task.id, "写入重试事件失败: {e}");
        }

        counter!("jobcenter_task_resubmissions_total", "queue" => task.queue_name.clone())
            .increment(1);
        info!(
            task_id = task.id,
            retry_count = task.retry_count,
            delay_ms = delay.as_millis() as u64,
            "任务将重新入队"
        );
        self.queue.requeue_after(task.id, delay);
        Ok(true)
    }

    /// 回写定时触发记录与作业的成功/失败计数
    async fn record_cron_outcome(&self, task: &Task) -> SchedulerResult<()> {
        let Some(job_id) = task.cron_job_id else {
            return Ok(());
        };
        if let Some(execution_id) = task.params.get("cron_execution_id").and_then(|v| v.as_i64())
        {
            if let Some(mut execution) = self.repos.cron_executions.get_by_id(execution_id).await? {
                execution.task_id = Some(task.id);
                execution.status = CronExecutionStatus::from(task.status);
                execution.completed_at = Some(Utc::now());
                execution.error_message = task.error_message.clone();
                self.repos.cron_executions.update(&execution).await?;
            }
        }

        let succeeded = task.status == TaskStatus::Success;
        if let Some(recorder) = &self.cron_recorder {
            return recorder
                .record_outcome(job_id, succeeded, task.error_message.as_deref())
                .await;
        }

        // 未接入调度器时没有其他计数写入方
        let Some(mut job) = self.repos.cron_jobs.get_by_id(job_id).await? else {
            return Ok(());
        };
        if succeeded {
            job.success_count += 1;
        } else {
            job.fail_count += 1;
            job.last_error = task.error_message.clone();
        }
        job.updated_at = Utc::now();
        self.repos.cron_jobs.update(&job).await
    }

    /// 按批次内任务的当前状态刷新进度
    async fn refresh_batch(&self, batch_id: i64) -> SchedulerResult<()> {
        let Some(mut batch) = self.repos.batches.get_by_id(batch_id).await? else {
            return Ok(());
        };
        let tasks = self
            .repos
            .tasks
            .list(&TaskFilter {
                batch_id: Some(batch_id),
                ..Default::default()
            })
            .await?;
        batch.completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Success)
            .count();
        batch.failed = tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Failed | TaskStatus::Timeout | TaskStatus::Canceled
                )
            })
            .count();
        batch.refresh_status();
        self.repos.batches.update(&batch).await?;

        if batch.stop_on_failure && batch.failed > 0 {
            for task in tasks.iter().filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying
                )
            }) {
                self.queue
                    .cancel_pending(task.id, "批次中已有任务失败")
                    .await?;
            }
        }
        Ok(())
    }
}
