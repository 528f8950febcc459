use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{Local, Utc};
use jobcenter_core::{
    event_sources, event_types, priority, QueueBackend, QueueConfig, QueueItem, QueueStats,
    Repositories, ScheduleKind, SchedulerError, SchedulerResult, Task, TaskEvent, TaskFilter,
    TaskStatus, DEFAULT_QUEUE,
};
use metrics::counter;
use serde_json::json;
use tracing::{debug, error, info, warn};

/// 批量入队中单个任务的失败
#[derive(Debug)]
pub struct BatchEnqueueError {
    pub index: usize,
    pub task_name: String,
    pub error: SchedulerError,
}

/// 批量入队结果：成功的任务ID与失败项
#[derive(Debug, Default)]
pub struct BatchEnqueueOutcome {
    pub task_ids: Vec<i64>,
    pub errors: Vec<BatchEnqueueError>,
}

/// 任务队列管理器
///
/// 负责入队准入（校验、容量、幂等去重）、任务状态持久化、出队确认与统计。
/// 具体的排序与阻塞等待由 [`QueueBackend`] 实现。
pub struct TaskQueue {
    backend: Arc<dyn QueueBackend>,
    repos: Repositories,
    configs: RwLock<HashMap<String, QueueConfig>>,
    /// 每个队列一把准入锁，保证容量检查与插入之间不被其他入队穿插
    admission: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TaskQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, repos: Repositories) -> Self {
        Self {
            backend,
            repos,
            configs: RwLock::new(HashMap::new()),
            admission: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_queue(&self, config: QueueConfig) {
        info!(
            queue = %config.name,
            max_pending = config.max_pending,
            max_workers = config.max_workers,
            "注册队列"
        );
        if let Ok(mut configs) = self.configs.write() {
            configs.insert(config.name.clone(), config);
        }
    }

    pub fn register_queues<I: IntoIterator<Item = QueueConfig>>(&self, configs: I) {
        for config in configs {
            self.register_queue(config);
        }
    }

    /// 获取队列配置，未注册的队列按默认配置创建
    pub fn queue_config(&self, name: &str) -> QueueConfig {
        if let Some(config) = self.configs.read().ok().and_then(|c| c.get(name).cloned()) {
            return config;
        }
        let config = QueueConfig::fallback(name);
        if let Ok(mut configs) = self.configs.write() {
            return configs
                .entry(name.to_string())
                .or_insert_with(|| {
                    debug!(queue = name, "队列未注册，使用默认配置");
                    config.clone()
                })
                .clone();
        }
        config
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .configs
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    fn admission_lock(&self, queue: &str) -> SchedulerResult<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .admission
            .lock()
            .map_err(|_| SchedulerError::Internal("准入锁表已中毒".to_string()))?;
        Ok(locks.entry(queue.to_string()).or_default().clone())
    }

    fn apply_defaults(task: &mut Task, config: &QueueConfig) {
        if task.priority.is_none() {
            task.priority = Some(config.priority);
        }
        if task.timeout_seconds.is_none() {
            task.timeout_seconds = Some(config.timeout_seconds);
        }
        if task.max_retries.is_none() {
            task.max_retries = Some(config.max_retries);
        }
    }

    /// 按任务自身的 queue_name 入队
    pub async fn enqueue_task(&self, task: Task) -> SchedulerResult<Task> {
        let queue = if task.queue_name.trim().is_empty() {
            DEFAULT_QUEUE.to_string()
        } else {
            task.queue_name.clone()
        };
        self.enqueue(&queue, task).await
    }

    /// 入队：校验 -> 去重 -> 容量检查 -> 持久化(queued) -> 插入并唤醒消费者
    pub async fn enqueue(&self, queue_name: &str, mut task: Task) -> SchedulerResult<Task> {
        task.queue_name = queue_name.to_string();
        task.validate()?;
        let config = self.queue_config(queue_name);
        Self::apply_defaults(&mut task, &config);

        let lock = self.admission_lock(queue_name)?;
        let _admitted = lock.lock().await;

        self.check_duplicate(&task).await?;
        self.check_capacity(&config).await?;

        task.id = 0;
        task.status = TaskStatus::Pending;
        task.created_at = Utc::now();
        // 以 queued 状态一次写入
        task.transition_to(TaskStatus::Queued)?;
        let created = self.repos.tasks.create(&task).await?;
        if let Err(e) = self.push_item(&created).await {
            if let Err(cleanup) = self.repos.tasks.delete(created.id).await {
                error!(task_id = created.id, "入队失败后删除任务失败: {cleanup}");
            }
            return Err(e);
        }

        counter!("jobcenter_tasks_enqueued_total", "queue" => queue_name.to_string())
            .increment(1);
        info!(
            task_id = created.id,
            queue = queue_name,
            priority = created.effective_priority(),
            "任务已入队"
        );
        Ok(created)
    }

    async fn check_capacity(&self, config: &QueueConfig) -> SchedulerResult<()> {
        let pending = self.backend.size(&config.name).await;
        if pending >= config.max_pending {
            warn!(queue = %config.name, pending, "队列已满，拒绝入队");
            return Err(SchedulerError::QueueFull {
                queue: config.name.clone(),
                max_pending: config.max_pending,
            });
        }
        Ok(())
    }

    async fn check_duplicate(&self, task: &Task) -> SchedulerResult<()> {
        let Some(key) = task.idempotency_key.as_ref() else {
            return Ok(());
        };
        if task.dedup_window_seconds == 0 {
            return Ok(());
        }
        let since = Utc::now() - chrono::Duration::seconds(task.dedup_window_seconds as i64);
        let existing = self
            .repos
            .tasks
            .count(&TaskFilter {
                idempotency_key: Some(key.clone()),
                created_since: Some(since),
                ..Default::default()
            })
            .await?;
        if existing > 0 {
            return Err(SchedulerError::DuplicateTask { key: key.clone() });
        }
        Ok(())
    }

    /// pending -> queued，持久化后插入队列
    async fn push_pending(&self, task: &mut Task) -> SchedulerResult<()> {
        task.transition_to(TaskStatus::Queued)?;
        self.push_queued(task).await
    }

    async fn push_queued(&self, task: &Task) -> SchedulerResult<()> {
        self.repos.tasks.update(task).await?;
        self.push_item(task).await
    }

    /// 插入队列后端并记录入队事件，不写任务行
    async fn push_item(&self, task: &Task) -> SchedulerResult<()> {
        let mut item = QueueItem::new(task.id, task.queue_name.clone(), task.effective_priority());
        item.server_id = task.server_id;
        self.backend.push(item).await?;

        self.record_event(
            TaskEvent::new(
                task.id,
                event_types::ENQUEUED,
                event_sources::QUEUE,
                format!("任务进入队列 {}", task.queue_name),
            )
            .with_data(json!({
                "queue": task.queue_name,
                "priority": task.effective_priority(),
                "retry_count": task.retry_count,
            })),
        )
        .await;
        Ok(())
    }

    async fn record_event(&self, event: TaskEvent) {
        if let Err(e) = self.repos.events.create(&event).await {
            error!(task_id = event.task_id, event_type = %event.event_type, "写入任务事件失败: {e}");
        }
    }

    pub async fn dequeue(&self, queue_name: &str, timeout: Duration) -> SchedulerResult<QueueItem> {
        self.backend.pop(queue_name, timeout).await
    }

    pub async fn peek(&self, queue_name: &str) -> Option<QueueItem> {
        self.backend.peek(queue_name).await
    }

    pub async fn ack(&self, item: &QueueItem) -> SchedulerResult<()> {
        self.backend.ack(&item.queue_name, item.task_id).await
    }

    /// 失败确认；是否重试由上层决定
    pub async fn nack(&self, item: &QueueItem, reason: &str) -> SchedulerResult<()> {
        self.backend
            .nack(&item.queue_name, item.task_id, reason)
            .await
    }

    pub async fn size(&self, queue_name: &str) -> usize {
        self.backend.size(queue_name).await
    }

    /// 清空队列，被丢弃的任务标记为已取消
    pub async fn clear(&self, queue_name: &str) -> SchedulerResult<usize> {
        let drained = self.backend.clear(queue_name).await;
        for item in &drained {
            if let Some(mut task) = self.repos.tasks.get_by_id(item.task_id).await? {
                if task.transition_to(TaskStatus::Canceled).is_ok() {
                    task.error_message = Some(format!("队列 {queue_name} 被清空"));
                    self.repos.tasks.update(&task).await?;
                    self.record_event(TaskEvent::new(
                        task.id,
                        event_types::CANCELED,
                        event_sources::QUEUE,
                        "队列被清空",
                    ))
                    .await;
                }
            }
        }
        info!(queue = queue_name, dropped = drained.len(), "队列已清空");
        Ok(drained.len())
    }

    pub async fn get_queue_stats(&self, queue_name: &str) -> SchedulerResult<QueueStats> {
        let config = self.queue_config(queue_name);
        let today = Local::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .and_then(|t| t.and_local_timezone(Local).earliest())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let count = |statuses: Vec<TaskStatus>, since: Option<chrono::DateTime<Utc>>| TaskFilter {
            statuses: Some(statuses),
            queue_name: Some(queue_name.to_string()),
            updated_since: since,
            ..Default::default()
        };

        let running = self
            .repos
            .tasks
            .count(&count(vec![TaskStatus::Running], None))
            .await?;
        let completed_today = self
            .repos
            .tasks
            .count(&count(vec![TaskStatus::Success], Some(today)))
            .await?;
        let failed_today = self
            .repos
            .tasks
            .count(&count(
                vec![TaskStatus::Failed, TaskStatus::Timeout],
                Some(today),
            ))
            .await?;

        Ok(QueueStats {
            queue_name: queue_name.to_string(),
            pending: self.backend.size(queue_name).await,
            running,
            completed_today,
            failed_today,
            max_pending: config.max_pending,
            max_workers: config.max_workers,
        })
    }

    pub async fn get_all_queue_stats(&self) -> SchedulerResult<Vec<QueueStats>> {
        let mut stats = Vec::new();
        for name in self.queue_names() {
            stats.push(self.get_queue_stats(&name).await?);
        }
        Ok(stats)
    }

    /// 逐个入队，单个失败不影响其余任务
    pub async fn batch_enqueue(&self, tasks: Vec<Task>) -> BatchEnqueueOutcome {
        let mut outcome = BatchEnqueueOutcome::default();
        for (index, task) in tasks.into_iter().enumerate() {
            let task_name = task.name.clone();
            match self.enqueue_task(task).await {
                Ok(created) => outcome.task_ids.push(created.id),
                Err(error) => {
                    warn!(index, task = %task_name, "批量入队单项失败: {error}");
                    outcome.errors.push(BatchEnqueueError {
                        index,
                        task_name,
                        error,
                    });
                }
            }
        }
        outcome
    }

    /// 以最高优先级入队
    pub async fn priority_enqueue(&self, task: Task) -> SchedulerResult<Task> {
        self.enqueue_task(task.with_priority(priority::CRITICAL)).await
    }

    /// 带幂等键入队，窗口内重复提交返回 `DuplicateTask`
    pub async fn dedup_enqueue(
        &self,
        task: Task,
        key: &str,
        window: Duration,
    ) -> SchedulerResult<Task> {
        self.enqueue_task(task.with_idempotency_key(key, window.as_secs()))
            .await
    }

    /// 延迟入队：立即持久化为 pending，到期后再插入队列
    pub async fn delayed_enqueue(
        self: &Arc<Self>,
        mut task: Task,
        delay: Duration,
    ) -> SchedulerResult<Task> {
        if task.queue_name.trim().is_empty() {
            task.queue_name = DEFAULT_QUEUE.to_string();
        }
        task.validate()?;
        let config = self.queue_config(&task.queue_name);
        Self::apply_defaults(&mut task, &config);
        self.check_duplicate(&task).await?;

        task.id = 0;
        task.status = TaskStatus::Pending;
        task.schedule_kind = ScheduleKind::Delayed;
        task.scheduled_at = Some(
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
        );
        let created = self.repos.tasks.create(&task).await?;
        info!(task_id = created.id, delay_ms = delay.as_millis() as u64, "任务延迟入队");

        let queue = Arc::clone(self);
        let task_id = created.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.release_delayed(task_id).await {
                error!(task_id, "延迟任务入队失败: {e}");
            }
        });
        Ok(created)
    }

    async fn release_delayed(&self, task_id: i64) -> SchedulerResult<()> {
        let Some(mut task) = self.repos.tasks.get_by_id(task_id).await? else {
            return Err(SchedulerError::task_not_found(task_id));
        };
        if task.status != TaskStatus::Pending {
            debug!(task_id, status = %task.status, "延迟任务状态已变化，跳过入队");
            return Ok(());
        }

        let config = self.queue_config(&task.queue_name);
        let lock = self.admission_lock(&task.queue_name)?;
        let _admitted = lock.lock().await;
        if let Err(e) = self.check_capacity(&config).await {
            task.transition_to(TaskStatus::Canceled)?;
            task.error_message = Some(e.to_string());
            self.repos.tasks.update(&task).await?;
            self.record_event(TaskEvent::new(
                task.id,
                event_types::CANCELED,
                event_sources::QUEUE,
                format!("延迟任务到期时队列已满: {e}"),
            ))
            .await;
            return Err(e);
        }
        self.push_pending(&mut task).await
    }

    /// 重试再提交：retrying -> queued，不重新创建任务，也不受容量限制
    pub async fn requeue(&self, task_id: i64) -> SchedulerResult<()> {
        let mut task = self.repos.require_task(task_id).await?;
        if task.status != TaskStatus::Retrying {
            debug!(task_id, status = %task.status, "任务不处于 retrying，放弃再提交");
            return Ok(());
        }
        task.transition_to(TaskStatus::Queued)?;
        self.push_queued(&task).await?;
        counter!("jobcenter_tasks_requeued_total", "queue" => task.queue_name.clone())
            .increment(1);
        Ok(())
    }

    /// 等待退避时间后再提交
    pub fn requeue_after(self: &Arc<Self>, task_id: i64, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.requeue(task_id).await {
                error!(task_id, "重试再提交失败: {e}");
            }
        });
    }

    /// 取消尚未开始执行的任务，返回 false 表示任务不在可取消状态
    pub async fn cancel_pending(&self, task_id: i64, reason: &str) -> SchedulerResult<bool> {
        let mut task = self.repos.require_task(task_id).await?;
        if !matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying
        ) {
            return Ok(false);
        }
        self.backend.remove(&task.queue_name, task_id).await;
        task.transition_to(TaskStatus::Canceled)?;
        task.error_message = Some(reason.to_string());
        self.repos.tasks.update(&task).await?;
        self.record_event(TaskEvent::new(
            task_id,
            event_types::CANCELED,
            event_sources::QUEUE,
            reason,
        ))
        .await;
        Ok(true)
    }
}
