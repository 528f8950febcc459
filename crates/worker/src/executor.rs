use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use jobcenter_core::{
    event_sources, event_types, ExecutionControl, ExecutorKind, QueueItem, Repositories,
    SchedulerError, SchedulerResult, Task, TaskEvent, TaskResult, TaskStatus,
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executors::{ExecutionContext, HandlerOutcome, HandlerRegistry};

/// 按队列条目执行任务的抽象，重试、幂等与批量执行都建立在它之上
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult>;

    /// 下一次尝试之前调用，`attempt` 从1开始
    async fn prepare_retry(&self, _item: &QueueItem, _attempt: u32) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 在途或最近结束的执行的快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub task_id: i64,
    pub status: TaskStatus,
    pub token_cancelled: bool,
    pub live: bool,
}

struct LiveExecution {
    task_id: i64,
    status: TaskStatus,
    token: CancellationToken,
}

struct FinishedExecution {
    task_id: i64,
    status: TaskStatus,
    token_cancelled: bool,
}

/// 有界的已结束执行记录，按结束顺序淘汰
struct FinishedHistory {
    limit: usize,
    order: VecDeque<String>,
    entries: HashMap<String, FinishedExecution>,
}

impl FinishedHistory {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn insert(&mut self, execution_id: String, finished: FinishedExecution) {
        if self.limit == 0 {
            return;
        }
        if self.entries.insert(execution_id.clone(), finished).is_none() {
            self.order.push_back(execution_id);
        }
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// 把 `{{.key}}` 占位符替换为参数值，未知的占位符原样保留
pub fn render_placeholders(template: &str, params: &HashMap<String, Value>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in params {
        let placeholder = format!("{{{{.{key}}}}}");
        if !rendered.contains(&placeholder) {
            continue;
        }
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        rendered = rendered.replace(&placeholder, &value);
    }
    rendered
}

/// 任务执行器
///
/// 每次执行登记一个以 execution_id 为键的在途记录，超时与手动取消都通过其
/// CancellationToken 传递给处理器。任何退出路径都会移除在途记录。
pub struct TaskExecutor {
    repos: Repositories,
    handlers: HandlerRegistry,
    live: RwLock<HashMap<String, LiveExecution>>,
    finished: RwLock<FinishedHistory>,
}

/// 执行结束时移除在途记录并写入历史
struct LiveGuard<'a> {
    executor: &'a TaskExecutor,
    execution_id: String,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        let removed = match self.executor.live.write() {
            Ok(mut live) => live.remove(&self.execution_id),
            Err(_) => None,
        };
        if let (Some(entry), Ok(mut finished)) = (removed, self.executor.finished.write()) {
            finished.insert(
                self.execution_id.clone(),
                FinishedExecution {
                    task_id: entry.task_id,
                    status: entry.status,
                    token_cancelled: entry.token.is_cancelled(),
                },
            );
        }
    }
}

impl TaskExecutor {
    pub fn new(repos: Repositories, handlers: HandlerRegistry, finished_history: usize) -> Self {
        Self {
            repos,
            handlers,
            live: RwLock::new(HashMap::new()),
            finished: RwLock::new(FinishedHistory::new(finished_history)),
        }
    }

    fn lock_poisoned() -> SchedulerError {
        SchedulerError::Internal("执行登记表锁已中毒".to_string())
    }

    /// 执行一个队列条目，返回结构化结果
    ///
    /// 任务不存在或状态不允许开始执行时返回错误；处理器层面的失败、超时、
    /// 取消都以结果返回。
    pub async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        let mut task = self.repos.require_task(item.task_id).await?;
        if task.status == TaskStatus::Pending {
            task.transition_to(TaskStatus::Queued)?;
        }
        task.transition_to(TaskStatus::Running)?;
        self.repos.tasks.update(&task).await?;
        self.record_event(
            task.id,
            event_types::STARTED,
            format!("任务开始执行: {}", item.execution_id),
            json!({ "execution_id": item.execution_id }),
        )
        .await;

        let token = CancellationToken::new();
        self.live
            .write()
            .map_err(|_| Self::lock_poisoned())?
            .insert(
                item.execution_id.clone(),
                LiveExecution {
                    task_id: task.id,
                    status: TaskStatus::Running,
                    token: token.clone(),
                },
            );
        let _guard = LiveGuard {
            executor: self,
            execution_id: item.execution_id.clone(),
        };

        let started = Instant::now();
        let outcome = match task.executor_kind() {
            Ok(kind) => {
                let ctx = ExecutionContext {
                    task_id: task.id,
                    execution_id: item.execution_id.clone(),
                    task_name: task.name.clone(),
                    command: render_placeholders(&task.command, &task.params),
                    script: task
                        .script
                        .as_deref()
                        .map(|s| render_placeholders(s, &task.params)),
                    params: task.params.clone(),
                    server_id: item.server_id.or(task.server_id),
                    timeout: task.timeout(),
                };
                info!(
                    task_id = task.id,
                    execution_id = %item.execution_id,
                    executor = %kind,
                    "分发任务到处理器"
                );
                self.dispatch(kind, &ctx, &token).await
            }
            Err(_) => {
                warn!(task_id = task.id, executor = %task.executor, "未知的执行器类型");
                HandlerOutcome::failure(format!("未知的执行器类型: {}", task.executor))
            }
        };
        let elapsed = started.elapsed();

        let result = self.finish(task.id, item, outcome, elapsed).await;
        if let Ok(result) = &result {
            if let Ok(mut live) = self.live.write() {
                if let Some(entry) = live.get_mut(&item.execution_id) {
                    entry.status = result.status;
                }
            }
        }
        result
    }

    async fn dispatch(
        &self,
        kind: ExecutorKind,
        ctx: &ExecutionContext,
        token: &CancellationToken,
    ) -> HandlerOutcome {
        let handler = self.handlers.handler_for(kind);
        let handler_token = token.child_token();
        let timeout = ctx.timeout;

        tokio::select! {
            outcome = handler.execute(ctx, handler_token.clone()) => {
                // 处理器与取消同时完成时以取消为准
                if token.is_cancelled() {
                    HandlerOutcome::canceled()
                } else {
                    outcome
                }
            }
            _ = tokio::time::sleep(timeout) => {
                handler_token.cancel();
                warn!(task_id = ctx.task_id, execution_id = %ctx.execution_id, "任务执行超时");
                HandlerOutcome::timed_out(timeout)
            }
            _ = token.cancelled() => {
                info!(task_id = ctx.task_id, execution_id = %ctx.execution_id, "任务执行已取消");
                HandlerOutcome::canceled()
            }
        }
    }

    /// 持久化执行结果；任务已被外部置为终态时保留其状态
    async fn finish(
        &self,
        task_id: i64,
        item: &QueueItem,
        outcome: HandlerOutcome,
        elapsed: Duration,
    ) -> SchedulerResult<TaskResult> {
        let mut task: Task = self.repos.require_task(task_id).await?;
        let duration_ms = elapsed.as_millis() as u64;

        let status = if task.status == TaskStatus::Running {
            task.transition_to(outcome.status)?;
            outcome.status
        } else {
            debug!(task_id, status = %task.status, "任务已处于终态，保留现有状态");
            task.status
        };
        task.output = Some(outcome.output.clone());
        if outcome.error.is_some() || status != TaskStatus::Success {
            task.error_message = outcome.error.clone().or(task.error_message);
        }
        task.exit_code = outcome.exit_code;
        task.duration_ms = Some(duration_ms);
        task.updated_at = Utc::now();
        if let Err(e) = self.repos.tasks.update(&task).await {
            error!(task_id, execution_id = %item.execution_id, "保存执行结果失败: {e}");
            return Err(e);
        }

        let event_type = match status {
            TaskStatus::Success => event_types::COMPLETED,
            TaskStatus::Timeout => event_types::TIMEOUT,
            TaskStatus::Canceled => event_types::CANCELED,
            _ => event_types::FAILED,
        };
        self.record_event(
            task_id,
            event_type,
            outcome
                .error
                .clone()
                .unwrap_or_else(|| format!("任务执行结束: {status}")),
            json!({
                "execution_id": item.execution_id,
                "duration_ms": duration_ms,
                "exit_code": outcome.exit_code,
            }),
        )
        .await;

        counter!("jobcenter_task_executions_total", "status" => status.as_str()).increment(1);
        histogram!("jobcenter_task_duration_ms").record(duration_ms as f64);
        info!(
            task_id,
            execution_id = %item.execution_id,
            status = %status,
            duration_ms,
            "任务执行结束"
        );

        Ok(TaskResult {
            task_id,
            execution_id: item.execution_id.clone(),
            status,
            output: outcome.output,
            error_message: outcome.error,
            duration_ms,
            retry_count: task.retry_count,
            exit_code: outcome.exit_code,
        })
    }

    async fn record_event(&self, task_id: i64, event_type: &str, message: String, data: Value) {
        let event =
            TaskEvent::new(task_id, event_type, event_sources::EXECUTOR, message).with_data(data);
        if let Err(e) = self.repos.events.create(&event).await {
            error!(task_id, event_type, "写入任务事件失败: {e}");
        }
    }

    /// 取消一次执行；未知的 execution_id 返回错误，已结束或已取消的执行不做处理
    pub fn cancel(&self, execution_id: &str) -> SchedulerResult<()> {
        {
            let mut live = self.live.write().map_err(|_| Self::lock_poisoned())?;
            if let Some(entry) = live.get_mut(execution_id) {
                if entry.status != TaskStatus::Canceled {
                    entry.token.cancel();
                    entry.status = TaskStatus::Canceled;
                    info!(execution_id, task_id = entry.task_id, "已发送取消信号");
                }
                return Ok(());
            }
        }

        let finished = self.finished.read().map_err(|_| Self::lock_poisoned())?;
        if finished.entries.contains_key(execution_id) {
            debug!(execution_id, "执行已结束，忽略取消");
            return Ok(());
        }
        Err(SchedulerError::ExecutionNotFound {
            id: execution_id.to_string(),
        })
    }

    /// 在途执行的当前状态，或最近结束执行的最终状态
    pub fn get_status(&self, execution_id: &str) -> SchedulerResult<TaskStatus> {
        self.snapshot(execution_id).map(|s| s.status)
    }

    pub fn snapshot(&self, execution_id: &str) -> SchedulerResult<ExecutionSnapshot> {
        let live = self.live.read().map_err(|_| Self::lock_poisoned())?;
        if let Some(entry) = live.get(execution_id) {
            return Ok(ExecutionSnapshot {
                execution_id: execution_id.to_string(),
                task_id: entry.task_id,
                status: entry.status,
                token_cancelled: entry.token.is_cancelled(),
                live: true,
            });
        }
        drop(live);

        let finished = self.finished.read().map_err(|_| Self::lock_poisoned())?;
        finished
            .entries
            .get(execution_id)
            .map(|entry| ExecutionSnapshot {
                execution_id: execution_id.to_string(),
                task_id: entry.task_id,
                status: entry.status,
                token_cancelled: entry.token_cancelled,
                live: false,
            })
            .ok_or_else(|| SchedulerError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }

    /// 当前在途执行
    pub fn live_executions(&self) -> Vec<ExecutionSnapshot> {
        let Ok(live) = self.live.read() else {
            return Vec::new();
        };
        live.iter()
            .map(|(id, entry)| ExecutionSnapshot {
                execution_id: id.clone(),
                task_id: entry.task_id,
                status: entry.status,
                token_cancelled: entry.token.is_cancelled(),
                live: true,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.read().map(|l| l.len()).unwrap_or(0)
    }

    fn task_is_live(&self, task_id: i64) -> bool {
        self.live
            .read()
            .map(|l| l.values().any(|e| e.task_id == task_id))
            .unwrap_or(false)
    }

    /// 取消某个任务的全部在途执行
    pub fn cancel_task(&self, task_id: i64) -> SchedulerResult<usize> {
        let mut live = self.live.write().map_err(|_| Self::lock_poisoned())?;
        let mut canceled = 0;
        for (id, entry) in live.iter_mut() {
            if entry.task_id == task_id && entry.status != TaskStatus::Canceled {
                entry.token.cancel();
                entry.status = TaskStatus::Canceled;
                canceled += 1;
                info!(execution_id = %id, task_id, "已发送取消信号");
            }
        }
        Ok(canceled)
    }
}

#[async_trait]
impl ItemExecutor for TaskExecutor {
    async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        TaskExecutor::execute(self, item).await
    }

    /// failed/timeout -> retrying -> queued，使同一任务可以再次执行
    async fn prepare_retry(&self, item: &QueueItem, attempt: u32) -> SchedulerResult<()> {
        let mut task = self.repos.require_task(item.task_id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Timeout) {
            return Ok(());
        }
        task.transition_to(TaskStatus::Retrying)?;
        task.retry_count = attempt;
        self.repos.tasks.update(&task).await?;
        self.record_event(
            task.id,
            event_types::RETRY_SCHEDULED,
            format!("第 {attempt} 次重试"),
            json!({ "attempt": attempt, "execution_id": item.execution_id }),
        )
        .await;
        task.transition_to(TaskStatus::Queued)?;
        self.repos.tasks.update(&task).await
    }
}

#[async_trait]
impl ExecutionControl for TaskExecutor {
    async fn cancel_task_executions(&self, task_id: i64) -> SchedulerResult<usize> {
        self.cancel_task(task_id)
    }

    async fn wait_task_stopped(&self, task_id: i64, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.task_is_live(task_id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_placeholders() {
        let params: HashMap<String, Value> = serde_json::from_value(json!({
            "name": "db1",
            "port": 5432,
        }))
        .unwrap();
        assert_eq!(
            render_placeholders("{{.name}}:{{.port}} {{.missing}}", &params),
            "db1:5432 {{.missing}}"
        );
        assert_eq!(render_placeholders("plain", &params), "plain");
    }

    #[test]
    fn test_finished_history_is_bounded() {
        let mut history = FinishedHistory::new(2);
        for id in ["a", "b", "c"] {
            history.insert(
                id.to_string(),
                FinishedExecution {
                    task_id: 1,
                    status: TaskStatus::Success,
                    token_cancelled: false,
                },
            );
        }
        assert!(!history.entries.contains_key("a"));
        assert!(history.entries.contains_key("c"));
        assert_eq!(history.order.len(), 2);
    }
}
