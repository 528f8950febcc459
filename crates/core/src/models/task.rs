use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{SchedulerError, SchedulerResult};

/// 任务优先级常量，数值越大越先执行
pub mod priority {
    pub const LOW: i32 = 1;
    pub const NORMAL: i32 = 5;
    pub const HIGH: i32 = 10;
    pub const URGENT: i32 = 20;
    pub const CRITICAL: i32 = 50;
}

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// 任务执行方式，固定集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Shell,
    RemoteShell,
    Http,
    Container,
    Orchestration,
    Script,
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 6] = [
        ExecutorKind::Shell,
        ExecutorKind::RemoteShell,
        ExecutorKind::Http,
        ExecutorKind::Container,
        ExecutorKind::Orchestration,
        ExecutorKind::Script,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Shell => "shell",
            ExecutorKind::RemoteShell => "remote-shell",
            ExecutorKind::Http => "http",
            ExecutorKind::Container => "container",
            ExecutorKind::Orchestration => "orchestration",
            ExecutorKind::Script => "script",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shell" | "command" => Ok(ExecutorKind::Shell),
            "remote-shell" | "remote_shell" | "ssh" => Ok(ExecutorKind::RemoteShell),
            "http" | "api" => Ok(ExecutorKind::Http),
            "container" | "docker" => Ok(ExecutorKind::Container),
            "orchestration" | "kubernetes" | "k8s" => Ok(ExecutorKind::Orchestration),
            "script" => Ok(ExecutorKind::Script),
            _ => Err(SchedulerError::UnknownExecutor(s.to_string())),
        }
    }
}

/// 任务状态
///
/// 状态只能沿以下路径前进：
///
/// ```text
/// pending -> queued -> running -> {success | failed | timeout | canceled}
/// failed | timeout -> retrying -> queued
/// failed | timeout -> rolledback
/// ```
///
/// `success`、`canceled`、`rolledback` 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
    Retrying,
    Timeout,
    Rolledback,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Rolledback => "rolledback",
        }
    }

    /// 终态不可再离开
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Canceled | TaskStatus::Rolledback
        )
    }

    /// 一次执行周期已经结束（包括可被重试的失败/超时）
    pub fn is_finished(&self) -> bool {
        self.is_terminal() || matches!(self, TaskStatus::Failed | TaskStatus::Timeout)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Canceled)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Canceled)
                | (Failed, Retrying)
                | (Timeout, Retrying)
                | (Failed, Rolledback)
                | (Timeout, Rolledback)
                | (Retrying, Queued)
                | (Retrying, Canceled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 调度方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    #[default]
    Immediate,
    Delayed,
    Cron,
}

/// 重试退避方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryBackoff {
    #[default]
    Linear,
    Exponential,
}

impl RetryBackoff {
    /// 计算第 `attempt` 次重试（从1开始）前的等待时间
    pub fn delay_for(&self, base: Duration, attempt: u32) -> Duration {
        match self {
            RetryBackoff::Linear => base,
            RetryBackoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp)
            }
        }
    }
}

/// 任务定义
///
/// 可选的 `priority`、`timeout_seconds`、`max_retries` 在入队时由队列配置补全。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    /// 执行方式名称，入队时校验
    pub executor: String,
    pub priority: Option<i32>,
    pub status: TaskStatus,
    pub command: String,
    pub script: Option<String>,
    pub params: HashMap<String, serde_json::Value>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: RetryBackoff,
    pub queue_name: String,
    pub schedule_kind: ScheduleKind,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub dedup_window_seconds: u64,
    pub server_id: Option<i64>,
    pub cron_job_id: Option<i64>,
    pub parent_task_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub rollback_enabled: bool,
    pub rollback_command: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new<N: Into<String>, E: Into<String>, C: Into<String>>(
        name: N,
        executor: E,
        command: C,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            executor: executor.into(),
            priority: None,
            status: TaskStatus::Pending,
            command: command.into(),
            script: None,
            params: HashMap::new(),
            timeout_seconds: None,
            max_retries: None,
            retry_count: 0,
            retry_delay_seconds: 5,
            retry_backoff: RetryBackoff::Linear,
            queue_name: DEFAULT_QUEUE.to_string(),
            schedule_kind: ScheduleKind::Immediate,
            scheduled_at: None,
            idempotency_key: None,
            dedup_window_seconds: 0,
            server_id: None,
            cron_job_id: None,
            parent_task_id: None,
            batch_id: None,
            rollback_enabled: false,
            rollback_command: None,
            queued_at: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            output: None,
            error_message: None,
            exit_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_queue<S: Into<String>>(mut self, queue: S) -> Self {
        self.queue_name = queue.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, seconds: u64, backoff: RetryBackoff) -> Self {
        self.retry_delay_seconds = seconds;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_param<K: Into<String>>(mut self, key: K, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_script<S: Into<String>>(mut self, script: S) -> Self {
        self.script = Some(script.into());
        self
    }

    pub fn with_idempotency_key<S: Into<String>>(mut self, key: S, window_seconds: u64) -> Self {
        self.idempotency_key = Some(key.into());
        self.dedup_window_seconds = window_seconds;
        self
    }

    pub fn with_server(mut self, server_id: i64) -> Self {
        self.server_id = Some(server_id);
        self
    }

    pub fn with_rollback<S: Into<String>>(mut self, command: S) -> Self {
        self.rollback_enabled = true;
        self.rollback_command = Some(command.into());
        self
    }

    pub fn executor_kind(&self) -> SchedulerResult<ExecutorKind> {
        self.executor.parse()
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(priority::NORMAL)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS))
    }

    pub fn max_retries_or_zero(&self) -> u32 {
        self.max_retries.unwrap_or(0)
    }

    /// 提交前的字段校验
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.name.trim().is_empty() {
            return Err(SchedulerError::validation("任务名称不能为空"));
        }
        let kind = self.executor_kind()?;
        let has_body = !self.command.trim().is_empty()
            || self.script.as_deref().is_some_and(|s| !s.trim().is_empty())
            || (kind == ExecutorKind::Http && self.params.contains_key("url"));
        if !has_body {
            return Err(SchedulerError::validation(format!(
                "任务 {} 缺少命令或脚本内容",
                self.name
            )));
        }
        if self.queue_name.trim().is_empty() {
            return Err(SchedulerError::validation("队列名称不能为空"));
        }
        Ok(())
    }

    /// 按状态机推进状态，并维护相关时间戳
    pub fn transition_to(&mut self, next: TaskStatus) -> SchedulerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidStatusTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            TaskStatus::Queued => self.queued_at = Some(now),
            TaskStatus::Running => {
                self.started_at = Some(now);
                self.completed_at = None;
                self.duration_ms = None;
            }
            s if s.is_finished() => {
                self.completed_at = Some(now);
                if let Some(started) = self.started_at {
                    self.duration_ms = Some((now - started).num_milliseconds().max(0) as u64);
                }
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}
