use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{priority, ScheduleKind, Task, TaskStatus};
use crate::errors::{SchedulerError, SchedulerResult};

/// 同一作业的多次触发之间的并发策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyPolicy {
    #[default]
    Allow,
    Forbid,
    Replace,
}

impl FromStr for ConcurrencyPolicy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "allow" => Ok(ConcurrencyPolicy::Allow),
            "forbid" => Ok(ConcurrencyPolicy::Forbid),
            "replace" => Ok(ConcurrencyPolicy::Replace),
            other => Err(SchedulerError::validation(format!("未知的并发策略: {other}"))),
        }
    }
}

/// 定时作业
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub cron_expr: String,
    /// IANA 时区名，例如 `Asia/Shanghai`；空串或 `UTC` 按 UTC 计算
    pub timezone: String,
    pub enabled: bool,
    /// JSON 格式的任务模板
    pub task_template: String,
    pub concurrency_policy: ConcurrencyPolicy,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub prev_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new<N, E, T>(name: N, cron_expr: E, task_template: T) -> Self
    where
        N: Into<String>,
        E: Into<String>,
        T: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            cron_expr: cron_expr.into(),
            timezone: "UTC".to_string(),
            enabled: true,
            task_template: task_template.into(),
            concurrency_policy: ConcurrencyPolicy::Allow,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            last_run_at: None,
            prev_run_at: None,
            next_run_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency_policy = policy;
        self
    }

    pub fn with_timezone<S: Into<String>>(mut self, tz: S) -> Self {
        self.timezone = tz.into();
        self
    }
}

/// 定时作业单次触发的审计记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Canceled,
}

impl From<TaskStatus> for CronExecutionStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => CronExecutionStatus::Pending,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Retrying => {
                CronExecutionStatus::Running
            }
            TaskStatus::Success => CronExecutionStatus::Success,
            TaskStatus::Failed | TaskStatus::Rolledback => CronExecutionStatus::Failed,
            TaskStatus::Timeout => CronExecutionStatus::Timeout,
            TaskStatus::Canceled => CronExecutionStatus::Canceled,
        }
    }
}

impl fmt::Display for CronExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CronExecutionStatus::Pending => "pending",
            CronExecutionStatus::Running => "running",
            CronExecutionStatus::Success => "success",
            CronExecutionStatus::Failed => "failed",
            CronExecutionStatus::Timeout => "timeout",
            CronExecutionStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CronExecution {
    pub id: i64,
    pub cron_job_id: i64,
    pub task_id: Option<i64>,
    pub status: CronExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CronExecution {
    pub fn new(cron_job_id: i64, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            cron_job_id,
            task_id: None,
            status: CronExecutionStatus::Pending,
            scheduled_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    pub fn fail<S: Into<String>>(&mut self, error: S) {
        self.status = CronExecutionStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

/// 定时作业的任务模板，字段覆盖生成任务的默认值
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskTemplate {
    pub name: Option<String>,
    #[serde(alias = "type", alias = "kind")]
    pub executor: Option<String>,
    pub command: Option<String>,
    pub script: Option<String>,
    #[serde(alias = "queueName", alias = "queue")]
    pub queue_name: Option<String>,
    #[serde(alias = "timeout_seconds")]
    pub timeout: Option<u64>,
    pub priority: Option<i32>,
    #[serde(alias = "maxRetry", alias = "max_retry")]
    pub max_retries: Option<u32>,
    #[serde(alias = "serverId")]
    pub server_id: Option<i64>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

impl TaskTemplate {
    pub fn parse(raw: &str) -> SchedulerResult<Self> {
        let template: TaskTemplate = serde_json::from_str(raw)
            .map_err(|e| SchedulerError::InvalidTemplate(e.to_string()))?;
        if let Some(executor) = &template.executor {
            executor
                .parse::<super::task::ExecutorKind>()
                .map_err(|e| SchedulerError::InvalidTemplate(e.to_string()))?;
        }
        Ok(template)
    }

    /// 以作业名与触发时间生成任务，再用模板字段覆盖
    pub fn materialize(&self, job: &CronJob, fired_at: DateTime<Utc>) -> Task {
        let mut task = Task::new(
            format!("{}-{}", job.name, fired_at.timestamp()),
            "shell",
            "",
        );
        task.priority = Some(priority::NORMAL);
        task.schedule_kind = ScheduleKind::Cron;
        task.scheduled_at = Some(fired_at);
        task.cron_job_id = Some(job.id);

        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(executor) = &self.executor {
            task.executor = executor.clone();
        }
        if let Some(command) = &self.command {
            task.command = command.clone();
        }
        if let Some(script) = &self.script {
            task.script = Some(script.clone());
        }
        if let Some(queue) = &self.queue_name {
            task.queue_name = queue.clone();
        }
        if self.timeout.is_some() {
            task.timeout_seconds = self.timeout;
        }
        if self.priority.is_some() {
            task.priority = self.priority;
        }
        if self.max_retries.is_some() {
            task.max_retries = self.max_retries;
        }
        if self.server_id.is_some() {
            task.server_id = self.server_id;
        }
        task.params = self.params.clone();
        task.params
            .insert("cron_job_id".to_string(), serde_json::json!(job.id));
        task
    }
}
