use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 事件类型
pub mod event_types {
    pub const CREATED: &str = "created";
    pub const ENQUEUED: &str = "enqueued";
    pub const STARTED: &str = "started";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELED: &str = "canceled";
    pub const RETRY_SCHEDULED: &str = "retry_scheduled";
    pub const ROLLBACK: &str = "rollback";
    pub const CRON_TRIGGERED: &str = "cron_triggered";
}

/// 事件来源组件
pub mod event_sources {
    pub const QUEUE: &str = "queue";
    pub const EXECUTOR: &str = "executor";
    pub const WORKER: &str = "worker";
    pub const CRON: &str = "cron";
    pub const JOB_CENTER: &str = "job_center";
}

/// 只追加的任务事件日志
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: i64,
    pub event_type: String,
    pub source: String,
    pub message: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl TaskEvent {
    pub fn new<M: Into<String>>(task_id: i64, event_type: &str, source: &str, message: M) -> Self {
        Self {
            id: 0,
            task_id,
            event_type: event_type.to_string(),
            source: source.to_string(),
            message: message.into(),
            data: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
