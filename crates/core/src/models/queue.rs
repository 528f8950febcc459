use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{priority, DEFAULT_QUEUE, DEFAULT_TIMEOUT_SECONDS};

/// 队列配置：容量上限与任务缺省值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// 最大并发消费者数
    pub max_workers: usize,
    /// 最大积压任务数，仅在入队时检查
    pub max_pending: usize,
    /// 任务未指定时的默认优先级
    pub priority: i32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl QueueConfig {
    pub fn new<S: Into<String>>(
        name: S,
        max_workers: usize,
        max_pending: usize,
        priority: i32,
        timeout_seconds: u64,
        max_retries: u32,
    ) -> Self {
        Self {
            name: name.into(),
            max_workers,
            max_pending,
            priority,
            timeout_seconds,
            max_retries,
        }
    }

    /// 未注册队列首次使用时的配置
    pub fn fallback<S: Into<String>>(name: S) -> Self {
        Self::new(name, 10, 1000, priority::NORMAL, DEFAULT_TIMEOUT_SECONDS, 3)
    }

    /// 启动时注册的内置队列
    pub fn builtin() -> Vec<QueueConfig> {
        vec![
            Self::new(DEFAULT_QUEUE, 10, 1000, priority::NORMAL, 300, 3),
            Self::new("critical", 5, 100, priority::URGENT, 600, 5),
            Self::new("background", 20, 5000, priority::LOW, 3600, 2),
            Self::new("deploy", 3, 50, priority::HIGH, 1800, 1),
            Self::new("batch", 15, 2000, 3, 7200, 3),
        ]
    }
}

/// 队列中的一次投递
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    pub task_id: i64,
    /// 每次入队生成的执行ID
    pub execution_id: String,
    pub queue_name: String,
    pub priority: i32,
    pub server_id: Option<i64>,
    /// 入队序号，同优先级按序号先进先出
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn new<Q: Into<String>>(task_id: i64, queue_name: Q, priority: i32) -> Self {
        Self {
            task_id,
            execution_id: uuid::Uuid::new_v4().to_string(),
            queue_name: queue_name.into(),
            priority,
            server_id: None,
            sequence: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub queue_name: String,
    pub pending: usize,
    pub running: usize,
    pub completed_today: usize,
    pub failed_today: usize,
    pub max_pending: usize,
    pub max_workers: usize,
}
