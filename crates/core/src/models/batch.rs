use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    PartiallyFailed,
}

/// 批量任务：一组任务共享并行度与失败即停设置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskBatch {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub parallelism: usize,
    pub stop_on_failure: bool,
    pub status: BatchStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub task_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskBatch {
    pub fn new<S: Into<String>>(name: S, parallelism: usize) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            parallelism,
            stop_on_failure: false,
            status: BatchStatus::Pending,
            total: 0,
            completed: 0,
            failed: 0,
            task_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 根据已完成/失败数量刷新批次状态
    pub fn refresh_status(&mut self) {
        let finished = self.completed + self.failed;
        self.status = if finished < self.total {
            if self.failed > 0 && self.stop_on_failure {
                BatchStatus::Failed
            } else if finished == 0 {
                BatchStatus::Pending
            } else {
                BatchStatus::Running
            }
        } else if self.failed == 0 {
            BatchStatus::Completed
        } else if self.completed == 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::PartiallyFailed
        };
        self.updated_at = Utc::now();
    }
}
