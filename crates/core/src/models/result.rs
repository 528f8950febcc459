use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// 一次执行的结构化结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: i64,
    pub execution_id: String,
    pub status: TaskStatus,
    pub output: String,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub retry_count: u32,
    pub exit_code: Option<i32>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn failed<S: Into<String>>(task_id: i64, execution_id: &str, error: S) -> Self {
        Self {
            task_id,
            execution_id: execution_id.to_string(),
            status: TaskStatus::Failed,
            output: String::new(),
            error_message: Some(error.into()),
            duration_ms: 0,
            retry_count: 0,
            exit_code: None,
        }
    }
}
