use thiserror::Error;

/// 作业中心错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("未知的执行器类型: {0}")]
    UnknownExecutor(String),

    #[error("无效的任务模板: {0}")]
    InvalidTemplate(String),

    #[error("队列已满: {queue} (max_pending={max_pending})")]
    QueueFull { queue: String, max_pending: usize },

    #[error("出队超时: {queue}")]
    DequeueTimeout { queue: String },

    #[error("重复任务: 幂等键 {key} 仍在去重窗口内")]
    DuplicateTask { key: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("定时作业未找到: {id}")]
    CronJobNotFound { id: i64 },

    #[error("执行实例未找到: {id}")]
    ExecutionNotFound { id: String },

    #[error("无效的状态转换: 任务 {task_id} {from} -> {to}")]
    InvalidStatusTransition {
        task_id: i64,
        from: String,
        to: String,
    },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("任务已取消")]
    Cancelled,

    #[error("存储错误: {0}")]
    Store(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// 错误分类，对应调用方需要区分处理的几类失败
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Capacity,
    Execution,
    Timeout,
    Cancellation,
    Store,
    NotFound,
    Internal,
}

impl SchedulerError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_cron<E: Into<String>, M: Into<String>>(expr: E, message: M) -> Self {
        Self::InvalidCron {
            expr: expr.into(),
            message: message.into(),
        }
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }

    pub fn cron_job_not_found(id: i64) -> Self {
        Self::CronJobNotFound { id }
    }

    pub fn execution_not_found<S: Into<String>>(id: S) -> Self {
        Self::ExecutionNotFound { id: id.into() }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_)
            | Self::InvalidCron { .. }
            | Self::UnknownExecutor(_)
            | Self::InvalidTemplate(_)
            | Self::DuplicateTask { .. }
            | Self::InvalidStatusTransition { .. } => ErrorCategory::Validation,
            Self::QueueFull { .. } => ErrorCategory::Capacity,
            Self::TaskExecution(_) => ErrorCategory::Execution,
            Self::ExecutionTimeout | Self::DequeueTimeout { .. } => ErrorCategory::Timeout,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Store(_) | Self::Serialization(_) => ErrorCategory::Store,
            Self::TaskNotFound { .. }
            | Self::CronJobNotFound { .. }
            | Self::ExecutionNotFound { .. } => ErrorCategory::NotFound,
            Self::Configuration(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// 是否可以由重试策略处理
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Execution | ErrorCategory::Timeout
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ExecutionTimeout | Self::DequeueTimeout { .. })
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            SchedulerError::invalid_cron("x", "bad").category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            SchedulerError::QueueFull {
                queue: "default".into(),
                max_pending: 1
            }
            .category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            SchedulerError::DequeueTimeout {
                queue: "default".into()
            }
            .category(),
            ErrorCategory::Timeout
        );
        assert_eq!(SchedulerError::Cancelled.category(), ErrorCategory::Cancellation);
        assert_eq!(SchedulerError::store("io").category(), ErrorCategory::Store);
    }

    #[test]
    fn test_retryable() {
        assert!(SchedulerError::ExecutionTimeout.is_retryable());
        assert!(SchedulerError::TaskExecution("exit 1".into()).is_retryable());
        assert!(!SchedulerError::Cancelled.is_retryable());
        assert!(!SchedulerError::UnknownExecutor("ftp".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::UnknownExecutor("ftp".into());
        assert_eq!(err.to_string(), "未知的执行器类型: ftp");
    }
}
