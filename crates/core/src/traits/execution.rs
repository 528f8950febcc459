use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SchedulerResult;

/// 对在途执行的控制，供 replace 策略使用
#[async_trait]
pub trait ExecutionControl: Send + Sync {
    /// 取消任务的所有在途执行，返回被取消的执行数
    async fn cancel_task_executions(&self, task_id: i64) -> SchedulerResult<usize>;

    /// 等待任务的在途执行全部退出，超时返回 false
    async fn wait_task_stopped(&self, task_id: i64, timeout: Duration) -> bool;
}

/// 定时作业运行计数的写入方，与触发侧的计数更新串行化
#[async_trait]
pub trait CronOutcomeRecorder: Send + Sync {
    /// 按任务终态累加作业的成功或失败计数
    async fn record_outcome(
        &self,
        job_id: i64,
        succeeded: bool,
        error: Option<&str>,
    ) -> SchedulerResult<()>;
}
