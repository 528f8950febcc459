use std::sync::Arc;

use async_trait::async_trait;
use jobcenter_core::{config::RetryConfig, QueueItem, SchedulerResult, TaskResult, TaskStatus};
use metrics::counter;
use tracing::{debug, info};

use crate::executor::ItemExecutor;

/// 有界重试
///
/// 最多调用 `max_retries + 1` 次；成功、取消，以及未开启对应开关的失败/超时立即返回。
pub struct RetryHandler {
    executor: Arc<dyn ItemExecutor>,
    config: RetryConfig,
}

impl RetryHandler {
    pub fn new(executor: Arc<dyn ItemExecutor>, config: RetryConfig) -> Self {
        Self { executor, config }
    }

    fn should_retry(&self, status: TaskStatus) -> bool {
        match status {
            TaskStatus::Timeout => self.config.retry_on_timeout,
            TaskStatus::Failed => self.config.retry_on_failure,
            _ => false,
        }
    }

    pub async fn execute_with_retry(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        let mut attempt = 0;
        loop {
            let mut result = self.executor.execute(item).await?;
            result.retry_count = attempt;

            if !self.should_retry(result.status) {
                return Ok(result);
            }
            if attempt >= self.config.max_retries {
                info!(
                    task_id = item.task_id,
                    retries = attempt,
                    status = %result.status,
                    "重试次数已用尽"
                );
                return Ok(result);
            }

            attempt += 1;
            debug!(
                task_id = item.task_id,
                attempt,
                delay_ms = self.config.retry_interval_ms,
                "等待后重试"
            );
            counter!("jobcenter_task_retries_total").increment(1);
            tokio::time::sleep(self.config.retry_interval()).await;
            self.executor.prepare_retry(item, attempt).await?;
        }
    }
}

#[async_trait]
impl ItemExecutor for RetryHandler {
    async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        self.execute_with_retry(item).await
    }
}
