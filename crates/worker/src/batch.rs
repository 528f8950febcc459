use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jobcenter_core::{config::BatchConfig, QueueItem, SchedulerError, SchedulerResult, TaskResult};
use tracing::{debug, info};

use crate::executor::ItemExecutor;

/// 分组执行：组内并发，组间串行，可选组间间隔；结果按输入顺序返回
pub struct BatchExecutor {
    executor: Arc<dyn ItemExecutor>,
    batch_size: usize,
    interval: Duration,
}

impl BatchExecutor {
    pub fn new(executor: Arc<dyn ItemExecutor>, batch_size: usize, interval: Duration) -> Self {
        Self {
            executor,
            batch_size: batch_size.max(1),
            interval,
        }
    }

    pub fn from_config(executor: Arc<dyn ItemExecutor>, config: &BatchConfig) -> Self {
        Self::new(executor, config.batch_size, config.interval())
    }

    pub async fn execute_batch(&self, items: Vec<QueueItem>) -> Vec<SchedulerResult<TaskResult>> {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let groups: Vec<Vec<QueueItem>> = items
            .chunks(self.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let group_count = groups.len();

        for (index, group) in groups.into_iter().enumerate() {
            if index > 0 && !self.interval.is_zero() {
                tokio::time::sleep(self.interval).await;
            }
            debug!(group = index, size = group.len(), "执行批次分组");

            let handles = group.into_iter().map(|item| {
                let executor = Arc::clone(&self.executor);
                tokio::spawn(async move { executor.execute(&item).await })
            });
            for joined in join_all(handles).await {
                results.push(joined.unwrap_or_else(|e| {
                    Err(SchedulerError::Internal(format!("批量执行任务异常退出: {e}")))
                }));
            }
        }

        info!(total, groups = group_count, "批量执行完成");
        results
    }
}
