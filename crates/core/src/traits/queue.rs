use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SchedulerResult;
use crate::models::QueueItem;

/// 按名称区分的优先级队列后端
///
/// 同一队列内按优先级降序、入队序号升序出队；一个条目只会交付给一个消费者。
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// 放入条目并唤醒一个等待中的消费者
    async fn push(&self, item: QueueItem) -> SchedulerResult<()>;

    /// 阻塞等待条目，超时返回 `SchedulerError::DequeueTimeout`
    async fn pop(&self, queue: &str, timeout: Duration) -> SchedulerResult<QueueItem>;

    /// 查看队首条目但不出队
    async fn peek(&self, queue: &str) -> Option<QueueItem>;

    /// 完成确认，清理在途记录
    async fn ack(&self, queue: &str, task_id: i64) -> SchedulerResult<()>;

    /// 失败确认，只清理在途记录，不会重新入队
    async fn nack(&self, queue: &str, task_id: i64, reason: &str) -> SchedulerResult<()>;

    /// 移除尚未出队的任务
    async fn remove(&self, queue: &str, task_id: i64) -> bool;

    async fn size(&self, queue: &str) -> usize;

    async fn in_flight(&self, queue: &str) -> usize;

    /// 清空队列，返回被丢弃的条目
    async fn clear(&self, queue: &str) -> Vec<QueueItem>;
}
