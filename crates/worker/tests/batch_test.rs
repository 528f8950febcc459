use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobcenter_core::{QueueItem, SchedulerError, SchedulerResult, TaskResult, TaskStatus};
use jobcenter_worker::{BatchExecutor, ItemExecutor};

/// 记录最大并发数；task_id 为 3 时返回错误
#[derive(Default)]
struct Tracking {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ItemExecutor for Tracking {
    async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // 后提交的条目先结束，检验结果按输入顺序重组
        tokio::time::sleep(Duration::from_millis(60 - (item.task_id as u64 % 2) * 40)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if item.task_id == 3 {
            return Err(SchedulerError::task_not_found(3));
        }
        let mut result = TaskResult::failed(item.task_id, &item.execution_id, "");
        result.status = TaskStatus::Success;
        result.error_message = None;
        Ok(result)
    }
}

fn items(n: i64) -> Vec<QueueItem> {
    (1..=n).map(|id| QueueItem::new(id, "batch", 3)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_results_keep_input_order_and_group_ceiling() {
    let executor = Arc::new(Tracking::default());
    let batch = BatchExecutor::new(executor.clone(), 2, Duration::ZERO);

    let results = batch.execute_batch(items(5)).await;
    assert_eq!(results.len(), 5);
    for (index, result) in results.iter().enumerate() {
        let expected = index as i64 + 1;
        match result {
            Ok(r) => assert_eq!(r.task_id, expected),
            Err(e) => {
                assert_eq!(expected, 3);
                assert!(matches!(e, SchedulerError::TaskNotFound { id: 3 }));
            }
        }
    }
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_interval_between_groups() {
    let executor = Arc::new(Tracking::default());
    let batch = BatchExecutor::new(executor, 2, Duration::from_millis(50));

    let started = Instant::now();
    let results = batch.execute_batch(items(6)).await;
    assert_eq!(results.len(), 6);
    // 三个分组之间两次间隔
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_empty_batch() {
    let batch = BatchExecutor::new(Arc::new(Tracking::default()), 4, Duration::from_secs(1));
    assert!(batch.execute_batch(Vec::new()).await.is_empty());
}
