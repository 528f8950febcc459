use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_core::{
    config::IdempotencyConfig, QueueItem, SchedulerError, SchedulerResult, TaskResult,
    TaskStatus,
};
use jobcenter_worker::{IdempotencyGuard, IdempotencyStatus, ItemExecutor};

struct SlowExecutor {
    calls: AtomicU32,
    delay: Duration,
    fail_first: bool,
}

impl SlowExecutor {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            fail_first: false,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemExecutor for SlowExecutor {
    async fn execute(&self, item: &QueueItem) -> SchedulerResult<TaskResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail_first && call == 0 {
            return Err(SchedulerError::store("写入失败"));
        }
        let mut result = TaskResult::failed(item.task_id, &item.execution_id, "");
        result.status = TaskStatus::Success;
        result.error_message = None;
        result.output = format!("call-{call}");
        Ok(result)
    }
}

fn config(poll_ms: u64, attempts: u32) -> IdempotencyConfig {
    IdempotencyConfig {
        poll_interval_ms: poll_ms,
        max_poll_attempts: attempts,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_execution() {
    let executor = SlowExecutor::new(Duration::from_millis(200));
    let guard = Arc::new(IdempotencyGuard::new(executor.clone(), config(20, 100)));
    let ttl = Duration::from_secs(60);

    let item_a = QueueItem::new(1, "default", 5);
    let item_b = QueueItem::new(1, "default", 5);
    let (a, b) = tokio::join!(
        guard.execute_with_idempotent("deploy-42", &item_a, ttl),
        guard.execute_with_idempotent("deploy-42", &item_b, ttl),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(executor.calls(), 1);
    assert_eq!(a, b);

    // 终态记录直接返回，不再执行
    let c = guard
        .execute_with_idempotent("deploy-42", &QueueItem::new(1, "default", 5), ttl)
        .await
        .unwrap();
    assert_eq!(c, a);
    assert_eq!(executor.calls(), 1);

    let record = guard.check("deploy-42").unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn test_distinct_keys_execute_separately() {
    let executor = SlowExecutor::new(Duration::from_millis(1));
    let guard = IdempotencyGuard::new(executor.clone(), config(10, 10));
    let item = QueueItem::new(1, "default", 5);
    guard
        .execute_with_idempotent("a", &item, Duration::from_secs(60))
        .await
        .unwrap();
    guard
        .execute_with_idempotent("b", &item, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_expired_records_are_ignored_and_cleaned() {
    let executor = SlowExecutor::new(Duration::from_millis(1));
    let guard = IdempotencyGuard::new(executor.clone(), config(10, 10));
    let item = QueueItem::new(1, "default", 5);

    guard
        .execute_with_idempotent("short", &item, Duration::from_millis(50))
        .await
        .unwrap();
    assert!(guard.check("short").is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(guard.check("short").is_none());
    assert_eq!(guard.cleanup(), 1);
    assert!(guard.is_empty());

    // 过期后视为新窗口
    guard
        .execute_with_idempotent("short", &item, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(executor.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poll_bound_returns_running_record() {
    let executor = SlowExecutor::new(Duration::from_millis(500));
    let guard = Arc::new(IdempotencyGuard::new(executor.clone(), config(10, 3)));
    let ttl = Duration::from_secs(60);

    let owner = {
        let guard = Arc::clone(&guard);
        tokio::spawn(async move {
            guard
                .execute_with_idempotent("slow", &QueueItem::new(1, "default", 5), ttl)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = guard
        .execute_with_idempotent("slow", &QueueItem::new(1, "default", 5), ttl)
        .await
        .unwrap();
    assert_eq!(waiter.status, TaskStatus::Running);

    let owned = owner.await.unwrap().unwrap();
    assert!(owned.is_success());
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_executor_error_releases_key() {
    let executor = Arc::new(SlowExecutor {
        calls: AtomicU32::new(0),
        delay: Duration::from_millis(1),
        fail_first: true,
    });
    let guard = IdempotencyGuard::new(executor.clone(), config(10, 10));
    let item = QueueItem::new(1, "default", 5);

    assert!(guard
        .execute_with_idempotent("k", &item, Duration::from_secs(60))
        .await
        .is_err());
    assert!(guard.check("k").is_none());

    let result = guard
        .execute_with_idempotent("k", &item, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(executor.calls(), 2);
}

#[tokio::test]
async fn test_prepare_runs_only_for_owner() {
    let executor = SlowExecutor::new(Duration::from_millis(100));
    let guard = IdempotencyGuard::new(executor.clone(), config(10, 50));
    let ttl = Duration::from_secs(60);
    let prepared = AtomicU32::new(0);
    let prepared_ref = &prepared;
    let prepare = || async move {
        let n = prepared_ref.fetch_add(1, Ordering::SeqCst);
        Ok(QueueItem::new(i64::from(n) + 1, "default", 5))
    };

    let (a, b) = tokio::join!(
        guard.execute_prepared("patch", ttl, prepare),
        guard.execute_prepared("patch", ttl, prepare),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    let again = guard.execute_prepared("patch", ttl, prepare).await.unwrap();
    assert_eq!(again.task_id, 1);
    assert_eq!(prepared.load(Ordering::SeqCst), 1);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_prepare_error_releases_key() {
    let executor = SlowExecutor::new(Duration::from_millis(1));
    let guard = IdempotencyGuard::new(executor.clone(), config(10, 10));
    let ttl = Duration::from_secs(60);

    let err = guard
        .execute_prepared("k", ttl, || async { Err(SchedulerError::store("写入失败")) })
        .await;
    assert!(err.is_err());
    assert!(guard.check("k").is_none());
    assert_eq!(executor.calls(), 0);
}
