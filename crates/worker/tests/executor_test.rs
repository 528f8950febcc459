use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jobcenter_core::{
    config::ExecutorConfig, event_types, ExecutorKind, QueueItem, Repositories, SchedulerError,
    Task, TaskEventFilter, TaskStatus,
};
use jobcenter_infrastructure::{MemoryQueueBackend, MemoryStore, TaskQueue};
use jobcenter_worker::{
    ExecutionContext, HandlerOutcome, HandlerRegistry, TaskExecutor, TaskHandler,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// 把渲染后的命令原样作为输出
struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn execute(&self, ctx: &ExecutionContext, _cancel: CancellationToken) -> HandlerOutcome {
        HandlerOutcome::success(ctx.command.clone())
    }
}

/// 一直等待直到被取消
#[derive(Default)]
struct BlockingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl TaskHandler for BlockingHandler {
    async fn execute(&self, _ctx: &ExecutionContext, cancel: CancellationToken) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => HandlerOutcome::canceled(),
            _ = tokio::time::sleep(Duration::from_secs(30)) => HandlerOutcome::success("late"),
        }
    }
}

struct FailingHandler;

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(&self, _ctx: &ExecutionContext, _cancel: CancellationToken) -> HandlerOutcome {
        HandlerOutcome::failure("磁盘已满")
    }
}

struct Fixture {
    queue: Arc<TaskQueue>,
    repos: Repositories,
    executor: Arc<TaskExecutor>,
}

fn fixture(configure: impl FnOnce(HandlerRegistry) -> HandlerRegistry) -> Fixture {
    let store = MemoryStore::new();
    let repos = store.repositories();
    let queue = Arc::new(TaskQueue::new(
        Arc::new(MemoryQueueBackend::new()),
        repos.clone(),
    ));
    let handlers = configure(HandlerRegistry::new(&ExecutorConfig::default()));
    let executor = Arc::new(TaskExecutor::new(repos.clone(), handlers, 64));
    Fixture {
        queue,
        repos,
        executor,
    }
}

async fn submit(f: &Fixture, task: Task) -> QueueItem {
    f.queue.enqueue("default", task).await.unwrap();
    f.queue
        .dequeue("default", Duration::from_secs(1))
        .await
        .unwrap()
}

async fn wait_live(executor: &TaskExecutor) -> String {
    for _ in 0..200 {
        if let Some(snapshot) = executor.live_executions().into_iter().next() {
            return snapshot.execution_id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("execution never became live");
}

#[tokio::test]
async fn test_placeholder_substitution_end_to_end() {
    let f = fixture(|r| r.with_handler(ExecutorKind::Shell, Arc::new(EchoHandler)));
    let task = Task::new("greet", "shell", "{{.name}} ready").with_param("name", json!("db1"));
    let item = submit(&f, task).await;

    let result = f.executor.execute(&item).await.unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert!(result.output.contains("db1 ready"));

    let stored = f.repos.tasks.get_by_id(item.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Success);
    assert_eq!(stored.output.as_deref(), Some("db1 ready"));
    assert!(stored.completed_at.is_some());
    assert_eq!(f.executor.live_count(), 0);
}

#[tokio::test]
async fn test_real_shell_renders_params() {
    let f = fixture(|r| r);
    let task = Task::new("greet", "shell", "echo {{.name}} ready {{.unknown}}")
        .with_param("name", json!("db1"));
    let item = submit(&f, task).await;

    let result = f.executor.execute(&item).await.unwrap();
    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.output, "db1 ready {{.unknown}}");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_unknown_executor_fails_without_dispatch() {
    let handler = Arc::new(BlockingHandler::default());
    let shell: Arc<dyn TaskHandler> = handler.clone();
    let f = fixture(|r| r.with_handler(ExecutorKind::Shell, shell));

    // 绕过入队校验直接写入一个未知执行方式的任务
    let mut task = Task::new("legacy", "telnet", "open host");
    task.status = TaskStatus::Queued;
    let task = f.repos.tasks.create(&task).await.unwrap();
    let item = QueueItem::new(task.id, "default", 5);

    let result = f.executor.execute(&item).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert!(result.error_message.unwrap().contains("未知的执行器类型"));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(f.executor.live_count(), 0);
}

#[tokio::test]
async fn test_timeout_cancels_handler() {
    let handler = Arc::new(BlockingHandler::default());
    let shell: Arc<dyn TaskHandler> = handler.clone();
    let f = fixture(|r| r.with_handler(ExecutorKind::Shell, shell));
    let item = submit(&f, Task::new("slow", "shell", "sleep 30").with_timeout(1)).await;

    let started = Instant::now();
    let result = f.executor.execute(&item).await.unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

    let stored = f.repos.tasks.get_by_id(item.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Timeout);
    assert_eq!(
        f.executor.get_status(&item.execution_id).unwrap(),
        TaskStatus::Timeout
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_execution_is_idempotent() {
    let handler = Arc::new(BlockingHandler::default());
    let shell: Arc<dyn TaskHandler> = handler.clone();
    let f = fixture(|r| r.with_handler(ExecutorKind::Shell, shell));
    let item = submit(&f, Task::new("slow", "shell", "sleep 30")).await;

    let executor = Arc::clone(&f.executor);
    let running = tokio::spawn(async move { executor.execute(&item).await });
    let execution_id = wait_live(&f.executor).await;
    assert_eq!(
        f.executor.get_status(&execution_id).unwrap(),
        TaskStatus::Running
    );

    f.executor.cancel(&execution_id).unwrap();
    f.executor.cancel(&execution_id).unwrap();

    let result = running.await.unwrap().unwrap();
    assert_eq!(result.status, TaskStatus::Canceled);

    let snapshot = f.executor.snapshot(&execution_id).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Canceled);
    assert!(snapshot.token_cancelled);
    assert!(!snapshot.live);

    // 已结束的执行再次取消不报错
    f.executor.cancel(&execution_id).unwrap();

    let stored = f.repos.tasks.get_by_id(result.task_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_unknown_execution_is_error() {
    let f = fixture(|r| r);
    let err = f.executor.cancel("no-such-execution").unwrap_err();
    assert!(matches!(err, SchedulerError::ExecutionNotFound { .. }));
    assert!(f.executor.get_status("no-such-execution").is_err());
}

#[tokio::test]
async fn test_failure_is_recorded_and_cleaned_up() {
    let f = fixture(|r| r.with_handler(ExecutorKind::Shell, Arc::new(FailingHandler)));
    let item = submit(&f, Task::new("broken", "shell", "df -h")).await;

    let result = f.executor.execute(&item).await.unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_message.as_deref(), Some("磁盘已满"));
    assert_eq!(f.executor.live_count(), 0);

    let events = f
        .repos
        .events
        .list(&TaskEventFilter {
            task_id: Some(item.task_id),
            ..Default::default()
        })
        .await
        .unwrap();
    let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert!(types.contains(&event_types::STARTED));
    assert!(types.contains(&event_types::FAILED));
}

#[tokio::test]
async fn test_missing_task_is_error() {
    let f = fixture(|r| r);
    let item = QueueItem::new(404, "default", 5);
    let err = f.executor.execute(&item).await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { id: 404 }));
}
