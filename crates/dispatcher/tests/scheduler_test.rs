use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobcenter_core::{
    config::SchedulerConfig, event_types, ConcurrencyPolicy, CronExecutionFilter,
    CronExecutionStatus, CronJob, CronJobFilter, CronJobRepository, CronOutcomeRecorder,
    ExecutionControl, LeaderElection, Repositories, SchedulerError, SchedulerResult, Task,
    TaskEventFilter, TaskFilter, TaskStatus,
};
use jobcenter_dispatcher::{CronScheduler, FireOutcome};
use jobcenter_infrastructure::{MemoryQueueBackend, MemoryStore, TaskQueue};

const TEMPLATE: &str = r#"{"executor":"shell","command":"echo hi","queue":"ops"}"#;

struct Harness {
    scheduler: Arc<CronScheduler>,
    queue: Arc<TaskQueue>,
    repos: Repositories,
}

fn harness_with(configure: impl FnOnce(CronScheduler) -> CronScheduler) -> Harness {
    let store = MemoryStore::new();
    let repos = store.repositories();
    let queue = Arc::new(TaskQueue::new(
        Arc::new(MemoryQueueBackend::new()),
        repos.clone(),
    ));
    let config = SchedulerConfig {
        replace_wait_seconds: 1,
        ..Default::default()
    };
    let scheduler = Arc::new(configure(CronScheduler::new(
        Arc::clone(&queue),
        repos.clone(),
        config,
    )));
    Harness {
        scheduler,
        queue,
        repos,
    }
}

fn harness() -> Harness {
    harness_with(|s| s)
}

async fn create_job(repos: &Repositories, job: CronJob) -> CronJob {
    repos.cron_jobs.create(&job).await.unwrap()
}

async fn tasks_of(repos: &Repositories, job_id: i64) -> Vec<Task> {
    repos
        .tasks
        .list(&TaskFilter {
            cron_job_id: Some(job_id),
            ..Default::default()
        })
        .await
        .unwrap()
}

async fn insert_running(repos: &Repositories, job_id: i64) -> Task {
    let mut task = Task::new("previous", "shell", "sleep 60");
    task.cron_job_id = Some(job_id);
    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());
    repos.tasks.create(&task).await.unwrap()
}

async fn fire_all(h: &Harness) -> Vec<FireOutcome> {
    let mut outcomes = Vec::new();
    for handle in h.scheduler.tick(Utc::now() + chrono::Duration::minutes(2)).await {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    outcomes
}

#[derive(Default)]
struct RecordingControl {
    canceled: Mutex<Vec<i64>>,
}

#[async_trait]
impl ExecutionControl for RecordingControl {
    async fn cancel_task_executions(&self, task_id: i64) -> SchedulerResult<usize> {
        self.canceled.lock().unwrap().push(task_id);
        Ok(1)
    }

    async fn wait_task_stopped(&self, _task_id: i64, _timeout: Duration) -> bool {
        true
    }
}

struct Follower;

#[async_trait]
impl LeaderElection for Follower {
    async fn is_leader(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_add_job_persists_next_run() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("hourly", "0 * * * *", TEMPLATE)).await;

    let added = h.scheduler.add_job(job.clone()).await.unwrap();
    let next = added.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert_eq!(h.scheduler.next_run(job.id), Some(next));

    let stored = h.repos.cron_jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.next_run_at, Some(next));
}

#[tokio::test]
async fn test_add_job_rejects_invalid_expression_and_timezone() {
    let h = harness();
    let bad = create_job(&h.repos, CronJob::new("bad", "61 * * * *", TEMPLATE)).await;
    let err = h.scheduler.add_job(bad).await.unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidCron { .. }));

    let never = create_job(&h.repos, CronJob::new("never", "0 0 31 2 *", TEMPLATE)).await;
    assert!(h.scheduler.add_job(never).await.is_err());

    let tz = create_job(
        &h.repos,
        CronJob::new("tz", "0 * * * *", TEMPLATE).with_timezone("Mars/Olympus"),
    )
    .await;
    assert!(h.scheduler.add_job(tz).await.is_err());
    assert_eq!(h.scheduler.job_count(), 0);
}

#[tokio::test]
async fn test_tick_submits_task_and_records_execution() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("minutely", "* * * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    let outcomes = fire_all(&h).await;
    assert_eq!(outcomes.len(), 1);
    let FireOutcome::Submitted {
        execution_id,
        task_id,
    } = outcomes[0]
    else {
        panic!("expected submitted, got {:?}", outcomes[0]);
    };

    let task = h.repos.tasks.get_by_id(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.queue_name, "ops");
    assert_eq!(task.cron_job_id, Some(job.id));
    assert_eq!(h.queue.size("ops").await, 1);

    let execution = h
        .repos
        .cron_executions
        .get_by_id(execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, CronExecutionStatus::Running);
    assert_eq!(execution.task_id, Some(task_id));

    let stored = h.repos.cron_jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.run_count, 1);
    assert!(stored.last_run_at.is_some());
    assert!(stored.prev_run_at.is_some());

    let events = h
        .repos
        .events
        .list(&TaskEventFilter {
            task_id: Some(task_id),
            event_type: Some(event_types::CRON_TRIGGERED.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn test_due_entry_fires_once_per_slot() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("minutely", "* * * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    let at = Utc::now() + chrono::Duration::minutes(2);
    let first = h.scheduler.tick(at).await;
    let second = h.scheduler.tick(at).await;
    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    for handle in first {
        handle.await.unwrap().unwrap();
    }
    assert!(h.scheduler.next_run(job.id).unwrap() > at);
}

#[tokio::test]
async fn test_forbid_skips_while_previous_run_active() {
    let h = harness();
    let job = create_job(
        &h.repos,
        CronJob::new("forbid", "* * * * *", TEMPLATE).with_policy(ConcurrencyPolicy::Forbid),
    )
    .await;
    h.scheduler.add_job(job.clone()).await.unwrap();
    insert_running(&h.repos, job.id).await;

    let outcomes = fire_all(&h).await;
    assert_eq!(outcomes, vec![FireOutcome::Skipped]);
    assert_eq!(tasks_of(&h.repos, job.id).await.len(), 1);

    let executions = h
        .repos
        .cron_executions
        .list(&CronExecutionFilter {
            cron_job_id: Some(job.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(executions.is_empty());
}

#[tokio::test]
async fn test_replace_cancels_running_task_before_submitting() {
    let control = Arc::new(RecordingControl::default());
    let control_for_scheduler: Arc<dyn ExecutionControl> = control.clone();
    let h = harness_with(|s| s.with_execution_control(control_for_scheduler));

    let job = create_job(
        &h.repos,
        CronJob::new("replace", "* * * * *", TEMPLATE).with_policy(ConcurrencyPolicy::Replace),
    )
    .await;
    h.scheduler.add_job(job.clone()).await.unwrap();
    let previous = insert_running(&h.repos, job.id).await;

    let outcomes = fire_all(&h).await;
    assert!(matches!(outcomes[0], FireOutcome::Submitted { .. }));
    assert_eq!(*control.canceled.lock().unwrap(), vec![previous.id]);

    let previous = h.repos.tasks.get_by_id(previous.id).await.unwrap().unwrap();
    assert_eq!(previous.status, TaskStatus::Canceled);
    assert_eq!(tasks_of(&h.repos, job.id).await.len(), 2);
}

#[tokio::test]
async fn test_replace_cancels_queued_task() {
    let h = harness();
    let job = create_job(
        &h.repos,
        CronJob::new("replace", "* * * * *", TEMPLATE).with_policy(ConcurrencyPolicy::Replace),
    )
    .await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    let mut waiting = Task::new("waiting", "shell", "echo");
    waiting.cron_job_id = Some(job.id);
    let waiting = h.queue.enqueue("ops", waiting).await.unwrap();

    fire_all(&h).await;
    let waiting = h.repos.tasks.get_by_id(waiting.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, TaskStatus::Canceled);
    // 只剩新提交的任务在队列中
    assert_eq!(h.queue.size("ops").await, 1);
}

#[tokio::test]
async fn test_invalid_template_marks_execution_failed() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("broken", "* * * * *", "not json")).await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    let outcomes = fire_all(&h).await;
    let FireOutcome::Failed { execution_id, error } = &outcomes[0] else {
        panic!("expected failure, got {:?}", outcomes[0]);
    };
    assert!(error.starts_with("Invalid task template"));

    let execution = h
        .repos
        .cron_executions
        .get_by_id(*execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, CronExecutionStatus::Failed);
    assert!(tasks_of(&h.repos, job.id).await.is_empty());

    let stored = h.repos.cron_jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.fail_count, 1);
    assert!(stored.last_error.is_some());
}

#[tokio::test]
async fn test_trigger_job_keeps_schedule() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("daily", "0 3 * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();
    let before = h.scheduler.next_run(job.id);

    let outcome = h.scheduler.trigger_job(job.id).await.unwrap();
    assert!(matches!(outcome, FireOutcome::Submitted { .. }));
    assert_eq!(h.scheduler.next_run(job.id), before);

    let stored = h.repos.cron_jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.run_count, 1);
    assert_eq!(stored.next_run_at, before);

    let missing = h.scheduler.trigger_job(9999).await.unwrap_err();
    assert!(matches!(missing, SchedulerError::CronJobNotFound { id: 9999 }));
}

#[tokio::test]
async fn test_get_next_runs_is_restartable() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("quarter", "*/15 * * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    let runs = h.scheduler.get_next_runs(job.id, 3).unwrap();
    let first: Vec<_> = runs.clone().collect();
    let again: Vec<_> = runs.collect();
    assert_eq!(first, again);
    assert_eq!(first.len(), 3);
    assert_eq!(Some(first[0]), h.scheduler.next_run(job.id));
    assert_eq!(first[1] - first[0], chrono::Duration::minutes(15));
    assert_eq!(first[2] - first[1], chrono::Duration::minutes(15));

    assert!(matches!(
        h.scheduler.get_next_runs(42, 3),
        Err(SchedulerError::CronJobNotFound { id: 42 })
    ));
}

#[tokio::test]
async fn test_update_job_disabling_removes_entry() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("hourly", "0 * * * *", TEMPLATE)).await;
    let mut job = h.scheduler.add_job(job).await.unwrap();
    assert!(h.scheduler.contains_job(job.id));

    job.cron_expr = "bogus".to_string();
    assert!(h.scheduler.update_job(job.clone()).await.is_err());
    // 解析失败时保留原条目
    assert!(h.scheduler.contains_job(job.id));

    job.cron_expr = "30 * * * *".to_string();
    job.enabled = false;
    h.scheduler.update_job(job.clone()).await.unwrap();
    assert!(!h.scheduler.contains_job(job.id));
    assert!(!h.scheduler.remove_job(job.id).unwrap());
}

#[tokio::test]
async fn test_load_jobs_skips_disabled_and_invalid() {
    let h = harness();
    create_job(&h.repos, CronJob::new("a", "0 * * * *", TEMPLATE)).await;
    create_job(&h.repos, CronJob::new("b", "*/5 * * * *", TEMPLATE)).await;
    let mut disabled = CronJob::new("c", "0 * * * *", TEMPLATE);
    disabled.enabled = false;
    create_job(&h.repos, disabled).await;
    create_job(&h.repos, CronJob::new("d", "not a cron", TEMPLATE)).await;

    assert_eq!(h.scheduler.load_jobs().await.unwrap(), 2);
    assert_eq!(h.scheduler.job_count(), 2);
}

#[tokio::test]
async fn test_follower_does_not_fire() {
    let h = harness_with(|s| s.with_leader_election(Arc::new(Follower)));
    let job = create_job(&h.repos, CronJob::new("minutely", "* * * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();

    assert!(fire_all(&h).await.is_empty());
    assert!(tasks_of(&h.repos, job.id).await.is_empty());
}

/// 读取后让出一段时间，使未串行化的读改写必然交错
struct SlowCronJobs {
    inner: Arc<dyn CronJobRepository>,
}

#[async_trait]
impl CronJobRepository for SlowCronJobs {
    async fn create(&self, job: &CronJob) -> SchedulerResult<CronJob> {
        self.inner.create(job).await
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<CronJob>> {
        let job = self.inner.get_by_id(id).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(job)
    }

    async fn list(&self, filter: &CronJobFilter) -> SchedulerResult<Vec<CronJob>> {
        self.inner.list(filter).await
    }

    async fn update(&self, job: &CronJob) -> SchedulerResult<()> {
        self.inner.update(job).await
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.inner.delete(id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_and_outcome_counters_are_serialized() {
    let mut repos = MemoryStore::new().repositories();
    repos.cron_jobs = Arc::new(SlowCronJobs {
        inner: Arc::clone(&repos.cron_jobs),
    });
    let queue = Arc::new(TaskQueue::new(
        Arc::new(MemoryQueueBackend::new()),
        repos.clone(),
    ));
    let scheduler = Arc::new(CronScheduler::new(
        queue,
        repos.clone(),
        SchedulerConfig::default(),
    ));
    let job = create_job(&repos, CronJob::new("sync", "0 3 * * *", TEMPLATE)).await;
    scheduler.add_job(job.clone()).await.unwrap();
    let job_id = job.id;

    let mut handles = Vec::new();
    for i in 0..10 {
        let s = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            s.trigger_job(job_id).await.map(|_| ())
        }));
        let s = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move {
            s.record_outcome(job_id, i % 2 == 0, Some("退出码 1")).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = repos.cron_jobs.get_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.run_count, 10);
    assert_eq!(stored.success_count, 5);
    assert_eq!(stored.fail_count, 5);
    assert_eq!(stored.last_error.as_deref(), Some("退出码 1"));
}

#[tokio::test]
async fn test_remove_job_reports_missing_entry() {
    let h = harness();
    let job = create_job(&h.repos, CronJob::new("hourly", "0 * * * *", TEMPLATE)).await;
    h.scheduler.add_job(job.clone()).await.unwrap();
    assert!(h.scheduler.remove_job(job.id).unwrap());
    assert!(!h.scheduler.remove_job(job.id).unwrap());
    assert_eq!(h.scheduler.job_count(), 0);
}
