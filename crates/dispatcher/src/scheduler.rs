use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobcenter_core::{
    config::SchedulerConfig, event_sources, event_types, ConcurrencyPolicy, CronExecution,
    CronExecutionStatus, CronJob, CronJobFilter, CronOutcomeRecorder, ExecutionControl, LeaderElection,
    Repositories, SchedulerError, SchedulerResult, SingleNodeLeader, TaskEvent, TaskFilter,
    TaskStatus, TaskTemplate,
};
use jobcenter_infrastructure::TaskQueue;
use metrics::counter;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron_utils::{CronExpression, CronIter};

/// `get_next_runs` 返回的惰性序列，克隆后可重新遍历
pub type NextRuns =
    std::iter::Take<std::iter::Chain<std::iter::Once<DateTime<Utc>>, CronIter>>;

/// 一次触发的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// forbid 策略下仍有在途任务，本次触发被跳过
    Skipped,
    /// 任务已提交到队列
    Submitted { execution_id: i64, task_id: i64 },
    /// 模板解析或入队失败
    Failed { execution_id: i64, error: String },
}

#[derive(Debug, Clone)]
struct CronEntry {
    job: CronJob,
    expression: CronExpression,
    next_run: DateTime<Utc>,
    prev_run: Option<DateTime<Utc>>,
}

/// 一次到期的触发：作业快照、计划时间与推进后的下次时间
struct DueFire {
    job: CronJob,
    scheduled_at: DateTime<Utc>,
    next_run: Option<DateTime<Utc>>,
}

/// 定时作业调度器
///
/// 每个启用的作业在内存中对应一个调度条目；时钟每秒扫描一次，
/// 到期条目各自在独立的任务中触发，互不阻塞。
pub struct CronScheduler {
    entries: RwLock<HashMap<i64, CronEntry>>,
    queue: Arc<TaskQueue>,
    repos: Repositories,
    leader: Arc<dyn LeaderElection>,
    control: Option<Arc<dyn ExecutionControl>>,
    config: SchedulerConfig,
    /// 串行化作业行的读改写
    job_updates: tokio::sync::Mutex<()>,
}

impl CronScheduler {
    pub fn new(queue: Arc<TaskQueue>, repos: Repositories, config: SchedulerConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            queue,
            repos,
            leader: Arc::new(SingleNodeLeader),
            control: None,
            config,
            job_updates: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_leader_election(mut self, leader: Arc<dyn LeaderElection>) -> Self {
        self.leader = leader;
        self
    }

    pub fn with_execution_control(mut self, control: Arc<dyn ExecutionControl>) -> Self {
        self.control = Some(control);
        self
    }

    fn entries_read(
        &self,
    ) -> SchedulerResult<std::sync::RwLockReadGuard<'_, HashMap<i64, CronEntry>>> {
        self.entries
            .read()
            .map_err(|_| SchedulerError::Internal("调度条目锁已中毒".to_string()))
    }

    fn entries_write(
        &self,
    ) -> SchedulerResult<std::sync::RwLockWriteGuard<'_, HashMap<i64, CronEntry>>> {
        self.entries
            .write()
            .map_err(|_| SchedulerError::Internal("调度条目锁已中毒".to_string()))
    }

    /// 注册作业：立即解析表达式，计算并持久化首次触发时间
    pub async fn add_job(&self, mut job: CronJob) -> SchedulerResult<CronJob> {
        let expression = CronExpression::parse_with_timezone(&job.cron_expr, &job.timezone)?;
        let now = Utc::now();
        let next_run = expression.next_execution_time(now).ok_or_else(|| {
            SchedulerError::invalid_cron(&job.cron_expr, "表达式不会再触发")
        })?;

        job.next_run_at = Some(next_run);
        job.updated_at = now;
        self.repos.cron_jobs.update(&job).await?;

        self.entries_write()?.insert(
            job.id,
            CronEntry {
                job: job.clone(),
                expression,
                next_run,
                prev_run: job.prev_run_at,
            },
        );
        info!(cron_job_id = job.id, name = %job.name, next_run = %next_run, "定时作业已注册");
        Ok(job)
    }

    /// 移除调度条目，历史记录保留
    pub fn remove_job(&self, id: i64) -> SchedulerResult<bool> {
        let removed = self.entries_write()?.remove(&id).is_some();
        if removed {
            info!(cron_job_id = id, "定时作业已移除");
        }
        Ok(removed)
    }

    /// 先移除再注册；禁用的作业只移除
    pub async fn update_job(&self, job: CronJob) -> SchedulerResult<CronJob> {
        CronExpression::parse_with_timezone(&job.cron_expr, &job.timezone)?;
        self.remove_job(job.id)?;
        if !job.enabled {
            return Ok(job);
        }
        self.add_job(job).await
    }

    pub fn contains_job(&self, id: i64) -> bool {
        self.entries_read().map(|e| e.contains_key(&id)).unwrap_or(false)
    }

    pub fn job_count(&self) -> usize {
        self.entries_read().map(|e| e.len()).unwrap_or(0)
    }

    /// 条目当前的下次触发时间
    pub fn next_run(&self, id: i64) -> Option<DateTime<Utc>> {
        self.entries_read().ok()?.get(&id).map(|e| e.next_run)
    }

    /// 条目最近一次计划触发时间
    pub fn prev_run(&self, id: i64) -> Option<DateTime<Utc>> {
        self.entries_read().ok()?.get(&id).and_then(|e| e.prev_run)
    }

    /// 接下来 n 次触发时间，第一项为条目当前的 next_run；不修改调度状态
    pub fn get_next_runs(&self, id: i64, n: usize) -> SchedulerResult<NextRuns> {
        let entries = self.entries_read()?;
        let entry = entries
            .get(&id)
            .ok_or(SchedulerError::CronJobNotFound { id })?;
        Ok(std::iter::once(entry.next_run)
            .chain(entry.expression.upcoming(entry.next_run))
            .take(n))
    }

    /// 启动时从存储加载所有启用的作业，无法解析的作业记录错误后跳过
    pub async fn load_jobs(&self) -> SchedulerResult<usize> {
        let jobs = self
            .repos
            .cron_jobs
            .list(&CronJobFilter {
                enabled: Some(true),
                ..Default::default()
            })
            .await?;

        let mut loaded = 0;
        for job in jobs {
            let id = job.id;
            let name = job.name.clone();
            match self.add_job(job).await {
                Ok(_) => loaded += 1,
                Err(e @ SchedulerError::Store(_)) => return Err(e),
                Err(e) => error!(cron_job_id = id, name = %name, "加载定时作业失败: {e}"),
            }
        }
        info!(loaded, "定时作业加载完成");
        Ok(loaded)
    }

    /// 启动调度时钟，直到 `shutdown` 被取消
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(
                interval_ms = scheduler.config.tick_interval_ms,
                "定时调度时钟已启动"
            );
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        scheduler.tick(Utc::now()).await;
                    }
                }
            }
            info!("定时调度时钟已停止");
        })
    }

    /// 扫描全部条目，对到期的作业各自启动一次触发
    ///
    /// 到期条目的 next_run 在扫描时即推进，触发过程中的下一次扫描不会重复触发。
    pub async fn tick(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Vec<JoinHandle<SchedulerResult<FireOutcome>>> {
        if !self.leader.is_leader().await {
            debug!("非leader节点，跳过定时触发");
            return Vec::new();
        }

        let due = match self.claim_due(now) {
            Ok(due) => due,
            Err(e) => {
                error!("扫描定时作业失败: {e}");
                return Vec::new();
            }
        };

        due.into_iter()
            .map(|fire| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    let job_id = fire.job.id;
                    let result = scheduler
                        .fire(fire.job, fire.scheduled_at, Some(fire.next_run))
                        .await;
                    if let Err(e) = &result {
                        error!(cron_job_id = job_id, "定时作业触发失败: {e}");
                    }
                    result
                })
            })
            .collect()
    }

    fn claim_due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<DueFire>> {
        let mut entries = self.entries_write()?;
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for (id, entry) in entries.iter_mut() {
            if entry.next_run > now {
                continue;
            }
            let scheduled_at = entry.next_run;
            let from = if now > scheduled_at { now } else { scheduled_at };
            let next_run = entry.expression.next_execution_time(from);

            entry.prev_run = Some(scheduled_at);
            match next_run {
                Some(next) => entry.next_run = next,
                None => exhausted.push(*id),
            }
            due.push(DueFire {
                job: entry.job.clone(),
                scheduled_at,
                next_run,
            });
        }

        for id in exhausted {
            warn!(cron_job_id = id, "定时作业不会再触发，移除调度条目");
            entries.remove(&id);
        }
        Ok(due)
    }

    /// 立即触发一次，不影响计划时间
    pub async fn trigger_job(&self, id: i64) -> SchedulerResult<FireOutcome> {
        let job = self.repos.require_cron_job(id).await?;
        info!(cron_job_id = id, name = %job.name, "手动触发定时作业");
        self.fire(job, Utc::now(), None).await
    }

    /// 触发流程：并发策略 -> 审计记录 -> 模板生成任务 -> 入队 -> 更新记录与作业
    ///
    /// `next_run` 为 None 表示手动触发，不推进 prev/next。
    async fn fire(
        &self,
        job: CronJob,
        scheduled_at: DateTime<Utc>,
        next_run: Option<Option<DateTime<Utc>>>,
    ) -> SchedulerResult<FireOutcome> {
        if !self.resolve_policy(&job).await? {
            debug!(cron_job_id = job.id, "仍有在途任务，forbid 策略跳过本次触发");
            counter!("jobcenter_cron_skipped_total").increment(1);
            if let Some(next) = next_run {
                self.advance_schedule(job.id, scheduled_at, next).await?;
            }
            return Ok(FireOutcome::Skipped);
        }

        let mut execution = self
            .repos
            .cron_executions
            .create(&CronExecution::new(job.id, scheduled_at))
            .await?;

        let template = match TaskTemplate::parse(&job.task_template) {
            Ok(t) => t,
            Err(e) => {
                let error = format!("Invalid task template: {e}");
                execution.fail(&error);
                self.repos.cron_executions.update(&execution).await?;
                self.record_run(job.id, scheduled_at, next_run, Some(&error))
                    .await?;
                warn!(cron_job_id = job.id, "任务模板无效: {e}");
                return Ok(FireOutcome::Failed {
                    execution_id: execution.id,
                    error,
                });
            }
        };

        let fired_at = Utc::now();
        let mut task = template.materialize(&job, fired_at);
        task.params
            .insert("cron_execution_id".to_string(), json!(execution.id));

        // 先标记运行中，消费者可能在入队返回前就写入结果
        execution.status = CronExecutionStatus::Running;
        execution.started_at = Some(fired_at);
        self.repos.cron_executions.update(&execution).await?;

        match self.queue.enqueue_task(task).await {
            Ok(created) => {
                if let Some(mut current) =
                    self.repos.cron_executions.get_by_id(execution.id).await?
                {
                    if current.completed_at.is_none() {
                        current.task_id = Some(created.id);
                        self.repos.cron_executions.update(&current).await?;
                    }
                }
                self.record_run(job.id, scheduled_at, next_run, None).await?;

                let event = TaskEvent::new(
                    created.id,
                    event_types::CRON_TRIGGERED,
                    event_sources::CRON,
                    format!("定时作业 {} 触发", job.name),
                )
                .with_data(json!({
                    "cron_job_id": job.id,
                    "execution_id": execution.id,
                    "scheduled": scheduled_at,
                }));
                if let Err(e) = self.repos.events.create(&event).await {
                    error!(task_id = created.id, "写入触发事件失败: {e}");
                }

                counter!("jobcenter_cron_fired_total").increment(1);
                info!(
                    cron_job_id = job.id,
                    task_id = created.id,
                    execution_id = execution.id,
                    "定时作业已触发"
                );
                Ok(FireOutcome::Submitted {
                    execution_id: execution.id,
                    task_id: created.id,
                })
            }
            Err(e @ SchedulerError::Store(_)) => {
                execution.fail(e.to_string());
                if let Err(update_err) = self.repos.cron_executions.update(&execution).await {
                    error!(execution_id = execution.id, "更新触发记录失败: {update_err}");
                }
                Err(e)
            }
            Err(e) => {
                let error = e.to_string();
                execution.fail(&error);
                self.repos.cron_executions.update(&execution).await?;
                self.record_run(job.id, scheduled_at, next_run, Some(&error))
                    .await?;
                warn!(cron_job_id = job.id, "定时任务入队失败: {error}");
                Ok(FireOutcome::Failed {
                    execution_id: execution.id,
                    error,
                })
            }
        }
    }

    /// 按并发策略处理在途任务，返回 false 表示本次触发应跳过
    async fn resolve_policy(&self, job: &CronJob) -> SchedulerResult<bool> {
        if job.concurrency_policy == ConcurrencyPolicy::Allow {
            return Ok(true);
        }

        let active = self
            .repos
            .tasks
            .list(&TaskFilter {
                cron_job_id: Some(job.id),
                statuses: Some(vec![
                    TaskStatus::Queued,
                    TaskStatus::Running,
                    TaskStatus::Retrying,
                ]),
                ..Default::default()
            })
            .await?;

        if active.is_empty() {
            return Ok(true);
        }
        if job.concurrency_policy == ConcurrencyPolicy::Forbid {
            return Ok(false);
        }

        for task in active {
            if task.status == TaskStatus::Running {
                self.cancel_running(task.id, job).await?;
            } else {
                self.queue
                    .cancel_pending(task.id, "被新一次定时触发替换")
                    .await?;
            }
        }
        Ok(true)
    }

    async fn cancel_running(&self, task_id: i64, job: &CronJob) -> SchedulerResult<()> {
        if let Some(control) = &self.control {
            control.cancel_task_executions(task_id).await?;
        }

        let mut task = self.repos.require_task(task_id).await?;
        if task.transition_to(TaskStatus::Canceled).is_ok() {
            task.error_message = Some("被新一次定时触发替换".to_string());
            self.repos.tasks.update(&task).await?;
            let event = TaskEvent::new(
                task_id,
                event_types::CANCELED,
                event_sources::CRON,
                format!("定时作业 {} 的 replace 策略取消了在途任务", job.name),
            );
            if let Err(e) = self.repos.events.create(&event).await {
                error!(task_id, "写入取消事件失败: {e}");
            }
        }

        if let Some(control) = &self.control {
            let wait = self.config.replace_wait();
            if !control.wait_task_stopped(task_id, wait).await {
                warn!(
                    task_id,
                    wait_ms = wait.as_millis() as u64,
                    "被替换的任务未在等待时间内退出"
                );
            }
        }
        info!(cron_job_id = job.id, task_id, "replace 策略已取消在途任务");
        Ok(())
    }

    /// 更新作业的运行计数与时间戳
    async fn record_run(
        &self,
        job_id: i64,
        scheduled_at: DateTime<Utc>,
        next_run: Option<Option<DateTime<Utc>>>,
        error: Option<&str>,
    ) -> SchedulerResult<()> {
        let _guard = self.job_updates.lock().await;
        let Some(mut job) = self.repos.cron_jobs.get_by_id(job_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        job.run_count += 1;
        job.last_run_at = Some(now);
        if let Some(error) = error {
            job.fail_count += 1;
            job.last_error = Some(error.to_string());
        }
        if let Some(next) = next_run {
            job.prev_run_at = Some(scheduled_at);
            job.next_run_at = next;
        }
        job.updated_at = now;
        self.repos.cron_jobs.update(&job).await
    }

    async fn advance_schedule(
        &self,
        job_id: i64,
        scheduled_at: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        let _guard = self.job_updates.lock().await;
        let Some(mut job) = self.repos.cron_jobs.get_by_id(job_id).await? else {
            return Ok(());
        };
        job.prev_run_at = Some(scheduled_at);
        job.next_run_at = next;
        job.updated_at = Utc::now();
        self.repos.cron_jobs.update(&job).await
    }
}

#[async_trait]
impl CronOutcomeRecorder for CronScheduler {
    async fn record_outcome(
        &self,
        job_id: i64,
        succeeded: bool,
        error: Option<&str>,
    ) -> SchedulerResult<()> {
        let _guard = self.job_updates.lock().await;
        let Some(mut job) = self.repos.cron_jobs.get_by_id(job_id).await? else {
            return Ok(());
        };
        if succeeded {
            job.success_count += 1;
        } else {
            job.fail_count += 1;
            job.last_error = error.map(str::to_string);
        }
        job.updated_at = Utc::now();
        self.repos.cron_jobs.update(&job).await
    }
}
