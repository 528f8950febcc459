//! 进程内记录存储
//!
//! 供单机部署与测试使用，所有实体保存在按ID排序的表中。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jobcenter_core::{
    CronExecution, CronExecutionFilter, CronExecutionRepository, CronJob, CronJobFilter,
    CronJobRepository, Repositories, SchedulerError, SchedulerResult, Task, TaskBatch,
    TaskBatchRepository, TaskEvent, TaskEventFilter, TaskEventRepository, TaskFilter,
    TaskRepository,
};

trait Record: Clone + Send + 'static {
    fn id(&self) -> i64;
    fn assign_id(&mut self, id: i64);
}

macro_rules! impl_record {
    ($($ty:ty),*) => {
        $(impl Record for $ty {
            fn id(&self) -> i64 {
                self.id
            }
            fn assign_id(&mut self, id: i64) {
                self.id = id;
            }
        })*
    };
}

impl_record!(Task, CronJob, CronExecution, TaskEvent, TaskBatch);

struct Table<T: Record> {
    name: &'static str,
    rows: Mutex<BTreeMap<i64, T>>,
    next_id: AtomicI64,
    unavailable: Arc<AtomicBool>,
}

impl<T: Record> Table<T> {
    fn new(name: &'static str, unavailable: Arc<AtomicBool>) -> Self {
        Self {
            name,
            rows: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            unavailable,
        }
    }

    fn rows(&self) -> SchedulerResult<std::sync::MutexGuard<'_, BTreeMap<i64, T>>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SchedulerError::store(format!("{} 存储不可用", self.name)));
        }
        self.rows
            .lock()
            .map_err(|_| SchedulerError::store(format!("{} 表锁已中毒", self.name)))
    }

    fn insert(&self, record: &T) -> SchedulerResult<T> {
        let mut rows = self.rows()?;
        let mut record = record.clone();
        record.assign_id(self.next_id.fetch_add(1, Ordering::SeqCst));
        rows.insert(record.id(), record.clone());
        Ok(record)
    }

    fn get(&self, id: i64) -> SchedulerResult<Option<T>> {
        Ok(self.rows()?.get(&id).cloned())
    }

    fn replace(&self, record: &T) -> SchedulerResult<()> {
        let mut rows = self.rows()?;
        match rows.get_mut(&record.id()) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(SchedulerError::store(format!(
                "{} 记录不存在: {}",
                self.name,
                record.id()
            ))),
        }
    }

    fn remove(&self, id: i64) -> SchedulerResult<()> {
        self.rows()?.remove(&id);
        Ok(())
    }

    fn select<F: Fn(&T) -> bool>(&self, pred: F) -> SchedulerResult<Vec<T>> {
        Ok(self.rows()?.values().filter(|r| pred(r)).cloned().collect())
    }
}

fn paginate<T>(rows: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    rows.into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

pub struct MemoryTaskRepository(Table<Task>);

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        self.0.insert(task)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<Task>> {
        self.0.get(id)
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let rows = self.0.select(|t| filter.matches(t))?;
        Ok(paginate(rows, filter.offset, filter.limit))
    }

    async fn update(&self, task: &Task) -> SchedulerResult<()> {
        self.0.replace(task)
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.0.remove(id)
    }

    async fn count(&self, filter: &TaskFilter) -> SchedulerResult<usize> {
        Ok(self.0.rows()?.values().filter(|t| filter.matches(t)).count())
    }
}

pub struct MemoryCronJobRepository(Table<CronJob>);

#[async_trait]
impl CronJobRepository for MemoryCronJobRepository {
    async fn create(&self, job: &CronJob) -> SchedulerResult<CronJob> {
        self.0.insert(job)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<CronJob>> {
        self.0.get(id)
    }

    async fn list(&self, filter: &CronJobFilter) -> SchedulerResult<Vec<CronJob>> {
        let rows = self.0.select(|j| filter.matches(j))?;
        Ok(paginate(rows, None, filter.limit))
    }

    async fn update(&self, job: &CronJob) -> SchedulerResult<()> {
        self.0.replace(job)
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.0.remove(id)
    }
}

pub struct MemoryCronExecutionRepository(Table<CronExecution>);

#[async_trait]
impl CronExecutionRepository for MemoryCronExecutionRepository {
    async fn create(&self, execution: &CronExecution) -> SchedulerResult<CronExecution> {
        self.0.insert(execution)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<CronExecution>> {
        self.0.get(id)
    }

    async fn list(&self, filter: &CronExecutionFilter) -> SchedulerResult<Vec<CronExecution>> {
        let mut rows = self.0.select(|e| {
            filter.cron_job_id.map_or(true, |id| id == e.cron_job_id)
                && filter.task_id.map_or(true, |id| Some(id) == e.task_id)
        })?;
        rows.reverse();
        Ok(paginate(rows, None, filter.limit))
    }

    async fn update(&self, execution: &CronExecution) -> SchedulerResult<()> {
        self.0.replace(execution)
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.0.remove(id)
    }
}

pub struct MemoryTaskEventRepository(Table<TaskEvent>);

#[async_trait]
impl TaskEventRepository for MemoryTaskEventRepository {
    async fn create(&self, event: &TaskEvent) -> SchedulerResult<TaskEvent> {
        self.0.insert(event)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<TaskEvent>> {
        self.0.get(id)
    }

    async fn list(&self, filter: &TaskEventFilter) -> SchedulerResult<Vec<TaskEvent>> {
        let rows = self.0.select(|e| {
            filter.task_id.map_or(true, |id| id == e.task_id)
                && filter
                    .event_type
                    .as_ref()
                    .map_or(true, |t| *t == e.event_type)
        })?;
        Ok(paginate(rows, None, filter.limit))
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.0.remove(id)
    }
}

pub struct MemoryTaskBatchRepository(Table<TaskBatch>);

#[async_trait]
impl TaskBatchRepository for MemoryTaskBatchRepository {
    async fn create(&self, batch: &TaskBatch) -> SchedulerResult<TaskBatch> {
        self.0.insert(batch)
    }

    async fn get_by_id(&self, id: i64) -> SchedulerResult<Option<TaskBatch>> {
        self.0.get(id)
    }

    async fn list(&self) -> SchedulerResult<Vec<TaskBatch>> {
        self.0.select(|_| true)
    }

    async fn update(&self, batch: &TaskBatch) -> SchedulerResult<()> {
        self.0.replace(batch)
    }

    async fn delete(&self, id: i64) -> SchedulerResult<()> {
        self.0.remove(id)
    }
}

/// 内存存储，持有全部实体表
///
/// `set_unavailable(true)` 让后续读写全部返回存储错误，用于验证错误传播。
#[derive(Clone)]
pub struct MemoryStore {
    unavailable: Arc<AtomicBool>,
    repositories: Repositories,
}

impl MemoryStore {
    pub fn new() -> Self {
        let unavailable = Arc::new(AtomicBool::new(false));
        let repositories = Repositories {
            tasks: Arc::new(MemoryTaskRepository(Table::new("tasks", unavailable.clone()))),
            cron_jobs: Arc::new(MemoryCronJobRepository(Table::new(
                "cron_jobs",
                unavailable.clone(),
            ))),
            cron_executions: Arc::new(MemoryCronExecutionRepository(Table::new(
                "cron_executions",
                unavailable.clone(),
            ))),
            events: Arc::new(MemoryTaskEventRepository(Table::new(
                "task_events",
                unavailable.clone(),
            ))),
            batches: Arc::new(MemoryTaskBatchRepository(Table::new(
                "task_batches",
                unavailable.clone(),
            ))),
        };
        Self {
            unavailable,
            repositories,
        }
    }

    pub fn repositories(&self) -> Repositories {
        self.repositories.clone()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
