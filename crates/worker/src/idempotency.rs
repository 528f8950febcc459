//! 幂等保护：同一个键在有效期内最多执行一次

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobcenter_core::{
    config::IdempotencyConfig, QueueItem, SchedulerError, SchedulerResult, TaskResult,
    TaskStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::executor::ItemExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    /// 运行中的记录携带 status 为 running 的占位结果
    pub result: TaskResult,
    pub expires_at: DateTime<Utc>,
    pub executed_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

enum Claim {
    Done(TaskResult),
    Wait,
    Owned,
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct IdempotencyGuard {
    executor: Arc<dyn ItemExecutor>,
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    config: IdempotencyConfig,
}

impl IdempotencyGuard {
    pub fn new(executor: Arc<dyn ItemExecutor>, config: IdempotencyConfig) -> Self {
        Self {
            executor,
            records: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn records(
        &self,
    ) -> SchedulerResult<std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>>> {
        self.records
            .lock()
            .map_err(|_| SchedulerError::Internal("幂等记录锁已中毒".to_string()))
    }

    /// 仅返回未过期的记录，与任务是否结束无关
    pub fn check(&self, key: &str) -> Option<IdempotencyRecord> {
        let records = self.records().ok()?;
        records
            .get(key)
            .filter(|r| r.is_live(Utc::now()))
            .cloned()
    }

    fn claim(&self, key: &str, ttl: Duration) -> SchedulerResult<Claim> {
        let mut records = self.records()?;
        let now = Utc::now();
        match records.get(key).filter(|r| r.is_live(now)) {
            Some(record) if record.status == IdempotencyStatus::Completed => {
                Ok(Claim::Done(record.result.clone()))
            }
            Some(_) => Ok(Claim::Wait),
            None => {
                // 任务标识在持有者准备好执行项后补齐
                let mut placeholder = TaskResult::failed(0, "", String::new());
                placeholder.status = TaskStatus::Running;
                placeholder.error_message = None;
                records.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        status: IdempotencyStatus::Running,
                        result: placeholder,
                        expires_at: expiry(now, ttl),
                        executed_at: now,
                    },
                );
                Ok(Claim::Owned)
            }
        }
    }

    /// 同一个键的并发调用只有一个真正执行，其余调用轮询等待并得到相同结果
    ///
    /// 轮询次数用尽时返回仍处于运行中的记录结果。执行器返回错误时删除记录，
    /// 后续调用可以重新执行。
    pub async fn execute_with_idempotent(
        &self,
        key: &str,
        item: &QueueItem,
        ttl: Duration,
    ) -> SchedulerResult<TaskResult> {
        self.execute_prepared(key, ttl, || async move { Ok(item.clone()) })
            .await
    }

    /// 与 [`execute_with_idempotent`](Self::execute_with_idempotent) 相同，
    /// 但执行项只在取得执行权后才由 `prepare` 生成，命中记录或等待他人结果的调用不会调用它
    pub async fn execute_prepared<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        prepare: F,
    ) -> SchedulerResult<TaskResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SchedulerResult<QueueItem>>,
    {
        loop {
            match self.claim(key, ttl)? {
                Claim::Done(result) => {
                    debug!(key, "命中幂等记录，直接返回结果");
                    return Ok(result);
                }
                Claim::Owned => {
                    let item = match prepare().await {
                        Ok(item) => item,
                        Err(e) => {
                            self.records()?.remove(key);
                            return Err(e);
                        }
                    };
                    if let Some(record) = self.records()?.get_mut(key) {
                        record.result.task_id = item.task_id;
                        record.result.execution_id = item.execution_id.clone();
                    }
                    return self.run_owned(key, &item, ttl).await;
                }
                Claim::Wait => {
                    if let Some(result) = self.wait_for(key).await {
                        return Ok(result);
                    }
                    // 记录已被删除，重新竞争执行权
                }
            }
        }
    }

    async fn run_owned(
        &self,
        key: &str,
        item: &QueueItem,
        ttl: Duration,
    ) -> SchedulerResult<TaskResult> {
        match self.executor.execute(item).await {
            Ok(result) => {
                let now = Utc::now();
                self.records()?.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        status: IdempotencyStatus::Completed,
                        result: result.clone(),
                        expires_at: expiry(now, ttl),
                        executed_at: now,
                    },
                );
                Ok(result)
            }
            Err(e) => {
                self.records()?.remove(key);
                Err(e)
            }
        }
    }

    /// 返回 None 表示记录在等待期间被删除
    async fn wait_for(&self, key: &str) -> Option<TaskResult> {
        let mut last = None;
        for _ in 0..self.config.max_poll_attempts {
            tokio::time::sleep(self.config.poll_interval()).await;
            match self.check(key) {
                Some(record) if record.status == IdempotencyStatus::Completed => {
                    return Some(record.result);
                }
                Some(record) => last = Some(record.result),
                None => return None,
            }
        }
        warn!(
            key,
            attempts = self.config.max_poll_attempts,
            "等待幂等结果超过上限，返回运行中的记录"
        );
        last
    }

    /// 清理过期记录，返回清理数量
    pub fn cleanup(&self) -> usize {
        let Ok(mut records) = self.records() else {
            return 0;
        };
        let now = Utc::now();
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        before - records.len()
    }

    pub fn len(&self) -> usize {
        self.records().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 周期清理，直到 `shutdown` 被取消
    pub fn start_cleanup(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = guard.cleanup();
                        if removed > 0 {
                            info!(removed, "已清理过期幂等记录");
                        }
                    }
                }
            }
        })
    }
}
