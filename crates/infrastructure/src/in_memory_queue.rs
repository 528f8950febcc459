use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jobcenter_core::{QueueBackend, QueueItem, SchedulerError, SchedulerResult};
use metrics::gauge;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 堆元素：优先级高者在前，同优先级按入队序号先进先出
#[derive(Debug)]
struct HeapEntry(QueueItem);

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

/// 按 (优先级降序, 入队序号升序) 排序的二叉堆
#[derive(Debug, Default)]
pub struct PriorityHeap {
    heap: BinaryHeap<HeapEntry>,
    next_sequence: u64,
}

impl PriorityHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 放入条目并分配入队序号
    pub fn push(&mut self, mut item: QueueItem) {
        item.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(HeapEntry(item));
    }

    pub fn pop(&mut self) -> Option<QueueItem> {
        self.heap.pop().map(|e| e.0)
    }

    pub fn peek(&self) -> Option<&QueueItem> {
        self.heap.peek().map(|e| &e.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn remove_task(&mut self, task_id: i64) -> bool {
        let before = self.heap.len();
        self.heap.retain(|e| e.0.task_id != task_id);
        self.heap.len() != before
    }

    fn drain(&mut self) -> Vec<QueueItem> {
        let mut items = Vec::with_capacity(self.heap.len());
        while let Some(item) = self.pop() {
            items.push(item);
        }
        items
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: PriorityHeap,
    /// 已出队但尚未 ack/nack 的条目
    in_flight: HashMap<i64, QueueItem>,
}

#[derive(Debug, Default)]
struct NamedQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl NamedQueue {
    fn lock(&self) -> SchedulerResult<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Internal("队列锁已中毒".to_string()))
    }

    fn try_pop(&self) -> SchedulerResult<Option<QueueItem>> {
        let mut state = self.lock()?;
        let item = state.heap.pop();
        if let Some(item) = &item {
            state.in_flight.insert(item.task_id, item.clone());
        }
        Ok(item)
    }
}

/// 进程内优先级队列后端
///
/// 每个命名队列拥有独立的互斥锁与唤醒信号，消费者阻塞等待不会影响生产者。
#[derive(Debug, Default)]
pub struct MemoryQueueBackend {
    queues: RwLock<HashMap<String, Arc<NamedQueue>>>,
}

impl MemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, name: &str) -> SchedulerResult<Arc<NamedQueue>> {
        if let Some(q) = self
            .queues
            .read()
            .map_err(|_| SchedulerError::Internal("队列表锁已中毒".to_string()))?
            .get(name)
        {
            return Ok(q.clone());
        }

        let mut queues = self
            .queues
            .write()
            .map_err(|_| SchedulerError::Internal("队列表锁已中毒".to_string()))?;
        Ok(queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = name, "创建内存队列");
                Arc::new(NamedQueue::default())
            })
            .clone())
    }

    fn report_depth(name: &str, depth: usize) {
        gauge!("jobcenter_queue_pending", "queue" => name.to_string()).set(depth as f64);
    }
}

#[async_trait]
impl QueueBackend for MemoryQueueBackend {
    async fn push(&self, item: QueueItem) -> SchedulerResult<()> {
        let queue = self.queue(&item.queue_name)?;
        let name = item.queue_name.clone();
        let depth = {
            let mut state = queue.lock()?;
            state.heap.push(item);
            state.heap.len()
        };
        Self::report_depth(&name, depth);
        queue.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, queue_name: &str, timeout: Duration) -> SchedulerResult<QueueItem> {
        let queue = self.queue(queue_name)?;
        let deadline = Instant::now() + timeout;

        loop {
            // 先登记等待再检查堆，避免检查与等待之间丢失唤醒
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = queue.try_pop()? {
                let remaining = queue.lock()?.heap.len();
                if remaining > 0 {
                    queue.notify.notify_one();
                }
                Self::report_depth(queue_name, remaining);
                return Ok(item);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return match queue.try_pop()? {
                    Some(item) => Ok(item),
                    None => Err(SchedulerError::DequeueTimeout {
                        queue: queue_name.to_string(),
                    }),
                };
            }
        }
    }

    async fn peek(&self, queue_name: &str) -> Option<QueueItem> {
        let queue = self.queue(queue_name).ok()?;
        let state = queue.lock().ok()?;
        state.heap.peek().cloned()
    }

    async fn ack(&self, queue_name: &str, task_id: i64) -> SchedulerResult<()> {
        let queue = self.queue(queue_name)?;
        if queue.lock()?.in_flight.remove(&task_id).is_none() {
            debug!(queue = queue_name, task_id, "ack 的任务不在途");
        }
        Ok(())
    }

    async fn nack(&self, queue_name: &str, task_id: i64, reason: &str) -> SchedulerResult<()> {
        let queue = self.queue(queue_name)?;
        if queue.lock()?.in_flight.remove(&task_id).is_none() {
            debug!(queue = queue_name, task_id, "nack 的任务不在途");
        }
        warn!(queue = queue_name, task_id, reason, "任务被 nack");
        Ok(())
    }

    async fn remove(&self, queue_name: &str, task_id: i64) -> bool {
        let Ok(queue) = self.queue(queue_name) else {
            return false;
        };
        let Ok(mut state) = queue.lock() else {
            return false;
        };
        state.heap.remove_task(task_id)
    }

    async fn size(&self, queue_name: &str) -> usize {
        self.queue(queue_name)
            .ok()
            .and_then(|q| q.lock().ok().map(|s| s.heap.len()))
            .unwrap_or(0)
    }

    async fn in_flight(&self, queue_name: &str) -> usize {
        self.queue(queue_name)
            .ok()
            .and_then(|q| q.lock().ok().map(|s| s.in_flight.len()))
            .unwrap_or(0)
    }

    async fn clear(&self, queue_name: &str) -> Vec<QueueItem> {
        let Ok(queue) = self.queue(queue_name) else {
            return Vec::new();
        };
        let drained = match queue.lock() {
            Ok(mut state) => state.heap.drain(),
            Err(_) => Vec::new(),
        };
        Self::report_depth(queue_name, 0);
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(task_id: i64, priority: i32) -> QueueItem {
        QueueItem::new(task_id, "default", priority)
    }

    #[test]
    fn test_heap_order() {
        let mut heap = PriorityHeap::new();
        heap.push(item(1, 5));
        heap.push(item(2, 1));
        heap.push(item(3, 10));
        heap.push(item(4, 5));

        let order: Vec<i64> = std::iter::from_fn(|| heap.pop()).map(|i| i.task_id).collect();
        assert_eq!(order, vec![3, 1, 4, 2]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_heap_peek_and_remove() {
        let mut heap = PriorityHeap::new();
        heap.push(item(1, 1));
        heap.push(item(2, 9));
        assert_eq!(heap.peek().map(|i| i.task_id), Some(2));
        assert!(heap.remove_task(2));
        assert!(!heap.remove_task(2));
        assert_eq!(heap.peek().map(|i| i.task_id), Some(1));
        assert_eq!(heap.len(), 1);
    }

    #[tokio::test]
    async fn test_priority_dequeue_order() {
        let backend = MemoryQueueBackend::new();
        for (id, p) in [(1, 5), (2, 1), (3, 10), (4, 5)] {
            backend.push(item(id, p)).await.unwrap();
        }
        let mut order = Vec::new();
        for _ in 0..4 {
            let got = backend.pop("default", Duration::from_millis(10)).await.unwrap();
            order.push((got.task_id, got.priority));
        }
        assert_eq!(order, vec![(3, 10), (1, 5), (4, 5), (2, 1)]);
    }

    #[tokio::test]
    async fn test_pop_timeout() {
        let backend = MemoryQueueBackend::new();
        let timeout = Duration::from_millis(100);
        let start = std::time::Instant::now();
        let err = backend.pop("empty", timeout).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SchedulerError::DequeueTimeout { ref queue } if queue == "empty"));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_blocked_consumer_woken_by_push() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let consumer = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.pop("default", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.push(item(42, 5)).await.unwrap();

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.task_id, 42);
        assert_eq!(backend.in_flight("default").await, 1);
        backend.ack("default", 42).await.unwrap();
        assert_eq!(backend.in_flight("default").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exclusive_delivery() {
        let backend = Arc::new(MemoryQueueBackend::new());
        let mut consumers = Vec::new();
        for _ in 0..8 {
            let backend = backend.clone();
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Ok(item) = backend.pop("shared", Duration::from_millis(200)).await {
                    got.push(item.task_id);
                }
                got
            }));
        }

        for id in 0..200 {
            backend.push(QueueItem::new(id, "shared", 5)).await.unwrap();
        }

        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_nack_does_not_requeue() {
        let backend = MemoryQueueBackend::new();
        backend.push(item(1, 5)).await.unwrap();
        let got = backend.pop("default", Duration::from_millis(10)).await.unwrap();
        backend.nack("default", got.task_id, "boom").await.unwrap();
        assert_eq!(backend.size("default").await, 0);
        assert_eq!(backend.in_flight("default").await, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let backend = MemoryQueueBackend::new();
        backend.push(item(1, 5)).await.unwrap();
        backend.push(item(2, 5)).await.unwrap();
        let drained = backend.clear("default").await;
        assert_eq!(drained.len(), 2);
        assert_eq!(backend.size("default").await, 0);
    }
}
