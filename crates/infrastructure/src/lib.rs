pub mod in_memory_queue;
pub mod memory_store;
pub mod task_queue;

pub use in_memory_queue::{MemoryQueueBackend, PriorityHeap};
pub use memory_store::MemoryStore;
pub use task_queue::{BatchEnqueueError, BatchEnqueueOutcome, TaskQueue};
