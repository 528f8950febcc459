pub mod batch;
pub mod executor;
pub mod executors;
pub mod idempotency;
pub mod pool;
pub mod retry;

pub use batch::BatchExecutor;
pub use executor::{render_placeholders, ExecutionSnapshot, ItemExecutor, TaskExecutor};
pub use executors::{
    CommandRunner, CommandSpec, ExecutionContext, HandlerOutcome, HandlerRegistry, HttpHandler,
    ProcessRunner, TaskHandler,
};
pub use idempotency::{IdempotencyGuard, IdempotencyRecord, IdempotencyStatus};
pub use pool::{WorkerPool, WorkerPoolStats};
pub use retry::RetryHandler;
