//! 作业中心配置
//!
//! 加载顺序：内置默认值 -> TOML 配置文件 -> `JOBCENTER__` 前缀的环境变量。

pub mod app_config;
pub mod sections;

pub use app_config::AppConfig;
pub use sections::{
    BatchConfig, ExecutorConfig, IdempotencyConfig, ObservabilityConfig, RetryConfig,
    SchedulerConfig, WorkerConfig,
};
