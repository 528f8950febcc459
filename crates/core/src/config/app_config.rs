use std::collections::HashSet;
use std::path::Path;

use anyhow::{ensure, Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::sections::{
    BatchConfig, ExecutorConfig, IdempotencyConfig, ObservabilityConfig, RetryConfig,
    SchedulerConfig, WorkerConfig,
};
use crate::models::QueueConfig;

const DEFAULT_PATHS: [&str; 3] = [
    "config/jobcenter.toml",
    "jobcenter.toml",
    "/etc/jobcenter/config.toml",
];

/// 作业中心配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub queues: Vec<QueueConfig>,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub idempotency: IdempotencyConfig,
    pub batch: BatchConfig,
    pub executor: ExecutorConfig,
    pub observability: ObservabilityConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            queues: QueueConfig::builtin(),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
            idempotency: IdempotencyConfig::default(),
            batch: BatchConfig::default(),
            executor: ExecutorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: JOBCENTER__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        // 缺省字段由 serde(default) 补齐
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                ensure!(Path::new(path).exists(), "配置文件不存在: {}", path);
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                if let Some(path) = DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("JOBCENTER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.retry.validate().context("重试配置验证失败")?;
        self.idempotency.validate().context("幂等配置验证失败")?;
        self.batch.validate().context("批量执行配置验证失败")?;
        self.executor.validate().context("执行器配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        let mut names = HashSet::new();
        for queue in &self.queues {
            ensure!(!queue.name.trim().is_empty(), "队列名称不能为空");
            ensure!(names.insert(queue.name.as_str()), "重复的队列名称: {}", queue.name);
            ensure!(queue.max_pending > 0, "队列 {} 的 max_pending 必须大于0", queue.name);
            ensure!(queue.max_workers > 0, "队列 {} 的 max_workers 必须大于0", queue.name);
        }
        Ok(())
    }
}
