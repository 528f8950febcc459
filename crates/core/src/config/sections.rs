use std::time::Duration;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// 定时调度配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_ms: u64,
    /// replace 策略等待旧执行退出的最长时间
    pub replace_wait_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_ms: 1000,
            replace_wait_seconds: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn replace_wait(&self) -> Duration {
        Duration::from_secs(self.replace_wait_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.tick_interval_ms > 0, "tick_interval_ms 必须大于0");
        Ok(())
    }
}

/// 队列消费者配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub dequeue_timeout_seconds: u64,
    pub error_backoff_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dequeue_timeout_seconds: 5,
            error_backoff_ms: 1000,
        }
    }
}

impl WorkerConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.dequeue_timeout_seconds > 0,
            "dequeue_timeout_seconds 必须大于0"
        );
        Ok(())
    }
}

/// 重试处理器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_interval_ms: u64,
    pub retry_on_timeout: bool,
    pub retry_on_failure: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval_ms: 5000,
            retry_on_timeout: true,
            retry_on_failure: true,
        }
    }
}

impl RetryConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_retries <= 100, "max_retries 不能超过100");
        Ok(())
    }
}

/// 幂等保护配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdempotencyConfig {
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub default_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_attempts: 60,
            default_ttl_seconds: 3600,
            cleanup_interval_seconds: 60,
        }
    }
}

impl IdempotencyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.poll_interval_ms > 0, "poll_interval_ms 必须大于0");
        ensure!(self.max_poll_attempts > 0, "max_poll_attempts 必须大于0");
        ensure!(
            self.cleanup_interval_seconds > 0,
            "cleanup_interval_seconds 必须大于0"
        );
        Ok(())
    }
}

/// 批量执行配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            interval_ms: 0,
        }
    }
}

impl BatchConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size 必须大于0");
        Ok(())
    }
}

/// 各执行方式使用的外部程序
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub shell: String,
    pub ssh_program: String,
    pub docker_program: String,
    pub kubectl_program: String,
    pub script_interpreter: String,
    pub http_timeout_seconds: u64,
    /// 保留的已结束执行记录数，用于区分已结束与未知的执行ID
    pub finished_history: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            ssh_program: "ssh".to_string(),
            docker_program: "docker".to_string(),
            kubectl_program: "kubectl".to_string(),
            script_interpreter: "sh".to_string(),
            http_timeout_seconds: 60,
            finished_history: 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.shell.trim().is_empty(), "shell 不能为空");
        ensure!(
            !self.script_interpreter.trim().is_empty(),
            "script_interpreter 不能为空"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            ["trace", "debug", "info", "warn", "error"].contains(&self.log_level.as_str()),
            "不支持的日志级别: {}",
            self.log_level
        );
        ensure!(
            ["pretty", "json"].contains(&self.log_format.as_str()),
            "不支持的日志格式: {}",
            self.log_format
        );
        Ok(())
    }
}
