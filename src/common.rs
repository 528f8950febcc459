use std::time::Duration;

use anyhow::{Context, Result};
use jobcenter_core::config::AppConfig;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::job_center::JobCenter;

/// 命令行覆盖项，未指定时沿用配置文件
#[derive(Debug, Clone, Default)]
pub struct StartupOptions {
    pub config_path: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub shutdown_timeout: Duration,
}

/// 初始化日志系统，RUST_LOG 优先于配置的级别
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

/// 加载配置并应用命令行覆盖
pub fn load_config(options: &StartupOptions) -> Result<AppConfig> {
    let mut config = AppConfig::load(options.config_path.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            options.config_path.as_deref().unwrap_or("<默认路径>")
        )
    })?;

    if let Some(level) = &options.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &options.log_format {
        config.observability.log_format = format.clone();
    }
    config.validate()?;
    Ok(config)
}

/// 启动作业中心，等待关闭信号后在超时内停止
pub async fn run_until_shutdown(center: JobCenter, shutdown_timeout: Duration) -> Result<()> {
    center.start().await.context("启动作业中心失败")?;

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");

    match tokio::time::timeout(shutdown_timeout, center.stop()).await {
        Ok(()) => info!("作业中心已优雅关闭"),
        Err(_) => warn!("作业中心关闭超时，强制退出"),
    }
    Ok(())
}

/// 等待关闭信号；信号处理器安装失败时只等待另一路
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_applies_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobcenter.toml");
        std::fs::write(
            &path,
            r#"
[observability]
log_level = "debug"
log_format = "pretty"
"#,
        )
        .unwrap();

        let options = StartupOptions {
            config_path: Some(path.to_string_lossy().into_owned()),
            log_format: Some("json".to_string()),
            ..Default::default()
        };
        let config = load_config(&options).unwrap();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.observability.log_format, "json");
    }

    #[test]
    fn test_load_config_rejects_bad_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobcenter.toml");
        std::fs::write(&path, "").unwrap();

        let options = StartupOptions {
            config_path: Some(path.to_string_lossy().into_owned()),
            log_format: Some("xml".to_string()),
            ..Default::default()
        };
        assert!(load_config(&options).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let options = StartupOptions {
            config_path: Some("/nonexistent/jobcenter.toml".to_string()),
            ..Default::default()
        };
        assert!(load_config(&options).is_err());
    }
}
