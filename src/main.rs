use std::time::Duration;

use anyhow::Result;
use clap::{Arg, Command};
use jobcenter::common::{init_logging, load_config, run_until_shutdown, StartupOptions};
use jobcenter::JobCenter;
use jobcenter_infrastructure::MemoryStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("jobcenter")
        .version("1.0.0")
        .about("运维自动化作业中心")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时按默认路径查找"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("shutdown-timeout")
                .long("shutdown-timeout")
                .value_name("SECONDS")
                .help("优雅关闭等待时间")
                .value_parser(clap::value_parser!(u64))
                .default_value("30"),
        )
        .get_matches();

    let options = StartupOptions {
        config_path: matches.get_one::<String>("config").cloned(),
        log_level: matches.get_one::<String>("log-level").cloned(),
        log_format: matches.get_one::<String>("log-format").cloned(),
        shutdown_timeout: Duration::from_secs(
            matches
                .get_one::<u64>("shutdown-timeout")
                .copied()
                .unwrap_or(30),
        ),
    };

    let config = load_config(&options)?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    info!("启动运维自动化作业中心");
    info!(
        queues = config.queues.len(),
        scheduler = config.scheduler.enabled,
        worker = config.worker.enabled,
        "配置加载完成"
    );

    let store = MemoryStore::new();
    let center = JobCenter::new(config, store.repositories());

    run_until_shutdown(center, options.shutdown_timeout).await?;

    info!("运维自动化作业中心已退出");
    Ok(())
}
