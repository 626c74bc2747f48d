use crate::config::ServiceConfig;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// 初始化日志：同时输出到 stdout 和共享日志文件（追加写入）
///
/// 日志文件也是跟踪模式下推送给客户端的数据源。`RUST_LOG` 优先于配置的级别。
pub fn init(config: &ServiceConfig) -> Result<()> {
    std::fs::create_dir_all(&config.log.directory)
        .with_context(|| format!("创建日志目录 {} 失败", config.log.directory.display()))?;
    let path = config.log_path();
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("打开日志文件 {} 失败", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "expo_build_service={level},tower_http={level}",
            level = config.log.level
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .try_init()
        .context("初始化日志失败")?;

    Ok(())
}
