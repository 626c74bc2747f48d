//! 服务自更新
//!
//! 同一时刻最多运行一个更新脚本。脚本在后台任务中执行，不阻塞触发它的请求，
//! 也不受服务关闭信号影响（脚本本身通常会重启服务）。

use crate::config::UpdateConfig;
use crate::process::{self, CommandSpec, RunContext};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 超时后进程组终止与回收所需的额外时间
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("已有更新正在执行")]
    InProgress,
}

impl IntoResponse for UpdateError {
    fn into_response(self) -> Response {
        match self {
            UpdateError::InProgress => (StatusCode::CONFLICT, "Update already in progress").into_response(),
        }
    }
}

pub struct UpdateCoordinator {
    in_progress: Arc<Mutex<bool>>,
    /// 最近一次更新任务，新任务启动时替换
    task: Mutex<Option<JoinHandle<()>>>,
    script: PathBuf,
    interpreter: Option<String>,
    timeout: Duration,
}

/// 持有期间占用更新标志，释放时清除
pub struct UpdateGuard {
    in_progress: Arc<Mutex<bool>>,
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        *self.in_progress.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

impl UpdateCoordinator {
    pub fn new(config: &UpdateConfig) -> Self {
        Self {
            in_progress: Arc::new(Mutex::new(false)),
            task: Mutex::new(None),
            script: config.script_path.clone(),
            interpreter: config.interpreter.clone().filter(|s| !s.trim().is_empty()),
            timeout: config.timeout(),
        }
    }

    /// 检查并设置标志在同一把锁内完成
    pub fn try_acquire(&self) -> Option<UpdateGuard> {
        let mut running = self.in_progress.lock().unwrap_or_else(|e| e.into_inner());
        if *running {
            return None;
        }
        *running = true;
        Some(UpdateGuard {
            in_progress: self.in_progress.clone(),
        })
    }

    pub fn is_running(&self) -> bool {
        *self.in_progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动更新脚本并立即返回；返回的令牌在脚本结束且标志清除后触发
    pub fn trigger(&self) -> Result<CancellationToken, UpdateError> {
        let guard = self.try_acquire().ok_or(UpdateError::InProgress)?;
        let finished = CancellationToken::new();
        let spec = self.command();
        let timeout = self.timeout;

        let done = finished.clone();
        let handle = tokio::spawn(async move {
            // 声明顺序保证先释放标志再通知等待方
            let _done = done.drop_guard();
            let _guard = guard;

            tracing::info!("开始执行更新脚本：{} {}", spec.program, spec.args.join(" "));
            let ctx = RunContext::new(timeout, CancellationToken::new());
            match process::run(&spec, &ctx).await {
                Ok(output) => tracing::info!(output = %output.text().trim_end(), "更新脚本执行完成"),
                Err(e) => {
                    let output = e.output().to_string();
                    if output.is_empty() {
                        tracing::error!("更新脚本执行失败：{e}");
                    } else {
                        tracing::error!(output = %output, "更新脚本执行失败：{e}");
                    }
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(finished)
    }

    /// 服务退出前等待进行中的更新脚本结束，避免运行时销毁时连带杀掉脚本
    ///
    /// 最长等待更新时限再加上进程终止的宽限期。
    pub async fn wait_idle(&self) {
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(handle) = handle else {
            return;
        };
        if !self.is_running() {
            return;
        }

        let limit = self.timeout + SHUTDOWN_SLACK;
        tracing::info!("等待正在执行的更新脚本结束（最多 {limit:?}）");
        match tokio::time::timeout(limit, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("更新任务异常退出：{e}"),
            Err(_) => tracing::warn!("等待更新脚本超时，放弃等待"),
        }
    }

    fn command(&self) -> CommandSpec {
        let script = self.script.to_string_lossy().into_owned();
        match &self.interpreter {
            Some(interpreter) => CommandSpec::new(interpreter.clone()).arg(script),
            None => CommandSpec::new(script),
        }
    }
}
