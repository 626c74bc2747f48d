use crate::config::ServiceConfig;
use crate::update::UpdateCoordinator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    /// 更新互斥：同一时刻只运行一个更新脚本
    pub updates: Arc<UpdateCoordinator>,
    /// 关闭宽限期结束时触发，正在运行的构建进程随之终止
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServiceConfig) -> Self {
        let updates = UpdateCoordinator::new(&config.update);
        Self {
            config: Arc::new(config),
            updates: Arc::new(updates),
            shutdown: CancellationToken::new(),
        }
    }
}
