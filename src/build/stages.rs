pub mod fetch;
pub mod install;
pub mod package;

use crate::process::ProcessError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("仓库地址包含非法字符")]
    InvalidRepoUrl,

    #[error("不支持的平台：{0}")]
    UnsupportedPlatform(String),

    #[error("{0} 命令未配置")]
    ToolNotConfigured(&'static str),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("克隆结束但目录不存在：{}", .0.display())]
    CloneMissing(PathBuf),

    #[error("包目录不存在：{}", .0.display())]
    PackageMissing(PathBuf),

    #[error("构建产物不存在：{}", .0.display())]
    ArtifactMissing(PathBuf),

    #[error("文件系统操作失败：{0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Process(e) if e.is_timeout())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Process(ProcessError::Cancelled { .. }))
    }

    pub fn process_output(&self) -> Option<&str> {
        match self {
            StageError::Process(e) => Some(e.output()),
            _ => None,
        }
    }
}
