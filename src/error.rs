use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::build::events::JobStage;
use crate::build::stages::StageError;

/// 构建任务的失败原因
///
/// `Display` 输出包含完整细节，只写入服务日志；
/// 返回给客户端的只有 [`JobError::reason`] 的简短说明。
#[derive(Debug, Error)]
pub enum JobError {
    #[error("请求体解析失败：{0}")]
    InvalidPayload(#[source] serde_json::Error),

    #[error("缺少必填参数")]
    MissingParameters,

    #[error("不支持的平台：{0}")]
    UnsupportedPlatform(String),

    #[error("仓库地址包含非法字符")]
    InvalidRepoUrl,

    #[error("包路径非法：{0}")]
    InvalidPackagePath(String),

    #[error("创建工作目录失败：{0}")]
    Workspace(#[source] std::io::Error),

    #[error("克隆仓库失败：{0}")]
    Fetch(#[source] StageError),

    #[error("安装依赖失败：{0}")]
    Install(#[source] StageError),

    #[error("构建失败：{0}")]
    Build(#[source] StageError),

    #[error("{stage} 阶段超过构建时限")]
    TimedOut { stage: JobStage },

    #[error("{stage} 阶段被取消")]
    Cancelled { stage: JobStage },

    #[error("读取构建产物失败：{0}")]
    Artifact(#[source] std::io::Error),
}

impl JobError {
    /// 把某个阶段的失败归类；超时与取消单独成类
    pub fn from_stage(stage: JobStage, err: StageError) -> Self {
        if err.is_timeout() {
            return JobError::TimedOut { stage };
        }
        if err.is_cancelled() {
            return JobError::Cancelled { stage };
        }
        match (stage, err) {
            (_, StageError::UnsupportedPlatform(p)) => JobError::UnsupportedPlatform(p),
            (_, StageError::InvalidRepoUrl) => JobError::InvalidRepoUrl,
            (JobStage::Fetching, e) => JobError::Fetch(e),
            (JobStage::Installing, e) => JobError::Install(e),
            (_, e) => JobError::Build(e),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            JobError::InvalidPayload(_)
            | JobError::MissingParameters
            | JobError::UnsupportedPlatform(_)
            | JobError::InvalidRepoUrl
            | JobError::InvalidPackagePath(_) => StatusCode::BAD_REQUEST,
            JobError::Workspace(_)
            | JobError::Fetch(_)
            | JobError::Install(_)
            | JobError::Build(_)
            | JobError::TimedOut { .. }
            | JobError::Cancelled { .. }
            | JobError::Artifact(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 返回给客户端的简短原因，不包含路径与命令输出
    pub fn reason(&self) -> &'static str {
        match self {
            JobError::InvalidPayload(_) => "Invalid request payload",
            JobError::MissingParameters => "Missing required parameters",
            JobError::UnsupportedPlatform(_) => "Unsupported platform",
            JobError::InvalidRepoUrl => "Invalid repository URL",
            JobError::InvalidPackagePath(_) => "Invalid package path",
            JobError::Fetch(_) => "Failed to clone the repository",
            JobError::Install(_) => "Failed to install npm dependencies",
            JobError::Build(_) => "Failed to build the app",
            JobError::TimedOut { .. } => "Build timed out",
            JobError::Cancelled { .. } => "Build cancelled",
            JobError::Workspace(_) | JobError::Artifact(_) => "Internal Server Error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    /// 失败步骤采集到的命令输出（用于写日志）
    pub fn process_output(&self) -> Option<&str> {
        match self {
            JobError::Fetch(e) | JobError::Install(e) | JobError::Build(e) => {
                e.process_output().filter(|s| !s.is_empty())
            }
            _ => None,
        }
    }
}

impl IntoResponse for JobError {
    fn into_response(self) -> Response {
        (self.status(), self.reason()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessError;

    #[test]
    fn taxonomy_maps_to_status_codes() {
        assert_eq!(JobError::MissingParameters.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            JobError::UnsupportedPlatform("web".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            JobError::TimedOut { stage: JobStage::Installing }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stage_timeout_becomes_job_timeout() {
        let err = StageError::Process(ProcessError::TimedOut {
            program: "npm".into(),
            output: "added 12 packages".into(),
        });
        let job = JobError::from_stage(JobStage::Installing, err);
        assert!(matches!(job, JobError::TimedOut { stage: JobStage::Installing }));
        assert_eq!(job.reason(), "Build timed out");
    }

    #[test]
    fn stage_failure_keeps_output_out_of_reason() {
        let err = StageError::Process(ProcessError::Spawn {
            program: "git".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        let job = JobError::from_stage(JobStage::Fetching, err);
        assert_eq!(job.reason(), "Failed to clone the repository");
        assert!(job.to_string().contains("git"));
    }
}
