use crate::build::events::JobStage;
use crate::build::generate_job_id;
use crate::build::platform::Platform;
use crate::build::request::BuildRequest;
use crate::build::stages::{fetch, install, package};
use crate::build::workspace::Workspace;
use crate::config::ServiceConfig;
use crate::error::JobError;
use crate::logstream::{LogStreamSession, ResponseSink};
use crate::process::RunContext;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// 一次构建请求的完整生命周期
///
/// 状态机：Validating → Fetching → Installing → Building → Serving → Done，
/// 任一非初始状态都可能进入 Failed。Validating 在 [`BuildRequest::parse`] 中完成，
/// 这里从 Fetching 开始。整个状态机共享一个截止时间。
pub struct BuildJob {
    id: String,
    request: BuildRequest,
    config: Arc<ServiceConfig>,
    ctx: RunContext,
}

/// 构建成功后的产物，持有工作目录直到产物发送完毕
pub struct BuiltArtifact {
    job_id: String,
    file: File,
    size: u64,
    file_name: String,
    platform: Platform,
    workspace: Workspace,
    deadline: Instant,
}

impl BuildJob {
    pub fn new(config: Arc<ServiceConfig>, request: BuildRequest, cancel: CancellationToken) -> Self {
        let ctx = RunContext::new(config.build.timeout(), cancel);
        Self {
            id: generate_job_id(),
            request,
            config,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request(&self) -> &BuildRequest {
        &self.request
    }

    pub fn artifact_name(&self) -> String {
        self.request.platform.artifact_name(&self.id)
    }

    pub fn content_type(&self) -> &'static str {
        self.request.platform.content_type()
    }

    /// 依次执行克隆、安装、构建
    ///
    /// `progress` 为 `Some` 时在构建阶段并行跟踪服务日志写入该 sink。
    /// 失败时工作目录在返回前删除；成功时随产物一起交给调用方。
    pub async fn run(&self, progress: Option<(PathBuf, ResponseSink)>) -> Result<BuiltArtifact, JobError> {
        let workspace = Workspace::acquire(
            &self.config.build.temp_root(),
            &self.config.build.temp_dir_prefix,
            &self.id,
            &self.request.package_path,
        )
        .map_err(JobError::Workspace);

        let result = match workspace {
            Ok(workspace) => match self.run_stages(&workspace, progress).await {
                Ok(artifact) => self.open_artifact(artifact, workspace).await,
                Err(e) => {
                    workspace.release().await;
                    Err(e)
                }
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            self.log_failure(e);
        }
        result
    }

    async fn run_stages(
        &self,
        workspace: &Workspace,
        progress: Option<(PathBuf, ResponseSink)>,
    ) -> Result<PathBuf, JobError> {
        let tools = &self.config.tools;
        tracing::debug!(job_id = %self.id, "工作目录：{}", workspace.root().display());

        self.enter(JobStage::Fetching);
        fetch::clone_repository(
            &tools.git,
            &self.request.repo_url,
            &self.config.build.clone_branch,
            &workspace.clone_dir(),
            &self.ctx,
        )
        .await
        .map_err(|e| JobError::from_stage(JobStage::Fetching, e))?;

        self.enter(JobStage::Installing);
        let package_dir = workspace.package_dir();
        install::install_dependencies(&tools.install, &package_dir, &self.ctx)
            .await
            .map_err(|e| JobError::from_stage(JobStage::Installing, e))?;

        self.enter(JobStage::Building);
        let session = progress.map(|(log_path, sink)| LogStreamSession::start(log_path, sink));
        let built = package::build_app(
            &tools.eas,
            &package_dir,
            self.request.platform.as_str(),
            &self.config.build.allowed_platforms,
            &self.artifact_name(),
            &self.ctx,
        )
        .await;
        // 跟踪任务退出后调用方才能继续写响应
        if let Some(session) = session {
            session.stop().await;
        }

        built.map_err(|e| JobError::from_stage(JobStage::Building, e))
    }

    async fn open_artifact(&self, path: PathBuf, workspace: Workspace) -> Result<BuiltArtifact, JobError> {
        let opened = async {
            let file = File::open(&path).await?;
            let size = file.metadata().await?.len();
            Ok::<_, std::io::Error>((file, size))
        }
        .await;

        match opened {
            Ok((file, size)) => {
                self.enter(JobStage::Serving);
                tracing::info!(job_id = %self.id, size, "构建产物就绪：{}", path.display());
                Ok(BuiltArtifact {
                    job_id: self.id.clone(),
                    file,
                    size,
                    file_name: self.artifact_name(),
                    platform: self.request.platform,
                    workspace,
                    deadline: self.ctx.deadline(),
                })
            }
            Err(e) => {
                tracing::error!(job_id = %self.id, "无法打开构建产物 {}：{e}", path.display());
                workspace.release().await;
                Err(JobError::Artifact(e))
            }
        }
    }

    fn enter(&self, stage: JobStage) {
        tracing::info!(job_id = %self.id, stage = %stage, "构建任务进入 {stage} 阶段");
    }

    fn log_failure(&self, err: &JobError) {
        if err.is_client_error() {
            tracing::warn!(job_id = %self.id, stage = %JobStage::Failed, "构建请求被拒绝：{err}");
            return;
        }
        match err.process_output() {
            Some(output) => tracing::error!(
                job_id = %self.id,
                stage = %JobStage::Failed,
                output = %output,
                "构建任务失败：{err}"
            ),
            None => tracing::error!(job_id = %self.id, stage = %JobStage::Failed, "构建任务失败：{err}"),
        }
    }
}

impl BuiltArtifact {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &'static str {
        self.platform.content_type()
    }

    /// 把产物写入响应体，结束后删除工作目录；返回是否完整送达
    ///
    /// 此时响应头已发出，发送过程中的错误只记日志，不再改变结果。
    pub async fn stream_into(self, sink: ResponseSink) -> bool {
        let BuiltArtifact {
            job_id,
            file,
            workspace,
            deadline,
            ..
        } = self;

        let mut chunks = ReaderStream::new(file);
        let sent = tokio::time::timeout_at(deadline, async {
            while let Some(chunk) = chunks.next().await {
                match chunk {
                    Ok(bytes) => {
                        if sink.send(Ok(bytes)).await.is_err() {
                            tracing::warn!(job_id = %job_id, "客户端在接收产物时断开");
                            return false;
                        }
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, "读取构建产物失败：{e}");
                        let _ = sink.send(Err(e)).await;
                        return false;
                    }
                }
            }
            true
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!(job_id = %job_id, "发送产物超过构建时限，已中止");
            false
        });

        workspace.release().await;
        if sent {
            tracing::info!(job_id = %job_id, stage = %JobStage::Done, "构建任务完成");
        }
        sent
    }
}
