use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{FollowParams, X_BUILD_ID};
use crate::build::events::JobStage;
use crate::build::pipeline::BuildJob;
use crate::build::request::BuildRequest;
use crate::state::AppState;

/// 响应体缓冲的块数
const BODY_CHANNEL_CAPACITY: usize = 32;

pub async fn trigger_build(
    State(state): State<AppState>,
    Query(params): Query<FollowParams>,
    body: Bytes,
) -> Response {
    tracing::debug!(stage = %JobStage::Validating, size = body.len(), "校验构建请求");
    let request = match BuildRequest::parse(&body, &state.config.build.allowed_platforms) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("构建请求被拒绝：{e}");
            return e.into_response();
        }
    };

    let job = BuildJob::new(state.config.clone(), request, state.shutdown.child_token());
    tracing::info!(
        job_id = %job.id(),
        repo_url = %job.request().repo_url,
        platform = %job.request().platform,
        package_path = %job.request().package_path.display(),
        follow = params.follow,
        "收到构建请求"
    );

    if params.follow {
        follow_build(state, job)
    } else {
        buffered_build(state, job).await
    }
}

/// 等构建结束后再决定状态码，成功时附带准确的 Content-Length
async fn buffered_build(state: AppState, job: BuildJob) -> Response {
    let job_id = job.id().to_string();
    let update_server = job.request().update_server;

    let artifact = match job.run(None).await {
        Ok(artifact) => artifact,
        Err(e) => return (e.status(), [(X_BUILD_ID, job_id)], e.reason()).into_response(),
    };

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type().to_string()),
        (header::CONTENT_DISPOSITION, attachment(artifact.file_name())),
        (header::CONTENT_LENGTH, artifact.size().to_string()),
        (X_BUILD_ID, job_id.clone()),
    ];

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let delivered = artifact.stream_into(tx).await;
        if delivered && update_server {
            start_self_update(&state, &job_id);
        }
    });

    (StatusCode::OK, headers, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

/// 立即返回 200，先推送构建日志，再推送产物；失败时以 `error: <reason>` 结尾
fn follow_build(state: AppState, job: BuildJob) -> Response {
    let job_id = job.id().to_string();
    let headers = [
        (header::CONTENT_TYPE, job.content_type().to_string()),
        (header::CONTENT_DISPOSITION, attachment(&job.artifact_name())),
        (X_BUILD_ID, job_id.clone()),
    ];

    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        let update_server = job.request().update_server;
        let log_path = state.config.log_path();

        // 客户端断开时丢弃构建 future，进程组和工作目录随之清理
        let outcome = tokio::select! {
            result = job.run(Some((log_path, tx.clone()))) => Some(result),
            _ = tx.closed() => None,
        };

        match outcome {
            None => tracing::warn!(job_id = %job_id, "客户端已断开，构建已中止"),
            Some(Ok(artifact)) => {
                if artifact.stream_into(tx).await && update_server {
                    start_self_update(&state, &job_id);
                }
            }
            Some(Err(e)) => {
                let line = format!("error: {}\n", e.reason());
                let _ = tx.send(Ok(Bytes::from(line))).await;
            }
        }
    });

    (StatusCode::OK, headers, Body::from_stream(ReceiverStream::new(rx))).into_response()
}

fn attachment(file_name: &str) -> String {
    format!("attachment; filename={file_name}")
}

/// 产物送达后触发自更新；已有更新在执行时只记录日志
fn start_self_update(state: &AppState, job_id: &str) {
    match state.updates.trigger() {
        Ok(_) => tracing::info!(job_id = %job_id, "构建产物已送达，开始自更新"),
        Err(e) => tracing::warn!(job_id = %job_id, "跳过自更新：{e}"),
    }
}
