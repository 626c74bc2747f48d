use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::FollowParams;
use crate::logstream::LogStreamSession;
use crate::state::AppState;

pub async fn trigger_update(State(state): State<AppState>, Query(params): Query<FollowParams>) -> Response {
    let log_path = state.config.log_path();
    // 在脚本启动前记录日志位置，保证脚本最早输出的行也能推送
    let offset = if params.follow {
        LogStreamSession::current_offset(&log_path).await
    } else {
        0
    };

    let finished = match state.updates.trigger() {
        Ok(finished) => finished,
        Err(e) => {
            tracing::warn!("拒绝更新请求：{e}");
            return e.into_response();
        }
    };
    tracing::info!(follow = params.follow, "已触发服务更新");

    if !params.follow {
        return (StatusCode::OK, "Update initiated").into_response();
    }

    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        if tx.send(Ok(Bytes::from_static(b"Update initiated\n"))).await.is_err() {
            return;
        }
        let mut session = LogStreamSession::start_from(log_path, tx.clone(), finished, offset);
        session.join().await;
        let _ = tx.send(Ok(Bytes::from_static(b"update finished\n"))).await;
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}
