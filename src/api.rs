use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderName;
use axum::middleware;
use axum::routing::{get, post};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod auth;
pub mod build;
pub mod health;
pub mod update;

/// `/build` 请求体上限
const MAX_BUILD_BODY: usize = 64 * 1024;

pub const X_BUILD_ID: HeaderName = HeaderName::from_static("x-build-id");

/// `?follow=true` 时在响应体中实时推送服务日志
#[derive(Debug, Default, Deserialize)]
pub struct FollowParams {
    #[serde(default)]
    pub follow: bool,
}

pub fn router(state: AppState) -> Router {
    // 无需认证的路由
    let public_routes = Router::new().route("/health", get(health::health));

    let build_routes = Router::new()
        .route("/build", post(build::trigger_build))
        .layer(DefaultBodyLimit::max(MAX_BUILD_BODY))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_build_token));

    let update_routes = Router::new()
        .route("/update", get(update::trigger_update))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_update_token));

    Router::new()
        .merge(public_routes)
        .merge(build_routes)
        .merge(update_routes)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::build::pipeline::tests::test_config;
    use crate::config::ServiceConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use axum::response::Response;
    use std::path::Path;
    use tower::ServiceExt;

    pub(crate) const BUILD_TOKEN: &str = "build-secret";
    pub(crate) const UPDATE_TOKEN: &str = "update-secret";

    pub(crate) fn with_tokens(mut config: ServiceConfig) -> ServiceConfig {
        config.auth.build_token = BUILD_TOKEN.into();
        config.auth.update_token = UPDATE_TOKEN.into();
        config
    }

    pub(crate) fn build_request(token: Option<&str>, body: &str) -> Request<Body> {
        let mut req = Request::post("/build").header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    pub(crate) async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub(crate) fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn health_is_public() {
        let app = router(AppState::new(ServiceConfig::default()));
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "Server is up and running.\n");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let tools = tempfile::tempdir().unwrap();
        let temp_root = tempfile::tempdir().unwrap();
        let config = with_tokens(test_config(tools.path(), temp_root.path(), "echo ok"));
        let app = router(AppState::new(config));

        let body = format!(r#"{{"repo_url":"{}"}}"#, "a".repeat(MAX_BUILD_BODY + 1));
        let resp = app.oneshot(build_request(Some(BUILD_TOKEN), &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(entries(temp_root.path()), 0);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let app = router(AppState::new(ServiceConfig::default()));
        let resp = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
