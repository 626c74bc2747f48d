use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

// ── 认证中间件 ──

pub async fn require_build_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    authorize(&state.config.auth.build_token, req, next).await
}

pub async fn require_update_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    authorize(&state.config.auth.update_token, req, next).await
}

async fn authorize(expected: &str, req: Request, next: Next) -> Response {
    if !bearer_matches(req.headers(), expected) {
        tracing::warn!(path = %req.uri().path(), "请求未通过认证");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}

/// 未配置密钥时拒绝所有请求
fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token, expected))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        h
    }

    #[test]
    fn matching_bearer_token_passes() {
        assert!(bearer_matches(&headers("Bearer s3cret"), "s3cret"));
    }

    #[test]
    fn wrong_scheme_or_token_fails() {
        assert!(!bearer_matches(&headers("Bearer s3creT"), "s3cret"));
        assert!(!bearer_matches(&headers("Basic s3cret"), "s3cret"));
        assert!(!bearer_matches(&headers("s3cret"), "s3cret"));
        assert!(!bearer_matches(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn padded_token_is_rejected() {
        assert!(!bearer_matches(&headers("Bearer  s3cret"), "s3cret"));
        assert!(!bearer_matches(&headers("Bearer s3cret "), "s3cret"));
    }

    #[test]
    fn empty_secret_rejects_everything() {
        assert!(!bearer_matches(&headers("Bearer "), ""));
        assert!(!bearer_matches(&HeaderMap::new(), ""));
    }
}
