use crate::rate_limit::RateLimitInfo;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::HeaderName},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("请求频率超限")]
    RateLimited(RateLimitInfo),

    #[error("账号 {account_id} 创建连接失败: {reason}")]
    ConnectionFailed { account_id: String, reason: String },

    #[error("账号 {0} 连接池已满")]
    PoolExhausted(String),

    #[error("后端请求失败: {0}")]
    Upstream(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_time: Option<i64>,
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = match &self {
            AppError::Unauthorized(_) => {
                (StatusCode::UNAUTHORIZED, Some("unauthorized".to_string()))
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, Some("bad_request".to_string())),
            AppError::RateLimited(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                Some("rate_limited".to_string()),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("config".to_string()),
            ),
            AppError::ConnectionFailed { .. } => {
                (StatusCode::BAD_GATEWAY, Some("connection".to_string()))
            }
            AppError::PoolExhausted(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("pool_exhausted".to_string()),
            ),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, Some("backend".to_string())),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, Some("io".to_string())),
            AppError::Anyhow(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("internal".to_string()),
            ),
        };

        let quota = match &self {
            AppError::RateLimited(info) => Some(info.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty,
                limit: quota.as_ref().map(|q| q.limit),
                remaining: quota.as_ref().map(|q| q.remaining),
                reset_time: quota.as_ref().map(|q| q.reset_time),
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Some(q) = quota {
            let headers = resp.headers_mut();
            insert_numeric_header(headers, "x-ratelimit-limit", q.limit as i64);
            insert_numeric_header(headers, "x-ratelimit-remaining", q.remaining as i64);
            insert_numeric_header(headers, "x-ratelimit-reset", q.reset_time);
        }
        resp
    }
}

fn insert_numeric_header(headers: &mut axum::http::HeaderMap, name: &'static str, value: i64) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limited_response_headers() {
        let err = AppError::RateLimited(RateLimitInfo {
            limit: 10,
            remaining: 0,
            reset_time: 1_700_000_060,
            current_requests: 11,
        });
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            resp.headers().get("x-ratelimit-limit").unwrap(),
            &HeaderValue::from_static("10")
        );
        assert_eq!(
            resp.headers().get("x-ratelimit-remaining").unwrap(),
            &HeaderValue::from_static("0")
        );
    }

    #[test]
    fn test_error_messages_omit_secrets() {
        let err = AppError::ConnectionFailed {
            account_id: "acct-a".to_string(),
            reason: "后端不可达".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("acct-a"));
        assert!(!msg.to_lowercase().contains("token"));
    }
}
