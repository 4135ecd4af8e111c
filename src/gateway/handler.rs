use crate::config::Config;
use crate::conn_pool::{PoolRegistry, PoolStatsReport, Strategy};
use crate::error::AppError;
use crate::rate_limit::RateLimiter;
use axum::Json;
use axum::extract::{Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;

pub struct GatewayState {
    pub cfg: Config,
    pub registry: Arc<PoolRegistry>,
    pub limiter: Arc<RateLimiter>,
}

/// API Key 鉴权。未配置 API_KEY 时放行（本地部署模式）。
pub async fn api_auth_middleware(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.cfg.api_key.trim();
    if expected.is_empty() || is_authorized(request.headers(), expected) {
        return next.run(request).await;
    }
    AppError::unauthorized("API Key 缺失或不正确").into_response()
}

fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if bearer == Some(expected) {
        return true;
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        == Some(expected)
}

/// 调用方身份。用户体系在上游网关解析，这里只取透传的标识头。
fn caller_identity(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

/// 限流准入：拒绝时把配额元数据原样带回 429。
async fn check_admission(
    state: &GatewayState,
    user: &str,
    endpoint: &str,
) -> Result<(), AppError> {
    let identifier = format!("user:{user}:{endpoint}");
    let (allowed, info) = state
        .limiter
        .is_allowed(
            &identifier,
            state.cfg.rate_limit_requests,
            state.cfg.rate_limit_window_secs,
        )
        .await;
    if allowed {
        Ok(())
    } else {
        Err(AppError::RateLimited(info))
    }
}

/// 账号解析：显式指定的账号必须启用，否则按配置的策略路由。
async fn resolve_account(
    state: &GatewayState,
    requested: &str,
    routing_key: Option<&str>,
) -> Result<String, AppError> {
    if !requested.is_empty() {
        if state.registry.account_ids().iter().any(|id| id == requested) {
            return Ok(requested.to_string());
        }
        return Err(AppError::bad_request(format!(
            "账号 {requested} 不存在或未启用"
        )));
    }

    let strategy = Strategy::parse(&state.cfg.route_strategy);
    state
        .registry
        .select_account(strategy, routing_key)
        .await
        .ok_or_else(|| AppError::upstream("没有可用的账号"))
}

#[derive(Debug, Default, Deserialize)]
pub struct QuotesQuery {
    #[serde(default)]
    symbols: String,
    #[serde(default)]
    account_id: String,
}

/// GET /v1/market/quotes?symbols=AAPL,MSFT
pub async fn handle_quotes(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<QuotesQuery>,
) -> Result<Response, AppError> {
    let request_id = crate::util::id::request_id();
    let user = caller_identity(&headers);
    check_admission(&state, &user, "quotes").await?;

    let symbols: Vec<String> = query
        .symbols
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if symbols.is_empty() {
        return Err(AppError::bad_request("symbols 不能为空"));
    }

    // hash 策略用首个 symbol 做路由键：同一 symbol 始终落在同一账号。
    let account_id = resolve_account(&state, query.account_id.trim(), Some(&symbols[0])).await?;
    tracing::debug!(%request_id, %user, %account_id, "处理行情请求");
    let conn = state.registry.get_connection(&account_id).await?;
    let result = conn.quotes(&symbols).await;
    // 无论成败都归还连接。
    state.registry.release_connection(&conn).await;

    let quotes = result.map_err(|e| AppError::upstream(e.to_string()))?;
    Ok(Json(quotes).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct BalancesQuery {
    #[serde(default)]
    account_id: String,
}

/// GET /v1/account/balances
pub async fn handle_balances(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    Query(query): Query<BalancesQuery>,
) -> Result<Response, AppError> {
    let request_id = crate::util::id::request_id();
    let user = caller_identity(&headers);
    check_admission(&state, &user, "balances").await?;

    // 路由键用调用方身份：同一用户的资金视图固定落在同一账号。
    let account_id = resolve_account(&state, query.account_id.trim(), Some(&user)).await?;
    tracing::debug!(%request_id, %user, %account_id, "处理资金请求");
    let conn = state.registry.get_connection(&account_id).await?;
    let result = conn.balances().await;
    state.registry.release_connection(&conn).await;

    let balances = result.map_err(|e| AppError::upstream(e.to_string()))?;
    Ok(Json(balances).into_response())
}

/// GET /manager/api/pool/stats - 连接池只读统计。
pub async fn handle_pool_stats(
    State(state): State<Arc<GatewayState>>,
) -> Json<PoolStatsReport> {
    Json(state.registry.pool_stats().await)
}
