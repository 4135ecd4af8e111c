//! HTTP 网关层（thin plumbing）。
//!
//! 每个入站请求：解析调用方身份 → 限流准入 → 路由账号 → 借出连接 →
//! 调用上游 → 归还连接。核心策略都在 conn_pool 与 rate_limit 里，
//! 这里只做编排与 HTTP 映射。

mod handler;

pub use handler::{
    GatewayState, api_auth_middleware, handle_balances, handle_pool_stats, handle_quotes,
};
