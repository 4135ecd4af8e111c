use axum::http::HeaderMap;
use std::time::Duration;

/// 日志等级（DEBUG 环境变量）：
/// - off：只输出常规 tracing 日志
/// - low：额外输出客户端请求/响应摘要
/// - medium：额外输出后端请求/响应块（脱敏）
/// - high：等同 medium，并保留响应体原文
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" | "raw" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn backend_request(method: &str, url: &str, headers: &HeaderMap) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {url}\n[后端请求头]\n{}\n==========================================================",
        format_headers_redacted(headers),
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        String::from_utf8_lossy(body),
    );
}

/// 连接使用遥测：releaseConnection 时上报，供外部观测系统消费。
pub fn connection_usage_event(
    account_id: &str,
    connection_id: &str,
    usage_count: u64,
    error_count: u64,
    avg_response_time_ms: f64,
) {
    tracing::info!(
        account_id,
        connection_id,
        usage_count,
        error_count,
        avg_response_time_ms,
        "连接使用遥测"
    );
}

/// 连接被健康检查移除时的告警事件。
pub fn connection_evicted_event(account_id: &str, connection_id: &str, reason: &str) {
    tracing::warn!(account_id, connection_id, reason, "连接被移出连接池");
}

fn format_headers_redacted(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();
        let redacted = key_lc == "authorization"
            || key_lc == "proxy-authorization"
            || key_lc == "x-api-key";

        let v = if redacted {
            "Bearer ***"
        } else {
            value.to_str().unwrap_or("<binary>")
        };
        out.push_str(key);
        out.push_str(": ");
        out.push_str(v);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("  LOW "), LogLevel::Low);
        assert_eq!(LogLevel::parse("backend"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("raw"), LogLevel::High);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Off);
        assert!(LogLevel::Medium.backend_enabled());
        assert!(!LogLevel::Low.backend_enabled());
    }

    #[test]
    fn test_headers_redacted() {
        let mut h = HeaderMap::new();
        h.insert("authorization", HeaderValue::from_static("Bearer secret"));
        h.insert("accept", HeaderValue::from_static("application/json"));
        let s = format_headers_redacted(&h);
        assert!(!s.contains("secret"));
        assert!(s.contains("Bearer ***"));
        assert!(s.contains("application/json"));
    }
}
