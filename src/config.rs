use crate::error::AppError;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8046;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_USER_AGENT: &str = "broker2api/0.1";
const DEFAULT_BROKER_BASE_URL: &str = "https://api.broker.example.com";

/// 健康检查周期（秒），对齐"几分钟一次"的低频探测。
const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
/// 空闲回收周期固定为 1 分钟，与健康检查相互独立。
const DEFAULT_IDLE_EVICT_INTERVAL_SECS: u64 = 60;
/// 空闲连接存活时间（秒），超过后被回收。
const DEFAULT_IDLE_CONNECTION_TTL_SECS: u64 = 600;

const DEFAULT_RATE_LIMIT_REQUESTS: u64 = 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

/// 账号分级：决定单账号连接数上限的默认值，不影响路由可选性。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Standard,
}

impl Tier {
    pub fn default_max_connections(self) -> usize {
        match self {
            Tier::Premium => 10,
            Tier::Standard => 3,
        }
    }
}

fn default_tier() -> Tier {
    Tier::Standard
}

/// 单个上游账号的静态配置。启动时从 accounts.json 一次性加载，之后不可变。
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub account_id: String,
    /// 凭证引用（不透明指针，真实密钥由 credential store 解析），永不写入日志。
    pub credentials_ref: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tier")]
    pub tier: Tier,
    /// 省略时按 tier 取默认值。
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub region: String,
}

impl AccountConfig {
    pub fn effective_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.tier.default_max_connections())
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_user_agent: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub api_key: String,

    pub debug: String,

    pub broker_base_url: String,
    pub redis_url: String,

    pub route_strategy: String,
    pub pool_busy_reuse: bool,
    pub health_check_interval_secs: u64,
    pub idle_evict_interval_secs: u64,
    pub idle_connection_ttl_secs: u64,

    pub rate_limit_requests: u64,
    pub rate_limit_window_secs: u64,

    pub data_dir: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_USER_AGENT")]
    api_user_agent: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "BROKER_BASE_URL")]
    broker_base_url: Option<String>,
    #[serde(alias = "REDIS_URL")]
    redis_url: Option<String>,

    #[serde(alias = "ROUTE_STRATEGY")]
    route_strategy: Option<String>,
    #[serde(alias = "POOL_BUSY_REUSE")]
    pool_busy_reuse: Option<bool>,
    #[serde(alias = "HEALTH_CHECK_INTERVAL")]
    health_check_interval: Option<u64>,
    #[serde(alias = "IDLE_EVICT_INTERVAL")]
    idle_evict_interval: Option<u64>,
    #[serde(alias = "IDLE_CONNECTION_TTL")]
    idle_connection_ttl: Option<u64>,

    #[serde(alias = "RATE_LIMIT_REQUESTS")]
    rate_limit_requests: Option<u64>,
    #[serde(alias = "RATE_LIMIT_WINDOW")]
    rate_limit_window: Option<u64>,

    #[serde(alias = "DATA_DIR")]
    data_dir: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_user_agent: raw
                .api_user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            api_key: raw.api_key.unwrap_or_default(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            broker_base_url: raw
                .broker_base_url
                .unwrap_or_else(|| DEFAULT_BROKER_BASE_URL.to_string()),
            redis_url: raw.redis_url.unwrap_or_default(),
            route_strategy: raw.route_strategy.unwrap_or_else(|| "hash".to_string()),
            pool_busy_reuse: raw.pool_busy_reuse.unwrap_or(true),
            health_check_interval_secs: raw
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECS)
                .max(1),
            idle_evict_interval_secs: raw
                .idle_evict_interval
                .unwrap_or(DEFAULT_IDLE_EVICT_INTERVAL_SECS)
                .max(1),
            idle_connection_ttl_secs: raw
                .idle_connection_ttl
                .unwrap_or(DEFAULT_IDLE_CONNECTION_TTL_SECS)
                .max(1),
            rate_limit_requests: raw
                .rate_limit_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_REQUESTS)
                .max(1),
            rate_limit_window_secs: raw
                .rate_limit_window
                .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS)
                .max(1),
            data_dir: raw.data_dir.unwrap_or_else(|| "./data".to_string()),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }

    pub fn accounts_file(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("accounts.json")
    }
}

/// 加载并校验账号配置。任何一条非法记录都视为致命的配置错误。
pub async fn load_accounts(path: &Path) -> Result<Vec<AccountConfig>, AppError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| AppError::config(format!("读取 {} 失败: {e}", path.display())))?;

    let accounts: Vec<AccountConfig> = sonic_rs::from_slice(&data)
        .map_err(|e| AppError::config(format!("解析 {} 失败: {e}", path.display())))?;

    validate_accounts(&accounts)?;
    Ok(accounts)
}

pub fn validate_accounts(accounts: &[AccountConfig]) -> Result<(), AppError> {
    if accounts.is_empty() {
        return Err(AppError::config("账号配置为空"));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for a in accounts {
        let id = a.account_id.trim();
        if id.is_empty() {
            return Err(AppError::config("存在 accountId 为空的账号"));
        }
        if !seen.insert(id) {
            return Err(AppError::config(format!("accountId 重复: {id}")));
        }
        if a.credentials_ref.trim().is_empty() {
            return Err(AppError::config(format!("账号 {id} 缺少 credentialsRef")));
        }
        if let Some(n) = a.max_connections
            && n == 0
        {
            return Err(AppError::config(format!(
                "账号 {id} 的 maxConnections 必须大于 0"
            )));
        }
    }
    Ok(())
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(content) = std::fs::read_to_string(&dotenv_path) else {
        return;
    };

    for line in content.lines() {
        let Some((key, value)) = parse_dotenv_line(line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    let mut raw = line[eq_idx + 1..].trim();

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
        }
    }

    Some((key.to_string(), raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_accounts(json: &str) -> Vec<AccountConfig> {
        sonic_rs::from_str(json).expect("accounts json")
    }

    #[test]
    fn test_account_defaults_by_tier() {
        let accounts = parse_accounts(
            r#"[
                {"accountId":"a1","credentialsRef":"ref-a1","tier":"premium"},
                {"accountId":"a2","credentialsRef":"ref-a2"},
                {"accountId":"a3","credentialsRef":"ref-a3","maxConnections":7}
            ]"#,
        );
        assert_eq!(accounts[0].effective_max_connections(), 10);
        assert_eq!(accounts[1].effective_max_connections(), 3);
        assert_eq!(accounts[1].tier, Tier::Standard);
        assert_eq!(accounts[2].effective_max_connections(), 7);
        assert!(accounts.iter().all(|a| a.enabled));
        assert!(validate_accounts(&accounts).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_zero_capacity() {
        let dup = parse_accounts(
            r#"[
                {"accountId":"a1","credentialsRef":"r1"},
                {"accountId":"a1","credentialsRef":"r2"}
            ]"#,
        );
        assert!(validate_accounts(&dup).is_err());

        let zero = parse_accounts(r#"[{"accountId":"a1","credentialsRef":"r1","maxConnections":0}]"#);
        assert!(validate_accounts(&zero).is_err());

        let no_ref = parse_accounts(r#"[{"accountId":"a1","credentialsRef":"  "}]"#);
        assert!(validate_accounts(&no_ref).is_err());

        assert!(validate_accounts(&[]).is_err());
    }

    #[test]
    fn test_parse_dotenv_line() {
        assert_eq!(
            parse_dotenv_line("KEY=value"),
            Some(("KEY".to_string(), "value".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("export KEY=\"with space\""),
            Some(("KEY".to_string(), "with space".to_string()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=bad"), None);
    }
}
