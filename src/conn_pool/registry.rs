use crate::broker::BrokerClient;
use crate::config::{AccountConfig, Config};
use crate::conn_pool::router::{self, Strategy};
use crate::conn_pool::supervisor;
use crate::conn_pool::types::{AccountPool, Connection};
use crate::credential::CredentialStore;
use crate::error::AppError;
use crate::logging;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;

/// 连接池注册表：进程级状态，持有所有账号的连接池与后台循环句柄。
///
/// 锁纪律：注册表写锁只覆盖结构变更与选择决策，绝不跨上游 I/O 持有；
/// 连接自身的独占锁才是唯一跨 I/O 的锁。
pub struct PoolRegistry {
    account_configs: HashMap<String, AccountConfig>,
    /// 启用账号 id，排序后固定（hash 路由的一致性依赖该顺序）。
    account_ids: Vec<String>,
    busy_reuse: bool,
    idle_ttl_secs: i64,
    health_interval: Duration,
    evict_interval: Duration,
    broker: BrokerClient,
    creds: Arc<CredentialStore>,
    inner: RwLock<Inner>,
    rr_counter: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

#[derive(Default)]
struct Inner {
    pools: HashMap<String, AccountPool>,
}

#[derive(Default)]
struct Lifecycle {
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

/// 选择决策的结果：决策在写锁内完成，I/O 在写锁外执行。
enum Selection {
    Reuse(Arc<Connection>),
    Create,
    BusyReuse(Arc<Connection>),
}

impl PoolRegistry {
    pub fn new(
        cfg: &Config,
        accounts: Vec<AccountConfig>,
        broker: BrokerClient,
        creds: Arc<CredentialStore>,
    ) -> Result<Self, AppError> {
        crate::config::validate_accounts(&accounts)?;

        let mut account_ids: Vec<String> = accounts
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.account_id.clone())
            .collect();
        account_ids.sort();

        let account_configs = accounts
            .into_iter()
            .map(|a| (a.account_id.clone(), a))
            .collect();

        Ok(Self {
            account_configs,
            account_ids,
            busy_reuse: cfg.pool_busy_reuse,
            idle_ttl_secs: cfg.idle_connection_ttl_secs as i64,
            health_interval: Duration::from_secs(cfg.health_check_interval_secs),
            evict_interval: Duration::from_secs(cfg.idle_evict_interval_secs),
            broker,
            creds,
            inner: RwLock::new(Inner::default()),
            rr_counter: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    /// 启用账号列表（已排序）。禁用账号保留在配置里但永不出现在这里。
    pub fn account_ids(&self) -> &[String] {
        &self.account_ids
    }

    pub fn account_config(&self, account_id: &str) -> Option<&AccountConfig> {
        self.account_configs.get(account_id)
    }

    /// 按策略选择一个账号。routing_key 只对 hash 策略有意义。
    pub async fn select_account(
        &self,
        strategy: Strategy,
        routing_key: Option<&str>,
    ) -> Option<String> {
        let ids = &self.account_ids;
        match strategy {
            Strategy::RoundRobin => {
                let ticket = self.rr_counter.fetch_add(1, Ordering::Relaxed);
                router::pick_round_robin(ids, ticket).cloned()
            }
            Strategy::Hash => router::pick_hash(ids, routing_key.unwrap_or_default()).cloned(),
            Strategy::LeastLoaded => {
                let loads = self.account_usage_totals().await;
                router::pick_least_loaded(&loads).cloned()
            }
            Strategy::Random => router::pick_random(ids).cloned(),
        }
    }

    async fn account_usage_totals(&self) -> Vec<(String, u64)> {
        let inner = self.inner.read().await;
        let mut loads = Vec::with_capacity(self.account_ids.len());
        for id in &self.account_ids {
            let mut total = 0u64;
            if let Some(pool) = inner.pools.get(id) {
                for conn in &pool.connections {
                    total += conn.stats().await.usage_count;
                }
            }
            loads.push((id.clone(), total));
        }
        loads
    }

    /// 取一条账号连接：优先空闲可用，其次按容量新建，饱和时按策略复用繁忙连接。
    pub async fn get_connection(&self, account_id: &str) -> Result<Arc<Connection>, AppError> {
        let max_connections = self
            .account_configs
            .get(account_id)
            .map(|a| a.effective_max_connections())
            .unwrap_or_else(|| crate::config::Tier::Standard.default_max_connections());

        loop {
            let selection = {
                let mut inner = self.inner.write().await;
                let pool = inner.pools.entry(account_id.to_string()).or_default();

                let mut available = None;
                for conn in &pool.connections {
                    if conn.is_available().await {
                        available = Some(conn.clone());
                        break;
                    }
                }

                if let Some(conn) = available {
                    pool.touch(conn.id());
                    Selection::Reuse(conn)
                } else if pool.len() < max_connections {
                    Selection::Create
                } else if self.busy_reuse {
                    let mut best: Option<(Arc<Connection>, u64)> = None;
                    for conn in &pool.connections {
                        let usage = conn.stats().await.usage_count;
                        match &best {
                            Some((_, lowest)) if usage >= *lowest => {}
                            _ => best = Some((conn.clone(), usage)),
                        }
                    }
                    match best {
                        Some((conn, _)) => {
                            pool.touch(conn.id());
                            Selection::BusyReuse(conn)
                        }
                        None => Selection::Create,
                    }
                } else {
                    return Err(AppError::PoolExhausted(account_id.to_string()));
                }
            };

            match selection {
                Selection::Reuse(conn) => {
                    conn.acquire().await;
                    return Ok(conn);
                }
                Selection::BusyReuse(conn) => {
                    tracing::warn!(
                        account_id,
                        connection_id = conn.id(),
                        "连接池饱和，复用繁忙连接"
                    );
                    conn.acquire().await;
                    return Ok(conn);
                }
                Selection::Create => {
                    // 构建 + 探测发生在注册表锁之外。
                    let conn = Arc::new(self.create_connection(account_id).await?);
                    if !conn.test_connection().await {
                        return Err(AppError::ConnectionFailed {
                            account_id: account_id.to_string(),
                            reason: "健康探测未通过".to_string(),
                        });
                    }

                    let inserted = {
                        let mut inner = self.inner.write().await;
                        let pool = inner.pools.entry(account_id.to_string()).or_default();
                        if pool.len() < max_connections {
                            pool.connections.push(conn.clone());
                            pool.touch(conn.id());
                            true
                        } else {
                            false
                        }
                    };

                    if inserted {
                        conn.acquire().await;
                        return Ok(conn);
                    }
                    // 容量在探测期间被并发占满：丢弃新连接，重新决策。
                }
            }
        }
    }

    async fn create_connection(&self, account_id: &str) -> Result<Connection, AppError> {
        let account = self.account_configs.get(account_id).ok_or_else(|| {
            AppError::ConnectionFailed {
                account_id: account_id.to_string(),
                reason: "账号未在配置中".to_string(),
            }
        })?;

        let access_token = self
            .creds
            .resolve(&account.credentials_ref)
            .await
            .ok_or_else(|| AppError::ConnectionFailed {
                account_id: account_id.to_string(),
                reason: "凭证引用无法解析".to_string(),
            })?;

        Ok(Connection::new(
            account_id,
            &account.credentials_ref,
            access_token,
            self.broker.clone(),
        ))
    }

    /// 归还连接并上报使用遥测。该调用永不失败。
    pub async fn release_connection(&self, conn: &Arc<Connection>) {
        conn.release().await;
        let stats = conn.stats().await;
        logging::connection_usage_event(
            conn.account_id(),
            conn.id(),
            stats.usage_count,
            stats.error_count,
            stats.avg_response_time_ms,
        );
    }

    /// 健康检查循环体：逐账号探测空闲连接，失败者移出池。
    /// 单个探测失败只影响该连接，循环继续。
    pub(crate) async fn run_health_cycle(&self) {
        let snapshot: Vec<Arc<Connection>> = {
            let inner = self.inner.read().await;
            inner
                .pools
                .values()
                .flat_map(|p| p.connections.iter().cloned())
                .collect()
        };

        let mut unhealthy: Vec<(String, String)> = Vec::new();
        for conn in snapshot {
            if conn.is_in_use() {
                // 使用中的连接不探测，本轮无条件保留。
                continue;
            }
            if !conn.test_connection().await {
                unhealthy.push((conn.account_id().to_string(), conn.id().to_string()));
            }
        }

        if unhealthy.is_empty() {
            return;
        }

        let mut inner = self.inner.write().await;
        for (account_id, conn_id) in unhealthy {
            let Some(pool) = inner.pools.get_mut(&account_id) else {
                continue;
            };
            // 探测后才被借走的连接本轮保留。
            let still_idle = pool
                .connections
                .iter()
                .any(|c| c.id() == conn_id && !c.is_in_use());
            if still_idle {
                pool.remove(&conn_id);
                logging::connection_evicted_event(&account_id, &conn_id, "健康探测失败");
            }
        }
    }

    /// 空闲回收循环体：超过 TTL 且未被使用的连接被回收；
    /// 回收后变空的池条目一并移除（账号配置保留）。
    pub(crate) async fn run_idle_eviction(&self) {
        let ttl = self.idle_ttl_secs;
        let mut inner = self.inner.write().await;

        let mut emptied = Vec::new();
        for (account_id, pool) in inner.pools.iter_mut() {
            let mut evict = Vec::new();
            for conn in &pool.connections {
                if conn.is_in_use() {
                    continue;
                }
                if conn.idle_secs().await >= ttl {
                    let age_minutes = conn.age_minutes().await;
                    tracing::debug!(
                        connection_id = conn.id(),
                        age_minutes = age_minutes,
                        "连接空闲超时"
                    );
                    evict.push(conn.id().to_string());
                }
            }
            for conn_id in evict {
                pool.remove(&conn_id);
                logging::connection_evicted_event(account_id, &conn_id, "空闲超时");
            }
            if pool.is_empty() {
                emptied.push(account_id.clone());
            }
        }
        for account_id in emptied {
            inner.pools.remove(&account_id);
        }
    }

    /// 启动两个后台循环。由进程入口显式调用一次，重复调用无效果。
    pub async fn start(self: &Arc<Self>) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.shutdown_tx.is_some() {
            return;
        }

        let (tx, rx) = watch::channel(false);
        lifecycle.tasks.push(supervisor::spawn_health_loop(
            self.clone(),
            self.health_interval,
            rx.clone(),
        ));
        lifecycle.tasks.push(supervisor::spawn_idle_evict_loop(
            self.clone(),
            self.evict_interval,
            rx,
        ));
        lifecycle.shutdown_tx = Some(tx);
        tracing::info!(
            health_interval_secs = self.health_interval.as_secs(),
            evict_interval_secs = self.evict_interval.as_secs(),
            "连接池后台循环已启动"
        );
    }

    /// 关停：通知后台循环退出并等待，随后尽力释放仍在使用的连接并清空池。
    /// 关停过程中的错误只记录，不阻塞退出。
    pub async fn shutdown(&self) {
        let (tx, tasks) = {
            let mut lifecycle = self.lifecycle.lock().await;
            (lifecycle.shutdown_tx.take(), std::mem::take(&mut lifecycle.tasks))
        };

        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "后台循环退出异常");
            }
        }

        let mut inner = self.inner.write().await;
        for (account_id, pool) in inner.pools.iter() {
            for conn in &pool.connections {
                if conn.is_in_use() {
                    tracing::warn!(
                        account_id = %account_id,
                        connection_id = conn.id(),
                        "关停时连接仍在使用，强制释放"
                    );
                    conn.release().await;
                }
            }
        }
        inner.pools.clear();
        tracing::info!("连接池已关停");
    }

    /// 只读统计快照，不改变任何状态。
    pub async fn pool_stats(&self) -> PoolStatsReport {
        let inner = self.inner.read().await;

        let mut accounts = HashMap::new();
        let mut total_connections = 0usize;
        for account_id in self.account_configs.keys() {
            let mut entry = AccountPoolStats::default();
            if let Some(pool) = inner.pools.get(account_id) {
                entry.connection_count = pool.len();
                total_connections += pool.len();

                let mut weighted_ms = 0.0f64;
                for conn in &pool.connections {
                    let stats = conn.stats().await;
                    if conn.is_available().await {
                        entry.available_connections += 1;
                    }
                    if stats.is_healthy {
                        entry.healthy_connections += 1;
                    }
                    entry.total_usage += stats.usage_count;
                    entry.total_errors += stats.error_count;
                    weighted_ms += stats.avg_response_time_ms * stats.usage_count as f64;
                }
                if entry.total_usage > 0 {
                    entry.avg_response_time_ms = weighted_ms / entry.total_usage as f64;
                }
            }
            accounts.insert(account_id.clone(), entry);
        }

        PoolStatsReport {
            total_accounts: self.account_configs.len(),
            active_accounts: self.account_ids.len(),
            total_connections,
            accounts,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AccountPoolStats {
    pub connection_count: usize,
    pub available_connections: usize,
    pub healthy_connections: usize,
    pub total_usage: u64,
    pub total_errors: u64,
    pub avg_response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsReport {
    pub total_accounts: usize,
    pub active_accounts: usize,
    pub total_connections: usize,
    pub accounts: HashMap<String, AccountPoolStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use std::sync::atomic::AtomicBool;

    /// 本地 stub 券商：fail 置位时 profile 探测返回 500。
    async fn spawn_stub_broker(fail: Arc<AtomicBool>) -> String {
        let app = Router::new()
            .route(
                "/v1/user/profile",
                get(move || {
                    let fail = fail.clone();
                    async move {
                        if fail.load(Ordering::SeqCst) {
                            (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
                        } else {
                            axum::Json(serde_json::json!({
                                "id": "u1", "name": "stub", "account_number": "A1"
                            }))
                            .into_response()
                        }
                    }
                }),
            )
            .route(
                "/v1/markets/quotes",
                get(|| async {
                    axum::Json(serde_json::json!({
                        "quotes": [{"symbol": "AAPL", "bid": 1.0, "ask": 1.1, "last": 1.05, "volume": 10}]
                    }))
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    use axum::response::IntoResponse;

    fn test_config(base_url: &str) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            api_user_agent: "broker2api-test".to_string(),
            timeout_ms: 2_000,
            proxy: String::new(),
            api_key: String::new(),
            debug: "off".to_string(),
            broker_base_url: base_url.to_string(),
            redis_url: String::new(),
            route_strategy: "hash".to_string(),
            pool_busy_reuse: true,
            health_check_interval_secs: 300,
            idle_evict_interval_secs: 60,
            idle_connection_ttl_secs: 600,
            rate_limit_requests: 60,
            rate_limit_window_secs: 60,
            data_dir: "./data".to_string(),
        }
    }

    fn test_accounts() -> Vec<AccountConfig> {
        sonic_rs::from_str(
            r#"[
                {"accountId":"acct-a","credentialsRef":"ref-a","maxConnections":2},
                {"accountId":"acct-b","credentialsRef":"ref-b"},
                {"accountId":"acct-c","credentialsRef":"ref-c","enabled":false}
            ]"#,
        )
        .expect("accounts")
    }

    async fn test_registry(base_url: &str) -> Arc<PoolRegistry> {
        test_registry_with(base_url, test_config(base_url)).await
    }

    async fn test_registry_with(base_url: &str, cfg: Config) -> Arc<PoolRegistry> {
        let creds = Arc::new(CredentialStore::new("./data"));
        creds.insert("ref-a", "token-a").await;
        creds.insert("ref-b", "token-b").await;
        let broker = BrokerClient::new(&test_config(base_url)).expect("broker");
        Arc::new(PoolRegistry::new(&cfg, test_accounts(), broker, creds).expect("registry"))
    }

    #[tokio::test]
    async fn test_disabled_accounts_not_routable() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let registry = test_registry(&base).await;
        assert_eq!(registry.account_ids(), ["acct-a", "acct-b"]);
        assert!(registry.account_config("acct-c").is_some());
    }

    #[tokio::test]
    async fn test_get_connection_reuses_idle() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let registry = test_registry(&base).await;

        let c1 = registry.get_connection("acct-a").await.expect("first");
        let id1 = c1.id().to_string();
        registry.release_connection(&c1).await;

        let c2 = registry.get_connection("acct-a").await.expect("second");
        assert_eq!(c2.id(), id1);
        registry.release_connection(&c2).await;

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 1);
    }

    #[tokio::test]
    async fn test_pool_bound_and_busy_reuse() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let registry = test_registry(&base).await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        let c2 = registry.get_connection("acct-a").await.expect("c2");
        assert_ne!(c1.id(), c2.id());

        // 池满且全部繁忙：第三个请求不报错，复用 usage_count 最低的连接，
        // 并在其独占锁上排队直到持有者归还。
        let third = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let c3 = registry.get_connection("acct-a").await.expect("c3");
                let id = c3.id().to_string();
                registry.release_connection(&c3).await;
                id
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!third.is_finished());

        registry.release_connection(&c1).await;
        let reused = third.await.expect("third join");
        assert!(reused == c1.id() || reused == c2.id());

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 2);
        registry.release_connection(&c2).await;
    }

    #[tokio::test]
    async fn test_busy_reuse_disabled_surfaces_exhaustion() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let mut cfg = test_config(&base);
        cfg.pool_busy_reuse = false;
        let registry = test_registry_with(&base, cfg).await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        let c2 = registry.get_connection("acct-a").await.expect("c2");

        let err = registry.get_connection("acct-a").await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted(_)));
        registry.release_connection(&c1).await;
        registry.release_connection(&c2).await;
    }

    #[tokio::test]
    async fn test_creation_failure_surfaces_error() {
        let fail = Arc::new(AtomicBool::new(true));
        let base = spawn_stub_broker(fail).await;
        let registry = test_registry(&base).await;

        let err = registry.get_connection("acct-a").await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionFailed { .. }));

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 0);
    }

    #[tokio::test]
    async fn test_unresolvable_credentials_surface_error() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let cfg = test_config(&base);
        let creds = Arc::new(CredentialStore::new("./data"));
        let broker = BrokerClient::new(&cfg).expect("broker");
        let registry =
            PoolRegistry::new(&cfg, test_accounts(), broker, creds).expect("registry");

        let err = registry.get_connection("acct-a").await.unwrap_err();
        match err {
            AppError::ConnectionFailed { reason, .. } => {
                // 错误信息只包含 ref 名义，不包含密钥。
                assert!(!reason.contains("token"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_health_cycle_evicts_unhealthy_keeps_in_use() {
        let fail = Arc::new(AtomicBool::new(false));
        let base = spawn_stub_broker(fail.clone()).await;
        let registry = test_registry(&base).await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        let c2 = registry.get_connection("acct-a").await.expect("c2");
        registry.release_connection(&c2).await;
        // c1 保持使用中，c2 空闲。

        fail.store(true, Ordering::SeqCst);
        registry.run_health_cycle().await;

        let stats = registry.pool_stats().await;
        // 空闲连接探测失败被移除；使用中的连接本轮保留。
        assert_eq!(stats.accounts["acct-a"].connection_count, 1);
        registry.release_connection(&c1).await;
    }

    /// 按 token 区分故障的 stub：加入 fail 集合的 token 探测返回 500。
    async fn spawn_stub_broker_per_token(
        fail_tokens: Arc<tokio::sync::Mutex<std::collections::HashSet<String>>>,
    ) -> String {
        let app = Router::new().route(
            "/v1/user/profile",
            get(move |headers: axum::http::HeaderMap| {
                let fail_tokens = fail_tokens.clone();
                async move {
                    let token = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.strip_prefix("Bearer "))
                        .unwrap_or_default()
                        .to_string();
                    if fail_tokens.lock().await.contains(&token) {
                        (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
                    } else {
                        axum::Json(serde_json::json!({"id": "u1"})).into_response()
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_health_cycle_isolates_accounts() {
        let fail_tokens = Arc::new(tokio::sync::Mutex::new(std::collections::HashSet::new()));
        let base = spawn_stub_broker_per_token(fail_tokens.clone()).await;
        let registry = test_registry(&base).await;

        let ca = registry.get_connection("acct-a").await.expect("ca");
        let cb = registry.get_connection("acct-b").await.expect("cb");
        registry.release_connection(&ca).await;
        registry.release_connection(&cb).await;

        // acct-a 的凭证开始探测失败；acct-b 不受影响。
        fail_tokens.lock().await.insert("token-a".to_string());
        registry.run_health_cycle().await;

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 0);
        assert_eq!(stats.accounts["acct-b"].connection_count, 1);
        assert_eq!(stats.accounts["acct-b"].healthy_connections, 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_drops_stale_and_pool_entry() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let mut cfg = test_config(&base);
        cfg.idle_connection_ttl_secs = 0;
        let registry = test_registry_with(&base, cfg).await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        registry.release_connection(&c1).await;

        registry.run_idle_eviction().await;

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 0);
        assert_eq!(stats.total_connections, 0);
    }

    #[tokio::test]
    async fn test_idle_eviction_keeps_in_use() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let mut cfg = test_config(&base);
        cfg.idle_connection_ttl_secs = 0;
        let registry = test_registry_with(&base, cfg).await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        registry.run_idle_eviction().await;

        let stats = registry.pool_stats().await;
        assert_eq!(stats.accounts["acct-a"].connection_count, 1);
        registry.release_connection(&c1).await;
    }

    #[tokio::test]
    async fn test_select_account_strategies() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let registry = test_registry(&base).await;

        // round_robin 轮转推进。
        let first = registry
            .select_account(Strategy::RoundRobin, None)
            .await
            .expect("rr");
        let second = registry
            .select_account(Strategy::RoundRobin, None)
            .await
            .expect("rr");
        assert_ne!(first, second);

        // hash 一致性：同 key 同账号。
        let h1 = registry
            .select_account(Strategy::Hash, Some("AAPL"))
            .await
            .expect("hash");
        let h2 = registry
            .select_account(Strategy::Hash, Some("AAPL"))
            .await
            .expect("hash");
        assert_eq!(h1, h2);

        // least_loaded：acct-a 产生过使用量后应选 acct-b。
        let c1 = registry.get_connection("acct-a").await.expect("c1");
        registry.release_connection(&c1).await;
        let ll = registry
            .select_account(Strategy::LeastLoaded, None)
            .await
            .expect("least_loaded");
        assert_eq!(ll, "acct-b");

        let r = registry
            .select_account(Strategy::Random, None)
            .await
            .expect("random");
        assert!(registry.account_ids().contains(&r));
    }

    #[tokio::test]
    async fn test_lifecycle_shutdown_releases_and_clears() {
        let base = spawn_stub_broker(Arc::new(AtomicBool::new(false))).await;
        let registry = test_registry(&base).await;
        registry.start().await;

        let c1 = registry.get_connection("acct-a").await.expect("c1");
        assert!(c1.is_in_use());

        registry.shutdown().await;
        assert!(!c1.is_in_use());

        let stats = registry.pool_stats().await;
        assert_eq!(stats.total_connections, 0);
    }
}
