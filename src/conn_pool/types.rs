use crate::broker::BrokerClient;
use crate::broker::types::{Balances, QuotesResponse};
use crate::util::id;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore};

/// 单个连接的健康/使用遥测。只被所属 Connection 修改。
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub usage_count: u64,
    pub error_count: u64,
    /// 增量式运行均值：avg' = avg + (sample - avg) / usage_count
    pub avg_response_time_ms: f64,
    pub is_healthy: bool,
}

impl ConnectionStats {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_used: now,
            usage_count: 0,
            error_count: 0,
            avg_response_time_ms: 0.0,
            is_healthy: true,
        }
    }

    pub fn observe_success(&mut self, sample_ms: f64) {
        self.last_used = Utc::now();
        self.usage_count += 1;
        self.avg_response_time_ms +=
            (sample_ms - self.avg_response_time_ms) / self.usage_count as f64;
        self.is_healthy = true;
    }

    pub fn observe_error(&mut self) {
        self.error_count += 1;
        self.is_healthy = false;
    }
}

/// 一个可复用的上游句柄：持有解析后的凭证与独占锁，串行化对上游的访问。
///
/// 独占语义：acquire() 拿到唯一许可并保存，release() 归还；许可存续期间
/// 其他调用方在 acquire() 上挂起。
pub struct Connection {
    id: String,
    account_id: String,
    credentials_ref: String,
    access_token: String,
    client: BrokerClient,
    excl: Arc<Semaphore>,
    held: Mutex<Option<OwnedSemaphorePermit>>,
    in_use: AtomicBool,
    stats: RwLock<ConnectionStats>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // access_token 绝不进入 Debug 输出。
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("account_id", &self.account_id)
            .field("credentials_ref", &self.credentials_ref)
            .field("in_use", &self.in_use.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(
        account_id: &str,
        credentials_ref: &str,
        access_token: String,
        client: BrokerClient,
    ) -> Self {
        Self {
            id: id::connection_id(),
            account_id: account_id.to_string(),
            credentials_ref: credentials_ref.to_string(),
            access_token,
            client,
            excl: Arc::new(Semaphore::new(1)),
            held: Mutex::new(None),
            in_use: AtomicBool::new(false),
            stats: RwLock::new(ConnectionStats::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// 低成本存活探测。任何错误都吸收为 false，绝不向调用方抛出。
    pub async fn test_connection(&self) -> bool {
        let _permit = match self.excl.acquire().await {
            Ok(p) => p,
            Err(_) => return false,
        };

        let started = Instant::now();
        match self.client.get_profile(&self.access_token).await {
            Ok(_) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.stats.write().await.observe_success(elapsed_ms);
                true
            }
            Err(e) => {
                self.stats.write().await.observe_error();
                tracing::warn!(
                    account_id = %self.account_id,
                    connection_id = %self.id,
                    error = %e,
                    "连接健康探测失败"
                );
                false
            }
        }
    }

    /// 挂起直到拿到独占许可，然后标记 in_use 并刷新 last_used。
    pub async fn acquire(&self) {
        if let Ok(permit) = self.excl.clone().acquire_owned().await {
            *self.held.lock().await = Some(permit);
        }
        self.in_use.store(true, Ordering::SeqCst);
        self.stats.write().await.last_used = Utc::now();
    }

    /// 幂等释放：未持有许可时调用不报错、不死锁。
    pub async fn release(&self) {
        let permit = self.held.lock().await.take();
        // 先清标志再放许可：等待者恢复后会重新置位 in_use。
        self.in_use.store(false, Ordering::SeqCst);
        drop(permit);
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    pub async fn is_available(&self) -> bool {
        !self.is_in_use() && self.stats.read().await.is_healthy
    }

    pub async fn stats(&self) -> ConnectionStats {
        self.stats.read().await.clone()
    }

    pub async fn age_minutes(&self) -> i64 {
        let created = self.stats.read().await.created_at;
        (Utc::now() - created).num_minutes()
    }

    pub async fn idle_secs(&self) -> i64 {
        let last_used = self.stats.read().await.last_used;
        (Utc::now() - last_used).num_seconds()
    }

    /// 业务调用：行情。调用耗时计入连接遥测。
    pub async fn quotes(&self, symbols: &[String]) -> Result<QuotesResponse, crate::broker::ApiError> {
        let started = Instant::now();
        match self.client.get_quotes(&self.access_token, symbols).await {
            Ok(v) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.stats.write().await.observe_success(elapsed_ms);
                Ok(v)
            }
            Err(e) => {
                self.stats.write().await.observe_error();
                Err(e)
            }
        }
    }

    /// 业务调用：资金。
    pub async fn balances(&self) -> Result<Balances, crate::broker::ApiError> {
        let started = Instant::now();
        match self.client.get_balances(&self.access_token).await {
            Ok(v) => {
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.stats.write().await.observe_success(elapsed_ms);
                Ok(v)
            }
            Err(e) => {
                self.stats.write().await.observe_error();
                Err(e)
            }
        }
    }
}

/// 一个账号的连接集合 + 使用顺序队列（最近使用的移到队尾，仅作选择提示）。
#[derive(Debug, Default)]
pub struct AccountPool {
    pub connections: Vec<Arc<Connection>>,
    pub usage_order: VecDeque<String>,
}

impl AccountPool {
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// 最近使用提示：把 connection id 移到队尾。
    pub fn touch(&mut self, connection_id: &str) {
        self.usage_order.retain(|id| id != connection_id);
        self.usage_order.push_back(connection_id.to_string());
    }

    pub fn remove(&mut self, connection_id: &str) {
        self.connections.retain(|c| c.id() != connection_id);
        self.usage_order.retain(|id| id != connection_id);
    }
}
