use crate::rate_limit::RateLimitInfo;
use crate::util::id;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// Redis 有序集合上的滑动窗口。
///
/// 单次判定在一个 MULTI/EXEC 管道里完成：清理过期成员 → 取当前计数 →
/// 无条件写入本次事件（被拒绝的尝试同样计入窗口）→ 续期 key。
/// 原子性由 Redis 的事务管道保证，进程内不再加锁。
#[derive(Debug)]
pub struct RedisBackend {
    client: redis::Client,
    op_timeout: Duration,
}

const KEY_PREFIX: &str = "ratelimit:";
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

impl RedisBackend {
    pub fn new(url: &str) -> Result<Self, redis::RedisError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    /// 每次使用前的轻量存活探测：建立连接 + PING。
    /// 任何失败（含超时）都视为后端不可用，由调用方回退内存模式。
    pub async fn probe(&self) -> Result<MultiplexedConnection, redis::RedisError> {
        let mut conn = tokio::time::timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| timeout_error())??;

        let _: String = tokio::time::timeout(
            self.op_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| timeout_error())??;

        Ok(conn)
    }

    pub async fn is_allowed(
        &self,
        conn: &mut MultiplexedConnection,
        identifier: &str,
        limit: u64,
        window_secs: u64,
    ) -> Result<(bool, RateLimitInfo), redis::RedisError> {
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window_secs.saturating_mul(1000) as i64;
        let key = format!("{KEY_PREFIX}{identifier}:{window_secs}");
        let member = id::window_member(now_ms);

        let (current,): (i64,) = tokio::time::timeout(self.op_timeout, async {
            redis::pipe()
                .atomic()
                // 清理窗口外成员：score < now - window
                .zrembyscore(&key, 0i64, format!("({}", now_ms - window_ms))
                .ignore()
                // 插入前计数：刚写入的事件若被拒绝，就是第 limit+1 个
                .zcard(&key)
                .zadd(&key, member, now_ms)
                .ignore()
                // 空 key 自清理
                .expire(&key, window_secs as i64)
                .ignore()
                .query_async(conn)
                .await
        })
        .await
        .map_err(|_| timeout_error())??;

        let current = current.max(0) as u64;
        let allowed = current < limit;
        let info = RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(current + 1),
            reset_time: now_ms / 1000 + window_secs as i64,
            current_requests: current + 1,
        };
        Ok((allowed, info))
    }
}

fn timeout_error() -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::IoError, "Redis 操作超时"))
}
