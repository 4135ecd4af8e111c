//! 滑动窗口限流器。
//!
//! 准入判定与连接池相互独立，按任意 identifier（通常为
//! `user:{id}:{endpoint}`）计数。优先走 Redis 分布式后端，
//! 后端不可用时对同一次请求静默回退到进程内实现；可用性每次
//! 调用都重新探测，后端恢复后自动回切。

mod distributed;
mod memory;

use crate::config::Config;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

pub use memory::MemoryBackend;

/// 判定结果附带的配额元数据，按原样透给调用方（响应头/响应体）。
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// epoch 秒：无论放行与否都是 now + window。
    pub reset_time: i64,
    pub current_requests: u64,
}

pub struct RateLimiter {
    distributed: Option<distributed::RedisBackend>,
    memory: MemoryBackend,
    /// 只用于记录后端可用性翻转，不参与判定（判定每次重新探测）。
    distributed_available: AtomicBool,
}

impl RateLimiter {
    pub fn new(cfg: &Config) -> Self {
        let distributed = match cfg.redis_url.trim() {
            "" => None,
            url => match distributed::RedisBackend::new(url) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    tracing::warn!(error = %e, "Redis 初始化失败，限流退化为进程内模式");
                    None
                }
            },
        };

        Self {
            distributed,
            memory: MemoryBackend::new(),
            distributed_available: AtomicBool::new(true),
        }
    }

    /// 准入判定。调用方永远看不到分布式后端的错误。
    pub async fn is_allowed(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
    ) -> (bool, RateLimitInfo) {
        if let Some(backend) = &self.distributed {
            match backend.probe().await {
                Ok(mut conn) => {
                    match backend
                        .is_allowed(&mut conn, identifier, limit, window_secs)
                        .await
                    {
                        Ok(result) => {
                            if !self.distributed_available.swap(true, Ordering::SeqCst) {
                                tracing::info!("限流分布式后端恢复");
                            }
                            return result;
                        }
                        Err(e) => self.mark_unavailable(&e),
                    }
                }
                Err(e) => self.mark_unavailable(&e),
            }
        }
        self.memory.is_allowed(identifier, limit, window_secs).await
    }

    fn mark_unavailable(&self, e: &redis::RedisError) {
        if self.distributed_available.swap(false, Ordering::SeqCst) {
            tracing::warn!(error = %e, "限流分布式后端不可用，回退进程内模式");
        }
    }

    pub async fn sweep_memory(&self) -> usize {
        self.memory.sweep().await
    }
}

/// 内存后备的周期清扫任务：每分钟清掉空 identifier 桶。
pub fn spawn_sweep_task(limiter: Arc<RateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let removed = limiter.sweep_memory().await;
            if removed > 0 {
                tracing::debug!(removed, "限流内存桶清扫完成");
            }
        }
    })
}
