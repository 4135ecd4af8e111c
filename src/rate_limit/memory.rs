use crate::rate_limit::RateLimitInfo;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// 进程内滑动窗口后备。
///
/// key 为 (identifier, window_secs) 联合：同一 identifier 可以同时受
/// 多个窗口长度约束，互不串扰。时间戳按插入顺序单调递增，过期清理
/// 只需要前缀裁剪。
#[derive(Debug, Default)]
pub struct MemoryBackend {
    windows: Mutex<HashMap<(String, u64), VecDeque<i64>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_allowed(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
    ) -> (bool, RateLimitInfo) {
        self.is_allowed_at(identifier, limit, window_secs, Utc::now().timestamp_millis())
            .await
    }

    /// 时间显式传入的实现，窗口过期行为可直接测试。
    pub(crate) async fn is_allowed_at(
        &self,
        identifier: &str,
        limit: u64,
        window_secs: u64,
        now_ms: i64,
    ) -> (bool, RateLimitInfo) {
        let window_ms = window_secs.saturating_mul(1000) as i64;
        let cutoff = now_ms - window_ms;
        let key = (identifier.to_string(), window_secs);

        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.clone()).or_default();

        while let Some(front) = entry.front() {
            if *front < cutoff {
                entry.pop_front();
            } else {
                break;
            }
        }

        let current = entry.len() as u64;
        let allowed = current < limit;
        if allowed {
            entry.push_back(now_ms);
        } else if entry.is_empty() {
            // limit=0 之类的极端参数：不留空桶。
            windows.remove(&key);
        }

        let current_requests = if allowed { current + 1 } else { current };
        let info = RateLimitInfo {
            limit,
            remaining: limit.saturating_sub(current + allowed as u64),
            reset_time: now_ms / 1000 + window_secs as i64,
            current_requests,
        };
        (allowed, info)
    }

    /// 周期清扫：裁剪全部过期时间戳并移除空桶，约束长期内存占用。
    /// 返回移除的桶数量。
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn sweep_at(&self, now_ms: i64) -> usize {
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|(_, window_secs), entry| {
            let cutoff = now_ms - window_secs.saturating_mul(1000) as i64;
            while let Some(front) = entry.front() {
                if *front < cutoff {
                    entry.pop_front();
                } else {
                    break;
                }
            }
            !entry.is_empty()
        });
        before - windows.len()
    }

    pub async fn tracked_buckets(&self) -> usize {
        self.windows.lock().await.len()
    }
}
