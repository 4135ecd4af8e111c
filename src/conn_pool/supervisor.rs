//! 后台守护：健康检查与空闲回收两个相互独立的周期循环。
//!
//! 两个循环都通过 watch 通道协作式退出：只在周期间隙检查信号，
//! 不会打断进行中的单次探测。

use crate::conn_pool::registry::PoolRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 健康检查循环：周期性探测空闲连接并剔除不健康者。
pub(crate) fn spawn_health_loop(
    registry: Arc<PoolRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            registry.run_health_cycle().await;
        }
        tracing::debug!("健康检查循环退出");
    })
}

/// 空闲回收循环：固定短周期，与健康检查互不依赖。
pub(crate) fn spawn_idle_evict_loop(
    registry: Arc<PoolRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            registry.run_idle_eviction().await;
        }
        tracing::debug!("空闲回收循环退出");
    })
}
