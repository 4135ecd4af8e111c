//! 连接池模块。
//!
//! 目标：把多个上游账号的连接统一托管起来——按容量新建、空闲复用、
//! 饱和时按策略降级，并由后台循环负责健康剔除与空闲回收。
//! 账号级的选择（路由）与池内连接的选择相互独立。

mod registry;
mod router;
mod supervisor;
mod types;

pub use registry::{AccountPoolStats, PoolRegistry, PoolStatsReport};
pub use router::Strategy;
pub use types::{Connection, ConnectionStats};
