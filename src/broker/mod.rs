//! 上游券商 API 客户端（thin collaborator）。
//!
//! 连接池只依赖两类调用：低成本的存活探测（用户信息）与持有连接期间的
//! 业务调用（行情/资金）。客户端对业务语义保持中立。

mod client;
pub mod types;

pub use client::{ApiError, BrokerClient};
