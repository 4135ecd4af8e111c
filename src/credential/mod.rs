//! 凭证存储（thin collaborator）。
//!
//! 连接池只持有不透明的 credentialsRef，真实密钥在这里解析；
//! 密钥永不写入日志、错误信息或任何序列化输出。

mod store;

pub use store::CredentialStore;
