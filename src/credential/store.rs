use anyhow::Context;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// credentialsRef -> 密钥 的解析器。
///
/// 来源优先级：{data_dir}/credentials.json 里的映射，其次环境变量
/// `BROKER_SECRET_{REF}`（ref 转大写、`-` 替换为 `_`）。
#[derive(Debug)]
pub struct CredentialStore {
    file_path: PathBuf,
    state: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new(data_dir: &str) -> Self {
        Self {
            file_path: PathBuf::from(data_dir).join("credentials.json"),
            state: RwLock::new(HashMap::new()),
        }
    }

    /// 加载 credentials.json。文件不存在不算错误（允许纯环境变量部署）。
    pub async fn load(&self) -> anyhow::Result<()> {
        let data = match tokio::fs::read(&self.file_path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.state.write().await.clear();
                return Ok(());
            }
            Err(e) => return Err(e).context("读取 credentials.json 失败"),
        };

        let map: HashMap<String, String> =
            sonic_rs::from_slice(&data).context("解析 credentials.json 失败")?;

        let mut state = self.state.write().await;
        *state = map;
        Ok(())
    }

    /// 解析凭证引用。找不到返回 None，调用方决定如何报错（错误信息只包含 ref 名）。
    pub async fn resolve(&self, credentials_ref: &str) -> Option<String> {
        let credentials_ref = credentials_ref.trim();
        if credentials_ref.is_empty() {
            return None;
        }

        {
            let state = self.state.read().await;
            if let Some(secret) = state.get(credentials_ref) {
                return Some(secret.clone());
            }
        }

        let env_key = format!(
            "BROKER_SECRET_{}",
            credentials_ref.to_uppercase().replace('-', "_")
        );
        std::env::var(env_key).ok().filter(|v| !v.is_empty())
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.len()
    }

    #[cfg(test)]
    pub async fn insert(&self, credentials_ref: &str, secret: &str) {
        self.state
            .write()
            .await
            .insert(credentials_ref.to_string(), secret.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_from_map() {
        let store = CredentialStore::new("./data");
        store.insert("acct-a", "token-a").await;
        assert_eq!(store.resolve("acct-a").await.as_deref(), Some("token-a"));
        assert_eq!(store.resolve("missing").await, None);
        assert_eq!(store.resolve("  ").await, None);
    }
}
