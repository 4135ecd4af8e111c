use crate::broker::types::{Balances, Profile, QuotesResponse};
use crate::config::Config;
use crate::logging;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("券商 API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

#[derive(Debug, Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    base_url: String,
    user_agent: String,
    log_level: logging::LogLevel,
}

impl BrokerClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        // 上游全部为短请求，HTTP/1.1 + 连接复用即可。
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .http1_only();

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.broker_base_url.trim_end_matches('/').to_string(),
            user_agent: cfg.api_user_agent.clone(),
            log_level: cfg.log_level(),
        })
    }

    fn build_headers(&self, access_token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .unwrap_or(HeaderValue::from_static("broker2api")),
        );
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(ACCEPT, HeaderValue::from_static("application/json"));
        h.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
        h
    }

    /// 低成本存活探测："我是谁"。幂等，无副作用。
    pub async fn get_profile(&self, access_token: &str) -> Result<Profile, ApiError> {
        let url = format!("{}/v1/user/profile", self.base_url);
        let body = self.send_get(&url, access_token).await?;
        Ok(sonic_rs::from_slice(&body)?)
    }

    pub async fn get_quotes(
        &self,
        access_token: &str,
        symbols: &[String],
    ) -> Result<QuotesResponse, ApiError> {
        let url = format!(
            "{}/v1/markets/quotes?symbols={}",
            self.base_url,
            symbols.join(",")
        );
        let body = self.send_get(&url, access_token).await?;
        Ok(sonic_rs::from_slice(&body)?)
    }

    pub async fn get_balances(&self, access_token: &str) -> Result<Balances, ApiError> {
        let url = format!("{}/v1/accounts/balances", self.base_url);
        let body = self.send_get(&url, access_token).await?;
        Ok(sonic_rs::from_slice(&body)?)
    }

    async fn send_get(&self, url: &str, access_token: &str) -> Result<Vec<u8>, ApiError> {
        let headers = self.build_headers(access_token);
        if self.log_level.backend_enabled() {
            logging::backend_request("GET", url, &headers);
        }

        let started = Instant::now();
        let resp = self.http.get(url).headers(headers).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();

        if self.log_level.backend_enabled() {
            logging::backend_response(status, started.elapsed(), &body);
        }

        if !(200..300).contains(&status) {
            let message = String::from_utf8_lossy(&body);
            let message = message.chars().take(512).collect::<String>();
            return Err(ApiError::Http { status, message });
        }

        Ok(body)
    }
}
