// === Jemalloc 全局分配器配置（用于内存分析）===
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod broker;
pub mod config;
pub mod conn_pool;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod rate_limit;
pub mod util;

use anyhow::Context;
use axum::routing::get;
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    // 凭证存储：credentials.json 不存在时允许纯环境变量部署。
    let creds = Arc::new(credential::CredentialStore::new(&cfg.data_dir));
    if let Err(e) = creds.load().await {
        tracing::warn!("加载 credentials.json 失败: {e:#}");
    }
    tracing::info!(entries = creds.count().await, "凭证存储就绪");

    // 账号配置：启动时一次性加载，非法配置直接终止启动。
    let accounts = config::load_accounts(&cfg.accounts_file())
        .await
        .context("加载账号配置失败")?;
    tracing::info!(
        total = accounts.len(),
        enabled = accounts.iter().filter(|a| a.enabled).count(),
        "账号配置加载完成"
    );

    let broker = broker::BrokerClient::new(&cfg).context("初始化 BrokerClient 失败")?;

    // 连接池注册表 + 后台守护（健康检查 / 空闲回收），显式生命周期。
    let registry = Arc::new(
        conn_pool::PoolRegistry::new(&cfg, accounts, broker, creds.clone())
            .context("初始化连接池失败")?,
    );
    registry.start().await;

    // 限流器：配置了 REDIS_URL 则优先分布式滑动窗口，否则进程内。
    let limiter = Arc::new(rate_limit::RateLimiter::new(&cfg));
    let _sweep_task = rate_limit::spawn_sweep_task(limiter.clone());

    let state = Arc::new(gateway::GatewayState {
        cfg: cfg.clone(),
        registry: registry.clone(),
        limiter,
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new()
        .route("/health", get(handle_health))
        .route("/debug/pprof/heap", get(handle_pprof_heap));

    // === API 路由（需要 API Key）===
    let api_routes = Router::new()
        .route("/v1/market/quotes", get(gateway::handle_quotes))
        .route("/v1/account/balances", get(gateway::handle_balances))
        .route("/manager/api/pool/stats", get(gateway::handle_pool_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::api_auth_middleware,
        ))
        .with_state(state);

    let app = Router::new().merge(public_routes).merge(api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    // 先停后台循环，再尽力释放连接；关停错误只记录不阻塞退出。
    registry.shutdown().await;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // 依赖库日志默认压到 warn，自身日志保持 info 起步，
    // 避免环境里预设的 RUST_LOG=warn 把关键日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("warn,broker2api=info")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,broker2api=info")
        } else if env.contains("broker2api") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},broker2api=info"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}

/// 导出 jemalloc 堆内存分析数据（pprof 格式）
/// 使用方式：
/// 1. curl http://localhost:PORT/debug/pprof/heap > heap.pb.gz
/// 2. go tool pprof -http=:8080 heap.pb.gz
#[cfg(not(target_env = "msvc"))]
async fn handle_pprof_heap() -> impl axum::response::IntoResponse {
    use axum::http::{StatusCode, header};
    use axum::response::Response;

    match jemalloc_pprof::PROF_CTL.as_ref() {
        Some(prof_ctl) => {
            let mut prof = prof_ctl.lock().await;
            match prof.dump_pprof() {
                Ok(pprof_data) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=\"heap.pb.gz\"",
                    )
                    .body(axum::body::Body::from(pprof_data))
                    .unwrap(),
                Err(e) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(axum::body::Body::from(format!("Failed to dump pprof: {e}")))
                    .unwrap(),
            }
        }
        None => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .body(axum::body::Body::from(
                "jemalloc profiling not enabled. Set MALLOC_CONF=prof:true before starting.",
            ))
            .unwrap(),
    }
}

#[cfg(target_env = "msvc")]
async fn handle_pprof_heap() -> &'static str {
    "jemalloc profiling is not supported on MSVC targets"
}
