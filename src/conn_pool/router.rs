//! 账号级负载均衡：决定一次请求落在哪个账号上。
//!
//! 与池内"选哪条连接"（registry）相互独立。所有策略都只在启用账号里选择；
//! 分级（tier）影响连接数上限，不影响可选性。

use std::cell::Cell;

/// 路由策略，按调用选择。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Hash,
    LeastLoaded,
    Random,
}

impl Strategy {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "round_robin" | "rr" => Self::RoundRobin,
            "least_loaded" => Self::LeastLoaded,
            "random" => Self::Random,
            _ => Self::Hash,
        }
    }

}

/// 轮询：进程级单调计数对账号数取模。计数由 registry 持有并在每次选择时 +1。
pub fn pick_round_robin(ids: &[String], ticket: u64) -> Option<&String> {
    if ids.is_empty() {
        return None;
    }
    ids.get((ticket % ids.len() as u64) as usize)
}

/// 一致路由：对 routing key 做稳定哈希后映射到排序后的账号列表。
/// 账号集合不变时，同一 key 永远落在同一账号。
pub fn pick_hash<'a>(ids: &'a [String], routing_key: &str) -> Option<&'a String> {
    if ids.is_empty() {
        return None;
    }
    let h = fnv1a(routing_key.as_bytes());
    ids.get((h % ids.len() as u64) as usize)
}

/// 最低负载：聚合 usage_count 最小者胜出，平手按账号 id 顺序。
/// 刻意不考虑健康状态——剔除不健康连接是健康检查循环的职责。
pub fn pick_least_loaded(loads: &[(String, u64)]) -> Option<&String> {
    loads
        .iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(id, _)| id)
}

/// 均匀随机：只用于不需要一致性保证的粗粒度分流。
pub fn pick_random(ids: &[String]) -> Option<&String> {
    if ids.is_empty() {
        return None;
    }
    ids.get(random_usize(ids.len()))
}

/// 进程内稳定的 FNV-1a，避免为一致路由引入额外哈希依赖。
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

thread_local! {
    /// 轻量 PRNG：每线程一个 state，避免锁与频繁分配。
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    // 以 uuid v4 作为随机种子（仅在首次初始化线程本地 state 时调用一次）。
    let mut s = crate::util::id::random_u64();
    if s == 0 {
        // 避免 xorshift 的零种子退化。
        s = 0x9E37_79B9_7F4A_7C15;
    }
    s
}

fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        // xorshift64*
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

fn random_usize(upper: usize) -> usize {
    if upper <= 1 {
        return 0;
    }
    (next_u64() as usize) % upper
}
