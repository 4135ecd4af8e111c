use uuid::Uuid;

pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// 连接 id：短格式，便于在日志与 usage_order 队列里引用。
pub fn connection_id() -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("conn-{}", &s[..s.len().min(12)])
}

/// 限流窗口内的唯一成员标识（同一毫秒多次请求也不会互相覆盖）。
pub fn window_member(now_ms: i64) -> String {
    let s = Uuid::new_v4().simple().to_string();
    format!("{now_ms}-{}", &s[..s.len().min(8)])
}

pub fn random_u64() -> u64 {
    // 复用 UUID v4 的随机源，避免额外引入 rand/getrandom 依赖。
    let b = *Uuid::new_v4().as_bytes();
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
