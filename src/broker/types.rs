use serde::{Deserialize, Serialize};

/// 存活探测返回的用户信息（只取必要字段）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub account_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    #[serde(default)]
    pub bid: f64,
    #[serde(default)]
    pub ask: f64,
    #[serde(default)]
    pub last: f64,
    #[serde(default)]
    pub volume: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotesResponse {
    #[serde(default)]
    pub quotes: Vec<Quote>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Balances {
    #[serde(default)]
    pub total_equity: f64,
    #[serde(default)]
    pub total_cash: f64,
    #[serde(default)]
    pub buying_power: f64,
}
