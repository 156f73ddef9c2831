//! Upstream exchange capabilities, modeled as traits.
//! Mission: the gateway never speaks the raw upstream wire protocol directly;
//! everything fans through `InfoTransport`/`ExchangeTransport` so a demo
//! adapter can stand in for a live exchange connection in tests and as a
//! runnable default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::order::Grouping;

/// One instrument entry from the upstream `meta` response: its canonical
/// name and size-decimals, at the index position that becomes its asset id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaAsset {
    pub name: String,
    pub sz_decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetaResponse {
    pub universe: Vec<MetaAsset>,
}

/// A serialized order exactly as the upstream exchange expects it, built by
/// the Order Pipeline: `{a, b, p, r, s, t}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    pub a: u32,
    pub b: bool,
    pub p: String,
    pub r: bool,
    pub s: String,
    pub t: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrderBatch {
    pub orders: Vec<WireOrder>,
    pub grouping: Grouping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub asset: u32,
    pub order_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeverageMode {
    Cross,
    Isolated,
}

/// Read-side upstream capabilities: market metadata, mid prices, and account
/// state. Consumed by the Price Tape (meta/allMids) and passed through by
/// the Gateway Facade for the remaining account endpoints.
#[async_trait]
pub trait InfoTransport: Send + Sync {
    async fn meta(&self) -> Result<MetaResponse>;
    async fn all_mids(&self) -> Result<HashMap<String, String>>;
    async fn clearinghouse_state(&self, user: &str) -> Result<Value>;
    async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value>;
    async fn open_orders(&self, user: &str) -> Result<Value>;
}

/// Write-side upstream capabilities: everything that mutates account or
/// order state on the exchange.
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn order(&self, batch: WireOrderBatch) -> Result<Value>;
    async fn cancel(&self, cancels: Vec<CancelRequest>) -> Result<Value>;
    async fn update_leverage(&self, coin: &str, leverage: u32, mode: LeverageMode) -> Result<Value>;
    async fn update_isolated_margin(&self, asset: u32, is_buy: bool, ntli: Decimal) -> Result<Value>;
}

/// Demo/paper transport so the gateway is runnable and testable without a
/// live exchange connection. Grounded in this codebase's
/// `PaperExecutionAdapter`: simulated latency, deterministic fills, and an
/// occasional synthetic reject rather than a real signed request.
pub struct DemoTransport {
    mids: Mutex<HashMap<String, Decimal>>,
    next_order_id: AtomicU64,
    reject_probability: f64,
}

impl Default for DemoTransport {
    fn default() -> Self {
        let mut mids = HashMap::new();
        mids.insert("BTC".to_string(), dec!(65000));
        mids.insert("ETH".to_string(), dec!(3200));
        mids.insert("SOL".to_string(), dec!(140));
        mids.insert("DOGE".to_string(), dec!(0.12));
        Self {
            mids: Mutex::new(mids),
            next_order_id: AtomicU64::new(1),
            reject_probability: 0.0,
        }
    }
}

impl DemoTransport {
    /// A demo transport that synthetically rejects orders at the given
    /// probability, for exercising the failure paths (TWAP sub-order
    /// failures, `TwapFirstOrderFailed`) deterministically-seeded tests don't
    /// want to rely on the default's zero rejection rate for.
    pub fn with_reject_probability(reject_probability: f64) -> Self {
        Self { reject_probability, ..Self::default() }
    }

    /// Instruments advertised via `meta`, in stable id-assigning order.
    fn universe() -> Vec<MetaAsset> {
        vec![
            MetaAsset { name: "BTC".into(), sz_decimals: 5 },
            MetaAsset { name: "ETH".into(), sz_decimals: 4 },
            MetaAsset { name: "SOL".into(), sz_decimals: 2 },
            MetaAsset { name: "DOGE".into(), sz_decimals: 0 },
        ]
    }

    /// Perturb each mid by a small random walk so repeated polls look live.
    fn jitter_mids(&self) {
        let mut mids = self.mids.lock();
        let mut rng = rand::thread_rng();
        for price in mids.values_mut() {
            let wobble = rng.gen_range(-0.001..0.001);
            let delta = *price * Decimal::try_from(wobble).unwrap_or(Decimal::ZERO);
            let next = *price + delta;
            if next > Decimal::ZERO {
                *price = next;
            }
        }
    }
}

#[async_trait]
impl InfoTransport for DemoTransport {
    async fn meta(&self) -> Result<MetaResponse> {
        Ok(MetaResponse { universe: Self::universe() })
    }

    async fn all_mids(&self) -> Result<HashMap<String, String>> {
        self.jitter_mids();
        let mids = self.mids.lock();
        Ok(mids.iter().map(|(k, v)| (k.clone(), v.to_string())).collect())
    }

    async fn clearinghouse_state(&self, user: &str) -> Result<Value> {
        Ok(json!({
            "user": user,
            "marginSummary": {
                "accountValue": "10000.0",
                "totalMarginUsed": "0.0",
                "totalNtlPos": "0.0",
                "totalRawUsd": "10000.0",
            },
            "assetPositions": [],
        }))
    }

    async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value> {
        Ok(json!({ "user": user, "balances": [] }))
    }

    async fn open_orders(&self, _user: &str) -> Result<Value> {
        Ok(json!([]))
    }
}

#[async_trait]
impl ExchangeTransport for DemoTransport {
    async fn order(&self, batch: WireOrderBatch) -> Result<Value> {
        sleep(Duration::from_millis(20)).await;

        if rand::thread_rng().gen::<f64>() < self.reject_probability {
            return Err(anyhow!("insufficient margin for order"));
        }

        let mut statuses = Vec::with_capacity(batch.orders.len());
        for order in &batch.orders {
            let oid = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            statuses.push(json!({
                "filled": {
                    "oid": oid,
                    "totalSz": order.s,
                    "avgPx": order.p,
                }
            }));
        }
        Ok(json!({ "status": "ok", "response": { "data": { "statuses": statuses } } }))
    }

    async fn cancel(&self, cancels: Vec<CancelRequest>) -> Result<Value> {
        sleep(Duration::from_millis(10)).await;
        Ok(json!({ "status": "ok", "cancelled": cancels.len() }))
    }

    async fn update_leverage(&self, coin: &str, leverage: u32, mode: LeverageMode) -> Result<Value> {
        sleep(Duration::from_millis(10)).await;
        Ok(json!({ "status": "ok", "coin": coin, "leverage": leverage, "mode": mode }))
    }

    async fn update_isolated_margin(&self, asset: u32, is_buy: bool, ntli: Decimal) -> Result<Value> {
        sleep(Duration::from_millis(10)).await;
        Ok(json!({ "status": "ok", "asset": asset, "isBuy": is_buy, "ntli": ntli.to_string() }))
    }
}
