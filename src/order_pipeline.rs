//! Order Pipeline — validates and prices a batch before it reaches the
//! upstream exchange.

use std::sync::Arc;

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;

use crate::config::Config;
use crate::error::GatewayError;
use crate::order::{Order, OrderBatch};
use crate::precision::{format_price, format_size, round_to_tick, PrecisionTable};
use crate::price_tape::PriceTape;
use crate::symbol::Symbol;
use crate::transport::{CancelRequest, ExchangeTransport, LeverageMode, WireOrder, WireOrderBatch};

/// The 80% pre-flight deviation ceiling.
const MAX_DEVIATION: Decimal = dec!(0.80);
/// Aggressive IOC buffer applied on top of the current mid.
const IOC_BUFFER: Decimal = dec!(0.10);
/// Minimum order notional in quote currency, enforced identically whether
/// `size` belongs to a stand-alone order or one TWAP sub-order — treated as
/// a deliberate parity rather than a discount sub-orders get (see
/// DESIGN.md).
pub const MIN_ORDER_NOTIONAL: Decimal = dec!(10);

/// Reject an order whose notional (`size * mid`) falls below the exchange's
/// minimum-notional floor. A no-op when no mid is available yet — the floor
/// is a market-value check, not a precision one.
pub fn validate_order_value(size: Decimal, mid: Option<Decimal>) -> Result<(), GatewayError> {
    let Some(mid) = mid else { return Ok(()) };
    let notional = size * mid;
    if notional < MIN_ORDER_NOTIONAL {
        return Err(GatewayError::ValidationError {
            field: "size".into(),
            reason: format!(
                "order notional {notional} is below the ${MIN_ORDER_NOTIONAL} minimum"
            ),
        });
    }
    Ok(())
}
/// Per-symbol fallback price used when no live mid is available, keyed by
/// base symbol. Anything unlisted falls back to `FALLBACK_DEFAULT`.
fn fallback_price(symbol: &Symbol) -> Decimal {
    match symbol.base() {
        "BTC" => dec!(65000),
        "ETH" => dec!(3200),
        "SOL" => dec!(140),
        "DOGE" => dec!(0.12),
        _ => dec!(100),
    }
}

/// Validates, prices, and submits an [`OrderBatch`] to the upstream exchange.
pub struct OrderPipeline {
    config: Arc<Config>,
    precision: Arc<RwLock<PrecisionTable>>,
    price_tape: Arc<PriceTape>,
    transport: RwLock<Arc<dyn ExchangeTransport>>,
}

impl OrderPipeline {
    pub fn new(
        config: Arc<Config>,
        precision: Arc<RwLock<PrecisionTable>>,
        price_tape: Arc<PriceTape>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Self {
        Self { config, precision, price_tape, transport: RwLock::new(transport) }
    }

    /// Swap the upstream write-side transport, used by `switch-network`.
    pub fn switch_transport(&self, transport: Arc<dyn ExchangeTransport>) {
        *self.transport.write() = transport;
    }

    /// Race a transport future against `upstream_timeout`, mapping both
    /// failure modes onto the same `GatewayError::Upstream`.
    async fn call_upstream(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<Value>>,
    ) -> Result<Value, GatewayError> {
        match tokio::time::timeout(self.config.upstream_timeout, fut).await {
            Ok(result) => result.map_err(|e| GatewayError::from_upstream(e.to_string())),
            Err(_) => Err(GatewayError::from_upstream("upstream request timed out")),
        }
    }

    /// Submit a batch of orders upstream, pricing and validating each one
    /// first. Returns the upstream's raw JSON result on success.
    pub async fn submit(&self, batch: OrderBatch) -> Result<Value, GatewayError> {
        let mut wire_orders = Vec::with_capacity(batch.orders.len());
        for order in &batch.orders {
            wire_orders.push(self.prepare_order(order).await?);
        }

        let wire_batch = WireOrderBatch { orders: wire_orders, grouping: batch.grouping };
        let transport = self.transport.read().clone();
        self.call_upstream(transport.order(wire_batch)).await
    }

    pub async fn cancel(&self, cancels: Vec<CancelRequest>) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.cancel(cancels)).await
    }

    pub async fn update_leverage(
        &self,
        coin: &str,
        leverage: u32,
        mode: LeverageMode,
    ) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.update_leverage(coin, leverage, mode)).await
    }

    pub async fn update_isolated_margin(
        &self,
        asset: u32,
        is_buy: bool,
        ntli: Decimal,
    ) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.update_isolated_margin(asset, is_buy, ntli)).await
    }

    /// Resolve asset id, synthesize/round a price, run the deviation
    /// pre-flight check, and serialize one order to its upstream shape.
    async fn prepare_order(&self, order: &Order) -> Result<WireOrder, GatewayError> {
        let asset_id = self.price_tape.get_asset_id(&order.symbol).await?;
        let spec = self.precision.read().get_precision(&order.symbol);
        let tick = self.precision.read().get_tick_size(&order.symbol);
        let mid = self.price_tape.get_mid(&order.symbol);

        let explicit_price = order
            .price
            .filter(|p| !p.is_zero())
            .or_else(|| match &order.order_type {
                crate::order::OrderType::Trigger { trigger_px, .. } => Some(*trigger_px),
                _ => None,
            });

        let price = match explicit_price {
            Some(p) => round_to_tick(p, tick),
            None => self.synthesize_price(order, mid, tick),
        };

        if let Some(mid) = mid {
            self.check_deviation(&order.symbol, price, mid)?;
        }
        validate_order_value(order.size, mid)?;

        Ok(WireOrder {
            a: asset_id,
            b: order.side.is_buy(),
            p: format_price(price, spec),
            r: order.reduce_only,
            s: format_size(order.size, spec.sz_decimals),
            t: order.order_type.to_wire(),
        })
    }

    /// Aggressive IOC price: `mid * 1.1` for buy, `mid * 0.9` for sell;
    /// BTC-PERP rounds up to the nearest integer before tick-rounding. Non-IOC
    /// orders never touch the live mid — they always synthesize from the
    /// per-symbol fallback constant, mid or no mid.
    fn synthesize_price(&self, order: &Order, mid: Option<Decimal>, tick: Decimal) -> Decimal {
        if !order.order_type.is_ioc() {
            return round_to_tick(fallback_price(&order.symbol), tick);
        }

        let base = mid.unwrap_or_else(|| fallback_price(&order.symbol));

        let raw = if order.side.is_buy() {
            base * (Decimal::ONE + IOC_BUFFER)
        } else {
            base * (Decimal::ONE - IOC_BUFFER)
        };

        let raw = if order.symbol.base() == "BTC" {
            raw.round_dp_with_strategy(0, rust_decimal::RoundingStrategy::AwayFromZero)
        } else {
            raw
        };

        round_to_tick(raw, tick)
    }

    /// Reject with a structured error if `price` deviates more than 80% from
    /// `mid`, suggesting a corrective price at the 80% boundary.
    fn check_deviation(&self, symbol: &Symbol, price: Decimal, mid: Decimal) -> Result<(), GatewayError> {
        if mid.is_zero() {
            return Ok(());
        }
        let deviation = ((price - mid) / mid).abs();
        if deviation <= MAX_DEVIATION {
            return Ok(());
        }

        let tick = self.precision.read().get_tick_size(symbol);
        let suggested = if price > mid {
            round_to_tick(mid * (Decimal::ONE + MAX_DEVIATION), tick)
        } else {
            round_to_tick(mid * (Decimal::ONE - MAX_DEVIATION), tick)
        };

        Err(GatewayError::PriceDeviation {
            order_price: price.to_string(),
            market_price: mid.to_string(),
            deviation: deviation.to_f64().unwrap_or(0.0),
            suggested_price: suggested.to_string(),
        })
    }
}
