//! Normalized order data model shared by the Order Pipeline and TWAP
//! Scheduler.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }

    /// `+1` for a long (buy) position, `-1` for a short (sell) position —
    /// the `sideMultiplier` used throughout the Liquidation Math Engine.
    pub fn multiplier(self) -> i32 {
        if self.is_buy() {
            1
        } else {
            -1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Alo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpSl {
    Tp,
    Sl,
}

/// Tagged order-type variant, replacing dynamic dispatch over a
/// `{limit, trigger}` dictionary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OrderType {
    Limit {
        tif: TimeInForce,
    },
    Trigger {
        trigger_px: Decimal,
        is_market: bool,
        tpsl: TpSl,
    },
}

impl OrderType {
    pub fn is_trigger(&self) -> bool {
        matches!(self, OrderType::Trigger { .. })
    }

    pub fn is_ioc(&self) -> bool {
        matches!(self, OrderType::Limit { tif: TimeInForce::Ioc })
    }

    /// The upstream wire shape's `t` field: `{"limit":{"tif":...}}` or
    /// `{"trigger":{...}}`.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            OrderType::Limit { tif } => serde_json::json!({ "limit": { "tif": tif } }),
            OrderType::Trigger { trigger_px, is_market, tpsl } => serde_json::json!({
                "trigger": {
                    "triggerPx": trigger_px.to_string(),
                    "isMarket": is_market,
                    "tpsl": tpsl,
                }
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub reduce_only: bool,
    pub order_type: OrderType,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl Order {
    /// A plain IOC market-ish order, as the TWAP Scheduler submits each
    /// sub-order.
    pub fn ioc(symbol: Symbol, side: Side, size: Decimal, reduce_only: bool) -> Self {
        Order {
            symbol,
            side,
            size,
            price: None,
            reduce_only,
            order_type: OrderType::Limit { tif: TimeInForce::Ioc },
            client_id: None,
        }
    }
}

/// Upstream grouping tag for a batch of orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Grouping {
    Na,
    NormalTpsl,
}

/// A non-empty, validated list of orders with its derived grouping tag.
#[derive(Debug, Clone)]
pub struct OrderBatch {
    pub orders: Vec<Order>,
    pub grouping: Grouping,
}

impl OrderBatch {
    /// Build a batch from caller-supplied orders, deriving the grouping tag
    /// as follows: any `Trigger` order in a batch of length > 1 forces
    /// `NormalTpsl`; TP/SL children must be `reduceOnly`; the parent (entry)
    /// order is always index 0 (the caller's first element, unchanged).
    pub fn new(orders: Vec<Order>) -> Result<Self, GatewayError> {
        if orders.is_empty() {
            return Err(GatewayError::ValidationError {
                field: "orders".into(),
                reason: "order batch must not be empty".into(),
            });
        }

        let has_trigger = orders.iter().any(|o| o.order_type.is_trigger());
        let grouping = if has_trigger && orders.len() > 1 {
            Grouping::NormalTpsl
        } else {
            Grouping::Na
        };

        if grouping == Grouping::NormalTpsl {
            for (i, order) in orders.iter().enumerate() {
                if i == 0 {
                    continue; // the entry order
                }
                if order.order_type.is_trigger() && !order.reduce_only {
                    return Err(GatewayError::ValidationError {
                        field: "reduceOnly".into(),
                        reason: "TP/SL trigger children must be reduceOnly".into(),
                    });
                }
            }
        }

        Ok(OrderBatch { orders, grouping })
    }

    /// A single-order batch, always tagged `Na`.
    pub fn single(order: Order) -> Self {
        OrderBatch { orders: vec![order], grouping: Grouping::Na }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit_order(side: Side) -> Order {
        Order {
            symbol: Symbol::parse("BTC"),
            side,
            size: Decimal::ONE,
            price: Some(Decimal::from(100)),
            reduce_only: false,
            order_type: OrderType::Limit { tif: TimeInForce::Gtc },
            client_id: None,
        }
    }

    fn trigger_order(tpsl: TpSl, is_market: bool, reduce_only: bool) -> Order {
        Order {
            symbol: Symbol::parse("BTC"),
            side: Side::Sell,
            size: Decimal::ONE,
            price: None,
            reduce_only,
            order_type: OrderType::Trigger {
                trigger_px: Decimal::from(120),
                is_market,
                tpsl,
            },
            client_id: None,
        }
    }

    #[test]
    fn single_trigger_order_is_na() {
        let batch = OrderBatch::new(vec![trigger_order(TpSl::Tp, false, true)]).unwrap();
        assert_eq!(batch.grouping, Grouping::Na);
    }

    #[test]
    fn entry_plus_tp_sl_is_normal_tpsl() {
        let batch = OrderBatch::new(vec![
            limit_order(Side::Buy),
            trigger_order(TpSl::Tp, false, true),
            trigger_order(TpSl::Sl, true, true),
        ])
        .unwrap();
        assert_eq!(batch.grouping, Grouping::NormalTpsl);
    }

    #[test]
    fn non_reduce_only_trigger_child_is_rejected() {
        let err = OrderBatch::new(vec![
            limit_order(Side::Buy),
            trigger_order(TpSl::Sl, true, false),
        ])
        .unwrap_err();
        assert!(matches!(err, GatewayError::ValidationError { .. }));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(OrderBatch::new(vec![]).is_err());
    }
}
