//! Gateway Facade — thin HTTP routing onto the component layer.
//! Mission: every handler validates/deserializes, delegates to a component,
//! and serializes; no business logic lives here.

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::stream::Stream;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{Config, Network};
use crate::error::GatewayError;
use crate::middleware::{rate_limit_middleware, request_logging, RateLimitConfig, RateLimitLayer};
use crate::order::{Order, OrderBatch, OrderType, Side, TimeInForce, TpSl};
use crate::order_pipeline::OrderPipeline;
use crate::precision::PrecisionTable;
use crate::price_tape::PriceTape;
use crate::symbol::Symbol;
use crate::tiers::TierTable;
use crate::transport::{CancelRequest, DemoTransport, LeverageMode};
use crate::twap::{TwapParams, TwapScheduler};

/// Process-wide shared state, injected into every handler via `axum::State`.
/// Owns no business state itself — it is a bundle of `Arc`s to the
/// components that do; no global mutable state lives here.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub precision: Arc<parking_lot::RwLock<PrecisionTable>>,
    pub tiers: Arc<TierTable>,
    pub price_tape: Arc<PriceTape>,
    pub order_pipeline: Arc<OrderPipeline>,
    pub twap: Arc<TwapScheduler>,
    pub network: Arc<parking_lot::RwLock<Network>>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every component together from config, using the demo transport
    /// as the runnable default.
    pub fn bootstrap(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let precision = Arc::new(parking_lot::RwLock::new(PrecisionTable::seed()));
        let tiers = Arc::new(TierTable::seed());
        let transport = Arc::new(DemoTransport::default());

        let price_tape = PriceTape::new(config.clone(), precision.clone(), transport.clone());
        let order_pipeline = Arc::new(OrderPipeline::new(
            config.clone(),
            precision.clone(),
            price_tape.clone(),
            transport.clone(),
        ));
        let twap = TwapScheduler::new(precision.clone(), price_tape.clone(), order_pipeline.clone());

        Arc::new(Self {
            network: Arc::new(parking_lot::RwLock::new(config.network)),
            config,
            precision,
            tiers,
            price_tape,
            order_pipeline,
            twap,
            started_at: Instant::now(),
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());

    Router::new()
        .route("/api/health", get(health))
        .route("/api/meta", get(meta))
        .route("/api/prices", get(prices))
        .route("/api/price-stream", get(price_stream))
        .route("/api/market-data", get(market_data))
        .route("/api/asset-ids", get(asset_ids))
        .route("/api/clearinghouse-state", get(clearinghouse_state))
        .route("/api/wallet-balance", get(wallet_balance))
        .route("/api/place-order", post(place_order))
        .route("/api/place-twap-order", post(place_twap_order))
        .route("/api/twap-task/:id", get(get_twap_task))
        .route("/api/twap-tasks", get(list_twap_tasks))
        .route("/api/cancel-twap-task/:id", post(cancel_twap_task))
        .route("/api/leverage-status/:address", get(leverage_status))
        .route("/api/update-leverage", post(update_leverage))
        .route("/api/update-margin", post(update_margin))
        .route("/api/cancel-orders", post(cancel_orders))
        .route("/api/switch-network", post(switch_network))
        .route_layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(request_logging))
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "network": state.network.read().as_str(),
        "initialized": true,
        "timestamp": Utc::now().timestamp_millis(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn meta(State(state): State<Arc<AppState>>) -> Result<Json<Value>, GatewayError> {
    Ok(Json(state.price_tape.meta().await?))
}

async fn prices(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.price_tape.snapshot();
    let prices: HashMap<&str, Value> = snapshot
        .iter()
        .map(|(sym, e)| (sym.as_str(), json!({ "price": e.price.to_string(), "timestamp": e.timestamp_ms })))
        .collect();
    Json(json!({
        "prices": prices,
        "network": state.network.read().as_str(),
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

async fn market_data(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.price_tape.snapshot();
    let precision = state.precision.read();
    let mut out = serde_json::Map::new();
    for (sym, entry) in snapshot.iter() {
        let symbol = Symbol::parse(sym);
        let spec = precision.get_precision(&symbol);
        out.insert(
            sym.clone(),
            json!({
                "price": entry.price.to_string(),
                "szDecimals": spec.sz_decimals,
                "pxDecimals": spec.px_decimals,
                "timestamp": entry.timestamp_ms,
            }),
        );
    }
    Json(json!({ "prices": out }))
}

async fn asset_ids(State(state): State<Arc<AppState>>) -> Result<Json<Value>, GatewayError> {
    state.price_tape.refresh_asset_ids().await.ok();
    let snapshot = state.price_tape.snapshot();
    let mut ids = serde_json::Map::new();
    for sym in snapshot.keys() {
        let symbol = Symbol::parse(sym);
        if let Ok(id) = state.price_tape.get_asset_id(&symbol).await {
            ids.insert(sym.clone(), json!(id));
        }
    }
    Ok(Json(json!({ "assetIds": ids })))
}

#[derive(Debug, Deserialize)]
struct AddressQuery {
    address: String,
}

async fn clearinghouse_state(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AddressQuery>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(state.price_tape.clearinghouse_state(&q.address).await?))
}

async fn wallet_balance(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AddressQuery>,
) -> Result<Json<Value>, GatewayError> {
    let clearinghouse = state.price_tape.clearinghouse_state(&q.address).await?;
    let summary = clearinghouse.get("marginSummary").cloned().unwrap_or(json!({}));
    Ok(Json(json!({
        "accountValue": summary.get("accountValue").cloned().unwrap_or(json!("0")),
        "totalMarginUsed": summary.get("totalMarginUsed").cloned().unwrap_or(json!("0")),
        "totalNtlPos": summary.get("totalNtlPos").cloned().unwrap_or(json!("0")),
        "totalRawUsd": summary.get("totalRawUsd").cloned().unwrap_or(json!("0")),
    })))
}

async fn price_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let initial = {
        let snapshot = state.price_tape.snapshot();
        if snapshot.is_empty() {
            None
        } else {
            let prices: HashMap<&str, Value> = snapshot
                .iter()
                .map(|(sym, e)| (sym.as_str(), json!({ "price": e.price.to_string(), "timestamp": e.timestamp_ms })))
                .collect();
            Some(json!({
                "type": "priceUpdate",
                "prices": prices,
                "network": state.network.read().as_str(),
                "timestamp": Utc::now().timestamp_millis(),
            }))
        }
    };

    let rx = state.price_tape.subscribe();
    let updates = BroadcastStream::new(rx).filter_map(|msg| msg.ok()).map(|event| {
        Ok(Event::default().data(event.to_string()))
    });

    let stream: Box<dyn Stream<Item = Result<Event, Infallible>> + Send> = match initial {
        Some(snapshot) => Box::new(tokio_stream::once(Ok(Event::default().data(snapshot.to_string()))).chain(updates)),
        None => Box::new(updates),
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OrderRequest {
    Single(OrderDto),
    Batch(Vec<OrderDto>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDto {
    symbol: String,
    side: Side,
    size: Decimal,
    #[serde(default)]
    price: Option<Decimal>,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default)]
    tif: Option<TimeInForce>,
    #[serde(default)]
    trigger_px: Option<Decimal>,
    #[serde(default)]
    is_market: Option<bool>,
    #[serde(default)]
    tpsl: Option<TpSl>,
}

impl OrderDto {
    fn into_order(self) -> Result<Order, GatewayError> {
        let order_type = match self.trigger_px {
            Some(trigger_px) => OrderType::Trigger {
                trigger_px,
                is_market: self.is_market.unwrap_or(matches!(self.tpsl, Some(TpSl::Sl))),
                tpsl: self.tpsl.ok_or_else(|| GatewayError::ValidationError {
                    field: "tpsl".into(),
                    reason: "trigger orders require tpsl".into(),
                })?,
            },
            None => OrderType::Limit { tif: self.tif.unwrap_or(TimeInForce::Gtc) },
        };
        Ok(Order {
            symbol: Symbol::parse(&self.symbol),
            side: self.side,
            size: self.size,
            price: self.price,
            reduce_only: self.reduce_only,
            order_type,
            client_id: None,
        })
    }
}

async fn place_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OrderRequest>,
) -> Result<Json<Value>, GatewayError> {
    let dtos = match req {
        OrderRequest::Single(o) => vec![o],
        OrderRequest::Batch(os) => os,
    };
    let orders = dtos.into_iter().map(OrderDto::into_order).collect::<Result<Vec<_>, _>>()?;
    let batch = OrderBatch::new(orders)?;
    Ok(Json(state.order_pipeline.submit(batch).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TwapOrderDto {
    symbol: String,
    side: Side,
    total_size: Decimal,
    duration_minutes: u32,
    intervals: u32,
    #[serde(default)]
    reduce_only: bool,
}

async fn place_twap_order(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TwapOrderDto>,
) -> Result<Json<Value>, GatewayError> {
    let task = state
        .twap
        .create(TwapParams {
            symbol: Symbol::parse(&req.symbol),
            side: req.side,
            total_size: req.total_size,
            duration_minutes: req.duration_minutes,
            intervals: req.intervals,
            reduce_only: req.reduce_only,
        })
        .await?;
    Ok(Json(json!({
        "success": true,
        "taskId": task.id,
        "message": "twap task created",
        "task": task,
    })))
}

async fn get_twap_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, GatewayError> {
    let task = state.twap.get(id).await?;
    Ok(Json(json!({ "task": task })))
}

async fn list_twap_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let summary = state.twap.list().await;
    Json(json!({
        "tasks": summary.tasks,
        "totalTasks": summary.total_tasks,
        "activeTasks": summary.active_tasks,
        "completedTasks": summary.completed_tasks,
        "failedTasks": summary.failed_tasks,
    }))
}

async fn cancel_twap_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Value>, GatewayError> {
    state.twap.cancel(id).await?;
    Ok(Json(json!({ "success": true, "message": "twap task cancelled", "taskId": id })))
}

async fn leverage_status(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let clearinghouse = state.price_tape.clearinghouse_state(&address).await?;
    let positions = clearinghouse.get("assetPositions").cloned().unwrap_or(json!([]));
    let summary = clearinghouse.get("marginSummary").cloned().unwrap_or(json!({}));
    Ok(Json(json!({ "address": address, "positions": positions, "summary": summary })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateLeverageDto {
    coin: String,
    leverage_mode: LeverageMode,
    leverage: u32,
}

async fn update_leverage(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateLeverageDto>,
) -> Result<Json<Value>, GatewayError> {
    Ok(Json(state.order_pipeline.update_leverage(&req.coin, req.leverage, req.leverage_mode).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMarginDto {
    coin: String,
    is_buy: bool,
    ntli: Decimal,
}

async fn update_margin(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpdateMarginDto>,
) -> Result<Json<Value>, GatewayError> {
    let asset_id = state.price_tape.get_asset_id(&Symbol::parse(&req.coin)).await?;
    Ok(Json(state.order_pipeline.update_isolated_margin(asset_id, req.is_buy, req.ntli).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelOrdersDto {
    coin: String,
    order_ids: Vec<u64>,
}

async fn cancel_orders(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CancelOrdersDto>,
) -> Result<Json<Value>, GatewayError> {
    let asset_id = state.price_tape.get_asset_id(&Symbol::parse(&req.coin)).await?;
    let cancels = req.order_ids.into_iter().map(|order_id| CancelRequest { asset: asset_id, order_id }).collect();
    Ok(Json(state.order_pipeline.cancel(cancels).await?))
}

#[derive(Debug, Deserialize)]
struct SwitchNetworkDto {
    network: Network,
}

async fn switch_network(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SwitchNetworkDto>,
) -> Result<Json<Value>, GatewayError> {
    let transport = Arc::new(DemoTransport::default());
    state.price_tape.switch_network(req.network, transport.clone()).await?;
    state.order_pipeline.switch_transport(transport);
    *state.network.write() = req.network;
    info!(network = req.network.as_str(), "gateway switched network");
    Ok(Json(json!({ "success": true, "network": req.network.as_str() })))
}
