//! TWAP Scheduler — size distribution, task registry, and timed
//! sub-order execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::order::{Order, OrderBatch, Side};
use crate::order_pipeline::OrderPipeline;
use crate::precision::PrecisionTable;
use crate::price_tape::PriceTape;
use crate::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TwapStatus {
    Active,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapResult {
    pub index: usize,
    pub executed_at: DateTime<Utc>,
    pub size: String,
    pub ok: bool,
    pub message: String,
}

/// Caller-supplied parameters for a new TWAP schedule.
#[derive(Debug, Clone)]
pub struct TwapParams {
    pub symbol: Symbol,
    pub side: Side,
    pub total_size: Decimal,
    pub duration_minutes: u32,
    pub intervals: u32,
    pub reduce_only: bool,
}

/// One scheduled TWAP task. Mutated only through the scheduler's internal
/// per-task mutex; `TwapTask::snapshot` is the read-only view handed back to
/// callers.
#[derive(Debug, Clone)]
pub struct TwapTask {
    pub id: u64,
    pub symbol: Symbol,
    pub side: Side,
    pub total_size: Decimal,
    pub sub_order_sizes: Vec<Decimal>,
    pub duration_minutes: u32,
    pub intervals: u32,
    pub reduce_only: bool,
    pub status: TwapStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub results: Vec<TwapResult>,
    pub completed_orders: u32,
    pub failed_orders: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapTaskView {
    pub id: u64,
    pub symbol: String,
    pub side: Side,
    pub total_size: String,
    pub sub_order_sizes: Vec<String>,
    pub duration_minutes: u32,
    pub intervals: u32,
    pub status: TwapStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub results: Vec<TwapResult>,
    pub completed_orders: u32,
    pub failed_orders: u32,
}

impl TwapTask {
    fn view(&self) -> TwapTaskView {
        TwapTaskView {
            id: self.id,
            symbol: self.symbol.perp(),
            side: self.side,
            total_size: self.total_size.to_string(),
            sub_order_sizes: self.sub_order_sizes.iter().map(|s| s.to_string()).collect(),
            duration_minutes: self.duration_minutes,
            intervals: self.intervals,
            status: self.status,
            created_at: self.created_at,
            completed_at: self.completed_at,
            cancelled_at: self.cancelled_at,
            results: self.results.clone(),
            completed_orders: self.completed_orders,
            failed_orders: self.failed_orders,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwapListSummary {
    pub tasks: Vec<TwapTaskView>,
    pub total_tasks: usize,
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
}

/// Deterministic front-loaded size distribution. `increment` is the symbol's size tick
/// (`10^(-szDecimals)`).
fn distribute_sizes(
    total_size: Decimal,
    intervals: u32,
    increment: Decimal,
) -> Result<Vec<Decimal>, GatewayError> {
    if increment.is_zero() {
        return Err(GatewayError::TwapSizeTooSmall("size increment is zero".into()));
    }

    let exact_units = total_size / increment;
    let rounded = exact_units.round();
    let total_units = if (exact_units - rounded).abs() > dec!(0.000001) {
        exact_units.floor()
    } else {
        rounded
    };

    let total_units: i64 = total_units
        .to_string()
        .parse()
        .map_err(|_| GatewayError::TwapSizeTooSmall("size does not fit an integer unit count".into()))?;
    let intervals_i64 = intervals as i64;

    if total_units < intervals_i64 {
        return Err(GatewayError::TwapSizeTooSmall(format!(
            "total size yields only {total_units} size units across {intervals} intervals"
        )));
    }

    let base = total_units / intervals_i64;
    let remainder = total_units - base * intervals_i64;

    let mut sizes = Vec::with_capacity(intervals as usize);
    for i in 0..intervals_i64 {
        let units = if i < remainder { base + 1 } else { base };
        sizes.push(Decimal::from(units) * increment);
    }

    if let Some(min) = sizes.iter().min() {
        if *min <= Decimal::ZERO {
            return Err(GatewayError::TwapSizeTooSmall(
                "distributed sub-order size rounds to zero".into(),
            ));
        }
    }

    Ok(sizes)
}

/// Task registry and execution engine. Owns every `TwapTask`; per-task
/// mutation is serialized through a `tokio::sync::Mutex` since sub-order
/// execution `.await`s upstream I/O while holding task state.
pub struct TwapScheduler {
    precision: Arc<parking_lot::RwLock<PrecisionTable>>,
    price_tape: Arc<PriceTape>,
    order_pipeline: Arc<OrderPipeline>,
    tasks: Mutex<HashMap<u64, Arc<Mutex<TwapTask>>>>,
    next_id: AtomicU64,
}

impl TwapScheduler {
    pub fn new(
        precision: Arc<parking_lot::RwLock<PrecisionTable>>,
        price_tape: Arc<PriceTape>,
        order_pipeline: Arc<OrderPipeline>,
    ) -> Arc<Self> {
        Arc::new(Self {
            precision,
            price_tape,
            order_pipeline,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Validate `params`, distribute sub-order sizes, synchronously execute
    /// sub-order 0, then schedule the remainder as independent timers.
    pub async fn create(self: &Arc<Self>, params: TwapParams) -> Result<TwapTaskView, GatewayError> {
        if !(5..=1440).contains(&params.duration_minutes) {
            return Err(GatewayError::TwapDurationOutOfRange(format!(
                "duration must be 5-1440 minutes, got {}",
                params.duration_minutes
            )));
        }
        if !(2..=100).contains(&params.intervals) {
            return Err(GatewayError::TwapIntervalsOutOfRange(format!(
                "intervals must be 2-100, got {}",
                params.intervals
            )));
        }

        let spec = self.precision.read().get_precision(&params.symbol);
        let increment = spec.size_tick();
        let sub_order_sizes = distribute_sizes(params.total_size, params.intervals, increment)?;

        if sub_order_sizes.iter().any(|s| *s < spec.min_order_size()) {
            return Err(GatewayError::TwapSizeTooSmall(format!(
                "a distributed sub-order size falls below the minimum order size of {}",
                spec.min_order_size()
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created_at = Utc::now();
        let mut task = TwapTask {
            id,
            symbol: params.symbol.clone(),
            side: params.side,
            total_size: params.total_size,
            sub_order_sizes: sub_order_sizes.clone(),
            duration_minutes: params.duration_minutes,
            intervals: params.intervals,
            reduce_only: params.reduce_only,
            status: TwapStatus::Active,
            created_at,
            completed_at: None,
            cancelled_at: None,
            results: Vec::new(),
            completed_orders: 0,
            failed_orders: 0,
        };

        // Sub-order 0 executes synchronously; its failure aborts creation
        // before the task is ever registered.
        match self.execute_sub_order(&mut task, 0).await {
            Ok(()) => {}
            Err(err) => {
                return Err(GatewayError::TwapFirstOrderFailed(err.to_string()));
            }
        }

        let view = task.view();
        let handle = Arc::new(Mutex::new(task));
        self.tasks.lock().await.insert(id, handle.clone());

        let interval_ms = (params.duration_minutes as u64 * 60_000) / params.intervals as u64;
        for i in 1..params.intervals {
            let this = Arc::clone(self);
            let handle = handle.clone();
            let deadline = TokioInstant::now() + std::time::Duration::from_millis(interval_ms * i as u64);
            tokio::spawn(async move {
                sleep_until(deadline).await;
                this.run_scheduled_sub_order(handle, i as usize).await;
            });
        }

        info!(task_id = id, symbol = %params.symbol, intervals = params.intervals, "twap task created");
        Ok(view)
    }

    async fn run_scheduled_sub_order(&self, handle: Arc<Mutex<TwapTask>>, index: usize) {
        let mut task = handle.lock().await;
        if task.status != TwapStatus::Active {
            return; // cancelled (or already terminal): cooperative no-op
        }
        if let Err(err) = self.execute_sub_order(&mut task, index).await {
            warn!(task_id = task.id, index, error = %err, "twap sub-order failed");
        }

        if index == task.intervals as usize - 1 {
            task.status = if task.completed_orders > 0 {
                TwapStatus::Completed
            } else {
                TwapStatus::Failed
            };
            task.completed_at = Some(Utc::now());
        }
    }

    /// Build, price-validate, and submit one sub-order; append its result
    /// and bump the running counters. Returns `Err` only for sub-order 0's
    /// synchronous-abort path — scheduled sub-orders record the failure
    /// instead of propagating it.
    async fn execute_sub_order(&self, task: &mut TwapTask, index: usize) -> Result<(), GatewayError> {
        if task.status != TwapStatus::Active {
            return Err(GatewayError::TwapNotActive(task.id));
        }

        let size = task.sub_order_sizes[index];
        let spec = self.precision.read().get_precision(&task.symbol);

        let mid = self.price_tape.get_mid(&task.symbol);
        let precondition_failure = if size < spec.min_order_size() {
            Some(format!("sub-order size {size} below minimum order size"))
        } else {
            crate::order_pipeline::validate_order_value(size, mid)
                .err()
                .map(|err| err.to_string())
        };

        if let Some(message) = precondition_failure {
            task.results.push(TwapResult {
                index,
                executed_at: Utc::now(),
                size: size.to_string(),
                ok: false,
                message: message.clone(),
            });
            task.failed_orders += 1;
            return Err(GatewayError::TwapSizeTooSmall(message));
        }

        let order = Order::ioc(task.symbol.clone(), task.side, size, task.reduce_only);
        let batch = OrderBatch::single(order);

        let outcome = self.order_pipeline.submit(batch).await;
        let (ok, message) = match &outcome {
            Ok(value) => (true, value.to_string()),
            Err(err) => (false, err.to_string()),
        };

        task.results.push(TwapResult {
            index,
            executed_at: Utc::now(),
            size: size.to_string(),
            ok,
            message: message.clone(),
        });

        if ok {
            task.completed_orders += 1;
            Ok(())
        } else {
            task.failed_orders += 1;
            Err(GatewayError::from_upstream(message))
        }
    }

    pub async fn get(&self, id: u64) -> Result<TwapTaskView, GatewayError> {
        let tasks = self.tasks.lock().await;
        let handle = tasks.get(&id).ok_or(GatewayError::TwapNotFound(id))?;
        Ok(handle.lock().await.view())
    }

    pub async fn list(&self) -> TwapListSummary {
        let tasks = self.tasks.lock().await;
        let mut views = Vec::with_capacity(tasks.len());
        for handle in tasks.values() {
            views.push(handle.lock().await.view());
        }
        let active = views.iter().filter(|t| t.status == TwapStatus::Active).count();
        let completed = views.iter().filter(|t| t.status == TwapStatus::Completed).count();
        let failed = views.iter().filter(|t| t.status == TwapStatus::Failed).count();
        TwapListSummary {
            total_tasks: views.len(),
            active_tasks: active,
            completed_tasks: completed,
            failed_tasks: failed,
            tasks: views,
        }
    }

    /// Mark an active task cancelled. Future scheduled sub-orders observe
    /// the status change and become no-ops. Idempotent: cancelling a
    /// terminal task is an error, not a crash.
    pub async fn cancel(&self, id: u64) -> Result<(), GatewayError> {
        let tasks = self.tasks.lock().await;
        let handle = tasks.get(&id).ok_or(GatewayError::TwapNotFound(id))?.clone();
        drop(tasks);

        let mut task = handle.lock().await;
        if task.status != TwapStatus::Active {
            return Err(GatewayError::TwapNotActive(id));
        }
        task.status = TwapStatus::Cancelled;
        task.cancelled_at = Some(Utc::now());
        info!(task_id = id, "twap task cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Network};
    use crate::precision::PrecisionTable;
    use crate::price_tape::PriceTape;
    use crate::transport::DemoTransport;
    use std::time::Duration;

    fn btc_spec_increment() -> Decimal {
        PrecisionTable::seed().get_precision(&Symbol::parse("BTC")).size_tick()
    }

    #[test]
    fn distribute_sizes_front_loads_remainder() {
        // 1.00000 BTC / 3 intervals, increment 0.00001 -> 100000 units / 3
        let sizes = distribute_sizes(dec!(1), 3, btc_spec_increment()).unwrap();
        assert_eq!(sizes.len(), 3);
        let total: Decimal = sizes.iter().sum();
        assert_eq!(total, dec!(1));
        // remainder of 100000 % 3 = 1, so exactly one interval gets +1 unit
        assert!(sizes[0] >= sizes[1]);
        assert!(sizes[1] == sizes[2]);
    }

    #[test]
    fn distribute_sizes_rejects_too_small_total() {
        let err = distribute_sizes(dec!(0.00001), 5, btc_spec_increment()).unwrap_err();
        assert!(matches!(err, GatewayError::TwapSizeTooSmall(_)));
    }

    async fn scheduler() -> Arc<TwapScheduler> {
        let config = Arc::new(Config {
            private_key: None,
            network: Network::Testnet,
            port: 0,
            price_poll_interval: Duration::from_secs(60),
            upstream_timeout: Duration::from_secs(1),
            asset_id_cache_ttl: Duration::from_secs(300),
        });
        let precision = Arc::new(parking_lot::RwLock::new(PrecisionTable::seed()));
        let demo = Arc::new(DemoTransport::default());
        let tape = PriceTape::new(config.clone(), precision.clone(), demo.clone());
        tape.poll_once().await.unwrap();
        let pipeline = Arc::new(crate::order_pipeline::OrderPipeline::new(
            config,
            precision.clone(),
            tape.clone(),
            demo,
        ));
        TwapScheduler::new(precision, tape, pipeline)
    }

    #[tokio::test]
    async fn create_executes_sub_order_zero_synchronously_and_schedules_rest() {
        let scheduler = scheduler().await;
        let view = scheduler
            .create(TwapParams {
                symbol: Symbol::parse("DOGE"),
                side: Side::Buy,
                total_size: dec!(1000),
                duration_minutes: 5,
                intervals: 5,
                reduce_only: false,
            })
            .await
            .unwrap();
        assert_eq!(view.status, TwapStatus::Active);
        assert_eq!(view.results.len(), 1);
        assert_eq!(view.sub_order_sizes.len(), 5);
    }

    #[tokio::test]
    async fn doge_twap_too_small_is_rejected() {
        let scheduler = scheduler().await;
        let err = scheduler
            .create(TwapParams {
                symbol: Symbol::parse("DOGE"),
                side: Side::Buy,
                total_size: dec!(3),
                duration_minutes: 5,
                intervals: 5,
                reduce_only: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TwapSizeTooSmall(_)));
    }

    #[tokio::test]
    async fn duration_out_of_range_is_rejected_before_pricing() {
        let scheduler = scheduler().await;
        let err = scheduler
            .create(TwapParams {
                symbol: Symbol::parse("BTC"),
                side: Side::Buy,
                total_size: dec!(1),
                duration_minutes: 4,
                intervals: 5,
                reduce_only: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TwapDurationOutOfRange(_)));
    }

    #[tokio::test]
    async fn intervals_out_of_range_is_rejected() {
        let scheduler = scheduler().await;
        let err = scheduler
            .create(TwapParams {
                symbol: Symbol::parse("BTC"),
                side: Side::Buy,
                total_size: dec!(1),
                duration_minutes: 5,
                intervals: 101,
                reduce_only: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TwapIntervalsOutOfRange(_)));
    }

    #[tokio::test]
    async fn cancel_on_unknown_task_errors() {
        let scheduler = scheduler().await;
        let err = scheduler.cancel(9999).await.unwrap_err();
        assert!(matches!(err, GatewayError::TwapNotFound(9999)));
    }

    #[tokio::test]
    async fn cancel_then_cancel_again_is_not_active_error() {
        let scheduler = scheduler().await;
        let view = scheduler
            .create(TwapParams {
                symbol: Symbol::parse("BTC"),
                side: Side::Buy,
                total_size: dec!(0.001),
                duration_minutes: 10,
                intervals: 2,
                reduce_only: false,
            })
            .await
            .unwrap();
        scheduler.cancel(view.id).await.unwrap();
        let err = scheduler.cancel(view.id).await.unwrap_err();
        assert!(matches!(err, GatewayError::TwapNotActive(_)));
    }
}
