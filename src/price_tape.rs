//! Price Tape — periodic upstream poll, asset-id cache, and SSE fan-out.
//! Sole owner of `PriceSnapshot` and the subscriber broadcast
//! channel; the poll loop is the single writer, everyone else reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, Network};
use crate::error::GatewayError;
use crate::precision::PrecisionTable;
use crate::symbol::{normalize_coin_keys, Symbol};
use crate::transport::InfoTransport;

/// One symbol's latest observed mid price.
#[derive(Debug, Clone, Copy)]
pub struct PriceEntry {
    pub price: Decimal,
    pub timestamp_ms: i64,
}

/// Mapping from canonical `SYMBOL-PERP` to its latest price entry. The sole
/// shared-mutable state of the Price Tape.
pub type PriceSnapshot = HashMap<String, PriceEntry>;

struct AssetIdState {
    ids: HashMap<String, u32>,
    refreshed_at: Option<Instant>,
}

impl AssetIdState {
    fn empty() -> Self {
        Self { ids: HashMap::new(), refreshed_at: None }
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        match self.refreshed_at {
            None => true,
            Some(t) => t.elapsed() >= ttl,
        }
    }
}

/// Periodically polls the upstream `meta`/`allMids`, maintains the
/// symbol→asset-id cache, and fans live snapshots out to SSE subscribers.
pub struct PriceTape {
    config: Arc<Config>,
    precision: Arc<SyncRwLock<PrecisionTable>>,
    network: SyncRwLock<Network>,
    transport: SyncRwLock<Arc<dyn InfoTransport>>,
    snapshot: ArcSwap<PriceSnapshot>,
    asset_ids: AsyncMutex<AssetIdState>,
    subscribers: broadcast::Sender<Arc<Value>>,
    fetch_in_flight: AtomicBool,
    poll_handle: AsyncMutex<Option<JoinHandle<()>>>,
}

impl PriceTape {
    pub fn new(
        config: Arc<Config>,
        precision: Arc<SyncRwLock<PrecisionTable>>,
        transport: Arc<dyn InfoTransport>,
    ) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(64);
        let network = config.network;
        Arc::new(Self {
            config,
            precision,
            network: SyncRwLock::new(network),
            transport: SyncRwLock::new(transport),
            snapshot: ArcSwap::from_pointee(PriceSnapshot::new()),
            asset_ids: AsyncMutex::new(AssetIdState::empty()),
            subscribers: tx,
            fetch_in_flight: AtomicBool::new(false),
            poll_handle: AsyncMutex::new(None),
        })
    }

    pub fn network(&self) -> Network {
        *self.network.read()
    }

    /// A read-only view of the current price snapshot.
    pub fn snapshot(&self) -> Arc<PriceSnapshot> {
        self.snapshot.load_full()
    }

    pub fn get_mid(&self, symbol: &Symbol) -> Option<Decimal> {
        self.snapshot().get(&symbol.perp()).map(|e| e.price)
    }

    /// Subscribe a new SSE client; it receives every snapshot broadcast from
    /// this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Value>> {
        self.subscribers.subscribe()
    }

    /// Spawn the background poll loop. Idempotent: calling `start` while
    /// already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.poll_handle.lock().await;
        if guard.is_some() {
            return;
        }
        let this = Arc::clone(self);
        let interval = this.config.price_poll_interval;
        *guard = Some(tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "price tape poll loop starting");
            loop {
                if let Err(err) = this.poll_once().await {
                    warn!(error = %err, "price tape poll failed");
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Abort the poll loop. Used standalone for shutdown and as the first
    /// step of `switch_network`.
    pub async fn stop(&self) {
        let mut guard = self.poll_handle.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("price tape poll loop stopped");
        }
    }

    /// One poll cycle: fetch `allMids` and `meta` concurrently, build a new
    /// snapshot keyed by canonical `SYMBOL-PERP`, swap it in, and broadcast.
    /// Reentrant calls while a fetch is already in flight are skipped.
    pub async fn poll_once(&self) -> anyhow::Result<()> {
        if self
            .fetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.do_poll().await;
        self.fetch_in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn do_poll(&self) -> anyhow::Result<()> {
        let transport = self.transport.read().clone();
        let (mids, meta) = tokio::time::timeout(
            self.config.upstream_timeout,
            async { tokio::try_join!(transport.all_mids(), transport.meta()) },
        )
        .await
        .map_err(|_| anyhow::anyhow!("upstream poll timed out"))??;

        self.precision.write().prime_from_meta(
            meta.universe.iter().map(|a| (a.name.clone(), a.sz_decimals)),
        );

        let now_ms = Utc::now().timestamp_millis();
        let mut next = PriceSnapshot::new();
        for asset in &meta.universe {
            if let Some(raw) = mids.get(&asset.name) {
                if let Ok(price) = raw.parse::<Decimal>() {
                    let key = Symbol::parse(&asset.name).perp();
                    next.insert(key, PriceEntry { price, timestamp_ms: now_ms });
                }
            }
        }

        self.snapshot.store(Arc::new(next));
        self.broadcast_snapshot(now_ms);

        self.refresh_asset_ids_from(&meta.universe).await;
        Ok(())
    }

    fn broadcast_snapshot(&self, now_ms: i64) {
        let snapshot = self.snapshot();
        let prices: HashMap<&str, Value> = snapshot
            .iter()
            .map(|(sym, e)| (sym.as_str(), json!({ "price": e.price.to_string(), "timestamp": e.timestamp_ms })))
            .collect();
        let event = Arc::new(json!({
            "type": "priceUpdate",
            "prices": prices,
            "network": self.network().as_str(),
            "timestamp": now_ms,
        }));
        // A broadcast send fails only when there are no receivers connected;
        // that is the common case between SSE clients and is not an error.
        let _ = self.subscribers.send(event);
    }

    async fn refresh_asset_ids_from(&self, universe: &[crate::transport::MetaAsset]) {
        let mut ids = HashMap::new();
        for (idx, asset) in universe.iter().enumerate() {
            for key in normalize_coin_keys(&asset.name) {
                ids.insert(key, idx as u32);
            }
        }
        let mut state = self.asset_ids.lock().await;
        state.ids = ids;
        state.refreshed_at = Some(Instant::now());
    }

    /// Race a transport future against `upstream_timeout`, mapping both
    /// failure modes onto the same `GatewayError::Upstream`.
    async fn call_upstream<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.config.upstream_timeout, fut).await {
            Ok(result) => result.map_err(|e| GatewayError::from_upstream(e.to_string())),
            Err(_) => Err(GatewayError::from_upstream("upstream request timed out")),
        }
    }

    /// Passthrough to the current upstream's `meta`, for the `/meta` route.
    pub async fn meta(&self) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        let meta = self.call_upstream(transport.meta()).await?;
        serde_json::to_value(meta).map_err(|e| GatewayError::from_upstream(e.to_string()))
    }

    pub async fn clearinghouse_state(&self, user: &str) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.clearinghouse_state(user)).await
    }

    pub async fn spot_clearinghouse_state(&self, user: &str) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.spot_clearinghouse_state(user)).await
    }

    pub async fn open_orders(&self, user: &str) -> Result<Value, GatewayError> {
        let transport = self.transport.read().clone();
        self.call_upstream(transport.open_orders(user)).await
    }

    /// Explicit asset-id cache refresh, independent of the poll loop.
    pub async fn refresh_asset_ids(&self) -> Result<(), GatewayError> {
        let transport = self.transport.read().clone();
        let meta = self.call_upstream(transport.meta()).await?;
        self.refresh_asset_ids_from(&meta.universe).await;
        Ok(())
    }

    /// Resolve a symbol to its upstream asset id, refreshing the cache on a
    /// miss or once the TTL has elapsed. Fails closed when the symbol cannot
    /// be resolved even after a refresh.
    pub async fn get_asset_id(&self, symbol: &Symbol) -> Result<u32, GatewayError> {
        {
            let state = self.asset_ids.lock().await;
            if let Some(id) = state.ids.get(symbol.base()) {
                if !state.is_stale(self.config.asset_id_cache_ttl) {
                    return Ok(*id);
                }
            }
        }

        info!(symbol = %symbol, "asset id cache stale, refreshing");
        if let Err(err) = self.refresh_asset_ids().await {
            warn!(symbol = %symbol, error = %err, "asset id refresh failed, falling back to cached map");
        }

        let state = self.asset_ids.lock().await;
        state
            .ids
            .get(symbol.base())
            .copied()
            .ok_or_else(|| GatewayError::ValidationError {
                field: "symbol".into(),
                reason: format!("unknown asset id for {symbol}"),
            })
    }

    /// Pause the poll loop, swap in a new transport and network selection,
    /// clear the snapshot, restart the loop, and perform one synchronous
    /// fetch before returning.
    pub async fn switch_network(
        self: &Arc<Self>,
        network: Network,
        transport: Arc<dyn InfoTransport>,
    ) -> Result<(), GatewayError> {
        self.stop().await;
        *self.network.write() = network;
        *self.transport.write() = transport;
        self.snapshot.store(Arc::new(PriceSnapshot::new()));
        {
            let mut state = self.asset_ids.lock().await;
            *state = AssetIdState::empty();
        }

        self.poll_once()
            .await
            .map_err(|e| GatewayError::from_upstream(e.to_string()))?;
        self.start().await;
        info!(network = network.as_str(), "price tape switched network");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DemoTransport;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            private_key: None,
            network: Network::Testnet,
            port: 0,
            price_poll_interval: Duration::from_millis(50),
            upstream_timeout: Duration::from_secs(1),
            asset_id_cache_ttl: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn poll_once_populates_snapshot_and_asset_ids() {
        let tape = PriceTape::new(
            test_config(),
            Arc::new(SyncRwLock::new(PrecisionTable::seed())),
            Arc::new(DemoTransport::default()),
        );
        tape.poll_once().await.unwrap();
        assert!(tape.get_mid(&Symbol::parse("BTC")).is_some());
        let id = tape.get_asset_id(&Symbol::parse("ETH")).await.unwrap();
        assert_eq!(id, 1);
    }

    #[tokio::test]
    async fn unknown_symbol_fails_closed() {
        let tape = PriceTape::new(
            test_config(),
            Arc::new(SyncRwLock::new(PrecisionTable::seed())),
            Arc::new(DemoTransport::default()),
        );
        tape.poll_once().await.unwrap();
        let err = tape.get_asset_id(&Symbol::parse("NOPE")).await.unwrap_err();
        assert!(matches!(err, GatewayError::ValidationError { .. }));
    }

    #[tokio::test]
    async fn subscriber_receives_broadcast_on_poll() {
        let tape = PriceTape::new(
            test_config(),
            Arc::new(SyncRwLock::new(PrecisionTable::seed())),
            Arc::new(DemoTransport::default()),
        );
        let mut rx = tape.subscribe();
        tape.poll_once().await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event["type"], "priceUpdate");
    }
}
