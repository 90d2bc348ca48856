// =============================================================================
// Per-symbol trading loop — the top-level state machine
// =============================================================================
//
// States: Initializing -> Running -> Stopping -> Stopped, with a transient
// BackoffSleeping under recoverable errors.
//
// Each Running iteration:
//   1. fetch kline (forming bar dropped for decisioning), orderbook snapshot,
//      derivatives snapshot
//   2. build the feature frame
//   3. push the latest closed bar into the timeframe cache per configured TF
//   4. meta-layer -> signal
//   5. consult the position/signal-action handler; size, normalise, submit
//   6. persist position/order changes, journal the signal, reset the error
//      budget on success
//   7. sleep the tick interval; recoverable errors enter exponential backoff
//
// The loop is single-threaded cooperative: it never blocks on another symbol
// and never mutates another symbol's state.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::exchange::retry::backoff_delay;
use crate::exchange::{BybitRestClient, InstrumentRegistry};
use crate::execution::scaled_entry::LevelAction;
use crate::execution::{
    decide_action, ExecutionGateway, OrderRequest, PositionManager, ScaledEntryManager,
    SignalDecision, TriggerBy,
};
use crate::features::{build_features, FeatureFrame};
use crate::filters::FilterContext;
use crate::indicators::atr::atr_percent_series;
use crate::indicators::ema::ema_series;
use crate::market_data::{
    CachedBar, Candle, CandleBuffer, CandleKey, OrderBookManager, OrderbookSnapshot,
    TimeframeCache,
};
use crate::sizing::{PositionSizer, SizingInput};
use crate::storage::{SignalJournal, SqliteStore};
use crate::strategy::{MetaLayer, Signal};
use crate::types::{Direction, OrderType, PositionSide, TimeInForce};

/// Timeframes maintained for multi-timeframe confluence.
const MTF_INTERVALS: &[&str] = &["1", "5", "15"];
/// Bars fetched for the auxiliary MTF frames.
const MTF_KLINE_LIMIT: usize = 60;
/// Error-budget sliding window.
const ERROR_WINDOW: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Loop state & metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopState {
    Initializing,
    Running,
    BackoffSleeping,
    Stopping,
    Stopped,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Running => write!(f, "Running"),
            Self::BackoffSleeping => write!(f, "BackoffSleeping"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Shared metrics the orchestrator reads without touching loop internals.
pub struct LoopMetrics {
    pub ticks: AtomicU64,
    pub signals: AtomicU64,
    pub orders_submitted: AtomicU64,
    pub errors: AtomicU64,
    state: Mutex<LoopState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ticks: u64,
    pub signals: u64,
    pub orders_submitted: u64,
    pub errors: u64,
    pub state: LoopState,
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            signals: AtomicU64::new(0),
            orders_submitted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            state: Mutex::new(LoopState::Initializing),
        }
    }

    pub fn set_state(&self, state: LoopState) {
        *self.state.lock() = state;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            signals: self.signals.load(Ordering::Relaxed),
            orders_submitted: self.orders_submitted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            state: *self.state.lock(),
        }
    }
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error budget
// ---------------------------------------------------------------------------

/// Sliding counter of recent operational errors; feeds the no-trade zones.
pub struct ErrorBudget {
    window: Duration,
    events: VecDeque<Instant>,
}

impl ErrorBudget {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self) {
        self.events.push_back(Instant::now());
        self.trim();
    }

    pub fn count(&mut self) -> u32 {
        self.trim();
        self.events.len() as u32
    }

    pub fn reset(&mut self) {
        self.events.clear();
    }

    fn trim(&mut self) {
        let cutoff = Instant::now() - self.window;
        while self.events.front().map_or(false, |t| *t < cutoff) {
            self.events.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// TradingLoop
// ---------------------------------------------------------------------------

pub struct TradingLoop {
    symbol: String,
    config: Arc<EngineConfig>,
    client: Arc<BybitRestClient>,
    gateway: Arc<dyn ExecutionGateway>,
    registry: Arc<InstrumentRegistry>,
    sizer: PositionSizer,
    meta: MetaLayer,
    positions: Arc<PositionManager>,
    scaled: ScaledEntryManager,
    store: SqliteStore,
    journal: Arc<SignalJournal>,
    timeframe_cache: Arc<TimeframeCache>,
    /// WebSocket-fed candle cache; used when warm, REST otherwise.
    ws_candles: Arc<CandleBuffer>,
    /// WebSocket-fed local books; used when a snapshot has arrived.
    ws_books: Arc<OrderBookManager>,
    stop: Arc<AtomicBool>,
    metrics: Arc<LoopMetrics>,
    error_budget: ErrorBudget,
}

impl TradingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: String,
        config: Arc<EngineConfig>,
        client: Arc<BybitRestClient>,
        gateway: Arc<dyn ExecutionGateway>,
        registry: Arc<InstrumentRegistry>,
        meta: MetaLayer,
        positions: Arc<PositionManager>,
        store: SqliteStore,
        journal: Arc<SignalJournal>,
        timeframe_cache: Arc<TimeframeCache>,
        ws_candles: Arc<CandleBuffer>,
        ws_books: Arc<OrderBookManager>,
        stop: Arc<AtomicBool>,
        metrics: Arc<LoopMetrics>,
    ) -> Self {
        let sizer = PositionSizer::new(config.risk.clone());
        let scaled = ScaledEntryManager::new(config.scaled_entry.clone());
        Self {
            symbol,
            config,
            client,
            gateway,
            registry,
            sizer,
            meta,
            positions,
            scaled,
            store,
            journal,
            timeframe_cache,
            ws_candles,
            ws_books,
            stop,
            metrics,
            error_budget: ErrorBudget::new(ERROR_WINDOW),
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Drive the loop until stopped. Non-recoverable errors surface to the
    /// orchestrator through the returned result.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.metrics.set_state(LoopState::Initializing);
        info!(symbol = %self.symbol, "trading loop initialising");

        // The instrument rule is a hard requirement.
        if self.registry.get(&self.symbol).is_none() {
            self.metrics.set_state(LoopState::Stopped);
            anyhow::bail!("no instrument rule for {}", self.symbol);
        }

        self.metrics.set_state(LoopState::Running);
        info!(symbol = %self.symbol, "trading loop running");

        let mut consecutive_failures: u32 = 0;

        while !self.should_stop() {
            match self.tick().await {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.error_budget.reset();
                    self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
                    self.sleep_interruptible(Duration::from_secs(self.config.tick_interval_secs))
                        .await;
                }
                Err(e) if e.is_retriable() => {
                    consecutive_failures += 1;
                    self.error_budget.record();
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    let _ = self.store.insert_error(
                        Some(&self.symbol),
                        e.kind(),
                        None,
                        &e.to_string(),
                    );

                    let delay = backoff_delay(consecutive_failures);
                    warn!(
                        symbol = %self.symbol,
                        error = %e,
                        failures = consecutive_failures,
                        backoff_ms = delay.as_millis() as u64,
                        "recoverable error — backing off"
                    );
                    self.metrics.set_state(LoopState::BackoffSleeping);
                    self.sleep_interruptible(delay).await;
                    self.metrics.set_state(LoopState::Running);
                }
                Err(EngineError::DataQuality(reason)) => {
                    // Skip the tick; not an operational failure.
                    debug!(symbol = %self.symbol, reason = %reason, "tick skipped (data quality)");
                    self.sleep_interruptible(Duration::from_secs(self.config.tick_interval_secs))
                        .await;
                }
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    let _ = self.store.insert_error(
                        Some(&self.symbol),
                        e.kind(),
                        None,
                        &e.to_string(),
                    );
                    error!(symbol = %self.symbol, error = %e, "non-recoverable loop error");
                    self.metrics.set_state(LoopState::Stopped);
                    return Err(e.into());
                }
            }
        }

        self.metrics.set_state(LoopState::Stopping);
        info!(symbol = %self.symbol, "trading loop stopping");
        self.metrics.set_state(LoopState::Stopped);
        Ok(())
    }

    /// One fetch -> decide -> act -> persist iteration.
    async fn tick(&mut self) -> Result<(), EngineError> {
        // --- 1. fetch market data ------------------------------------------
        // Forming bars are dropped for decisioning in both paths.
        let confirmed = self.fetch_candles().await?;
        let orderbook = self.fetch_orderbook().await?;

        // Derivatives data is optional enrichment; failures do not kill the
        // tick.
        let derivatives = match self.client.get_derivatives_snapshot(&self.symbol).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                debug!(symbol = %self.symbol, error = %e, "derivatives fetch failed");
                None
            }
        };

        // --- 2. features ----------------------------------------------------
        let frame = build_features(
            &self.symbol,
            confirmed,
            Some(&orderbook),
            derivatives.as_ref(),
            self.config.kline_interval_minutes(),
            self.config.environment.is_testnet(),
        )?;

        // --- 3. timeframe caches -------------------------------------------
        self.push_timeframe_bar(&frame);
        if self.config.mtf.enabled {
            self.refresh_mtf_caches().await;
        }

        // Pending scaled-entry levels arm (or expire) off the latest close.
        if let Some(close) = frame.last().map(|r| r.close) {
            self.advance_scaled_entry(close).await;
        }

        // --- 4. meta-layer --------------------------------------------------
        let ctx = FilterContext {
            orderbook_valid: orderbook.is_valid(),
            error_count: self.error_budget.count(),
        };
        let signal = match self.meta.evaluate(&frame, &ctx) {
            Some(signal) => signal,
            None => return Ok(()),
        };
        self.metrics.signals.fetch_add(1, Ordering::Relaxed);

        // --- 5/6. act + persist --------------------------------------------
        self.execute_signal(&frame, signal).await
    }

    /// Fire or expire pending scaled-entry levels for the open position.
    async fn advance_scaled_entry(&mut self, price: f64) {
        if !self.config.scaled_entry.enabled {
            return;
        }

        if self.scaled.is_expired(&self.symbol) {
            let cancelled = self.scaled.cancel_pending(&self.symbol);
            if cancelled > 0 {
                warn!(symbol = %self.symbol, cancelled, "scaled-entry levels expired");
                self.journal
                    .debug(&self.symbol, &format!("{cancelled} entry levels expired"));
            }
            return;
        }

        let position = match self.positions.get_position(&self.symbol) {
            Some(p) => p,
            None => return,
        };

        let (level_number, level_qty) = match self.scaled.next_action(&self.symbol, price) {
            Some(LevelAction::PlaceNow { level_number, qty }) => (level_number, qty),
            _ => return,
        };

        let qty = match self.registry.normalize_qty(&self.symbol, level_qty) {
            Ok(q) => q,
            Err(e) => {
                debug!(symbol = %self.symbol, error = %e, "scaled level qty rejected");
                return;
            }
        };
        if self.registry.validate(&self.symbol, price, qty).is_err() {
            return;
        }

        let side = match position.side {
            PositionSide::Long => crate::types::Side::Buy,
            PositionSide::Short => crate::types::Side::Sell,
        };
        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side,
            order_type: OrderType::Market,
            qty,
            price: Some(price),
            time_in_force: TimeInForce::Ioc,
            order_link_id: None,
            reduce_only: false,
        };
        let result = self.gateway.place_order(request).await;
        if !result.success {
            warn!(
                symbol = %self.symbol,
                level = level_number,
                error = ?result.error,
                "scaled-entry level order failed"
            );
            return;
        }

        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
        let order_id = result.order_id.unwrap_or_default();
        self.scaled
            .mark_executed(&self.symbol, level_number, &order_id, qty, price);
        if let Some(updated) = self.positions.absorb_fill(&self.symbol, qty, price) {
            let mut values = std::collections::BTreeMap::new();
            values.insert("level".to_string(), level_number as f64);
            values.insert("fill_qty".to_string(), qty);
            values.insert("new_qty".to_string(), updated.qty);
            self.journal
                .position_update(&self.symbol, "scaled_entry_fill", &values);
        }
    }

    /// Confirmed candles from the WebSocket buffer when it is warm, the REST
    /// kline endpoint otherwise.
    async fn fetch_candles(&self) -> Result<Vec<Candle>, EngineError> {
        let key = CandleKey {
            symbol: self.symbol.clone(),
            interval: self.config.kline_interval.clone(),
        };
        let cached = self.ws_candles.get_confirmed(&key, self.config.kline_limit);
        if cached.len() >= self.config.kline_limit {
            debug!(symbol = %self.symbol, bars = cached.len(), "using WS candle cache");
            return Ok(cached);
        }

        let candles = self
            .client
            .get_kline(&self.symbol, &self.config.kline_interval, self.config.kline_limit)
            .await?;
        Ok(candles.into_iter().filter(|c| c.confirmed).collect())
    }

    /// Orderbook from the WebSocket local book when a snapshot has arrived,
    /// the REST endpoint otherwise.
    async fn fetch_orderbook(&self) -> Result<OrderbookSnapshot, EngineError> {
        if let Some(snapshot) = self
            .ws_books
            .snapshot(&self.symbol, self.config.orderbook_depth as usize)
        {
            return Ok(snapshot);
        }
        self.client
            .get_orderbook(&self.symbol, self.config.orderbook_depth)
            .await
    }

    /// Push the latest closed bar of the trading interval into the MTF cache.
    fn push_timeframe_bar(&self, frame: &FeatureFrame) {
        if let Some(last) = frame.last() {
            self.timeframe_cache.push(
                &self.config.kline_interval,
                CachedBar {
                    start_time: last.start_time,
                    close: last.close,
                    ema_20: last.ema_20,
                    atr_percent: last.atr_percent,
                },
            );
        }
    }

    /// Maintain the 1m/5m/15m confluence frames with lightweight fetches.
    async fn refresh_mtf_caches(&self) {
        for interval in MTF_INTERVALS {
            if *interval == self.config.kline_interval {
                continue; // already pushed from the main frame
            }
            match self.client.get_kline(&self.symbol, interval, MTF_KLINE_LIMIT).await {
                Ok(candles) => {
                    let confirmed: Vec<Candle> =
                        candles.into_iter().filter(|c| c.confirmed).collect();
                    if confirmed.len() < 21 {
                        continue;
                    }
                    let closes: Vec<f64> = confirmed.iter().map(|c| c.close).collect();
                    let ema = ema_series(&closes, 20);
                    let atr_pct = atr_percent_series(&confirmed, 14);
                    let i = confirmed.len() - 1;
                    if ema[i].is_nan() {
                        continue;
                    }
                    self.timeframe_cache.push(
                        interval,
                        CachedBar {
                            start_time: confirmed[i].start_time,
                            close: confirmed[i].close,
                            ema_20: ema[i],
                            atr_percent: atr_pct[i],
                        },
                    );
                }
                Err(e) => {
                    debug!(symbol = %self.symbol, interval, error = %e, "MTF fetch failed");
                }
            }
        }
    }

    /// Apply the signal-action decision and submit orders.
    pub(crate) async fn execute_signal(
        &mut self,
        frame: &FeatureFrame,
        signal: Signal,
    ) -> Result<(), EngineError> {
        let last_close = frame.last().map(|r| r.close).unwrap_or(signal.entry_price);
        let current = self.positions.get_position(&self.symbol);

        let decision = decide_action(
            current.as_ref(),
            &signal,
            last_close,
            &self.config.signal_actions,
        );

        match decision {
            SignalDecision::Ignore { reason } => {
                info!(symbol = %self.symbol, reason = %reason, "signal dropped by conflict policy");
                self.journal.signal_rejected(
                    &self.symbol,
                    &signal.strategy,
                    &signal.direction.to_string(),
                    signal.confidence,
                    vec![reason],
                    &signal.values,
                );
                self.persist_signal(&signal, false)?;
                Ok(())
            }
            SignalDecision::OpenNew => self.open_new_position(frame, &signal).await,
            SignalDecision::Add { add_qty, .. } => self.add_to_position(&signal, add_qty, last_close).await,
            SignalDecision::Flip { close_qty } => {
                self.flip_position(frame, &signal, close_qty, last_close).await
            }
        }
    }

    async fn open_new_position(
        &mut self,
        frame: &FeatureFrame,
        signal: &Signal,
    ) -> Result<(), EngineError> {
        let side = match PositionSide::from_entry_direction(signal.direction) {
            Some(side) => side,
            None => return Ok(()), // close with no position: nothing to do
        };

        let atr_percent = frame.last().map(|r| r.atr_percent).unwrap_or(f64::NAN);
        let atr = frame.last().map(|r| r.atr).unwrap_or(f64::NAN);

        let equity = self
            .gateway
            .get_account_balance("UNIFIED")
            .await
            .map(|b| b.equity)
            .map_err(|e| EngineError::Network(format!("balance fetch: {e}")))?;

        let open_exposure = self.store.total_open_notional().unwrap_or(0.0);

        let total_qty = self.sizer.size(
            &self.registry,
            &SizingInput {
                symbol: &self.symbol,
                direction: signal.direction,
                equity,
                entry_price: signal.entry_price,
                stop_loss: signal.stop_loss,
                atr_percent,
                open_exposure,
            },
        )?;

        // Scaled entry: the first submission is only the immediate share.
        let levels = self.scaled.plan_entry(
            &self.symbol,
            total_qty,
            if atr_percent.is_finite() { atr_percent } else { 0.0 },
            signal.entry_price,
            if atr.is_finite() { atr } else { 0.0 },
            side,
        );
        let first_level = levels.first().cloned();
        let first_qty = first_level
            .as_ref()
            .map(|l| total_qty * l.percent_of_total / 100.0)
            .unwrap_or(total_qty);

        let qty = self.registry.normalize_qty(&self.symbol, first_qty)?;
        let price = self.registry.normalize_price(&self.symbol, signal.entry_price)?;
        self.registry.validate(&self.symbol, price, qty)?;

        self.journal
            .order_exec_start(&self.symbol, &signal.strategy, &signal.direction.to_string());

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: signal.direction.entry_side(),
            order_type: OrderType::Market,
            qty,
            price: Some(price),
            time_in_force: TimeInForce::Ioc,
            order_link_id: None,
            reduce_only: false,
        };
        let result = self.gateway.place_order(request).await;

        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown".into());
            self.journal
                .order_exec_failed(&self.symbol, &signal.strategy, &error);
            let _ = self
                .store
                .insert_error(Some(&self.symbol), "order", None, &error);
            self.persist_signal(signal, false)?;
            return Err(EngineError::VenueRejection {
                code: 0,
                message: error,
            });
        }

        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
        let order_id = result.order_id.clone().unwrap_or_default();
        self.journal
            .order_exec_success(&self.symbol, &signal.strategy, &order_id);

        if let Some(level) = first_level {
            self.scaled
                .mark_executed(&self.symbol, level.number, &order_id, qty, price);
        }

        let position = self.positions.register_position(
            &self.symbol,
            side,
            qty,
            price,
            Some(signal.stop_loss),
            signal.take_profit,
            &signal.strategy,
        );

        // Server-side stops (paper/backtest enforce them virtually).
        let stop_result = self
            .gateway
            .set_trading_stop(
                &self.symbol,
                Some(signal.stop_loss),
                signal.take_profit,
                TriggerBy::LastPrice,
                TriggerBy::LastPrice,
            )
            .await;
        if !stop_result.success {
            warn!(
                symbol = %self.symbol,
                error = ?stop_result.error,
                "failed to attach server-side stops"
            );
        }

        self.persist_signal(signal, true)?;
        if let Ok(payload) = serde_json::to_string(&position) {
            let _ = self.store.insert_position_snapshot(&self.symbol, &payload);
        }
        Ok(())
    }

    async fn add_to_position(
        &mut self,
        signal: &Signal,
        add_qty: f64,
        last_close: f64,
    ) -> Result<(), EngineError> {
        let qty = self.registry.normalize_qty(&self.symbol, add_qty)?;
        let price = self.registry.normalize_price(&self.symbol, last_close)?;
        self.registry.validate(&self.symbol, price, qty)?;

        self.journal
            .order_exec_start(&self.symbol, &signal.strategy, &signal.direction.to_string());

        let request = OrderRequest {
            symbol: self.symbol.clone(),
            side: signal.direction.entry_side(),
            order_type: OrderType::Market,
            qty,
            price: Some(price),
            time_in_force: TimeInForce::Ioc,
            order_link_id: None,
            reduce_only: false,
        };
        let result = self.gateway.place_order(request).await;

        if !result.success {
            let error = result.error.unwrap_or_else(|| "unknown".into());
            self.journal
                .order_exec_failed(&self.symbol, &signal.strategy, &error);
            self.persist_signal(signal, false)?;
            return Err(EngineError::VenueRejection {
                code: 0,
                message: error,
            });
        }

        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
        if let Some(updated) = self.positions.add_to_position(&self.symbol, qty, price) {
            let mut values = std::collections::BTreeMap::new();
            values.insert("add_qty".to_string(), qty);
            values.insert("new_qty".to_string(), updated.qty);
            values.insert("pyramid_level".to_string(), updated.pyramid_level as f64);
            self.journal.position_update(&self.symbol, "add", &values);
        }
        self.persist_signal(signal, true)?;
        Ok(())
    }

    async fn flip_position(
        &mut self,
        frame: &FeatureFrame,
        signal: &Signal,
        close_qty: f64,
        last_close: f64,
    ) -> Result<(), EngineError> {
        let current = match self.positions.get_position(&self.symbol) {
            Some(p) => p,
            None => return Ok(()),
        };

        // Close the existing position at market (reduce-only).
        let close_request = OrderRequest {
            symbol: self.symbol.clone(),
            side: current.side.close_side(),
            order_type: OrderType::Market,
            qty: close_qty,
            price: Some(last_close),
            time_in_force: TimeInForce::Ioc,
            order_link_id: None,
            reduce_only: true,
        };
        let close_result = self.gateway.place_order(close_request).await;
        if !close_result.success {
            let error = close_result.error.unwrap_or_else(|| "unknown".into());
            self.journal
                .order_exec_failed(&self.symbol, &signal.strategy, &error);
            return Err(EngineError::VenueRejection {
                code: 0,
                message: error,
            });
        }

        self.metrics.orders_submitted.fetch_add(1, Ordering::Relaxed);
        self.positions.close_position(&self.symbol);
        self.scaled.cleanup(&self.symbol);

        let mut values = std::collections::BTreeMap::new();
        values.insert("close_qty".to_string(), close_qty);
        self.journal.position_update(&self.symbol, "flip_close", &values);

        // A plain close signal stops here; a directional flip re-enters.
        if signal.direction == Direction::Close {
            self.persist_signal(signal, true)?;
            return Ok(());
        }

        self.open_new_position(frame, signal).await
    }

    fn persist_signal(&self, signal: &Signal, accepted: bool) -> Result<(), EngineError> {
        let payload = serde_json::to_string(signal)
            .map_err(|e| EngineError::Integrity(format!("signal serialise: {e}")))?;
        self.store
            .insert_signal(
                &self.symbol,
                &signal.strategy,
                &signal.direction.to_string(),
                signal.confidence,
                accepted,
                &payload,
            )
            .map_err(|e| EngineError::Integrity(format!("signal persist: {e}")))?;
        Ok(())
    }

    /// Sleep in short slices so a stop request is honoured promptly.
    async fn sleep_interruptible(&self, total: Duration) {
        let slice = Duration::from_millis(250);
        let deadline = Instant::now() + total;
        while Instant::now() < deadline && !self.should_stop() {
            tokio::time::sleep(slice.min(deadline - Instant::now())).await;
        }
    }
}
