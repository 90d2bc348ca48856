// =============================================================================
// Multi-symbol orchestrator — one independent trading loop per symbol
// =============================================================================
//
// On initialize, each symbol receives NEW strategy instances (never shared)
// and its own trading loop. On start, loops launch as parallel workers under
// a concurrency cap while a health monitor logs liveness every
// check_interval. On stop, each loop's stop flag is raised and the tasks are
// joined with a timeout. A crashed worker is recorded; with stop_on_error the
// orchestrator halts all other workers too.
//
// The orchestrator never reaches into a loop's internals: it talks through
// the public stop flag and reads the metrics snapshot.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::exchange::{BybitRestClient, InstrumentRegistry};
use crate::execution::{ExecutionGateway, KillSwitchManager, PositionManager};
use crate::filters::NoTradeZones;
use crate::market_data::{CandleBuffer, OrderBookManager, TimeframeCache};
use crate::storage::{SignalJournal, SqliteStore};
use crate::strategy::{ConfidenceScaler, MetaLayer, StrategyFactory};

use super::trading_loop::{LoopMetrics, MetricsSnapshot, TradingLoop};

/// A crash record kept per symbol.
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub at: chrono::DateTime<Utc>,
    pub error: String,
}

struct Worker {
    symbol: String,
    stop: Arc<AtomicBool>,
    metrics: Arc<LoopMetrics>,
    join: Option<JoinHandle<()>>,
}

/// Shared dependencies handed to every loop. Strategies are NOT part of this
/// bundle: they are constructed fresh per symbol.
pub struct OrchestratorDeps {
    pub client: Arc<BybitRestClient>,
    pub gateway: Arc<dyn ExecutionGateway>,
    pub registry: Arc<InstrumentRegistry>,
    pub store: SqliteStore,
    pub journal: Arc<SignalJournal>,
    pub positions: Arc<PositionManager>,
    /// WebSocket-fed market data, shared read-mostly across loops.
    pub ws_candles: Arc<CandleBuffer>,
    pub ws_books: Arc<OrderBookManager>,
    /// Activated on a worker crash when stop_on_error is set.
    pub kill_switch: Option<Arc<KillSwitchManager>>,
}

pub struct MultiSymbolOrchestrator {
    config: Arc<EngineConfig>,
    deps: OrchestratorDeps,
    workers: Vec<Worker>,
    loops: Vec<(String, TradingLoop)>,
    errors: Arc<RwLock<HashMap<String, Vec<WorkerError>>>>,
    running: Arc<AtomicBool>,
}

impl MultiSymbolOrchestrator {
    pub fn new(config: Arc<EngineConfig>, deps: OrchestratorDeps) -> Self {
        Self {
            config,
            deps,
            workers: Vec::new(),
            loops: Vec::new(),
            errors: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Construct one loop per symbol, each with fresh strategy instances.
    pub fn initialize(&mut self) {
        info!(symbols = ?self.config.symbols, "initialising multi-symbol orchestrator");

        for symbol in self.config.symbols.clone() {
            // Per-symbol strategy instances — the isolation contract.
            let strategies = StrategyFactory::create_all();
            info!(
                symbol = %symbol,
                strategies = strategies.len(),
                "created per-symbol strategy instances"
            );

            let timeframe_cache = Arc::new(TimeframeCache::new());
            let meta = MetaLayer::new(
                strategies,
                NoTradeZones::new(
                    self.config.no_trade_zones.clone(),
                    self.config.environment,
                ),
                ConfidenceScaler::new(self.config.confidence_scaler.clone()),
                self.config.mtf.clone(),
                timeframe_cache.clone(),
                self.deps.journal.clone(),
            );

            let stop = Arc::new(AtomicBool::new(false));
            let metrics = Arc::new(LoopMetrics::new());

            let trading_loop = TradingLoop::new(
                symbol.clone(),
                self.config.clone(),
                self.deps.client.clone(),
                self.deps.gateway.clone(),
                self.deps.registry.clone(),
                meta,
                self.deps.positions.clone(),
                self.deps.store.clone(),
                self.deps.journal.clone(),
                timeframe_cache,
                self.deps.ws_candles.clone(),
                self.deps.ws_books.clone(),
                stop.clone(),
                metrics.clone(),
            );

            self.workers.push(Worker {
                symbol: symbol.clone(),
                stop,
                metrics,
                join: None,
            });
            self.errors.write().entry(symbol.clone()).or_default();
            self.loops.push((symbol, trading_loop));
        }

        info!(count = self.workers.len(), "all trading loops initialised");
    }

    /// Launch every loop as a parallel worker plus the health monitor.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("orchestrator already running");
            return;
        }

        let cap = self
            .config
            .max_concurrent
            .unwrap_or(self.config.symbols.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));

        let loops = std::mem::take(&mut self.loops);
        for (symbol, mut trading_loop) in loops {
            let permit_source = semaphore.clone();
            let errors = self.errors.clone();
            let stop_on_error = self.config.stop_on_error;
            let all_stops: Vec<Arc<AtomicBool>> =
                self.workers.iter().map(|w| w.stop.clone()).collect();
            let kill_switch = self.deps.kill_switch.clone();
            let sym = symbol.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit_source
                    .acquire()
                    .await
                    .expect("semaphore never closed");
                info!(symbol = %sym, "worker started");

                if let Err(e) = trading_loop.run().await {
                    error!(symbol = %sym, error = %e, "trading loop crashed");
                    errors.write().entry(sym.clone()).or_default().push(WorkerError {
                        at: Utc::now(),
                        error: e.to_string(),
                    });
                    if stop_on_error {
                        warn!(symbol = %sym, "stop_on_error set — halting all workers");
                        for stop in &all_stops {
                            stop.store(true, Ordering::SeqCst);
                        }
                        if let Some(ks) = &kill_switch {
                            let report = ks
                                .activate(&format!("worker_crash:{sym}"), None, true, true)
                                .await;
                            warn!(
                                success = report.success,
                                already_halted = report.already_halted,
                                "kill switch activated after worker crash"
                            );
                        }
                    }
                }
                info!(symbol = %sym, "worker finished");
            });

            if let Some(worker) = self.workers.iter_mut().find(|w| w.symbol == symbol) {
                worker.join = Some(handle);
            }
        }

        // Health monitor.
        let monitor_workers: Vec<(String, Arc<LoopMetrics>)> = self
            .workers
            .iter()
            .map(|w| (w.symbol.clone(), w.metrics.clone()))
            .collect();
        let monitor_errors = self.errors.clone();
        let running = self.running.clone();
        let check_interval = Duration::from_secs(self.config.check_interval_secs);

        tokio::spawn(async move {
            info!("health monitor started");
            while running.load(Ordering::SeqCst) {
                tokio::time::sleep(check_interval).await;
                for (symbol, metrics) in &monitor_workers {
                    let snapshot = metrics.snapshot();
                    let error_count = monitor_errors
                        .read()
                        .get(symbol)
                        .map(|v| v.len())
                        .unwrap_or(0);
                    info!(
                        symbol = %symbol,
                        state = %snapshot.state,
                        ticks = snapshot.ticks,
                        signals = snapshot.signals,
                        orders = snapshot.orders_submitted,
                        errors = error_count,
                        "health check"
                    );
                }
            }
            info!("health monitor finished");
        });

        info!(workers = self.workers.len(), cap, "orchestrator started");
    }

    /// Signal every loop to stop and join with a timeout.
    pub async fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping orchestrator");

        for worker in &self.workers {
            worker.stop.store(true, Ordering::SeqCst);
        }

        let timeout = Duration::from_secs(self.config.join_timeout_secs);
        for worker in self.workers.iter_mut() {
            if let Some(handle) = worker.join.take() {
                match tokio::time::timeout(timeout, handle).await {
                    Ok(Ok(())) => info!(symbol = %worker.symbol, "worker joined"),
                    Ok(Err(e)) => warn!(symbol = %worker.symbol, error = %e, "worker panicked"),
                    Err(_) => {
                        warn!(symbol = %worker.symbol, "worker did not terminate within timeout")
                    }
                }
            }
        }

        info!("orchestrator stopped");
    }

    /// Metrics snapshots by symbol, for reporting.
    pub fn metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.workers
            .iter()
            .map(|w| (w.symbol.clone(), w.metrics.snapshot()))
            .collect()
    }

    /// Recorded crashes by symbol.
    pub fn worker_errors(&self) -> HashMap<String, Vec<WorkerError>> {
        self.errors.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{BacktestGateway, HaltFlag};
    use crate::types::Environment;

    fn deps(dir: &tempfile::TempDir) -> OrchestratorDeps {
        let store = SqliteStore::open(dir.path().join("orch.db")).unwrap();
        let journal = Arc::new(SignalJournal::open(dir.path().join("j.jsonl")).unwrap());
        let halt = HaltFlag::new(false);
        OrchestratorDeps {
            client: Arc::new(BybitRestClient::new("k", "s", Environment::Testnet)),
            gateway: Arc::new(BacktestGateway::new(10_000.0, halt)),
            registry: Arc::new(InstrumentRegistry::with_fallback()),
            store: store.clone(),
            journal,
            positions: Arc::new(PositionManager::new(store)),
            ws_candles: Arc::new(CandleBuffer::new(500)),
            ws_books: Arc::new(OrderBookManager::new()),
            kill_switch: None,
        }
    }

    fn config(symbols: &[&str]) -> Arc<EngineConfig> {
        let mut config = EngineConfig::default();
        config.symbols = symbols.iter().map(|s| s.to_string()).collect();
        Arc::new(config)
    }

    #[tokio::test]
    async fn initialize_creates_one_loop_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = MultiSymbolOrchestrator::new(
            config(&["BTCUSDT", "ETHUSDT", "XRPUSDT"]),
            deps(&dir),
        );
        orch.initialize();
        assert_eq!(orch.loops.len(), 3);
        assert_eq!(orch.workers.len(), 3);
        assert_eq!(orch.metrics().len(), 3);
    }

    #[tokio::test]
    async fn loops_have_distinct_stop_flags_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch =
            MultiSymbolOrchestrator::new(config(&["BTCUSDT", "ETHUSDT"]), deps(&dir));
        orch.initialize();

        // Raising one stop flag must not affect the other.
        orch.workers[0].stop.store(true, Ordering::SeqCst);
        assert!(orch.workers[0].stop.load(Ordering::SeqCst));
        assert!(!orch.workers[1].stop.load(Ordering::SeqCst));

        let m0 = Arc::as_ptr(&orch.workers[0].metrics) as usize;
        let m1 = Arc::as_ptr(&orch.workers[1].metrics) as usize;
        assert_ne!(m0, m1);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut orch = MultiSymbolOrchestrator::new(config(&["BTCUSDT"]), deps(&dir));
        orch.initialize();
        orch.stop().await;
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn start_and_stop_joins_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config_inner = EngineConfig::default();
        config_inner.symbols = vec!["BTCUSDT".to_string()];
        config_inner.join_timeout_secs = 5;
        let mut orch = MultiSymbolOrchestrator::new(Arc::new(config_inner), deps(&dir));
        orch.initialize();
        orch.start();
        assert!(orch.is_running());

        // Give the worker a moment to enter its loop, then stop.
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.stop().await;
        assert!(!orch.is_running());
    }
}
