// =============================================================================
// Meridian Perp Engine — Main Entry Point
// =============================================================================
//
// The engine starts on testnet in paper mode unless the config file (or env
// overrides) explicitly say otherwise. Live mode requires API credentials.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian_bot::bot::{MultiSymbolOrchestrator, OrchestratorDeps};
use meridian_bot::config::EngineConfig;
use meridian_bot::exchange::{
    run_private_stream, run_public_stream, BybitRestClient, InstrumentRegistry,
};
use meridian_bot::market_data::{CandleBuffer, OrderBookManager};
use meridian_bot::execution::{
    BacktestGateway, ExecutionGateway, HaltFlag, KillSwitchManager, LiveGateway, OrderManager,
    PaperGateway, PositionManager,
};
use meridian_bot::exchange::PrivateEvent;
use meridian_bot::storage::recovery::recover_state;
use meridian_bot::storage::{SignalJournal, SqliteStore};
use meridian_bot::types::TradeMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Meridian Perp Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load("meridian_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();
    config.validate()?;

    info!(
        symbols = ?config.symbols,
        mode = %config.mode,
        environment = %config.environment,
        "engine configured"
    );

    let api_key = std::env::var("BYBIT_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BYBIT_API_SECRET").unwrap_or_default();
    if config.mode == TradeMode::Live && (api_key.is_empty() || api_secret.is_empty()) {
        anyhow::bail!("live mode requires BYBIT_API_KEY and BYBIT_API_SECRET");
    }

    // ── 2. Core services ─────────────────────────────────────────────────
    let store = SqliteStore::open(&config.db_path)?;
    let journal = Arc::new(SignalJournal::open(&config.journal_path)?);
    let client = Arc::new(BybitRestClient::new(
        api_key.clone(),
        api_secret.clone(),
        config.environment,
    ));

    // Instrument registry: fallback table first, venue catalog if reachable.
    let registry = Arc::new(InstrumentRegistry::with_fallback());
    match registry.refresh(&client).await {
        Ok(count) => info!(count, "instrument registry ready"),
        Err(e) => warn!(error = %e, "instrument refresh failed — using fallback table"),
    }

    // Halt flag mirrors the persisted kill-switch state across restarts.
    let halt = HaltFlag::new(store.trading_disabled()?);
    if halt.is_halted() {
        warn!("persisted kill-switch state is HALTED — orders will be refused until reset");
    }

    // ── 3. Execution gateway by mode ─────────────────────────────────────
    let order_manager = Arc::new(OrderManager::new(store.clone()));
    let gateway: Arc<dyn ExecutionGateway> = match config.mode {
        TradeMode::Live => Arc::new(LiveGateway::new(
            client.clone(),
            order_manager.clone(),
            halt.clone(),
        )),
        TradeMode::Paper => Arc::new(PaperGateway::new(
            config.backtest_initial_balance,
            halt.clone(),
        )),
        TradeMode::Backtest => Arc::new(BacktestGateway::new(
            config.backtest_initial_balance,
            halt.clone(),
        )),
    };

    let positions = Arc::new(PositionManager::new(store.clone()));

    // ── 4. State recovery ────────────────────────────────────────────────
    let report = recover_state(gateway.as_ref(), &store, &journal).await?;
    if report.has_discrepancies() {
        warn!(?report, "state recovery reported discrepancies — inspect the journal");
    }
    let loaded = positions.load_from_store()?;
    info!(positions = loaded, "positions loaded from store");

    // ── 5. Kill switch ───────────────────────────────────────────────────
    let kill_switch = Arc::new(KillSwitchManager::new(
        gateway.clone(),
        store.clone(),
        halt.clone(),
        config.symbols.clone(),
    ));

    // ── 6. Market-data WebSocket streams ─────────────────────────────────
    let ws_candles = Arc::new(CandleBuffer::new(500));
    let ws_books = Arc::new(OrderBookManager::new());
    {
        let environment = config.environment;
        let symbols = config.symbols.clone();
        let mut intervals = vec![config.kline_interval.clone()];
        for tf in ["1", "5", "15"] {
            if !intervals.iter().any(|i| i.as_str() == tf) {
                intervals.push(tf.to_string());
            }
        }
        let depth = config.orderbook_depth;
        let candles = ws_candles.clone();
        let books = ws_books.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = run_public_stream(
                    environment,
                    &symbols,
                    &intervals,
                    depth,
                    &candles,
                    &books,
                )
                .await
                {
                    error!(error = %e, "public WebSocket error — reconnecting in 5s");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
        info!("public market-data streams launched");
    }

    // ── 7. Private WebSocket receiver (live mode) ────────────────────────
    if config.mode == TradeMode::Live {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<PrivateEvent>(256);
        let environment = config.environment;
        let ws_key = api_key.clone();
        let ws_secret = api_secret.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    run_private_stream(environment, &ws_key, &ws_secret, tx.clone()).await
                {
                    error!(error = %e, "private WebSocket error — reconnecting in 5s");
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });

        let om = order_manager.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    PrivateEvent::Order(update) => {
                        om.reconcile(&update);
                    }
                    PrivateEvent::Execution(fill) => {
                        om.apply_execution(&fill);
                    }
                    PrivateEvent::Position { symbol, qty, .. } => {
                        info!(symbol = %symbol, qty, "position update from venue");
                    }
                }
            }
        });
        info!("private WebSocket receiver launched");
    }

    // ── 8. Orchestrator ──────────────────────────────────────────────────
    let config = Arc::new(config);
    let deps = OrchestratorDeps {
        client,
        gateway,
        registry,
        store: store.clone(),
        journal,
        positions,
        ws_candles,
        ws_books,
        kill_switch: Some(kill_switch.clone()),
    };
    let mut orchestrator = MultiSymbolOrchestrator::new(config.clone(), deps);
    orchestrator.initialize();
    orchestrator.start();

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    orchestrator.stop().await;

    let status = kill_switch.status();
    info!(
        halted = status.halted,
        activations = status.activation_count,
        "Meridian Perp Engine shut down complete."
    );
    Ok(())
}
