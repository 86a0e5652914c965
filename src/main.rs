use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

use pairtx::core::config::FallbackConfig;
use pairtx::core::{
    Broker, BrokerPosition, BrokerRoute, InstrumentType, Leg, Position, PositionType, Route,
    Security, Side,
};
use pairtx::ledger::InMemoryLedgerStore;
use pairtx::market_snapshot::{Quote, SnapshotReader, SnapshotWriter, TopOfBook};
use pairtx::position_cache::PositionCache;
use pairtx::strategy_cache::{CancelOrder, PairStrat, PairStratKey, StrategyCacheRegistry};
use pairtx::{Config, EngineContext, ExecutorCore, OrderOutcome};

const LEG1: &str = "CB_SEC_1";
const LEG2: &str = "EQT_SEC_1";

fn main() -> anyhow::Result<()> {
    // 1. Config first: it carries the fallback log level
    let config_path = std::env::args().nth(1);
    let ctx = match &config_path {
        Some(path) => EngineContext::from_file(Path::new(path))?,
        None => EngineContext::new(Config::load_default()),
    };
    let ctx = Arc::new(ctx);
    let config = ctx.config();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.engine.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!(
        "🦀 PairTX executor {} starting (mode {:?}, link {:?})",
        ctx.instance_id(),
        config.engine.strat_mode,
        config.engine.bartering_link
    );

    // 2. Positions
    let positions = Arc::new(PositionCache::new());
    positions.start(
        vec![Broker::new(
            "DEMO",
            vec![
                BrokerRoute {
                    instrument_type: InstrumentType::ConvertibleBond,
                    route: Route::Qfii,
                    account: "DEMO_CB".into(),
                },
                BrokerRoute {
                    instrument_type: InstrumentType::Equity,
                    route: Route::Connect,
                    account: "DEMO_EQT".into(),
                },
            ],
        )],
        vec![BrokerPosition {
            broker: "DEMO".into(),
            security: Security::ticker(LEG2),
            position: Position::new(PositionType::Sod, 10_000),
        }],
        HashMap::new(),
        HashMap::new(),
        HashMap::new(),
        FallbackConfig::default(),
    );

    // 3. Strategy session
    let registry = StrategyCacheRegistry::new();
    let key = PairStratKey::new(
        Security::ticker(LEG1),
        Side::Buy,
        Security::ticker(LEG2),
        Side::Sell,
    );
    let strat = registry.get_or_create(&key);
    strat.set_pair_strat(
        PairStrat {
            leg1_instrument: InstrumentType::ConvertibleBond,
            leg2_instrument: InstrumentType::Equity,
            strat_mode: config.engine.strat_mode,
            force_cancel: false,
        },
        1,
    );

    let ledger = Arc::new(InMemoryLedgerStore::new());
    let executor = Arc::new(ExecutorCore::launch(
        ctx.clone(),
        ledger.clone(),
        strat.clone(),
        positions,
    )?);

    // 4. Market data producer
    let shm_path = config.shm.path();
    let mut writer = SnapshotWriter::create(&shm_path, LEG2)?;
    let producer = std::thread::spawn(move || -> pairtx::Result<()> {
        for tick in 0..20 {
            let px = 24.0 + tick as f64 * 0.1;
            writer.set_top_of_book(TopOfBook {
                bid: Quote {
                    px,
                    qty: 1_000,
                    ..Quote::default()
                },
                ask: Quote {
                    px: px + 0.05,
                    qty: 800,
                    ..Quote::default()
                },
                ..TopOfBook::default()
            })?;
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    });

    // 5. Worker: quote leg2 off the book until one order goes out
    let mut reader = SnapshotReader::open(&shm_path)?;
    let mut placed = None;
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(10));
        if !executor.poll_market(&mut reader, Leg::Two) {
            continue;
        }
        let Some(px) = executor.last_market(Leg::Two).and_then(|s| s.best_ask_px()) else {
            continue;
        };
        match executor.place_new_order(Leg::Two, px, 100)? {
            OrderOutcome::Placed { order_id, .. } => {
                placed = Some(order_id);
                break;
            }
            OrderOutcome::Blocked { flags, reject_id } => {
                tracing::info!("order blocked ({}), reject id {}", flags, reject_id);
            }
            OrderOutcome::SendFailed { order_id, reason } => {
                tracing::warn!("order {} not sent: {}", order_id, reason);
            }
        }
    }

    if let Some(order_id) = placed {
        executor.refresh_order(&order_id)?;
        strat.push_cancel_order(CancelOrder::new(&order_id, Security::ticker(LEG2), Side::Sell));
        let cancelled = executor.drain_cancel_queue(false)?;
        tracing::info!("🧹 cancels sent: {:?}", cancelled);
        executor.refresh_order(&order_id)?;
    }

    match producer.join() {
        Ok(res) => res?,
        Err(_) => anyhow::bail!("market data producer panicked"),
    }

    tracing::info!(
        "✅ Session done: {} ledger entries, pause requested: {}",
        ledger.entries().len(),
        strat.is_pause_requested()
    );
    Ok(())
}
