use std::collections::HashMap;
use std::sync::Arc;

use pairtx::bartering::{BarteringLink, LinkBridge, LogSimulator};
use pairtx::core::config::{FallbackConfig, FallbackRoute, KillSwitchConfig};
use pairtx::core::{
    Broker, BrokerPosition, BrokerRoute, InstrumentType, Leg, OrderEventType, OrderLimits,
    OrderStatus, Position, PositionType, Route, Security, Side, StratMode,
};
use pairtx::ledger::InMemoryLedgerStore;
use pairtx::position_cache::PositionCache;
use pairtx::risk::{self, RiskFlag};
use pairtx::strategy_cache::{PairStrat, PairStratKey, StratLimits, StrategyCacheRegistry};
use pairtx::{Config, EngineContext, ExecutorCore, OrderOutcome};

fn session(min_notional: f64) -> (ExecutorCore, Arc<InMemoryLedgerStore>, Arc<PositionCache>) {
    let mut config = Config::default();
    config.engine.instance_id = Some("it".into());
    config.engine.rng_seed = Some(1);
    config.risk.min_chore_notional = min_notional;
    config.fallback = FallbackConfig {
        equity: Some(FallbackRoute {
            broker: "bkr_fb".into(),
            route: Route::Qfii,
        }),
        convertible_bond: None,
    };
    let ctx = Arc::new(EngineContext::new(config));

    let positions = Arc::new(PositionCache::new());
    positions.start(
        vec![
            Broker::new(
                "BKR_MAIN",
                vec![BrokerRoute {
                    instrument_type: InstrumentType::Equity,
                    route: Route::Connect,
                    account: "MAIN".into(),
                }],
            ),
            Broker::new(
                "BKR_FB",
                vec![BrokerRoute {
                    instrument_type: InstrumentType::Equity,
                    route: Route::Qfii,
                    account: "FB".into(),
                }],
            ),
        ],
        vec![
            BrokerPosition {
                broker: "BKR_MAIN".into(),
                security: Security::ticker("EQT_SEC_1"),
                position: Position::new(PositionType::Sod, 100),
            },
            BrokerPosition {
                broker: "BKR_FB".into(),
                security: Security::ticker("EQT_SEC_1"),
                position: Position::new(PositionType::Sod, 500),
            },
        ],
        HashMap::new(),
        HashMap::new(),
        HashMap::new(),
        ctx.config().fallback,
    );

    let registry = StrategyCacheRegistry::new();
    let strat = registry.get_or_create(&PairStratKey::new(
        Security::ticker("CB_SEC_1"),
        Side::Buy,
        Security::ticker("EQT_SEC_1"),
        Side::Sell,
    ));
    strat.set_pair_strat(
        PairStrat {
            leg1_instrument: InstrumentType::ConvertibleBond,
            leg2_instrument: InstrumentType::Equity,
            strat_mode: StratMode::Normal,
            force_cancel: false,
        },
        1,
    );

    let ledger = Arc::new(InMemoryLedgerStore::new());
    let link: Arc<dyn BarteringLink> = Arc::new(LogSimulator::new(
        "127.0.0.1",
        8040,
        KillSwitchConfig::default(),
        ledger.clone(),
    ));
    let bridge = Arc::new(LinkBridge::start(16).unwrap());
    let exec = ExecutorCore::new(ctx, link, bridge, strat, positions.clone());
    (exec, ledger, positions)
}

#[test]
fn min_notional_blocks_then_price_raise_passes() {
    let limits = OrderLimits {
        min_chore_notional: 2_000.0,
        ..OrderLimits::default()
    };
    let flags = risk::check_min_chore_notional_normal(&limits, 10.0 * 100.0, "EQT_SEC_1", Side::Sell);
    assert!(flags.contains(RiskFlag::MinNotional));
    let flags = risk::check_min_chore_notional_normal(&limits, 25.0 * 100.0, "EQT_SEC_1", Side::Sell);
    assert!(flags.is_success());

    let (exec, ledger, _) = session(2_000.0);
    let blocked = exec.place_new_order(Leg::Two, 10.0, 100).unwrap();
    let OrderOutcome::Blocked { reject_id, flags } = blocked else {
        panic!("expected the 1000 notional order to be blocked");
    };
    assert!(flags.contains(RiskFlag::MinNotional));
    let rejects = ledger.entries_for(&reject_id);
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].event, OrderEventType::IntReject);
    assert_eq!(rejects[0].text.as_deref(), Some("MIN_NOTIONAL_FAIL"));

    assert!(exec.place_new_order(Leg::Two, 25.0, 100).unwrap().is_placed());
}

#[test]
fn second_order_goes_to_fallback_broker_after_ack() {
    let (exec, _, positions) = session(1_000.0);

    let OrderOutcome::Placed { order_id, .. } = exec.place_new_order(Leg::Two, 25.0, 100).unwrap() else {
        panic!("first order should be placed");
    };
    let mut snap = exec.strategy().order_snapshot(&order_id).unwrap();
    snap.status = OrderStatus::Acked;
    exec.on_order_update(snap).unwrap();

    // BKR_MAIN has nothing left; BKR_FB is both next in line and the fallback
    let OrderOutcome::Placed { order_id: second, .. } = exec.place_new_order(Leg::Two, 25.0, 200).unwrap() else {
        panic!("second order should be placed");
    };
    assert_eq!(exec.strategy().order(&second).unwrap().account, "FB");
    let fb = positions.position("bkr_fb", "EQT_SEC_1", PositionType::Sod).unwrap();
    assert_eq!((fb.available_size, fb.allocated_size), (300, 200));
}

#[test]
fn stored_limits_are_applied_once() {
    let (exec, ledger, _) = session(1_000.0);
    let key = exec.strategy().key().to_string();
    ledger.put_limits(
        &key,
        StratLimits {
            seq: 4,
            order_limits: OrderLimits {
                max_chore_qty: 50,
                ..OrderLimits::default()
            },
            brokers: vec![],
        },
    );
    assert!(exec.load_latest_limits(ledger.as_ref()).unwrap());
    // same seq again is stale
    assert!(!exec.load_latest_limits(ledger.as_ref()).unwrap());

    let outcome = exec.place_new_order(Leg::Two, 50.0, 60).unwrap();
    assert!(matches!(
        outcome,
        OrderOutcome::Blocked { flags, .. } if flags.contains(RiskFlag::MaxQty)
    ));
}
