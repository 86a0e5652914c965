//! Executor core - wires positions, risk, the strategy cache and the
//! bartering loop together for one pair strategy.
//!
//! Every call into the venue goes through a `bartering_link_*` wrapper: the
//! wrapper submits the call to the [`LinkBridge`] and turns any failure into
//! a logged `false`/`None`, except contract violations which propagate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::bartering::{
    self, BarteringLink, CancelRequest, InternalUpdate, LinkBridge, NewOrderRequest,
    OrderStatusReport,
};
use crate::core::{
    EngineContext, Error, Leg, Order, OrderEventType, OrderLimits, OrderSnapshot, OrderStatus,
    Result, Security, Side,
};
use crate::ledger::LedgerStore;
use crate::market_snapshot::{MarketSnapshot, SnapshotReader};
use crate::position_cache::{AllocatedPosition, PositionCache};
use crate::risk::{self, RiskFlag, RiskFlags};
use crate::strategy_cache::StrategyCache;

/// Result of [`ExecutorCore::place_new_order`].
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Placed {
        order_id: String,
        venue_order_id: String,
    },
    /// Refused before reaching the venue; an internal reject was recorded.
    Blocked { reject_id: String, flags: RiskFlags },
    /// The venue refused the order; its allocation was returned.
    SendFailed { order_id: String, reason: String },
}

impl OrderOutcome {
    pub fn is_placed(&self) -> bool {
        matches!(self, OrderOutcome::Placed { .. })
    }
}

#[derive(Debug, Clone)]
struct LiveOrder {
    allocation: AllocatedPosition,
    booked_fill: u64,
}

pub struct ExecutorCore {
    ctx: Arc<EngineContext>,
    link: Arc<dyn BarteringLink>,
    bridge: Arc<LinkBridge>,
    strat: Arc<StrategyCache>,
    positions: Arc<PositionCache>,
    rng: Mutex<StdRng>,
    live_orders: Mutex<HashMap<String, LiveOrder>>,
    market: Mutex<[Option<MarketSnapshot>; 2]>,
}

impl ExecutorCore {
    pub fn new(
        ctx: Arc<EngineContext>,
        link: Arc<dyn BarteringLink>,
        bridge: Arc<LinkBridge>,
        strat: Arc<StrategyCache>,
        positions: Arc<PositionCache>,
    ) -> Self {
        let rng = match ctx.config().engine.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            ctx,
            link,
            bridge,
            strat,
            positions,
            rng: Mutex::new(rng),
            live_orders: Mutex::new(HashMap::new()),
            market: Mutex::new([None, None]),
        }
    }

    /// Build the configured connector and its loop, then the executor.
    pub fn launch(
        ctx: Arc<EngineContext>,
        ledger: Arc<dyn LedgerStore>,
        strat: Arc<StrategyCache>,
        positions: Arc<PositionCache>,
    ) -> Result<Self> {
        let config = ctx.config();
        let link = bartering::connect(&config, ledger)?;
        let bridge = Arc::new(LinkBridge::start(config.engine.bridge_queue_capacity)?);
        info!(
            "🚀 Executor {} up for {} via {}",
            ctx.instance_id(),
            strat.key(),
            link.name()
        );
        Ok(Self::new(ctx, link, bridge, strat, positions))
    }

    pub fn strategy(&self) -> &Arc<StrategyCache> {
        &self.strat
    }

    // === IDENTIFIERS ===

    /// Negative running counter followed by the current time in micros.
    pub fn next_internal_reject_id(&self) -> String {
        format!(
            "{}{}",
            self.ctx.next_internal_reject_seq(),
            Utc::now().timestamp_micros()
        )
    }

    pub fn next_client_order_id(&self) -> String {
        format!("{}-{}", self.ctx.instance_id(), self.ctx.next_client_order_seq())
    }

    // === BARTERING LINK WRAPPERS ===

    pub fn bartering_link_place_new_order(&self, req: NewOrderRequest) -> Result<(bool, String)> {
        let link = self.link.clone();
        match self.bridge.submit(async move { link.place_new_order(&req).await }) {
            Ok(res) => Ok(res),
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                error!("bartering_link_place_new_order failed: {}", e);
                Ok((false, e.to_string()))
            }
        }
    }

    pub fn bartering_link_place_cxl_order(&self, req: CancelRequest) -> Result<bool> {
        let link = self.link.clone();
        let res = self
            .bridge
            .submit(async move { link.place_cancel_order(&req).await });
        normalize("bartering_link_place_cxl_order", res, false)
    }

    pub fn bartering_link_internal_order_state_update(&self, update: InternalUpdate) -> Result<bool> {
        let link = self.link.clone();
        let res = self
            .bridge
            .submit(async move { link.internal_order_state_update(&update).await });
        normalize("bartering_link_internal_order_state_update", res, false)
    }

    pub fn bartering_link_get_order_status(&self, order_id: &str) -> Result<Option<OrderStatusReport>> {
        let link = self.link.clone();
        let order_id = order_id.to_string();
        let res = self
            .bridge
            .submit(async move { link.get_order_status(&order_id).await });
        normalize("bartering_link_get_order_status", res, None)
    }

    pub fn bartering_link_is_kill_switch_enabled(&self) -> Result<bool> {
        let link = self.link.clone();
        let res = self
            .bridge
            .submit(async move { link.is_kill_switch_enabled().await });
        normalize("bartering_link_is_kill_switch_enabled", res, false)
    }

    pub fn bartering_link_trigger_kill_switch(&self) -> Result<bool> {
        let link = self.link.clone();
        let res = self
            .bridge
            .submit(async move { link.trigger_kill_switch().await });
        normalize("bartering_link_trigger_kill_switch", res, false)
    }

    pub fn bartering_link_revoke_kill_switch(&self) -> Result<bool> {
        let link = self.link.clone();
        let res = self
            .bridge
            .submit(async move { link.revoke_kill_switch_and_resume().await });
        normalize("bartering_link_revoke_kill_switch", res, false)
    }

    // === CONFIG ===

    /// Re-read the config file and push the kill-switch map into the link.
    pub fn reload_config(&self) -> Result<()> {
        let config = self.ctx.reload()?;
        self.link.reload_config(config.kill_switch);
        Ok(())
    }

    /// Apply the latest stored limits push, if there is one.
    pub fn load_latest_limits(&self, store: &dyn LedgerStore) -> Result<bool> {
        match store.latest_limits(&self.strat.key().to_string())? {
            Some(limits) => Ok(self.strat.set_strat_limits(limits, &self.positions)),
            None => {
                debug!("no stored limits for {}", self.strat.key());
                Ok(false)
            }
        }
    }

    fn order_limits(&self) -> OrderLimits {
        self.strat
            .order_limits()
            .unwrap_or_else(|| self.ctx.config().order_limits())
    }

    // === MARKET DATA ===

    /// Keep the latest snapshot for `leg`. Snapshots for another symbol are
    /// ignored.
    pub fn on_market_update(&self, leg: Leg, snapshot: &MarketSnapshot) -> bool {
        let (security, _) = self.strat.key().leg(leg);
        let symbol = snapshot.symbol();
        if !symbol.eq_ignore_ascii_case(security.as_str()) {
            warn!(
                "market update for {} delivered to {} ({}), ignored",
                symbol, leg, security
            );
            return false;
        }
        self.market.lock()[leg.index()] = Some(*snapshot);
        true
    }

    pub fn poll_market(&self, reader: &mut SnapshotReader, leg: Leg) -> bool {
        match reader.read().copied() {
            Some(snapshot) => self.on_market_update(leg, &snapshot),
            None => false,
        }
    }

    pub fn last_market(&self, leg: Leg) -> Option<MarketSnapshot> {
        self.market.lock()[leg.index()]
    }

    // === ORDERS ===

    /// Run the pre-trade cascade for a new order on `leg` and send it.
    ///
    /// Unacked orders on the leg, an enabled kill switch and every risk rule
    /// are collected into one flag set; only a clean set goes on to acquire
    /// position and reach the venue. The leg's unacked slot is claimed up
    /// front, so concurrent callers on one leg get exactly one order out.
    pub fn place_new_order(&self, leg: Leg, px: f64, qty: u64) -> Result<OrderOutcome> {
        let plan = self
            .strat
            .pair_strat()
            .ok_or_else(|| Error::Contract(format!("no pair strat set for {}", self.strat.key())))?;
        let (security, side) = self.strat.key().leg(leg).clone();
        let symbol = security.as_str();

        let mut flags = RiskFlags::SUCCESS;
        let reservation = self.strat.try_reserve_unack(leg);
        if reservation.is_none() {
            warn!(
                "blocked {} order, {} has unacked orders, {}",
                side,
                leg,
                risk::symbol_side_key(symbol, side)
            );
            flags |= RiskFlag::UnackedLeg;
        }
        if self.bartering_link_is_kill_switch_enabled()? {
            warn!(
                "blocked {} order, kill switch enabled, {}",
                side,
                risk::symbol_side_key(symbol, side)
            );
            flags |= RiskFlag::KillSwitch;
        }
        let limits = self.order_limits();
        flags |= {
            let mut rng = self.rng.lock();
            risk::check_order(plan.strat_mode, &limits, px, qty, symbol, side, &mut *rng)
        };
        let reservation = match reservation {
            Some(reservation) if flags.is_success() => reservation,
            _ => {
                let reject_id = self.reject_internally(&security, side, px, qty, &flags)?;
                return Ok(OrderOutcome::Blocked { reject_id, flags });
            }
        };

        let mut order = Order::new(
            self.next_client_order_id(),
            security.clone(),
            side,
            px,
            qty,
            "",
            plan.instrument_type(leg),
        );
        let (available, allocation) = self.positions.extract_availability(&order);
        let Some(allocation) = allocation.filter(|_| available) else {
            flags |= RiskFlag::PositionUnavailable;
            let reject_id = self.reject_internally(&security, side, px, qty, &flags)?;
            return Ok(OrderOutcome::Blocked { reject_id, flags });
        };
        order.account = allocation.account.clone();
        let order_id = order.id.clone();

        self.strat.add_order(leg, order.clone());
        reservation.commit(&order_id);
        self.live_orders.lock().insert(
            order_id.clone(),
            LiveOrder {
                allocation: allocation.clone(),
                booked_fill: 0,
            },
        );

        let req = NewOrderRequest {
            px,
            qty,
            side,
            bartering_sec_id: security.sec_id.clone(),
            system_sec_id: security.sec_id.clone(),
            instrument_type: order.instrument_type,
            account: order.account.clone(),
            exchange: None,
            text: None,
            client_ord_id: Some(order_id.clone()),
        };
        let (sent, id_or_error) = self.bartering_link_place_new_order(req)?;
        if !sent {
            warn!(
                "{} order {} on {} x {} @ {} not sent: {}",
                side, order_id, security, qty, px, id_or_error
            );
            self.live_orders.lock().remove(&order_id);
            self.positions.return_availability(symbol, &allocation);
            self.bartering_link_internal_order_state_update(InternalUpdate {
                event: OrderEventType::IntReject,
                order_id: order_id.clone(),
                security: Some(security.clone()),
                side: Some(side),
                px: Some(px),
                qty: Some(qty),
                text: Some(format!("{}: {}", RiskFlag::SendFailed.name(), id_or_error)),
            })?;
            let mut snapshot = OrderSnapshot::new(order);
            snapshot.status = OrderStatus::Rejected;
            self.strat.set_order_snapshot(snapshot)?;
            return Ok(OrderOutcome::SendFailed {
                order_id,
                reason: id_or_error,
            });
        }

        self.strat.set_venue_order_id(&order_id, &id_or_error);
        info!(
            "📤 {} {} {} x {} @ {} via {} ({})",
            order_id, side, security, qty, px, allocation.broker, id_or_error
        );
        Ok(OrderOutcome::Placed {
            order_id,
            venue_order_id: id_or_error,
        })
    }

    fn reject_internally(
        &self,
        security: &Security,
        side: Side,
        px: f64,
        qty: u64,
        flags: &RiskFlags,
    ) -> Result<String> {
        let reject_id = self.next_internal_reject_id();
        let recorded = self.bartering_link_internal_order_state_update(InternalUpdate {
            event: OrderEventType::IntReject,
            order_id: reject_id.clone(),
            security: Some(security.clone()),
            side: Some(side),
            px: Some(px),
            qty: Some(qty),
            text: Some(flags.to_string()),
        })?;
        if !recorded {
            warn!("internal reject {} ({}) not recorded", reject_id, flags);
        }
        Ok(reject_id)
    }

    /// Fold a venue update into the strategy cache and positions. Fill deltas
    /// are booked once; an order that is no longer open gives back what it
    /// did not fill.
    pub fn on_order_update(&self, snapshot: OrderSnapshot) -> Result<DateTime<Utc>> {
        let order_id = snapshot.order.id.clone();
        let filled = snapshot.filled_qty;
        let still_open = snapshot.status.is_open();
        let ticker = snapshot.order.security.sec_id.clone();
        let ts = self.strat.set_order_snapshot(snapshot)?;

        let mut live_orders = self.live_orders.lock();
        let Some(live) = live_orders.get_mut(&order_id) else {
            return Ok(ts);
        };
        let delta = filled.saturating_sub(live.booked_fill);
        if delta > 0 {
            self.positions.apply_fill(&live.allocation, delta);
            live.booked_fill = filled;
        }
        if !still_open {
            self.positions.return_availability(&ticker, &live.allocation);
            live_orders.remove(&order_id);
            debug!("order {} closed, allocation released", order_id);
        }
        Ok(ts)
    }

    /// Ask the venue for `order_id`'s status and fold it in. `None` when the
    /// venue does not know the order.
    pub fn refresh_order(&self, order_id: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(mut snapshot) = self.strat.order_snapshot(order_id) else {
            warn!("refresh for unknown order {}", order_id);
            return Ok(None);
        };
        let venue_id = snapshot
            .order
            .venue_order_id
            .clone()
            .unwrap_or_else(|| order_id.to_string());
        let Some(report) = self.bartering_link_get_order_status(&venue_id)? else {
            return Ok(None);
        };
        snapshot.status = report.status;
        snapshot.filled_qty = report.filled_qty;
        snapshot.fill_notional = report.filled_qty as f64 * snapshot.order.px;
        snapshot.avg_fill_px = if report.filled_qty > 0 {
            snapshot.order.px
        } else {
            0.0
        };
        self.on_order_update(snapshot).map(Some)
    }

    /// Send queued cancels. Returns the order ids whose cancel was accepted.
    /// A contract violation stops the drain; cancels not yet sent stay
    /// pending for the next call.
    pub fn drain_cancel_queue(&self, force_cxl_only: bool) -> Result<Vec<String>> {
        self.strat.process_cxl_request(force_cxl_only, |cxl| {
            let (venue_id, account) = match self.strat.order(&cxl.order_id) {
                Some(order) => (
                    order.venue_order_id.unwrap_or_else(|| cxl.order_id.clone()),
                    Some(order.account).filter(|a| !a.is_empty()),
                ),
                None => (cxl.order_id.clone(), None),
            };
            self.bartering_link_place_cxl_order(CancelRequest {
                order_id: venue_id,
                side: Some(cxl.side),
                bartering_sec_id: Some(cxl.security.sec_id.clone()),
                system_sec_id: Some(cxl.security.sec_id.clone()),
                account,
            })
        })
    }
}

fn normalize<T>(call: &str, res: Result<T>, failed: T) -> Result<T> {
    match res {
        Ok(value) => Ok(value),
        Err(e) if e.is_contract_violation() => {
            error!("{}: {}", call, e);
            Err(e)
        }
        Err(e) => {
            error!("{} failed: {}", call, e);
            Ok(failed)
        }
    }
}
