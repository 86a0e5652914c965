//! Strategy cache - per pair-strategy session state.
//!
//! Holds both legs' order snapshots, unacked sets, the cancel queue and the
//! plan/limits pushed by the strategy service. All mutation goes through one
//! reentrant lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::{
    Broker, Error, InstrumentType, Leg, Order, OrderLimits, OrderSnapshot, OrderStatus, Result,
    Security, Side, StratMode,
};
use crate::position_cache::PositionCache;
use crate::risk::symbol_side_key;

/// (leg1 security + side, leg2 security + side)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairStratKey {
    pub leg1: (Security, Side),
    pub leg2: (Security, Side),
}

impl PairStratKey {
    pub fn new(leg1: Security, leg1_side: Side, leg2: Security, leg2_side: Side) -> Self {
        Self {
            leg1: (leg1, leg1_side),
            leg2: (leg2, leg2_side),
        }
    }

    pub fn leg(&self, leg: Leg) -> &(Security, Side) {
        match leg {
            Leg::One => &self.leg1,
            Leg::Two => &self.leg2,
        }
    }

    pub fn leg_for(&self, security: &Security, side: Side) -> Option<Leg> {
        if self.leg1.0 == *security && self.leg1.1 == side {
            Some(Leg::One)
        } else if self.leg2.0 == *security && self.leg2.1 == side {
            Some(Leg::Two)
        } else {
            None
        }
    }
}

impl fmt::Display for PairStratKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}~{}-{}",
            self.leg1.0, self.leg1.1, self.leg2.0, self.leg2.1
        )
    }
}

/// Strategy plan as pushed by the strategy service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairStrat {
    pub leg1_instrument: InstrumentType,
    pub leg2_instrument: InstrumentType,
    pub strat_mode: StratMode,
    /// Global force flag for `force_cxl_only` draining
    pub force_cancel: bool,
}

impl PairStrat {
    pub fn instrument_type(&self, leg: Leg) -> InstrumentType {
        match leg {
            Leg::One => self.leg1_instrument,
            Leg::Two => self.leg2_instrument,
        }
    }
}

/// Limits push; `brokers` carries refreshed consumable limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StratLimits {
    pub seq: u64,
    pub order_limits: OrderLimits,
    pub brokers: Vec<Broker>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: String,
    pub security: Security,
    pub side: Side,
    pub force_cancel: bool,
    pub create_time: DateTime<Utc>,
}

impl CancelOrder {
    pub fn new(order_id: impl Into<String>, security: Security, side: Side) -> Self {
        Self {
            order_id: order_id.into(),
            security,
            side,
            force_cancel: false,
            create_time: Utc::now(),
        }
    }

    pub fn forced(mut self) -> Self {
        self.force_cancel = true;
        self
    }
}

const UNACK_RESERVED: &str = "<reserved>";

/// Unacked slot on one leg, held while an order is being vetted.
pub struct UnackReservation<'a> {
    cache: &'a StrategyCache,
    leg: Leg,
    held: bool,
}

impl UnackReservation<'_> {
    pub fn leg(&self) -> Leg {
        self.leg
    }

    /// Swap the placeholder for `order_id` without the leg ever reading as
    /// acked in between.
    pub fn commit(mut self, order_id: &str) {
        self.held = false;
        let guard = self.cache.state.lock();
        let mut st = guard.borrow_mut();
        let set = &mut st.unack[self.leg.index()];
        set.remove(UNACK_RESERVED);
        set.insert(order_id.to_string());
    }
}

impl Drop for UnackReservation<'_> {
    fn drop(&mut self) {
        if self.held {
            self.cache.set_has_unack(self.leg, false, UNACK_RESERVED);
        }
    }
}

/// Aggregate of every order on one leg.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolSideSnapshot {
    pub security: Security,
    pub side: Side,
    pub total_qty: u64,
    pub total_filled_qty: u64,
    pub total_fill_notional: f64,
    pub avg_fill_px: f64,
    pub total_cxled_qty: u64,
    pub last_update: DateTime<Utc>,
}

struct CacheState {
    symbol_side: [Option<SymbolSideSnapshot>; 2],
    unack: [HashSet<String>; 2],
    orders: HashMap<String, (Leg, OrderSnapshot)>,
    /// unprocessed tail only; handed-out entries are drained
    cancel_queue: Vec<CancelOrder>,
    /// bumped on every push; the drain compares it with `cxl_seen_version`
    cxl_version: u64,
    cxl_last_update: Option<DateTime<Utc>>,
    cxl_seen_version: u64,
    /// cancels handed out so far
    cxl_offset: u64,
    pending_cxl: Vec<CancelOrder>,
    plan: Option<(u64, PairStrat)>,
    limits: Option<StratLimits>,
    pause_requested: bool,
    overfill_alerted: HashSet<String>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            symbol_side: [None, None],
            unack: [HashSet::new(), HashSet::new()],
            orders: HashMap::new(),
            cancel_queue: Vec::new(),
            cxl_version: 0,
            cxl_last_update: None,
            cxl_seen_version: 0,
            cxl_offset: 0,
            pending_cxl: Vec::new(),
            plan: None,
            limits: None,
            pause_requested: false,
            overfill_alerted: HashSet::new(),
        }
    }

    fn refresh_symbol_side(&mut self, key: &PairStratKey, leg: Leg, now: DateTime<Utc>) {
        let (security, side) = key.leg(leg).clone();
        let mut agg = SymbolSideSnapshot {
            security,
            side,
            total_qty: 0,
            total_filled_qty: 0,
            total_fill_notional: 0.0,
            avg_fill_px: 0.0,
            total_cxled_qty: 0,
            last_update: now,
        };
        for (_, snap) in self.orders.values().filter(|(l, _)| *l == leg) {
            agg.total_qty += snap.order.qty;
            agg.total_filled_qty += snap.filled_qty;
            agg.total_fill_notional += snap.fill_notional;
            agg.total_cxled_qty += snap.cxled_qty;
        }
        if agg.total_filled_qty > 0 {
            agg.avg_fill_px = agg.total_fill_notional / agg.total_filled_qty as f64;
        }
        self.symbol_side[leg.index()] = Some(agg);
    }
}

pub struct StrategyCache {
    key: PairStratKey,
    state: ReentrantMutex<RefCell<CacheState>>,
}

impl StrategyCache {
    pub fn new(key: PairStratKey) -> Self {
        Self {
            key,
            state: ReentrantMutex::new(RefCell::new(CacheState::new())),
        }
    }

    pub fn key(&self) -> &PairStratKey {
        &self.key
    }

    /// Track a freshly created order on `leg`.
    pub fn add_order(&self, leg: Leg, order: Order) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let id = order.id.clone();
        st.orders.insert(id, (leg, OrderSnapshot::new(order)));
        st.refresh_symbol_side(&self.key, leg, Utc::now());
    }

    /// Record the id the venue assigned to `order_id`.
    pub fn set_venue_order_id(&self, order_id: &str, venue_order_id: &str) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        match st.orders.get_mut(order_id) {
            Some((_, snap)) => {
                snap.order.venue_order_id = Some(venue_order_id.to_string());
                true
            }
            None => {
                warn!("venue id {} for unknown order {}", venue_order_id, order_id);
                false
            }
        }
    }

    pub fn order(&self, order_id: &str) -> Option<Order> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.orders.get(order_id).map(|(_, s)| s.order.clone())
    }

    pub fn order_snapshot(&self, order_id: &str) -> Option<OrderSnapshot> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.orders.get(order_id).map(|(_, s)| s.clone())
    }

    pub fn leg_of(&self, order_id: &str) -> Option<Leg> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.orders.get(order_id).map(|(leg, _)| *leg)
    }

    pub fn open_order_ids(&self) -> Vec<String> {
        let guard = self.state.lock();
        let st = guard.borrow();
        let mut ids: Vec<String> = st
            .orders
            .iter()
            .filter(|(_, (_, s))| s.status.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Store `snapshot`, refresh its leg aggregate and unacked set, then run
    /// the overfill check. A snapshot for neither leg is a contract error.
    pub fn set_order_snapshot(&self, mut snapshot: OrderSnapshot) -> Result<DateTime<Utc>> {
        let leg = self
            .key
            .leg_for(&snapshot.order.security, snapshot.order.side)
            .ok_or_else(|| {
                Error::Contract(format!(
                    "order {} ({} {}) belongs to neither leg of {}",
                    snapshot.order.id, snapshot.order.side, snapshot.order.security, self.key
                ))
            })?;

        let now = Utc::now();
        snapshot.last_update = now;
        let order_id = snapshot.order.id.clone();

        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if snapshot.status != OrderStatus::New {
            st.unack[leg.index()].remove(&order_id);
        }
        let overfilled = snapshot.is_overfilled() || snapshot.status == OrderStatus::OverFilled;
        if snapshot.order.venue_order_id.is_none()
            && let Some((_, known)) = st.orders.get(&order_id)
        {
            snapshot.order.venue_order_id = known.order.venue_order_id.clone();
        }
        if overfilled {
            st.pause_requested = true;
            if st.overfill_alerted.insert(order_id.clone()) {
                error!(
                    "OVERFILL: pausing strat {}, order {} filled {} > requested {}, {}, snapshot: {:?}",
                    self.key,
                    order_id,
                    snapshot.filled_qty,
                    snapshot.order.qty,
                    symbol_side_key(snapshot.order.security.as_str(), snapshot.order.side),
                    snapshot
                );
            }
        }
        st.orders.insert(order_id, (leg, snapshot));
        st.refresh_symbol_side(&self.key, leg, now);
        Ok(now)
    }

    pub fn symbol_side_snapshot(&self, leg: Leg) -> Option<SymbolSideSnapshot> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.symbol_side[leg.index()].clone()
    }

    pub fn set_has_unack(&self, leg: Leg, flag: bool, order_id: &str) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let set = &mut st.unack[leg.index()];
        if flag {
            set.insert(order_id.to_string());
        } else {
            set.remove(order_id);
        }
    }

    /// Mark `leg` unacked unless it already is, as one step. The
    /// reservation is released on drop unless [`UnackReservation::commit`]
    /// hands it to an order.
    pub fn try_reserve_unack(&self, leg: Leg) -> Option<UnackReservation<'_>> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let set = &mut st.unack[leg.index()];
        if !set.is_empty() {
            return None;
        }
        set.insert(UNACK_RESERVED.to_string());
        Some(UnackReservation {
            cache: self,
            leg,
            held: true,
        })
    }

    pub fn set_has_unack_leg1(&self, flag: bool, order_id: &str) {
        self.set_has_unack(Leg::One, flag, order_id);
    }

    pub fn set_has_unack_leg2(&self, flag: bool, order_id: &str) {
        self.set_has_unack(Leg::Two, flag, order_id);
    }

    pub fn has_unack(&self, leg: Leg) -> bool {
        let guard = self.state.lock();
        let st = guard.borrow();
        !st.unack[leg.index()].is_empty()
    }

    pub fn has_unack_leg1(&self) -> bool {
        self.has_unack(Leg::One)
    }

    pub fn has_unack_leg2(&self) -> bool {
        self.has_unack(Leg::Two)
    }

    pub fn has_unack_leg(&self) -> bool {
        self.has_unack_leg1() || self.has_unack_leg2()
    }

    pub fn push_cancel_order(&self, cxl: CancelOrder) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        debug!("queued cancel for order {}", cxl.order_id);
        st.cancel_queue.push(cxl);
        st.cxl_version += 1;
        st.cxl_last_update = Some(Utc::now());
    }

    pub fn cancel_queue_last_update(&self) -> Option<DateTime<Utc>> {
        self.state.lock().borrow().cxl_last_update
    }

    /// Hand every cancel queued since the previous call (plus any still
    /// pending) to `send`. With `force_cxl_only`, a cancel is only sent when
    /// the plan's force flag or its own force flag is set; the rest stay
    /// pending. Returns the ids `send` accepted.
    ///
    /// `send` runs without the cache lock held. An `Err` from `send` stops
    /// the drain: that cancel is dropped, every candidate after it goes back
    /// to pending, and the error is returned.
    pub fn process_cxl_request<F>(&self, force_cxl_only: bool, mut send: F) -> Result<Vec<String>>
    where
        F: FnMut(&CancelOrder) -> Result<bool>,
    {
        let (candidates, global_force) = {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            let mut candidates = std::mem::take(&mut st.pending_cxl);
            if st.cxl_version != st.cxl_seen_version {
                let fresh: Vec<CancelOrder> = st.cancel_queue.drain(..).collect();
                st.cxl_offset += fresh.len() as u64;
                candidates.extend(fresh);
                st.cxl_seen_version = st.cxl_version;
            }
            let global_force = st.plan.as_ref().is_some_and(|(_, p)| p.force_cancel);
            (candidates, global_force)
        };

        let mut sent = Vec::new();
        let mut still_pending = Vec::new();
        let mut aborted = None;
        let mut candidates = candidates.into_iter();
        while let Some(cxl) = candidates.next() {
            if force_cxl_only && !global_force && !cxl.force_cancel {
                warn!(
                    "cancel for order {} left pending: force_cxl_only set and no force flag, {}",
                    cxl.order_id,
                    symbol_side_key(cxl.security.as_str(), cxl.side)
                );
                still_pending.push(cxl);
                continue;
            }
            match send(&cxl) {
                Ok(true) => sent.push(cxl.order_id),
                Ok(false) => {
                    error!("cancel for order {} failed to send, not retried", cxl.order_id)
                }
                Err(e) => {
                    error!(
                        "cancel for order {} aborted the drain: {}, {} left pending",
                        cxl.order_id,
                        e,
                        candidates.len()
                    );
                    still_pending.extend(candidates.by_ref());
                    aborted = Some(e);
                }
            }
        }

        if !still_pending.is_empty() {
            let guard = self.state.lock();
            let mut st = guard.borrow_mut();
            still_pending.append(&mut st.pending_cxl);
            st.pending_cxl = still_pending;
        }
        match aborted {
            Some(e) => Err(e),
            None => Ok(sent),
        }
    }

    pub fn pending_cancel_count(&self) -> usize {
        self.state.lock().borrow().pending_cxl.len()
    }

    /// Apply a plan push. Non-increasing `seq` is rejected.
    pub fn set_pair_strat(&self, plan: PairStrat, seq: u64) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if let Some((current, _)) = &st.plan
            && seq <= *current
        {
            warn!(
                "stale pair strat update for {}: seq {} <= {}, rejected",
                self.key, seq, current
            );
            return false;
        }
        info!("pair strat {} updated to seq {}", self.key, seq);
        st.plan = Some((seq, plan));
        true
    }

    pub fn pair_strat(&self) -> Option<PairStrat> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.plan.as_ref().map(|(_, p)| p.clone())
    }

    /// Apply a limits push and refresh broker limits in `positions`.
    /// Non-increasing `seq` is rejected before anything is touched.
    pub fn set_strat_limits(&self, update: StratLimits, positions: &PositionCache) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if let Some(current) = &st.limits
            && update.seq <= current.seq
        {
            warn!(
                "stale strat limits for {}: seq {} <= {}, rejected",
                self.key, update.seq, current.seq
            );
            return false;
        }
        positions.update_sec_limits(&update.brokers);
        info!("strat limits {} updated to seq {}", self.key, update.seq);
        st.limits = Some(update);
        true
    }

    pub fn order_limits(&self) -> Option<OrderLimits> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.limits.as_ref().map(|l| l.order_limits)
    }

    pub fn is_pause_requested(&self) -> bool {
        self.state.lock().borrow().pause_requested
    }

    /// Acknowledge a pause once the strategy service has acted on it.
    pub fn clear_pause_request(&self) {
        self.state.lock().borrow_mut().pause_requested = false;
    }
}

/// At most one live cache per pair-strategy key.
#[derive(Default)]
pub struct StrategyCacheRegistry {
    caches: Mutex<HashMap<PairStratKey, Arc<StrategyCache>>>,
}

impl StrategyCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &PairStratKey) -> Arc<StrategyCache> {
        self.caches
            .lock()
            .entry(key.clone())
            .or_insert_with(|| {
                info!("📦 new strategy cache for {}", key);
                Arc::new(StrategyCache::new(key.clone()))
            })
            .clone()
    }

    pub fn get(&self, key: &PairStratKey) -> Option<Arc<StrategyCache>> {
        self.caches.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &PairStratKey) -> bool {
        self.caches.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.caches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.lock().is_empty()
    }
}
