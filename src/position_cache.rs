//! Position cache - per-broker, per-security position ledger.
//!
//! Orders acquire size with [`PositionCache::extract_availability`] and give
//! back what they did not fill with [`PositionCache::return_availability`].
//! Brokers are tried in priority order; the configured fallback broker/route
//! for the instrument type is used when none of them can take the order.

use parking_lot::ReentrantMutex;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::core::config::FallbackConfig;
use crate::core::{
    Broker, BrokerPosition, Order, Position, PositionType, Route, Security, SecurityIdSource, Side,
};

/// Size handed to one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocatedPosition {
    pub allocation_id: u64,
    pub broker: String,
    pub route: Route,
    pub account: String,
    pub security: Security,
    pub side: Side,
    pub pos_type: PositionType,
    pub size: u64,
}

#[derive(Default)]
struct CacheState {
    started: bool,
    brokers: Vec<Broker>,
    /// (lowercased broker, ticker) -> one entry per position type
    positions: HashMap<(String, String), Vec<Position>>,
    symbol_side: HashMap<String, Side>,
    symbol_source: HashMap<String, SecurityIdSource>,
    no_replenish: HashMap<String, Side>,
    fallback: FallbackConfig,
    /// allocation id -> size not yet filled or returned
    outstanding: HashMap<u64, u64>,
    next_allocation_id: u64,
}

impl CacheState {
    fn broker_idx(&self, name: &str) -> Option<usize> {
        self.brokers.iter().position(|b| b.is_named(name))
    }

    fn position_mut(&mut self, broker: &str, ticker: &str, pos_type: PositionType) -> Option<&mut Position> {
        self.positions
            .get_mut(&(broker.to_lowercase(), ticker.to_string()))
            .and_then(|list| list.iter_mut().find(|p| p.pos_type == pos_type))
    }

    fn try_allocate(
        &mut self,
        broker_idx: usize,
        route: Route,
        account: &str,
        order: &Order,
    ) -> Option<AllocatedPosition> {
        let broker = &self.brokers[broker_idx];
        let broker_name = broker.name.clone();
        let ticker = order.security.sec_id.clone();
        let limit = broker.consumable_limits.get(&ticker).copied();

        let list = self
            .positions
            .entry((broker_name.to_lowercase(), ticker.clone()))
            .or_default();

        let used: u64 = list.iter().map(|p| p.allocated_size + p.consumed_size).sum();
        if let Some(limit) = limit
            && used + order.qty > limit
        {
            debug!(
                "broker {} limit {} for {} exhausted (used {}, asked {})",
                broker_name, limit, ticker, used, order.qty
            );
            return None;
        }

        let pos_type = match order.side {
            Side::Sell => {
                // start-of-day inventory goes first
                let slot = [PositionType::Sod, PositionType::Intraday]
                    .into_iter()
                    .find_map(|t| {
                        list.iter()
                            .position(|p| p.pos_type == t && p.available_size >= order.qty)
                    })?;
                let pos = &mut list[slot];
                pos.available_size -= order.qty;
                pos.allocated_size += order.qty;
                pos.pos_type
            }
            Side::Buy => {
                let slot = match list.iter().position(|p| p.pos_type == PositionType::Intraday) {
                    Some(i) => i,
                    None => {
                        list.push(Position::new(PositionType::Intraday, 0));
                        list.len() - 1
                    }
                };
                list[slot].allocated_size += order.qty;
                PositionType::Intraday
            }
        };

        self.next_allocation_id += 1;
        let allocation_id = self.next_allocation_id;
        self.outstanding.insert(allocation_id, order.qty);

        Some(AllocatedPosition {
            allocation_id,
            broker: broker_name,
            route,
            account: account.to_string(),
            security: order.security.clone(),
            side: order.side,
            pos_type,
            size: order.qty,
        })
    }
}

pub struct PositionCache {
    state: ReentrantMutex<RefCell<CacheState>>,
}

impl Default for PositionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionCache {
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(CacheState::default())),
        }
    }

    /// Seed the cache. Only the first call has any effect; later calls return
    /// the current started flag.
    pub fn start(
        &self,
        brokers: Vec<Broker>,
        sod_and_intraday_positions: Vec<BrokerPosition>,
        symbol_side_map: HashMap<String, Side>,
        symbol_source_map: HashMap<String, SecurityIdSource>,
        no_replenish_side_map: HashMap<String, Side>,
        fallback: FallbackConfig,
    ) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if st.started {
            debug!("position cache already started, ignoring start");
            return st.started;
        }

        for bp in sod_and_intraday_positions {
            if !brokers.iter().any(|b| b.is_named(&bp.broker)) {
                error!(
                    "position for {} at unknown broker {}, skipped",
                    bp.security, bp.broker
                );
                continue;
            }
            let list = st
                .positions
                .entry((bp.broker.to_lowercase(), bp.security.sec_id.clone()))
                .or_default();
            match list.iter_mut().find(|p| p.pos_type == bp.position.pos_type) {
                Some(existing) => existing.available_size += bp.position.available_size,
                None => list.push(bp.position),
            }
        }

        st.brokers = brokers
            .into_iter()
            .map(|mut b| {
                b.consumable_limits = b
                    .consumable_limits
                    .into_iter()
                    .map(|(k, v)| (k.to_uppercase(), v))
                    .collect();
                b
            })
            .collect();
        st.symbol_side = upper_keys(symbol_side_map);
        st.symbol_source = upper_keys(symbol_source_map);
        st.no_replenish = upper_keys(no_replenish_side_map);
        st.fallback = fallback;
        st.started = true;
        info!(
            "position cache started: {} brokers, {} security positions",
            st.brokers.len(),
            st.positions.len()
        );
        st.started
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().borrow().started
    }

    /// Acquire size for `order`. Fails closed when the cache is not started,
    /// the order contradicts the symbol maps, or no broker can take it.
    pub fn extract_availability(&self, order: &Order) -> (bool, Option<AllocatedPosition>) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.started {
            error!(
                "extract_availability called before start, order {} {} {} refused",
                order.id, order.side, order.security
            );
            return (false, None);
        }

        let ticker = order.security.sec_id.as_str();
        if let Some(expected) = st.symbol_side.get(ticker)
            && *expected != order.side
        {
            error!(
                "order {} side {} does not match configured side {} for {}",
                order.id, order.side, expected, ticker
            );
            return (false, None);
        }
        if let Some(source) = st.symbol_source.get(ticker)
            && *source != order.security.sec_id_source
        {
            error!(
                "order {} id source {:?} does not match configured {:?} for {}",
                order.id, order.security.sec_id_source, source, ticker
            );
            return (false, None);
        }

        for idx in 0..st.brokers.len() {
            let Some(route) = st.brokers[idx].route_for(order.instrument_type).cloned() else {
                continue;
            };
            if let Some(alloc) = st.try_allocate(idx, route.route, &route.account, order) {
                return (true, Some(alloc));
            }
        }

        let Some(fallback) = st.fallback.for_instrument(order.instrument_type).cloned() else {
            warn!(
                "no broker can take order {} {} {} x {}, no fallback for {}",
                order.id, order.side, ticker, order.qty, order.instrument_type
            );
            return (false, None);
        };
        let Some(idx) = st.broker_idx(&fallback.broker) else {
            error!(
                "fallback broker {} for {} unknown, no data",
                fallback.broker, order.instrument_type
            );
            return (false, None);
        };
        let broker = &st.brokers[idx];
        let account = broker
            .routes
            .iter()
            .find(|r| r.route == fallback.route)
            .or_else(|| broker.route_for(order.instrument_type))
            .map(|r| r.account.clone());
        let Some(account) = account else {
            error!(
                "fallback broker {} has no account for route {}, no data",
                fallback.broker, fallback.route
            );
            return (false, None);
        };

        match st.try_allocate(idx, fallback.route, &account, order) {
            Some(alloc) => {
                info!(
                    "order {} routed to fallback {} via {}",
                    order.id, alloc.broker, alloc.route
                );
                (true, Some(alloc))
            }
            None => {
                warn!(
                    "no availability for order {} {} {} x {} (fallback {} included)",
                    order.id, order.side, ticker, order.qty, fallback.broker
                );
                (false, None)
            }
        }
    }

    /// Book `qty` filled against an allocation.
    pub fn apply_fill(&self, alloc: &AllocatedPosition, qty: u64) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.started {
            error!("apply_fill called before start, allocation {}", alloc.allocation_id);
            return false;
        }
        let Some(remaining) = st.outstanding.get_mut(&alloc.allocation_id) else {
            warn!(
                "fill of {} for unknown or returned allocation {}",
                qty, alloc.allocation_id
            );
            return false;
        };
        let released = qty.min(*remaining);
        if qty > *remaining {
            warn!(
                "fill of {} exceeds outstanding {} on allocation {} ({})",
                qty, remaining, alloc.allocation_id, alloc.security
            );
        }
        *remaining -= released;

        let ticker = alloc.security.sec_id.clone();
        let replenish = alloc.side == Side::Buy && st.no_replenish.get(&ticker) != Some(&Side::Buy);
        let Some(pos) = st.position_mut(&alloc.broker, &ticker, alloc.pos_type) else {
            error!("no {:?} position for {} at {}", alloc.pos_type, ticker, alloc.broker);
            return false;
        };
        pos.allocated_size = pos.allocated_size.saturating_sub(released);
        pos.consumed_size += qty;
        match alloc.side {
            Side::Buy => pos.bought_size += qty,
            Side::Sell => pos.sold_size += qty,
        }
        if replenish {
            pos.available_size += qty;
        }
        true
    }

    /// Give back whatever is still outstanding on `position`. Returning the
    /// same allocation twice is a no-op.
    pub fn return_availability(&self, ticker: &str, position: &AllocatedPosition) -> bool {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.started {
            error!(
                "return_availability called before start for {}, allocation {}",
                ticker, position.allocation_id
            );
            return false;
        }
        let Some(remaining) = st.outstanding.remove(&position.allocation_id) else {
            debug!("allocation {} already returned", position.allocation_id);
            return true;
        };
        match st.position_mut(&position.broker, ticker, position.pos_type) {
            Some(pos) => {
                pos.allocated_size = pos.allocated_size.saturating_sub(remaining);
                if position.side == Side::Sell {
                    pos.available_size += remaining;
                }
            }
            None => warn!(
                "returned allocation {} has no {:?} position for {} at {}",
                position.allocation_id, position.pos_type, ticker, position.broker
            ),
        }
        true
    }

    /// Refresh per-broker consumable limits.
    pub fn update_sec_limits(&self, brokers: &[Broker]) {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        if !st.started {
            warn!("update_sec_limits called before start, ignored");
            return;
        }
        for update in brokers {
            match st.broker_idx(&update.name) {
                Some(idx) => {
                    st.brokers[idx].consumable_limits = update
                        .consumable_limits
                        .iter()
                        .map(|(k, v)| (k.to_uppercase(), *v))
                        .collect();
                    debug!("refreshed sec limits for broker {}", update.name);
                }
                None => error!("sec limits for unknown broker {}, no data", update.name),
            }
        }
    }

    pub fn position(&self, broker: &str, ticker: &str, pos_type: PositionType) -> Option<Position> {
        let guard = self.state.lock();
        let st = guard.borrow();
        st.positions
            .get(&(broker.to_lowercase(), ticker.to_uppercase()))
            .and_then(|list| list.iter().find(|p| p.pos_type == pos_type).copied())
    }

    pub fn outstanding(&self, allocation_id: u64) -> Option<u64> {
        self.state.lock().borrow().outstanding.get(&allocation_id).copied()
    }
}

fn upper_keys<V>(map: HashMap<String, V>) -> HashMap<String, V> {
    map.into_iter().map(|(k, v)| (k.to_uppercase(), v)).collect()
}
