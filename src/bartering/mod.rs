//! Bartering link - the venue connector seam.
//!
//! Every capability is async and runs on the single bartering loop owned by
//! [`bridge::LinkBridge`]. Worker threads never call a link directly.

pub mod bridge;
pub mod log_simulator;

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::core::config::{KillSwitchConfig, LinkKind};
use crate::core::{
    Config, Error, InstrumentType, OrderEventType, OrderStatus, Result, Security, Side,
};
use crate::ledger::LedgerStore;

pub use bridge::{LinkBridge, gather_with_timeout};
pub use log_simulator::LogSimulator;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewOrderRequest {
    pub px: f64,
    pub qty: u64,
    pub side: Side,
    /// Identifier the venue knows the security by
    pub bartering_sec_id: String,
    pub system_sec_id: String,
    pub instrument_type: InstrumentType,
    pub account: String,
    pub exchange: Option<String>,
    pub text: Option<String>,
    pub client_ord_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AmendRequest {
    pub order_id: String,
    pub px: Option<f64>,
    pub qty: Option<u64>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CancelRequest {
    pub order_id: String,
    pub side: Option<Side>,
    pub bartering_sec_id: Option<String>,
    pub system_sec_id: Option<String>,
    pub account: Option<String>,
}

/// Internally generated order event (system-side rejects, lapses).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InternalUpdate {
    pub event: OrderEventType,
    pub order_id: String,
    pub security: Option<Security>,
    pub side: Option<Side>,
    pub px: Option<f64>,
    pub qty: Option<u64>,
    pub text: Option<String>,
}

/// What the venue reports for a known order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub qty: u64,
    pub filled_qty: u64,
    pub text: Option<String>,
}

/// Venue connector. An `Err` means the call itself failed; a refused request
/// is `Ok(false)`.
#[async_trait]
pub trait BarteringLink: Send + Sync {
    fn name(&self) -> &str;

    async fn is_kill_switch_enabled(&self) -> Result<bool>;

    /// `Ok(false)` when the trigger could not be sent.
    async fn trigger_kill_switch(&self) -> Result<bool>;

    async fn revoke_kill_switch_and_resume(&self) -> Result<bool>;

    /// Returns (sent, venue order id or error text).
    async fn place_new_order(&self, req: &NewOrderRequest) -> Result<(bool, String)>;

    async fn place_amend_order(&self, req: &AmendRequest) -> Result<bool>;

    async fn place_cancel_order(&self, req: &CancelRequest) -> Result<bool>;

    async fn is_order_open(&self, order_id: &str) -> Result<bool>;

    /// `None` when the venue does not know the order. A status the link
    /// cannot interpret is [`Error::UnsupportedStatus`].
    async fn get_order_status(&self, order_id: &str) -> Result<Option<OrderStatusReport>>;

    /// Record an internally generated event without a venue round-trip.
    async fn internal_order_state_update(&self, update: &InternalUpdate) -> Result<bool>;

    /// Push a reloaded kill-switch map into the live connector.
    fn reload_config(&self, kill_switch: KillSwitchConfig);
}

/// Build the connector selected by `engine.bartering_link`.
pub fn connect(config: &Config, ledger: Arc<dyn LedgerStore>) -> Result<Arc<dyn BarteringLink>> {
    match config.engine.bartering_link {
        LinkKind::LogSimulator => Ok(Arc::new(LogSimulator::new(
            config.engine.log_simulator_host.clone(),
            config.engine.log_simulator_port,
            config.kill_switch,
            ledger,
        ))),
        LinkKind::Live => Err(Error::NotImplemented(
            "live bartering link is not available in this build".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;

    #[test]
    fn test_connect_selects_variant() {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let mut config = Config::default();
        let link = connect(&config, ledger.clone()).unwrap();
        assert_eq!(link.name(), "log_simulator");

        config.engine.bartering_link = LinkKind::Live;
        let err = connect(&config, ledger).err().unwrap();
        assert!(matches!(err, Error::NotImplemented(_)));
    }
}
