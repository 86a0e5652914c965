//! Logging simulator - a bartering link that never reaches a venue.
//!
//! Each call becomes one replay record on the `bartering_link_log` target:
//!
//! ```text
//! ^^^~~place_new_order~~host^^127.0.0.1~~port^^8040~~px^^25~~qty^^100~~side^^BUY
//! ```

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

use super::{
    AmendRequest, BarteringLink, CancelRequest, InternalUpdate, NewOrderRequest, OrderStatusReport,
};
use crate::core::config::KillSwitchConfig;
use crate::core::{LedgerEntry, OrderStatus, Result};
use crate::ledger::LedgerStore;

pub const LOG_TARGET: &str = "bartering_link_log";
pub const RECORD_SENTINEL: &str = "^^^";
pub const FIELD_SEP: &str = "~~";
pub const VALUE_SEP: &str = "^^";

/// Backslash-escape backslashes, `~` and `^` so a value never forms a separator.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '~' | '^') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// One replay record. `host` and every value are escaped.
pub fn format_record(call: &str, host: &str, port: u16, fields: &[(&str, String)]) -> String {
    let mut line = format!(
        "{RECORD_SENTINEL}{FIELD_SEP}{call}{FIELD_SEP}host{VALUE_SEP}{}{FIELD_SEP}port{VALUE_SEP}{port}",
        escape_value(host)
    );
    for (key, value) in fields {
        line.push_str(FIELD_SEP);
        line.push_str(key);
        line.push_str(VALUE_SEP);
        line.push_str(&escape_value(value));
    }
    line
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Debug, Clone)]
struct SimOrder {
    /// Venue status code, parsed on every status query
    code: String,
    qty: u64,
    filled_qty: u64,
    px: f64,
}

pub struct LogSimulator {
    host: String,
    port: u16,
    kill_switch: RwLock<KillSwitchConfig>,
    next_order_id: AtomicU64,
    orders: Mutex<HashMap<String, SimOrder>>,
    ledger: Arc<dyn LedgerStore>,
}

impl LogSimulator {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        kill_switch: KillSwitchConfig,
        ledger: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            kill_switch: RwLock::new(kill_switch),
            next_order_id: AtomicU64::new(0),
            orders: Mutex::new(HashMap::new()),
            ledger,
        }
    }

    fn record(&self, call: &str, fields: &[(&str, String)]) {
        info!(target: LOG_TARGET, "{}", format_record(call, &self.host, self.port, fields));
    }

    /// Simulate a venue push for `order_id`. Codes are stored verbatim and
    /// only parsed when the order is queried.
    pub fn set_order_status(&self, order_id: &str, code: &str, filled_qty: u64) -> bool {
        self.record(
            "set_order_status",
            &[
                ("order_id", order_id.to_string()),
                ("status", code.to_string()),
                ("filled_qty", filled_qty.to_string()),
            ],
        );
        match self.orders.lock().get_mut(order_id) {
            Some(order) => {
                order.code = code.to_string();
                order.filled_qty = filled_qty;
                true
            }
            None => {
                warn!("simulated status for unknown order {}", order_id);
                false
            }
        }
    }

    pub fn kill_switch_config(&self) -> KillSwitchConfig {
        *self.kill_switch.read()
    }
}

#[async_trait]
impl BarteringLink for LogSimulator {
    fn name(&self) -> &str {
        "log_simulator"
    }

    async fn is_kill_switch_enabled(&self) -> Result<bool> {
        let enabled = self.kill_switch.read().is_kill_switch_enabled;
        self.record("is_kill_switch_enabled", &[("result", enabled.to_string())]);
        Ok(enabled)
    }

    async fn trigger_kill_switch(&self) -> Result<bool> {
        let mut cfg = self.kill_switch.write();
        let sent = cfg.trigger_kill_switch;
        if sent {
            cfg.is_kill_switch_enabled = true;
        }
        drop(cfg);
        self.record("trigger_kill_switch", &[("result", sent.to_string())]);
        Ok(sent)
    }

    async fn revoke_kill_switch_and_resume(&self) -> Result<bool> {
        let mut cfg = self.kill_switch.write();
        let resumed = cfg.revoke_kill_switch_n_resume;
        if resumed {
            cfg.is_kill_switch_enabled = false;
        }
        drop(cfg);
        self.record("revoke_kill_switch_n_resume", &[("result", resumed.to_string())]);
        Ok(resumed)
    }

    async fn place_new_order(&self, req: &NewOrderRequest) -> Result<(bool, String)> {
        let mut fields = vec![
            ("px", req.px.to_string()),
            ("qty", req.qty.to_string()),
            ("side", req.side.to_string()),
            ("bartering_sec_id", req.bartering_sec_id.clone()),
            ("system_sec_id", req.system_sec_id.clone()),
            ("instrument_type", req.instrument_type.to_string()),
            ("account", req.account.clone()),
            ("exchange", opt(&req.exchange)),
            ("text", opt(&req.text)),
            ("client_ord_id", opt(&req.client_ord_id)),
        ];

        if self.kill_switch.read().is_kill_switch_enabled {
            fields.push(("result", "rejected: kill switch enabled".into()));
            self.record("place_new_order", &fields);
            return Ok((false, "kill switch enabled".into()));
        }

        let order_id = (self.next_order_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        self.orders.lock().insert(
            order_id.clone(),
            SimOrder {
                code: OrderStatus::Acked.code().to_string(),
                qty: req.qty,
                filled_qty: 0,
                px: req.px,
            },
        );
        fields.push(("order_id", order_id.clone()));
        self.record("place_new_order", &fields);
        Ok((true, order_id))
    }

    async fn place_amend_order(&self, req: &AmendRequest) -> Result<bool> {
        self.record(
            "place_amend_order",
            &[
                ("order_id", req.order_id.clone()),
                ("px", opt(&req.px)),
                ("qty", opt(&req.qty)),
                ("text", opt(&req.text)),
            ],
        );
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(&req.order_id) else {
            warn!("amend for unknown order {}", req.order_id);
            return Ok(false);
        };
        if !OrderStatus::from_code(&order.code)?.is_open() {
            warn!("amend for order {} in {}, refused", req.order_id, order.code);
            return Ok(false);
        }
        if let Some(px) = req.px {
            order.px = px;
        }
        if let Some(qty) = req.qty {
            order.qty = qty;
        }
        Ok(true)
    }

    async fn place_cancel_order(&self, req: &CancelRequest) -> Result<bool> {
        self.record(
            "place_cancel_order",
            &[
                ("order_id", req.order_id.clone()),
                ("side", opt(&req.side)),
                ("bartering_sec_id", opt(&req.bartering_sec_id)),
                ("system_sec_id", opt(&req.system_sec_id)),
                ("account", opt(&req.account)),
            ],
        );
        let mut orders = self.orders.lock();
        let Some(order) = orders.get_mut(&req.order_id) else {
            warn!("cancel for unknown order {}", req.order_id);
            return Ok(false);
        };
        if OrderStatus::from_code(&order.code)?.is_open() {
            order.code = OrderStatus::Cancelled.code().to_string();
        }
        Ok(true)
    }

    async fn is_order_open(&self, order_id: &str) -> Result<bool> {
        let code = self.orders.lock().get(order_id).map(|o| o.code.clone());
        self.record(
            "is_order_open",
            &[("order_id", order_id.to_string()), ("status", opt(&code))],
        );
        match code {
            Some(code) => Ok(OrderStatus::from_code(&code)?.is_open()),
            None => Ok(false),
        }
    }

    async fn get_order_status(&self, order_id: &str) -> Result<Option<OrderStatusReport>> {
        let order = self.orders.lock().get(order_id).cloned();
        self.record(
            "get_order_status",
            &[
                ("order_id", order_id.to_string()),
                ("status", opt(&order.as_ref().map(|o| o.code.clone()))),
            ],
        );
        let Some(order) = order else {
            return Ok(None);
        };
        Ok(Some(OrderStatusReport {
            status: OrderStatus::from_code(&order.code)?,
            qty: order.qty,
            filled_qty: order.filled_qty,
            text: None,
        }))
    }

    async fn internal_order_state_update(&self, update: &InternalUpdate) -> Result<bool> {
        self.record(
            "internal_order_state_update",
            &[
                ("event", update.event.to_string()),
                ("order_id", update.order_id.clone()),
                ("security", opt(&update.security)),
                ("side", opt(&update.side)),
                ("px", opt(&update.px)),
                ("qty", opt(&update.qty)),
                ("text", opt(&update.text)),
            ],
        );
        self.ledger.create_ledger_entry(LedgerEntry {
            order_id: update.order_id.clone(),
            event: update.event,
            security: update.security.clone(),
            side: update.side,
            px: update.px,
            qty: update.qty,
            text: update.text.clone(),
            event_time: Utc::now(),
        })?;
        Ok(true)
    }

    fn reload_config(&self, kill_switch: KillSwitchConfig) {
        *self.kill_switch.write() = kill_switch;
        info!(
            "🔄 log simulator kill switch reloaded: enabled={} trigger={} resume={}",
            kill_switch.is_kill_switch_enabled,
            kill_switch.trigger_kill_switch,
            kill_switch.revoke_kill_switch_n_resume
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Error, InstrumentType, OrderEventType, Security, Side};
    use crate::ledger::InMemoryLedgerStore;
    use crate::testing::capture_logs;

    fn simulator(kill_switch: KillSwitchConfig) -> (LogSimulator, Arc<InMemoryLedgerStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        (LogSimulator::new("127.0.0.1", 8040, kill_switch, ledger.clone()), ledger)
    }

    fn new_order(qty: u64) -> NewOrderRequest {
        NewOrderRequest {
            px: 25.0,
            qty,
            side: Side::Buy,
            bartering_sec_id: "EQT_SEC_1".into(),
            system_sec_id: "EQT_SEC_1".into(),
            instrument_type: InstrumentType::Equity,
            account: "ACC1".into(),
            exchange: None,
            text: None,
            client_ord_id: Some("exec-1".into()),
        }
    }

    #[test]
    fn test_record_format() {
        let line = format_record("place_cancel_order", "h", 1, &[("order_id", "7".into())]);
        assert_eq!(line, "^^^~~place_cancel_order~~host^^h~~port^^1~~order_id^^7");
    }

    #[test]
    fn test_free_text_is_escaped() {
        let line = format_record(
            "internal_order_state_update",
            "h",
            1,
            &[("text", "x~~y^^z\\".into()), ("qty", "5".into())],
        );
        assert_eq!(
            line,
            "^^^~~internal_order_state_update~~host^^h~~port^^1~~text^^x\\~\\~y\\^\\^z\\\\~~qty^^5"
        );
        // header field plus host, port and the two values
        assert_eq!(line.matches(FIELD_SEP).count(), 5);
    }

    #[tokio::test]
    async fn test_new_order_ids_increase_and_are_logged() {
        let (sim, _) = simulator(KillSwitchConfig::default());
        let (_guard, logs) = capture_logs();
        let (ok1, id1) = sim.place_new_order(&new_order(100)).await.unwrap();
        let (ok2, id2) = sim.place_new_order(&new_order(100)).await.unwrap();
        assert!(ok1 && ok2);
        assert!(id2.parse::<u64>().unwrap() > id1.parse::<u64>().unwrap());
        assert_eq!(logs.count("^^^~~place_new_order~~host^^127.0.0.1~~port^^8040"), 2);
        assert!(logs.contents().contains("bartering_link_log"));
        assert!(sim.is_order_open(&id1).await.unwrap());
    }

    #[tokio::test]
    async fn test_kill_switch_defaults_and_reload() {
        let (sim, _) = simulator(KillSwitchConfig::default());
        assert!(!sim.is_kill_switch_enabled().await.unwrap());
        assert!(sim.trigger_kill_switch().await.unwrap());
        assert!(sim.is_kill_switch_enabled().await.unwrap());

        let (ok, text) = sim.place_new_order(&new_order(1)).await.unwrap();
        assert!(!ok);
        assert_eq!(text, "kill switch enabled");

        assert!(sim.revoke_kill_switch_and_resume().await.unwrap());
        assert!(!sim.is_kill_switch_enabled().await.unwrap());

        sim.reload_config(KillSwitchConfig {
            is_kill_switch_enabled: true,
            trigger_kill_switch: false,
            revoke_kill_switch_n_resume: false,
        });
        assert!(!sim.trigger_kill_switch().await.unwrap());
        assert!(!sim.revoke_kill_switch_and_resume().await.unwrap());
        assert!(sim.is_kill_switch_enabled().await.unwrap());
    }

    #[tokio::test]
    async fn test_order_status_lifecycle() {
        let (sim, _) = simulator(KillSwitchConfig::default());
        assert!(sim.get_order_status("404").await.unwrap().is_none());
        assert!(!sim.is_order_open("404").await.unwrap());

        let (_, id) = sim.place_new_order(&new_order(100)).await.unwrap();
        sim.set_order_status(&id, "OE_PARTIAL", 40);
        let report = sim.get_order_status(&id).await.unwrap().unwrap();
        assert_eq!(report.status, OrderStatus::PartiallyFilled);
        assert_eq!((report.qty, report.filled_qty), (100, 40));

        let cxl = CancelRequest {
            order_id: id.clone(),
            ..CancelRequest::default()
        };
        assert!(sim.place_cancel_order(&cxl).await.unwrap());
        assert!(!sim.is_order_open(&id).await.unwrap());
        assert!(!sim.place_cancel_order(&CancelRequest::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsupported_status_is_fatal() {
        let (sim, _) = simulator(KillSwitchConfig::default());
        let (_, id) = sim.place_new_order(&new_order(100)).await.unwrap();
        sim.set_order_status(&id, "OE_SOMETHING_ELSE", 0);
        let err = sim.get_order_status(&id).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedStatus(_)));
        assert!(err.is_contract_violation());
    }

    #[tokio::test]
    async fn test_internal_update_writes_ledger() {
        let (sim, ledger) = simulator(KillSwitchConfig::default());
        let update = InternalUpdate {
            event: OrderEventType::IntReject,
            order_id: "-11700000000000000".into(),
            security: Some(Security::ticker("EQT_SEC_1")),
            side: Some(Side::Sell),
            px: Some(10.0),
            qty: Some(100),
            text: Some("MIN_NOTIONAL".into()),
        };
        assert!(sim.internal_order_state_update(&update).await.unwrap());
        let entries = ledger.entries_for("-11700000000000000");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, OrderEventType::IntReject);
        assert_eq!(entries[0].text.as_deref(), Some("MIN_NOTIONAL"));
    }
}
