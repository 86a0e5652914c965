//! Core types - Strong typing for orders, positions and brokers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::{Error, Result};

/// Where a security identifier comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityIdSource {
    Ticker,
    Sedol,
    Ric,
    Isin,
    Cusip,
    ExchSymbol,
}

/// Security identifier (e.g., "600519.SS" as a RIC)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Security {
    pub sec_id: String,
    pub sec_id_source: SecurityIdSource,
}

impl Security {
    pub fn new(sec_id: impl Into<String>, sec_id_source: SecurityIdSource) -> Self {
        Self {
            sec_id: sec_id.into().to_uppercase(),
            sec_id_source,
        }
    }

    pub fn ticker(sec_id: impl Into<String>) -> Self {
        Self::new(sec_id, SecurityIdSource::Ticker)
    }

    pub fn as_str(&self) -> &str {
        &self.sec_id
    }
}

impl std::fmt::Display for Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.sec_id)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentType {
    Equity,
    ConvertibleBond,
}

impl std::fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstrumentType::Equity => write!(f, "EQT"),
            InstrumentType::ConvertibleBond => write!(f, "CB"),
        }
    }
}

/// Market access route a broker offers for an instrument type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Connect,
    Qfii,
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Connect => write!(f, "CONNECT"),
            Route::Qfii => write!(f, "QFII"),
        }
    }
}

/// Order lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Acked,
    PartiallyFilled,
    Filled,
    OverFilled,
    Cancelled,
    OverCancelled,
    Rejected,
    DoneForDay,
}

impl OrderStatus {
    /// Venue-style status code, as written to replay records.
    pub fn code(&self) -> &'static str {
        match self {
            OrderStatus::New => "OE_NEW",
            OrderStatus::Acked => "OE_ACKED",
            OrderStatus::PartiallyFilled => "OE_PARTIAL",
            OrderStatus::Filled => "OE_FILLED",
            OrderStatus::OverFilled => "OE_OVER_FILLED",
            OrderStatus::Cancelled => "OE_CXLED",
            OrderStatus::OverCancelled => "OE_OVER_CXLED",
            OrderStatus::Rejected => "OE_REJECTED",
            OrderStatus::DoneForDay => "OE_DOD",
        }
    }

    /// Parse a venue status code. Unknown codes are a contract violation.
    pub fn from_code(code: &str) -> Result<Self> {
        let status = match code {
            "OE_NEW" => OrderStatus::New,
            "OE_ACKED" => OrderStatus::Acked,
            "OE_PARTIAL" => OrderStatus::PartiallyFilled,
            "OE_FILLED" => OrderStatus::Filled,
            "OE_OVER_FILLED" => OrderStatus::OverFilled,
            "OE_CXLED" => OrderStatus::Cancelled,
            "OE_OVER_CXLED" => OrderStatus::OverCancelled,
            "OE_REJECTED" => OrderStatus::Rejected,
            "OE_DOD" => OrderStatus::DoneForDay,
            other => return Err(Error::UnsupportedStatus(other.to_string())),
        };
        Ok(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::DoneForDay
                | OrderStatus::Filled
                | OrderStatus::OverFilled
                | OrderStatus::OverCancelled
        )
    }

    /// Terminal states other than a clean fill.
    pub fn is_non_filled_terminal(&self) -> bool {
        self.is_terminal() && *self != OrderStatus::Filled
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderStatus::New | OrderStatus::Acked | OrderStatus::PartiallyFilled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Order ("chore")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub security: Security,
    pub side: Side,
    pub px: f64,
    pub qty: u64,
    pub account: String,
    pub instrument_type: InstrumentType,
    pub venue_order_id: Option<String>,
    annotations: Vec<String>,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        security: Security,
        side: Side,
        px: f64,
        qty: u64,
        account: impl Into<String>,
        instrument_type: InstrumentType,
    ) -> Self {
        Self {
            id: id.into(),
            security,
            side,
            px,
            qty,
            account: account.into(),
            instrument_type,
            venue_order_id: None,
            annotations: Vec::new(),
        }
    }

    pub fn notional(&self) -> f64 {
        self.px * self.qty as f64
    }

    /// Free-text annotations are append-only.
    pub fn annotate(&mut self, text: impl Into<String>) {
        self.annotations.push(text.into());
    }

    pub fn annotations(&self) -> &[String] {
        &self.annotations
    }
}

/// Derived view of an order's lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub order: Order,
    pub status: OrderStatus,
    pub filled_qty: u64,
    pub avg_fill_px: f64,
    pub fill_notional: f64,
    pub cxled_qty: u64,
    pub last_update: DateTime<Utc>,
}

impl OrderSnapshot {
    pub fn new(order: Order) -> Self {
        Self {
            order,
            status: OrderStatus::New,
            filled_qty: 0,
            avg_fill_px: 0.0,
            fill_notional: 0.0,
            cxled_qty: 0,
            last_update: Utc::now(),
        }
    }

    pub fn is_overfilled(&self) -> bool {
        self.filled_qty > self.order.qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    Sod,
    Intraday,
}

/// Position sizes; all non-negative by construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub pos_type: PositionType,
    pub available_size: u64,
    pub allocated_size: u64,
    pub consumed_size: u64,
    pub bought_size: u64,
    pub sold_size: u64,
}

impl Position {
    pub fn new(pos_type: PositionType, available_size: u64) -> Self {
        Self {
            pos_type,
            available_size,
            allocated_size: 0,
            consumed_size: 0,
            bought_size: 0,
            sold_size: 0,
        }
    }
}

/// Route/account pair a broker offers for one instrument type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerRoute {
    pub instrument_type: InstrumentType,
    pub route: Route,
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Broker {
    pub name: String,
    pub routes: Vec<BrokerRoute>,
    /// ticker -> max size this broker lets us allocate + consume today
    #[serde(default)]
    pub consumable_limits: HashMap<String, u64>,
}

impl Broker {
    pub fn new(name: impl Into<String>, routes: Vec<BrokerRoute>) -> Self {
        Self {
            name: name.into(),
            routes,
            consumable_limits: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, ticker: &str, limit: u64) -> Self {
        self.consumable_limits.insert(ticker.to_uppercase(), limit);
        self
    }

    pub fn route_for(&self, instrument_type: InstrumentType) -> Option<&BrokerRoute> {
        self.routes.iter().find(|r| r.instrument_type == instrument_type)
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Position held at a broker for one security
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub broker: String,
    pub security: Security,
    pub position: Position,
}

/// Minimum-notional gate behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StratMode {
    #[default]
    Normal,
    Relaxed,
    Aggressive,
}

/// Per-order risk limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrderLimits {
    pub min_chore_notional: f64,
    pub max_chore_notional: f64,
    pub min_chore_notional_allowance: f64,
    pub max_chore_qty: u64,
}

impl Default for OrderLimits {
    fn default() -> Self {
        Self {
            min_chore_notional: 1_000.0,
            max_chore_notional: 300_000.0,
            min_chore_notional_allowance: 1_000.0,
            max_chore_qty: 100_000,
        }
    }
}

/// Leg of a pair strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Leg {
    One,
    Two,
}

impl Leg {
    pub fn index(&self) -> usize {
        match self {
            Leg::One => 0,
            Leg::Two => 1,
        }
    }
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Leg::One => write!(f, "leg1"),
            Leg::Two => write!(f, "leg2"),
        }
    }
}

/// Order events as recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEventType {
    New,
    Ack,
    Amend,
    CxlRequest,
    CxlAck,
    Fill,
    IntReject,
    Lapse,
}

impl OrderEventType {
    /// Status an order lands in after this event, if the event moves it.
    pub fn resulting_status(&self) -> Option<OrderStatus> {
        match self {
            OrderEventType::New => Some(OrderStatus::New),
            OrderEventType::Ack => Some(OrderStatus::Acked),
            OrderEventType::CxlAck => Some(OrderStatus::Cancelled),
            OrderEventType::IntReject => Some(OrderStatus::Rejected),
            OrderEventType::Lapse => Some(OrderStatus::DoneForDay),
            OrderEventType::Amend | OrderEventType::CxlRequest | OrderEventType::Fill => None,
        }
    }
}

impl std::fmt::Display for OrderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderEventType::New => "OE_NEW",
            OrderEventType::Ack => "OE_ACK",
            OrderEventType::Amend => "OE_AMD",
            OrderEventType::CxlRequest => "OE_CXL",
            OrderEventType::CxlAck => "OE_CXL_ACK",
            OrderEventType::Fill => "OE_FILL",
            OrderEventType::IntReject => "OE_INT_REJ",
            OrderEventType::Lapse => "OE_LAPSE",
        };
        write!(f, "{}", s)
    }
}

/// One persisted order event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub order_id: String,
    pub event: OrderEventType,
    pub security: Option<Security>,
    pub side: Option<Side>,
    pub px: Option<f64>,
    pub qty: Option<u64>,
    pub text: Option<String>,
    pub event_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_sets() {
        let terminal = [
            OrderStatus::DoneForDay,
            OrderStatus::Filled,
            OrderStatus::OverFilled,
            OrderStatus::OverCancelled,
        ];
        for s in terminal {
            assert!(s.is_terminal(), "{s} should be terminal");
        }
        assert!(!OrderStatus::Filled.is_non_filled_terminal());
        assert!(OrderStatus::OverFilled.is_non_filled_terminal());
        assert!(!OrderStatus::Acked.is_terminal());
        assert!(!OrderStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_code_parse() {
        assert_eq!(OrderStatus::from_code("OE_PARTIAL").unwrap(), OrderStatus::PartiallyFilled);
        let err = OrderStatus::from_code("OE_MYSTERY").unwrap_err();
        assert!(err.is_contract_violation());
    }

    #[test]
    fn test_annotations_append_only() {
        let mut order = Order::new(
            "1",
            Security::ticker("cb_sec_1"),
            Side::Buy,
            10.0,
            100,
            "ACC1",
            InstrumentType::Equity,
        );
        order.annotate("first");
        order.annotate("second");
        assert_eq!(order.annotations(), ["first", "second"]);
        assert_eq!(order.security.sec_id, "CB_SEC_1");
        assert_eq!(order.notional(), 1000.0);
    }

    #[test]
    fn test_broker_lookup_case_insensitive() {
        let broker = Broker::new("Zerodha", vec![]);
        assert!(broker.is_named("ZERODHA"));
        assert!(!broker.is_named("other"));
    }
}
