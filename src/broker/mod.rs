// =============================================================================
// Broker abstraction — the minimal contract the engine needs from a broker
// =============================================================================
//
// Live and mock brokers are peers behind one trait; a factory in main picks
// by account mode. Execution reports flow back over an unbounded channel so
// the trading loop applies fills in arrival order regardless of source.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::OrderSide;

pub mod alpaca;
pub mod mock;

pub use alpaca::AlpacaBroker;
pub use mock::MockBroker;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_number: String,
    pub cash: f64,
    pub equity: f64,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub pattern_day_trader: bool,
    pub trading_blocked: bool,
    pub account_blocked: bool,
}

/// A broker-reported position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    /// Signed quantity; positive long, negative short.
    pub quantity: f64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub unrealized_pl: f64,
}

/// A broker order acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub symbol: String,
    /// Signed quantity; positive buys, negative sells.
    pub quantity: f64,
    pub side: OrderSide,
    pub order_type: String,
    pub time_in_force: String,
    pub status: String,
    pub filled_qty: f64,
    pub filled_avg_price: f64,
}

/// A fill event delivered back to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub filled_qty: f64,
    pub avg_fill_price: f64,
    pub status: String,
    pub timestamp_ms: i64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Broker call failures. The engine never mutates the book on any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Non-2xx response.
    Http { status: u16, body: String },
    /// The call did not complete within the configured timeout.
    Timeout(String),
    /// The response body could not be interpreted.
    Parse(String),
    /// The broker rejected the request.
    Rejected(String),
    /// Transport-level failure.
    Transport(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { status, body } => write!(f, "broker HTTP {status}: {body}"),
            Self::Timeout(what) => write!(f, "broker timeout: {what}"),
            Self::Parse(what) => write!(f, "broker response parse failure: {what}"),
            Self::Rejected(why) => write!(f, "broker rejected request: {why}"),
            Self::Transport(what) => write!(f, "broker transport failure: {what}"),
        }
    }
}

impl std::error::Error for BrokerError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The operations the core consumes. Mock and live implementations are
/// interchangeable behind this trait.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_account(&self) -> Result<AccountInfo, BrokerError>;

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Place a market order; positive quantity buys, negative sells.
    async fn place_market_order(
        &self,
        symbol: &str,
        signed_qty: f64,
        time_in_force: &str,
    ) -> Result<Order, BrokerError>;

    async fn close_position(&self, symbol: &str) -> Result<(), BrokerError>;

    async fn close_all_positions(&self) -> Result<(), BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn cancel_all_orders(&self) -> Result<(), BrokerError>;

    async fn get_open_orders(&self) -> Result<Vec<Order>, BrokerError>;

    async fn is_market_open(&self) -> Result<bool, BrokerError>;

    /// Inform the broker of a fresh mark. Simulated brokers fill against it;
    /// live brokers ignore it.
    fn note_market_price(&self, _symbol: &str, _price: f64) {}

    /// Take the fill-report receiver. Yields `Some` exactly once for brokers
    /// that deliver asynchronous execution reports.
    fn take_execution_receiver(&self) -> Option<mpsc::UnboundedReceiver<ExecutionReport>>;
}
