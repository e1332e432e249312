use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExchangeId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Orderbook,
    Place,
    Cancel,
}

impl OperationKind {
    pub const ALL: [OperationKind; 3] = [
        OperationKind::Orderbook,
        OperationKind::Place,
        OperationKind::Cancel,
    ];

    pub fn label(self) -> &'static str {
        match self {
            OperationKind::Orderbook => "Orderbook",
            OperationKind::Place => "Place Order",
            OperationKind::Cancel => "Cancel Order",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Orderbook => "orderbook",
            OperationKind::Place => "place",
            OperationKind::Cancel => "cancel",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transport {
    #[serde(rename = "rest")]
    Rest,
    #[serde(rename = "websocket", alias = "ws")]
    WebSocket,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Rest => "REST",
            Transport::WebSocket => "WS",
        })
    }
}

/// Identity of one latency series.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub exchange: ExchangeId,
    pub operation: OperationKind,
    pub transport: Transport,
}

impl SeriesKey {
    pub fn new(exchange: ExchangeId, operation: OperationKind, transport: Transport) -> Self {
        Self {
            exchange,
            operation,
            transport,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.operation, self.transport)
    }
}

/// Best bid/ask at the time of a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BookTop {
    pub best_bid: f64,
    pub best_ask: f64,
}

impl BookTop {
    pub fn mid(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.best_ask - self.best_bid
    }
}

/// An order that was placed successfully and has not been confirmed cancelled yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub order_id: OrderId,
    /// Transport the order was placed through; cleanup cancels through it first.
    pub transport: Transport,
    pub placed_at: SystemTime,
}
