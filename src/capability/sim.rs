//! In-process exchange with a configurable latency and failure profile.
//!
//! The REST flavour sleeps and answers inline. The WebSocket flavour pushes
//! id-tagged requests to a server task that answers out of order, and a
//! dispatcher task correlates the answers back through [`PendingRequests`].

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::capability::correlator::PendingRequests;
use crate::capability::{BulkCancel, ExchangeCapability};
use crate::error::CapabilityError;
use crate::types::{BookTop, ExchangeId, OrderId, Side, Symbol, Transport};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SimProfile {
    #[serde(default = "default_base_latency_ms")]
    pub base_latency_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Probability in [0, 1] that any request fails.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    #[serde(default = "default_start_price")]
    pub start_price: f64,
    #[serde(default = "default_spread")]
    pub spread: f64,
    /// Largest order notional the simulated account can fund.
    #[serde(default = "default_balance")]
    pub balance: f64,
    #[serde(default = "default_bulk_cancel")]
    pub bulk_cancel: bool,
}

const fn default_base_latency_ms() -> u64 {
    20
}

const fn default_jitter_ms() -> u64 {
    15
}

const fn default_failure_rate() -> f64 {
    0.02
}

const fn default_start_price() -> f64 {
    60_000.0
}

const fn default_spread() -> f64 {
    0.5
}

const fn default_balance() -> f64 {
    1_000_000.0
}

const fn default_bulk_cancel() -> bool {
    true
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            base_latency_ms: default_base_latency_ms(),
            jitter_ms: default_jitter_ms(),
            failure_rate: default_failure_rate(),
            start_price: default_start_price(),
            spread: default_spread(),
            balance: default_balance(),
            bulk_cancel: default_bulk_cancel(),
        }
    }
}

impl SimProfile {
    /// Zero latency, no injected failures.
    pub fn instant() -> Self {
        Self {
            base_latency_ms: 0,
            jitter_ms: 0,
            failure_rate: 0.0,
            ..Self::default()
        }
    }

    fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(self.base_latency_ms + jitter)
    }
}

#[derive(Clone, Debug)]
enum SimRequest {
    Book,
    Place { size: f64, price: f64 },
    Cancel(OrderId),
    CancelAll,
}

#[derive(Clone, Debug)]
enum SimResponse {
    Book(BookTop),
    Placed(OrderId),
    Cancelled,
    CancelledAll(Vec<OrderId>),
}

/// Matching-engine state shared by every transport of one simulated exchange.
#[derive(Debug)]
pub struct SimVenue {
    exchange: ExchangeId,
    profile: SimProfile,
    mid: Mutex<f64>,
    orders: DashMap<OrderId, f64>,
    next_order: AtomicU64,
}

impl SimVenue {
    pub fn new(exchange: ExchangeId, profile: SimProfile) -> Arc<Self> {
        Arc::new(Self {
            exchange,
            mid: Mutex::new(profile.start_price),
            profile,
            orders: DashMap::new(),
            next_order: AtomicU64::new(1),
        })
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.len()
    }

    fn apply(&self, req: SimRequest) -> Result<SimResponse, CapabilityError> {
        let roll: f64 = rand::thread_rng().gen();
        if roll < self.profile.failure_rate {
            return Err(injected_failure());
        }
        match req {
            SimRequest::Book => {
                let mut mid = self.mid.lock();
                *mid *= 1.0 + rand::thread_rng().gen_range(-0.0002..=0.0002);
                let half = self.profile.spread / 2.0;
                Ok(SimResponse::Book(BookTop {
                    best_bid: *mid - half,
                    best_ask: *mid + half,
                }))
            }
            SimRequest::Place { size, price } => {
                if size <= 0.0 || price <= 0.0 {
                    return Err(CapabilityError::api(
                        Some(-1013),
                        "Filter failure: invalid quantity or price",
                    ));
                }
                if size * price > self.profile.balance {
                    return Err(CapabilityError::api(
                        Some(-2010),
                        "Account has insufficient balance for requested action.",
                    ));
                }
                let n = self.next_order.fetch_add(1, Ordering::Relaxed);
                let order_id = OrderId(format!("{}-{n}", self.exchange));
                self.orders.insert(order_id.clone(), price);
                Ok(SimResponse::Placed(order_id))
            }
            SimRequest::Cancel(order_id) => match self.orders.remove(&order_id) {
                Some(_) => Ok(SimResponse::Cancelled),
                None => Err(CapabilityError::api(Some(-2011), "Unknown order sent.")),
            },
            SimRequest::CancelAll => {
                let ids: Vec<OrderId> = self.orders.iter().map(|kv| kv.key().clone()).collect();
                let cancelled = ids
                    .into_iter()
                    .filter(|id| self.orders.remove(id).is_some())
                    .collect();
                Ok(SimResponse::CancelledAll(cancelled))
            }
        }
    }
}

fn injected_failure() -> CapabilityError {
    match rand::thread_rng().gen_range(0..3) {
        0 => CapabilityError::Connection("connection reset by peer".into()),
        1 => CapabilityError::api(Some(-1003), "Too many requests"),
        _ => CapabilityError::Timeout(Duration::from_secs(10)),
    }
}

struct SimSocket {
    outbound: mpsc::UnboundedSender<(u64, SimRequest)>,
}

pub struct SimulatedExchange {
    exchange: ExchangeId,
    symbol: Symbol,
    transport: Transport,
    tick_size: f64,
    request_timeout: Duration,
    venue: Arc<SimVenue>,
    pending: Arc<PendingRequests<SimResponse>>,
    socket: Mutex<Option<SimSocket>>,
}

impl SimulatedExchange {
    pub fn new(
        venue: Arc<SimVenue>,
        symbol: Symbol,
        transport: Transport,
        tick_size: f64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            exchange: venue.exchange.clone(),
            symbol,
            transport,
            tick_size,
            request_timeout,
            venue,
            pending: Arc::new(PendingRequests::new()),
            socket: Mutex::new(None),
        }
    }

    pub fn venue(&self) -> &Arc<SimVenue> {
        &self.venue
    }

    async fn call(&self, req: SimRequest) -> Result<SimResponse, CapabilityError> {
        match self.transport {
            Transport::Rest => {
                tokio::time::sleep(self.venue.profile.delay()).await;
                self.venue.apply(req)
            }
            Transport::WebSocket => {
                let call = self.pending.register();
                {
                    let socket = self.socket.lock();
                    let Some(socket) = socket.as_ref() else {
                        return Err(CapabilityError::Connection("socket not connected".into()));
                    };
                    socket
                        .outbound
                        .send((call.id(), req))
                        .map_err(|_| CapabilityError::Connection("socket closed".into()))?;
                }
                call.wait(self.request_timeout).await
            }
        }
    }
}

#[async_trait]
impl ExchangeCapability for SimulatedExchange {
    fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    fn transport(&self) -> Transport {
        self.transport
    }

    fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    fn tick_size(&self) -> f64 {
        self.tick_size
    }

    async fn connect(&self) -> anyhow::Result<()> {
        if self.transport != Transport::WebSocket {
            return Ok(());
        }
        let mut socket = self.socket.lock();
        if socket.is_some() {
            return Ok(());
        }

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<(u64, SimRequest)>();
        let (inbound_tx, mut inbound_rx) =
            mpsc::unbounded_channel::<(u64, Result<SimResponse, CapabilityError>)>();

        // Server side: each request is answered after its own latency, so
        // responses come back in completion order rather than send order.
        let venue = self.venue.clone();
        tokio::spawn(async move {
            while let Some((id, req)) = outbound_rx.recv().await {
                let venue = venue.clone();
                let inbound_tx = inbound_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(venue.profile.delay()).await;
                    let _ = inbound_tx.send((id, venue.apply(req)));
                });
            }
        });

        // Client-side dispatcher.
        let pending = self.pending.clone();
        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            while let Some((id, result)) = inbound_rx.recv().await {
                if !pending.resolve(id, result) {
                    tracing::debug!(exchange = %exchange, request_id = id, "late response dropped");
                }
            }
            pending.fail_all("simulated socket closed");
        });

        *socket = Some(SimSocket {
            outbound: outbound_tx,
        });
        tracing::debug!(exchange = %self.exchange, "simulated websocket connected");
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.socket.lock().take();
        Ok(())
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop> {
        match self.call(SimRequest::Book).await? {
            SimResponse::Book(top) => Ok(top),
            other => Err(unexpected(other)),
        }
    }

    async fn place_order(&self, _side: Side, size: f64, price: f64) -> anyhow::Result<OrderId> {
        match self.call(SimRequest::Place { size, price }).await? {
            SimResponse::Placed(order_id) => Ok(order_id),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel_order(&self, order_id: &OrderId) -> anyhow::Result<()> {
        match self.call(SimRequest::Cancel(order_id.clone())).await? {
            SimResponse::Cancelled => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn cancel_all(&self, _symbol: &Symbol) -> anyhow::Result<BulkCancel> {
        if !self.venue.profile.bulk_cancel {
            return Err(CapabilityError::Unsupported("bulk cancel").into());
        }
        match self.call(SimRequest::CancelAll).await? {
            SimResponse::CancelledAll(cancelled) => Ok(BulkCancel {
                cancelled,
                failed: Vec::new(),
            }),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: SimResponse) -> anyhow::Error {
    CapabilityError::Parse(format!("unexpected response {resp:?}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{classify, FailureKind};

    fn exchange(transport: Transport, profile: SimProfile) -> SimulatedExchange {
        let venue = SimVenue::new(ExchangeId("sim".into()), profile);
        SimulatedExchange::new(
            venue,
            Symbol("BTCUSDT".into()),
            transport,
            0.01,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn rest_place_then_cancel() {
        let ex = exchange(Transport::Rest, SimProfile::instant());
        let top = ex.fetch_orderbook().await.unwrap();
        assert!(top.best_bid < top.best_ask);

        let id = ex.place_order(Side::Buy, 0.001, top.mid() * 0.95).await.unwrap();
        assert_eq!(ex.venue().open_order_count(), 1);
        ex.cancel_order(&id).await.unwrap();
        assert_eq!(ex.venue().open_order_count(), 0);

        let err = ex.cancel_order(&id).await.unwrap_err();
        assert_eq!(classify(&err).kind, FailureKind::NotFound);
    }

    #[tokio::test]
    async fn websocket_requires_connect() {
        let ex = exchange(Transport::WebSocket, SimProfile::instant());
        let err = ex.fetch_orderbook().await.unwrap_err();
        assert_eq!(classify(&err).kind, FailureKind::ConnectionError);

        ex.connect().await.unwrap();
        let top = ex.fetch_orderbook().await.unwrap();
        assert!(top.spread() > 0.0);
        ex.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_orders_are_unfunded() {
        let profile = SimProfile {
            balance: 10.0,
            ..SimProfile::instant()
        };
        let ex = exchange(Transport::Rest, profile);
        let err = ex.place_order(Side::Buy, 1.0, 100.0).await.unwrap_err();
        assert_eq!(classify(&err).kind, FailureKind::InsufficientFunds);
    }

    #[tokio::test]
    async fn bulk_cancel_can_be_disabled() {
        let profile = SimProfile {
            bulk_cancel: false,
            ..SimProfile::instant()
        };
        let ex = exchange(Transport::Rest, profile);
        assert!(ex.cancel_all(&Symbol("BTCUSDT".into())).await.is_err());
    }
}
