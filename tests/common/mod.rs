//! Scripted in-memory capability for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use exchange_latency_bench::capability::{BulkCancel, ExchangeCapability};
use exchange_latency_bench::config::Config;
use exchange_latency_bench::error::CapabilityError;
use exchange_latency_bench::types::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Bulk {
    Unsupported,
    Fails,
    /// Succeeds but only reports the ids given to `bulk_reports`.
    Partial,
}

pub struct ScriptedExchange {
    exchange: ExchangeId,
    symbol: Symbol,
    transport: Transport,
    connect_failures: AtomicU32,
    fetch_fail_every: u64,
    fetch_delay: Duration,
    cancel_delay: Duration,
    failing_cancels: Mutex<HashSet<OrderId>>,
    unknown_orders: Mutex<HashSet<OrderId>>,
    fail_all_cancels: bool,
    bulk: Bulk,
    bulk_reports: Mutex<Vec<OrderId>>,
    next_order: AtomicU64,
    pub connects: AtomicU32,
    pub fetches: AtomicU64,
    pub cancels: Mutex<Vec<OrderId>>,
    pub cancel_attempts: AtomicU64,
}

impl ScriptedExchange {
    pub fn new(exchange: &str, transport: Transport) -> Self {
        Self {
            exchange: ExchangeId(exchange.into()),
            symbol: Symbol("BTCUSDT".into()),
            transport,
            connect_failures: AtomicU32::new(0),
            fetch_fail_every: 0,
            fetch_delay: Duration::ZERO,
            cancel_delay: Duration::ZERO,
            failing_cancels: Mutex::new(HashSet::new()),
            unknown_orders: Mutex::new(HashSet::new()),
            fail_all_cancels: false,
            bulk: Bulk::Unsupported,
            bulk_reports: Mutex::new(Vec::new()),
            next_order: AtomicU64::new(1),
            connects: AtomicU32::new(0),
            fetches: AtomicU64::new(0),
            cancels: Mutex::new(Vec::new()),
            cancel_attempts: AtomicU64::new(0),
        }
    }

    /// `u32::MAX` never connects.
    pub fn connect_failures(self, n: u32) -> Self {
        self.connect_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every `n`-th orderbook fetch fails with a connection error.
    pub fn fetch_fail_every(mut self, n: u64) -> Self {
        self.fetch_fail_every = n;
        self
    }

    pub fn fetch_delay(mut self, d: Duration) -> Self {
        self.fetch_delay = d;
        self
    }

    pub fn cancel_delay(mut self, d: Duration) -> Self {
        self.cancel_delay = d;
        self
    }

    pub fn failing_cancel(self, id: &str) -> Self {
        self.failing_cancels.lock().insert(OrderId(id.into()));
        self
    }

    pub fn unknown_order(self, id: &str) -> Self {
        self.unknown_orders.lock().insert(OrderId(id.into()));
        self
    }

    pub fn fail_all_cancels(mut self) -> Self {
        self.fail_all_cancels = true;
        self
    }

    pub fn bulk(mut self, bulk: Bulk) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn bulk_reports(self, ids: &[&str]) -> Self {
        self.bulk_reports
            .lock()
            .extend(ids.iter().map(|id| OrderId((*id).into())));
        self
    }

    pub fn cancelled_ids(&self) -> Vec<OrderId> {
        self.cancels.lock().clone()
    }
}

#[async_trait]
impl ExchangeCapability for ScriptedExchange {
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
        0.01
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining == 0 {
            return Ok(());
        }
        if remaining != u32::MAX {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
        }
        Err(CapabilityError::Connection("handshake refused".into()).into())
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.fetch_fail_every > 0 && n % self.fetch_fail_every == 0 {
            return Err(CapabilityError::Connection("connection reset by peer".into()).into());
        }
        Ok(BookTop {
            best_bid: 99.0,
            best_ask: 101.0,
        })
    }

    async fn place_order(&self, _side: Side, _size: f64, _price: f64) -> anyhow::Result<OrderId> {
        let n = self.next_order.fetch_add(1, Ordering::SeqCst);
        Ok(OrderId(format!("{}-{n}", self.exchange)))
    }

    async fn cancel_order(&self, order_id: &OrderId) -> anyhow::Result<()> {
        self.cancel_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.cancel_delay.is_zero() {
            tokio::time::sleep(self.cancel_delay).await;
        }
        if self.fail_all_cancels || self.failing_cancels.lock().contains(order_id) {
            return Err(CapabilityError::Connection(format!("socket closed while cancelling {order_id}")).into());
        }
        if self.unknown_orders.lock().contains(order_id) {
            return Err(CapabilityError::api(Some(-2011), "Unknown order sent.").into());
        }
        self.cancels.lock().push(order_id.clone());
        Ok(())
    }

    async fn cancel_all(&self, _symbol: &Symbol) -> anyhow::Result<BulkCancel> {
        match self.bulk {
            Bulk::Unsupported => Err(CapabilityError::Unsupported("bulk cancel").into()),
            Bulk::Fails => Err(CapabilityError::api(Some(-1003), "Too many requests").into()),
            Bulk::Partial => Ok(BulkCancel {
                cancelled: self.bulk_reports.lock().clone(),
                failed: Vec::new(),
            }),
        }
    }
}

pub fn open_order(exchange: &str, id: &str, transport: Transport) -> OpenOrder {
    OpenOrder {
        exchange: ExchangeId(exchange.into()),
        symbol: Symbol("BTCUSDT".into()),
        order_id: OrderId(id.into()),
        transport,
        placed_at: SystemTime::now(),
    }
}

pub fn shared(ex: ScriptedExchange) -> Arc<dyn ExchangeCapability> {
    Arc::new(ex)
}

/// Orderbook-only sampling over REST with millisecond delays.
pub fn fast_config() -> Config {
    let mut config = Config::sample();
    config.test.delay_min_ms = 1;
    config.test.delay_max_ms = 3;
    config.test.operation_timeout_ms = 1_000;
    config.test.shutdown_grace_ms = 1_000;
    config.test.setup_retries = 2;
    config.test.setup_backoff_ms = 5;
    config.operations.orderbook = vec![Transport::Rest];
    config.operations.place = Vec::new();
    config.operations.cancel = Vec::new();
    config
}
