//! Shutdown-time reconciliation of orders the sampler left open.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::capability::ExchangeCapability;
use crate::config::CleanupSection;
use crate::error::{classify, CapabilityError, FailureKind, FailureReason};
use crate::types::{ExchangeId, OpenOrder, OperationKind, OrderId, Symbol, Transport};

/// Orders placed successfully and not yet confirmed cancelled.
#[derive(Debug, Default)]
pub struct OpenOrderBook {
    orders: DashMap<(ExchangeId, OrderId), OpenOrder>,
}

impl OpenOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, order: OpenOrder) {
        self.orders
            .insert((order.exchange.clone(), order.order_id.clone()), order);
    }

    pub fn untrack(&self, exchange: &ExchangeId, order_id: &OrderId) -> Option<OpenOrder> {
        self.orders
            .remove(&(exchange.clone(), order_id.clone()))
            .map(|(_, order)| order)
    }

    pub fn contains(&self, exchange: &ExchangeId, order_id: &OrderId) -> bool {
        self.orders.contains_key(&(exchange.clone(), order_id.clone()))
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    /// Open orders grouped per exchange, oldest first.
    pub fn by_exchange(&self) -> BTreeMap<ExchangeId, Vec<OpenOrder>> {
        let mut grouped: BTreeMap<ExchangeId, Vec<OpenOrder>> = BTreeMap::new();
        for entry in self.orders.iter() {
            grouped
                .entry(entry.exchange.clone())
                .or_default()
                .push(entry.value().clone());
        }
        for orders in grouped.values_mut() {
            orders.sort_by(|a, b| a.placed_at.cmp(&b.placed_at));
        }
        grouped
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupPhase {
    Running,
    CleaningUp,
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CleanupStatus {
    Cancelled,
    /// The venue no longer knows the order.
    AlreadyClosed,
    Failed { reason: FailureReason },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderCleanup {
    pub order: OpenOrder,
    pub status: CleanupStatus,
    /// Transport that produced the final status; `None` when the deadline fired first.
    pub via: Option<Transport>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub outcomes: Vec<OrderCleanup>,
}

impl CleanupReport {
    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, CleanupStatus::Cancelled))
    }

    pub fn already_closed(&self) -> usize {
        self.count(|s| matches!(s, CleanupStatus::AlreadyClosed))
    }

    pub fn failures(&self) -> Vec<&OrderCleanup> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, CleanupStatus::Failed { .. }))
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failures().is_empty()
    }

    fn count(&self, pred: impl Fn(&CleanupStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.status)).count()
    }
}

/// Cancels every tracked order: native bulk cancel, then per-order cancels,
/// then the alternate transport for each transport whose path failed for every order.
pub struct CleanupCoordinator {
    book: Arc<OpenOrderBook>,
    venues: Vec<Arc<dyn ExchangeCapability>>,
    timeout: Duration,
    fallback: Option<Transport>,
    phase: Mutex<CleanupPhase>,
}

impl CleanupCoordinator {
    pub fn new(
        book: Arc<OpenOrderBook>,
        venues: Vec<Arc<dyn ExchangeCapability>>,
        settings: &CleanupSection,
    ) -> Self {
        Self::with_settings(book, venues, settings.timeout(), settings.fallback_transport)
    }

    pub fn with_settings(
        book: Arc<OpenOrderBook>,
        venues: Vec<Arc<dyn ExchangeCapability>>,
        timeout: Duration,
        fallback: Option<Transport>,
    ) -> Self {
        Self {
            book,
            venues,
            timeout,
            fallback,
            phase: Mutex::new(CleanupPhase::Running),
        }
    }

    pub fn phase(&self) -> CleanupPhase {
        *self.phase.lock()
    }

    fn transition(&self, next: CleanupPhase) {
        let mut phase = self.phase.lock();
        info!(from = ?*phase, to = ?next, "cleanup phase transition");
        *phase = next;
    }

    /// Runs once; later calls return an empty report.
    pub async fn run(&self) -> CleanupReport {
        {
            let phase = self.phase.lock();
            if *phase != CleanupPhase::Running {
                debug!(phase = ?*phase, "cleanup already ran");
                return CleanupReport::default();
            }
        }
        self.transition(CleanupPhase::CleaningUp);

        let groups = self.book.by_exchange();
        let total: usize = groups.values().map(Vec::len).sum();
        info!(open_orders = total, exchanges = groups.len(), "cleaning up open orders");

        let results: Mutex<Vec<OrderCleanup>> = Mutex::new(Vec::with_capacity(total));
        let work = join_all(
            groups
                .iter()
                .map(|(exchange, orders)| self.clean_exchange(exchange, orders, &results)),
        );
        let timed_out = tokio::time::timeout(self.timeout, work).await.is_err();

        let mut outcomes = results.into_inner();
        if timed_out {
            let settled: HashSet<(ExchangeId, OrderId)> = outcomes
                .iter()
                .map(|o| (o.order.exchange.clone(), o.order.order_id.clone()))
                .collect();
            for order in groups.into_values().flatten() {
                if settled.contains(&(order.exchange.clone(), order.order_id.clone())) {
                    continue;
                }
                error!(
                    exchange = %order.exchange,
                    order_id = %order.order_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "order still open when cleanup deadline elapsed"
                );
                outcomes.push(OrderCleanup {
                    order,
                    status: CleanupStatus::Failed {
                        reason: FailureReason::new(
                            FailureKind::Timeout,
                            format!("cleanup deadline of {:?} elapsed", self.timeout),
                        ),
                    },
                    via: None,
                });
            }
        }

        let report = CleanupReport { outcomes };
        self.transition(CleanupPhase::Done);
        info!(
            cancelled = report.cancelled(),
            already_closed = report.already_closed(),
            failed = report.failures().len(),
            "cleanup finished"
        );
        report
    }

    fn venue(&self, exchange: &ExchangeId, transport: Transport) -> Option<&Arc<dyn ExchangeCapability>> {
        self.venues
            .iter()
            .find(|v| v.exchange() == exchange && v.transport() == transport)
    }

    fn any_venue(&self, exchange: &ExchangeId) -> Option<&Arc<dyn ExchangeCapability>> {
        self.venues
            .iter()
            .filter(|v| v.exchange() == exchange)
            .find(|v| v.supports(OperationKind::Cancel))
            .or_else(|| self.venues.iter().find(|v| v.exchange() == exchange))
    }

    async fn clean_exchange(
        &self,
        exchange: &ExchangeId,
        orders: &[OpenOrder],
        results: &Mutex<Vec<OrderCleanup>>,
    ) {
        let Some(primary) = self.any_venue(exchange) else {
            error!(%exchange, orders = orders.len(), "no capability registered for exchange");
            for order in orders {
                self.settle(
                    results,
                    order.clone(),
                    Err(FailureReason::new(
                        FailureKind::ConnectionError,
                        "no capability registered for exchange",
                    )),
                    None,
                );
            }
            return;
        };

        // 1. native bulk cancel, once per symbol
        let mut remaining: Vec<OpenOrder> = Vec::new();
        let mut symbols: Vec<&Symbol> = orders.iter().map(|o| &o.symbol).collect();
        symbols.sort();
        symbols.dedup();
        for symbol in symbols {
            let batch: Vec<&OpenOrder> = orders.iter().filter(|o| &o.symbol == symbol).collect();
            match primary.cancel_all(symbol).await {
                Ok(bulk) => {
                    info!(
                        %exchange,
                        %symbol,
                        cancelled = bulk.cancelled.len(),
                        failed = bulk.failed.len(),
                        "bulk cancel returned"
                    );
                    for order in batch {
                        if bulk.cancelled.contains(&order.order_id) {
                            self.settle(results, order.clone(), Ok(()), Some(primary.transport()));
                        } else {
                            remaining.push(order.clone());
                        }
                    }
                }
                Err(err) => {
                    let reason = classify(&err);
                    if err.downcast_ref::<CapabilityError>()
                        .is_some_and(|e| matches!(e, CapabilityError::Unsupported(_)))
                    {
                        debug!(%exchange, %symbol, "bulk cancel unsupported; cancelling individually");
                    } else {
                        warn!(%exchange, %symbol, kind = %reason.kind, error = %reason.message, "bulk cancel failed");
                    }
                    remaining.extend(batch.into_iter().cloned());
                }
            }
        }
        if remaining.is_empty() {
            return;
        }

        // 2. individual cancels over the transport each order was placed through
        let mut by_transport: BTreeMap<Transport, Vec<OpenOrder>> = BTreeMap::new();
        for order in remaining {
            by_transport.entry(order.transport).or_default().push(order);
        }
        for (transport, group) in by_transport {
            let venue = self.venue(exchange, transport).unwrap_or(primary);
            self.cancel_group(exchange, venue, group, results).await;
        }
    }

    /// Individual cancels over one transport, then the alternate transport
    /// for that transport's orders if none of them got through.
    async fn cancel_group(
        &self,
        exchange: &ExchangeId,
        venue: &Arc<dyn ExchangeCapability>,
        group: Vec<OpenOrder>,
        results: &Mutex<Vec<OrderCleanup>>,
    ) {
        let transport = venue.transport();
        info!(%exchange, %transport, orders = group.len(), "cancelling orders individually");
        let batch = venue.cleanup_open_orders(&group).await;

        let mut failed: Vec<(OpenOrder, FailureReason)> = Vec::new();
        let mut resolved = 0usize;
        for (order, result) in batch.outcomes {
            match result {
                Err(reason) if reason.kind != FailureKind::NotFound => failed.push((order, reason)),
                other => {
                    resolved += 1;
                    self.settle(results, order, other, Some(transport));
                }
            }
        }
        if failed.is_empty() {
            return;
        }

        // 3. alternate transport, only when this path failed for every order
        let fallback = self
            .fallback
            .filter(|fallback| resolved == 0 && *fallback != transport)
            .and_then(|fallback| self.venue(exchange, fallback));
        let Some(fallback) = fallback else {
            for (order, reason) in failed {
                self.settle(results, order, Err(reason), Some(transport));
            }
            return;
        };

        // Orders already tried over the alternate transport are final.
        let (retry, settled): (Vec<_>, Vec<_>) = failed
            .into_iter()
            .partition(|(order, _)| order.transport != fallback.transport());
        for (order, reason) in settled {
            self.settle(results, order, Err(reason), Some(transport));
        }
        if retry.is_empty() {
            return;
        }

        warn!(
            %exchange,
            %transport,
            fallback = %fallback.transport(),
            orders = retry.len(),
            "cancellation path failed for every order; retrying over alternate transport"
        );
        let retry: Vec<OpenOrder> = retry.into_iter().map(|(order, _)| order).collect();
        let batch = fallback.cleanup_open_orders(&retry).await;
        for (order, result) in batch.outcomes {
            self.settle(results, order, result, Some(fallback.transport()));
        }
    }

    fn settle(
        &self,
        results: &Mutex<Vec<OrderCleanup>>,
        order: OpenOrder,
        result: Result<(), FailureReason>,
        via: Option<Transport>,
    ) {
        let status = match result {
            Ok(()) => CleanupStatus::Cancelled,
            Err(reason) if reason.kind == FailureKind::NotFound => CleanupStatus::AlreadyClosed,
            Err(reason) => CleanupStatus::Failed { reason },
        };
        match &status {
            CleanupStatus::Cancelled | CleanupStatus::AlreadyClosed => {
                self.book.untrack(&order.exchange, &order.order_id);
                debug!(exchange = %order.exchange, order_id = %order.order_id, ?status, "order released");
            }
            CleanupStatus::Failed { reason } => {
                error!(
                    exchange = %order.exchange,
                    order_id = %order.order_id,
                    kind = %reason.kind,
                    error = %reason.message,
                    "failed to cancel order during cleanup"
                );
            }
        }
        results.lock().push(OrderCleanup { order, status, via });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::sim::{SimProfile, SimVenue, SimulatedExchange};
    use crate::types::Side;
    use std::time::SystemTime;

    fn order(exchange: &str, id: &str) -> OpenOrder {
        OpenOrder {
            exchange: ExchangeId(exchange.into()),
            symbol: Symbol("BTCUSDT".into()),
            order_id: OrderId(id.into()),
            transport: Transport::Rest,
            placed_at: SystemTime::now(),
        }
    }

    #[test]
    fn book_groups_per_exchange() {
        let book = OpenOrderBook::new();
        book.track(order("a", "1"));
        book.track(order("b", "2"));
        book.track(order("a", "3"));
        let grouped = book.by_exchange();
        assert_eq!(grouped[&ExchangeId("a".into())].len(), 2);
        assert_eq!(grouped[&ExchangeId("b".into())].len(), 1);

        assert!(book.untrack(&ExchangeId("a".into()), &OrderId("1".into())).is_some());
        assert!(!book.contains(&ExchangeId("a".into()), &OrderId("1".into())));
        assert_eq!(book.len(), 2);
    }

    #[tokio::test]
    async fn empty_book_finishes_clean() {
        let coordinator = CleanupCoordinator::with_settings(
            Arc::new(OpenOrderBook::new()),
            Vec::new(),
            Duration::from_secs(1),
            None,
        );
        assert_eq!(coordinator.phase(), CleanupPhase::Running);
        let report = coordinator.run().await;
        assert!(report.is_clean());
        assert_eq!(coordinator.phase(), CleanupPhase::Done);
    }

    #[tokio::test]
    async fn bulk_cancel_releases_sim_orders() {
        let venue = SimVenue::new(ExchangeId("sim".into()), SimProfile::instant());
        let rest = Arc::new(SimulatedExchange::new(
            venue.clone(),
            Symbol("BTCUSDT".into()),
            Transport::Rest,
            0.01,
            Duration::from_secs(1),
        ));
        let book = Arc::new(OpenOrderBook::new());
        for _ in 0..2 {
            let id = rest.place_order(Side::Buy, 0.001, 100.0).await.unwrap();
            book.track(OpenOrder {
                order_id: id,
                ..order("sim", "unused")
            });
        }

        let coordinator = CleanupCoordinator::with_settings(
            book.clone(),
            vec![rest as Arc<dyn ExchangeCapability>],
            Duration::from_secs(1),
            Some(Transport::Rest),
        );
        let report = coordinator.run().await;
        assert_eq!(report.cancelled(), 2);
        assert!(book.is_empty());
        assert_eq!(venue.open_order_count(), 0);
    }
}
