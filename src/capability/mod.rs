use async_trait::async_trait;

use crate::error::{classify, CapabilityError, FailureReason};
use crate::types::{BookTop, ExchangeId, OpenOrder, OperationKind, OrderId, Side, Symbol, Transport};

pub mod binance;
pub mod correlator;
pub mod factory;
pub mod hyperliquid;
pub(crate) mod link;
pub mod sim;

/// What one exchange offers over one transport.
///
/// Implementations own their connection lifecycle; the sampler only ever sees
/// `Arc<dyn ExchangeCapability>` and times each call from the outside.
#[async_trait]
pub trait ExchangeCapability: Send + Sync {
    fn exchange(&self) -> &ExchangeId;

    fn transport(&self) -> Transport;

    fn symbol(&self) -> &Symbol;

    fn tick_size(&self) -> f64;

    fn supports(&self, _op: OperationKind) -> bool {
        true
    }

    async fn connect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop>;

    async fn place_order(&self, side: Side, size: f64, price: f64) -> anyhow::Result<OrderId>;

    async fn cancel_order(&self, order_id: &OrderId) -> anyhow::Result<()>;

    /// Native bulk cancellation for every open order on `symbol`.
    async fn cancel_all(&self, _symbol: &Symbol) -> anyhow::Result<BulkCancel> {
        Err(CapabilityError::Unsupported("bulk cancel").into())
    }

    /// Cancels each order individually; never stops at the first failure.
    async fn cleanup_open_orders(&self, orders: &[OpenOrder]) -> CleanupBatch {
        let mut outcomes = Vec::with_capacity(orders.len());
        for order in orders {
            let result = self
                .cancel_order(&order.order_id)
                .await
                .map_err(|err| classify(&err));
            outcomes.push((order.clone(), result));
        }
        CleanupBatch { outcomes }
    }
}

/// Result of a native bulk cancel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BulkCancel {
    pub cancelled: Vec<OrderId>,
    pub failed: Vec<(OrderId, FailureReason)>,
}

/// Per-order outcome of an individual-cancel sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CleanupBatch {
    pub outcomes: Vec<(OpenOrder, Result<(), FailureReason>)>,
}

impl CleanupBatch {
    pub fn cancelled_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failures(&self) -> Vec<(&OpenOrder, &FailureReason)> {
        self.outcomes
            .iter()
            .filter_map(|(order, r)| r.as_ref().err().map(|reason| (order, reason)))
            .collect()
    }
}
