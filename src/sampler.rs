//! Concurrent sampling loops.
//!
//! One loop per enabled (exchange, operation, transport). Each loop times its
//! capability call, records the outcome into the matching series and sleeps a
//! random inter-request delay, until the global stop is raised. Failures are
//! classified and recorded, never propagated.

use std::future::Future;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::join_all;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use std::collections::VecDeque;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::capability::ExchangeCapability;
use crate::cleanup::{CleanupCoordinator, CleanupReport, OpenOrderBook};
use crate::config::Config;
use crate::error::{classify, CapabilityError, FailureKind, FailureReason};
use crate::events::SampleRecord;
use crate::lifecycle::{StopHandle, StopReason, StopSignal};
use crate::metrics::registry::SeriesRegistry;
use crate::metrics::series::LatencySeries;
use crate::pricing::limit_price;
use crate::types::{BookTop, ExchangeId, OpenOrder, OperationKind, SeriesKey, Side, Transport};

#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("no exchange capabilities configured")]
    NoVenues,
    #[error("setup failed for every venue ({} failures)", .0.len())]
    AllVenuesFailed(Vec<SetupFailure>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetupFailure {
    pub exchange: ExchangeId,
    pub transport: Transport,
    pub attempts: u32,
    pub reason: FailureReason,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SamplerReport {
    pub venues_started: usize,
    pub setup_failures: Vec<SetupFailure>,
    /// Loops still running when the shutdown grace period ran out.
    pub forced_terminations: usize,
    pub cleanup: CleanupReport,
}

pub struct Sampler {
    config: Config,
    registry: SeriesRegistry,
    open_orders: Arc<OpenOrderBook>,
    venues: Vec<Arc<dyn ExchangeCapability>>,
}

impl Sampler {
    pub fn new(
        config: Config,
        registry: SeriesRegistry,
        venues: Vec<Arc<dyn ExchangeCapability>>,
    ) -> Self {
        Self {
            config,
            registry,
            open_orders: Arc::new(OpenOrderBook::new()),
            venues,
        }
    }

    pub fn registry(&self) -> &SeriesRegistry {
        &self.registry
    }

    pub fn open_orders(&self) -> &Arc<OpenOrderBook> {
        &self.open_orders
    }

    /// Operations this venue is sampled for.
    pub fn enabled_operations(&self, venue: &dyn ExchangeCapability) -> Vec<OperationKind> {
        let transport = venue.transport();
        let mut ops: Vec<OperationKind> = OperationKind::ALL
            .into_iter()
            .filter(|op| self.config.operations.is_enabled(*op, transport) && venue.supports(*op))
            .collect();
        if ops.contains(&OperationKind::Place) && !ops.contains(&OperationKind::Cancel) {
            warn!(
                exchange = %venue.exchange(),
                %transport,
                "place supported without cancel; not placing orders"
            );
            ops.retain(|op| *op != OperationKind::Place);
        }
        ops
    }

    /// Samples until `stop` is raised, then drains the loops, cancels any
    /// orders left open and disconnects.
    pub async fn run(&self, stop: &StopHandle) -> Result<SamplerReport, SamplerError> {
        if self.venues.is_empty() {
            return Err(SamplerError::NoVenues);
        }

        let setups = join_all(self.venues.iter().map(|venue| self.setup(venue, stop))).await;
        let mut started = Vec::new();
        let mut setup_failures = Vec::new();
        for (venue, result) in self.venues.iter().zip(setups) {
            match result {
                Ok(()) => started.push(venue.clone()),
                Err(failure) => setup_failures.push(failure),
            }
        }

        if started.is_empty() {
            if stop.trigger(StopReason::SetupFailed) {
                error!(failures = setup_failures.len(), "no venue could be set up");
                return Err(SamplerError::AllVenuesFailed(setup_failures));
            }
            return Ok(SamplerReport {
                setup_failures,
                ..SamplerReport::default()
            });
        }

        let mut loops = JoinSet::new();
        for venue in &started {
            self.spawn_venue(&mut loops, venue.clone(), stop);
        }
        info!(
            venues = started.len(),
            loops = loops.len(),
            "sampling started"
        );

        let reason = stop.signal().stopped().await;
        info!(%reason, "stopping sampling loops");
        let forced_terminations = drain(&mut loops, self.config.test.shutdown_grace()).await;

        let cleanup =
            CleanupCoordinator::new(self.open_orders.clone(), started.clone(), &self.config.cleanup)
                .run()
                .await;

        for venue in &started {
            if let Err(e) = venue.disconnect().await {
                warn!(exchange = %venue.exchange(), transport = %venue.transport(), error = %e, "disconnect failed");
            }
        }

        Ok(SamplerReport {
            venues_started: started.len(),
            setup_failures,
            forced_terminations,
            cleanup,
        })
    }

    async fn setup(
        &self,
        venue: &Arc<dyn ExchangeCapability>,
        stop: &StopHandle,
    ) -> Result<(), SetupFailure> {
        let retries = self.config.test.setup_retries;
        let backoff = Duration::from_millis(self.config.test.setup_backoff_ms);
        let mut signal = stop.signal();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match venue.connect().await {
                Ok(()) => {
                    debug!(exchange = %venue.exchange(), transport = %venue.transport(), attempts, "venue connected");
                    return Ok(());
                }
                Err(err) => err,
            };
            let reason = classify(&err);
            if attempts > retries || signal.is_stopped() {
                error!(
                    exchange = %venue.exchange(),
                    transport = %venue.transport(),
                    attempts,
                    kind = %reason.kind,
                    error = %reason.message,
                    "venue setup failed; no loops will run for it"
                );
                return Err(SetupFailure {
                    exchange: venue.exchange().clone(),
                    transport: venue.transport(),
                    attempts,
                    reason,
                });
            }
            let delay = backoff.saturating_mul(1 << (attempts - 1).min(16));
            debug!(exchange = %venue.exchange(), transport = %venue.transport(), attempts, ?delay, "retrying venue setup");
            tokio::select! {
                _ = signal.stopped() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn_venue(
        &self,
        loops: &mut JoinSet<()>,
        venue: Arc<dyn ExchangeCapability>,
        stop: &StopHandle,
    ) {
        let ops = self.enabled_operations(venue.as_ref());
        let test = &self.config.test;
        let (quotes_tx, quotes_rx) = watch::channel(None::<BookTop>);
        let ctx = |op: OperationKind| LoopCtx {
            venue: venue.clone(),
            series: self.registry.series(&SeriesKey::new(
                venue.exchange().clone(),
                op,
                venue.transport(),
            )),
            stop: stop.signal(),
            delay: test.delay_min_ms..=test.delay_max_ms,
            timeout: test.operation_timeout(),
        };

        if ops.contains(&OperationKind::Orderbook) {
            loops.spawn(orderbook_loop(ctx(OperationKind::Orderbook), quotes_tx));
        }
        if ops.contains(&OperationKind::Place) {
            let slots = Arc::new(Semaphore::new(test.max_open_orders));
            let (orders_tx, orders_rx) = mpsc::channel(test.max_open_orders);
            let order = OrderParams {
                side: test.side,
                size: test.order_size,
                market_offset: test.market_offset,
            };
            loops.spawn(place_loop(
                ctx(OperationKind::Place),
                order,
                quotes_rx,
                slots,
                orders_tx,
                self.open_orders.clone(),
            ));
            loops.spawn(cancel_loop(
                ctx(OperationKind::Cancel),
                orders_rx,
                self.open_orders.clone(),
            ));
        } else if ops.contains(&OperationKind::Cancel) {
            debug!(exchange = %venue.exchange(), transport = %venue.transport(), "cancel enabled without place; nothing to cancel");
        }
    }
}

/// Waits up to `grace` for the loops to exit, then aborts the rest.
async fn drain(loops: &mut JoinSet<()>, grace: Duration) -> usize {
    let graceful = tokio::time::timeout(grace, async {
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "sampling loop panicked");
            }
        }
    })
    .await;
    if graceful.is_ok() {
        return 0;
    }
    let forced = loops.len();
    warn!(forced, ?grace, "grace period elapsed; aborting remaining loops");
    loops.abort_all();
    while loops.join_next().await.is_some() {}
    forced
}

struct LoopCtx {
    venue: Arc<dyn ExchangeCapability>,
    series: Arc<LatencySeries>,
    stop: StopSignal,
    delay: RangeInclusive<u64>,
    timeout: Duration,
}

impl LoopCtx {
    /// Times `call` under the per-operation deadline and records the outcome.
    async fn measure<T>(
        &self,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, FailureReason> {
        let ts = SystemTime::now();
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, call).await;
        let elapsed = start.elapsed();
        let key = self.series.key().clone();
        let (duration, err) = match outcome {
            Ok(Ok(value)) => {
                self.series.record(SampleRecord::success(key, ts, elapsed));
                return Ok(value);
            }
            Ok(Err(err)) => (Some(elapsed), err),
            // Our own deadline fired; the true latency is unknown.
            Err(_) => (None, anyhow::Error::from(CapabilityError::Timeout(self.timeout))),
        };

        let reason = classify(&err);
        warn!(
            exchange = %key.exchange,
            operation = %key.operation,
            transport = %key.transport,
            kind = %reason.kind,
            error = %reason.message,
            "operation failed"
        );
        self.series
            .record(SampleRecord::failure(key, ts, duration, reason.clone()));
        Err(reason)
    }

    /// Random inter-request delay; `false` once the stop is raised.
    async fn pause(&mut self) -> bool {
        let ms = rand::thread_rng().gen_range(self.delay.clone());
        tokio::select! {
            biased;
            _ = self.stop.stopped() => false,
            _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
        }
    }
}

/// A placed order and the open-order slot it holds until it is released.
type Placed = (OpenOrder, OwnedSemaphorePermit);

#[derive(Clone, Copy)]
struct OrderParams {
    side: Side,
    size: f64,
    market_offset: f64,
}

async fn orderbook_loop(mut ctx: LoopCtx, quotes: watch::Sender<Option<BookTop>>) {
    while !ctx.stop.is_stopped() {
        if let Ok(top) = ctx.measure(ctx.venue.fetch_orderbook()).await {
            quotes.send_replace(Some(top));
        }
        if !ctx.pause().await {
            break;
        }
    }
}

async fn place_loop(
    mut ctx: LoopCtx,
    order: OrderParams,
    quotes: watch::Receiver<Option<BookTop>>,
    slots: Arc<Semaphore>,
    orders: mpsc::Sender<Placed>,
    book: Arc<OpenOrderBook>,
) {
    while !ctx.stop.is_stopped() {
        // A slot is held from placement until the order is confirmed gone.
        let slot = tokio::select! {
            biased;
            _ = ctx.stop.stopped() => break,
            slot = slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        let latest = *quotes.borrow();
        let top = match latest {
            Some(top) => Some(top),
            None => match tokio::time::timeout(ctx.timeout, ctx.venue.fetch_orderbook()).await {
                Ok(Ok(top)) => Some(top),
                Ok(Err(err)) => {
                    warn!(exchange = %ctx.venue.exchange(), error = %format!("{err:#}"), "no quote to price order from; skipping");
                    None
                }
                Err(_) => {
                    warn!(exchange = %ctx.venue.exchange(), "quote fetch timed out; skipping");
                    None
                }
            },
        };
        let price = top.and_then(|top| {
            limit_price(&top, order.side, order.market_offset, ctx.venue.tick_size())
        });

        if let Some(price) = price {
            let placed = ctx
                .measure(ctx.venue.place_order(order.side, order.size, price))
                .await;
            if let Ok(order_id) = placed {
                let open = OpenOrder {
                    exchange: ctx.venue.exchange().clone(),
                    symbol: ctx.venue.symbol().clone(),
                    order_id,
                    transport: ctx.venue.transport(),
                    placed_at: SystemTime::now(),
                };
                book.track(open.clone());
                if orders.send((open, slot)).await.is_err() {
                    debug!(exchange = %ctx.venue.exchange(), "cancel loop gone; order left for cleanup");
                    break;
                }
            }
        } else if top.is_some() {
            warn!(exchange = %ctx.venue.exchange(), ?top, "quote unusable for pricing; skipping");
        }

        if !ctx.pause().await {
            break;
        }
    }
}

async fn cancel_loop(
    mut ctx: LoopCtx,
    mut orders: mpsc::Receiver<Placed>,
    book: Arc<OpenOrderBook>,
) {
    // Orders whose cancel failed keep their slot and are retried first.
    let mut retry: VecDeque<Placed> = VecDeque::new();
    loop {
        let next = match retry.pop_front() {
            Some(placed) => Some(placed),
            None => tokio::select! {
                biased;
                _ = ctx.stop.stopped() => break,
                next = orders.recv() => next,
            },
        };
        let Some((order, slot)) = next else { break };

        match ctx.measure(ctx.venue.cancel_order(&order.order_id)).await {
            Ok(()) => {
                book.untrack(&order.exchange, &order.order_id);
                drop(slot);
            }
            Err(reason) if reason.kind == FailureKind::NotFound => {
                book.untrack(&order.exchange, &order.order_id);
                drop(slot);
            }
            // Still open on the venue; stays tracked so cleanup sees it if this loop stops first.
            Err(_) => retry.push_back((order, slot)),
        }

        if !ctx.pause().await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::sim::{SimProfile, SimVenue, SimulatedExchange};
    use crate::types::Symbol;

    fn sim_config() -> Config {
        let mut config = Config::sample();
        config.test.delay_min_ms = 1;
        config.test.delay_max_ms = 2;
        config.test.shutdown_grace_ms = 500;
        config
    }

    fn sim(transport: Transport) -> Arc<dyn ExchangeCapability> {
        let venue = SimVenue::new(ExchangeId("sim".into()), SimProfile::instant());
        Arc::new(SimulatedExchange::new(
            venue,
            Symbol("BTCUSDT".into()),
            transport,
            0.01,
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn no_venues_is_an_error() {
        let sampler = Sampler::new(sim_config(), SeriesRegistry::new(None), Vec::new());
        let err = sampler.run(&StopHandle::new()).await.unwrap_err();
        assert!(matches!(err, SamplerError::NoVenues));
    }

    #[tokio::test]
    async fn samples_every_operation_and_cleans_up() {
        let registry = SeriesRegistry::new(Some(100));
        let sampler = Sampler::new(sim_config(), registry.clone(), vec![sim(Transport::Rest)]);
        let stop = StopHandle::new();
        let trigger = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                stop.trigger(StopReason::Requested);
            })
        };

        let report = sampler.run(&stop).await.unwrap();
        trigger.await.unwrap();

        assert_eq!(report.venues_started, 1);
        assert_eq!(report.forced_terminations, 0);
        assert!(report.cleanup.is_clean());
        assert!(sampler.open_orders().is_empty());
        for op in OperationKind::ALL {
            let key = SeriesKey::new(ExchangeId("sim".into()), op, Transport::Rest);
            let series = registry.get(&key).unwrap();
            assert!(series.counts().successes > 0, "{key} recorded nothing");
        }
    }

    #[test]
    fn place_requires_cancel_support() {
        let mut config = sim_config();
        config.operations.cancel.clear();
        config.operations.place = vec![Transport::Rest];
        let sampler = Sampler::new(config, SeriesRegistry::new(None), Vec::new());
        let venue = sim(Transport::Rest);
        assert_eq!(
            sampler.enabled_operations(venue.as_ref()),
            vec![OperationKind::Orderbook]
        );
    }
}
