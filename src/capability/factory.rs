use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::debug;

use crate::capability::binance::{BinanceRest, BinanceWs};
use crate::capability::hyperliquid::{HyperliquidRest, HyperliquidWs};
use crate::capability::sim::{SimVenue, SimulatedExchange};
use crate::capability::ExchangeCapability;
use crate::config::{Config, ExchangeConfig, ExchangeKind};
use crate::types::{ExchangeId, OperationKind, Symbol, Transport};

/// One capability per (exchange, transport) that at least one operation is
/// measured over. Simulated transports of the same exchange share one venue so
/// an order placed over WS can be cancelled over REST.
pub fn build_venues(config: &Config) -> Result<Vec<Arc<dyn ExchangeCapability>>> {
    let timeout = config.test.operation_timeout();
    let mut venues: Vec<Arc<dyn ExchangeCapability>> = Vec::new();

    for exchange in &config.exchanges {
        let id = ExchangeId(exchange.id.clone());
        let symbol = Symbol(exchange.symbol.clone());
        let sim_venue = (exchange.kind == ExchangeKind::Simulated)
            .then(|| SimVenue::new(id.clone(), exchange.sim.clone()));

        for &transport in &exchange.transports {
            let used = OperationKind::ALL
                .iter()
                .any(|op| config.operations.is_enabled(*op, transport));
            if !used {
                debug!(exchange = %id, %transport, "transport not used by any operation; skipping");
                continue;
            }

            let capability: Arc<dyn ExchangeCapability> = match (exchange.kind, transport) {
                (ExchangeKind::Simulated, _) => {
                    let venue = sim_venue
                        .clone()
                        .ok_or_else(|| anyhow!("simulated venue missing for {id}"))?;
                    Arc::new(SimulatedExchange::new(
                        venue,
                        symbol.clone(),
                        transport,
                        exchange.tick_size,
                        timeout,
                    ))
                }
                (ExchangeKind::Binance, Transport::Rest) => Arc::new(BinanceRest::new(
                    id.clone(),
                    symbol.clone(),
                    required_url(exchange, exchange.rest_url(), "rest-url")?,
                    exchange.tick_size,
                    timeout,
                )?),
                (ExchangeKind::Binance, Transport::WebSocket) => Arc::new(BinanceWs::new(
                    id.clone(),
                    symbol.clone(),
                    required_url(exchange, exchange.ws_url(), "ws-url")?,
                    exchange.tick_size,
                    timeout,
                )),
                (ExchangeKind::Hyperliquid, Transport::Rest) => Arc::new(HyperliquidRest::new(
                    id.clone(),
                    symbol.clone(),
                    required_url(exchange, exchange.rest_url(), "rest-url")?,
                    exchange.tick_size,
                    timeout,
                )?),
                (ExchangeKind::Hyperliquid, Transport::WebSocket) => Arc::new(HyperliquidWs::new(
                    id.clone(),
                    symbol.clone(),
                    required_url(exchange, exchange.ws_url(), "ws-url")?,
                    exchange.tick_size,
                    timeout,
                )),
            };
            venues.push(capability);
        }
    }

    Ok(venues)
}

fn required_url<'a>(exchange: &ExchangeConfig, url: Option<&'a str>, field: &str) -> Result<&'a str> {
    url.ok_or_else(|| anyhow!("exchange {} is missing {field}", exchange.id))
}
