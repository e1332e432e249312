//! Binance spot capabilities over public, unsigned endpoints.
//!
//! Only the orderbook path is available here; signed order entry lives behind
//! the same trait but is not part of this crate.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::capability::correlator::PendingRequests;
use crate::capability::link::WsLink;
use crate::capability::ExchangeCapability;
use crate::error::CapabilityError;
use crate::types::{BookTop, ExchangeId, OperationKind, OrderId, Side, Symbol, Transport};

const DEPTH_LIMIT: u32 = 5;

#[derive(Debug, Deserialize)]
pub(crate) struct DepthResponse {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: i64,
    msg: String,
}

pub(crate) fn parse_price(raw: &str) -> Result<f64, CapabilityError> {
    raw.parse::<f64>()
        .map_err(|e| CapabilityError::Parse(format!("bad price {raw:?}: {e}")))
}

pub(crate) fn book_top_from_depth(depth: &DepthResponse) -> Result<BookTop, CapabilityError> {
    let bid = depth
        .bids
        .first()
        .ok_or_else(|| CapabilityError::Parse("empty bid side".into()))?;
    let ask = depth
        .asks
        .first()
        .ok_or_else(|| CapabilityError::Parse("empty ask side".into()))?;
    Ok(BookTop {
        best_bid: parse_price(&bid[0])?,
        best_ask: parse_price(&ask[0])?,
    })
}

fn http_error(status: StatusCode, body: &str, timeout: Duration) -> CapabilityError {
    if matches!(status.as_u16(), 408 | 504) {
        return CapabilityError::Timeout(timeout);
    }
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => CapabilityError::api(Some(err.code), err.msg),
        Err(_) => CapabilityError::api(None, format!("HTTP {status}: {body}")),
    }
}

pub struct BinanceRest {
    exchange: ExchangeId,
    symbol: Symbol,
    tick_size: f64,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl BinanceRest {
    pub fn new(
        exchange: ExchangeId,
        symbol: Symbol,
        base_url: &str,
        tick_size: f64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building binance http client")?;
        Ok(Self {
            exchange,
            symbol,
            tick_size,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            http,
        })
    }
}

#[async_trait]
impl ExchangeCapability for BinanceRest {
    fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    fn transport(&self) -> Transport {
        Transport::Rest
    }

    fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    fn tick_size(&self) -> f64 {
        self.tick_size
    }

    fn supports(&self, op: OperationKind) -> bool {
        op == OperationKind::Orderbook
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop> {
        let limit = DEPTH_LIMIT.to_string();
        let url = url::Url::parse_with_params(
            &format!("{}/api/v3/depth", self.base_url),
            &[("symbol", self.symbol.0.as_str()), ("limit", limit.as_str())],
        )
        .context("building depth url")?;

        let resp = self.http.get(url).send().await.context("depth request")?;
        let status = resp.status();
        let body = resp.text().await.context("reading depth body")?;
        if !status.is_success() {
            return Err(http_error(status, &body, self.timeout).into());
        }
        let depth: DepthResponse =
            serde_json::from_str(&body).map_err(|e| CapabilityError::Parse(e.to_string()))?;
        Ok(book_top_from_depth(&depth)?)
    }

    async fn place_order(&self, _side: Side, _size: f64, _price: f64) -> anyhow::Result<OrderId> {
        Err(CapabilityError::Unsupported("signed order placement").into())
    }

    async fn cancel_order(&self, _order_id: &OrderId) -> anyhow::Result<()> {
        Err(CapabilityError::Unsupported("signed order cancellation").into())
    }
}

#[derive(Debug, Deserialize)]
struct WsResponse {
    id: Option<Value>,
    status: Option<u16>,
    result: Option<Value>,
    error: Option<ApiErrorBody>,
}

/// Routes one WebSocket-API frame to the pending call it answers.
fn dispatch(pending: &PendingRequests<Value>, text: &str) {
    let frame: WsResponse = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable frame");
            return;
        }
    };
    let Some(id) = frame.id.as_ref().and_then(Value::as_u64) else {
        tracing::debug!("ignoring frame without numeric id");
        return;
    };
    let result = match (frame.status, frame.result, frame.error) {
        (Some(200), Some(result), _) => Ok(result),
        (_, _, Some(err)) => Err(CapabilityError::api(Some(err.code), err.msg)),
        (status, _, None) => Err(CapabilityError::api(
            None,
            format!("unexpected response status {status:?}"),
        )),
    };
    if !pending.resolve(id, result) {
        tracing::debug!(request_id = id, "response for unknown or expired request");
    }
}

/// Binance WebSocket API (`depth` method), request/response correlated by id.
pub struct BinanceWs {
    exchange: ExchangeId,
    symbol: Symbol,
    tick_size: f64,
    request_timeout: Duration,
    link: WsLink,
}

impl BinanceWs {
    pub fn new(
        exchange: ExchangeId,
        symbol: Symbol,
        ws_url: &str,
        tick_size: f64,
        request_timeout: Duration,
    ) -> Self {
        Self {
            link: WsLink::new(exchange.clone(), ws_url, request_timeout, dispatch),
            exchange,
            symbol,
            tick_size,
            request_timeout,
        }
    }
}

#[async_trait]
impl ExchangeCapability for BinanceWs {
    fn exchange(&self) -> &ExchangeId {
        &self.exchange
    }

    fn transport(&self) -> Transport {
        Transport::WebSocket
    }

    fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    fn tick_size(&self) -> f64 {
        self.tick_size
    }

    fn supports(&self, op: OperationKind) -> bool {
        op == OperationKind::Orderbook
    }

    async fn connect(&self) -> anyhow::Result<()> {
        self.link.open().await
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.link.close();
        Ok(())
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop> {
        let symbol = &self.symbol.0;
        let value = self
            .link
            .request(
                |id| {
                    json!({
                        "id": id,
                        "method": "depth",
                        "params": { "symbol": symbol, "limit": DEPTH_LIMIT },
                    })
                },
                self.request_timeout,
            )
            .await?;
        let depth: DepthResponse =
            serde_json::from_value(value).map_err(|e| CapabilityError::Parse(e.to_string()))?;
        Ok(book_top_from_depth(&depth)?)
    }

    async fn place_order(&self, _side: Side, _size: f64, _price: f64) -> anyhow::Result<OrderId> {
        Err(CapabilityError::Unsupported("signed order placement").into())
    }

    async fn cancel_order(&self, _order_id: &OrderId) -> anyhow::Result<()> {
        Err(CapabilityError::Unsupported("signed order cancellation").into())
    }
}
