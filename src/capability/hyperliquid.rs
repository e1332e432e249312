//! Hyperliquid `l2Book` snapshots, over the REST info endpoint and as WS post requests.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::capability::binance::parse_price;
use crate::capability::correlator::PendingRequests;
use crate::capability::link::WsLink;
use crate::capability::ExchangeCapability;
use crate::error::CapabilityError;
use crate::types::{BookTop, ExchangeId, OperationKind, OrderId, Side, Symbol, Transport};

#[derive(Debug, Deserialize)]
struct Level {
    px: String,
}

#[derive(Debug, Deserialize)]
struct L2Book {
    levels: Vec<Vec<Level>>,
}

fn book_top(book: &L2Book) -> Result<BookTop, CapabilityError> {
    let best = |side: usize, name: &str| -> Result<f64, CapabilityError> {
        let level = book
            .levels
            .get(side)
            .and_then(|levels| levels.first())
            .ok_or_else(|| CapabilityError::Parse(format!("empty {name} side")))?;
        parse_price(&level.px)
    };
    Ok(BookTop {
        best_bid: best(0, "bid")?,
        best_ask: best(1, "ask")?,
    })
}

pub struct HyperliquidRest {
    exchange: ExchangeId,
    symbol: Symbol,
    tick_size: f64,
    info_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl HyperliquidRest {
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
            .context("building hyperliquid http client")?;
        Ok(Self {
            exchange,
            symbol,
            tick_size,
            info_url: format!("{}/info", base_url.trim_end_matches('/')),
            timeout,
            http,
        })
    }
}

#[async_trait]
impl ExchangeCapability for HyperliquidRest {
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
        let resp = self
            .http
            .post(&self.info_url)
            .json(&json!({ "type": "l2Book", "coin": self.symbol.0 }))
            .send()
            .await
            .context("l2Book request")?;
        let status = resp.status();
        let body = resp.text().await.context("reading l2Book body")?;
        if status.as_u16() == 408 || status.as_u16() == 504 {
            return Err(CapabilityError::Timeout(self.timeout).into());
        }
        if !status.is_success() {
            return Err(CapabilityError::api(None, format!("HTTP {status}: {body}")).into());
        }
        let book: L2Book =
            serde_json::from_str(&body).map_err(|e| CapabilityError::Parse(e.to_string()))?;
        Ok(book_top(&book)?)
    }

    async fn place_order(&self, _side: Side, _size: f64, _price: f64) -> anyhow::Result<OrderId> {
        Err(CapabilityError::Unsupported("signed order placement").into())
    }

    async fn cancel_order(&self, _order_id: &OrderId) -> anyhow::Result<()> {
        Err(CapabilityError::Unsupported("signed order cancellation").into())
    }
}

/// `{"channel":"post","data":{"id":..,"response":{"type":"info"|"error","payload":..}}}`
#[derive(Debug, Deserialize)]
struct PostFrame {
    channel: String,
    data: Option<PostData>,
}

#[derive(Debug, Deserialize)]
struct PostData {
    id: u64,
    response: PostResponse,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
}

fn dispatch(pending: &PendingRequests<Value>, text: &str) {
    let frame: PostFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable frame");
            return;
        }
    };
    let Some(data) = frame.data.filter(|_| frame.channel == "post") else {
        tracing::debug!(channel = %frame.channel, "ignoring non-post frame");
        return;
    };
    let result = match data.response.kind.as_str() {
        "info" => data
            .response
            .payload
            .get("data")
            .cloned()
            .ok_or_else(|| CapabilityError::Parse("info payload without data".into())),
        "error" => Err(CapabilityError::api(None, data.response.payload.to_string())),
        other => Err(CapabilityError::Parse(format!("unexpected response type {other}"))),
    };
    if !pending.resolve(data.id, result) {
        tracing::debug!(request_id = data.id, "response for unknown or expired request");
    }
}

/// `l2Book` info requests posted over the Hyperliquid websocket.
pub struct HyperliquidWs {
    exchange: ExchangeId,
    symbol: Symbol,
    tick_size: f64,
    request_timeout: Duration,
    link: WsLink,
}

impl HyperliquidWs {
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
impl ExchangeCapability for HyperliquidWs {
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
        self.link
            .open()
            .await
            .with_context(|| format!("hyperliquid websocket {}", self.link.url()))
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.link.close();
        Ok(())
    }

    async fn fetch_orderbook(&self) -> anyhow::Result<BookTop> {
        let coin = &self.symbol.0;
        let value = self
            .link
            .request(
                |id| {
                    json!({
                        "method": "post",
                        "id": id,
                        "request": { "type": "info", "payload": { "type": "l2Book", "coin": coin } },
                    })
                },
                self.request_timeout,
            )
            .await?;
        let book: L2Book =
            serde_json::from_value(value).map_err(|e| CapabilityError::Parse(e.to_string()))?;
        Ok(book_top(&book)?)
    }

    async fn place_order(&self, _side: Side, _size: f64, _price: f64) -> anyhow::Result<OrderId> {
        Err(CapabilityError::Unsupported("signed order placement").into())
    }

    async fn cancel_order(&self, _order_id: &OrderId) -> anyhow::Result<()> {
        Err(CapabilityError::Unsupported("signed order cancellation").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_level_of_each_side() {
        let book: L2Book = serde_json::from_str(
            r#"{"coin":"BTC","time":1,"levels":[[{"px":"64000.0","sz":"1.2","n":3}],[{"px":"64001.0","sz":"0.4","n":1}]]}"#,
        )
        .unwrap();
        let top = book_top(&book).unwrap();
        assert_eq!(top.best_bid, 64000.0);
        assert_eq!(top.best_ask, 64001.0);
    }

    #[test]
    fn missing_ask_side_fails() {
        let book: L2Book =
            serde_json::from_str(r#"{"levels":[[{"px":"1.0"}]]}"#).unwrap();
        assert!(book_top(&book).is_err());
    }

    #[tokio::test]
    async fn post_responses_resolve_by_id() {
        let pending = PendingRequests::<Value>::new();
        let ok = pending.register();
        let rejected = pending.register();
        dispatch(&pending, r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#);
        dispatch(
            &pending,
            &format!(
                r#"{{"channel":"post","data":{{"id":{},"response":{{"type":"info","payload":{{"type":"l2Book","data":{{"coin":"BTC","levels":[[{{"px":"1.5"}}],[{{"px":"2.5"}}]]}}}}}}}}}}"#,
                ok.id()
            ),
        );
        dispatch(
            &pending,
            &format!(
                r#"{{"channel":"post","data":{{"id":{},"response":{{"type":"error","payload":"unknown coin"}}}}}}"#,
                rejected.id()
            ),
        );

        let value = ok.wait(Duration::from_secs(1)).await.unwrap();
        let book: L2Book = serde_json::from_value(value).unwrap();
        assert_eq!(book_top(&book).unwrap().best_ask, 2.5);
        let err = rejected.wait(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::ApiError);
        assert!(pending.is_empty());
    }

    fn l2_reply(request: &Value) -> Value {
        json!({
            "channel": "post",
            "data": {
                "id": request["id"],
                "response": {
                    "type": "info",
                    "payload": {
                        "type": "l2Book",
                        "data": {
                            "coin": request["request"]["payload"]["coin"],
                            "levels": [[{ "px": "64000.0" }], [{ "px": "64001.0" }]],
                        },
                    },
                },
            },
        })
    }

    #[tokio::test]
    async fn websocket_orderbook_round_trip() {
        let (url, _) = crate::capability::link::tests::local_server(usize::MAX, l2_reply).await;
        let ws = HyperliquidWs::new(
            ExchangeId("hyperliquid".into()),
            Symbol("BTC".into()),
            &url,
            1.0,
            Duration::from_secs(1),
        );
        ws.connect().await.unwrap();
        for _ in 0..3 {
            let top = ws.fetch_orderbook().await.unwrap();
            assert_eq!(top.best_bid, 64000.0);
            assert_eq!(top.best_ask, 64001.0);
        }
        ws.disconnect().await.unwrap();
    }
}
