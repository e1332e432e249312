//! Reconnecting request/response websocket shared by the WS capabilities.
//!
//! A link owns one socket at a time. The read task hands every text frame to
//! the venue's `Dispatch` fn, which resolves the matching pending call. When
//! the socket drops the read task clears the link and fails whatever was in
//! flight; the next request re-opens it with exponential backoff.

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::capability::correlator::PendingRequests;
use crate::error::CapabilityError;
use crate::types::ExchangeId;

pub(crate) const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub(crate) const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Routes one inbound text frame to its pending call.
pub(crate) type Dispatch = fn(&PendingRequests<Value>, &str);

struct Outbound {
    generation: u64,
    tx: mpsc::UnboundedSender<Message>,
}

pub(crate) struct WsLink {
    exchange: ExchangeId,
    url: String,
    handshake_timeout: Duration,
    reconnect_delay: Duration,
    dispatch: Dispatch,
    pending: Arc<PendingRequests<Value>>,
    outbound: Arc<Mutex<Option<Outbound>>>,
    generation: AtomicU64,
    reconnecting: tokio::sync::Mutex<()>,
}

impl WsLink {
    pub(crate) fn new(exchange: ExchangeId, url: &str, handshake_timeout: Duration, dispatch: Dispatch) -> Self {
        Self {
            exchange,
            url: url.to_string(),
            handshake_timeout,
            reconnect_delay: RECONNECT_BASE_DELAY,
            dispatch,
            pending: Arc::new(PendingRequests::new()),
            outbound: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
            reconnecting: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Handshakes a fresh socket and replaces the current one.
    pub(crate) async fn open(&self) -> anyhow::Result<()> {
        let (stream, _) = tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .context("websocket handshake timed out")?
            .with_context(|| format!("connecting to {}", self.url))?;
        let (mut write, mut read) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let pending = self.pending.clone();
        let outbound = self.outbound.clone();
        let dispatch = self.dispatch;
        let exchange = self.exchange.clone();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&pending, &text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(%exchange, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            let mut current = outbound.lock();
            if current.as_ref().is_some_and(|o| o.generation == generation) {
                current.take();
                let failed = pending.fail_all("websocket closed");
                info!(%exchange, generation, failed, "websocket reader stopped");
            } else {
                debug!(%exchange, generation, "superseded websocket reader stopped");
            }
        });

        *self.outbound.lock() = Some(Outbound { generation, tx });
        info!(exchange = %self.exchange, url = %self.url, generation, "websocket connected");
        Ok(())
    }

    /// Re-opens a dropped socket; concurrent callers share one attempt sequence.
    pub(crate) async fn ensure_open(&self) -> Result<(), CapabilityError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.reconnecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        let mut last = String::new();
        for attempt in 0..MAX_RECONNECT_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(self.reconnect_delay * 2u32.pow(attempt - 1)).await;
            }
            match self.open().await {
                Ok(()) => {
                    info!(exchange = %self.exchange, attempt = attempt + 1, "websocket reconnected");
                    return Ok(());
                }
                Err(e) => {
                    warn!(exchange = %self.exchange, attempt = attempt + 1, error = %format!("{e:#}"), "websocket reconnect failed");
                    last = format!("{e:#}");
                }
            }
        }
        Err(CapabilityError::Connection(format!(
            "reconnect failed after {MAX_RECONNECT_ATTEMPTS} attempts: {last}"
        )))
    }

    /// Sends the frame built for a fresh request id and waits for its response.
    pub(crate) async fn request(
        &self,
        frame: impl FnOnce(u64) -> Value,
        timeout: Duration,
    ) -> Result<Value, CapabilityError> {
        self.ensure_open().await?;
        let call = self.pending.register();
        let text = frame(call.id()).to_string();
        {
            let outbound = self.outbound.lock();
            let Some(current) = outbound.as_ref() else {
                return Err(CapabilityError::Connection("websocket not connected".into()));
            };
            current
                .tx
                .send(Message::Text(text))
                .map_err(|_| CapabilityError::Connection("websocket writer closed".into()))?;
        }
        call.wait(timeout).await
    }

    pub(crate) fn close(&self) {
        if self.outbound.lock().take().is_some() {
            debug!(exchange = %self.exchange, "websocket closed locally");
        }
    }
}
