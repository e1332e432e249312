//! Request-id correlation for request/response protocols multiplexed over one socket.
//!
//! A caller registers a pending call, sends its frame tagged with the id, and
//! awaits the receiver. The transport's read task hands every response to
//! [`PendingRequests::resolve`]. Calls that outlive their deadline are removed
//! so a late response is simply dropped.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::CapabilityError;

type Waiter<T> = oneshot::Sender<Result<T, CapabilityError>>;

pub struct PendingRequests<T> {
    next_id: AtomicU64,
    waiters: DashMap<u64, Waiter<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: DashMap::new(),
        }
    }
}

impl<T: Send> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> PendingCall<'_, T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        PendingCall {
            table: self,
            id,
            rx: Some(rx),
        }
    }

    /// Completes the call registered under `id`. Returns false for unknown or
    /// already-expired ids.
    pub fn resolve(&self, id: u64, result: Result<T, CapabilityError>) -> bool {
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fails every outstanding call, e.g. when the socket drops.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.waiters.iter().map(|kv| *kv.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(CapabilityError::Connection(reason.to_string())));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// One in-flight request. Dropping it unregisters the id.
pub struct PendingCall<'a, T: Send> {
    table: &'a PendingRequests<T>,
    id: u64,
    rx: Option<oneshot::Receiver<Result<T, CapabilityError>>>,
}

impl<T: Send> PendingCall<'_, T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn wait(mut self, timeout: Duration) -> Result<T, CapabilityError> {
        let Some(rx) = self.rx.take() else {
            return Err(CapabilityError::Connection("pending call already awaited".into()));
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CapabilityError::Connection(
                "dispatcher dropped the pending call".into(),
            )),
            Err(_) => Err(CapabilityError::Timeout(timeout)),
        }
    }
}

impl<T: Send> Drop for PendingCall<'_, T> {
    fn drop(&mut self) {
        self.table.waiters.remove(&self.id);
    }
}
