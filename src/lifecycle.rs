//! Global stop token shared by every sampling loop, the aggregator and the
//! cleanup trigger.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    Interrupt,
    Terminate,
    SetupFailed,
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::DurationElapsed => "test duration elapsed",
            StopReason::Interrupt => "interrupt",
            StopReason::Terminate => "terminate signal",
            StopReason::SetupFailed => "no venue could be set up",
            StopReason::Requested => "stop requested",
        })
    }
}

/// Raises the stop. The first reason wins; later triggers are ignored.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<StopReason>>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StopHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` if this call raised the stop.
    pub fn trigger(&self, reason: StopReason) -> bool {
        let raised = self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if raised {
            info!(%reason, "stop signal raised");
        }
        raised
    }

    pub fn reason(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Observer side; each task holds its own clone.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolves once the stop is raised (immediately if it already was).
    pub async fn stopped(&mut self) -> StopReason {
        loop {
            let current = *self.rx.borrow_and_update();
            if let Some(reason) = current {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return StopReason::Requested;
            }
        }
    }
}

/// Raises the stop on Ctrl-C, SIGTERM or when `duration` elapses. The task
/// exits on its own once the stop is raised by anyone else.
pub fn spawn_stop_triggers(handle: StopHandle, duration: Option<Duration>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut signal = handle.signal();

        let ctrl_c = async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {}
                Err(e) => {
                    error!(error = %e, "failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        let deadline = async {
            match duration {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            () = ctrl_c => {
                handle.trigger(StopReason::Interrupt);
            }
            () = terminate => {
                handle.trigger(StopReason::Terminate);
            }
            () = deadline => {
                handle.trigger(StopReason::DurationElapsed);
            }
            _ = signal.stopped() => {}
        }
    })
}
