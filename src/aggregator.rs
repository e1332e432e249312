use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::lifecycle::StopSignal;
use crate::metrics::registry::{SeriesRegistry, SnapshotBoard};

/// Consumer of computed statistics (terminal table, JSON lines, tests).
pub trait DisplaySink: Send + Sync {
    fn render(&self, board: &SnapshotBoard);
}

/// Pulls a snapshot of every series on a fixed cadence, independent of how
/// fast the sampling loops record.
pub struct Aggregator {
    registry: SeriesRegistry,
    sink: Arc<dyn DisplaySink>,
    interval: Duration,
}

impl Aggregator {
    pub fn new(registry: SeriesRegistry, sink: Arc<dyn DisplaySink>, interval: Duration) -> Self {
        Self {
            registry,
            sink,
            interval,
        }
    }

    pub fn tick(&self) -> SnapshotBoard {
        let board = self.registry.snapshot_all();
        self.sink.render(&board);
        board
    }

    /// Renders until `stop` is raised, then renders one final board.
    /// Returns the number of renders.
    pub async fn run(&self, mut stop: StopSignal) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut renders = 0;
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = ticker.tick() => {
                    self.tick();
                    renders += 1;
                }
            }
        }
        self.tick();
        renders += 1;
        debug!(renders, "aggregator stopped");
        renders
    }
}
