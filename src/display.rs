//! Display sinks: a text table for terminals and JSON lines for pipelines.

use std::fmt::Write as _;
use std::io::{self, Write};

use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::aggregator::DisplaySink;
use crate::metrics::registry::SnapshotBoard;
use crate::metrics::stats::StatsSnapshot;
use crate::types::SeriesKey;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Renders the board as an aligned table. In no-flicker mode each board is
/// appended below the previous one instead of redrawing the screen.
pub struct TableSink {
    decimals: usize,
    no_flicker: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl TableSink {
    pub fn stdout(decimals: usize, no_flicker: bool) -> Self {
        Self::with_writer(decimals, no_flicker, Box::new(io::stdout()))
    }

    pub fn with_writer(decimals: usize, no_flicker: bool, out: Box<dyn Write + Send>) -> Self {
        Self {
            decimals,
            no_flicker,
            out: Mutex::new(out),
        }
    }

    pub fn format_board(&self, board: &SnapshotBoard) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "Exchange latency ({})",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let _ = writeln!(
            text,
            "{:<16} {:<13} {:<5} {:>7} {:>7} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12} {:>12}",
            "Exchange", "Operation", "Via", "Count", "Fail%", "Min", "Mean", "Median", "StdDev", "P95", "P99", "Max"
        );
        if board.is_empty() {
            let _ = writeln!(text, "(no series yet)");
        }
        for (key, snapshot) in board {
            let _ = writeln!(text, "{}", self.format_row(key, snapshot));
        }
        text
    }

    fn format_row(&self, key: &SeriesKey, snapshot: &StatsSnapshot) -> String {
        let counts = snapshot.counts();
        let fail = snapshot
            .failure_rate()
            .map(|rate| format!("{:.1}", rate * 100.0))
            .unwrap_or_else(|| "-".into());
        let head = format!(
            "{:<16} {:<13} {:<5} {:>7} {:>7}",
            key.exchange.0,
            key.operation.label(),
            key.transport.to_string(),
            counts.total,
            fail
        );
        match snapshot {
            StatsSnapshot::NoData => format!("{head} {:>12}", "no data"),
            StatsSnapshot::InsufficientData { .. } => format!("{head} {:>12}", "insufficient data"),
            StatsSnapshot::Ready { latency, .. } => {
                let d = self.decimals;
                format!(
                    "{head} {:>12.d$} {:>12.d$} {:>12.d$} {:>12.d$} {:>12.d$} {:>12.d$} {:>12.d$}",
                    latency.min_ms,
                    latency.mean_ms,
                    latency.median_ms,
                    latency.stddev_ms,
                    latency.p95_ms,
                    latency.p99_ms,
                    latency.max_ms,
                )
            }
        }
    }
}

impl DisplaySink for TableSink {
    fn render(&self, board: &SnapshotBoard) {
        let text = self.format_board(board);
        let mut out = self.out.lock();
        let result = if self.no_flicker {
            writeln!(out, "{text}")
        } else {
            write!(out, "{CLEAR_SCREEN}{text}")
        }
        .and_then(|()| out.flush());
        if let Err(e) = result {
            warn!(error = %e, "failed to render table");
        }
    }
}

#[derive(Serialize)]
struct JsonRow<'a> {
    exchange: &'a str,
    operation: String,
    transport: String,
    #[serde(flatten)]
    snapshot: &'a StatsSnapshot,
}

#[derive(Serialize)]
struct JsonBoard<'a> {
    ts: String,
    series: Vec<JsonRow<'a>>,
}

/// One JSON object per board, newline-delimited.
pub struct JsonLinesSink {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonLinesSink {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn format_board(board: &SnapshotBoard) -> serde_json::Result<String> {
        let doc = JsonBoard {
            ts: Utc::now().to_rfc3339(),
            series: board
                .iter()
                .map(|(key, snapshot)| JsonRow {
                    exchange: &key.exchange.0,
                    operation: key.operation.to_string(),
                    transport: key.transport.to_string(),
                    snapshot,
                })
                .collect(),
        };
        serde_json::to_string(&doc)
    }
}

impl DisplaySink for JsonLinesSink {
    fn render(&self, board: &SnapshotBoard) {
        let line = match Self::format_board(board) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize board");
                return;
            }
        };
        let mut out = self.out.lock();
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!(error = %e, "failed to write board");
        }
    }
}
