//! Tracing subscriber setup for the binary.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::Context;
use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Pretty,
    /// One JSON object per event
    Json,
}

/// Dependency targets that are clamped to `warn` regardless of `RUST_LOG`.
const NOISY_TARGETS: [&str; 4] = ["hyper", "reqwest", "tokio_tungstenite", "tungstenite"];

fn env_filter(default_level: Level) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    for target in NOISY_TARGETS {
        filter = filter.add_directive(
            format!("{target}=warn")
                .parse()
                .with_context(|| format!("invalid log directive for {target}"))?,
        );
    }
    Ok(filter)
}

/// Installs the global subscriber. With `log_file` set, events go to that file
/// (appending) so they do not interleave with the live table on stdout.
pub fn init_logging(
    format: LogFormat,
    default_level: Level,
    log_file: Option<&Path>,
) -> anyhow::Result<()> {
    let filter = env_filter(default_level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match (format, log_file) {
        (LogFormat::Pretty, None) => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        (LogFormat::Json, None) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (format, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let writer = Mutex::new(file);
            match format {
                LogFormat::Pretty => registry
                    .with(fmt::layer().with_ansi(false).with_writer(writer))
                    .try_init(),
                LogFormat::Json => registry
                    .with(fmt::layer().json().with_writer(writer))
                    .try_init(),
            }
        }
    };
    result.context("installing tracing subscriber")
}
