use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use exchange_latency_bench::aggregator::{Aggregator, DisplaySink};
use exchange_latency_bench::capability::factory::build_venues;
use exchange_latency_bench::cleanup::CleanupStatus;
use exchange_latency_bench::config::{load_config, Config, ConfigFormat};
use exchange_latency_bench::display::{JsonLinesSink, TableSink};
use exchange_latency_bench::lifecycle::{spawn_stop_triggers, StopHandle, StopReason};
use exchange_latency_bench::logging::{init_logging, LogFormat};
use exchange_latency_bench::metrics::stats::LifetimeSummary;
use exchange_latency_bench::types::SeriesKey;
use exchange_latency_bench::{Sampler, SamplerReport, SeriesRegistry};
use serde::Serialize;
use tracing::{info, Level};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Table,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "latency-bench", about = "Measure exchange orderbook/place/cancel latency over REST and WebSocket")]
struct Args {
    /// TOML or YAML config; the built-in simulated setup is used when omitted.
    #[arg(long, env = "LATENCY_BENCH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,

    /// Test duration in seconds; runs until interrupted when neither this nor the config sets one.
    #[arg(long, env = "LATENCY_BENCH_DURATION")]
    duration: Option<u64>,

    /// Append boards instead of redrawing (remote terminals).
    #[arg(long)]
    no_flicker: bool,

    /// Display refresh rate in Hz.
    #[arg(long)]
    refresh_rate: Option<f64>,

    #[arg(long, value_enum, default_value_t = Output::Table)]
    output: Output,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "LATENCY_BENCH_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Print the built-in sample config as TOML and exit.
    #[arg(long)]
    print_sample_config: bool,
}

#[derive(Serialize)]
struct RunSummary<'a> {
    lifetime: Vec<(String, LifetimeSummary)>,
    report: &'a SamplerReport,
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(secs) = args.duration {
        config.test.duration_secs = Some(secs);
    }
    if args.no_flicker {
        config.display.no_flicker = true;
    }
    if let Some(hz) = args.refresh_rate {
        config.display.refresh_rate_hz = hz;
    }
}

fn print_text_summary(lifetime: &[(String, LifetimeSummary)], report: &SamplerReport) {
    println!();
    println!("Run summary (all successful samples)");
    for (key, summary) in lifetime {
        println!(
            "  {key:<40} n={:<7} p50={:>10.3}ms p99={:>10.3}ms max={:>10.3}ms",
            summary.successes, summary.p50_ms, summary.p99_ms, summary.max_ms
        );
    }
    for failure in &report.setup_failures {
        println!(
            "  setup failed: {} over {} after {} attempts: {}",
            failure.exchange, failure.transport, failure.attempts, failure.reason
        );
    }
    if report.forced_terminations > 0 {
        println!("  {} loop(s) force-terminated after the grace period", report.forced_terminations);
    }

    let cleanup = &report.cleanup;
    println!(
        "Cleanup: {} cancelled, {} already closed, {} failed",
        cleanup.cancelled(),
        cleanup.already_closed(),
        cleanup.failures().len()
    );
    for outcome in cleanup.failures() {
        if let CleanupStatus::Failed { reason } = &outcome.status {
            println!(
                "  order {} on {} still open: {}",
                outcome.order.order_id, outcome.order.exchange, reason
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_sample_config {
        print!("{}", toml::to_string(&Config::sample()).context("serializing sample config")?);
        return Ok(());
    }

    init_logging(args.log_format, Level::INFO, args.log_file.as_deref())?;

    let mut config = match &args.config {
        Some(path) => load_config(path, args.config_format)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            info!("no config file given; using the built-in simulated exchanges");
            Config::sample()
        }
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let registry = SeriesRegistry::new(config.display.window_cap);
    let venues = build_venues(&config)?;
    let sink: Arc<dyn DisplaySink> = match args.output {
        Output::Table => Arc::new(TableSink::stdout(
            config.display.decimal_places,
            config.display.no_flicker,
        )),
        Output::Json => Arc::new(JsonLinesSink::stdout()),
    };

    let stop = StopHandle::new();
    let triggers = spawn_stop_triggers(stop.clone(), config.test.duration());
    let aggregator = Aggregator::new(registry.clone(), sink, config.display.refresh_interval());
    let renderer = tokio::spawn({
        let signal = stop.signal();
        async move { aggregator.run(signal).await }
    });

    info!(
        venues = venues.len(),
        duration_secs = ?config.test.duration_secs,
        "starting latency sampling"
    );
    let sampler = Sampler::new(config, registry.clone(), venues);
    let result = sampler.run(&stop).await;

    // Sampling may have returned early on a setup error; release the other tasks.
    stop.trigger(StopReason::Requested);
    renderer.await.context("display task")?;
    triggers.await.context("signal task")?;

    let report = result.context("sampling failed")?;
    let lifetime: Vec<(String, LifetimeSummary)> = registry
        .lifetime_all()
        .into_iter()
        .filter_map(|(key, summary): (SeriesKey, _)| summary.map(|s| (key.to_string(), s)))
        .collect();

    match args.output {
        Output::Table => print_text_summary(&lifetime, &report),
        Output::Json => println!(
            "{}",
            serde_json::to_string(&RunSummary {
                lifetime,
                report: &report,
            })?
        ),
    }

    if !report.cleanup.is_clean() {
        bail!(
            "{} order(s) could not be cancelled during cleanup",
            report.cleanup.failures().len()
        );
    }
    Ok(())
}
