use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capability::sim::SimProfile;
use crate::types::{OperationKind, Side, Transport};

pub const BINANCE_REST_URL: &str = "https://api.binance.com";
pub const BINANCE_WS_URL: &str = "wss://ws-api.binance.com:443/ws-api/v3";
pub const HYPERLIQUID_REST_URL: &str = "https://api.hyperliquid.xyz";
pub const HYPERLIQUID_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";

pub const MAX_REFRESH_RATE_HZ: f64 = 1_000.0;
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ConfigFormat {
    Auto,
    Toml,
    Yaml,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format:?} config: {details}")]
    Parse {
        format: ConfigFormat,
        details: String,
    },
    #[error("configuration invalid: {0}")]
    Validation(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub test: TestSection,
    #[serde(default)]
    pub display: DisplaySection,
    #[serde(default)]
    pub operations: OperationsSection,
    #[serde(default)]
    pub cleanup: CleanupSection,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct TestSection {
    /// Unbounded when absent.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default = "default_order_size")]
    pub order_size: f64,
    /// Limit price as a fraction of mid (0.95 = 5% away from the market).
    #[serde(default = "default_market_offset")]
    pub market_offset: f64,
    #[serde(default = "default_side")]
    pub side: Side,
    #[serde(default = "default_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_setup_retries")]
    pub setup_retries: u32,
    #[serde(default = "default_setup_backoff_ms")]
    pub setup_backoff_ms: u64,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: usize,
}

const fn default_order_size() -> f64 {
    0.0001
}

const fn default_market_offset() -> f64 {
    0.95
}

const fn default_side() -> Side {
    Side::Buy
}

const fn default_delay_min_ms() -> u64 {
    500
}

const fn default_delay_max_ms() -> u64 {
    1_000
}

const fn default_operation_timeout_ms() -> u64 {
    10_000
}

const fn default_shutdown_grace_ms() -> u64 {
    3_000
}

const fn default_setup_retries() -> u32 {
    3
}

const fn default_setup_backoff_ms() -> u64 {
    1_000
}

const fn default_max_open_orders() -> usize {
    1
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            duration_secs: None,
            order_size: default_order_size(),
            market_offset: default_market_offset(),
            side: default_side(),
            delay_min_ms: default_delay_min_ms(),
            delay_max_ms: default_delay_max_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            setup_retries: default_setup_retries(),
            setup_backoff_ms: default_setup_backoff_ms(),
            max_open_orders: default_max_open_orders(),
        }
    }
}

impl TestSection {
    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct DisplaySection {
    #[serde(default = "default_refresh_rate_hz")]
    pub refresh_rate_hz: f64,
    #[serde(default = "default_decimal_places")]
    pub decimal_places: usize,
    /// Rolling window per series; unbounded when absent.
    #[serde(default = "default_window_cap")]
    pub window_cap: Option<usize>,
    /// Append-only rendering for remote terminals that flicker on redraw.
    #[serde(default)]
    pub no_flicker: bool,
}

const fn default_refresh_rate_hz() -> f64 {
    2.0
}

const fn default_decimal_places() -> usize {
    4
}

const fn default_window_cap() -> Option<usize> {
    Some(1_000)
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            refresh_rate_hz: default_refresh_rate_hz(),
            decimal_places: default_decimal_places(),
            window_cap: default_window_cap(),
            no_flicker: false,
        }
    }
}

impl DisplaySection {
    /// Never shorter than one millisecond; `tokio::time::interval` panics on zero.
    pub fn refresh_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.refresh_rate_hz)
            .unwrap_or(Duration::MAX)
            .max(MIN_REFRESH_INTERVAL)
    }
}

/// Transports each operation is measured over.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct OperationsSection {
    #[serde(default = "all_transports")]
    pub orderbook: Vec<Transport>,
    #[serde(default = "all_transports")]
    pub place: Vec<Transport>,
    #[serde(default = "all_transports")]
    pub cancel: Vec<Transport>,
}

fn all_transports() -> Vec<Transport> {
    vec![Transport::Rest, Transport::WebSocket]
}

impl Default for OperationsSection {
    fn default() -> Self {
        Self {
            orderbook: all_transports(),
            place: all_transports(),
            cancel: all_transports(),
        }
    }
}

impl OperationsSection {
    pub fn transports_for(&self, op: OperationKind) -> &[Transport] {
        match op {
            OperationKind::Orderbook => &self.orderbook,
            OperationKind::Place => &self.place,
            OperationKind::Cancel => &self.cancel,
        }
    }

    pub fn is_enabled(&self, op: OperationKind, transport: Transport) -> bool {
        self.transports_for(op).contains(&transport)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct CleanupSection {
    #[serde(default = "default_cleanup_timeout_ms")]
    pub timeout_ms: u64,
    /// Alternate transport tried when the primary cancellation path fails entirely.
    #[serde(default = "default_fallback_transport")]
    pub fallback_transport: Option<Transport>,
}

const fn default_cleanup_timeout_ms() -> u64 {
    15_000
}

const fn default_fallback_transport() -> Option<Transport> {
    Some(Transport::Rest)
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_cleanup_timeout_ms(),
            fallback_transport: default_fallback_transport(),
        }
    }
}

impl CleanupSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Copy, Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Hyperliquid,
    Simulated,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ExchangeConfig {
    pub id: String,
    pub kind: ExchangeKind,
    pub symbol: String,
    #[serde(default)]
    pub rest_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default = "default_tick_size")]
    pub tick_size: f64,
    #[serde(default = "default_exchange_transports")]
    pub transports: Vec<Transport>,
    /// Only read for `kind = "simulated"`.
    #[serde(default)]
    pub sim: SimProfile,
}

const fn default_tick_size() -> f64 {
    0.01
}

fn default_exchange_transports() -> Vec<Transport> {
    vec![Transport::Rest]
}

impl ExchangeConfig {
    pub fn rest_url(&self) -> Option<&str> {
        self.rest_url.as_deref().or(match self.kind {
            ExchangeKind::Binance => Some(BINANCE_REST_URL),
            ExchangeKind::Hyperliquid => Some(HYPERLIQUID_REST_URL),
            ExchangeKind::Simulated => None,
        })
    }

    pub fn ws_url(&self) -> Option<&str> {
        self.ws_url.as_deref().or(match self.kind {
            ExchangeKind::Binance => Some(BINANCE_WS_URL),
            ExchangeKind::Hyperliquid => Some(HYPERLIQUID_WS_URL),
            ExchangeKind::Simulated => None,
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Validation(format!("exchange {}: {msg}", self.id)));
        if self.id.trim().is_empty() {
            return Err(ConfigError::Validation("exchange id must not be empty".into()));
        }
        if self.symbol.trim().is_empty() {
            return invalid("symbol must not be empty".into());
        }
        if !(self.tick_size > 0.0) {
            return invalid("tick-size must be greater than zero".into());
        }
        if self.transports.is_empty() {
            return invalid("at least one transport is required".into());
        }
        for raw in [self.rest_url(), self.ws_url()].into_iter().flatten() {
            if let Err(e) = url::Url::parse(raw) {
                return invalid(format!("invalid url {raw:?}: {e}"));
            }
        }
        if self.kind == ExchangeKind::Simulated && !(0.0..=1.0).contains(&self.sim.failure_rate) {
            return invalid("sim.failure-rate must be within [0, 1]".into());
        }
        Ok(())
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exchanges.is_empty() {
            return Err(ConfigError::Validation(
                "at least one exchange must be defined".into(),
            ));
        }
        let mut ids = BTreeSet::new();
        for exchange in &self.exchanges {
            exchange.validate()?;
            if !ids.insert(exchange.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate exchange id {}",
                    exchange.id
                )));
            }
        }

        let test = &self.test;
        if !(test.order_size > 0.0) {
            return Err(ConfigError::Validation("order-size must be greater than zero".into()));
        }
        if !(test.market_offset > 0.0 && test.market_offset <= 2.0) {
            return Err(ConfigError::Validation(
                "market-offset must be within (0, 2]".into(),
            ));
        }
        if test.delay_min_ms > test.delay_max_ms {
            return Err(ConfigError::Validation(
                "delay-min-ms must not exceed delay-max-ms".into(),
            ));
        }
        if test.operation_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "operation-timeout-ms must be greater than zero".into(),
            ));
        }
        if test.max_open_orders == 0 {
            return Err(ConfigError::Validation(
                "max-open-orders must be greater than zero".into(),
            ));
        }

        let hz = self.display.refresh_rate_hz;
        if !(hz.is_finite() && hz > 0.0 && hz <= MAX_REFRESH_RATE_HZ) {
            return Err(ConfigError::Validation(format!(
                "refresh-rate-hz must be within (0, {MAX_REFRESH_RATE_HZ}]"
            )));
        }
        if self.display.window_cap == Some(0) {
            return Err(ConfigError::Validation(
                "window-cap must be greater than zero when set".into(),
            ));
        }

        let ops = &self.operations;
        if OperationKind::ALL
            .iter()
            .all(|op| ops.transports_for(*op).is_empty())
        {
            return Err(ConfigError::Validation(
                "at least one operation must be enabled".into(),
            ));
        }
        for transport in &ops.place {
            if !ops.cancel.contains(transport) {
                return Err(ConfigError::Validation(format!(
                    "place is enabled over {transport} but cancel is not; placed orders would never be released"
                )));
            }
        }
        Ok(())
    }

    /// Two simulated venues, runnable without network access or credentials.
    pub fn sample() -> Self {
        Self {
            test: TestSection::default(),
            display: DisplaySection::default(),
            operations: OperationsSection::default(),
            cleanup: CleanupSection::default(),
            exchanges: vec![
                ExchangeConfig {
                    id: "sim-spot".into(),
                    kind: ExchangeKind::Simulated,
                    symbol: "BTCUSDT".into(),
                    rest_url: None,
                    ws_url: None,
                    tick_size: 0.01,
                    transports: vec![Transport::Rest, Transport::WebSocket],
                    sim: SimProfile::default(),
                },
                ExchangeConfig {
                    id: "sim-perp".into(),
                    kind: ExchangeKind::Simulated,
                    symbol: "BTC".into(),
                    rest_url: None,
                    ws_url: None,
                    tick_size: 1.0,
                    transports: vec![Transport::Rest, Transport::WebSocket],
                    sim: SimProfile {
                        base_latency_ms: 45,
                        jitter_ms: 40,
                        failure_rate: 0.05,
                        bulk_cancel: false,
                        ..SimProfile::default()
                    },
                },
            ],
        }
    }
}

pub fn load_config(path: &Path, format: ConfigFormat) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let format = resolve_format(path, format);
    let config = parse_config(&contents, format)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(contents: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    match format {
        ConfigFormat::Toml | ConfigFormat::Auto => {
            toml::from_str(contents).map_err(|err| ConfigError::Parse {
                format: ConfigFormat::Toml,
                details: err.to_string(),
            })
        }
        ConfigFormat::Yaml => serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse {
            format,
            details: err.to_string(),
        }),
    }
}

fn resolve_format(path: &Path, format: ConfigFormat) -> ConfigFormat {
    match format {
        ConfigFormat::Auto => match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        },
        _ => format,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_is_valid() {
        Config::sample().validate().unwrap();
    }

    #[test]
    fn detects_missing_exchanges() {
        let mut config = Config::sample();
        config.exchanges.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn place_without_cancel_is_rejected() {
        let mut config = Config::sample();
        config.operations.cancel = vec![Transport::Rest];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cancel"));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = Config::sample();
        let copy = config.exchanges[0].clone();
        config.exchanges.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_toml_config() {
        let contents = r#"
            [test]
            duration-secs = 30
            market-offset = 0.9

            [display]
            refresh-rate-hz = 4.0
            no-flicker = true

            [operations]
            orderbook = ["rest", "ws"]
            place = []
            cancel = []

            [[exchanges]]
            id = "binance"
            kind = "binance"
            symbol = "BTCUSDT"
            transports = ["rest", "websocket"]
        "#;

        let config = parse_config(contents, ConfigFormat::Toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.test.duration(), Some(Duration::from_secs(30)));
        assert_eq!(config.test.order_size, 0.0001);
        assert!(config.display.no_flicker);
        assert_eq!(config.display.window_cap, Some(1_000));
        assert_eq!(config.operations.orderbook, vec![Transport::Rest, Transport::WebSocket]);
        assert_eq!(config.exchanges[0].ws_url(), Some(BINANCE_WS_URL));
    }

    #[test]
    fn parses_yaml_config() {
        let contents = "\
exchanges:
  - id: sim
    kind: simulated
    symbol: ETHUSDT
    sim:
      base-latency-ms: 5
      failure-rate: 0.5
";
        let config = parse_config(contents, ConfigFormat::Yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.exchanges[0].sim.base_latency_ms, 5);
        assert_eq!(config.exchanges[0].sim.jitter_ms, 15);
        assert_eq!(config.test.duration(), None);
    }

    #[test]
    fn hyperliquid_websocket_uses_the_public_feed() {
        let contents = r#"
            [[exchanges]]
            id = "hl"
            kind = "hyperliquid"
            symbol = "BTC"
            transports = ["rest", "websocket"]

            [operations]
            orderbook = ["rest", "websocket"]
            place = []
            cancel = []
        "#;
        let config = parse_config(contents, ConfigFormat::Toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.exchanges[0].ws_url(), Some(HYPERLIQUID_WS_URL));
    }

    #[test]
    fn refresh_rate_is_bounded() {
        for hz in [0.0, -1.0, 1e12, f64::INFINITY, f64::NAN] {
            let mut config = Config::sample();
            config.display.refresh_rate_hz = hz;
            assert!(config.validate().is_err(), "{hz} accepted");
        }
        let mut config = Config::sample();
        config.display.refresh_rate_hz = MAX_REFRESH_RATE_HZ;
        config.validate().unwrap();
        assert_eq!(config.display.refresh_interval(), Duration::from_millis(1));

        config.display.refresh_rate_hz = 1e12;
        assert_eq!(config.display.refresh_interval(), Duration::from_millis(1));
    }
}
