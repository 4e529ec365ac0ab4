//! Config Loader (§4.C1): per-collector declarations.
//!
//! Format is a TOML document, one `[[collector]]` array-of-tables entry per
//! declaration (DESIGN.md: concrete choice for an otherwise "opaque"
//! mapping). Grounded on the reference backend's `performance/config.rs`
//! tunable-loading idiom and on the `toml` + `serde::Deserialize` pattern
//! used throughout the wider example pack.

use crate::connector::DataType;
use crate::scheduler::Cadence;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Exchange,
    Chain,
    Etf,
    Macro,
    Sentiment,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RequestPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Requests per second; `None` means unbounded.
    #[serde(default)]
    pub rate_limit: Option<f64>,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_secs() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_timeout_secs() -> f64 {
    30.0
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            backoff_factor: default_backoff_factor(),
            timeout_secs: default_timeout_secs(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub skip_on_error: bool,
    #[serde(default = "default_price_jump_threshold")]
    pub price_jump_threshold: Decimal,
    #[serde(default = "default_volume_spike_multiplier")]
    pub volume_spike_multiplier: Decimal,
}

fn default_true() -> bool {
    true
}
fn default_price_jump_threshold() -> Decimal {
    Decimal::new(10, 2) // 0.10
}
fn default_volume_spike_multiplier() -> Decimal {
    Decimal::new(5, 0) // 5x
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            skip_on_error: false,
            price_jump_threshold: default_price_jump_threshold(),
            volume_spike_multiplier: default_volume_spike_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClassificationThresholds {
    pub whale_amount: Option<Decimal>,
    pub anomaly_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PeriodicSchedule {
    #[serde(default)]
    pub enabled: bool,
    /// 5-field cron expression, or empty to mean "every tick of the
    /// enclosing scheduler job" (§4.C8).
    #[serde(default)]
    pub schedule: String,
    #[serde(default)]
    pub lookback_minutes: Option<i64>,
}

impl Default for PeriodicSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: String::new(),
            lookback_minutes: None,
        }
    }
}

/// One `[[collector]]` declaration (§4.C1).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    pub name: String,
    pub source_kind: SourceKind,
    pub source_name: String,
    /// Names an environment variable holding the credential, resolved at
    /// connector-construction time. `None` for sources requiring no auth.
    #[serde(default)]
    pub credentials_ref: Option<String>,

    #[serde(default)]
    pub base_asset: Option<String>,
    #[serde(default)]
    pub quote_asset: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub products: Vec<String>,

    pub data_type: DataType,

    #[serde(default)]
    pub periodic: PeriodicSchedule,

    #[serde(default)]
    pub request_policy: RequestPolicy,
    #[serde(default)]
    pub validation: ValidationPolicy,
    #[serde(default)]
    pub thresholds: ClassificationThresholds,
}

impl CollectorConfig {
    /// Fails fast on malformed configuration per §4.C1 and §7's
    /// "Configuration" error row: no partial startup.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("collector config has an empty name");
        }
        if self.source_name.trim().is_empty() {
            bail!("collector '{}': source_name must not be empty", self.name);
        }
        if self.request_policy.initial_backoff_secs < 0.0 {
            bail!(
                "collector '{}': initial_backoff_secs must be non-negative",
                self.name
            );
        }
        if self.request_policy.backoff_factor <= 0.0 {
            bail!(
                "collector '{}': backoff_factor must be positive",
                self.name
            );
        }
        if self.request_policy.timeout_secs <= 0.0 {
            bail!("collector '{}': timeout_secs must be positive", self.name);
        }
        if !self.periodic.schedule.trim().is_empty() {
            Cadence::parse_cron(&self.periodic.schedule).with_context(|| {
                format!(
                    "collector '{}': malformed cron expression '{}'",
                    self.name, self.periodic.schedule
                )
            })?;
        }
        if self.periodic.enabled
            && matches!(self.source_kind, SourceKind::Chain | SourceKind::Etf)
            && self.credentials_ref.is_some()
        {
            let var = self.credentials_ref.as_ref().unwrap();
            if std::env::var(var).is_err() {
                bail!(
                    "collector '{}' is enabled but credential env var '{}' is not set",
                    self.name,
                    var
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CollectorFile {
    #[serde(rename = "collector", default)]
    pub collectors: Vec<CollectorConfig>,
}

/// Top-level config: the parsed collector list plus process-wide knobs
/// that come from the environment rather than the TOML file (§6).
#[derive(Debug, Clone)]
pub struct Config {
    pub collectors: Vec<CollectorConfig>,
    pub metrics_port: u16,
    pub collector_interval_seconds: u64,
    pub log_level: String,
    pub sqlite_path: String,
}

impl Config {
    /// Loads collector declarations from a TOML file and process knobs
    /// from the environment (§6), failing fast if either is malformed.
    pub fn load(collectors_path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(collectors_path).with_context(|| {
            format!("reading collector config file {collectors_path:?}")
        })?;
        Self::load_from_str(&raw)
    }

    pub fn load_from_str(raw: &str) -> Result<Self> {
        let file: CollectorFile =
            toml::from_str(raw).context("parsing collector config TOML")?;
        for c in &file.collectors {
            c.validate()?;
        }

        let metrics_port = env_or("METRICS_PORT", 9100u16)?;
        let collector_interval_seconds = env_or("COLLECTOR_INTERVAL_SECONDS", 60u64)?;
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let sqlite_path = std::env::var("SQLITE_PATH").unwrap_or_else(|_| {
            std::env::var("POSTGRES_DB")
                .map(|_| "./data/collector.db".to_string())
                .unwrap_or_else(|_| "./data/collector.db".to_string())
        });

        Ok(Self {
            collectors: file.collectors,
            metrics_port,
            collector_interval_seconds,
            log_level,
            sqlite_path,
        })
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("environment variable {key} is not valid")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[collector]]
        name = "binance_btc_1m"
        source_kind = "exchange"
        source_name = "binance"
        symbol = "BTC/USDT"
        data_type = { kind = "ohlcv", timeframe = "1m" }

        [collector.periodic]
        enabled = true
        schedule = ""
        lookback_minutes = 5
    "#;

    #[test]
    fn loads_minimal_config() {
        let cfg = Config::load_from_str(SAMPLE).unwrap();
        assert_eq!(cfg.collectors.len(), 1);
        assert_eq!(cfg.collectors[0].name, "binance_btc_1m");
        assert_eq!(cfg.collectors[0].request_policy.max_retries, 3);
    }

    #[test]
    fn loads_from_real_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collectors.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.collectors.len(), 1);
    }

    #[test]
    fn rejects_malformed_cron() {
        let bad = r#"
            [[collector]]
            name = "bad"
            source_kind = "exchange"
            source_name = "binance"
            data_type = { kind = "funding_rate" }

            [collector.periodic]
            enabled = true
            schedule = "not a cron"
        "#;
        assert!(Config::load_from_str(bad).is_err());
    }

    #[test]
    fn rejects_negative_backoff() {
        let cfg = CollectorConfig {
            name: "x".into(),
            source_kind: SourceKind::Exchange,
            source_name: "binance".into(),
            credentials_ref: None,
            base_asset: None,
            quote_asset: None,
            symbol: None,
            addresses: vec![],
            products: vec![],
            data_type: DataType::FundingRate,
            periodic: PeriodicSchedule::default(),
            request_policy: RequestPolicy {
                initial_backoff_secs: -1.0,
                ..Default::default()
            },
            validation: ValidationPolicy::default(),
            thresholds: ClassificationThresholds::default(),
        };
        assert!(cfg.validate().is_err());
    }
}
