//! Coordinator configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing_subscriber::EnvFilter;

use atomicledger_common::{constants, DurationExt, PayoutSchedule};
use atomicledger_ledger::EngineConfig;

/// Configuration loading and validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{0}")]
    Invalid(String),
}

/// Trade settlement configuration.
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// How often the worker looks for due trades.
    pub poll_interval: Duration,
    /// Maximum trades settled per poll.
    pub batch_size: usize,
    /// Take the stake out of the balance when the trade opens.
    pub debit_stake_on_open: bool,
    /// Credits applied at settlement.
    pub payouts: PayoutSchedule,
    /// Shortest allowed trade.
    pub min_duration: Duration,
    /// Longest allowed trade.
    pub max_duration: Duration,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval: constants::settlement_poll_interval().as_std(),
            batch_size: 100,
            debit_stake_on_open: true,
            payouts: PayoutSchedule::default(),
            min_duration: constants::min_trade_duration().as_std(),
            max_duration: constants::max_trade_duration().as_std(),
        }
    }
}

/// Outbound notification configuration.
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Telegram bot token; notifications go to the log when absent.
    pub telegram_bot_token: Option<String>,
    /// Chats that receive ledger events.
    pub telegram_chat_ids: Vec<String>,
    /// Bot API base URL.
    pub telegram_api_base: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_chat_ids: Vec::new(),
            telegram_api_base: "https://api.telegram.org".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Node ID, generated when absent.
    pub node_id: Option<String>,
    /// Listen address.
    pub listen_addr: String,
    /// Listen port.
    pub listen_port: u16,
    /// PostgreSQL URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Pool size for the PostgreSQL store.
    pub max_db_connections: u32,
    /// Mutation engine configuration.
    pub engine: EngineConfig,
    /// Trade settlement configuration.
    pub settlement: SettlementConfig,
    /// Notification configuration.
    pub notifier: NotifierConfig,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            database_url: None,
            max_db_connections: 10,
            engine: EngineConfig::default(),
            settlement: SettlementConfig::default(),
            notifier: NotifierConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(id) = lookup("LEDGER_NODE_ID") {
            config.node_id = Some(id);
        }
        if let Some(addr) = lookup("LEDGER_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(port) = lookup("LEDGER_LISTEN_PORT") {
            config.listen_port = parse("LEDGER_LISTEN_PORT", &port)?;
        }
        if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            config.database_url = Some(url);
        }
        if let Some(max) = lookup("DATABASE_MAX_CONNECTIONS") {
            config.max_db_connections = parse("DATABASE_MAX_CONNECTIONS", &max)?;
        }

        if let Some(attempts) = lookup("LEDGER_MAX_ATTEMPTS") {
            config.engine.max_attempts = parse("LEDGER_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(ms) = lookup("LEDGER_BACKOFF_MS") {
            config.engine.backoff_base = Duration::from_millis(parse("LEDGER_BACKOFF_MS", &ms)?);
        }
        if let Some(flag) = lookup("LEDGER_ATOMIC_PATH") {
            config.engine.use_atomic_path = parse_bool("LEDGER_ATOMIC_PATH", &flag)?;
        }

        if let Some(ms) = lookup("SETTLEMENT_POLL_MS") {
            config.settlement.poll_interval = Duration::from_millis(parse("SETTLEMENT_POLL_MS", &ms)?);
        }
        if let Some(batch) = lookup("SETTLEMENT_BATCH") {
            config.settlement.batch_size = parse("SETTLEMENT_BATCH", &batch)?;
        }
        if let Some(flag) = lookup("DEBIT_STAKE_ON_OPEN") {
            config.settlement.debit_stake_on_open = parse_bool("DEBIT_STAKE_ON_OPEN", &flag)?;
        }

        if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            config.notifier.telegram_bot_token = Some(token);
        }
        if let Some(ids) = lookup("TELEGRAM_CHAT_IDS") {
            config.notifier.telegram_chat_ids = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("Listen port cannot be 0".to_string()));
        }

        if self.engine.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "Mutation attempts must be at least 1".to_string(),
            ));
        }

        if self.settlement.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "Settlement batch size must be at least 1".to_string(),
            ));
        }

        if self.settlement.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "Settlement poll interval cannot be 0".to_string(),
            ));
        }

        if self.settlement.min_duration > self.settlement.max_duration {
            return Err(ConfigError::Invalid(
                "Minimum trade duration cannot exceed maximum".to_string(),
            ));
        }

        if EnvFilter::try_new(&self.log_level).is_err() {
            return Err(ConfigError::InvalidValue {
                name: "LOG_LEVEL",
                value: self.log_level.clone(),
            });
        }

        if self.notifier.telegram_bot_token.is_some() && self.notifier.telegram_chat_ids.is_empty() {
            return Err(ConfigError::Invalid(
                "TELEGRAM_CHAT_IDS is required when a bot token is set".to_string(),
            ));
        }

        Ok(())
    }

    /// Log filter: `RUST_LOG` when set, otherwise the configured level.
    pub fn log_filter(&self) -> EnvFilter {
        self.log_filter_from(std::env::var("RUST_LOG").ok())
    }

    fn log_filter_from(&self, rust_log: Option<String>) -> EnvFilter {
        rust_log
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(&self.log_level))
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.database_url.is_none());
        assert!(config.settlement.debit_stake_on_open);
        assert_eq!(config.engine.max_attempts, 3);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = CoordinatorConfig::default();
        config.listen_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = CoordinatorConfig::from_lookup(lookup_from(&[
            ("LEDGER_LISTEN_PORT", "9000"),
            ("DATABASE_URL", "postgres://ledger@localhost/ledger"),
            ("LEDGER_MAX_ATTEMPTS", "5"),
            ("LEDGER_BACKOFF_MS", "10"),
            ("LEDGER_ATOMIC_PATH", "off"),
            ("SETTLEMENT_POLL_MS", "250"),
            ("DEBIT_STAKE_ON_OPEN", "false"),
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_IDS", "111, 222,,"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert!(config.database_url.is_some());
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(config.engine.backoff_base, Duration::from_millis(10));
        assert!(!config.engine.use_atomic_path);
        assert_eq!(config.settlement.poll_interval, Duration::from_millis(250));
        assert!(!config.settlement.debit_stake_on_open);
        assert_eq!(config.notifier.telegram_chat_ids, vec!["111", "222"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_malformed_value_rejected() {
        let err = CoordinatorConfig::from_lookup(lookup_from(&[("LEDGER_LISTEN_PORT", "eighty")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "LEDGER_LISTEN_PORT",
                value: "eighty".to_string()
            }
        );
    }

    #[test]
    fn test_token_without_chats_is_invalid() {
        let config =
            CoordinatorConfig::from_lookup(lookup_from(&[("TELEGRAM_BOT_TOKEN", "123:abc")])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_sets_filter_default() {
        let config =
            CoordinatorConfig::from_lookup(lookup_from(&[("LOG_LEVEL", "debug")])).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.validate().is_ok());
        assert_eq!(config.log_filter_from(None).to_string(), "debug");
        assert_eq!(
            config.log_filter_from(Some("warn".to_string())).to_string(),
            "warn"
        );
    }
}
