//! Configuration management for beanrec
//!
//! This module handles loading, validation, and management of
//! beanrec configuration from YAML files.

pub mod error;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use error::ConfigError;

// ==================== Configuration Types ====================

/// Matching parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Maximum date distance between matched postings, in days
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    /// Numeric tolerance for cost-basis lot weights
    #[serde(default = "default_amount_tolerance")]
    pub amount_tolerance: Decimal,
    /// Balance-closure epsilon per currency, after plug elision
    #[serde(default = "default_balance_epsilon")]
    pub balance_epsilon: Decimal,
    /// Maximum number of entries merged into one hypothesis
    #[serde(default = "default_max_merged_entries")]
    pub max_merged_entries: usize,
    /// Maximum hypothesis expansions examined per pending entry
    #[serde(default = "default_max_expansions")]
    pub max_expansions: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            amount_tolerance: default_amount_tolerance(),
            balance_epsilon: default_balance_epsilon(),
            max_merged_entries: default_max_merged_entries(),
            max_expansions: default_max_expansions(),
        }
    }
}

fn default_window_days() -> i64 {
    5
}

fn default_amount_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_balance_epsilon() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_max_merged_entries() -> usize {
    4
}

fn default_max_expansions() -> usize {
    64
}

/// Classifier parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Accounts excluded from training and feature extraction
    #[serde(default = "default_ignore_account_pattern")]
    pub ignore_account_pattern: String,
    /// Maximum decision-tree depth
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ignore_account_pattern: default_ignore_account_pattern(),
            max_depth: default_max_depth(),
        }
    }
}

fn default_ignore_account_pattern() -> String {
    "^Income.*:Capital-Gains(?::|$)".to_string()
}

fn default_max_depth() -> usize {
    16
}

/// Account-pattern to output-file mapping entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountFileMap {
    /// Regular expression matched against the account name
    pub pattern: String,
    /// Ledger file receiving matching entries
    pub file: String,
}

/// Output file selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Ledger file to which new transactions are added by default
    #[serde(default = "default_output_file")]
    pub default_file: String,
    /// Ledger file receiving price entries (defaults to default_file)
    #[serde(default)]
    pub price_file: Option<String>,
    /// Ledger file receiving ignored entries
    #[serde(default = "default_ignore_file")]
    pub ignore_file: String,
    /// Per-account transaction output overrides
    #[serde(default)]
    pub transaction_map: Vec<AccountFileMap>,
    /// Per-account open-directive output overrides
    #[serde(default)]
    pub open_map: Vec<AccountFileMap>,
    /// Per-account balance-directive output overrides
    #[serde(default)]
    pub balance_map: Vec<AccountFileMap>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            default_file: default_output_file(),
            price_file: None,
            ignore_file: default_ignore_file(),
            transaction_map: Vec::new(),
            open_map: Vec::new(),
            balance_map: Vec::new(),
        }
    }
}

fn default_output_file() -> String {
    "transactions.bean".to_string()
}

fn default_ignore_file() -> String {
    "ignored.bean".to_string()
}

/// External source declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source name (e.g. "mint", "ofx")
    pub name: String,
    /// Accounts this source is authoritative for
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Metadata keys carrying this source's external identity
    #[serde(default)]
    pub identity_keys: Vec<String>,
    /// File of already-parsed pending entries (JSON), for the CLI driver
    #[serde(default)]
    pub pending_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Matching parameters
    #[serde(default)]
    pub matching: MatchingConfig,
    /// Classifier parameters
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Output file selection
    #[serde(default)]
    pub output: OutputConfig,
    /// Restrict reconciliation to accounts matching this pattern
    #[serde(default)]
    pub account_pattern: Option<String>,
    /// External sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path).map_err(|_| ConfigError::IoError {
            path: path.to_string_lossy().to_string(),
        })?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::InvalidYaml {
                message: e.to_string(),
            })?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.matching.window_days < 0 {
            return Err(ConfigError::InvalidValue {
                field: "matching.window_days".to_string(),
                reason: "Window must not be negative".to_string(),
            });
        }

        if self.matching.amount_tolerance.is_sign_negative()
            || self.matching.balance_epsilon.is_sign_negative()
        {
            return Err(ConfigError::InvalidValue {
                field: "matching".to_string(),
                reason: "Tolerances must not be negative".to_string(),
            });
        }

        if self.matching.max_merged_entries < 1 {
            return Err(ConfigError::InvalidValue {
                field: "matching.max_merged_entries".to_string(),
                reason: "At least one entry per hypothesis is required".to_string(),
            });
        }

        Self::validate_pattern("classifier.ignore_account_pattern",
            &self.classifier.ignore_account_pattern)?;
        if let Some(pattern) = &self.account_pattern {
            Self::validate_pattern("account_pattern", pattern)?;
        }
        for (field, maps) in [
            ("output.transaction_map", &self.output.transaction_map),
            ("output.open_map", &self.output.open_map),
            ("output.balance_map", &self.output.balance_map),
        ] {
            for map in maps {
                Self::validate_pattern(field, &map.pattern)?;
            }
        }

        Ok(())
    }

    fn validate_pattern(field: &str, pattern: &str) -> Result<(), ConfigError> {
        regex::Regex::new(pattern).map_err(|_| ConfigError::InvalidPattern {
            field: field.to_string(),
            pattern: pattern.to_string(),
        })?;
        Ok(())
    }

    /// Generate a default configuration file
    pub fn generate_default() -> &'static str {
        include_str!("../templates/default_config.yaml")
    }

    /// Source declared authoritative for an account, if any
    pub fn source_for_account(&self, account: &str) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|s| s.accounts.iter().any(|a| a == account))
    }

    /// Union of all configured identity metadata keys
    pub fn identity_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for source in &self.sources {
            for key in &source.identity_keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.matching.window_days, 5);
        assert_eq!(config.matching.amount_tolerance, Decimal::new(1, 2));
        assert_eq!(config.matching.balance_epsilon, Decimal::new(5, 3));
    }

    #[test]
    fn template_parses_and_validates() {
        let config: Config = serde_yaml::from_str(Config::generate_default()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_negative_window() {
        let mut config = Config::default();
        config.matching.window_days = -1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_bad_pattern() {
        let mut config = Config::default();
        config.account_pattern = Some("([unclosed".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), error::ConfigErrorCode::InvalidPattern);
    }

    #[test]
    fn identity_keys_are_deduplicated() {
        let mut config = Config::default();
        config.sources.push(SourceConfig {
            name: "mint".to_string(),
            accounts: vec!["Liabilities:Credit-Card".to_string()],
            identity_keys: vec!["source_desc".to_string()],
            pending_file: None,
        });
        config.sources.push(SourceConfig {
            name: "ofx".to_string(),
            accounts: vec!["Assets:Checking".to_string()],
            identity_keys: vec!["fitid".to_string(), "source_desc".to_string()],
            pending_file: None,
        });
        assert_eq!(config.identity_keys(), vec!["source_desc", "fitid"]);
        assert_eq!(
            config.source_for_account("Assets:Checking").unwrap().name,
            "ofx"
        );
    }
}
