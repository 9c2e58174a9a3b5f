//! Configuration management for the MicroLoan coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The resulting `Settings` is built once in `main` and handed to constructors.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain: ChainConfig,
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub scan_interval_ms: u64,
    pub max_concurrent_tasks: usize,
    pub max_ambiguous_attempts: u32,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_settlement_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_settlement_timeout_secs() -> u64 {
    600
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_settlement_timeout_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl SettlementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    /// `memory://` selects the in-process task store
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub microloan_address: String,
    pub usdc_address: String,
    pub confirmation_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Settings {
    /// Load settings from the file named by `MICROLOAN_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("MICROLOAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }

        Address::from_str(&self.chain.microloan_address)
            .map_err(|e| anyhow::anyhow!("Invalid MicroLoan contract address: {}", e))?;
        Address::from_str(&self.chain.usdc_address)
            .map_err(|e| anyhow::anyhow!("Invalid USDC token address: {}", e))?;

        if self.settlement.poll_interval_ms == 0 {
            anyhow::bail!("settlement.poll_interval_ms must be positive");
        }
        if self.settlement.timeout() <= self.settlement.poll_interval() {
            anyhow::bail!("settlement.timeout_secs must exceed the poll interval");
        }
        if self.settlement.max_consecutive_errors == 0 {
            anyhow::bail!("settlement.max_consecutive_errors must be at least 1");
        }
        if self.coordinator.max_concurrent_tasks == 0 {
            anyhow::bail!("coordinator.max_concurrent_tasks must be at least 1");
        }
        if self.chain.confirmation_blocks == 0 {
            tracing::warn!(
                "Chain {} settles on inclusion (confirmation_blocks = 0)",
                self.chain.name
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[coordinator]
instance_id = "coordinator-1"
scan_interval_ms = 2000
max_concurrent_tasks = 16
max_ambiguous_attempts = 5
health_check_interval_secs = 30

[database]
url = "memory://"
max_connections = 5
min_connections = 1

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chain]
chain_id = 11155111
name = "sepolia"
rpc_urls = ["https://sepolia.infura.io/v3/${MICROLOAN_TEST_INFURA_KEY}"]
microloan_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
usdc_address = "0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"
confirmation_blocks = 3

[wallet]
private_key_env = "MICROLOAN_OPERATOR_KEY"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input).unwrap();
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_settlement_defaults_apply_when_section_missing() {
        env::set_var("MICROLOAN_TEST_INFURA_KEY", "abc123");
        let settings = Settings::parse(SAMPLE).unwrap();

        assert_eq!(settings.settlement.poll_interval(), Duration::from_secs(5));
        assert_eq!(settings.settlement.max_consecutive_errors, 5);
        assert!(settings.database.is_memory());
        assert_eq!(
            settings.chain.rpc_urls[0],
            "https://sepolia.infura.io/v3/abc123"
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.chain.chain_id, 11155111);
        assert_eq!(settings.coordinator.max_concurrent_tasks, 16);
    }

    #[test]
    fn test_rejects_timeout_shorter_than_interval() {
        let raw = format!(
            "{}\n[settlement]\npoll_interval_ms = 5000\ntimeout_secs = 1\n",
            SAMPLE
        );
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_rejects_bad_contract_address() {
        let raw = SAMPLE.replace(
            "0x5FbDB2315678afecb367f032d93F642f64180aa3",
            "not-an-address",
        );
        assert!(Settings::parse(&raw).is_err());
    }
}
