//! flotilla.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use flotilla_market::{ChainConfig, DenyPolicy, MarketConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlotillaConfig {
    /// Public base domain for routable subdomains.
    pub base_domain: String,
    pub chain: Option<ChainConfig>,
    pub market: Option<MarketSection>,
    pub tee: Option<TeeSection>,
    pub escrow: Option<EscrowSection>,
    pub proxy: Option<ProxySection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSection {
    pub default_deposit: Option<u64>,
    pub bid_base_delay_secs: Option<u64>,
    pub bid_max_attempts: Option<u32>,
    pub lease_settle_delay_secs: Option<u64>,
    #[serde(default)]
    pub blocked_providers: BTreeSet<String>,
    #[serde(default)]
    pub exposed_blocked_providers: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeeSection {
    pub endpoint: String,
    /// Environment variable holding the control API token.
    pub api_key_env: String,
    pub hourly_rate_cents: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscrowSection {
    pub margin_rate: Option<f64>,
    pub units_per_day: Option<u64>,
    pub cents_per_unit: Option<f64>,
    pub billing_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySection {
    pub cache_ttl_secs: Option<u64>,
    pub cache_capacity: Option<usize>,
}

impl FlotillaConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlotillaConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Market tuning assembled from the optional section.
    pub fn market_config(&self) -> MarketConfig {
        let section = self.market.clone().unwrap_or_default();
        let defaults = MarketConfig::default();
        MarketConfig {
            default_deposit: section.default_deposit.unwrap_or(defaults.default_deposit),
            bid_base_delay: section
                .bid_base_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.bid_base_delay),
            bid_max_attempts: section.bid_max_attempts.unwrap_or(defaults.bid_max_attempts),
            lease_settle_delay: section
                .lease_settle_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_settle_delay),
            deny_policy: DenyPolicy {
                blocked: section.blocked_providers,
                exposed_blocked: section.exposed_blocked_providers,
            },
            ..defaults
        }
    }
}
