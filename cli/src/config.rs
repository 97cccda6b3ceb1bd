//! Service configuration file.
//!
//! ```toml
//! [log]
//! level = "info"
//! json = false
//! components = { chainpoll_core = "debug" }
//!
//! [storage]
//! path = "chainpoll.db"
//!
//! [[chains]]
//! chain_id = 1
//! rpc_url = "https://eth.llamarpc.com"
//!
//! [chains.head_tracker]
//! finality = { mode = "fixed_depth", depth = 64 }
//!
//! [chains.poller]
//! start_block = 19000000
//!
//! [[chains.filters]]
//! name = "usdc-transfers"
//! addresses = ["0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"]
//! event_sigs = ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"]
//! retention_secs = 604800
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use chainpoll_core::{Filter, HeadTrackerConfig, PollerConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

/// Log level per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: crate name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

/// Where indexed data lives. No path means in-memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Check `eth_chainId` before starting.
    #[serde(default = "default_true")]
    pub verify_chain_id: bool,
    #[serde(default)]
    pub head_tracker: HeadTrackerConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl ChainConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    pub addresses: Vec<String>,
    pub event_sigs: Vec<String>,
    #[serde(default)]
    pub topic2: Vec<String>,
    #[serde(default)]
    pub topic3: Vec<String>,
    #[serde(default)]
    pub topic4: Vec<String>,
    pub retention_secs: Option<u64>,
    /// Newest finalized logs to keep for this filter; 0 keeps all.
    #[serde(default)]
    pub max_logs_kept: u64,
}

impl FilterConfig {
    pub fn to_filter(&self) -> Result<Filter> {
        let mut filter = Filter::new(&self.name, &self.addresses, &self.event_sigs);
        for (index, values) in [(1, &self.topic2), (2, &self.topic3), (3, &self.topic4)] {
            if !values.is_empty() {
                filter = filter.with_topic(index, values.iter().cloned())?;
            }
        }
        if let Some(secs) = self.retention_secs {
            filter = filter.with_retention(Duration::from_secs(secs));
        }
        if self.max_logs_kept > 0 {
            filter = filter.with_max_logs_kept(self.max_logs_kept);
        }
        Ok(filter.normalized()?)
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            bail!("no [[chains]] configured");
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                bail!("chain {} configured twice", chain.chain_id);
            }
            if chain.rpc_url.is_empty() {
                bail!("chain {}: rpc_url is empty", chain.chain_id);
            }
            chain
                .head_tracker
                .validate()
                .with_context(|| format!("chain {}", chain.chain_id))?;
            chain
                .poller
                .validate()
                .with_context(|| format!("chain {}", chain.chain_id))?;
            let mut names = HashSet::new();
            for filter in &chain.filters {
                if !names.insert(filter.name.as_str()) {
                    bail!("chain {}: filter {:?} defined twice", chain.chain_id, filter.name);
                }
                filter
                    .to_filter()
                    .with_context(|| format!("chain {}: filter {:?}", chain.chain_id, filter.name))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainpoll_core::FinalityMode;

    const SAMPLE: &str = r#"
        [log]
        level = "debug"
        json = true

        [storage]
        path = "/tmp/chainpoll.db"

        [[chains]]
        chain_id = 1
        rpc_url = "http://localhost:8545"

        [chains.head_tracker]
        history_depth = 256
        finality = { mode = "fixed_depth", depth = 64 }

        [chains.poller]
        start_block = 100
        backfill_batch_size = 500

        [[chains.filters]]
        name = "transfers"
        addresses = ["0x00000000000000000000000000000000000000AA"]
        event_sigs = ["0xDDF252AD1BE2C89B69C2B068FC378DAA952BA7F163C4A11628F55A4DF523B3EF"]
        retention_secs = 3600
        max_logs_kept = 1000

        [[chains]]
        chain_id = 10
        rpc_url = "http://localhost:9545"
        verify_chain_id = false

        [chains.head_tracker]
        finality = { mode = "finalized_tag" }
    "#;

    #[test]
    fn parses_full_config() {
        let config = ServiceConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(config.storage.path.as_deref(), Some("/tmp/chainpoll.db"));
        assert_eq!(config.chains.len(), 2);

        let eth = &config.chains[0];
        assert_eq!(eth.head_tracker.finality, FinalityMode::FixedDepth { depth: 64 });
        assert_eq!(eth.head_tracker.history_depth, 256);
        assert_eq!(eth.head_tracker.poll_interval_ms, HeadTrackerConfig::default().poll_interval_ms);
        assert_eq!(eth.poller.start_block, Some(100));
        assert_eq!(eth.poller.backfill_batch_size, 500);
        assert!(eth.verify_chain_id);

        let filter = eth.filters[0].to_filter().unwrap();
        assert_eq!(filter.addresses, vec!["0x00000000000000000000000000000000000000aa"]);
        assert_eq!(filter.retention, Some(Duration::from_secs(3600)));
        assert_eq!(filter.max_logs_kept, 1000);

        let op = &config.chains[1];
        assert_eq!(op.head_tracker.finality, FinalityMode::FinalizedTag);
        assert!(!op.verify_chain_id);
        assert!(op.filters.is_empty());
    }

    #[test]
    fn rejects_duplicate_chains() {
        let raw = r#"
            [[chains]]
            chain_id = 1
            rpc_url = "http://a"
            [[chains]]
            chain_id = 1
            rpc_url = "http://b"
        "#;
        let err = ServiceConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("configured twice"));
    }

    #[test]
    fn rejects_invalid_filters_and_settings() {
        let raw = r#"
            [[chains]]
            chain_id = 1
            rpc_url = "http://a"
            [[chains.filters]]
            name = "zero"
            addresses = ["0x0000000000000000000000000000000000000000"]
            event_sigs = ["0x01"]
        "#;
        assert!(ServiceConfig::parse(raw).is_err());

        let raw = r#"
            [[chains]]
            chain_id = 1
            rpc_url = "http://a"
            [chains.poller]
            backfill_batch_size = 0
        "#;
        assert!(ServiceConfig::parse(raw).is_err());
    }

    #[test]
    fn requires_at_least_one_chain() {
        assert!(ServiceConfig::parse("").is_err());
    }
}
