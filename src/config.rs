//! Gateway configuration
//! Mission: one place to load every environment-driven setting, all optional
//! with documented defaults except the signer material.

use std::env;
use std::time::Duration;

use anyhow::Result;

/// Which upstream network the gateway currently targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
        }
    }
}

/// Process-wide startup configuration, loaded once and handed out by `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Signer material reference; the gateway never inspects this beyond
    /// handing it to the injected signer capability. Wallet/key management
    /// is an external collaborator.
    pub private_key: Option<String>,
    pub network: Network,
    pub port: u16,
    pub price_poll_interval: Duration,
    pub upstream_timeout: Duration,
    pub asset_id_cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let private_key = env::var("PRIVATE_KEY").ok();

        // USE_TESTNET: "false" disables testnet; any other value enables it.
        let network = match env::var("USE_TESTNET") {
            Ok(v) if v == "false" => Network::Mainnet,
            _ => Network::Testnet,
        };

        // Listen port is fixed at 3001 in this design, but kept overridable
        // for local development and tests.
        let port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3001);

        let price_poll_interval = Duration::from_millis(
            env::var("PRICE_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2000),
        );

        let upstream_timeout = Duration::from_secs(
            env::var("UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        );

        let asset_id_cache_ttl = Duration::from_secs(
            env::var("ASSET_ID_CACHE_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
        );

        Ok(Self {
            private_key,
            network,
            port,
            price_poll_interval,
            upstream_timeout,
            asset_id_cache_ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane_without_env() {
        // SAFETY: test-only process-wide env mutation, no concurrent access.
        unsafe {
            env::remove_var("PRICE_POLL_INTERVAL_MS");
            env::remove_var("UPSTREAM_TIMEOUT_SECS");
            env::remove_var("ASSET_ID_CACHE_TTL_SECS");
            env::remove_var("USE_TESTNET");
        }
        let cfg = Config::from_env().expect("config loads");
        assert_eq!(cfg.network, Network::Testnet);
        assert_eq!(cfg.price_poll_interval, Duration::from_secs(2));
        assert_eq!(cfg.upstream_timeout, Duration::from_secs(10));
    }

    #[test]
    fn use_testnet_false_selects_mainnet() {
        unsafe {
            env::set_var("USE_TESTNET", "false");
        }
        let cfg = Config::from_env().expect("config loads");
        assert_eq!(cfg.network, Network::Mainnet);
        unsafe {
            env::remove_var("USE_TESTNET");
        }
    }
}
