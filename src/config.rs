use crate::liquidity::balances::ChannelId;
use crate::liquidity::fees::{
    FeeLimits, DEFAULT_MAX_MINER_FEE, DEFAULT_MAX_PREPAY, DEFAULT_SWAP_FEE_PPM,
};
use crate::liquidity::parameters::{
    Parameters, DEFAULT_CONF_TARGET, DEFAULT_FAILURE_BACKOFF_HOURS, DEFAULT_MAX_IN_FLIGHT,
};
use crate::liquidity::rules::{RatioRule, ThresholdRule};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub lnd: LndConfig,
    pub loopd: LoopdConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub liquidity: LiquidityConfig,
}

#[derive(Debug, Deserialize)]
pub struct LndConfig {
    /// lnd REST endpoint (host:port, no scheme)
    pub rest_url: String,
    /// Path to a macaroon allowed to list channels
    pub macaroon_path: PathBuf,
    /// Path to lnd's TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct LoopdConfig {
    /// loopd REST endpoint (host:port, no scheme)
    pub rest_url: String,
    /// Path to loopd's loop.macaroon
    pub macaroon_path: PathBuf,
    /// Path to loopd's TLS certificate
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the suggestion audit database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Master enable/disable
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Suggestion interval in seconds
    #[serde(default = "default_loop_interval")]
    pub loop_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RatioRuleConfig {
    pub minimum_inbound: f64,
    pub minimum_outbound: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ChannelRuleConfig {
    /// Short channel id in its 64-bit integer form
    pub channel_id: u64,
    /// Minimum incoming liquidity, percent of capacity
    pub minimum_incoming: u64,
    /// Minimum outgoing liquidity, percent of capacity
    pub minimum_outgoing: u64,
}

#[derive(Debug, Deserialize)]
pub struct LiquidityConfig {
    /// Ratio rule over all of the node's channels
    #[serde(default)]
    pub node_rule: Option<RatioRuleConfig>,
    /// Ratio rule applied to each peer separately
    #[serde(default)]
    pub peer_rule: Option<RatioRuleConfig>,
    #[serde(default)]
    pub channel_rules: Vec<ChannelRuleConfig>,
    /// Consider private channels for swaps
    #[serde(default)]
    pub include_private: bool,
    /// Hours to leave channels alone after an off-chain payment failure
    #[serde(default = "default_failure_backoff_hours")]
    pub failure_backoff_hours: u64,
    /// Maximum server fee in PPM of the swap amount
    #[serde(default = "default_max_swap_fee_ppm")]
    pub max_swap_fee_ppm: u64,
    /// Maximum on-chain fee per swap (satoshis)
    #[serde(default = "default_max_miner_fee")]
    pub max_miner_fee_sats: u64,
    /// Maximum no-show prepay for loop out (satoshis)
    #[serde(default = "default_max_prepay")]
    pub max_prepay_sats: u64,
    /// Confirmation target for loop out sweeps
    #[serde(default = "default_conf_target")]
    pub conf_target: u32,
    /// Maximum swaps in flight at once
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("autoloop.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_loop_interval() -> u64 {
    600
}
fn default_failure_backoff_hours() -> u64 {
    DEFAULT_FAILURE_BACKOFF_HOURS as u64
}
fn default_max_swap_fee_ppm() -> u64 {
    DEFAULT_SWAP_FEE_PPM
}
fn default_max_miner_fee() -> u64 {
    DEFAULT_MAX_MINER_FEE
}
fn default_max_prepay() -> u64 {
    DEFAULT_MAX_PREPAY
}
fn default_conf_target() -> u32 {
    DEFAULT_CONF_TARGET
}
fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
            enabled: true,
            loop_interval_secs: default_loop_interval(),
        }
    }
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            node_rule: None,
            peer_rule: None,
            channel_rules: Vec::new(),
            include_private: false,
            failure_backoff_hours: default_failure_backoff_hours(),
            max_swap_fee_ppm: default_max_swap_fee_ppm(),
            max_miner_fee_sats: default_max_miner_fee(),
            max_prepay_sats: default_max_prepay(),
            conf_target: default_conf_target(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl LiquidityConfig {
    /// Build manager parameters. Rule ranges are checked by the manager.
    pub fn to_parameters(&self) -> Parameters {
        let ratio = |r: &RatioRuleConfig| RatioRule::new(r.minimum_inbound, r.minimum_outbound);

        Parameters {
            node_rule: self.node_rule.as_ref().map(ratio),
            peer_rule: self.peer_rule.as_ref().map(ratio),
            channel_rules: self
                .channel_rules
                .iter()
                .map(|r| {
                    (
                        ChannelId(r.channel_id),
                        ThresholdRule::new(r.minimum_incoming, r.minimum_outgoing),
                    )
                })
                .collect(),
            include_private: self.include_private,
            failure_backoff: chrono::Duration::hours(self.failure_backoff_hours as i64),
            fee_limits: FeeLimits {
                max_swap_fee_ppm: self.max_swap_fee_ppm,
                max_miner_fee: self.max_miner_fee_sats,
                max_prepay: self.max_prepay_sats,
            },
            conf_target: self.conf_target,
            max_in_flight: self.max_in_flight,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Hard limits (non-configurable safety rails)
        const ABS_MAX_SWAP_FEE_PPM: u64 = 50_000;
        const ABS_MAX_IN_FLIGHT: usize = 10;
        const ABS_MIN_LOOP_INTERVAL_SECS: u64 = 60;
        const ABS_MAX_FAILURE_BACKOFF_HOURS: u64 = 24 * 30;

        if self.general.loop_interval_secs < ABS_MIN_LOOP_INTERVAL_SECS {
            anyhow::bail!(
                "loop_interval_secs ({}) below absolute minimum ({})",
                self.general.loop_interval_secs,
                ABS_MIN_LOOP_INTERVAL_SECS
            );
        }
        if self.liquidity.max_swap_fee_ppm > ABS_MAX_SWAP_FEE_PPM {
            anyhow::bail!(
                "max_swap_fee_ppm ({}) above absolute maximum ({})",
                self.liquidity.max_swap_fee_ppm,
                ABS_MAX_SWAP_FEE_PPM
            );
        }
        if self.liquidity.max_in_flight > ABS_MAX_IN_FLIGHT {
            anyhow::bail!(
                "max_in_flight ({}) above absolute maximum ({})",
                self.liquidity.max_in_flight,
                ABS_MAX_IN_FLIGHT
            );
        }
        if self.liquidity.failure_backoff_hours > ABS_MAX_FAILURE_BACKOFF_HOURS {
            anyhow::bail!(
                "failure_backoff_hours ({}) above absolute maximum ({})",
                self.liquidity.failure_backoff_hours,
                ABS_MAX_FAILURE_BACKOFF_HOURS
            );
        }

        let mut seen = HashSet::new();
        for rule in &self.liquidity.channel_rules {
            if !seen.insert(rule.channel_id) {
                anyhow::bail!("duplicate channel rule for channel {}", rule.channel_id);
            }
        }

        for (name, path) in [
            ("lnd TLS cert", &self.lnd.tls_cert_path),
            ("lnd macaroon", &self.lnd.macaroon_path),
            ("loopd TLS cert", &self.loopd.tls_cert_path),
            ("loopd macaroon", &self.loopd.macaroon_path),
        ] {
            if !path.exists() {
                anyhow::bail!("{} not found at: {}", name, path.display());
            }
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// Every credential path is set to the provided path (must exist for validation).
    #[cfg(test)]
    pub fn test_default(credential_path: PathBuf) -> Self {
        Self {
            lnd: LndConfig {
                rest_url: "localhost:8080".to_string(),
                macaroon_path: credential_path.clone(),
                tls_cert_path: credential_path.clone(),
            },
            loopd: LoopdConfig {
                rest_url: "localhost:8081".to_string(),
                macaroon_path: credential_path.clone(),
                tls_cert_path: credential_path,
            },
            general: GeneralConfig::default(),
            liquidity: LiquidityConfig::default(),
        }
    }
}
