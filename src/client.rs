use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use crate::config::Config;
use crate::liquidity::balances::{ChannelId, ChannelInfo};
use crate::liquidity::eligibility::{ExistingSwap, SwapState, SwapType};
use crate::liquidity::fees::{LoopInQuote, LoopOutQuote};
use crate::liquidity::restrictions::Restrictions;

/// Node and swap server calls the liquidity manager depends on.
///
/// This enables mock-based testing without a live node or swap server.
#[async_trait::async_trait]
pub trait LiquidityClient: Send + Sync {
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>>;
    async fn loop_out_restrictions(&self) -> anyhow::Result<Restrictions>;
    async fn loop_in_restrictions(&self) -> anyhow::Result<Restrictions>;
    async fn loop_out_quote(&self, amount: u64, conf_target: u32)
        -> anyhow::Result<LoopOutQuote>;
    async fn loop_in_quote(&self, amount: u64) -> anyhow::Result<LoopInQuote>;
}

/// Read access to the swaps the swap client knows about.
#[async_trait::async_trait]
pub trait SwapStore: Send + Sync {
    async fn list_swaps(&self) -> anyhow::Result<Vec<ExistingSwap>>;
}

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;
const RATE_LIMIT_DELAY_MS: u64 = 100;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";

/// One authenticated REST service.
struct Endpoint {
    http: reqwest::Client,
    base_url: String,
    macaroon: String,
}

impl Endpoint {
    fn new(name: &str, base_url: &str, tls_cert_path: &Path, macaroon_path: &Path) -> anyhow::Result<Self> {
        let cert_pem = std::fs::read(tls_cert_path).with_context(|| {
            format!(
                "Failed to read {} TLS cert at {}",
                name,
                tls_cert_path.display()
            )
        })?;
        let macaroon = std::fs::read(macaroon_path).with_context(|| {
            format!(
                "Failed to read {} macaroon at {}",
                name,
                macaroon_path.display()
            )
        })?;

        let cert = reqwest::Certificate::from_pem(&cert_pem)
            .with_context(|| format!("Invalid {} TLS cert", name))?;
        let http = reqwest::Client::builder()
            .add_root_certificate(cert)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .with_context(|| format!("Failed to create {} HTTP client", name))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            macaroon: hex::encode(macaroon),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("https://{}{}", self.base_url, path);
        let resp = self
            .http
            .get(&url)
            .header(MACAROON_HEADER, &self.macaroon)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}

/// Rate-limited, retrying REST client for lnd and loopd.
pub struct RestClient {
    lnd: Endpoint,
    loopd: Endpoint,
    /// Semaphore for rate limiting (1 concurrent request)
    rate_limiter: Arc<Semaphore>,
}

impl RestClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let lnd = Endpoint::new(
            "lnd",
            &config.lnd.rest_url,
            &config.lnd.tls_cert_path,
            &config.lnd.macaroon_path,
        )?;
        let loopd = Endpoint::new(
            "loopd",
            &config.loopd.rest_url,
            &config.loopd.tls_cert_path,
            &config.loopd.macaroon_path,
        )?;

        Ok(Self {
            lnd,
            loopd,
            rate_limiter: Arc::new(Semaphore::new(1)),
        })
    }

    async fn with_retry<F, Fut, T>(&self, name: &str, f: F) -> anyhow::Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self
                    .rate_limiter
                    .acquire()
                    .await
                    .map_err(|_| anyhow::anyhow!("Rate limiter semaphore closed"))?;
                sleep(Duration::from_millis(RATE_LIMIT_DELAY_MS)).await;
                f().await
            };

            match result {
                Ok(resp) => {
                    debug!("{}: success", name);
                    return Ok(resp);
                }
                Err(e) if attempt < MAX_RETRIES - 1 => {
                    let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                    warn!(
                        "{}: attempt {} failed ({:#}), retrying in {}ms",
                        name,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("{}: all {} attempts failed", name, MAX_RETRIES)));
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LiquidityClient for RestClient {
    async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>> {
        let resp: ListChannelsResponse = self
            .with_retry("ListChannels", || self.lnd.get("/v1/channels"))
            .await?;
        Ok(resp.channels.into_iter().map(ChannelInfo::from).collect())
    }

    async fn loop_out_restrictions(&self) -> anyhow::Result<Restrictions> {
        let resp: TermsResponse = self
            .with_retry("LoopOutTerms", || self.loopd.get("/v1/loop/out/terms"))
            .await?;
        Ok(Restrictions::new(resp.min_swap_amount, resp.max_swap_amount))
    }

    async fn loop_in_restrictions(&self) -> anyhow::Result<Restrictions> {
        let resp: TermsResponse = self
            .with_retry("LoopInTerms", || self.loopd.get("/v1/loop/in/terms"))
            .await?;
        Ok(Restrictions::new(resp.min_swap_amount, resp.max_swap_amount))
    }

    async fn loop_out_quote(
        &self,
        amount: u64,
        conf_target: u32,
    ) -> anyhow::Result<LoopOutQuote> {
        let path = format!("/v1/loop/out/quote/{}?conf_target={}", amount, conf_target);
        let resp: OutQuoteResponse = self
            .with_retry("LoopOutQuote", || self.loopd.get(&path))
            .await?;
        Ok(LoopOutQuote {
            swap_fee: resp.swap_fee_sat,
            miner_fee: resp.htlc_sweep_fee_sat,
            prepay_amount: resp.prepay_amt_sat,
        })
    }

    async fn loop_in_quote(&self, amount: u64) -> anyhow::Result<LoopInQuote> {
        let path = format!("/v1/loop/in/quote/{}", amount);
        let resp: InQuoteResponse = self
            .with_retry("LoopInQuote", || self.loopd.get(&path))
            .await?;
        Ok(LoopInQuote {
            swap_fee: resp.swap_fee_sat,
            miner_fee: resp.htlc_publish_fee_sat,
        })
    }
}

#[async_trait::async_trait]
impl SwapStore for RestClient {
    async fn list_swaps(&self) -> anyhow::Result<Vec<ExistingSwap>> {
        let resp: ListSwapsResponse = self
            .with_retry("ListSwaps", || self.loopd.get("/v1/loop/swaps"))
            .await?;
        resp.swaps
            .iter()
            .map(|s| {
                s.try_into_existing()
                    .with_context(|| format!("Unreadable swap {}", s.id))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// REST payloads. 64-bit integers are JSON strings, zero values are omitted.
// ---------------------------------------------------------------------------

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_u64_vec<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
    #[derive(Deserialize)]
    struct Wrapped(#[serde(deserialize_with = "de_u64")] u64);

    let raw: Vec<Wrapped> = Vec::deserialize(d)?;
    Ok(raw.into_iter().map(|w| w.0).collect())
}

#[derive(Debug, Default, Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<LndChannel>,
}

#[derive(Debug, Default, Deserialize)]
struct LndChannel {
    #[serde(default)]
    remote_pubkey: String,
    #[serde(default, deserialize_with = "de_u64")]
    chan_id: u64,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default)]
    private: bool,
}

impl From<LndChannel> for ChannelInfo {
    fn from(c: LndChannel) -> Self {
        ChannelInfo {
            channel_id: ChannelId(c.chan_id),
            capacity: c.capacity,
            local_balance: c.local_balance,
            remote_balance: c.remote_balance,
            peer: c.remote_pubkey,
            private: c.private,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TermsResponse {
    #[serde(default, deserialize_with = "de_u64")]
    min_swap_amount: u64,
    #[serde(default, deserialize_with = "de_u64")]
    max_swap_amount: u64,
}

#[derive(Debug, Default, Deserialize)]
struct OutQuoteResponse {
    #[serde(default, deserialize_with = "de_u64")]
    swap_fee_sat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    prepay_amt_sat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    htlc_sweep_fee_sat: u64,
}

#[derive(Debug, Default, Deserialize)]
struct InQuoteResponse {
    #[serde(default, deserialize_with = "de_u64")]
    swap_fee_sat: u64,
    #[serde(default, deserialize_with = "de_u64")]
    htlc_publish_fee_sat: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ListSwapsResponse {
    #[serde(default)]
    swaps: Vec<SwapStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct SwapStatus {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    swap_type: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    failure_reason: String,
    /// Unix nanoseconds.
    #[serde(default, deserialize_with = "de_u64")]
    last_update_time: u64,
    #[serde(default, deserialize_with = "de_u64_vec")]
    outgoing_chan_set: Vec<u64>,
    /// Base64 encoded public key.
    #[serde(default)]
    last_hop: String,
}

impl SwapStatus {
    /// Fails on swap types the manager does not know how to restrict.
    fn try_into_existing(&self) -> anyhow::Result<ExistingSwap> {
        let swap_type = match self.swap_type.as_str() {
            "LOOP_OUT" => SwapType::LoopOut,
            "LOOP_IN" => SwapType::LoopIn,
            other => anyhow::bail!("unsupported swap type {:?}", other),
        };

        // An unreadable last hop leaves the swap unrestricted, which keeps
        // every channel out of new swaps while it is pending.
        let last_hop = if self.last_hop.is_empty() {
            None
        } else {
            match BASE64.decode(&self.last_hop) {
                Ok(bytes) => Some(hex::encode(bytes)),
                Err(e) => {
                    warn!("Swap {} has invalid last hop encoding: {}", self.id, e);
                    None
                }
            }
        };

        Ok(ExistingSwap {
            hash: self.id.clone(),
            state: swap_state(&self.state, &self.failure_reason),
            swap_type,
            channels: self.outgoing_chan_set.iter().copied().map(ChannelId).collect(),
            last_hop,
            last_update: timestamp(self.last_update_time),
        })
    }
}

fn timestamp(nanos: u64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos.min(i64::MAX as u64) as i64)
}

fn swap_state(state: &str, failure_reason: &str) -> SwapState {
    match state {
        "INITIATED" => SwapState::Initiated,
        "PREIMAGE_REVEALED" => SwapState::PreimageRevealed,
        "HTLC_PUBLISHED" => SwapState::HtlcPublished,
        "INVOICE_SETTLED" => SwapState::InvoiceSettled,
        "SUCCESS" => SwapState::Success,
        "FAILED" => match failure_reason {
            "FAILURE_REASON_OFFCHAIN" => SwapState::FailOffchainPayments,
            "FAILURE_REASON_TIMEOUT" => SwapState::FailTimeout,
            "FAILURE_REASON_SWEEP_TIMEOUT" => SwapState::FailSweepTimeout,
            "FAILURE_REASON_INSUFFICIENT_VALUE" => SwapState::FailInsufficientValue,
            "FAILURE_REASON_INCORRECT_AMOUNT" => SwapState::FailIncorrectHtlcAmt,
            _ => SwapState::FailTemporary,
        },
        other => {
            // Unknown states are treated as in flight so their channels are
            // left alone.
            warn!("Unknown swap state {:?}, treating as pending", other);
            SwapState::Initiated
        }
    }
}

// ---------------------------------------------------------------------------
// Mock collaborators for integration testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// Mock node/swap server client that returns preset responses and
    /// records API calls.
    pub struct MockLiquidityClient {
        pub channels: Vec<ChannelInfo>,
        pub out_restrictions: Restrictions,
        pub in_restrictions: Restrictions,
        pub out_quote: LoopOutQuote,
        pub in_quote: LoopInQuote,
        /// Fail channel listing with an upstream error.
        pub fail_list_channels: bool,
        /// Notified each time channel listing starts.
        pub list_channels_entered: Arc<Notify>,
        /// When set, channel listing waits for a notification before
        /// returning.
        pub list_channels_gate: Option<Arc<Notify>>,
        // Call recorders
        pub calls: Arc<Mutex<Vec<&'static str>>>,
        pub out_quote_calls: Arc<Mutex<Vec<(u64, u32)>>>,
        pub in_quote_calls: Arc<Mutex<Vec<u64>>>,
    }

    impl MockLiquidityClient {
        pub fn new() -> Self {
            Self {
                channels: Vec::new(),
                out_restrictions: Restrictions::new(1, 10_000),
                in_restrictions: Restrictions::new(1, 10_000),
                out_quote: LoopOutQuote::default(),
                in_quote: LoopInQuote::default(),
                fail_list_channels: false,
                list_channels_entered: Arc::new(Notify::new()),
                list_channels_gate: None,
                calls: Arc::new(Mutex::new(Vec::new())),
                out_quote_calls: Arc::new(Mutex::new(Vec::new())),
                in_quote_calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl LiquidityClient for MockLiquidityClient {
        async fn list_channels(&self) -> anyhow::Result<Vec<ChannelInfo>> {
            self.calls.lock().unwrap().push("list_channels");
            self.list_channels_entered.notify_one();
            if let Some(gate) = &self.list_channels_gate {
                gate.notified().await;
            }
            if self.fail_list_channels {
                anyhow::bail!("lnd unavailable");
            }
            Ok(self.channels.clone())
        }

        async fn loop_out_restrictions(&self) -> anyhow::Result<Restrictions> {
            self.calls.lock().unwrap().push("loop_out_restrictions");
            Ok(self.out_restrictions)
        }

        async fn loop_in_restrictions(&self) -> anyhow::Result<Restrictions> {
            self.calls.lock().unwrap().push("loop_in_restrictions");
            Ok(self.in_restrictions)
        }

        async fn loop_out_quote(
            &self,
            amount: u64,
            conf_target: u32,
        ) -> anyhow::Result<LoopOutQuote> {
            self.calls.lock().unwrap().push("loop_out_quote");
            self.out_quote_calls.lock().unwrap().push((amount, conf_target));
            Ok(self.out_quote)
        }

        async fn loop_in_quote(&self, amount: u64) -> anyhow::Result<LoopInQuote> {
            self.calls.lock().unwrap().push("loop_in_quote");
            self.in_quote_calls.lock().unwrap().push(amount);
            Ok(self.in_quote)
        }
    }

    /// Mock swap store with a fixed swap list.
    pub struct MockSwapStore {
        pub swaps: Vec<ExistingSwap>,
        pub calls: Arc<Mutex<usize>>,
    }

    impl MockSwapStore {
        pub fn new(swaps: Vec<ExistingSwap>) -> Self {
            Self {
                swaps,
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait::async_trait]
    impl SwapStore for MockSwapStore {
        async fn list_swaps(&self) -> anyhow::Result<Vec<ExistingSwap>> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.swaps.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_channels_with_string_integers() {
        let json = r#"{
            "channels": [
                {
                    "active": true,
                    "remote_pubkey": "02aa",
                    "chan_id": "769658337437581313",
                    "capacity": "1000000",
                    "local_balance": "400000",
                    "remote_balance": 596530,
                    "private": true
                },
                {
                    "remote_pubkey": "03bb",
                    "chan_id": "1",
                    "capacity": "500"
                }
            ]
        }"#;
        let resp: ListChannelsResponse = serde_json::from_str(json).unwrap();
        let channels: Vec<ChannelInfo> = resp.channels.into_iter().map(ChannelInfo::from).collect();

        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].channel_id, ChannelId(769658337437581313));
        assert_eq!(channels[0].capacity, 1_000_000);
        assert_eq!(channels[0].local_balance, 400_000);
        assert_eq!(channels[0].remote_balance, 596_530);
        assert_eq!(channels[0].peer, "02aa");
        assert!(channels[0].private);

        assert_eq!(channels[1].local_balance, 0);
        assert!(!channels[1].private);
    }

    #[test]
    fn test_parse_empty_listing() {
        let resp: ListChannelsResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.channels.is_empty());
    }

    #[test]
    fn test_parse_bad_integer() {
        let json = r#"{"min_swap_amount": "lots", "max_swap_amount": "10"}"#;
        assert!(serde_json::from_str::<TermsResponse>(json).is_err());
    }

    #[test]
    fn test_parse_swaps() {
        let json = r#"{
            "swaps": [
                {
                    "id": "aabb",
                    "type": "LOOP_OUT",
                    "state": "FAILED",
                    "failure_reason": "FAILURE_REASON_OFFCHAIN",
                    "last_update_time": "1609459200000000000",
                    "outgoing_chan_set": ["7", "9"]
                },
                {
                    "id": "ccdd",
                    "type": "LOOP_IN",
                    "state": "HTLC_PUBLISHED",
                    "last_hop": "Aqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq"
                },
                {
                    "id": "eeff",
                    "type": "SOMETHING_ELSE",
                    "state": "INITIATED"
                }
            ]
        }"#;
        let resp: ListSwapsResponse = serde_json::from_str(json).unwrap();

        let out = resp.swaps[0].try_into_existing().unwrap();
        assert_eq!(out.swap_type, SwapType::LoopOut);
        assert_eq!(out.state, SwapState::FailOffchainPayments);
        assert_eq!(out.channels, vec![ChannelId(7), ChannelId(9)]);
        assert_eq!(out.last_update, Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap());
        assert!(out.last_hop.is_none());

        let loop_in = resp.swaps[1].try_into_existing().unwrap();
        assert_eq!(loop_in.swap_type, SwapType::LoopIn);
        assert!(loop_in.state.is_pending());
        let last_hop = loop_in.last_hop.unwrap();
        assert!(last_hop.starts_with("02aa"));

        assert!(resp.swaps[2].try_into_existing().is_err());
    }

    #[test]
    fn test_invalid_last_hop_treated_as_unrestricted() {
        let json = r#"{
            "id": "ccdd",
            "type": "LOOP_IN",
            "state": "INITIATED",
            "last_hop": "not base64!"
        }"#;
        let status: SwapStatus = serde_json::from_str(json).unwrap();

        let swap = status.try_into_existing().unwrap();
        assert!(swap.state.is_pending());
        assert!(swap.last_hop.is_none());
        assert!(!swap.is_restricted());
    }

    #[test]
    fn test_swap_state_mapping() {
        assert_eq!(swap_state("SUCCESS", ""), SwapState::Success);
        assert_eq!(swap_state("INVOICE_SETTLED", ""), SwapState::InvoiceSettled);
        assert_eq!(
            swap_state("FAILED", "FAILURE_REASON_TIMEOUT"),
            SwapState::FailTimeout
        );
        assert_eq!(swap_state("FAILED", ""), SwapState::FailTemporary);
        assert!(swap_state("NEW_STATE", "").is_pending());
    }
}
