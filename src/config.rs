//! Client configuration

use std::time::Duration;

use crate::{
    constants::{
        DEFAULT_ASSET_HOST_URL, DEFAULT_CONTRACT_ADDRESS, DEFAULT_POLL_INTERVAL, DEFAULT_RPC_URL,
        DEFAULT_SUBSCRIPTION_RETRIES, DEFAULT_SUBSCRIPTION_RETRY_DELAY, SEPOLIA_NETWORK_ID,
    },
    types::{Address, SdkError, SdkResult},
    utils::parse_hex_quantity,
};

/// Image host endpoint and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct AssetHostConfig {
    pub endpoint: String,
    pub api_key: String,
}

impl std::fmt::Debug for AssetHostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetHostConfig")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// JSON-RPC endpoint of the wallet/node
    pub rpc_url: String,
    /// election contract reached through `rpc_url`
    pub contract_address: Address,
    /// mutations are only sent on this network
    pub required_network_id: u64,
    /// candidate images are dropped if unset
    pub asset_host: Option<AssetHostConfig>,
    /// times a dropped event subscription is re-established
    pub subscription_retries: u32,
    /// delay before the first re-subscription, doubled after each unproductive attempt
    pub subscription_retry_delay: Duration,
    /// receipt and log polling period of the JSON-RPC ledger
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            contract_address: DEFAULT_CONTRACT_ADDRESS,
            required_network_id: SEPOLIA_NETWORK_ID,
            asset_host: None,
            subscription_retries: DEFAULT_SUBSCRIPTION_RETRIES,
            subscription_retry_delay: DEFAULT_SUBSCRIPTION_RETRY_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
    /// Read config from the environment
    ///
    /// `ELECTION_RPC_URL`, `ELECTION_CONTRACT_ADDRESS`, `ELECTION_NETWORK_ID` (decimal or `0x`
    /// hex), `ELECTION_ASSET_HOST_URL`, `IMGBB_API_KEY`, `ELECTION_SUBSCRIPTION_RETRIES`,
    /// `ELECTION_SUBSCRIPTION_RETRY_MS` and `ELECTION_POLL_INTERVAL_MS`. Unset variables take
    /// defaults.
    pub fn from_env() -> SdkResult<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> SdkResult<Self> {
        let mut builder = Self::builder();
        if let Some(url) = var("ELECTION_RPC_URL") {
            builder = builder.rpc_url(url);
        }
        if let Some(address) = var("ELECTION_CONTRACT_ADDRESS") {
            builder = builder.contract_address(address.parse().map_err(|_| {
                SdkError::InvalidConfig(format!("ELECTION_CONTRACT_ADDRESS: {address}"))
            })?);
        }
        if let Some(id) = var("ELECTION_NETWORK_ID") {
            let id = id.trim();
            let parsed = if id.starts_with("0x") {
                parse_hex_quantity(id)
            } else {
                id.parse().ok()
            };
            builder = builder.required_network_id(parsed.ok_or_else(|| {
                SdkError::InvalidConfig(format!("ELECTION_NETWORK_ID: {id}"))
            })?);
        }
        if let Some(url) = var("ELECTION_ASSET_HOST_URL") {
            builder = builder.asset_host_url(url);
        }
        if let Some(key) = var("IMGBB_API_KEY") {
            builder = builder.asset_host_api_key(key);
        }
        if let Some(retries) = var("ELECTION_SUBSCRIPTION_RETRIES") {
            builder = builder.subscription_retries(retries.trim().parse().map_err(|_| {
                SdkError::InvalidConfig(format!("ELECTION_SUBSCRIPTION_RETRIES: {retries}"))
            })?);
        }
        if let Some(delay) = var("ELECTION_SUBSCRIPTION_RETRY_MS") {
            builder = builder
                .subscription_retry_delay(millis("ELECTION_SUBSCRIPTION_RETRY_MS", &delay)?);
        }
        if let Some(interval) = var("ELECTION_POLL_INTERVAL_MS") {
            builder = builder.poll_interval(millis("ELECTION_POLL_INTERVAL_MS", &interval)?);
        }

        builder.build()
    }
}

fn millis(name: &str, value: &str) -> SdkResult<Duration> {
    value
        .trim()
        .parse()
        .map(Duration::from_millis)
        .map_err(|_| SdkError::InvalidConfig(format!("{name}: {value}")))
}

pub struct ClientConfigBuilder {
    pub rpc_url: String,
    pub contract_address: Address,
    pub required_network_id: u64,
    pub asset_host_url: Option<String>,
    pub asset_host_api_key: Option<String>,
    pub subscription_retries: u32,
    pub subscription_retry_delay: Duration,
    pub poll_interval: Duration,
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        let config = ClientConfig::default();
        Self {
            rpc_url: config.rpc_url,
            contract_address: config.contract_address,
            required_network_id: config.required_network_id,
            asset_host_url: None,
            asset_host_api_key: None,
            subscription_retries: config.subscription_retries,
            subscription_retry_delay: config.subscription_retry_delay,
            poll_interval: config.poll_interval,
        }
    }
}

impl ClientConfigBuilder {
    pub fn rpc_url(mut self, url: String) -> Self {
        self.rpc_url = url;
        self
    }

    pub fn contract_address(mut self, address: Address) -> Self {
        self.contract_address = address;
        self
    }

    pub fn required_network_id(mut self, network_id: u64) -> Self {
        self.required_network_id = network_id;
        self
    }

    /// Upload endpoint, defaults to ImgBB once an api key is set
    pub fn asset_host_url(mut self, url: String) -> Self {
        self.asset_host_url = Some(url);
        self
    }

    pub fn asset_host_api_key(mut self, api_key: String) -> Self {
        self.asset_host_api_key = Some(api_key);
        self
    }

    pub fn subscription_retries(mut self, retries: u32) -> Self {
        self.subscription_retries = retries;
        self
    }

    pub fn subscription_retry_delay(mut self, delay: Duration) -> Self {
        self.subscription_retry_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> SdkResult<ClientConfig> {
        if self.rpc_url.trim().is_empty() {
            return Err(SdkError::InvalidConfig("rpc url is empty".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(SdkError::InvalidConfig("poll interval is zero".into()));
        }
        let asset_host = match (self.asset_host_url, self.asset_host_api_key) {
            (endpoint, Some(api_key)) => Some(AssetHostConfig {
                endpoint: endpoint.unwrap_or_else(|| DEFAULT_ASSET_HOST_URL.to_string()),
                api_key,
            }),
            (Some(endpoint), None) => {
                return Err(SdkError::InvalidConfig(format!(
                    "asset host {endpoint} has no api key"
                )));
            }
            (None, None) => None,
        };

        Ok(ClientConfig {
            rpc_url: self.rpc_url,
            contract_address: self.contract_address,
            required_network_id: self.required_network_id,
            asset_host,
            subscription_retries: self.subscription_retries,
            subscription_retry_delay: self.subscription_retry_delay,
            poll_interval: self.poll_interval,
        })
    }
}
