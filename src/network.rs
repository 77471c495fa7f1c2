//! Network verification and the JSON-RPC wallet provider

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use futures_util::{future::BoxFuture, FutureExt};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;

use crate::{
    rpc_ledger::revert_reason,
    types::{Address, SdkError, SdkResult},
    utils::parse_hex_quantity,
    NetworkProvider,
};

const LOG_TARGET: &str = "network";

/// Verifies the wallet is connected to the required ledger network
///
/// The result is never trusted across calls, callers re-run `check`/`ensure` before each mutation
pub struct NetworkGuard<N: NetworkProvider> {
    provider: Arc<N>,
    required: u64,
    last: Arc<Mutex<Option<bool>>>,
}

impl<N: NetworkProvider> Clone for NetworkGuard<N> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            required: self.required,
            last: Arc::clone(&self.last),
        }
    }
}

impl<N: NetworkProvider> NetworkGuard<N> {
    pub fn new(provider: Arc<N>, required: u64) -> Self {
        Self {
            provider,
            required,
            last: Default::default(),
        }
    }
    /// The network id mutations are allowed on
    pub fn required(&self) -> u64 {
        self.required
    }
    /// Result of the most recent check, `None` if never checked
    pub fn last_result(&self) -> Option<bool> {
        *self.last.lock()
    }
    /// Returns true if the provider reports the required network
    ///
    /// Provider failures count as a mismatch
    pub async fn check(&self) -> bool {
        self.ensure().await.is_ok()
    }
    /// Returns the connected network id if it is the required one
    pub async fn ensure(&self) -> SdkResult<u64> {
        let actual = match self.provider.network_id().await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target: LOG_TARGET, "network id unavailable: {err}");
                None
            }
        };
        let on_required = actual == Some(self.required);
        *self.last.lock() = Some(on_required);

        if on_required {
            Ok(self.required)
        } else {
            debug!(target: LOG_TARGET, "network mismatch, expected {} got {actual:?}", self.required);
            Err(SdkError::NetworkMismatch {
                expected: self.required,
                actual,
            })
        }
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// EIP-1193 code for a request the user declined in the wallet
const USER_REJECTED: i64 = 4001;

impl From<RpcErrorBody> for SdkError {
    fn from(body: RpcErrorBody) -> Self {
        if body.code == USER_REJECTED {
            return SdkError::SubmissionRejected(body.message);
        }
        let reason = body
            .data
            .as_ref()
            .and_then(|data| data.as_str())
            .and_then(revert_reason);
        if let Some(reason) = reason {
            return SdkError::SubmissionReverted(reason);
        }
        match body.message.strip_prefix("execution reverted") {
            Some(rest) => {
                let reason = rest.trim_start_matches(':').trim();
                SdkError::SubmissionReverted(if reason.is_empty() {
                    "execution reverted".to_string()
                } else {
                    reason.to_string()
                })
            }
            None => SdkError::Rpc {
                code: body.code,
                message: body.message,
            },
        }
    }
}

/// Minimal JSON-RPC 2.0 client over HTTP
///
/// Node errors map onto `SdkError`, a declined signature is `SubmissionRejected` and a revert is
/// `SubmissionReverted` with the contract's reason
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    request_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            request_id: AtomicU64::new(1),
        }
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    /// Call `method`, a `null` result is an error
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> SdkResult<T> {
        self.call_nullable(method, params)
            .await?
            .ok_or_else(|| SdkError::Transport(format!("{method}: empty result")))
    }
    /// Call `method`, returning `None` for a `null` result
    pub async fn call_nullable<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> SdkResult<Option<T>> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match response.error {
            Some(body) => {
                debug!(target: LOG_TARGET, "{method} failed: {body:?}");
                Err(body.into())
            }
            None => Ok(response.result),
        }
    }
}

/// Network provider backed by a JSON-RPC endpoint (`eth_chainId`, `eth_accounts`)
pub struct RpcNetworkProvider {
    rpc: Arc<JsonRpcClient>,
}

impl RpcNetworkProvider {
    pub fn new(url: &str) -> Self {
        Self::with_client(Arc::new(JsonRpcClient::new(url)))
    }
    /// Share `rpc` with other providers
    pub fn with_client(rpc: Arc<JsonRpcClient>) -> Self {
        Self { rpc }
    }

    async fn network_id_impl(&self) -> SdkResult<u64> {
        let chain_id: String = self.rpc.call("eth_chainId", json!([])).await?;
        parse_hex_quantity(&chain_id)
            .ok_or_else(|| SdkError::Transport(format!("invalid chain id: {chain_id}")))
    }

    async fn accounts_impl(&self) -> SdkResult<Vec<Address>> {
        let accounts: Vec<String> = self.rpc.call("eth_accounts", json!([])).await?;
        accounts.iter().map(|a| a.parse()).collect()
    }
}

impl NetworkProvider for RpcNetworkProvider {
    fn network_id(&self) -> BoxFuture<SdkResult<u64>> {
        self.network_id_impl().boxed()
    }
    fn accounts(&self) -> BoxFuture<SdkResult<Vec<Address>>> {
        self.accounts_impl().boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::ready;

    use super::*;
    use crate::constants::SEPOLIA_NETWORK_ID;

    struct StaticNetwork(Option<u64>);

    impl NetworkProvider for StaticNetwork {
        fn network_id(&self) -> BoxFuture<SdkResult<u64>> {
            ready(
                self.0
                    .ok_or_else(|| SdkError::Transport("provider unavailable".into())),
            )
            .boxed()
        }
        fn accounts(&self) -> BoxFuture<SdkResult<Vec<Address>>> {
            ready(Ok(vec![])).boxed()
        }
    }

    #[tokio::test]
    async fn required_network_passes() {
        let guard = NetworkGuard::new(
            Arc::new(StaticNetwork(Some(SEPOLIA_NETWORK_ID))),
            SEPOLIA_NETWORK_ID,
        );
        assert_eq!(guard.last_result(), None);
        assert!(guard.check().await);
        assert_eq!(guard.last_result(), Some(true));
    }

    #[tokio::test]
    async fn other_network_is_a_mismatch() {
        let guard = NetworkGuard::new(Arc::new(StaticNetwork(Some(1))), SEPOLIA_NETWORK_ID);
        assert!(!guard.check().await);
        assert!(matches!(
            guard.ensure().await,
            Err(SdkError::NetworkMismatch {
                expected: SEPOLIA_NETWORK_ID,
                actual: Some(1)
            })
        ));
    }

    #[tokio::test]
    async fn provider_error_fails_closed() {
        let guard = NetworkGuard::new(Arc::new(StaticNetwork(None)), SEPOLIA_NETWORK_ID);
        assert!(!guard.check().await);
        assert_eq!(guard.last_result(), Some(false));
        assert!(matches!(
            guard.ensure().await,
            Err(SdkError::NetworkMismatch { actual: None, .. })
        ));
    }

    fn rpc_error(value: serde_json::Value) -> SdkError {
        serde_json::from_value::<RpcErrorBody>(value).unwrap().into()
    }

    #[test]
    fn node_errors_map_to_submission_outcomes() {
        assert!(matches!(
            rpc_error(json!({"code": 4001, "message": "User rejected the request."})),
            SdkError::SubmissionRejected(message) if message == "User rejected the request."
        ));
        // geth style, reason abi-encoded in data
        assert!(matches!(
            rpc_error(json!({
                "code": 3,
                "message": "execution reverted: Already voted",
                "data": "0x08c379a0\
                    0000000000000000000000000000000000000000000000000000000000000020\
                    000000000000000000000000000000000000000000000000000000000000000d\
                    416c726561647920766f74656400000000000000000000000000000000000000"
            })),
            SdkError::SubmissionReverted(reason) if reason == "Already voted"
        ));
        // reason only in the message
        assert!(matches!(
            rpc_error(json!({"code": -32000, "message": "execution reverted: Voting is not active"})),
            SdkError::SubmissionReverted(reason) if reason == "Voting is not active"
        ));
        assert!(matches!(
            rpc_error(json!({"code": -32000, "message": "execution reverted"})),
            SdkError::SubmissionReverted(reason) if reason == "execution reverted"
        ));
        assert!(matches!(
            rpc_error(json!({"code": -32601, "message": "method not found"})),
            SdkError::Rpc { code: -32601, .. }
        ));
    }

    #[cfg(feature = "rpc_tests")]
    #[tokio::test]
    async fn live_chain_id() {
        let url = std::env::var("ELECTION_RPC_URL")
            .unwrap_or_else(|_| crate::constants::DEFAULT_RPC_URL.to_string());
        let provider = RpcNetworkProvider::new(&url);
        let id = provider.network_id().await.expect("chain id");
        dbg!(id);
    }
}
