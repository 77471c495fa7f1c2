//! Network and workflow constants

use std::time::Duration;

use crate::types::Address;

/// Sepolia chain id (`0xaa36a7`)
pub const SEPOLIA_NETWORK_ID: u64 = 11_155_111;

/// Default JSON-RPC endpoint of a locally running node
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";

/// ImgBB compatible upload endpoint
pub const DEFAULT_ASSET_HOST_URL: &str = "https://api.imgbb.com/1/upload";

/// Largest candidate image accepted by the asset host
pub const MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;

/// Number of times a dropped event subscription is re-established
pub const DEFAULT_SUBSCRIPTION_RETRIES: u32 = 3;

/// Base delay before re-establishing a dropped event subscription, doubled on each attempt
pub const DEFAULT_SUBSCRIPTION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Deployed election contract on Sepolia
pub const DEFAULT_CONTRACT_ADDRESS: Address = Address::new([
    0x41, 0x10, 0x9b, 0x71, 0x95, 0x7d, 0x30, 0x4c, 0xd6, 0x1b, 0x8c, 0x53, 0x51, 0x14, 0x62, 0x20,
    0x08, 0x35, 0xfa, 0xc0,
]);

/// How often the JSON-RPC ledger polls for receipts and new logs
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
