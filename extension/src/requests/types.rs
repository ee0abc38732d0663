// Payloads of the five approval kinds

use serde::{Deserialize, Serialize};

/// Sign arbitrary bytes with one of the wallet's accounts
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    pub address: String,
    /// Hex-encoded payload (`0x` prefix optional)
    pub data: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SigningResponse {
    pub signature: String,
}

/// Chain metadata a dapp wants the wallet to store
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRequest {
    pub chain: String,
    pub genesis_hash: String,
    pub spec_version: u32,
    #[serde(default)]
    pub ss58_format: u16,
    #[serde(default)]
    pub token_symbol: String,
    #[serde(default)]
    pub token_decimals: u8,
}

/// A site asking to connect
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    /// Display name the site announced
    pub origin: String,
    pub url: String,
    /// Ethereum provider connection rather than a substrate one
    #[serde(default)]
    pub ethereum: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub eth_chain_id: Option<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

/// EIP-3085 `wallet_addEthereumChain`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddNetworkRequest {
    pub chain_id: String,
    pub chain_name: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub block_explorer_urls: Vec<String>,
    #[serde(default)]
    pub native_currency: Option<NativeCurrency>,
}

/// EIP-747 `wallet_watchAsset`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WatchAssetRequest {
    #[serde(rename = "type")]
    pub token_type: String,
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default)]
    pub image: Option<String>,
    pub chain_id: u64,
}
