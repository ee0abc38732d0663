// Requests awaiting user approval

pub mod store;
pub mod types;

use serde::Serialize;
use thiserror::Error;

use crate::browser::TabId;
use crate::transport::{PortId, PortSender};

pub use store::{Change, PendingResponse, RequestId, RequestStore, ResolveHook, StoreChange};
pub use types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Signing,
    Metadata,
    Sites,
    Networks,
    EvmAssets,
}

impl RequestKind {
    pub const ALL: [RequestKind; 5] = [
        RequestKind::Signing,
        RequestKind::Metadata,
        RequestKind::Sites,
        RequestKind::Networks,
        RequestKind::EvmAssets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Signing => "signing",
            RequestKind::Metadata => "metadata",
            RequestKind::Sites => "sites",
            RequestKind::Networks => "networks",
            RequestKind::EvmAssets => "evmAssets",
        }
    }
}

/// Where a request came from, so it can be cancelled if that context vanishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOrigin {
    #[serde(skip)]
    pub port: Option<PortId>,
    pub tab_id: Option<TabId>,
    pub url: Option<String>,
}

impl From<&PortSender> for RequestOrigin {
    fn from(sender: &PortSender) -> Self {
        Self {
            port: Some(sender.id),
            tab_id: sender.tab_id,
            url: sender.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord<T> {
    pub id: RequestId,
    pub origin: RequestOrigin,
    pub request: T,
    pub created_at: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("{0}")]
    Rejected(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request store shut down before the request settled")]
    Dropped,
}

/// Every outstanding request across all stores, as streamed to the popup
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequests {
    pub signing: Vec<RequestRecord<SigningRequest>>,
    pub metadata: Vec<RequestRecord<MetadataRequest>>,
    pub sites: Vec<RequestRecord<AuthRequest>>,
    pub networks: Vec<RequestRecord<AddNetworkRequest>>,
    pub evm_assets: Vec<RequestRecord<WatchAssetRequest>>,
}

/// Per-kind pending counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub signing: usize,
    pub metadata: usize,
    pub sites: usize,
    pub networks: usize,
    pub evm_assets: usize,
}

impl RequestCounts {
    pub fn total(&self) -> usize {
        self.signing + self.metadata + self.sites + self.networks + self.evm_assets
    }
}
