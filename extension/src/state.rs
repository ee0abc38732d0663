//! Pending-request orchestration
//!
//! `State` owns the five request stores and consumes their change channel:
//! every change refreshes the badge, an insert opens the popup if none is
//! showing, and a removal that leaves nothing pending closes it.

use futures::stream::{self, BoxStream, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::badge::badge_text;
use crate::browser::{Browser, TabId};
use crate::config::ConfigFile;
use crate::requests::{
    AddNetworkRequest, AuthRequest, AuthResponse, Change, MetadataRequest, PendingRequests,
    RequestCounts, RequestKind, RequestRecord, RequestStore, ResolveHook, SigningRequest,
    SigningResponse, StoreChange, WatchAssetRequest,
};
use crate::storage::{AuthorizedSite, Stores};
use crate::transport::PortId;
use crate::window::WindowManager;

pub struct RequestStores {
    pub signing: RequestStore<SigningRequest, SigningResponse>,
    pub metadata: RequestStore<MetadataRequest, bool>,
    pub sites: RequestStore<AuthRequest, AuthResponse>,
    pub networks: RequestStore<AddNetworkRequest, bool>,
    pub evm_assets: RequestStore<WatchAssetRequest, bool>,
}

impl RequestStores {
    pub fn counts(&self) -> RequestCounts {
        RequestCounts {
            signing: self.signing.request_count(),
            metadata: self.metadata.request_count(),
            sites: self.sites.request_count(),
            networks: self.networks.request_count(),
            evm_assets: self.evm_assets.request_count(),
        }
    }

    pub async fn cancel_port(&self, port: PortId) -> usize {
        self.signing.cancel_port(port).await
            + self.metadata.cancel_port(port).await
            + self.sites.cancel_port(port).await
            + self.networks.cancel_port(port).await
            + self.evm_assets.cancel_port(port).await
    }

    pub async fn cancel_tab(&self, tab_id: TabId) -> usize {
        self.signing.cancel_tab(tab_id).await
            + self.metadata.cancel_tab(tab_id).await
            + self.sites.cancel_tab(tab_id).await
            + self.networks.cancel_tab(tab_id).await
            + self.evm_assets.cancel_tab(tab_id).await
    }

    pub fn watch(&self) -> PendingRequestsWatch {
        PendingRequestsWatch {
            signing: self.signing.subscribe(),
            metadata: self.metadata.subscribe(),
            sites: self.sites.subscribe(),
            networks: self.networks.subscribe(),
            evm_assets: self.evm_assets.subscribe(),
        }
    }
}

/// Combined view over every store's snapshot channel
pub struct PendingRequestsWatch {
    signing: watch::Receiver<Vec<RequestRecord<SigningRequest>>>,
    metadata: watch::Receiver<Vec<RequestRecord<MetadataRequest>>>,
    sites: watch::Receiver<Vec<RequestRecord<AuthRequest>>>,
    networks: watch::Receiver<Vec<RequestRecord<AddNetworkRequest>>>,
    evm_assets: watch::Receiver<Vec<RequestRecord<WatchAssetRequest>>>,
}

impl PendingRequestsWatch {
    pub fn current(&mut self) -> PendingRequests {
        PendingRequests {
            signing: self.signing.borrow_and_update().clone(),
            metadata: self.metadata.borrow_and_update().clone(),
            sites: self.sites.borrow_and_update().clone(),
            networks: self.networks.borrow_and_update().clone(),
            evm_assets: self.evm_assets.borrow_and_update().clone(),
        }
    }

    /// Wait for any store to change. `None` once the stores are gone.
    pub async fn changed(&mut self) -> Option<PendingRequests> {
        let changed = tokio::select! {
            r = self.signing.changed() => r,
            r = self.metadata.changed() => r,
            r = self.sites.changed() => r,
            r = self.networks.changed() => r,
            r = self.evm_assets.changed() => r,
        };
        changed.ok()?;
        Some(self.current())
    }

    /// Current snapshot followed by every later one, as JSON
    pub fn into_stream(mut self) -> BoxStream<'static, Value> {
        let first = serde_json::to_value(self.current()).unwrap_or(Value::Null);
        stream::once(async move { first })
            .chain(stream::unfold(self, |mut watch| async move {
                let pending = watch.changed().await?;
                let value = serde_json::to_value(pending).unwrap_or(Value::Null);
                Some((value, watch))
            }))
            .boxed()
    }
}

pub struct State {
    pub requests: RequestStores,
    pub windows: Arc<WindowManager>,
    browser: Arc<dyn Browser>,
    changes: tokio::sync::Mutex<mpsc::UnboundedReceiver<StoreChange>>,
}

impl State {
    pub fn new(browser: Arc<dyn Browser>, config: &ConfigFile, stores: Arc<Stores>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let requests = RequestStores {
            signing: RequestStore::new(RequestKind::Signing, tx.clone()),
            metadata: RequestStore::new(RequestKind::Metadata, tx.clone()),
            sites: RequestStore::new(RequestKind::Sites, tx.clone())
                .with_resolve_hook(authorise_site_hook(stores)),
            networks: RequestStore::new(RequestKind::Networks, tx.clone()),
            evm_assets: RequestStore::new(RequestKind::EvmAssets, tx),
        };

        let windows = Arc::new(WindowManager::new(
            browser.clone(),
            config.popup.clone(),
            config.tabs.clone(),
        ));

        Arc::new(Self {
            requests,
            windows,
            browser,
            changes: tokio::sync::Mutex::new(rx),
        })
    }

    /// Consume store changes until every store is dropped
    pub async fn run(self: Arc<Self>) {
        let mut changes = self.changes.lock().await;
        while let Some(change) = changes.recv().await {
            self.apply_change(change).await;
        }
        tracing::debug!("Request stores closed, orchestrator stopping");
    }

    /// Apply whatever changes are queued right now
    pub async fn flush(&self) {
        let mut changes = self.changes.lock().await;
        while let Ok(change) = changes.try_recv() {
            self.apply_change(change).await;
        }
    }

    async fn apply_change(&self, change: StoreChange) {
        let counts = self.requests.counts();

        let text = badge_text(&counts);
        if let Err(e) = self.browser.set_badge_text(&text).await {
            tracing::warn!("Failed to update badge: {:#}", e);
        }

        match change.change {
            Change::Added if counts.total() > 0 => {
                let argument = match change.kind {
                    RequestKind::Signing => Some(format!("?signing={}", change.id)),
                    RequestKind::EvmAssets => Some(format!("?customAsset={}", change.id)),
                    _ => None,
                };
                if let Err(e) = self.windows.popup_open(argument.as_deref()).await {
                    tracing::error!("Failed to open popup for {}: {:#}", change.id, e);
                }
            }
            Change::Added => {}
            Change::Removed => {
                if counts.total() == 0 {
                    self.windows.popup_close().await;
                }
            }
        }
    }
}

/// Persist the user's choice of accounts once a site request is approved
fn authorise_site_hook(stores: Arc<Stores>) -> ResolveHook<AuthRequest, AuthResponse> {
    Arc::new(move |record: RequestRecord<AuthRequest>, response: Option<AuthResponse>| {
        let stores = stores.clone();
        async move {
            let Some(response) = response else {
                return Ok(());
            };
            let AuthRequest {
                origin,
                url,
                ethereum,
            } = record.request;

            let mut site: AuthorizedSite = stores.sites.get_site_from_url(&url).unwrap_or_default();
            site.id = record.id;
            site.origin = origin;
            site.url = url;

            if ethereum {
                site.eth_addresses = Some(response.addresses);
                site.eth_chain_id = response.eth_chain_id;
            } else {
                site.addresses = response.addresses;
            }

            stores.sites.set(site).await
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requests::RequestOrigin;
    use crate::storage::MemoryStorage;
    use crate::testing::FakeBrowser;
    use crate::window::PopupState;

    async fn setup() -> (Arc<State>, Arc<FakeBrowser>, Arc<Stores>) {
        let config = ConfigFile::for_tests();
        let stores = Stores::load(Arc::new(MemoryStorage::new()), &config.auth)
            .await
            .unwrap();
        let browser = Arc::new(FakeBrowser::new());
        let state = State::new(browser.clone(), &config, stores.clone());
        (state, browser, stores)
    }

    fn signing() -> SigningRequest {
        SigningRequest {
            address: "0xabc".to_string(),
            data: "0x01".to_string(),
        }
    }

    fn metadata() -> MetadataRequest {
        MetadataRequest {
            chain: "Polkadot".to_string(),
            genesis_hash: "0x91b1".to_string(),
            spec_version: 9430,
            ss58_format: 0,
            token_symbol: "DOT".to_string(),
            token_decimals: 10,
        }
    }

    #[tokio::test]
    async fn test_popup_follows_aggregate_count() {
        let (state, browser, _) = setup().await;
        let requests = &state.requests;

        let sign = requests.signing.create(RequestOrigin::default(), signing());
        state.flush().await;
        assert_eq!(state.windows.popup_state(), PopupState::Open);
        assert_eq!(browser.open_popups(), 1);
        assert_eq!(browser.badge(), "1");
        assert!(browser.created_windows()[0]
            .url
            .ends_with(&format!("popup.html?signing={}", sign.id())));

        let meta = requests.metadata.create(RequestOrigin::default(), metadata());
        state.flush().await;
        assert_eq!(browser.open_popups(), 1);
        assert_eq!(browser.created_windows().len(), 1);
        assert_eq!(browser.badge(), "Meta");

        let sign_id = sign.id().to_string();
        assert!(requests.signing.resolve(&sign_id, SigningResponse { signature: "0x".into() }).await);
        state.flush().await;
        assert_eq!(state.windows.popup_state(), PopupState::Open);
        assert_eq!(browser.open_popups(), 1);

        let meta_id = meta.id().to_string();
        assert!(requests.metadata.resolve(&meta_id, true).await);
        state.flush().await;
        assert_eq!(state.windows.popup_state(), PopupState::Closed);
        assert_eq!(browser.open_popups(), 0);
        assert_eq!(browser.badge(), "");

        assert_eq!(sign.await.unwrap().signature, "0x");
        assert!(meta.await.unwrap());
    }

    #[tokio::test]
    async fn test_asset_popup_argument() {
        let (state, browser, _) = setup().await;
        let asset = state.requests.evm_assets.create(
            RequestOrigin::default(),
            WatchAssetRequest {
                token_type: "ERC20".to_string(),
                address: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
                symbol: "USDT".to_string(),
                decimals: 6,
                image: None,
                chain_id: 1,
            },
        );
        state.flush().await;

        assert!(browser.created_windows()[0]
            .url
            .ends_with(&format!("?customAsset={}", asset.id())));
        assert_eq!(browser.badge(), "Assets");
    }

    #[tokio::test]
    async fn test_closed_tab_cancels_and_closes_popup() {
        let (state, browser, _) = setup().await;
        let origin = RequestOrigin {
            port: Some(7),
            tab_id: Some(42),
            url: Some("https://dapp.example".to_string()),
        };
        let pending = state.requests.signing.create(origin, signing());
        state.flush().await;
        assert_eq!(browser.open_popups(), 1);

        assert_eq!(state.requests.cancel_tab(42).await, 1);
        state.flush().await;
        assert_eq!(browser.open_popups(), 0);
        assert_eq!(pending.await, Err(crate::requests::RequestError::Cancelled));
    }

    #[tokio::test]
    async fn test_site_approval_persists_authorisation() {
        let (state, _, stores) = setup().await;
        let origin = RequestOrigin {
            port: Some(1),
            tab_id: Some(3),
            url: Some("https://app.uniswap.org/#/swap".to_string()),
        };

        let substrate = state.requests.sites.create(
            origin.clone(),
            AuthRequest {
                origin: "Uniswap".to_string(),
                url: "https://app.uniswap.org/#/swap".to_string(),
                ethereum: false,
            },
        );
        let id = substrate.id().to_string();
        state
            .requests
            .sites
            .resolve(
                &id,
                AuthResponse {
                    addresses: vec!["bc1qsubstrate".to_string()],
                    eth_chain_id: None,
                },
            )
            .await;

        let eth = state.requests.sites.create(
            origin,
            AuthRequest {
                origin: "Uniswap".to_string(),
                url: "https://app.uniswap.org/#/pool".to_string(),
                ethereum: true,
            },
        );
        let eth_id = eth.id().to_string();
        state
            .requests
            .sites
            .resolve(
                &eth_id,
                AuthResponse {
                    addresses: vec!["0xeth".to_string()],
                    eth_chain_id: Some(1),
                },
            )
            .await;

        let site = stores.sites.get_site_from_url("https://app.uniswap.org").unwrap();
        assert_eq!(site.addresses, vec!["bc1qsubstrate".to_string()]);
        assert_eq!(site.eth_addresses, Some(vec!["0xeth".to_string()]));
        assert_eq!(site.eth_chain_id, Some(1));
        assert_eq!(site.id, eth_id);
    }

    #[tokio::test]
    async fn test_rejected_site_not_persisted() {
        let (state, _, stores) = setup().await;
        let pending = state.requests.sites.create(
            RequestOrigin::default(),
            AuthRequest {
                origin: "Evil".to_string(),
                url: "https://evil.example".to_string(),
                ethereum: true,
            },
        );
        let id = pending.id().to_string();
        state.requests.sites.reject(&id, "Rejected").await;

        assert!(stores.sites.get_site_from_url("https://evil.example").is_none());
    }

    #[tokio::test]
    async fn test_pending_stream_emits_snapshots() {
        let (state, _, _) = setup().await;
        let mut stream = state.requests.watch().into_stream();

        let first = stream.next().await.unwrap();
        assert_eq!(first["signing"], serde_json::json!([]));

        let pending = state.requests.signing.create(RequestOrigin::default(), signing());
        let next = stream.next().await.unwrap();
        assert_eq!(next["signing"][0]["id"], serde_json::json!(pending.id()));
        assert_eq!(next["signing"][0]["request"]["address"], serde_json::json!("0xabc"));
    }
}
