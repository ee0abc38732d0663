//! Background entry point: owns the stores, the request orchestrator and the
//! credential lifecycle, and serves every connected port.
//!
//! Each inbound request runs in its own task so an approval waiting on the
//! user never blocks the port. Subscription setup and `pri(unsubscribe)` are
//! handled inline, in arrival order, so an unsubscribe can never overtake the
//! subscription it targets.

use anyhow::{Context, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::analytics::{self, Analytics};
use crate::browser::{Browser, BrowserEvent};
use crate::config::ConfigFile;
use crate::credentials::Credentials;
use crate::error::{ExtensionError, ExtensionResult};
use crate::keyring::Keyring;
use crate::protocol::{
    AnalyticsCaptureRequest, ApproveSiteRequest, AuthorizeTabRequest, IdRequest, LoginRequest,
    MessageRequest, ModalOpenRequest, PasswordRequest, RouteRequest, TransportRequest,
    TransportResponse, PROVIDER_RPC_INTERNAL_ERROR,
};
use crate::requests::{
    AuthRequest, AuthResponse, RequestError, RequestOrigin, SigningRequest, SigningResponse,
};
use crate::state::State;
use crate::storage::{strip_url, AuthorizedSite, StorageBackend, Stores};
use crate::transport::{BackgroundPort, PortSender, Responder};

/// EIP-1193 "user rejected the request"
pub const USER_REJECTED_CODE: i64 = 4001;

/// Install the global tracing subscriber (`RUST_LOG`, default `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "frost_wallet_background=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Everything the background needs from its host
pub struct Collaborators {
    pub browser: Arc<dyn Browser>,
    pub keyring: Arc<dyn Keyring>,
    pub storage: Arc<dyn StorageBackend>,
    pub analytics: Arc<dyn Analytics>,
}

pub struct Background {
    state: Arc<State>,
    credentials: Credentials,
    stores: Arc<Stores>,
    keyring: Arc<dyn Keyring>,
    browser: Arc<dyn Browser>,
    analytics: Arc<dyn Analytics>,
}

/// Answer to one inbound message
enum Reply {
    Value(Value),
    Stream(BoxStream<'static, Value>),
    Unsubscribe(String),
}

type Subscriptions = Arc<Mutex<HashMap<String, AbortHandle>>>;

/// Per-port handle passed to every request task of that port
#[derive(Clone)]
struct PortContext {
    responder: Responder,
    subscriptions: Subscriptions,
}

impl PortContext {
    fn sender(&self) -> &PortSender {
        &self.responder.sender
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
        lock_subscriptions(&self.subscriptions)
    }

    /// Forward `updates` as subscription payloads under `id`. The entry is
    /// dropped from the port's table once the stream ends or the port closes.
    fn start_subscription(&self, id: String, mut updates: BoxStream<'static, Value>) {
        let responder = self.responder.clone();
        let subscriptions = self.subscriptions.clone();
        let sub_id = id.clone();

        // Held across spawn so the task cannot remove its entry before it exists
        let mut active = self.subscriptions();
        let task = tokio::spawn(async move {
            while let Some(payload) = updates.next().await {
                if !responder.post(TransportResponse::subscription(&sub_id, payload)) {
                    break;
                }
            }
            lock_subscriptions(&subscriptions).remove(&sub_id);
            tracing::debug!(port = responder.sender.id, "Subscription {} ended", sub_id);
        });
        active.insert(id, task.abort_handle());
    }
}

fn lock_subscriptions(subscriptions: &Subscriptions) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
    subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Forward every value of a watch channel, starting with the current one
fn watch_stream<T, F>(rx: watch::Receiver<T>, map: F) -> BoxStream<'static, Value>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> Value + Send + 'static,
{
    stream::unfold((rx, map, true), |(mut rx, map, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let value = map(&rx.borrow_and_update());
        Some((value, (rx, map, false)))
    })
    .boxed()
}

/// Forward every modal request sent after subscribing
fn modal_stream(rx: broadcast::Receiver<ModalOpenRequest>) -> BoxStream<'static, Value> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(request) => return Some((json!(request), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Modal subscriber lagged, {} requests skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

/// Injected providers expect EIP-1193 errors
fn provider_error(error: RequestError) -> ExtensionError {
    match error {
        RequestError::Rejected(_) | RequestError::Cancelled => ExtensionError::ProviderRpc {
            message: "User rejected the request.".to_string(),
            code: USER_REJECTED_CODE,
        },
        RequestError::Dropped => ExtensionError::ProviderRpc {
            message: error.to_string(),
            code: PROVIDER_RPC_INTERNAL_ERROR,
        },
    }
}

/// Messages that must take effect before the next message of the same port
fn handled_inline(message: &MessageRequest) -> bool {
    matches!(
        message,
        MessageRequest::OnboardStatusSubscribe
            | MessageRequest::AuthStatusSubscribe
            | MessageRequest::ModalOpenSubscribe
            | MessageRequest::Requests
            | MessageRequest::Unsubscribe(_)
    )
}

fn unknown_request(id: &str) -> ExtensionError {
    ExtensionError::validation(format!("Unable to find request with id {}", id))
}

impl Background {
    pub async fn new(config: ConfigFile, deps: Collaborators) -> Result<Arc<Self>> {
        config.validate()?;

        let stores = Stores::load(deps.storage, &config.auth)
            .await
            .context("Failed to load persisted state")?;
        let state = State::new(deps.browser.clone(), &config, stores.clone());
        let credentials = Credentials::new(
            stores.clone(),
            deps.keyring.clone(),
            state.windows.clone(),
            deps.analytics.clone(),
            config.auth.clone(),
            config.wallet.clone(),
        );

        tracing::info!(onboarded = ?stores.app.onboarded(), "Background initialised");

        Ok(Arc::new(Self {
            state,
            credentials,
            stores,
            keyring: deps.keyring,
            browser: deps.browser,
            analytics: deps.analytics,
        }))
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Start the request orchestrator and the browser event loop.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let orchestrator = tokio::spawn(self.state.clone().run());

        let mut events = self.browser.events();
        let this = self.clone();
        let browser_events = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.handle_browser_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Browser event loop lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Browser event stream closed");
        });

        vec![orchestrator, browser_events]
    }

    pub async fn handle_browser_event(&self, event: BrowserEvent) {
        match event {
            BrowserEvent::TabRemoved { tab_id } => {
                let cancelled = self.state.requests.cancel_tab(tab_id).await;
                if cancelled > 0 {
                    tracing::info!("Tab {} closed, cancelled {} requests", tab_id, cancelled);
                }
            }
            BrowserEvent::WindowRemoved { window_id } => {
                self.state.windows.forget_window(window_id);
            }
            BrowserEvent::TabUpdated { .. } => {}
        }
    }

    /// Serve a newly connected port until it disconnects.
    pub fn attach(self: &Arc<Self>, port: BackgroundPort) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.serve_port(port).await })
    }

    async fn serve_port(self: Arc<Self>, mut port: BackgroundPort) {
        let ctx = PortContext {
            responder: port.responder(),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        };
        let port_id = ctx.sender().id;
        tracing::debug!(port = port_id, url = ?ctx.sender().url, "Port connected");

        while let Some(request) = port.rx.recv().await {
            let id = request.id.clone();
            let message = match self.accept(ctx.sender(), &request) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(port = port_id, "Refused {}: {}", request.message, e);
                    ctx.responder.post(TransportResponse::error(id, &e));
                    continue;
                }
            };

            if handled_inline(&message) {
                self.respond(&ctx, id, message).await;
            } else {
                let this = self.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { this.respond(&ctx, id, message).await });
            }
        }

        // Port gone: stop its subscriptions and drop whatever it still waits on
        for (_, handle) in ctx.subscriptions().drain() {
            handle.abort();
        }
        let cancelled = self.state.requests.cancel_port(port_id).await;
        tracing::debug!(port = port_id, cancelled, "Port disconnected");
    }

    fn accept(&self, sender: &PortSender, request: &TransportRequest) -> ExtensionResult<MessageRequest> {
        if request.is_private() && !sender.is_extension {
            return Err(ExtensionError::transport(format!(
                "Refusing {} from a non-extension sender",
                request.message
            )));
        }
        Ok(request.decode()?)
    }

    async fn respond(&self, ctx: &PortContext, id: String, message: MessageRequest) {
        match self.dispatch(ctx.sender(), message).await {
            Ok(Reply::Value(value)) => {
                ctx.responder.post(TransportResponse::ok(id, value));
            }
            Ok(Reply::Stream(updates)) => ctx.start_subscription(id, updates),
            Ok(Reply::Unsubscribe(target)) => {
                let handle = ctx.subscriptions().remove(&target);
                let found = match handle {
                    Some(handle) => {
                        handle.abort();
                        true
                    }
                    None => {
                        tracing::debug!("Unsubscribe for unknown subscription {}", target);
                        false
                    }
                };
                ctx.responder.post(TransportResponse::ok(id, json!(found)));
            }
            Err(e) => {
                tracing::debug!(port = ctx.sender().id, id = %id, "Request failed: {}", e);
                ctx.responder.post(TransportResponse::error(id, &e));
            }
        }
    }

    async fn dispatch(&self, sender: &PortSender, message: MessageRequest) -> ExtensionResult<Reply> {
        let requests = &self.state.requests;
        let windows = &self.state.windows;

        let value = match message {
            MessageRequest::Onboard(request) => json!(self.credentials.onboard(request).await?),
            MessageRequest::OnboardStatus => json!(self.stores.app.onboarded()),
            MessageRequest::OnboardStatusSubscribe => {
                return Ok(Reply::Stream(watch_stream(self.stores.app.subscribe(), |data| {
                    json!(data.onboarded)
                })));
            }
            MessageRequest::Authenticate(LoginRequest { pass }) => {
                json!(self.credentials.authenticate(&pass).await)
            }
            MessageRequest::AuthStatus => json!(self.credentials.auth_status()),
            MessageRequest::AuthStatusSubscribe => {
                return Ok(Reply::Stream(watch_stream(
                    self.stores.password.subscribe_logged_in(),
                    |logged_in| json!(logged_in),
                )));
            }
            MessageRequest::Lock => json!(self.credentials.lock()),
            MessageRequest::ChangePassword(request) => {
                json!(self.credentials.change_password(request).await?)
            }
            MessageRequest::CheckPassword(PasswordRequest { password }) => {
                json!(self.credentials.check_password(&password)?)
            }
            MessageRequest::MigratePassword(PasswordRequest { password }) => {
                json!(self.credentials.migrate_password_forward(&password).await)
            }
            MessageRequest::DashboardOpen(RouteRequest { route }) => {
                if self.stores.app.get_is_onboarded() {
                    windows.open_dashboard(&route).await?;
                } else {
                    windows.open_onboarding(None, None, false).await?;
                }
                json!(true)
            }
            MessageRequest::OnboardOpen => {
                let onboarded = self.stores.app.get_is_onboarded();
                json!(windows.open_onboarding(None, None, onboarded).await?)
            }
            MessageRequest::PromptLogin(close_on_success) => {
                json!(windows.prompt_login(close_on_success).await?)
            }
            MessageRequest::SendFundsOpen(request) => json!(windows.open_send_funds(&request).await?),
            MessageRequest::ModalOpenRequest(request) => {
                windows.open_modal(request).await?;
                Value::Null
            }
            MessageRequest::ModalOpenSubscribe => {
                return Ok(Reply::Stream(modal_stream(windows.subscribe_modal_requests())));
            }
            MessageRequest::AnalyticsCapture(AnalyticsCaptureRequest {
                event_name,
                options,
            }) => {
                analytics::capture(&self.analytics, &event_name, options).await;
                json!(true)
            }
            MessageRequest::ResetWallet => json!(self.credentials.reset_wallet().await?),
            MessageRequest::Requests => {
                return Ok(Reply::Stream(requests.watch().into_stream()));
            }
            MessageRequest::Unsubscribe(IdRequest { id }) => return Ok(Reply::Unsubscribe(id)),
            MessageRequest::MnemonicConfirm(confirmed) => {
                json!(self.credentials.confirm_mnemonic(confirmed).await?)
            }

            MessageRequest::SigningApprove(IdRequest { id }) => json!(self.approve_signing(&id).await?),
            MessageRequest::SigningCancel(IdRequest { id }) => json!(requests.signing.cancel(&id).await),
            MessageRequest::MetadataApprove(IdRequest { id }) => {
                json!(requests.metadata.resolve(&id, true).await)
            }
            MessageRequest::MetadataReject(IdRequest { id }) => {
                json!(requests.metadata.reject(&id, "Rejected").await)
            }
            MessageRequest::SitesApprove(ApproveSiteRequest {
                id,
                addresses,
                eth_chain_id,
            }) => json!(
                requests
                    .sites
                    .resolve(
                        &id,
                        AuthResponse {
                            addresses,
                            eth_chain_id,
                        },
                    )
                    .await
            ),
            MessageRequest::SitesReject(IdRequest { id }) => {
                json!(requests.sites.reject(&id, "Rejected").await)
            }
            MessageRequest::NetworkApprove(IdRequest { id }) => {
                json!(requests.networks.resolve(&id, true).await)
            }
            MessageRequest::NetworkCancel(IdRequest { id }) => {
                json!(requests.networks.reject(&id, "User rejected the request.").await)
            }
            MessageRequest::AssetApprove(IdRequest { id }) => {
                json!(requests.evm_assets.resolve(&id, true).await)
            }
            MessageRequest::AssetCancel(IdRequest { id }) => {
                json!(requests.evm_assets.reject(&id, "User rejected the request.").await)
            }

            MessageRequest::AuthorizeTab(request) => self.authorize_tab(sender, request).await?,
            MessageRequest::SignBytes(request) => {
                let site = self.authorised_site(sender)?;
                let known = site.connect_all_substrate
                    || site.addresses.contains(&request.address)
                    || site
                        .eth_addresses
                        .as_ref()
                        .is_some_and(|eth| eth.contains(&request.address));
                if !known {
                    return Err(ExtensionError::auth(format!(
                        "Account {} is not authorised for {}",
                        request.address, site.origin
                    )));
                }
                let response = requests
                    .signing
                    .create(RequestOrigin::from(sender), request)
                    .await?;
                json!(response)
            }
            MessageRequest::MetadataProvide(request) => {
                json!(requests.metadata.create(RequestOrigin::from(sender), request).await?)
            }
            MessageRequest::EthNetworkAdd(request) => {
                requests
                    .networks
                    .create(RequestOrigin::from(sender), request)
                    .await
                    .map_err(provider_error)?;
                // EIP-3085 answers null on success
                Value::Null
            }
            MessageRequest::EthWatchAsset(request) => json!(requests
                .evm_assets
                .create(RequestOrigin::from(sender), request)
                .await
                .map_err(provider_error)?),
        };

        Ok(Reply::Value(value))
    }

    fn authorised_site(&self, sender: &PortSender) -> ExtensionResult<AuthorizedSite> {
        let url = sender
            .url
            .as_deref()
            .ok_or_else(|| ExtensionError::auth("Message sender has no url"))?;
        self.stores
            .sites
            .get_site_from_url(url)
            .ok_or_else(|| ExtensionError::auth(format!("The source {} has not been enabled yet", url)))
    }

    async fn authorize_tab(
        &self,
        sender: &PortSender,
        AuthorizeTabRequest { origin, ethereum }: AuthorizeTabRequest,
    ) -> ExtensionResult<Value> {
        let url = sender
            .url
            .clone()
            .ok_or_else(|| ExtensionError::auth("Message sender has no url"))?;

        if !self.stores.app.get_is_onboarded() {
            self.state
                .windows
                .open_onboarding(None, Some(&url), false)
                .await?;
            return Err(ExtensionError::policy("Wallet has not been set up yet"));
        }

        if let Some(site) = self.stores.sites.get_site_from_url(&url) {
            let connected = if ethereum {
                site.eth_addresses.is_some()
            } else {
                !site.addresses.is_empty() || site.connect_all_substrate
            };
            if connected {
                return Ok(json!(true));
            }
        }

        let key = strip_url(&url);
        let duplicate = self
            .state
            .requests
            .sites
            .requests()
            .iter()
            .any(|r| strip_url(&r.request.url) == key && r.request.ethereum == ethereum);
        if duplicate {
            return Err(ExtensionError::validation(format!(
                "The source {} has a pending authorization request",
                url
            )));
        }

        let pending = self.state.requests.sites.create(
            RequestOrigin::from(sender),
            AuthRequest {
                origin,
                url,
                ethereum,
            },
        );
        let response = if ethereum {
            pending.await.map_err(provider_error)?
        } else {
            pending.await?
        };
        Ok(json!(response))
    }

    async fn approve_signing(&self, id: &str) -> ExtensionResult<bool> {
        let record = self
            .state
            .requests
            .signing
            .get(id)
            .ok_or_else(|| unknown_request(id))?;
        let password = self
            .stores
            .password
            .get_password()
            .ok_or_else(|| ExtensionError::auth("Wallet is locked"))?;

        let SigningRequest { address, data } = record.request;
        let bytes = hex::decode(data.trim_start_matches("0x"))
            .map_err(|e| ExtensionError::validation(format!("Invalid hex payload: {}", e)))?;
        let signature = self
            .keyring
            .sign(&address, &bytes, &password)
            .await
            .context("Unable to sign")?;

        Ok(self
            .state
            .requests
            .signing
            .resolve(id, SigningResponse { signature })
            .await)
    }
}
