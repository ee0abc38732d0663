//! Wire envelopes and the closed set of message kinds
//!
//! Requests travel as `{id, message, origin, request}`; responses as
//! `{id, response?, error?, subscription?, code?, isProviderRpcError?}`.
//! `pri(...)` kinds are only accepted from extension pages, `pub(...)` kinds
//! may come from injected page scripts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExtensionError;
use crate::requests::{AddNetworkRequest, MetadataRequest, SigningRequest, WatchAssetRequest};

/// EIP-1474 internal error, used when a provider error carries no code
pub const PROVIDER_RPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    #[serde(rename = "frost-page")]
    Page,
    #[serde(rename = "frost-extension")]
    Extension,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TransportRequest {
    pub id: String,
    pub message: String,
    pub origin: Origin,
    #[serde(default)]
    pub request: Value,
}

impl TransportRequest {
    pub fn new(id: impl Into<String>, origin: Origin, request: &MessageRequest) -> Result<Self> {
        let mut encoded = serde_json::to_value(request).context("Failed to encode request")?;
        let message = encoded
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Encoded request has no message tag")?;
        let request = encoded
            .get_mut("request")
            .map(Value::take)
            .unwrap_or(Value::Null);

        Ok(Self {
            id: id.into(),
            message,
            origin,
            request,
        })
    }

    pub fn is_private(&self) -> bool {
        is_private_message(&self.message)
    }

    /// Parse the `message`/`request` pair into a typed request
    pub fn decode(&self) -> Result<MessageRequest> {
        let tagged = serde_json::json!({
            "message": self.message,
            "request": self.request,
        });
        serde_json::from_value(tagged)
            .with_context(|| format!("Unable to handle message of type {}", self.message))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_provider_rpc_error: Option<bool>,
}

impl TransportResponse {
    pub fn ok(id: impl Into<String>, response: Value) -> Self {
        Self {
            id: id.into(),
            response: Some(response),
            ..Default::default()
        }
    }

    pub fn subscription(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            subscription: Some(payload),
            ..Default::default()
        }
    }

    pub fn error(id: impl Into<String>, error: &ExtensionError) -> Self {
        let mut response = Self {
            id: id.into(),
            error: Some(error.to_string()),
            ..Default::default()
        };
        if let ExtensionError::ProviderRpc { code, .. } = error {
            response.code = Some(*code);
            response.is_provider_rpc_error = Some(true);
        }
        response
    }
}

pub fn is_private_message(message: &str) -> bool {
    message.starts_with("pri(")
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OnboardRequest {
    pub pass: String,
    pub pass_confirm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LoginRequest {
    pub pass: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_pw: String,
    pub new_pw: String,
    pub new_pw_confirm: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouteRequest {
    pub route: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsCaptureRequest {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendFundsOpenRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Asks the dashboard to show one of its modals
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModalOpenRequest {
    pub modal_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Refers to a pending request or a live subscription
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IdRequest {
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApproveSiteRequest {
    pub id: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_chain_id: Option<u64>,
}

/// A page asking to connect; the url comes from the port, not the page
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct AuthorizeTabRequest {
    pub origin: String,
    #[serde(default)]
    pub ethereum: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "message", content = "request")]
pub enum MessageRequest {
    #[serde(rename = "pri(app.onboard)")]
    Onboard(OnboardRequest),
    #[serde(rename = "pri(app.onboardStatus)")]
    OnboardStatus,
    #[serde(rename = "pri(app.onboardStatus.subscribe)")]
    OnboardStatusSubscribe,
    #[serde(rename = "pri(app.authenticate)")]
    Authenticate(LoginRequest),
    #[serde(rename = "pri(app.authStatus)")]
    AuthStatus,
    #[serde(rename = "pri(app.authStatus.subscribe)")]
    AuthStatusSubscribe,
    #[serde(rename = "pri(app.lock)")]
    Lock,
    #[serde(rename = "pri(app.changePassword)")]
    ChangePassword(ChangePasswordRequest),
    #[serde(rename = "pri(app.checkPassword)")]
    CheckPassword(PasswordRequest),
    #[serde(rename = "pri(app.migratePassword)")]
    MigratePassword(PasswordRequest),
    #[serde(rename = "pri(app.dashboardOpen)")]
    DashboardOpen(RouteRequest),
    #[serde(rename = "pri(app.onboardOpen)")]
    OnboardOpen,
    #[serde(rename = "pri(app.promptLogin)")]
    PromptLogin(bool),
    #[serde(rename = "pri(app.sendFunds.open)")]
    SendFundsOpen(SendFundsOpenRequest),
    #[serde(rename = "pri(app.modalOpen.request)")]
    ModalOpenRequest(ModalOpenRequest),
    #[serde(rename = "pri(app.modalOpen.subscribe)")]
    ModalOpenSubscribe,
    #[serde(rename = "pri(app.analyticsCapture)")]
    AnalyticsCapture(AnalyticsCaptureRequest),
    #[serde(rename = "pri(app.resetWallet)")]
    ResetWallet,
    #[serde(rename = "pri(app.requests)")]
    Requests,
    #[serde(rename = "pri(mnemonic.confirm)")]
    MnemonicConfirm(bool),
    #[serde(rename = "pri(unsubscribe)")]
    Unsubscribe(IdRequest),

    #[serde(rename = "pri(signing.approveSign)")]
    SigningApprove(IdRequest),
    #[serde(rename = "pri(signing.cancel)")]
    SigningCancel(IdRequest),
    #[serde(rename = "pri(metadata.approve)")]
    MetadataApprove(IdRequest),
    #[serde(rename = "pri(metadata.reject)")]
    MetadataReject(IdRequest),
    #[serde(rename = "pri(sites.requests.approve)")]
    SitesApprove(ApproveSiteRequest),
    #[serde(rename = "pri(sites.requests.reject)")]
    SitesReject(IdRequest),
    #[serde(rename = "pri(eth.networks.add.approve)")]
    NetworkApprove(IdRequest),
    #[serde(rename = "pri(eth.networks.add.cancel)")]
    NetworkCancel(IdRequest),
    #[serde(rename = "pri(assets.erc20.approve)")]
    AssetApprove(IdRequest),
    #[serde(rename = "pri(assets.erc20.cancel)")]
    AssetCancel(IdRequest),

    #[serde(rename = "pub(authorize.tab)")]
    AuthorizeTab(AuthorizeTabRequest),
    #[serde(rename = "pub(bytes.sign)")]
    SignBytes(SigningRequest),
    #[serde(rename = "pub(metadata.provide)")]
    MetadataProvide(MetadataRequest),
    #[serde(rename = "pub(eth.network.add)")]
    EthNetworkAdd(AddNetworkRequest),
    #[serde(rename = "pub(eth.watchAsset)")]
    EthWatchAsset(WatchAssetRequest),
}
