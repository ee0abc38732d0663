//! Popup window and extension tab management
//!
//! Exactly one "action required" popup is shown while any request is
//! pending. Opening and closing are serialized through `op_lock`, so two
//! store changes arriving together can never race to create two popups.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::browser::{
    Browser, BrowserEvent, CreateWindow, TabId, TabInfo, TabStatus, TabUpdate, WindowId,
    WindowState, WindowUpdate,
};
use crate::config::{PopupConfig, TabConfig};
use crate::protocol::{ModalOpenRequest, SendFundsOpenRequest};
use crate::storage::sites::strip_url;

const MODAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopupState {
    Closed,
    Opening,
    Open,
}

#[derive(Debug)]
struct Popup {
    state: PopupState,
    windows: Vec<WindowId>,
}

pub struct WindowManager {
    browser: Arc<dyn Browser>,
    popup_config: PopupConfig,
    tab_config: TabConfig,
    popup: Mutex<Popup>,
    op_lock: tokio::sync::Mutex<()>,
    // Prevents opening two onboarding tabs at once
    onboarding_tab_opening: AtomicBool,
    // Sites that already triggered a focused onboarding tab
    onboarding_requests_by_url: Mutex<HashSet<String>>,
    modal_requests: broadcast::Sender<ModalOpenRequest>,
}

/// Clears the onboarding flag however `open_onboarding` exits
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl WindowManager {
    pub fn new(browser: Arc<dyn Browser>, popup_config: PopupConfig, tab_config: TabConfig) -> Self {
        Self {
            browser,
            popup_config,
            tab_config,
            popup: Mutex::new(Popup {
                state: PopupState::Closed,
                windows: Vec::new(),
            }),
            op_lock: tokio::sync::Mutex::new(()),
            onboarding_tab_opening: AtomicBool::new(false),
            onboarding_requests_by_url: Mutex::new(HashSet::new()),
            modal_requests: broadcast::channel(16).0,
        }
    }

    pub fn popup_state(&self) -> PopupState {
        self.popup().state
    }

    pub fn popup_windows(&self) -> Vec<WindowId> {
        self.popup().windows.clone()
    }

    /// Open the popup unless one is already showing. `argument` is appended
    /// to `popup.html` (e.g. `?signing=<id>`). Returns true if a window was
    /// created.
    pub async fn popup_open(&self, argument: Option<&str>) -> Result<bool> {
        let _op = self.op_lock.lock().await;

        {
            let mut popup = self.popup();
            if popup.state != PopupState::Closed {
                tracing::debug!("Popup already {:?}, not opening another", popup.state);
                return Ok(false);
            }
            popup.state = PopupState::Opening;
        }

        match self.create_popup(argument).await {
            Ok(id) => {
                let mut popup = self.popup();
                popup.windows.push(id);
                popup.state = PopupState::Open;
                tracing::info!("Popup window {} opened", id);
                Ok(true)
            }
            Err(e) => {
                self.popup().state = PopupState::Closed;
                Err(e)
            }
        }
    }

    /// Close every tracked popup window. Windows the user already closed are
    /// skipped quietly.
    pub async fn popup_close(&self) {
        let _op = self.op_lock.lock().await;

        let windows = {
            let mut popup = self.popup();
            popup.state = PopupState::Closed;
            std::mem::take(&mut popup.windows)
        };

        for id in windows {
            if let Err(e) = self.browser.remove_window(id).await {
                tracing::debug!("Popup window {} already gone: {:#}", id, e);
            }
        }
    }

    /// A window was closed outside our control
    pub fn forget_window(&self, id: WindowId) {
        let mut popup = self.popup();
        let before = popup.windows.len();
        popup.windows.retain(|w| *w != id);
        if popup.windows.len() != before {
            tracing::debug!("Popup window {} closed by user", id);
            if popup.windows.is_empty() && popup.state == PopupState::Open {
                popup.state = PopupState::Closed;
            }
        }
    }

    pub async fn prompt_login(&self, close_on_success: bool) -> Result<bool> {
        self.popup_open(Some(&format!("?closeOnSuccess={}", close_on_success)))
            .await
    }

    async fn create_popup(&self, argument: Option<&str>) -> Result<WindowId> {
        let current = match self.browser.last_focused_window().await {
            Ok(window) => window,
            Err(e) => {
                tracing::warn!("Could not read focused window: {:#}", e);
                None
            }
        };

        let top = self.popup_config.top_offset + current.as_ref().and_then(|w| w.top).unwrap_or(0);
        let right_edge = match current.as_ref().and_then(|w| w.width) {
            Some(width) => current.as_ref().and_then(|w| w.left).unwrap_or(0) + width,
            None => self.browser.screen_width(),
        };
        let left = right_edge - self.popup_config.right_offset;

        let url = self
            .browser
            .extension_url(&format!("popup.html{}", argument.unwrap_or("")));

        let popup = self
            .browser
            .create_window(CreateWindow {
                url,
                width: self.popup_config.width,
                height: self.popup_config.height,
                left,
                top,
            })
            .await?;

        // Some browsers ignore position at creation time
        if popup.left != Some(left) && popup.state != WindowState::Fullscreen {
            let update = WindowUpdate {
                left: Some(left),
                top: Some(top),
                focused: None,
            };
            if let Err(e) = self.browser.update_window(popup.id, update).await {
                tracing::warn!("Failed to position popup {}: {:#}", popup.id, e);
            }
        }

        Ok(popup.id)
    }

    /// Focus an existing tab for `url` (matched by `base_url` when given) or
    /// create one, then wait until it has loaded or the load timeout passes.
    pub async fn open_tab_once(
        &self,
        url: &str,
        base_url: Option<&str>,
        should_focus: bool,
    ) -> Result<TabInfo> {
        // Subscribe before touching the tab so the load event cannot slip by
        let mut events = self.browser.events();
        let query_url = base_url.unwrap_or(url);

        let existing = self.browser.query_tabs(query_url).await?.into_iter().next();

        let tab = match existing {
            Some(tab) => {
                let update = TabUpdate {
                    active: Some(should_focus),
                    url: (tab.url != url).then(|| url.to_string()),
                };
                let tab = self.browser.update_tab(tab.id, update).await?;

                if should_focus {
                    let window = self.browser.get_window(tab.window_id).await?;
                    if !window.focused {
                        let update = WindowUpdate {
                            focused: Some(true),
                            ..Default::default()
                        };
                        self.browser.update_window(window.id, update).await?;
                    }
                }
                tab
            }
            None => self.browser.create_tab(url).await?,
        };

        if tab.status == TabStatus::Loading {
            self.wait_tab_loaded(tab.id, &mut events).await;
        }
        Ok(tab)
    }

    async fn wait_tab_loaded(&self, tab_id: TabId, events: &mut broadcast::Receiver<BrowserEvent>) {
        let loaded = async {
            loop {
                match events.recv().await {
                    Ok(BrowserEvent::TabUpdated {
                        tab_id: id,
                        status: TabStatus::Complete,
                    }) if id == tab_id => return,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        };

        if tokio::time::timeout(self.tab_config.load_timeout(), loaded)
            .await
            .is_err()
        {
            tracing::debug!("Tab {} did not finish loading in time", tab_id);
        }
    }

    /// Open (or focus) the onboarding tab. A call made while another is in
    /// flight does nothing and returns false.
    pub async fn open_onboarding(
        &self,
        route: Option<&str>,
        requesting_site: Option<&str>,
        onboarded: bool,
    ) -> Result<bool> {
        if self
            .onboarding_tab_opening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Onboarding tab already opening");
            return Ok(false);
        }
        let _guard = FlagGuard(&self.onboarding_tab_opening);

        let base_url = self.browser.extension_url("onboarding.html");
        let url = match route {
            Some(route) => format!("{}#{}", base_url, route),
            None => base_url.clone(),
        };

        let site_key = requesting_site.map(strip_url);
        let should_focus = onboarded
            || match &site_key {
                None => true,
                Some(key) => !self.onboarding_requests().contains(key),
            };

        self.open_tab_once(&url, Some(&base_url), should_focus).await?;

        if should_focus {
            if let Some(key) = site_key {
                self.onboarding_requests().insert(key);
            }
        }
        Ok(true)
    }

    pub async fn open_dashboard(&self, route: &str) -> Result<TabInfo> {
        let base_url = self.browser.extension_url("dashboard.html");
        let url = format!("{}#{}", base_url, route);
        self.open_tab_once(&url, Some(&base_url), true).await
    }

    /// Open the popup on the send screen, prefilled with whatever was given
    pub async fn open_send_funds(&self, request: &SendFundsOpenRequest) -> Result<bool> {
        let query = {
            let mut params = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in [
                ("from", &request.from),
                ("tokenId", &request.token_id),
                ("to", &request.to),
            ] {
                if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                    params.append_pair(key, value);
                }
            }
            params.finish()
        };

        self.popup_open(Some(&format!("#/send?{}", query))).await?;
        Ok(true)
    }

    /// Hand a modal request to the dashboard. Without a dashboard tab one is
    /// opened first, and the request waits (bounded) for it to subscribe.
    pub async fn open_modal(&self, request: ModalOpenRequest) -> Result<()> {
        let dashboard = self.browser.extension_url("dashboard.html");
        if self.browser.query_tabs(&dashboard).await?.is_empty() {
            self.open_dashboard("/portfolio").await?;

            let subscribed = async {
                while self.modal_requests.receiver_count() == 0 {
                    tokio::time::sleep(MODAL_POLL_INTERVAL).await;
                }
            };
            if tokio::time::timeout(self.tab_config.modal_subscriber_timeout(), subscribed)
                .await
                .is_err()
            {
                tracing::debug!("Dashboard did not subscribe to modal requests in time");
            }
        }

        if self.modal_requests.send(request).is_err() {
            tracing::debug!("No dashboard listening, modal request dropped");
        }
        Ok(())
    }

    pub fn subscribe_modal_requests(&self) -> broadcast::Receiver<ModalOpenRequest> {
        self.modal_requests.subscribe()
    }

    fn popup(&self) -> MutexGuard<'_, Popup> {
        self.popup.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn onboarding_requests(&self) -> MutexGuard<'_, HashSet<String>> {
        self.onboarding_requests_by_url
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
