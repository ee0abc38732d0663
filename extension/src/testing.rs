//! Fakes shared by the unit tests

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::analytics::Analytics;
use crate::browser::{
    Browser, BrowserEvent, CreateWindow, TabId, TabInfo, TabStatus, TabUpdate, WindowId,
    WindowInfo, WindowState, WindowUpdate,
};
use crate::bus::ErrorSink;
use crate::config::ConfigFile;
use crate::credentials::Credentials;
use crate::keyring::{Account, AccountMeta, AccountOrigin, KeyType, Keyring, MemoryKeyring};
use crate::storage::{MemoryStorage, Stores};
use crate::window::WindowManager;

pub const MAIN_WINDOW: WindowId = 1;

#[derive(Default)]
struct FakeBrowserState {
    next_id: i64,
    windows: BTreeMap<WindowId, WindowInfo>,
    tabs: BTreeMap<TabId, TabInfo>,
    popups: Vec<WindowId>,
    badge: String,
    created_windows: Vec<CreateWindow>,
    window_updates: Vec<(WindowId, WindowUpdate)>,
    tab_updates: Vec<(TabId, TabUpdate)>,
}

impl FakeBrowserState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn focus(&mut self, id: WindowId) {
        for (window_id, window) in self.windows.iter_mut() {
            window.focused = *window_id == id;
        }
    }
}

/// In-memory browser with one focused main window (left 0, top 20,
/// 1200 wide)
pub struct FakeBrowser {
    state: Mutex<FakeBrowserState>,
    events: broadcast::Sender<BrowserEvent>,
    honour_position: AtomicBool,
    complete_tabs_after_create: AtomicBool,
}

impl FakeBrowser {
    pub fn new() -> Self {
        let mut state = FakeBrowserState {
            next_id: 100,
            ..Default::default()
        };
        state.windows.insert(
            MAIN_WINDOW,
            WindowInfo {
                id: MAIN_WINDOW,
                left: Some(0),
                top: Some(20),
                width: Some(1200),
                height: Some(800),
                focused: true,
                state: WindowState::Normal,
            },
        );
        let (events, _) = broadcast::channel(64);

        Self {
            state: Mutex::new(state),
            events,
            honour_position: AtomicBool::new(true),
            complete_tabs_after_create: AtomicBool::new(false),
        }
    }

    /// Emulate browsers that ignore position on window creation
    pub fn set_honour_position(&self, honour: bool) {
        self.honour_position.store(honour, Ordering::SeqCst);
    }

    /// Emit a load-complete event right after each tab is created
    pub fn set_complete_tabs_after_create(&self, complete: bool) {
        self.complete_tabs_after_create.store(complete, Ordering::SeqCst);
    }

    pub fn add_window(&self, focused: bool) -> WindowId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.windows.insert(
            id,
            WindowInfo {
                id,
                left: Some(50),
                top: Some(50),
                width: Some(800),
                height: Some(600),
                focused: false,
                state: WindowState::Normal,
            },
        );
        if focused {
            state.focus(id);
        }
        id
    }

    pub fn add_tab(&self, url: &str, window_id: WindowId, status: TabStatus) -> TabId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        state.tabs.insert(
            id,
            TabInfo {
                id,
                window_id,
                url: url.to_string(),
                status,
                active: false,
            },
        );
        id
    }

    pub fn emit(&self, event: BrowserEvent) {
        let _ = self.events.send(event);
    }

    /// The user closed the window; no event is delivered
    pub fn remove_window_silently(&self, id: WindowId) {
        self.state.lock().unwrap().windows.remove(&id);
    }

    /// The user closed a tab
    pub fn close_tab(&self, id: TabId) {
        self.state.lock().unwrap().tabs.remove(&id);
        self.emit(BrowserEvent::TabRemoved { tab_id: id });
    }

    pub fn open_popups(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .popups
            .iter()
            .filter(|id| state.windows.contains_key(id))
            .count()
    }

    pub fn badge(&self) -> String {
        self.state.lock().unwrap().badge.clone()
    }

    pub fn focused_window(&self) -> Option<WindowId> {
        let state = self.state.lock().unwrap();
        state.windows.values().find(|w| w.focused).map(|w| w.id)
    }

    pub fn tab_count(&self) -> usize {
        self.state.lock().unwrap().tabs.len()
    }

    pub fn tab_urls(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.tabs.values().map(|t| t.url.clone()).collect()
    }

    pub fn created_windows(&self) -> Vec<CreateWindow> {
        self.state.lock().unwrap().created_windows.clone()
    }

    pub fn window_updates(&self) -> Vec<(WindowId, WindowUpdate)> {
        self.state.lock().unwrap().window_updates.clone()
    }

    pub fn tab_updates(&self) -> Vec<(TabId, TabUpdate)> {
        self.state.lock().unwrap().tab_updates.clone()
    }
}

fn without_fragment(url: &str) -> &str {
    url.split('#').next().unwrap_or(url)
}

#[async_trait]
impl Browser for FakeBrowser {
    fn extension_url(&self, path: &str) -> String {
        format!("chrome-extension://frost/{}", path)
    }

    fn screen_width(&self) -> i32 {
        1920
    }

    fn events(&self) -> broadcast::Receiver<BrowserEvent> {
        self.events.subscribe()
    }

    async fn last_focused_window(&self) -> Result<Option<WindowInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state.windows.values().find(|w| w.focused).cloned())
    }

    async fn get_window(&self, id: WindowId) -> Result<WindowInfo> {
        let state = self.state.lock().unwrap();
        state
            .windows
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("No window with id: {}", id))
    }

    async fn create_window(&self, options: CreateWindow) -> Result<WindowInfo> {
        let honour = self.honour_position.load(Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let id = state.next_id();
        let window = WindowInfo {
            id,
            left: Some(if honour { options.left } else { 0 }),
            top: Some(if honour { options.top } else { 0 }),
            width: Some(options.width),
            height: Some(options.height),
            focused: false,
            state: WindowState::Normal,
        };
        state.windows.insert(id, window.clone());
        state.popups.push(id);
        state.created_windows.push(options);
        Ok(window)
    }

    async fn update_window(&self, id: WindowId, update: WindowUpdate) -> Result<WindowInfo> {
        let mut state = self.state.lock().unwrap();
        if !state.windows.contains_key(&id) {
            return Err(anyhow!("No window with id: {}", id));
        }
        if update.focused == Some(true) {
            state.focus(id);
        }
        state.window_updates.push((id, update.clone()));

        let window = state
            .windows
            .get_mut(&id)
            .ok_or_else(|| anyhow!("No window with id: {}", id))?;
        if let Some(left) = update.left {
            window.left = Some(left);
        }
        if let Some(top) = update.top {
            window.top = Some(top);
        }
        Ok(window.clone())
    }

    async fn remove_window(&self, id: WindowId) -> Result<()> {
        let removed = self.state.lock().unwrap().windows.remove(&id);
        if removed.is_none() {
            return Err(anyhow!("No window with id: {}", id));
        }
        self.emit(BrowserEvent::WindowRemoved { window_id: id });
        Ok(())
    }

    async fn query_tabs(&self, url: &str) -> Result<Vec<TabInfo>> {
        let state = self.state.lock().unwrap();
        let wanted = without_fragment(url);
        Ok(state
            .tabs
            .values()
            .filter(|tab| without_fragment(&tab.url) == wanted)
            .cloned()
            .collect())
    }

    async fn create_tab(&self, url: &str) -> Result<TabInfo> {
        let tab = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id();
            let window_id = state
                .windows
                .values()
                .find(|w| w.focused)
                .map(|w| w.id)
                .unwrap_or(MAIN_WINDOW);
            let tab = TabInfo {
                id,
                window_id,
                url: url.to_string(),
                status: TabStatus::Loading,
                active: true,
            };
            state.tabs.insert(id, tab.clone());
            tab
        };

        if self.complete_tabs_after_create.load(Ordering::SeqCst) {
            self.emit(BrowserEvent::TabUpdated {
                tab_id: tab.id,
                status: TabStatus::Complete,
            });
        }
        Ok(tab)
    }

    async fn update_tab(&self, id: TabId, update: TabUpdate) -> Result<TabInfo> {
        let mut state = self.state.lock().unwrap();
        state.tab_updates.push((id, update.clone()));
        let tab = state
            .tabs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("No tab with id: {}", id))?;
        if let Some(url) = update.url {
            tab.url = url;
        }
        if let Some(active) = update.active {
            tab.active = active;
        }
        Ok(tab.clone())
    }

    async fn set_badge_text(&self, text: &str) -> Result<()> {
        self.state.lock().unwrap().badge = text.to_string();
        Ok(())
    }
}

/// `MemoryKeyring` whose k-th re-encryption (counted from the last
/// `fail_reencrypt_at`) fails
#[derive(Default)]
pub struct FlakyKeyring {
    inner: MemoryKeyring,
    fail_at: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyKeyring {
    pub fn fail_reencrypt_at(&self, call: usize) {
        self.calls.store(0, Ordering::SeqCst);
        self.fail_at.store(call, Ordering::SeqCst);
    }
}

#[async_trait]
impl Keyring for FlakyKeyring {
    async fn accounts(&self) -> Result<Vec<Account>> {
        self.inner.accounts().await
    }

    async fn add_uri(
        &self,
        mnemonic: &str,
        derivation_path: &str,
        key_type: KeyType,
        password: &str,
        meta: AccountMeta,
    ) -> Result<Account> {
        self.inner
            .add_uri(mnemonic, derivation_path, key_type, password, meta)
            .await
    }

    async fn forget_account(&self, address: &str) -> Result<()> {
        self.inner.forget_account(address).await
    }

    async fn unlock_check(&self, address: &str, password: &str) -> Result<()> {
        self.inner.unlock_check(address, password).await
    }

    async fn reencrypt(&self, address: &str, from: &str, to: &str) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at.load(Ordering::SeqCst) {
            return Err(anyhow!("Injected failure re-encrypting {}", address));
        }
        self.inner.reencrypt(address, from, to).await
    }

    async fn encrypted(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.inner.encrypted(address).await
    }

    async fn sign(&self, address: &str, data: &[u8], password: &str) -> Result<String> {
        self.inner.sign(address, data, password).await
    }
}

#[derive(Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<String>>,
}

impl RecordingAnalytics {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Analytics for RecordingAnalytics {
    async fn capture(&self, event: &str, _properties: Option<Value>) -> Result<()> {
        self.events.lock().unwrap().push(event.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingErrorSink {
    reports: Mutex<Vec<(String, Value)>>,
}

impl RecordingErrorSink {
    pub fn reports(&self) -> Vec<(String, Value)> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingErrorSink {
    fn report(&self, message: &str, context: Value) {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_string(), context));
    }
}

pub struct CredentialsEnv {
    pub credentials: Credentials,
    pub stores: Arc<Stores>,
    pub keyring: Arc<FlakyKeyring>,
    pub analytics: Arc<RecordingAnalytics>,
    pub browser: Arc<FakeBrowser>,
}

/// Fresh, not yet onboarded wallet
pub async fn credentials() -> CredentialsEnv {
    let config = ConfigFile::for_tests();
    let stores = Stores::load(Arc::new(MemoryStorage::new()), &config.auth)
        .await
        .unwrap();
    let browser = Arc::new(FakeBrowser::new());
    let windows = Arc::new(WindowManager::new(
        browser.clone(),
        config.popup.clone(),
        config.tabs.clone(),
    ));
    let keyring = Arc::new(FlakyKeyring::default());
    let analytics = Arc::new(RecordingAnalytics::default());

    let credentials = Credentials::new(
        stores.clone(),
        keyring.clone(),
        windows,
        analytics.clone(),
        config.auth.clone(),
        config.wallet.clone(),
    );

    CredentialsEnv {
        credentials,
        stores,
        keyring,
        analytics,
        browser,
    }
}

/// Onboarded version 1 wallet: keys and seed encrypted with the raw
/// password, no verifier yet
pub async fn legacy_wallet(password: &str, phrase: &str) -> CredentialsEnv {
    let env = credentials().await;
    env.stores
        .password
        .update(|data| {
            data.password_version = 1;
            data.is_hashed = false;
        })
        .await
        .unwrap();

    let primary = env
        .keyring
        .add_uri(
            phrase,
            "m/44'/0'/0'/0/0",
            KeyType::Primary,
            password,
            AccountMeta {
                name: "Legacy".to_string(),
                origin: AccountOrigin::SeedStored,
                parent: None,
                derivation_path: None,
            },
        )
        .await
        .unwrap();
    env.keyring
        .add_uri(
            phrase,
            "m/44'/60'/0'/0/0",
            KeyType::Ethereum,
            password,
            AccountMeta {
                name: "Legacy Ethereum".to_string(),
                origin: AccountOrigin::Derived,
                parent: Some(primary.address),
                derivation_path: Some("m/44'/60'/0'/0/0".to_string()),
            },
        )
        .await
        .unwrap();
    env.stores.seed_phrase.add(phrase, password, true).await.unwrap();
    env.stores.app.set_onboarded(true).await.unwrap();
    env
}
