//! Browser windows/tabs capability used by the window orchestrator
//!
//! The background never talks to `chrome.windows` / `chrome.tabs` directly;
//! the embedding glue implements `Browser` and the control plane stays
//! testable against a fake.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub type WindowId = i64;
pub type TabId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WindowState {
    #[default]
    Normal,
    Minimized,
    Maximized,
    Fullscreen,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WindowInfo {
    pub id: WindowId,
    pub left: Option<i32>,
    pub top: Option<i32>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub focused: bool,
    pub state: WindowState,
}

/// `chrome.windows.create` options for a popup window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateWindow {
    pub url: String,
    pub width: i32,
    pub height: i32,
    pub left: i32,
    pub top: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowUpdate {
    pub left: Option<i32>,
    pub top: Option<i32>,
    pub focused: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    Loading,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub id: TabId,
    pub window_id: WindowId,
    pub url: String,
    pub status: TabStatus,
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabUpdate {
    pub active: Option<bool>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserEvent {
    TabUpdated { tab_id: TabId, status: TabStatus },
    TabRemoved { tab_id: TabId },
    WindowRemoved { window_id: WindowId },
}

#[async_trait]
pub trait Browser: Send + Sync {
    /// Absolute url of a page bundled with the extension
    fn extension_url(&self, path: &str) -> String;

    /// Available screen width, used when no window is focused
    fn screen_width(&self) -> i32;

    /// Stream of tab/window lifecycle events
    fn events(&self) -> broadcast::Receiver<BrowserEvent>;

    async fn last_focused_window(&self) -> Result<Option<WindowInfo>>;

    async fn get_window(&self, id: WindowId) -> Result<WindowInfo>;

    async fn create_window(&self, options: CreateWindow) -> Result<WindowInfo>;

    async fn update_window(&self, id: WindowId, update: WindowUpdate) -> Result<WindowInfo>;

    async fn remove_window(&self, id: WindowId) -> Result<()>;

    /// Tabs whose url matches `url` (fragment ignored)
    async fn query_tabs(&self, url: &str) -> Result<Vec<TabInfo>>;

    async fn create_tab(&self, url: &str) -> Result<TabInfo>;

    async fn update_tab(&self, id: TabId, update: TabUpdate) -> Result<TabInfo>;

    async fn set_badge_text(&self, text: &str) -> Result<()>;
}
