//! In-process message channel between the background and a front-end context
//!
//! One `connect` call models one `chrome.runtime.Port`: ordered, at-most-once
//! delivery in each direction, with no persistence across restarts. Dropping
//! either half closes the channel; the background observes this as a
//! disconnect and cancels whatever that port had in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::browser::TabId;
use crate::protocol::{TransportRequest, TransportResponse};

pub type PortId = u64;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata about the context on the other end of a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSender {
    pub id: PortId,
    /// Page url for injected scripts, extension page url for popup/dashboard
    pub url: Option<String>,
    pub tab_id: Option<TabId>,
    /// True for extension pages (popup, dashboard, onboarding)
    pub is_extension: bool,
}

impl PortSender {
    pub fn extension_page(url: impl Into<String>) -> Self {
        Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            url: Some(url.into()),
            tab_id: None,
            is_extension: true,
        }
    }

    pub fn content_script(url: impl Into<String>, tab_id: TabId) -> Self {
        Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            url: Some(url.into()),
            tab_id: Some(tab_id),
            is_extension: false,
        }
    }
}

/// Front-end half: posts requests, receives responses
pub struct FrontendPort {
    pub tx: mpsc::UnboundedSender<TransportRequest>,
    pub rx: mpsc::UnboundedReceiver<TransportResponse>,
}

/// Background half: receives requests, posts responses
pub struct BackgroundPort {
    pub sender: PortSender,
    pub rx: mpsc::UnboundedReceiver<TransportRequest>,
    tx: mpsc::UnboundedSender<TransportResponse>,
}

impl BackgroundPort {
    pub fn responder(&self) -> Responder {
        Responder {
            sender: self.sender.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Cloneable write handle for the background side of a port
#[derive(Clone)]
pub struct Responder {
    pub sender: PortSender,
    tx: mpsc::UnboundedSender<TransportResponse>,
}

impl Responder {
    /// Post a response. Returns false when the front-end has gone away.
    pub fn post(&self, response: TransportResponse) -> bool {
        match self.tx.send(response) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Port {} closed, dropping response {}", self.sender.id, e.0.id);
                false
            }
        }
    }
}

/// Open a new port for the given sender.
pub fn connect(sender: PortSender) -> (FrontendPort, BackgroundPort) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();

    (
        FrontendPort {
            tx: request_tx,
            rx: response_rx,
        },
        BackgroundPort {
            sender,
            rx: request_rx,
            tx: response_tx,
        },
    )
}
