//! Background control plane of the Frost browser-extension wallet.
//!
//! The crate is embedded by the extension's background entry point, which
//! supplies the browser, keyring, storage and analytics collaborators and
//! attaches one `BackgroundPort` per connected front-end context.

pub mod analytics;
pub mod background;
pub mod badge;
pub mod browser;
pub mod bus;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod keyring;
pub mod protocol;
pub mod requests;
pub mod state;
pub mod storage;
pub mod transport;
pub mod window;

#[cfg(test)]
mod testing;

use std::time::{SystemTime, UNIX_EPOCH};

pub use background::{init_tracing, Background, Collaborators};
pub use config::ConfigFile;
pub use error::{ExtensionError, ExtensionResult};

/// Milliseconds since the unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
