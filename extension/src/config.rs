use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub popup: PopupConfig,
    #[serde(default)]
    pub tabs: TabConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

/// Geometry of the "action required" popup window
#[derive(Debug, Clone, Deserialize)]
pub struct PopupConfig {
    #[serde(default = "default_popup_width")]
    pub width: i32,
    #[serde(default = "default_popup_height")]
    pub height: i32,
    /// Distance from the right edge of the focused window
    #[serde(default = "default_right_offset")]
    pub right_offset: i32,
    #[serde(default = "default_top_offset")]
    pub top_offset: i32,
}

impl Default for PopupConfig {
    fn default() -> Self {
        Self {
            width: default_popup_width(),
            height: default_popup_height(),
            right_offset: default_right_offset(),
            top_offset: default_top_offset(),
        }
    }
}

fn default_popup_width() -> i32 {
    360
}

fn default_popup_height() -> i32 {
    510
}

fn default_right_offset() -> i32 {
    410
}

fn default_top_offset() -> i32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct TabConfig {
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
    /// How long a modal request waits for a freshly opened dashboard to
    /// subscribe before it is emitted anyway
    #[serde(default = "default_modal_subscriber_timeout_ms")]
    pub modal_subscriber_timeout_ms: u64,
}

impl TabConfig {
    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn modal_subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.modal_subscriber_timeout_ms)
    }
}

impl Default for TabConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: default_load_timeout_ms(),
            modal_subscriber_timeout_ms: default_modal_subscriber_timeout_ms(),
        }
    }
}

fn default_load_timeout_ms() -> u64 {
    3_000
}

fn default_modal_subscriber_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Delay applied before onboarding and login attempts (brute-force damping)
    #[serde(default = "default_auth_delay_ms")]
    pub delay_ms: u64,
    /// Rounds of salted SHA-256 used by the version 2 password scheme
    #[serde(default = "default_hash_rounds")]
    pub hash_rounds: u32,
}

impl AuthConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_auth_delay_ms(),
            hash_rounds: default_hash_rounds(),
        }
    }
}

fn default_auth_delay_ms() -> u64 {
    1_000
}

fn default_hash_rounds() -> u32 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// The wallet's own web app; pre-authorised during onboarding
    #[serde(default = "default_wallet_domain")]
    pub domain: String,
    #[serde(default = "default_primary_path")]
    pub primary_derivation_path: String,
    #[serde(default = "default_ethereum_path")]
    pub ethereum_derivation_path: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            domain: default_wallet_domain(),
            primary_derivation_path: default_primary_path(),
            ethereum_derivation_path: default_ethereum_path(),
        }
    }
}

fn default_wallet_domain() -> String {
    "app.frost-wallet.io".to_string()
}

fn default_primary_path() -> String {
    "m/44'/0'/0'/0/0".to_string()
}

fn default_ethereum_path() -> String {
    "m/44'/60'/0'/0/0".to_string()
}

impl ConfigFile {
    pub fn load(path: &str) -> Result<Self> {
        let content =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Load from `CONFIG_PATH` (default `config.toml`), falling back to
    /// built-in defaults when no file exists.
    pub fn from_env() -> Result<Self> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        if !Path::new(&config_path).exists() {
            tracing::info!("No config at {}, using defaults", config_path);
            return Ok(Self::default());
        }

        tracing::info!("Loading configuration from: {}", config_path);
        let config = Self::load(&config_path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.popup.width <= 0 || self.popup.height <= 0 {
            anyhow::bail!(
                "Popup size must be positive, got {}x{}",
                self.popup.width,
                self.popup.height
            );
        }
        if self.auth.hash_rounds == 0 {
            anyhow::bail!("auth.hash_rounds must be at least 1");
        }
        if self.wallet.domain.trim().is_empty() {
            anyhow::bail!("wallet.domain must not be empty");
        }
        for path in [
            &self.wallet.primary_derivation_path,
            &self.wallet.ethereum_derivation_path,
        ] {
            path.parse::<bitcoin::bip32::DerivationPath>()
                .context(format!("Invalid derivation path: {}", path))?;
        }
        Ok(())
    }

    /// Configuration suited to tests: no login delay, cheap hashing, short
    /// tab-load timeout.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        let mut config = Self::default();
        config.auth.delay_ms = 0;
        config.auth.hash_rounds = 8;
        config.tabs.load_timeout_ms = 50;
        config.tabs.modal_subscriber_timeout_ms = 200;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ConfigFile = toml::from_str(
            r#"
            [popup]
            width = 400

            [auth]
            delay_ms = 0
            "#,
        )
        .unwrap();

        assert_eq!(config.popup.width, 400);
        assert_eq!(config.popup.height, 510);
        assert_eq!(config.auth.delay_ms, 0);
        assert_eq!(config.auth.hash_rounds, 10_000);
        assert_eq!(config.tabs.load_timeout(), Duration::from_secs(3));
        assert_eq!(config.wallet.ethereum_derivation_path, "m/44'/60'/0'/0/0");
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_derivation_path_rejected() {
        let mut config = ConfigFile::default();
        config.wallet.ethereum_derivation_path = "not/a/path".to_string();
        assert!(config.validate().is_err());
    }
}
