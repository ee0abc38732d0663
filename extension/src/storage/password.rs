//! Password scheme state and the in-memory session
//!
//! Version 1 wallets encrypt keys with the raw password (trimmed for very
//! old wallets). Version 2 wallets encrypt with a salted hash of it and keep
//! a `secret`/`check` verifier pair so login never needs to touch a key.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::watch;

use super::{StorageBackend, Store};
use crate::crypto;
use crate::error::{ExtensionError, ExtensionResult};

const CHECK_LABEL: &str = "auth-check";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggedIn {
    True,
    #[default]
    False,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", from = "PersistedPasswordData")]
pub struct PasswordStoreData {
    pub password_version: u8,
    pub is_trimmed: bool,
    pub is_hashed: bool,
    pub salt: Option<String>,
    pub secret: Option<String>,
    pub check: Option<String>,
}

/// Stored form; blobs written before the version tag existed lack it
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedPasswordData {
    #[serde(default)]
    password_version: Option<u8>,
    #[serde(default)]
    is_trimmed: bool,
    #[serde(default)]
    is_hashed: bool,
    #[serde(default)]
    salt: Option<String>,
    #[serde(default)]
    secret: Option<String>,
    #[serde(default)]
    check: Option<String>,
}

impl From<PersistedPasswordData> for PasswordStoreData {
    fn from(raw: PersistedPasswordData) -> Self {
        let legacy_version = if raw.is_hashed { 2 } else { 1 };
        Self {
            password_version: raw.password_version.unwrap_or(legacy_version),
            is_trimmed: raw.is_trimmed,
            is_hashed: raw.is_hashed,
            salt: raw.salt,
            secret: raw.secret,
            check: raw.check,
        }
    }
}

fn default_password_version() -> u8 {
    2
}

impl Default for PasswordStoreData {
    fn default() -> Self {
        Self {
            password_version: default_password_version(),
            is_trimmed: false,
            is_hashed: false,
            salt: None,
            secret: None,
            check: None,
        }
    }
}

/// Freshly generated verifier material
#[derive(Debug, Clone)]
pub struct AuthSecret {
    pub secret: String,
    pub check: String,
}

pub struct PasswordStore {
    store: Store<PasswordStoreData>,
    hash_rounds: u32,
    // Transformed password of the unlocked session
    session: RwLock<Option<String>>,
    logged_in: watch::Sender<LoggedIn>,
}

impl PasswordStore {
    pub async fn load(backend: Arc<dyn StorageBackend>, hash_rounds: u32) -> Result<Self> {
        let (logged_in, _) = watch::channel(LoggedIn::False);
        Ok(Self {
            store: Store::load("password", backend).await?,
            hash_rounds,
            session: RwLock::new(None),
            logged_in,
        })
    }

    pub fn data(&self) -> PasswordStoreData {
        self.store.get()
    }

    pub async fn update(&self, f: impl FnOnce(&mut PasswordStoreData) + Send) -> Result<()> {
        self.store.update(f).await.map(|_| ())
    }

    /// The password actually used to encrypt keys under the current scheme
    pub fn transform_password(&self, password: &str) -> ExtensionResult<String> {
        let data = self.data();
        if data.is_hashed {
            let salt = data
                .salt
                .ok_or_else(|| ExtensionError::auth("Password salt has not been generated yet"))?;
            Ok(crypto::hash_password(password, &salt, self.hash_rounds))
        } else if data.is_trimmed {
            Ok(password.trim().to_string())
        } else {
            Ok(password.to_string())
        }
    }

    /// Hash with the stored salt
    pub fn get_hashed_password(&self, password: &str) -> ExtensionResult<String> {
        let salt = self
            .data()
            .salt
            .ok_or_else(|| ExtensionError::auth("Password salt has not been generated yet"))?;
        Ok(crypto::hash_password(password, &salt, self.hash_rounds))
    }

    /// Hash with a new salt. Returns `(hashed, salt)`; nothing is stored.
    pub fn create_password(&self, password: &str) -> (String, String) {
        let salt = crypto::generate_salt();
        (crypto::hash_password(password, &salt, self.hash_rounds), salt)
    }

    pub fn create_auth_secret(&self, transformed: &str) -> ExtensionResult<AuthSecret> {
        let secret = crypto::random_hex(32);
        let check = crypto::seal(transformed, CHECK_LABEL, secret.as_bytes())?;
        Ok(AuthSecret {
            secret,
            check: hex::encode(check),
        })
    }

    pub async fn setup_auth_secret(&self, transformed: &str) -> ExtensionResult<()> {
        let AuthSecret { secret, check } = self.create_auth_secret(transformed)?;
        self.update(|data| {
            data.secret = Some(secret);
            data.check = Some(check);
        })
        .await?;
        Ok(())
    }

    pub fn has_auth_secret(&self) -> bool {
        let data = self.data();
        data.secret.is_some() && data.check.is_some()
    }

    /// Verify `password` against the stored verifier and unlock the session
    pub fn authenticate(&self, password: &str) -> ExtensionResult<()> {
        let transformed = self.transform_password(password)?;
        self.verify_transformed(&transformed)?;
        self.set_password(transformed);
        Ok(())
    }

    pub fn verify_transformed(&self, transformed: &str) -> ExtensionResult<()> {
        let data = self.data();
        let (Some(secret), Some(check)) = (data.secret, data.check) else {
            return Err(ExtensionError::auth("No password verifier set up"));
        };

        let check = hex::decode(check).map_err(|_| ExtensionError::auth("Corrupt password verifier"))?;
        let decrypted = crypto::open(transformed, CHECK_LABEL, &check)
            .map_err(|_| ExtensionError::auth("Incorrect password"))?;

        if !crypto::constant_time_eq(&decrypted, secret.as_bytes()) {
            return Err(ExtensionError::auth("Incorrect password"));
        }
        Ok(())
    }

    /// Compare against the unlocked session without changing any state
    pub fn check_password(&self, password: &str) -> ExtensionResult<()> {
        let Some(session) = self.get_password() else {
            return Err(ExtensionError::auth("Unauthorised"));
        };
        let transformed = self.transform_password(password)?;
        if !crypto::constant_time_eq(transformed.as_bytes(), session.as_bytes()) {
            return Err(ExtensionError::auth("Incorrect password"));
        }
        Ok(())
    }

    pub fn set_password(&self, transformed: String) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(transformed);
        self.logged_in.send_replace(LoggedIn::True);
    }

    pub fn get_password(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_password(&self) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.logged_in.send_replace(LoggedIn::False);
    }

    pub fn is_logged_in(&self) -> LoggedIn {
        *self.logged_in.borrow()
    }

    pub fn subscribe_logged_in(&self) -> watch::Receiver<LoggedIn> {
        self.logged_in.subscribe()
    }

    /// Forget the scheme state and the session
    pub async fn reset(&self) -> Result<()> {
        self.clear_password();
        self.store.clear().await
    }
}
