//! Persistent key/value storage and the typed stores built on it

pub mod app;
pub mod password;
pub mod seed_phrase;
pub mod sites;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::config::AuthConfig;

pub use app::{AppStore, Onboarded};
pub use password::{LoggedIn, PasswordStore};
pub use seed_phrase::SeedPhraseStore;
pub use sites::{strip_url, AuthorizedSite, SitesStore};

/// `chrome.storage.local`-style backend
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.items().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.items().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.items().remove(key);
        Ok(())
    }
}

/// One typed value persisted under a single key, with a watch stream of
/// full snapshots.
pub struct Store<T> {
    key: &'static str,
    backend: Arc<dyn StorageBackend>,
    snapshot: watch::Sender<T>,
    // Serializes read-modify-write cycles
    write: tokio::sync::Mutex<()>,
}

impl<T> Store<T>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send + Sync,
{
    pub async fn load(key: &'static str, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let value = match backend.get(key).await? {
            Some(raw) => serde_json::from_value(raw)
                .with_context(|| format!("Corrupt data in store '{}'", key))?,
            None => T::default(),
        };
        let (snapshot, _) = watch::channel(value);

        Ok(Self {
            key,
            backend,
            snapshot,
            write: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self) -> T {
        self.snapshot.borrow().clone()
    }

    /// Apply a partial update and persist the result
    pub async fn update(&self, f: impl FnOnce(&mut T) + Send) -> Result<T> {
        let _write = self.write.lock().await;
        let mut next = self.get();
        f(&mut next);

        let raw = serde_json::to_value(&next)
            .with_context(|| format!("Failed to encode store '{}'", self.key))?;
        self.backend
            .set(self.key, raw)
            .await
            .with_context(|| format!("Failed to persist store '{}'", self.key))?;

        self.snapshot.send_replace(next.clone());
        Ok(next)
    }

    pub async fn clear(&self) -> Result<()> {
        let _write = self.write.lock().await;
        self.backend
            .remove(self.key)
            .await
            .with_context(|| format!("Failed to clear store '{}'", self.key))?;
        self.snapshot.send_replace(T::default());
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.snapshot.subscribe()
    }
}

/// Every persisted store, constructed once per process
pub struct Stores {
    pub app: AppStore,
    pub password: PasswordStore,
    pub seed_phrase: SeedPhraseStore,
    pub sites: SitesStore,
}

impl Stores {
    pub async fn load(backend: Arc<dyn StorageBackend>, auth: &AuthConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            app: AppStore::load(backend.clone()).await?,
            password: PasswordStore::load(backend.clone(), auth.hash_rounds).await?,
            seed_phrase: SeedPhraseStore::load(backend.clone()).await?,
            sites: SitesStore::load(backend).await?,
        }))
    }
}
