use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use super::{StorageBackend, Store};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Onboarded {
    True,
    #[default]
    False,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppStoreData {
    #[serde(default)]
    pub onboarded: Onboarded,
    /// Wallet was created from an imported phrase
    #[serde(default)]
    pub imported: bool,
}

pub struct AppStore {
    store: Store<AppStoreData>,
}

impl AppStore {
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Ok(Self {
            store: Store::load("app", backend).await?,
        })
    }

    pub fn onboarded(&self) -> Onboarded {
        self.store.get().onboarded
    }

    pub fn get_is_onboarded(&self) -> bool {
        self.onboarded() == Onboarded::True
    }

    pub async fn set_onboarded(&self, imported: bool) -> Result<Onboarded> {
        let data = self
            .store
            .update(|data| {
                data.onboarded = Onboarded::True;
                data.imported = imported;
            })
            .await?;
        Ok(data.onboarded)
    }

    pub async fn set_not_onboarded(&self) -> Result<()> {
        self.store
            .update(|data| {
                data.onboarded = Onboarded::False;
                data.imported = false;
            })
            .await?;
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<AppStoreData> {
        self.store.subscribe()
    }
}
