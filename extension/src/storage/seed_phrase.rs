use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{StorageBackend, Store};
use crate::crypto;

const SEED_LABEL: &str = "seed-phrase";

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SeedPhraseData {
    /// Base64 AES-GCM ciphertext of the phrase
    #[serde(default)]
    pub cipher: Option<String>,
    /// User has backed the phrase up
    #[serde(default)]
    pub confirmed: bool,
}

pub fn encrypt_seed(seed: &str, password: &str) -> Result<String> {
    let ciphertext = crypto::encrypt(password, SEED_LABEL, seed.as_bytes())?;
    Ok(STANDARD.encode(ciphertext))
}

pub fn decrypt_seed(cipher: &str, password: &str) -> Result<String> {
    let ciphertext = STANDARD.decode(cipher).context("Corrupt seed cipher")?;
    let seed = crypto::decrypt(password, SEED_LABEL, &ciphertext)?;
    String::from_utf8(seed).context("Seed phrase is not valid UTF-8")
}

pub struct SeedPhraseStore {
    store: Store<SeedPhraseData>,
}

impl SeedPhraseStore {
    pub async fn load(backend: Arc<dyn StorageBackend>) -> Result<Self> {
        Ok(Self {
            store: Store::load("seeds", backend).await?,
        })
    }

    pub async fn add(&self, seed: &str, password: &str, confirmed: bool) -> Result<()> {
        let cipher = encrypt_seed(seed, password)?;
        self.store
            .update(|data| {
                data.cipher = Some(cipher);
                data.confirmed = confirmed;
            })
            .await?;
        Ok(())
    }

    pub async fn get_seed(&self, password: &str) -> Result<String> {
        let cipher = self.cipher().context("No seed phrase stored")?;
        decrypt_seed(&cipher, password)
    }

    pub fn cipher(&self) -> Option<String> {
        self.store.get().cipher
    }

    pub async fn set_cipher(&self, cipher: String) -> Result<()> {
        self.store.update(|data| data.cipher = Some(cipher)).await?;
        Ok(())
    }

    pub fn is_confirmed(&self) -> bool {
        self.store.get().confirmed
    }

    pub async fn set_confirmed(&self, confirmed: bool) -> Result<()> {
        self.store.update(|data| data.confirmed = confirmed).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }
}
