//! Password scheme migrations (v1 raw password <-> v2 salted hash)
//!
//! Keys and the seed cipher are re-encrypted one by one. A failure part way
//! through re-encrypts whatever already moved back to the old password, and
//! the scheme marker is only written after everything succeeded.

use anyhow::{Context, Result};

use super::Credentials;
use crate::keyring::Keyring;
use crate::storage::password::AuthSecret;
use crate::storage::seed_phrase::{decrypt_seed, encrypt_seed};
use crate::storage::SeedPhraseStore;

/// Move every key and the seed phrase from password `from` to `to`, or
/// leave all of them on `from`.
pub(crate) async fn reencrypt_everything(
    keyring: &dyn Keyring,
    seeds: &SeedPhraseStore,
    from: &str,
    to: &str,
) -> Result<()> {
    let accounts = keyring.accounts().await?;
    let mut migrated: Vec<String> = Vec::with_capacity(accounts.len());

    let result = async {
        for account in &accounts {
            keyring
                .reencrypt(&account.address, from, to)
                .await
                .with_context(|| format!("Failed to re-encrypt {}", account.address))?;
            migrated.push(account.address.clone());
        }

        if let Some(cipher) = seeds.cipher() {
            let seed = decrypt_seed(&cipher, from).context("Failed to decrypt seed phrase")?;
            seeds.set_cipher(encrypt_seed(&seed, to)?).await?;
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Err(e) = result {
        for address in migrated.iter().rev() {
            if let Err(rollback) = keyring.reencrypt(address, to, from).await {
                tracing::error!("Failed to roll back {}: {:#}", address, rollback);
            }
        }
        return Err(e);
    }
    Ok(())
}

impl Credentials {
    /// Upgrade a version 1 wallet to the salted-hash scheme
    pub async fn migrate_password_forward(&self, plaintext: &str) -> bool {
        let _guard = self.mutation.lock().await;
        let password = &self.stores.password;

        let data = password.data();
        if data.password_version >= 2 && data.is_hashed {
            tracing::warn!("Password scheme is already version {}", data.password_version);
            return false;
        }

        let current = match password.transform_password(plaintext) {
            Ok(current) => current,
            Err(e) => {
                tracing::error!("Error migrating password: {}", e);
                return false;
            }
        };
        let (hashed, salt) = password.create_password(plaintext);

        if let Err(e) =
            reencrypt_everything(self.keyring.as_ref(), &self.stores.seed_phrase, &current, &hashed)
                .await
        {
            tracing::error!("Error migrating password: {:#}", e);
            return false;
        }

        let committed = async {
            let AuthSecret { secret, check } = password.create_auth_secret(&hashed)?;
            password
                .update(|data| {
                    data.password_version = 2;
                    data.is_hashed = true;
                    data.is_trimmed = false;
                    data.salt = Some(salt);
                    data.secret = Some(secret);
                    data.check = Some(check);
                })
                .await?;
            Ok::<(), crate::error::ExtensionError>(())
        }
        .await;

        match committed {
            Ok(()) => {
                password.set_password(hashed);
                tracing::info!("Password migrated to version 2");
                true
            }
            Err(e) => {
                tracing::error!("Failed to record password migration: {}", e);
                self.rollback_keys(&hashed, &current).await;
                false
            }
        }
    }

    /// Return a version 2 wallet to the raw-password scheme
    pub async fn migrate_password_backward(&self, plaintext: &str) -> bool {
        let _guard = self.mutation.lock().await;
        let password = &self.stores.password;

        let hashed = match password.get_hashed_password(plaintext) {
            Ok(hashed) => hashed,
            Err(e) => {
                tracing::error!("Error migrating password: {}", e);
                return false;
            }
        };

        if let Err(e) =
            reencrypt_everything(self.keyring.as_ref(), &self.stores.seed_phrase, &hashed, plaintext)
                .await
        {
            tracing::error!("Error migrating keypair passwords: {:#}", e);
            return false;
        }

        // Verifier is dropped; the next login re-establishes it from the keys
        let committed = password
            .update(|data| {
                data.password_version = 1;
                data.is_hashed = false;
                data.is_trimmed = false;
                data.salt = None;
                data.secret = None;
                data.check = None;
            })
            .await;

        match committed {
            Ok(()) => {
                password.set_password(plaintext.to_string());
                tracing::info!("Password migrated to version 1");
                true
            }
            Err(e) => {
                tracing::error!("Failed to record password migration: {:#}", e);
                self.rollback_keys(plaintext, &hashed).await;
                false
            }
        }
    }

    async fn rollback_keys(&self, from: &str, to: &str) {
        if let Err(e) =
            reencrypt_everything(self.keyring.as_ref(), &self.stores.seed_phrase, from, to).await
        {
            tracing::error!("Rollback after failed migration did not complete: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::keyring::Keyring;
    use crate::storage::seed_phrase::encrypt_seed;
    use crate::testing;

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    async fn keystore(keyring: &dyn Keyring) -> Vec<Vec<u8>> {
        let mut bytes = Vec::new();
        for account in keyring.accounts().await.unwrap() {
            bytes.push(keyring.encrypted(&account.address).await.unwrap().unwrap());
        }
        bytes
    }

    #[tokio::test]
    async fn test_forward_then_backward_is_byte_identical() {
        let env = testing::legacy_wallet("legacy", PHRASE).await;
        let keys_before = keystore(env.keyring.as_ref()).await;
        let seed_before = env.stores.seed_phrase.cipher();
        assert_eq!(env.stores.password.data().password_version, 1);

        assert!(env.credentials.migrate_password_forward("legacy").await);
        let data = env.stores.password.data();
        assert_eq!(data.password_version, 2);
        assert!(data.is_hashed);
        assert_ne!(keystore(env.keyring.as_ref()).await, keys_before);

        env.credentials.lock();
        assert!(env.credentials.authenticate("legacy").await);

        assert!(env.credentials.migrate_password_backward("legacy").await);
        assert_eq!(keystore(env.keyring.as_ref()).await, keys_before);
        assert_eq!(env.stores.seed_phrase.cipher(), seed_before);
        let data = env.stores.password.data();
        assert_eq!(data.password_version, 1);
        assert_eq!(data.salt, None);

        env.credentials.lock();
        assert!(env.credentials.authenticate("legacy").await);
    }

    #[tokio::test]
    async fn test_failure_part_way_reverts_earlier_entries() {
        let env = testing::legacy_wallet("legacy", PHRASE).await;
        let keys_before = keystore(env.keyring.as_ref()).await;
        let seed_before = env.stores.seed_phrase.cipher();
        let data_before = env.stores.password.data();

        env.keyring.fail_reencrypt_at(2);
        assert!(!env.credentials.migrate_password_forward("legacy").await);

        assert_eq!(keystore(env.keyring.as_ref()).await, keys_before);
        assert_eq!(env.stores.seed_phrase.cipher(), seed_before);
        assert_eq!(env.stores.password.data(), data_before);
    }

    #[tokio::test]
    async fn test_seed_failure_after_all_keys_reverts_keys() {
        let env = testing::legacy_wallet("legacy", PHRASE).await;
        // Seed cipher the current password cannot open
        let foreign = encrypt_seed(PHRASE, "someone else").unwrap();
        env.stores.seed_phrase.set_cipher(foreign.clone()).await.unwrap();
        let keys_before = keystore(env.keyring.as_ref()).await;
        let data_before = env.stores.password.data();

        assert!(!env.credentials.migrate_password_forward("legacy").await);

        assert_eq!(keystore(env.keyring.as_ref()).await, keys_before);
        assert_eq!(env.stores.seed_phrase.cipher(), Some(foreign));
        assert_eq!(env.stores.password.data(), data_before);
        assert_eq!(env.stores.password.data().password_version, 1);

        // Keys still open with the old password
        for account in env.keyring.accounts().await.unwrap() {
            env.keyring.unlock_check(&account.address, "legacy").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wrong_password_migrates_nothing() {
        let env = testing::legacy_wallet("legacy", PHRASE).await;
        let keys_before = keystore(env.keyring.as_ref()).await;

        assert!(!env.credentials.migrate_password_forward("not it").await);
        assert_eq!(keystore(env.keyring.as_ref()).await, keys_before);
        assert_eq!(env.stores.password.data().password_version, 1);
    }

    #[tokio::test]
    async fn test_backward_failure_keeps_version_2() {
        let env = testing::legacy_wallet("legacy", PHRASE).await;
        assert!(env.credentials.migrate_password_forward("legacy").await);
        let keys_before = keystore(env.keyring.as_ref()).await;

        env.keyring.fail_reencrypt_at(2);
        assert!(!env.credentials.migrate_password_backward("legacy").await);

        assert_eq!(keystore(env.keyring.as_ref()).await, keys_before);
        assert_eq!(env.stores.password.data().password_version, 2);
    }
}
