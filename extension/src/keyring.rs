//! Keyring capability: password-encrypted account keys
//!
//! The control plane only needs the contract below (add, enumerate, forget,
//! re-encrypt, verify, sign). `MemoryKeyring` is the in-process
//! implementation: BIP-39 seed, BIP-32 derivation, secp256k1 keys encrypted
//! at rest with the wallet password.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bip39::Mnemonic;
use bitcoin::bip32::{DerivationPath, Xpriv};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use sha3::Keccak256;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::crypto;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Native segwit account
    Primary,
    Ethereum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccountOrigin {
    /// Created from a phrase the user imported
    SeedStored,
    /// Created from a phrase the wallet generated
    Generated,
    Derived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMeta {
    pub name: String,
    pub origin: AccountOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub address: String,
    pub key_type: KeyType,
    pub meta: AccountMeta,
}

#[async_trait]
pub trait Keyring: Send + Sync {
    /// All accounts in creation order
    async fn accounts(&self) -> Result<Vec<Account>>;

    /// Derive an account from `mnemonic` at `derivation_path` and store its
    /// key encrypted with `password`.
    async fn add_uri(
        &self,
        mnemonic: &str,
        derivation_path: &str,
        key_type: KeyType,
        password: &str,
        meta: AccountMeta,
    ) -> Result<Account>;

    async fn forget_account(&self, address: &str) -> Result<()>;

    /// Unlock then immediately lock `address`; fails on a wrong password
    async fn unlock_check(&self, address: &str, password: &str) -> Result<()>;

    /// Decrypt the account key with `from` and store it encrypted with `to`
    async fn reencrypt(&self, address: &str, from: &str, to: &str) -> Result<()>;

    /// Encrypted key material as stored
    async fn encrypted(&self, address: &str) -> Result<Option<Vec<u8>>>;

    /// Sign `data`, returning a `0x`-prefixed compact signature
    async fn sign(&self, address: &str, data: &[u8], password: &str) -> Result<String>;
}

struct StoredPair {
    account: Account,
    encrypted: Vec<u8>,
}

#[derive(Default)]
pub struct MemoryKeyring {
    pairs: Mutex<Vec<StoredPair>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    fn pairs(&self) -> MutexGuard<'_, Vec<StoredPair>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decrypt_key(&self, address: &str, password: &str) -> Result<(KeyType, SecretKey)> {
        let pairs = self.pairs();
        let pair = pairs
            .iter()
            .find(|p| p.account.address == address)
            .ok_or_else(|| anyhow!("Unable to find account {}", address))?;

        let secret = crypto::decrypt(password, address, &pair.encrypted)?;
        let key = SecretKey::from_slice(&secret).context("Corrupt key material")?;
        Ok((pair.account.key_type, key))
    }
}

/// Derive the secret key at `path` for a BIP-39 phrase
pub fn derive_secret_key(mnemonic: &str, path: &str) -> Result<SecretKey> {
    let mnemonic = Mnemonic::parse(mnemonic).context("Invalid mnemonic")?;
    let seed = mnemonic.to_seed("");
    let secp = Secp256k1::new();

    let master = Xpriv::new_master(Network::Bitcoin, &seed).context("Failed to derive master key")?;
    let path = DerivationPath::from_str(path).context("Invalid derivation path")?;
    let child = master
        .derive_priv(&secp, &path)
        .context("Failed to derive child key")?;

    Ok(child.private_key)
}

pub fn address_for(key_type: KeyType, key: &SecretKey) -> String {
    let secp = Secp256k1::new();
    let pubkey = key.public_key(&secp);

    match key_type {
        KeyType::Primary => {
            let compressed = bitcoin::CompressedPublicKey(pubkey);
            bitcoin::Address::p2wpkh(&compressed, Network::Bitcoin).to_string()
        }
        KeyType::Ethereum => {
            // Keccak256 of the 64-byte public key, last 20 bytes
            let uncompressed = pubkey.serialize_uncompressed();
            let hash = Keccak256::digest(&uncompressed[1..]);
            format!("0x{}", hex::encode(&hash[12..]))
        }
    }
}

fn message_digest(key_type: KeyType, data: &[u8]) -> [u8; 32] {
    match key_type {
        KeyType::Primary => sha256::Hash::hash(data).to_byte_array(),
        KeyType::Ethereum => {
            // EIP-191 personal message
            let mut hasher = Keccak256::new();
            hasher.update(format!("\x19Ethereum Signed Message:\n{}", data.len()).as_bytes());
            hasher.update(data);
            hasher.finalize().into()
        }
    }
}

#[async_trait]
impl Keyring for MemoryKeyring {
    async fn accounts(&self) -> Result<Vec<Account>> {
        Ok(self.pairs().iter().map(|p| p.account.clone()).collect())
    }

    async fn add_uri(
        &self,
        mnemonic: &str,
        derivation_path: &str,
        key_type: KeyType,
        password: &str,
        meta: AccountMeta,
    ) -> Result<Account> {
        let key = derive_secret_key(mnemonic, derivation_path)?;
        let address = address_for(key_type, &key);
        let encrypted = crypto::encrypt(password, &address, &key.secret_bytes())?;

        let mut pairs = self.pairs();
        if pairs.iter().any(|p| p.account.address == address) {
            anyhow::bail!("Account {} already exists", address);
        }

        let account = Account {
            address,
            key_type,
            meta,
        };
        pairs.push(StoredPair {
            account: account.clone(),
            encrypted,
        });
        tracing::info!("Added {:?} account {}", key_type, account.address);
        Ok(account)
    }

    async fn forget_account(&self, address: &str) -> Result<()> {
        let mut pairs = self.pairs();
        let before = pairs.len();
        pairs.retain(|p| p.account.address != address);
        if pairs.len() == before {
            anyhow::bail!("Unable to find account {}", address);
        }
        Ok(())
    }

    async fn unlock_check(&self, address: &str, password: &str) -> Result<()> {
        self.decrypt_key(address, password).map(|_| ())
    }

    async fn reencrypt(&self, address: &str, from: &str, to: &str) -> Result<()> {
        let (_, key) = self.decrypt_key(address, from)?;
        let encrypted = crypto::encrypt(to, address, &key.secret_bytes())?;

        let mut pairs = self.pairs();
        let pair = pairs
            .iter_mut()
            .find(|p| p.account.address == address)
            .ok_or_else(|| anyhow!("Unable to find account {}", address))?;
        pair.encrypted = encrypted;
        Ok(())
    }

    async fn encrypted(&self, address: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .pairs()
            .iter()
            .find(|p| p.account.address == address)
            .map(|p| p.encrypted.clone()))
    }

    async fn sign(&self, address: &str, data: &[u8], password: &str) -> Result<String> {
        let (key_type, key) = self.decrypt_key(address, password)?;
        let secp = Secp256k1::signing_only();
        let message = Message::from_digest(message_digest(key_type, data));
        let signature = secp.sign_ecdsa(&message, &key);
        Ok(format!("0x{}", hex::encode(signature.serialize_compact())))
    }
}
