//! Password hashing and symmetric encryption helpers
//!
//! `encrypt`/`decrypt` are AES-256-GCM with key and nonce both derived from
//! the password and a label. The output is deterministic: encrypting the same
//! plaintext under the same password and label always yields the same bytes,
//! so a re-encryption round trip restores byte-identical ciphertext. Each
//! label must only ever protect one plaintext per password.
//!
//! `seal`/`open` use a random nonce stored in front of the ciphertext, for
//! values that are regenerated under an unchanged password.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::Result;
use bitcoin::hashes::{sha256, Hash, HashEngine};
use rand::RngCore;

fn derive_key(password: &str, label: &str) -> [u8; 32] {
    sha256::Hash::hash(format!("key:{}:{}", label, password).as_bytes()).to_byte_array()
}

fn derive_nonce(password: &str, label: &str) -> [u8; 12] {
    let hash = sha256::Hash::hash(format!("nonce:{}:{}", label, password).as_bytes());
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&hash.as_byte_array()[..12]);
    nonce
}

pub fn encrypt(password: &str, label: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&derive_key(password, label).into());
    let nonce = derive_nonce(password, label);

    cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow::anyhow!("Encryption failed: {:?}", e))
}

/// Fails when the password (or label) is wrong
pub fn decrypt(password: &str, label: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&derive_key(password, label).into());
    let nonce = derive_nonce(password, label);

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("Unable to decrypt, wrong password"))
}

const NONCE_LEN: usize = 12;

/// Encrypt under a fresh random nonce. Output is `nonce || ciphertext`.
pub fn seal(password: &str, label: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(&derive_key(password, label).into());

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| anyhow::anyhow!("Encryption failed: {:?}", e))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(password: &str, label: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        anyhow::bail!("Sealed value is too short");
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(&derive_key(password, label).into());

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow::anyhow!("Unable to decrypt, wrong password"))
}

/// Iterated salted SHA-256, hex encoded
pub fn hash_password(password: &str, salt: &str, rounds: u32) -> String {
    let mut input = Vec::with_capacity(salt.len() + password.len());
    input.extend_from_slice(salt.as_bytes());
    input.extend_from_slice(password.as_bytes());

    let mut digest = sha256::Hash::hash(&input).to_byte_array();
    for _ in 1..rounds {
        let mut engine = sha256::Hash::engine();
        engine.input(&digest);
        engine.input(salt.as_bytes());
        digest = sha256::Hash::from_engine(engine).to_byte_array();
    }
    hex::encode(digest)
}

pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn generate_salt() -> String {
    random_hex(16)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_is_deterministic() {
        let first = encrypt("pw", "acct", b"secret").unwrap();
        let second = encrypt("pw", "acct", b"secret").unwrap();
        assert_eq!(first, second);
        assert_ne!(first, encrypt("pw", "other", b"secret").unwrap());
        assert_eq!(decrypt("pw", "acct", &first).unwrap(), b"secret");
    }

    #[test]
    fn test_wrong_password_fails() {
        let ciphertext = encrypt("right", "acct", b"secret").unwrap();
        assert!(decrypt("wrong", "acct", &ciphertext).is_err());
    }

    #[test]
    fn test_sealed_values_never_share_a_nonce() {
        let first = seal("pw", "check", b"secret-a").unwrap();
        let second = seal("pw", "check", b"secret-b").unwrap();

        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_eq!(open("pw", "check", &first).unwrap(), b"secret-a");
        assert_eq!(open("pw", "check", &second).unwrap(), b"secret-b");
        assert!(open("other", "check", &first).is_err());
        assert!(open("pw", "check", &first[..4]).is_err());
    }

    #[test]
    fn test_hash_depends_on_salt_and_rounds() {
        let a = hash_password("pw", "salt-a", 4);
        assert_eq!(a, hash_password("pw", "salt-a", 4));
        assert_ne!(a, hash_password("pw", "salt-b", 4));
        assert_ne!(a, hash_password("pw", "salt-a", 5));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
