//! Vault key material and primitives.
//!
//! Originals are encrypted with AES-256-GCM (random 96-bit nonce, nonce
//! prepended to the ciphertext, base64-encoded at rest). Deduplication uses
//! a keyed HMAC-SHA-256 over (kind, original) so equal values collide only
//! under the same key. Key material zeroizes on drop.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::VaultError;

type HmacSha256 = Hmac<Sha256>;

/// Size of the AES-GCM nonce in bytes.
const NONCE_LEN: usize = 12;

/// Master key material for a vault instance.
pub struct VaultKeys {
    enc: [u8; 32],
    mac: [u8; 32],
}

impl VaultKeys {
    /// Derive encryption and MAC keys from a 32-byte master secret.
    ///
    /// Domain-separated HMAC expansion so the two keys are independent.
    pub fn from_master(master: &[u8; 32]) -> Self {
        let enc = derive(master, b"riskgate.vault.enc");
        let mac = derive(master, b"riskgate.vault.mac");
        Self { enc, mac }
    }

    /// Parse a 64-char hex master key (the `RISKGATE_VAULT_KEY` format).
    pub fn from_hex(hex_key: &str) -> Result<Self, VaultError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| VaultError::Unavailable(format!("bad vault key hex: {e}")))?;
        let master: [u8; 32] = bytes
            .try_into()
            .map_err(|_| VaultError::Unavailable("vault key must be 32 bytes".into()))?;
        Ok(Self::from_master(&master))
    }

    /// Fresh random key material for ephemeral (in-memory) vaults.
    pub fn random() -> Result<Self, VaultError> {
        let mut master = [0u8; 32];
        getrandom::fill(&mut master)
            .map_err(|e| VaultError::Unavailable(format!("entropy unavailable: {e}")))?;
        let keys = Self::from_master(&master);
        master.zeroize();
        Ok(keys)
    }

    /// Keyed dedup hash over (kind, original), hex-encoded.
    pub fn value_hash(&self, kind: &str, original: &str) -> String {
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.mac).expect("hmac accepts any key length");
        mac.update(kind.as_bytes());
        mac.update(&[0x1f]);
        mac.update(original.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Encrypt an original value; returns base64(nonce || ciphertext).
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Unavailable("encryption failed".into()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a base64(nonce || ciphertext) blob.
    pub fn decrypt(&self, encoded: &str) -> Result<String, VaultError> {
        let blob = BASE64
            .decode(encoded)
            .map_err(|_| VaultError::Decrypt("bad base64".into()))?;
        if blob.len() < NONCE_LEN {
            return Err(VaultError::Decrypt("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| VaultError::Decrypt("authentication failed".into()))?;
        String::from_utf8(plaintext).map_err(|_| VaultError::Decrypt("invalid utf-8".into()))
    }
}

impl Drop for VaultKeys {
    fn drop(&mut self) {
        self.enc.zeroize();
        self.mac.zeroize();
    }
}

fn derive(master: &[u8; 32], label: &[u8]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master).expect("hmac accepts any key length");
    mac.update(label);
    mac.finalize().into_bytes().into()
}

/// Generate a random master key encoded as lowercase hex.
pub fn generate_hex_key() -> Result<String, VaultError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|e| VaultError::Unavailable(format!("entropy unavailable: {e}")))?;
    let encoded = hex::encode(bytes);
    bytes.zeroize();
    Ok(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let keys = VaultKeys::random().unwrap();
        let ct = keys.encrypt("alice@example.com").unwrap();
        assert_ne!(ct, "alice@example.com");
        assert_eq!(keys.decrypt(&ct).unwrap(), "alice@example.com");
    }

    #[test]
    fn test_nonces_differ_per_encryption() {
        let keys = VaultKeys::random().unwrap();
        let a = keys.encrypt("same").unwrap();
        let b = keys.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_rejects_tampering() {
        let keys = VaultKeys::random().unwrap();
        let ct = keys.encrypt("secret").unwrap();
        let mut blob = BASE64.decode(&ct).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        let tampered = BASE64.encode(blob);
        assert!(keys.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_value_hash_is_keyed_and_kind_scoped() {
        let keys = VaultKeys::random().unwrap();
        let other = VaultKeys::random().unwrap();
        let h1 = keys.value_hash("email", "alice@example.com");
        assert_eq!(h1, keys.value_hash("email", "alice@example.com"));
        assert_ne!(h1, keys.value_hash("phone_number", "alice@example.com"));
        assert_ne!(h1, other.value_hash("email", "alice@example.com"));
    }

    #[test]
    fn test_from_hex_roundtrip() {
        let hex_key = generate_hex_key().unwrap();
        let keys = VaultKeys::from_hex(&hex_key).unwrap();
        let again = VaultKeys::from_hex(&hex_key).unwrap();
        let ct = keys.encrypt("v").unwrap();
        assert_eq!(again.decrypt(&ct).unwrap(), "v");
    }

    #[test]
    fn test_from_hex_rejects_wrong_length() {
        assert!(VaultKeys::from_hex("abcd").is_err());
        assert!(VaultKeys::from_hex("zz").is_err());
    }
}
