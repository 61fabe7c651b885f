// Reversible encryption of secrets at rest (config passwords, disk cache records)

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

const NONCE_SIZE: usize = 12;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

type HmacSha256 = Hmac<Sha256>;

/// Symmetric crypter keyed by a master key or by machine specific material.
///
/// Nonces are derived from the plaintext (HMAC of the key over the input), so
/// encoding is deterministic: `encode(decode(c)) == c` for every ciphertext
/// produced here, and re-encrypting an unchanged config leaves it unchanged.
#[derive(Clone)]
pub struct SecretCrypter {
    key: [u8; 32],
}

impl std::fmt::Debug for SecretCrypter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCrypter").finish_non_exhaustive()
    }
}

impl SecretCrypter {
    /// Create a crypter; an empty or absent master key falls back to the machine key
    pub fn new(master_key: Option<&str>) -> Self {
        let key = match master_key.filter(|k| !k.is_empty()) {
            Some(master) => Sha256::digest(master.as_bytes()).into(),
            None => machine_key(&machine_id()),
        };
        Self { key }
    }

    /// Encrypt plaintext into base64(nonce || ciphertext)
    pub fn encode(&self, plaintext: &str) -> Result<String> {
        let nonce_bytes = self.synthetic_nonce(plaintext.as_bytes())?;
        let cipher = self.cipher()?;
        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|err| AuthError::Internal(anyhow::anyhow!("Failed to encrypt secret: {:?}", err)))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.append(&mut ciphertext);
        Ok(STANDARD.encode(output))
    }

    /// Decrypt a value produced by [`SecretCrypter::encode`].
    ///
    /// Plaintext input yields an error; callers treat the value as unencrypted then.
    pub fn decode(&self, encoded: &str) -> Result<String> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AuthError::Validation(format!("Secret is not encoded: {}", e)))?;
        if raw.len() <= NONCE_SIZE {
            return Err(AuthError::Validation("Secret is too short to be encoded".to_string()));
        }

        let (nonce_bytes, payload) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(nonce_bytes), payload)
            .map_err(|_| AuthError::Validation("Secret could not be decrypted".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| AuthError::Validation("Decrypted secret is not UTF-8".to_string()))
    }

    /// Decode a possibly encrypted value, keeping it as is when it is plaintext
    pub fn decode_or_plain(&self, value: &str) -> String {
        match self.decode(value) {
            Ok(plain) => plain,
            Err(_) => value.to_string(),
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|err| AuthError::Internal(anyhow::anyhow!("Invalid key length: {:?}", err)))
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> Result<[u8; NONCE_SIZE]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|err| AuthError::Internal(anyhow::anyhow!("Invalid HMAC key: {:?}", err)))?;
        mac.update(plaintext);
        let tag = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&tag[..NONCE_SIZE]);
        Ok(nonce)
    }
}

/// Default key: sha256 over the hex sha256 of the lowercased machine id
fn machine_key(machine_id: &str) -> [u8; 32] {
    let inner = hex::encode(Sha256::digest(machine_id.trim().to_lowercase().as_bytes()));
    Sha256::digest(inner.as_bytes()).into()
}

fn machine_id() -> String {
    for path in MACHINE_ID_PATHS {
        if let Ok(id) = std::fs::read_to_string(path) {
            let id = id.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }

    tracing::debug!("No machine id found, deriving secret key from hostname");
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_roundtrip_with_master_key() {
        let crypter = SecretCrypter::new(Some("master"));
        let encoded = crypter.encode("p@ssw0rd").unwrap();
        assert_ne!(encoded, "p@ssw0rd");
        assert_eq!(crypter.decode(&encoded).unwrap(), "p@ssw0rd");
    }

    #[test]
    fn test_roundtrip_empty_string() {
        let crypter = SecretCrypter::new(None);
        let encoded = crypter.encode("").unwrap();
        assert_eq!(crypter.decode(&encoded).unwrap(), "");
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let crypter = SecretCrypter::new(Some("k"));
        assert_eq!(crypter.encode("secret").unwrap(), crypter.encode("secret").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let encoded = SecretCrypter::new(Some("one")).encode("secret").unwrap();
        assert!(SecretCrypter::new(Some("two")).decode(&encoded).is_err());
    }

    #[test]
    fn test_plaintext_decode_fails_gracefully() {
        let crypter = SecretCrypter::new(None);
        assert!(crypter.decode("plain password").is_err());
        assert!(crypter.decode("YWJj").is_err());
        assert_eq!(crypter.decode_or_plain("plain password"), "plain password");
    }

    #[test]
    fn test_empty_master_key_uses_machine_key() {
        let a = SecretCrypter::new(Some("")).encode("x").unwrap();
        let b = SecretCrypter::new(None).encode("x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_machine_key_normalizes_case() {
        assert_eq!(machine_key("ABCDEF\n"), machine_key("abcdef"));
        assert_ne!(machine_key("abcdef"), machine_key("abcdeg"));
    }

    proptest! {
        #[test]
        fn prop_decode_encode_roundtrip(s in ".*") {
            let crypter = SecretCrypter::new(Some("prop-key"));
            let encoded = crypter.encode(&s).unwrap();
            let decoded = crypter.decode(&encoded).unwrap();
            prop_assert_eq!(&decoded, &s);
            prop_assert_eq!(crypter.encode(&decoded).unwrap(), encoded);
        }
    }
}
