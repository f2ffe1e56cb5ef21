//! Encryption at rest for broker secrets.
//!
//! Stored values are hex encoded envelopes `version || nonce || ciphertext || tag`.
//! The version byte is authenticated as associated data, so swapping it makes
//! decryption fail instead of silently picking another key.

use std::collections::HashMap;

use zeroize::Zeroizing;

use crate::crypto::{CryptoError, NONCE_SIZE, SymmetricCipher, SymmetricKey};

const TAG_SIZE: usize = 16;

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("refusing to encrypt an empty secret")]
    EmptySecret,
    #[error("ciphertext was not produced by this vault")]
    CorruptCiphertext,
    #[error("no key registered for version {0}")]
    UnknownKeyVersion(u8),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Process-wide credential vault.
pub struct Vault {
    current: u8,
    keys: HashMap<u8, SymmetricCipher>,
}

impl Vault {
    /// Create a vault sealing new secrets with `key` tagged as `version`.
    pub fn new(version: u8, key: SymmetricKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(version, SymmetricCipher::new(key));

        Self {
            current: version,
            keys,
        }
    }

    /// Keep an older key around so secrets sealed with it stay readable.
    pub fn with_retired_key(mut self, version: u8, key: SymmetricKey) -> Self {
        if version != self.current {
            self.keys.insert(version, SymmetricCipher::new(key));
        }
        self
    }

    /// Derive every key from environment secrets.
    pub fn from_secrets(
        version: u8,
        key: &str,
        salt: &str,
        retired: &[(u8, String)],
    ) -> Result<Self, VaultError> {
        let mut vault =
            Self::new(version, SymmetricKey::derive_from_password(key, salt)?);

        for (version, key) in retired {
            vault = vault.with_retired_key(
                *version,
                SymmetricKey::derive_from_password(key, salt)?,
            );
        }

        tracing::debug!(
            current = version,
            retired = retired.len(),
            "credential vault ready"
        );

        Ok(vault)
    }

    /// Seal a secret with the current key.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        if plaintext.is_empty() {
            return Err(VaultError::EmptySecret);
        }

        let cipher = self
            .keys
            .get(&self.current)
            .ok_or(VaultError::UnknownKeyVersion(self.current))?;
        let sealed = cipher.encrypt(plaintext, &[self.current])?;

        let mut envelope = Vec::with_capacity(1 + sealed.len());
        envelope.push(self.current);
        envelope.extend_from_slice(&sealed);

        Ok(hex::encode(envelope))
    }

    /// Open a sealed secret.
    ///
    /// Any malformed input surfaces as [`VaultError::CorruptCiphertext`].
    pub fn decrypt(
        &self,
        ciphertext: &str,
    ) -> Result<Zeroizing<String>, VaultError> {
        let envelope =
            hex::decode(ciphertext).map_err(|_| VaultError::CorruptCiphertext)?;

        if envelope.len() <= 1 + NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::CorruptCiphertext);
        }

        let version = envelope[0];
        let cipher = self
            .keys
            .get(&version)
            .ok_or(VaultError::UnknownKeyVersion(version))?;

        let plain = Zeroizing::new(
            cipher
                .decrypt(&envelope[1..], &[version])
                .map_err(|_| VaultError::CorruptCiphertext)?,
        );

        String::from_utf8(plain.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| VaultError::CorruptCiphertext)
    }
}

#[cfg(test)]
pub(crate) fn test_vault() -> Vault {
    Vault::new(1, SymmetricKey::from_bytes([0x11; 32]).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let vault = test_vault();

        for secret in ["p", "broker-P@ss w0rd", "mot de passe très secret", "🔐🔐"] {
            let sealed = vault.encrypt(secret).unwrap();
            assert!(!sealed.contains(secret));
            assert_eq!(vault.decrypt(&sealed).unwrap().as_str(), secret);
        }
    }

    #[test]
    fn test_same_secret_differs() {
        let vault = test_vault();
        assert_ne!(vault.encrypt("same").unwrap(), vault.encrypt("same").unwrap());
    }

    #[test]
    fn test_empty_secret() {
        assert!(matches!(test_vault().encrypt(""), Err(VaultError::EmptySecret)));
    }

    #[test]
    fn test_wrong_key() {
        let sealed = test_vault().encrypt("secret").unwrap();
        let other = Vault::new(1, SymmetricKey::from_bytes([0x22; 32]).unwrap());

        assert!(matches!(other.decrypt(&sealed), Err(VaultError::CorruptCiphertext)));
    }

    #[test]
    fn test_truncated() {
        let vault = test_vault();
        let sealed = vault.encrypt("secret").unwrap();

        assert!(matches!(
            vault.decrypt(&sealed[..sealed.len() - 2]),
            Err(VaultError::CorruptCiphertext)
        ));
        assert!(matches!(vault.decrypt("01"), Err(VaultError::CorruptCiphertext)));
        assert!(matches!(vault.decrypt("not hex"), Err(VaultError::CorruptCiphertext)));
    }

    #[test]
    fn test_rotation() {
        let old = test_vault();
        let sealed = old.encrypt("legacy").unwrap();

        let rotated = Vault::new(2, SymmetricKey::from_bytes([0x33; 32]).unwrap())
            .with_retired_key(1, SymmetricKey::from_bytes([0x11; 32]).unwrap());

        assert_eq!(rotated.decrypt(&sealed).unwrap().as_str(), "legacy");
        assert!(rotated.encrypt("fresh").unwrap().starts_with("02"));

        // Version tag is authenticated.
        let forged = format!("02{}", &sealed[2..]);
        assert!(matches!(rotated.decrypt(&forged), Err(VaultError::CorruptCiphertext)));
        // Version without a key.
        let unknown = format!("09{}", &sealed[2..]);
        assert!(matches!(rotated.decrypt(&unknown), Err(VaultError::UnknownKeyVersion(9))));
    }
}
