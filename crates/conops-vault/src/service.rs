// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The credential vault: authenticated encryption of deploy keys at rest.
//!
//! The vault holds the 32-byte master key in memory for the process lifetime.
//! Callers never see the raw key; plaintext buffers handed out are wrapped in
//! [`Zeroizing`] so they are wiped when dropped.

use std::path::Path;

use conops_core::ConopsError;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto;
use crate::keyfile;

/// The unlocked credential vault.
///
/// Debug output intentionally omits the key.
pub struct CredentialVault {
    /// The encryption key -- only in memory, never logged.
    key: Zeroizing<[u8; 32]>,
    /// Where the key came from (`config` or `file:<path>`), for startup logs.
    source: String,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("key", &"[REDACTED]")
            .field("source", &self.source)
            .finish()
    }
}

impl CredentialVault {
    /// Bootstrap the vault key.
    ///
    /// An explicit `encryption_key` (raw 32 bytes or base64 of 32 bytes) wins;
    /// otherwise the key file at `key_file_path` is read, or generated on
    /// first run.
    pub fn bootstrap(
        encryption_key: Option<&str>,
        key_file_path: &Path,
    ) -> Result<Self, ConopsError> {
        if let Some(value) = encryption_key.map(str::trim).filter(|v| !v.is_empty()) {
            let key = keyfile::parse_key(value, "credentials.encryption_key")?;
            debug!("vault key loaded from configuration");
            return Ok(Self {
                key,
                source: "config".to_string(),
            });
        }

        let (key, source) = keyfile::load_or_create_key_file(key_file_path)?;
        debug!(source = %source, "vault key loaded");
        Ok(Self { key, source })
    }

    /// Build a vault from explicit key bytes. Exposed for tests.
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
            source: "static".to_string(),
        }
    }

    /// Where the encryption key was loaded from.
    pub fn key_source(&self) -> &str {
        &self.source
    }

    /// Seal plaintext, returning `(ciphertext_with_tag, nonce)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; 12]), ConopsError> {
        crypto::seal(&self.key, plaintext)
    }

    /// Open ciphertext sealed by [`encrypt`](Self::encrypt). Authentication
    /// failure (tampering, wrong nonce) is a [`ConopsError::Vault`].
    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, ConopsError> {
        let nonce: [u8; 12] = nonce
            .try_into()
            .map_err(|_| ConopsError::Vault("corrupted nonce (expected 12 bytes)".to_string()))?;
        let plaintext = crypto::open(&self.key, &nonce, ciphertext)?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_prefers_the_configured_key() {
        let dir = tempdir().unwrap();
        let key_file = dir.path().join("unused.key");
        let vault = CredentialVault::bootstrap(
            Some("0123456789abcdef0123456789abcdef"),
            &key_file,
        )
        .unwrap();
        assert_eq!(vault.key_source(), "config");
        assert!(!key_file.exists(), "key file must not be created when config wins");
    }

    #[test]
    fn bootstrap_falls_back_to_the_key_file() {
        let dir = tempdir().unwrap();
        let key_file = dir.path().join("conops-encryption.key");
        let vault = CredentialVault::bootstrap(None, &key_file).unwrap();
        assert!(vault.key_source().starts_with("file:"));
        assert!(key_file.exists());

        // A second bootstrap decrypts what the first one sealed.
        let (ciphertext, nonce) = vault.encrypt(b"deploy key material").unwrap();
        let vault2 = CredentialVault::bootstrap(None, &key_file).unwrap();
        let plaintext = vault2.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(&plaintext[..], b"deploy key material");
    }

    #[test]
    fn encrypt_decrypt_roundtrip_and_tamper_detection() {
        let vault = CredentialVault::with_key([9u8; 32]);
        let (mut ciphertext, nonce) = vault.encrypt(b"secret").unwrap();

        let plaintext = vault.decrypt(&ciphertext, &nonce).unwrap();
        assert_eq!(&plaintext[..], b"secret");

        ciphertext[0] ^= 0xff;
        assert!(vault.decrypt(&ciphertext, &nonce).is_err());
    }

    #[test]
    fn decrypt_rejects_malformed_nonce() {
        let vault = CredentialVault::with_key([9u8; 32]);
        let (ciphertext, _) = vault.encrypt(b"secret").unwrap();
        assert!(vault.decrypt(&ciphertext, &[0u8; 8]).is_err());
    }

    #[test]
    fn debug_redacts_the_key() {
        let vault = CredentialVault::with_key([3u8; 32]);
        let rendered = format!("{vault:?}");
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains('\u{3}'));
    }
}
