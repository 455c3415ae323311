// SPDX-FileCopyrightText: 2026 ConOps Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Encryption key bootstrap.
//!
//! Priority: an explicit key from configuration (raw 32 bytes or base64 of
//! 32 bytes), else a key file that is auto-generated on first run. The key
//! file is written 0600 inside a 0700 directory; creation uses `O_EXCL` with
//! a retry-on-exists so concurrent first starts converge on one key.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use conops_core::ConopsError;
use zeroize::Zeroizing;

use crate::crypto;

/// Parse key material: base64-of-32-bytes first, then raw 32 bytes.
pub fn parse_key(value: &str, source: &str) -> Result<Zeroizing<[u8; 32]>, ConopsError> {
    if let Ok(decoded) = BASE64.decode(value) {
        if decoded.len() == 32 {
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&decoded);
            return Ok(key);
        }
    }

    if value.len() == 32 {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(value.as_bytes());
        return Ok(key);
    }

    Err(ConopsError::Config(format!(
        "{source} must be 32 raw bytes or base64 for 32 bytes"
    )))
}

/// Load the key from `path`, generating and persisting a fresh one when the
/// file does not exist yet. Returns the key and a `file:<path>` source tag.
pub fn load_or_create_key_file(
    path: &Path,
) -> Result<(Zeroizing<[u8; 32]>, String), ConopsError> {
    match fs::read_to_string(path) {
        Ok(existing) => {
            let key = parse_key(existing.trim(), &format!("key file {}", path.display()))?;
            Ok((key, format!("file:{}", path.display())))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => create_key_file(path),
        Err(err) => Err(ConopsError::Config(format!(
            "failed reading key file {}: {err}",
            path.display()
        ))),
    }
}

fn create_key_file(path: &Path) -> Result<(Zeroizing<[u8; 32]>, String), ConopsError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).map_err(|err| {
                ConopsError::Config(format!("failed creating key dir {}: {err}", dir.display()))
            })?;
            let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
        }
    }

    let key = Zeroizing::new(crypto::generate_random_key()?);
    let encoded = Zeroizing::new(format!("{}\n", BASE64.encode(key.as_ref())));

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
    {
        Ok(file) => file,
        // Another process won the race; read its key instead.
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            return load_or_create_key_file(path);
        }
        Err(err) => {
            return Err(ConopsError::Config(format!(
                "failed creating key file {}: {err}",
                path.display()
            )));
        }
    };

    file.write_all(encoded.as_bytes()).map_err(|err| {
        ConopsError::Config(format!("failed writing key file {}: {err}", path.display()))
    })?;
    file.sync_all().map_err(|err| {
        ConopsError::Config(format!("failed flushing key file {}: {err}", path.display()))
    })?;

    Ok((key, format!("file:{}", path.display())))
}
