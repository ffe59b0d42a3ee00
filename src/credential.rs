// Copilot Proxy GUI - GitHub token storage
// Encrypted-at-rest when the platform allows it, plaintext otherwise, with migration from older layouts

use crate::cipher::SecretCipher;
use crate::config::{encrypted_variant, AppPaths};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to delete {path}: {source}")]
    Delete { path: PathBuf, source: io::Error },
}

/// Single-secret store for the GitHub access token.
///
/// Four files may exist for one logical credential: `github_token` and
/// `github_token.enc` in the app data dir, and the same pair in the legacy
/// CLI directory. Reads converge the layout towards the encrypted file in the
/// app data dir.
pub struct CredentialStore {
    paths: AppPaths,
    cipher: Arc<dyn SecretCipher>,
}

impl CredentialStore {
    pub fn new(paths: AppPaths, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { paths, cipher }
    }

    /// Path reported to the UI as the token location
    pub fn token_path(&self) -> PathBuf {
        self.paths.token_path()
    }

    /// Returns the stored token, or an empty string if none exists.
    ///
    /// This is not a pure read. A plaintext token in the current location is
    /// re-encrypted (and the plaintext removed) when encryption is available,
    /// and a token found in the legacy location is written to the current
    /// location before the legacy files are deleted. Both migrations are
    /// best-effort: their failures are logged and the token is still returned.
    pub fn read_with_migration(&self) -> Result<String, CredentialError> {
        let plain_path = self.paths.token_path();
        let enc_path = encrypted_variant(&plain_path);

        if enc_path.exists() {
            if !self.cipher.is_available() {
                tracing::warn!("Encrypted token found but platform encryption is unavailable");
                return match read_trimmed(&plain_path)? {
                    Some(token) => Ok(token),
                    None => Ok(String::new()),
                };
            }
            let blob = std::fs::read(&enc_path).map_err(|source| CredentialError::Read {
                path: enc_path.clone(),
                source,
            })?;
            return match self.cipher.decrypt(&blob) {
                Ok(token) => Ok(token),
                Err(e) => {
                    tracing::warn!("Failed to decrypt token: {}", e);
                    Ok(String::new())
                }
            };
        }

        if let Some(token) = read_trimmed(&plain_path)? {
            if !token.is_empty() && self.cipher.is_available() {
                if let Err(e) = self.encrypt_in_place(&token, &enc_path, &plain_path) {
                    tracing::warn!("Token migration to encrypted storage failed: {}", e);
                }
            }
            return Ok(token);
        }

        self.migrate_legacy()
    }

    /// Persists `token`, encrypted when possible.
    ///
    /// Encryption failures fall back to a plaintext file; only a failure to
    /// write that fallback file is reported.
    pub fn write(&self, token: &str) -> Result<(), CredentialError> {
        let plain_path = self.paths.token_path();
        std::fs::create_dir_all(&self.paths.data_dir).map_err(|source| {
            CredentialError::Write {
                path: self.paths.data_dir.clone(),
                source,
            }
        })?;

        if self.cipher.is_available() {
            let enc_path = encrypted_variant(&plain_path);
            match self.cipher.encrypt(token) {
                Ok(blob) => match std::fs::write(&enc_path, blob) {
                    Ok(()) => {
                        remove_if_exists(&plain_path).unwrap_or_else(|e| {
                            tracing::warn!("Failed to remove plaintext token: {}", e)
                        });
                        return Ok(());
                    }
                    Err(e) => tracing::warn!(
                        "Failed to write encrypted token, falling back to plaintext: {}",
                        e
                    ),
                },
                Err(e) => {
                    tracing::warn!("Failed to encrypt token, falling back to plaintext: {}", e)
                }
            }
        }

        std::fs::write(&plain_path, token).map_err(|source| CredentialError::Write {
            path: plain_path,
            source,
        })
    }

    /// Removes every stored variant of the token. Missing files are not an error;
    /// the first real failure is reported after all removals were attempted.
    pub fn delete(&self) -> Result<(), CredentialError> {
        let plain = self.paths.token_path();
        let legacy = self.paths.legacy_token_path();
        let targets = [
            encrypted_variant(&plain),
            plain,
            encrypted_variant(&legacy),
            legacy,
        ];

        let mut first_error = None;
        for path in targets {
            if let Err(source) = remove_if_exists(&path) {
                tracing::warn!("Failed to delete {}: {}", path.display(), source);
                first_error.get_or_insert(CredentialError::Delete { path, source });
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn encrypt_in_place(&self, token: &str, enc_path: &Path, plain_path: &Path) -> anyhow::Result<()> {
        let blob = self.cipher.encrypt(token)?;
        std::fs::write(enc_path, blob)?;
        std::fs::remove_file(plain_path)?;
        tracing::info!("Migrated plaintext token to encrypted storage");
        Ok(())
    }

    fn migrate_legacy(&self) -> Result<String, CredentialError> {
        let legacy_plain = self.paths.legacy_token_path();
        let legacy_enc = encrypted_variant(&legacy_plain);

        let mut token = String::new();
        if legacy_enc.exists() && self.cipher.is_available() {
            match std::fs::read(&legacy_enc) {
                Ok(blob) => match self.cipher.decrypt(&blob) {
                    Ok(value) => token = value,
                    Err(e) => tracing::warn!("Failed to decrypt legacy token: {}", e),
                },
                Err(e) => tracing::warn!("Failed to read legacy token: {}", e),
            }
        }
        if token.is_empty() {
            if let Some(value) = read_trimmed(&legacy_plain)? {
                token = value;
            }
        }
        if token.is_empty() {
            return Ok(token);
        }

        match self.write(&token) {
            Ok(()) => {
                for path in [&legacy_enc, &legacy_plain] {
                    if let Err(e) = remove_if_exists(path) {
                        tracing::warn!("Failed to clean up legacy token file {}: {}", path.display(), e);
                    }
                }
                tracing::info!("Migrated token from legacy location");
            }
            Err(e) => tracing::warn!("Legacy token migration failed, keeping legacy files: {}", e),
        }
        Ok(token)
    }
}

fn read_trimmed(path: &Path) -> Result<Option<String>, CredentialError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CredentialError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
