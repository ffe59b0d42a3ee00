// Copilot Proxy GUI - At-rest encryption for the stored credential
// Platform capability selected once at startup and injected into the credential store

use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("platform encryption is unavailable")]
    Unavailable,
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Encrypts a single secret string into an opaque blob and back.
pub trait SecretCipher: Send + Sync {
    /// Whether `encrypt`/`decrypt` can be expected to work right now.
    fn is_available(&self) -> bool;
    fn encrypt(&self, plain: &str) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, blob: &[u8]) -> Result<String, CipherError>;
}

/// Platform without a usable secret store; the credential stays plaintext.
pub struct Unavailable;

impl SecretCipher for Unavailable {
    fn is_available(&self) -> bool {
        false
    }

    fn encrypt(&self, _plain: &str) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::Unavailable)
    }

    fn decrypt(&self, _blob: &[u8]) -> Result<String, CipherError> {
        Err(CipherError::Unavailable)
    }
}

/// Cipher backed by whatever the current OS offers.
pub fn platform_cipher() -> Arc<dyn SecretCipher> {
    #[cfg(windows)]
    {
        Arc::new(dpapi::Dpapi)
    }
    #[cfg(target_os = "macos")]
    {
        Arc::new(keychain::KeychainAes::new())
    }
    #[cfg(not(any(windows, target_os = "macos")))]
    {
        Arc::new(Unavailable)
    }
}

/// Windows Data Protection API, scoped to the current user
#[cfg(windows)]
mod dpapi {
    use super::{CipherError, SecretCipher};
    use std::ptr;
    use windows_sys::Win32::Foundation::LocalFree;
    use windows_sys::Win32::Security::Cryptography::{
        CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
    };

    pub struct Dpapi;

    fn take_blob(blob: CRYPT_INTEGER_BLOB) -> Vec<u8> {
        // SAFETY: the API allocated `cbData` bytes at `pbData` with LocalAlloc.
        let out = unsafe { std::slice::from_raw_parts(blob.pbData, blob.cbData as usize) }.to_vec();
        unsafe {
            LocalFree(blob.pbData as _);
        }
        out
    }

    impl SecretCipher for Dpapi {
        fn is_available(&self) -> bool {
            true
        }

        fn encrypt(&self, plain: &str) -> Result<Vec<u8>, CipherError> {
            let mut bytes = plain.as_bytes().to_vec();
            let input = CRYPT_INTEGER_BLOB {
                cbData: bytes.len() as u32,
                pbData: bytes.as_mut_ptr(),
            };
            let mut output = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: ptr::null_mut(),
            };
            let ok = unsafe {
                CryptProtectData(
                    &input,
                    ptr::null(),
                    ptr::null(),
                    ptr::null(),
                    ptr::null(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut output,
                )
            };
            if ok == 0 {
                return Err(CipherError::Encrypt(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            Ok(take_blob(output))
        }

        fn decrypt(&self, blob: &[u8]) -> Result<String, CipherError> {
            let mut bytes = blob.to_vec();
            let input = CRYPT_INTEGER_BLOB {
                cbData: bytes.len() as u32,
                pbData: bytes.as_mut_ptr(),
            };
            let mut output = CRYPT_INTEGER_BLOB {
                cbData: 0,
                pbData: ptr::null_mut(),
            };
            let ok = unsafe {
                CryptUnprotectData(
                    &input,
                    ptr::null_mut(),
                    ptr::null(),
                    ptr::null(),
                    ptr::null(),
                    CRYPTPROTECT_UI_FORBIDDEN,
                    &mut output,
                )
            };
            if ok == 0 {
                return Err(CipherError::Decrypt(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
            String::from_utf8(take_blob(output)).map_err(|e| CipherError::Decrypt(e.to_string()))
        }
    }
}

/// AES-256-GCM with the key kept in the login Keychain
#[cfg(target_os = "macos")]
mod keychain {
    use super::{CipherError, SecretCipher};
    use aes_gcm::aead::{Aead, KeyInit};
    use aes_gcm::{Aes256Gcm, Nonce};
    use rand::RngCore;
    use security_framework::passwords::{get_generic_password, set_generic_password};
    use std::sync::OnceLock;

    const KEYCHAIN_SERVICE: &str = "com.copilot-proxy.gui";
    const KEYCHAIN_ACCOUNT: &str = "token-encryption-key";
    const NONCE_LEN: usize = 12;
    // errSecItemNotFound
    const ITEM_NOT_FOUND: i32 = -25300;

    pub struct KeychainAes {
        key: OnceLock<Option<[u8; 32]>>,
    }

    impl KeychainAes {
        pub fn new() -> Self {
            Self {
                key: OnceLock::new(),
            }
        }

        fn key(&self) -> Option<[u8; 32]> {
            *self.key.get_or_init(|| match load_or_create_key() {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!("Keychain key unavailable: {}", e);
                    None
                }
            })
        }

        fn aead(&self) -> Result<Aes256Gcm, CipherError> {
            let key = self.key().ok_or(CipherError::Unavailable)?;
            Aes256Gcm::new_from_slice(&key).map_err(|e| CipherError::Encrypt(e.to_string()))
        }
    }

    fn load_or_create_key() -> Result<[u8; 32], String> {
        match get_generic_password(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT) {
            Ok(data) if data.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data);
                Ok(key)
            }
            Ok(_) => Err("stored key has the wrong length".to_string()),
            Err(e) if e.code() == ITEM_NOT_FOUND => {
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                set_generic_password(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT, &key)
                    .map_err(|e| e.to_string())?;
                Ok(key)
            }
            Err(e) => Err(e.to_string()),
        }
    }

    impl SecretCipher for KeychainAes {
        fn is_available(&self) -> bool {
            self.key().is_some()
        }

        fn encrypt(&self, plain: &str) -> Result<Vec<u8>, CipherError> {
            let aead = self.aead()?;
            let mut nonce = [0u8; NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);
            let sealed = aead
                .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
                .map_err(|e| CipherError::Encrypt(e.to_string()))?;
            let mut blob = nonce.to_vec();
            blob.extend_from_slice(&sealed);
            Ok(blob)
        }

        fn decrypt(&self, blob: &[u8]) -> Result<String, CipherError> {
            if blob.len() <= NONCE_LEN {
                return Err(CipherError::Decrypt("blob too short".to_string()));
            }
            let aead = self.aead()?;
            let (nonce, sealed) = blob.split_at(NONCE_LEN);
            let plain = aead
                .decrypt(Nonce::from_slice(nonce), sealed)
                .map_err(|e| CipherError::Decrypt(e.to_string()))?;
            String::from_utf8(plain).map_err(|e| CipherError::Decrypt(e.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{CipherError, SecretCipher};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Reversible stand-in for a platform cipher with switchable failure modes.
    pub struct FakeCipher {
        pub available: AtomicBool,
        pub fail_encrypt: AtomicBool,
    }

    impl FakeCipher {
        pub fn available() -> Self {
            Self {
                available: AtomicBool::new(true),
                fail_encrypt: AtomicBool::new(false),
            }
        }

        pub fn unavailable() -> Self {
            let cipher = Self::available();
            cipher.available.store(false, Ordering::SeqCst);
            cipher
        }

        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }
    }

    impl SecretCipher for FakeCipher {
        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }

        fn encrypt(&self, plain: &str) -> Result<Vec<u8>, CipherError> {
            if !self.is_available() {
                return Err(CipherError::Unavailable);
            }
            if self.fail_encrypt.load(Ordering::SeqCst) {
                return Err(CipherError::Encrypt("simulated".to_string()));
            }
            let mut blob = b"ENC:".to_vec();
            blob.extend(plain.bytes().map(|b| b ^ 0x5a));
            Ok(blob)
        }

        fn decrypt(&self, blob: &[u8]) -> Result<String, CipherError> {
            if !self.is_available() {
                return Err(CipherError::Unavailable);
            }
            let body = blob
                .strip_prefix(b"ENC:")
                .ok_or_else(|| CipherError::Decrypt("missing header".to_string()))?;
            String::from_utf8(body.iter().map(|b| b ^ 0x5a).collect())
                .map_err(|e| CipherError::Decrypt(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_cipher_refuses_both_directions() {
        let cipher = Unavailable;
        assert!(!cipher.is_available());
        assert!(matches!(cipher.encrypt("x"), Err(CipherError::Unavailable)));
        assert!(matches!(cipher.decrypt(b"x"), Err(CipherError::Unavailable)));
    }
}
