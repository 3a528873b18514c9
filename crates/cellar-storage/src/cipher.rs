use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use cellar_core::cipher::CipherSuite;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::key_provider::{EncryptionKey, KeyInner};

/// Length of every symmetric key Cellar uses (AES-256).
pub const KEY_LEN: usize = 32;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Tag mismatch, malformed input, or wrong key.
    #[error("decrypt failed: {reason}")]
    DecryptFailed { reason: String },
    #[error("encrypt failed: {reason}")]
    EncryptFailed { reason: String },
    #[error("invalid iv: expected {expected} bytes, got {actual}")]
    InvalidIv { expected: usize, actual: usize },
}

/// Fresh IV from the OS CSPRNG, sized for `suite`.
pub fn generate_iv(suite: CipherSuite) -> Vec<u8> {
    let mut iv = vec![0u8; suite.iv_len()];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Fresh 256-bit key from the OS CSPRNG.
pub fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

fn check_iv(suite: CipherSuite, iv: &[u8]) -> Result<(), CipherError> {
    if iv.len() != suite.iv_len() {
        return Err(CipherError::InvalidIv {
            expected: suite.iv_len(),
            actual: iv.len(),
        });
    }
    Ok(())
}

/// Encrypt raw bytes with a software-held key.
pub fn seal(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    check_iv(suite, iv)?;
    match suite {
        CipherSuite::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::EncryptFailed {
                reason: format!("cipher init failed: {e}"),
            })?;
            cipher
                .encrypt(Nonce::from_slice(iv), plaintext)
                .map_err(|e| CipherError::EncryptFailed {
                    reason: e.to_string(),
                })
        }
        CipherSuite::Aes256Ctr => {
            let mut cipher =
                Aes256Ctr::new_from_slices(key, iv).map_err(|e| CipherError::EncryptFailed {
                    reason: format!("cipher init failed: {e}"),
                })?;
            let mut out = plaintext.to_vec();
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
    }
}

/// Decrypt raw bytes with a software-held key.
pub fn open(
    suite: CipherSuite,
    key: &[u8],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    check_iv(suite, iv).map_err(|e| CipherError::DecryptFailed {
        reason: e.to_string(),
    })?;
    match suite {
        CipherSuite::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CipherError::DecryptFailed {
                reason: format!("cipher init failed: {e}"),
            })?;
            cipher
                .decrypt(Nonce::from_slice(iv), ciphertext)
                .map(Zeroizing::new)
                .map_err(|e| CipherError::DecryptFailed {
                    reason: e.to_string(),
                })
        }
        CipherSuite::Aes256Ctr => {
            let mut cipher =
                Aes256Ctr::new_from_slices(key, iv).map_err(|e| CipherError::DecryptFailed {
                    reason: format!("cipher init failed: {e}"),
                })?;
            let mut out = Zeroizing::new(ciphertext.to_vec());
            cipher.apply_keystream(out.as_mut_slice());
            Ok(out)
        }
    }
}

/// Seals string values under a namespace key.
///
/// With a raw key the work happens here; with a vault-held key it is handed to
/// the vault and key bytes never enter this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherEngine {
    suite: CipherSuite,
}

impl CipherEngine {
    pub fn new(suite: CipherSuite) -> Self {
        Self { suite }
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn generate_iv(&self) -> Vec<u8> {
        generate_iv(self.suite)
    }

    pub fn encrypt(
        &self,
        key: &EncryptionKey,
        iv: &[u8],
        plaintext: &str,
    ) -> Result<Vec<u8>, CipherError> {
        match &key.inner {
            KeyInner::Raw(bytes) => seal(self.suite, &bytes[..], iv, plaintext.as_bytes()),
            KeyInner::Vault { vault, handle } => {
                check_iv(self.suite, iv)?;
                vault
                    .encrypt(handle, self.suite, iv, plaintext.as_bytes())
                    .map_err(|e| CipherError::EncryptFailed {
                        reason: e.to_string(),
                    })
            }
        }
    }

    pub fn decrypt(
        &self,
        key: &EncryptionKey,
        iv: &[u8],
        ciphertext: &[u8],
    ) -> Result<String, CipherError> {
        let plaintext = match &key.inner {
            KeyInner::Raw(bytes) => open(self.suite, &bytes[..], iv, ciphertext)?,
            KeyInner::Vault { vault, handle } => vault
                .decrypt(handle, self.suite, iv, ciphertext)
                .map_err(|e| CipherError::DecryptFailed {
                    reason: e.to_string(),
                })?,
        };
        String::from_utf8(plaintext.to_vec()).map_err(|_| CipherError::DecryptFailed {
            reason: "plaintext is not valid utf-8".to_string(),
        })
    }
}
