use serde::{Deserialize, Serialize};

/// Symmetric cipher suites a namespace can be sealed with.
///
/// `Aes256Gcm` is the default everywhere AEAD is available. `Aes256Ctr` exists
/// only for key custody that cannot perform AEAD; it gives confidentiality but
/// no tamper detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherSuite {
    /// AES-256-GCM, 96-bit IV, 128-bit tag.
    Aes256Gcm,
    /// AES-256-CTR, 128-bit IV, unauthenticated.
    Aes256Ctr,
}

impl CipherSuite {
    /// Length in bytes of the IV this suite expects.
    pub const fn iv_len(self) -> usize {
        match self {
            CipherSuite::Aes256Gcm => 12,
            CipherSuite::Aes256Ctr => 16,
        }
    }

    /// Whether ciphertexts carry an authentication tag.
    pub const fn is_authenticated(self) -> bool {
        matches!(self, CipherSuite::Aes256Gcm)
    }

    pub const fn name(self) -> &'static str {
        match self {
            CipherSuite::Aes256Gcm => "aes-256-gcm",
            CipherSuite::Aes256Ctr => "aes-256-ctr",
        }
    }
}
