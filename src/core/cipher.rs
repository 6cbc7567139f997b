//! Swappable flake ciphers
//!
//! Every cipher is a length-preserving stream cipher so ciphertext can be
//! written back in place of plaintext. The keystream is selected by the
//! flake key (unique per nugget, flake and generation) and a nonce built
//! from the nugget and flake indices.
//!
//! On-disk identifiers:
//!
//! | ident | name         |
//! |-------|--------------|
//! | 1     | `chacha8`    |
//! | 2     | `chacha12`   |
//! | 3     | `chacha20`   |
//! | 4     | `aes256-ctr` |

use crate::error::{Result, SwitchCryptError};
use crate::keys::Key;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::{ChaCha12, ChaCha20, ChaCha8};
use serde::{Deserialize, Serialize};

type Aes256Ctr = ctr::Ctr64BE<aes::Aes256>;

/// Closed set of ciphers a nugget can be encrypted under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SwappableCipher {
    ChaCha8,
    ChaCha12,
    ChaCha20,
    Aes256Ctr,
}

impl SwappableCipher {
    pub const ALL: [SwappableCipher; 4] = [
        SwappableCipher::ChaCha8,
        SwappableCipher::ChaCha12,
        SwappableCipher::ChaCha20,
        SwappableCipher::Aes256Ctr,
    ];

    /// Resolve a cipher by name
    ///
    /// Matching is case-insensitive and tolerates an `sc_` prefix and
    /// underscores in place of hyphens (`sc_aes256_ctr`).
    pub fn from_name(name: &str) -> Result<Self> {
        let lowered = name.trim().to_lowercase().replace('_', "-");
        let normalized = lowered.strip_prefix("sc-").unwrap_or(&lowered);

        match normalized {
            "chacha8" => Ok(SwappableCipher::ChaCha8),
            "chacha12" => Ok(SwappableCipher::ChaCha12),
            "chacha20" => Ok(SwappableCipher::ChaCha20),
            "aes256-ctr" | "aes-256-ctr" | "aes256ctr" => Ok(SwappableCipher::Aes256Ctr),
            _ => Err(SwitchCryptError::StringToCipherFailed(name.to_string())),
        }
    }

    /// Canonical name
    pub fn name(self) -> &'static str {
        match self {
            SwappableCipher::ChaCha8 => "chacha8",
            SwappableCipher::ChaCha12 => "chacha12",
            SwappableCipher::ChaCha20 => "chacha20",
            SwappableCipher::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Identifier written to nugget metadata
    pub fn ident(self) -> u8 {
        match self {
            SwappableCipher::ChaCha8 => 1,
            SwappableCipher::ChaCha12 => 2,
            SwappableCipher::ChaCha20 => 3,
            SwappableCipher::Aes256Ctr => 4,
        }
    }

    pub fn from_ident(ident: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|cipher| cipher.ident() == ident)
    }

    /// Cipher-specific bytes needed in each nugget's metadata record
    pub fn required_extra_metadata_bytes(self) -> usize {
        0
    }

    /// Encrypt a flake in place
    pub fn encrypt(self, key: &Key, nugget: u64, flake: u32, data: &mut [u8]) {
        self.apply_keystream(key, nugget, flake, data);
    }

    /// Decrypt a flake in place
    pub fn decrypt(self, key: &Key, nugget: u64, flake: u32, data: &mut [u8]) {
        self.apply_keystream(key, nugget, flake, data);
    }

    fn apply_keystream(self, key: &Key, nugget: u64, flake: u32, data: &mut [u8]) {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&nugget.to_le_bytes());
        nonce[8..].copy_from_slice(&flake.to_le_bytes());

        match self {
            SwappableCipher::ChaCha8 => {
                ChaCha8::new(key.into(), &nonce.into()).apply_keystream(data)
            }
            SwappableCipher::ChaCha12 => {
                ChaCha12::new(key.into(), &nonce.into()).apply_keystream(data)
            }
            SwappableCipher::ChaCha20 => {
                ChaCha20::new(key.into(), &nonce.into()).apply_keystream(data)
            }
            SwappableCipher::Aes256Ctr => {
                // nonce in the high 96 bits, block counter in the low 32
                let mut iv = [0u8; 16];
                iv[..12].copy_from_slice(&nonce);
                Aes256Ctr::new(key.into(), &iv.into()).apply_keystream(data)
            }
        }
    }
}

impl std::fmt::Display for SwappableCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SwappableCipher {
    type Err = SwitchCryptError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}
