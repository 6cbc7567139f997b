//! Device configuration
//!
//! A [`DeviceConfig`] can be built in code, loaded from TOML, or assembled
//! from command-line arguments. [`DeviceConfig::validate`] resolves cipher and
//! strategy names up front so nothing is looked up by name at I/O time.

use crate::cipher::SwappableCipher;
use crate::error::{Result, SwitchCryptError};
use crate::swap::{ByteRange, SwapStrategy};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MIB: u64 = 1024 * 1024;

/// Largest accepted flake count per nugget
pub const MAX_FLAKES_PER_NUGGET: u64 = 65536;

/// Largest accepted flake size
pub const MAX_FLAKE_SIZE: u64 = MIB;

/// Largest accepted backing file
pub const MAX_BACKSTORE_SIZE: u64 = 1024 * 1024 * MIB;

pub const DEFAULT_BACKSTORE_SIZE_MIB: u64 = 1024;
pub const DEFAULT_FLAKES_PER_NUGGET: u32 = 64;
pub const DEFAULT_FLAKE_SIZE: u32 = 4096;
pub const DEFAULT_CIPHER: &str = "chacha20";
pub const DEFAULT_SWAP_STRATEGY: &str = "swap_disabled";
pub const DEFAULT_COUNTER_SLOT: u8 = 5;

/// User-facing device configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Backing file size in bytes
    pub backstore_size: u64,

    pub flakes_per_nugget: u32,

    /// Flake size in bytes
    pub flake_size: u32,

    /// Primary cipher name
    pub cipher: String,

    /// Swap cipher name; defaults to the primary cipher
    pub swap_cipher: Option<String>,

    /// Strategy name, e.g. `swap_disabled` or `swap_2_forward`
    pub swap_strategy: String,

    /// Body byte range assigned to the swap cipher under `selective`
    pub selective_range: Option<ByteRange>,

    /// Extra metadata bytes per nugget; defaults to what the ciphers need
    pub metadata_extra_bytes: Option<u32>,

    /// Monotonic counter slot
    pub counter_slot: u8,

    /// Expected counter value when no counter device is present
    pub counter_fallback: Option<u64>,

    /// Key cache bound; unbounded when absent
    pub key_cache_capacity: Option<usize>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            backstore_size: DEFAULT_BACKSTORE_SIZE_MIB * MIB,
            flakes_per_nugget: DEFAULT_FLAKES_PER_NUGGET,
            flake_size: DEFAULT_FLAKE_SIZE,
            cipher: DEFAULT_CIPHER.to_string(),
            swap_cipher: None,
            swap_strategy: DEFAULT_SWAP_STRATEGY.to_string(),
            selective_range: None,
            metadata_extra_bytes: None,
            counter_slot: DEFAULT_COUNTER_SLOT,
            counter_fallback: None,
            key_cache_capacity: None,
        }
    }
}

/// Configuration with every name resolved and every limit checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub backstore_size: u64,
    pub flakes_per_nugget: u32,
    pub flake_size: u32,
    pub primary: SwappableCipher,
    pub swap: SwappableCipher,
    pub strategy: SwapStrategy,
    pub md_bytes_per_nugget: u32,
    pub counter_slot: u8,
    pub counter_fallback: Option<u64>,
    pub key_cache_capacity: Option<usize>,
}

impl DeviceConfig {
    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| SwitchCryptError::Config(e.to_string()))
    }

    /// Load a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check limits and resolve names
    pub fn validate(&self) -> Result<ResolvedConfig> {
        if self.backstore_size == 0 || self.backstore_size > MAX_BACKSTORE_SIZE {
            return Err(SwitchCryptError::InvalidBackstoreSize(format!(
                "{} bytes (must be 1..={})",
                self.backstore_size, MAX_BACKSTORE_SIZE
            )));
        }

        check_flakes_per_nugget(self.flakes_per_nugget as u64)?;

        if self.flake_size == 0 || self.flake_size as u64 > MAX_FLAKE_SIZE {
            return Err(SwitchCryptError::InvalidFlakeSize(format!(
                "{} bytes (must be 1..={})",
                self.flake_size, MAX_FLAKE_SIZE
            )));
        }

        if self.counter_slot == 0 {
            return Err(SwitchCryptError::InvalidTpmId("0".to_string()));
        }

        let primary = SwappableCipher::from_name(&self.cipher)?;
        let swap = match &self.swap_cipher {
            Some(name) => SwappableCipher::from_name(name)?,
            None => primary,
        };
        let strategy = SwapStrategy::parse(&self.swap_strategy, self.selective_range)?;

        let extra = match self.metadata_extra_bytes {
            Some(extra) => extra,
            None => primary
                .required_extra_metadata_bytes()
                .max(swap.required_extra_metadata_bytes()) as u32,
        };

        Ok(ResolvedConfig {
            backstore_size: self.backstore_size,
            flakes_per_nugget: self.flakes_per_nugget,
            flake_size: self.flake_size,
            primary,
            swap,
            strategy,
            md_bytes_per_nugget: 1 + extra,
            counter_slot: self.counter_slot,
            counter_fallback: self.counter_fallback,
            key_cache_capacity: self.key_cache_capacity,
        })
    }
}

fn check_flakes_per_nugget(value: u64) -> Result<u32> {
    if value == 0 || value > u32::MAX as u64 {
        return Err(SwitchCryptError::InvalidFlakesPerNugget(value.to_string()));
    }
    if value > MAX_FLAKES_PER_NUGGET {
        return Err(SwitchCryptError::TooManyFlakesPerNugget(value));
    }
    Ok(value as u32)
}

/// Parse a backstore size given in MiB into bytes
pub fn parse_backstore_size_mib(s: &str) -> Result<u64> {
    let invalid = || SwitchCryptError::InvalidBackstoreSize(s.to_string());
    let mib = s.trim().parse::<u64>().map_err(|_| invalid())?;
    let bytes = mib.checked_mul(MIB).ok_or_else(invalid)?;
    if bytes == 0 || bytes > MAX_BACKSTORE_SIZE {
        return Err(invalid());
    }
    Ok(bytes)
}

/// Parse a flakes-per-nugget count
pub fn parse_flakes_per_nugget(s: &str) -> Result<u32> {
    let value = s
        .trim()
        .parse::<u64>()
        .map_err(|_| SwitchCryptError::InvalidFlakesPerNugget(s.to_string()))?;
    check_flakes_per_nugget(value)
}

/// Parse a flake size in bytes
pub fn parse_flake_size(s: &str) -> Result<u32> {
    let invalid = || SwitchCryptError::InvalidFlakeSize(s.to_string());
    let value = s.trim().parse::<u64>().map_err(|_| invalid())?;
    if value == 0 || value > MAX_FLAKE_SIZE {
        return Err(invalid());
    }
    Ok(value as u32)
}

/// Parse a counter slot id
pub fn parse_tpm_id(s: &str) -> Result<u8> {
    match s.trim().parse::<u8>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(SwitchCryptError::InvalidTpmId(s.to_string())),
    }
}
