//! # SwitchCrypt - Encrypted Block Device with Live Cipher Migration
//!
//! `switchcrypt` stores a virtual block device inside a single backing file.
//! The device body is split into *nuggets*, each made of fixed-size *flakes*,
//! and every nugget records which of two configured stream ciphers protects
//! it. A swap strategy decides how nuggets move between the ciphers while the
//! device is in use.
//!
//! - **Per-flake keys** derived from a password-derived master secret
//! - **Merkle-anchored header** with a monotonic counter for rollback detection
//! - **Transaction journal** marking which flakes hold current ciphertext
//! - **Swap strategies**: disabled, mirrored, selective and N-forward
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchcrypt::{Capabilities, Device, DeviceConfig, MemoryCounter, Result};
//!
//! # fn main() -> Result<()> {
//! let config = DeviceConfig {
//!     backstore_size: 4 * 1024 * 1024,
//!     swap_cipher: Some("chacha8".to_string()),
//!     swap_strategy: "swap_1_forward".to_string(),
//!     ..DeviceConfig::default()
//! };
//!
//! let counter = MemoryCounter::new();
//! let mut device = Device::create("disk.img", &config, b"password", Capabilities::new(counter.clone()))?;
//!
//! device.write(b"Hello, World!", 0)?;
//! let mut buf = [0u8; 13];
//! device.read(&mut buf, 0)?;
//! device.close()?;
//!
//! let device = Device::open("disk.img", &config, b"password", Capabilities::new(counter), false)?;
//! # drop(device);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use core::{
    backstore, bitmask, cipher, counter, device, dispatch, error, header, journal, keycount, keys,
    layout, merkle, metadata, secret, swap,
};

pub use crate::config::{DeviceConfig, ResolvedConfig};
pub use crate::core::{
    cipher::SwappableCipher,
    counter::{FileCounter, MemoryCounter, MonotonicCounter, NoCounter},
    device::{Capabilities, Device, DeviceStats},
    error::{Result, SwitchCryptError},
    keys::{Blake3Kdf, Kdf},
    layout::Layout,
    secret::{Argon2Deriver, SecretDeriver},
    swap::{ByteRange, SwapCommand, SwapStrategy},
};
