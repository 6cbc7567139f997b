//! Command-line surface
//!
//! Arguments are collected with `clap` as raw strings and then run through the
//! same validating parsers the configuration layer uses, so a bad value fails
//! with the matching [`SwitchCryptError`] before any file is touched.

use crate::config::{
    parse_backstore_size_mib, parse_flake_size, parse_flakes_per_nugget, parse_tpm_id,
    DeviceConfig,
};
use crate::error::{Result, SwitchCryptError};
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Password used by `--default-password`
pub const DEFAULT_PASSWORD: &str = "t3st";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "switchcrypt")]
#[command(about = "Encrypted block device with live cipher migration")]
pub struct Args {
    /// Run mode: create, open or wipe
    pub mode: Option<String>,

    /// Path to the backing file
    pub backing_file: Option<PathBuf>,

    /// TOML configuration file; command-line values override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backing file size in MiB
    #[arg(long)]
    pub backstore_size: Option<String>,

    #[arg(long)]
    pub flakes_per_nugget: Option<String>,

    /// Flake size in bytes
    #[arg(long)]
    pub flake_size: Option<String>,

    /// Primary cipher (chacha8, chacha12, chacha20, aes256-ctr)
    #[arg(long)]
    pub cipher: Option<String>,

    /// Cipher nuggets migrate to on a swap command
    #[arg(long)]
    pub swap_cipher: Option<String>,

    /// swap_disabled, swap_mirrored, swap_selective or swap_<N>_forward
    #[arg(long)]
    pub swap_strategy: Option<String>,

    /// Monotonic counter slot
    #[arg(long)]
    pub tpm_id: Option<String>,

    /// Expected counter value when no counter device is available
    #[arg(long)]
    pub counter_fallback: Option<u64>,

    /// Open even if the header Merkle root or counter check fails
    #[arg(long)]
    pub allow_insecure_start: bool,

    #[arg(long, conflicts_with = "default_password")]
    pub password: Option<String>,

    /// Use the built-in development password
    #[arg(long)]
    pub default_password: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Create,
    Open,
    Wipe,
}

impl RunMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "create" => Ok(RunMode::Create),
            "open" => Ok(RunMode::Open),
            "wipe" => Ok(RunMode::Wipe),
            _ => Err(SwitchCryptError::UnknownMode(s.to_string())),
        }
    }
}

/// Fully validated command line
pub struct Invocation {
    pub mode: RunMode,
    pub backing_file: PathBuf,
    pub config: DeviceConfig,
    pub password: Zeroizing<Vec<u8>>,
    pub ignore_integrity: bool,
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("mode", &self.mode)
            .field("backing_file", &self.backing_file)
            .field("config", &self.config)
            .field("ignore_integrity", &self.ignore_integrity)
            .finish_non_exhaustive()
    }
}

/// Parse an argument list (program name first) without exiting the process
pub fn parse_args<I, T>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Args::try_parse_from(args).map_err(|e| SwitchCryptError::MustHalt(e.to_string()))
}

impl Args {
    /// Validate every value and build the device configuration
    pub fn into_invocation(self) -> Result<Invocation> {
        let (mode, backing_file) = match (self.mode.as_deref(), self.backing_file.clone()) {
            (Some(mode), Some(path)) => (RunMode::parse(mode)?, path),
            _ => {
                return Err(SwitchCryptError::MustHalt(
                    "expected <create|open|wipe> <backing-file>".to_string(),
                ))
            }
        };

        let config = self.device_config()?;

        let password = match (&self.password, self.default_password) {
            (Some(password), _) => password.as_bytes().to_vec(),
            (None, true) => DEFAULT_PASSWORD.as_bytes().to_vec(),
            (None, false) => {
                return Err(SwitchCryptError::MustHalt(
                    "a password is required (--password or --default-password)".to_string(),
                ))
            }
        };

        Ok(Invocation {
            mode,
            backing_file,
            config,
            password: Zeroizing::new(password),
            ignore_integrity: self.allow_insecure_start,
        })
    }

    fn device_config(&self) -> Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => DeviceConfig::load(path)?,
            None => DeviceConfig::default(),
        };

        if let Some(size) = &self.backstore_size {
            config.backstore_size = parse_backstore_size_mib(size)?;
        }
        if let Some(fpn) = &self.flakes_per_nugget {
            config.flakes_per_nugget = parse_flakes_per_nugget(fpn)?;
        }
        if let Some(size) = &self.flake_size {
            config.flake_size = parse_flake_size(size)?;
        }
        if let Some(cipher) = &self.cipher {
            config.cipher = cipher.clone();
        }
        if let Some(cipher) = &self.swap_cipher {
            config.swap_cipher = Some(cipher.clone());
        }
        if let Some(strategy) = &self.swap_strategy {
            config.swap_strategy = strategy.clone();
        }
        if let Some(id) = &self.tpm_id {
            config.counter_slot = parse_tpm_id(id)?;
        }
        if self.counter_fallback.is_some() {
            config.counter_fallback = self.counter_fallback;
        }

        config.validate()?;
        Ok(config)
    }
}
