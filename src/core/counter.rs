//! Monotonic counter capability
//!
//! Devices anchor their global version header to a counter that can only
//! move forward. Real deployments back this with secure hardware; this module
//! ships an in-process counter, a file-backed emulation and a placeholder for
//! hosts with no counter at all.

use crate::error::{Result, SwitchCryptError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Width of one counter record
pub const COUNTER_BYTES: usize = 8;

/// Access to a hardware-style monotonic counter
pub trait MonotonicCounter: Send {
    fn read_counter(&self, slot: u8) -> Result<[u8; COUNTER_BYTES]>;

    /// Store a new value; values smaller than the current one are rejected
    fn write_counter(&self, slot: u8, value: &[u8; COUNTER_BYTES]) -> Result<()>;
}

/// Decode a counter record
pub fn counter_value(bytes: &[u8; COUNTER_BYTES]) -> u64 {
    u64::from_le_bytes(*bytes)
}

fn reject_rollback(slot: u8, current: u64, next: u64) -> Result<()> {
    if next < current {
        return Err(SwitchCryptError::IntegrityFailure(format!(
            "counter slot {} cannot move backwards ({} -> {})",
            slot, current, next
        )));
    }
    Ok(())
}

/// Shared in-memory counter; clones observe the same slots
#[derive(Debug, Clone, Default)]
pub struct MemoryCounter {
    slots: Arc<Mutex<HashMap<u8, u64>>>,
}

impl MemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MonotonicCounter for MemoryCounter {
    fn read_counter(&self, slot: u8) -> Result<[u8; COUNTER_BYTES]> {
        let value = self.slots.lock().get(&slot).copied().unwrap_or(0);
        Ok(value.to_le_bytes())
    }

    fn write_counter(&self, slot: u8, value: &[u8; COUNTER_BYTES]) -> Result<()> {
        let next = counter_value(value);
        let mut slots = self.slots.lock();
        let current = slots.get(&slot).copied().unwrap_or(0);
        reject_rollback(slot, current, next)?;
        slots.insert(slot, next);
        Ok(())
    }
}

/// Counter emulated in a side file, one 8-byte record per slot
#[derive(Debug, Clone)]
pub struct FileCounter {
    path: PathBuf,
}

impl FileCounter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileCounter {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn record_offset(slot: u8) -> u64 {
        slot as u64 * COUNTER_BYTES as u64
    }
}

impl MonotonicCounter for FileCounter {
    fn read_counter(&self, slot: u8) -> Result<[u8; COUNTER_BYTES]> {
        let mut bytes = [0u8; COUNTER_BYTES];
        let mut file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(bytes),
            Err(e) => {
                return Err(SwitchCryptError::CounterDeviceUnavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let offset = Self::record_offset(slot);
        if file.metadata()?.len() >= offset + COUNTER_BYTES as u64 {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut bytes)?;
        }
        Ok(bytes)
    }

    fn write_counter(&self, slot: u8, value: &[u8; COUNTER_BYTES]) -> Result<()> {
        let current = counter_value(&self.read_counter(slot)?);
        reject_rollback(slot, current, counter_value(value))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                SwitchCryptError::CounterDeviceUnavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                ))
            })?;

        file.seek(SeekFrom::Start(Self::record_offset(slot)))?;
        file.write_all(value)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Placeholder for hosts without a counter device
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCounter;

impl MonotonicCounter for NoCounter {
    fn read_counter(&self, slot: u8) -> Result<[u8; COUNTER_BYTES]> {
        Err(SwitchCryptError::CounterDeviceUnavailable(format!(
            "no counter device for slot {}",
            slot
        )))
    }

    fn write_counter(&self, slot: u8, _value: &[u8; COUNTER_BYTES]) -> Result<()> {
        Err(SwitchCryptError::CounterDeviceUnavailable(format!(
            "no counter device for slot {}",
            slot
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_counter_is_shared() {
        let counter = MemoryCounter::new();
        let clone = counter.clone();

        assert_eq!(counter_value(&counter.read_counter(1).unwrap()), 0);
        counter.write_counter(1, &5u64.to_le_bytes()).unwrap();
        assert_eq!(counter_value(&clone.read_counter(1).unwrap()), 5);
        assert_eq!(counter_value(&clone.read_counter(2).unwrap()), 0);
    }

    #[test]
    fn test_memory_counter_rejects_rollback() {
        let counter = MemoryCounter::new();
        counter.write_counter(1, &5u64.to_le_bytes()).unwrap();

        assert!(matches!(
            counter.write_counter(1, &4u64.to_le_bytes()),
            Err(SwitchCryptError::IntegrityFailure(_))
        ));
        counter.write_counter(1, &5u64.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_file_counter_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.bin");

        let counter = FileCounter::new(&path);
        assert_eq!(counter_value(&counter.read_counter(3).unwrap()), 0);

        counter.write_counter(3, &9u64.to_le_bytes()).unwrap();
        counter.write_counter(1, &2u64.to_le_bytes()).unwrap();

        let reopened = FileCounter::new(&path);
        assert_eq!(counter_value(&reopened.read_counter(3).unwrap()), 9);
        assert_eq!(counter_value(&reopened.read_counter(1).unwrap()), 2);
        assert_eq!(counter_value(&reopened.read_counter(200).unwrap()), 0);

        assert!(reopened.write_counter(3, &8u64.to_le_bytes()).is_err());
    }

    #[test]
    fn test_no_counter_is_unavailable() {
        assert!(matches!(
            NoCounter.read_counter(1),
            Err(SwitchCryptError::CounterDeviceUnavailable(_))
        ));
        assert!(matches!(
            NoCounter.write_counter(1, &[0u8; 8]),
            Err(SwitchCryptError::CounterDeviceUnavailable(_))
        ));
    }
}
