//! Transaction journal: one bitmask per nugget, one bit per flake
//!
//! A set bit means the flake's ciphertext was produced under the nugget's
//! current cipher and keycount. A nugget with no bits set is pristine.

use crate::backstore::Backstore;
use crate::bitmask::Bitmask;
use crate::error::{Result, SwitchCryptError};

/// Journal entry for a single nugget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TJournalEntry {
    pub bitmask: Bitmask,
}

impl TJournalEntry {
    pub fn new(flakes_per_nugget: u32) -> Self {
        TJournalEntry {
            bitmask: Bitmask::new(flakes_per_nugget as usize),
        }
    }

    /// No flake has been written under the current generation
    pub fn is_pristine(&self) -> bool {
        self.bitmask.is_clear()
    }
}

fn entry_offset(backstore: &Backstore, nugget: u64) -> Result<u64> {
    let layout = backstore.layout();
    if nugget >= layout.num_nuggets as u64 {
        return Err(SwitchCryptError::OutOfBounds {
            offset: nugget,
            len: 1,
            size: layout.num_nuggets as u64,
        });
    }
    Ok(layout.tj_offset + nugget * layout.journal_bytes())
}

/// Read one nugget's journal entry
pub fn open_tj_entry(backstore: &mut Backstore, nugget: u64) -> Result<TJournalEntry> {
    let offset = entry_offset(backstore, nugget)?;
    let fpn = backstore.layout().flakes_per_nugget;
    let mut bytes = vec![0u8; backstore.layout().journal_bytes() as usize];
    backstore.read(&mut bytes, offset)?;
    Ok(TJournalEntry {
        bitmask: Bitmask::from_bytes(&bytes, fpn as usize),
    })
}

/// Persist one nugget's journal entry
pub fn commit_tj_entry(
    backstore: &mut Backstore,
    nugget: u64,
    entry: &TJournalEntry,
) -> Result<()> {
    let offset = entry_offset(backstore, nugget)?;
    backstore.write(entry.bitmask.as_bytes(), offset)
}

/// Read every journal entry in one pass
pub fn load_tj_entries(backstore: &mut Backstore) -> Result<Vec<TJournalEntry>> {
    let layout = *backstore.layout();
    let width = layout.journal_bytes() as usize;
    let mut region = vec![0u8; width * layout.num_nuggets as usize];
    backstore.read(&mut region, layout.tj_offset)?;

    Ok(region
        .chunks(width.max(1))
        .take(layout.num_nuggets as usize)
        .map(|bytes| TJournalEntry {
            bitmask: Bitmask::from_bytes(bytes, layout.flakes_per_nugget as usize),
        })
        .collect())
}

/// Clear every bit of every nugget, leaving stored ciphertext untouched
pub fn wipe_tj_entries(backstore: &mut Backstore) -> Result<()> {
    let layout = *backstore.layout();
    let region = vec![0u8; (layout.journal_bytes() * layout.num_nuggets as u64) as usize];
    backstore.write(&region, layout.tj_offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use tempfile::TempDir;

    fn backstore(dir: &TempDir) -> Backstore {
        let mut backstore = Backstore::create(dir.path().join("tj.bin"), 4096).unwrap();
        backstore.apply_layout(Layout::compute(4096, 12, 2, 8).unwrap());
        backstore
    }

    #[test]
    fn test_fresh_entries_are_pristine() {
        let dir = TempDir::new().unwrap();
        let mut backstore = backstore(&dir);

        let entries = load_tj_entries(&mut backstore).unwrap();
        assert_eq!(entries.len(), 95);
        assert!(entries.iter().all(TJournalEntry::is_pristine));
    }

    #[test]
    fn test_commit_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut backstore = backstore(&dir);

        let mut entry = TJournalEntry::new(12);
        entry.bitmask.set(0);
        entry.bitmask.set(11);
        commit_tj_entry(&mut backstore, 94, &entry).unwrap();

        let reopened = open_tj_entry(&mut backstore, 94).unwrap();
        assert_eq!(reopened, entry);
        assert!(!reopened.is_pristine());
        assert!(open_tj_entry(&mut backstore, 93).unwrap().is_pristine());

        let mut raw = [0u8; 2];
        backstore.read(&mut raw, 865 + 94 * 2).unwrap();
        assert_eq!(raw, [0x01, 0x08]);
    }

    #[test]
    fn test_wipe_clears_everything() {
        let dir = TempDir::new().unwrap();
        let mut backstore = backstore(&dir);

        let mut entry = TJournalEntry::new(12);
        entry.bitmask.set_range(0..12);
        for nugget in [0, 50, 94] {
            commit_tj_entry(&mut backstore, nugget, &entry).unwrap();
        }

        wipe_tj_entries(&mut backstore).unwrap();
        assert!(load_tj_entries(&mut backstore)
            .unwrap()
            .iter()
            .all(TJournalEntry::is_pristine));
    }

    #[test]
    fn test_out_of_range_nugget() {
        let dir = TempDir::new().unwrap();
        let mut backstore = backstore(&dir);

        assert!(matches!(
            open_tj_entry(&mut backstore, 95),
            Err(SwitchCryptError::OutOfBounds { .. })
        ));
    }
}
