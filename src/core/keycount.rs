//! Per-nugget rekey generation counters

use crate::backstore::Backstore;
use crate::error::{Result, SwitchCryptError};
use crate::layout::KEYCOUNT_BYTES_PER_NUGGET;

fn keycount_offset(backstore: &Backstore, nugget: u64) -> Result<u64> {
    let layout = backstore.layout();
    if nugget >= layout.num_nuggets as u64 {
        return Err(SwitchCryptError::OutOfBounds {
            offset: nugget,
            len: 1,
            size: layout.num_nuggets as u64,
        });
    }
    Ok(layout.kcs_offset + nugget * KEYCOUNT_BYTES_PER_NUGGET)
}

/// Read a nugget's keycount
pub fn open_keycount(backstore: &mut Backstore, nugget: u64) -> Result<u64> {
    let offset = keycount_offset(backstore, nugget)?;
    let mut bytes = [0u8; KEYCOUNT_BYTES_PER_NUGGET as usize];
    backstore.read(&mut bytes, offset)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Persist a nugget's keycount
pub fn commit_keycount(backstore: &mut Backstore, nugget: u64, keycount: u64) -> Result<()> {
    let offset = keycount_offset(backstore, nugget)?;
    backstore.write(&keycount.to_le_bytes(), offset)
}

/// Read every keycount in one pass
pub fn load_keycounts(backstore: &mut Backstore) -> Result<Vec<u64>> {
    let layout = *backstore.layout();
    let width = KEYCOUNT_BYTES_PER_NUGGET as usize;
    let mut region = vec![0u8; width * layout.num_nuggets as usize];
    backstore.read(&mut region, layout.kcs_offset)?;

    Ok(region
        .chunks_exact(width)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            u64::from_le_bytes(bytes)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use tempfile::TempDir;

    #[test]
    fn test_keycounts_start_at_zero() {
        let dir = TempDir::new().unwrap();
        let mut backstore = Backstore::create(dir.path().join("kc.bin"), 204).unwrap();
        backstore.apply_layout(Layout::compute(204, 2, 8, 8).unwrap());

        assert_eq!(load_keycounts(&mut backstore).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn test_commit_keycount() {
        let dir = TempDir::new().unwrap();
        let mut backstore = Backstore::create(dir.path().join("kc.bin"), 204).unwrap();
        backstore.apply_layout(Layout::compute(204, 2, 8, 8).unwrap());

        commit_keycount(&mut backstore, 2, 5).unwrap();
        assert_eq!(open_keycount(&mut backstore, 2).unwrap(), 5);
        assert_eq!(load_keycounts(&mut backstore).unwrap(), vec![0, 0, 5]);

        let mut raw = [0u8; 8];
        backstore.read(&mut raw, 105 + 16).unwrap();
        assert_eq!(u64::from_le_bytes(raw), 5);

        assert!(commit_keycount(&mut backstore, 3, 1).is_err());
    }
}
