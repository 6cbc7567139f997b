//! Per-nugget cipher assignment records
//!
//! Byte 0 holds the identifier of the cipher that currently encrypts the
//! nugget; any remaining bytes are reserved for cipher-specific state.

use crate::backstore::Backstore;
use crate::error::{Result, SwitchCryptError};

/// Identifier stored for a nugget that has never been assigned a cipher
pub const UNASSIGNED_CIPHER: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NuggetMetadata {
    pub cipher_ident: u8,
    pub data: Vec<u8>,
}

impl NuggetMetadata {
    /// Metadata naming `cipher_ident`, with zeroed auxiliary bytes
    pub fn new(cipher_ident: u8, md_bytes: u32) -> Self {
        NuggetMetadata {
            cipher_ident,
            data: vec![0u8; (md_bytes as usize).saturating_sub(1)],
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        NuggetMetadata {
            cipher_ident: bytes.first().copied().unwrap_or(UNASSIGNED_CIPHER),
            data: bytes.get(1..).map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }

    fn to_bytes(&self, md_bytes: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; md_bytes as usize];
        if let Some(first) = bytes.first_mut() {
            *first = self.cipher_ident;
        }
        let n = self.data.len().min(bytes.len().saturating_sub(1));
        if n > 0 {
            bytes[1..1 + n].copy_from_slice(&self.data[..n]);
        }
        bytes
    }
}

fn metadata_offset(backstore: &Backstore, nugget: u64) -> Result<u64> {
    let layout = backstore.layout();
    if nugget >= layout.num_nuggets as u64 {
        return Err(SwitchCryptError::OutOfBounds {
            offset: nugget,
            len: 1,
            size: layout.num_nuggets as u64,
        });
    }
    Ok(layout.md_offset + nugget * layout.md_bytes_per_nugget as u64)
}

/// Read one nugget's metadata
pub fn open_nugget_metadata(backstore: &mut Backstore, nugget: u64) -> Result<NuggetMetadata> {
    let offset = metadata_offset(backstore, nugget)?;
    let mut bytes = vec![0u8; backstore.layout().md_bytes_per_nugget as usize];
    backstore.read(&mut bytes, offset)?;
    Ok(NuggetMetadata::from_bytes(&bytes))
}

/// Persist one nugget's metadata
pub fn commit_nugget_metadata(
    backstore: &mut Backstore,
    nugget: u64,
    metadata: &NuggetMetadata,
) -> Result<()> {
    let offset = metadata_offset(backstore, nugget)?;
    let bytes = metadata.to_bytes(backstore.layout().md_bytes_per_nugget);
    backstore.write(&bytes, offset)
}

/// Read every nugget's metadata in one pass
pub fn load_nugget_metadata(backstore: &mut Backstore) -> Result<Vec<NuggetMetadata>> {
    let layout = *backstore.layout();
    let width = layout.md_bytes_per_nugget as usize;
    if width == 0 {
        return Ok(vec![
            NuggetMetadata::new(UNASSIGNED_CIPHER, 0);
            layout.num_nuggets as usize
        ]);
    }

    let mut region = vec![0u8; width * layout.num_nuggets as usize];
    backstore.read(&mut region, layout.md_offset)?;
    Ok(region.chunks_exact(width).map(NuggetMetadata::from_bytes).collect())
}
