//! Fixed-offset header fields
//!
//! Headers live in the first [`HEADER_REGION_END`] bytes of the backing file.
//! Every field except the master root hash and the initialized flag is also a
//! leaf of the header Merkle tree, so committing a header always refreshes
//! the persisted root.
//!
//! # Layout
//!
//! ```text
//! offset  bytes  field
//!      0      4  version
//!      4     16  salt
//!     20     32  master root hash
//!     52      8  global counter value
//!     60     32  verification tag
//!     92      4  nugget count
//!     96      4  flakes per nugget
//!    100      4  flake size
//!    104      1  initialized flag
//! ```
//!
//! [`HEADER_REGION_END`]: crate::layout::HEADER_REGION_END

use crate::backstore::Backstore;
use crate::error::Result;
use crate::merkle::MerkleTree;

/// On-disk format version written at creation
pub const CURRENT_VERSION: u32 = 1;

/// Value of the initialized flag once creation has completed
pub const IS_INITIALIZED: u8 = 0x3C;

pub const SALT_BYTES: usize = 16;
pub const HASH_BYTES: usize = 32;

/// Header field identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderType {
    Version,
    Salt,
    MasterRootHash,
    GlobalVersion,
    Verification,
    NumNuggets,
    FlakesPerNugget,
    FlakeSize,
    Initialized,
}

impl HeaderType {
    /// All headers in on-disk order
    pub const ALL: [HeaderType; 9] = [
        HeaderType::Version,
        HeaderType::Salt,
        HeaderType::MasterRootHash,
        HeaderType::GlobalVersion,
        HeaderType::Verification,
        HeaderType::NumNuggets,
        HeaderType::FlakesPerNugget,
        HeaderType::FlakeSize,
        HeaderType::Initialized,
    ];

    /// Headers covered by the Merkle tree, in leaf order
    pub const MERKLE_LEAVES: [HeaderType; 7] = [
        HeaderType::GlobalVersion,
        HeaderType::Version,
        HeaderType::Salt,
        HeaderType::Verification,
        HeaderType::NumNuggets,
        HeaderType::FlakesPerNugget,
        HeaderType::FlakeSize,
    ];

    /// Absolute byte offset of the field
    pub const fn offset(self) -> u64 {
        match self {
            HeaderType::Version => 0,
            HeaderType::Salt => 4,
            HeaderType::MasterRootHash => 20,
            HeaderType::GlobalVersion => 52,
            HeaderType::Verification => 60,
            HeaderType::NumNuggets => 92,
            HeaderType::FlakesPerNugget => 96,
            HeaderType::FlakeSize => 100,
            HeaderType::Initialized => 104,
        }
    }

    /// Field width in bytes
    pub const fn len(self) -> usize {
        match self {
            HeaderType::Version => 4,
            HeaderType::Salt => SALT_BYTES,
            HeaderType::MasterRootHash => HASH_BYTES,
            HeaderType::GlobalVersion => 8,
            HeaderType::Verification => HASH_BYTES,
            HeaderType::NumNuggets => 4,
            HeaderType::FlakesPerNugget => 4,
            HeaderType::FlakeSize => 4,
            HeaderType::Initialized => 1,
        }
    }

    /// Index of this header's Merkle leaf, if it has one
    pub fn merkle_leaf(self) -> Option<usize> {
        Self::MERKLE_LEAVES.iter().position(|kind| *kind == self)
    }
}

/// A header field and its raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub kind: HeaderType,
    pub data: Vec<u8>,
}

impl Header {
    /// Build a header from raw bytes, zero-padding or truncating to width
    pub fn new(kind: HeaderType, bytes: &[u8]) -> Self {
        let mut data = vec![0u8; kind.len()];
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
        Header { kind, data }
    }

    pub fn from_u32(kind: HeaderType, value: u32) -> Self {
        Self::new(kind, &value.to_le_bytes())
    }

    pub fn from_u64(kind: HeaderType, value: u64) -> Self {
        Self::new(kind, &value.to_le_bytes())
    }

    /// Interpret a 4-byte field as little-endian
    pub fn as_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        let n = self.data.len().min(4);
        bytes[..n].copy_from_slice(&self.data[..n]);
        u32::from_le_bytes(bytes)
    }

    /// Interpret an 8-byte field as little-endian
    pub fn as_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        let n = self.data.len().min(8);
        bytes[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(bytes)
    }
}

/// Read a header field from its fixed offset
pub fn open_header(backstore: &mut Backstore, kind: HeaderType) -> Result<Header> {
    let mut data = vec![0u8; kind.len()];
    backstore.read(&mut data, kind.offset())?;
    Ok(Header { kind, data })
}

/// Write a header field without touching the Merkle tree
///
/// Used while a device is being created, before the tree exists.
pub fn write_header(backstore: &mut Backstore, header: &Header) -> Result<()> {
    let data = Header::new(header.kind, &header.data);
    backstore.write(&data.data, header.kind.offset())
}

/// Write a header field back and refresh its Merkle leaf
///
/// When the field is covered by the tree the new root is persisted to the
/// master root hash header in the same call.
pub fn commit_header(
    backstore: &mut Backstore,
    tree: &mut MerkleTree,
    header: &Header,
) -> Result<()> {
    write_header(backstore, header)?;

    if let Some(leaf) = header.kind.merkle_leaf() {
        tree.update_leaf(leaf, &header.data);
        let root = Header::new(HeaderType::MasterRootHash, &tree.root());
        write_header(backstore, &root)?;
    }

    Ok(())
}
