//! SHA-256 Merkle tree over the integrity-covered headers
//!
//! Leaves are `H(0x00 || data)`, interior nodes `H(0x01 || left || right)`.
//! A node without a sibling is promoted to the next level unchanged. The tree
//! is never persisted; only its root is, in the master root hash header.

use crate::backstore::Backstore;
use crate::error::Result;
use crate::header::{open_header, HeaderType};
use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

fn hash_node(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// In-memory Merkle tree, stored level by level from the leaves up
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
}

impl MerkleTree {
    /// Build a tree from raw leaf data
    pub fn from_leaves<T: AsRef<[u8]>>(leaves: &[T]) -> Self {
        let hashed = leaves.iter().map(|leaf| hash_leaf(leaf.as_ref())).collect();
        let mut tree = MerkleTree {
            levels: vec![hashed],
        };
        tree.rebuild_upper_levels();
        tree
    }

    /// Build the header tree from the bytes currently on disk
    pub fn from_backstore(backstore: &mut Backstore) -> Result<Self> {
        let mut leaves = Vec::with_capacity(HeaderType::MERKLE_LEAVES.len());
        for kind in HeaderType::MERKLE_LEAVES {
            leaves.push(open_header(backstore, kind)?.data);
        }
        Ok(Self::from_leaves(&leaves))
    }

    /// Root hash (all zeros for an empty tree)
    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|level| level.first())
            .copied()
            .unwrap_or([0u8; 32])
    }

    pub fn leaf_count(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    /// Replace one leaf and recompute the path to the root
    pub fn update_leaf(&mut self, index: usize, data: &[u8]) {
        if index >= self.leaf_count() {
            tracing::warn!("Ignoring update of missing Merkle leaf {}", index);
            return;
        }

        self.levels[0][index] = hash_leaf(data);

        let mut idx = index;
        for depth in 1..self.levels.len() {
            let parent = idx / 2;
            let below = &self.levels[depth - 1];
            let left = 2 * parent;
            let hash = match below.get(left + 1) {
                Some(right) => hash_node(&below[left], right),
                None => below[left],
            };
            self.levels[depth][parent] = hash;
            idx = parent;
        }
    }

    /// Check that `data` is the content of leaf `index`
    pub fn verify_leaf(&self, index: usize, data: &[u8]) -> bool {
        self.levels
            .first()
            .and_then(|leaves| leaves.get(index))
            .map(|leaf| *leaf == hash_leaf(data))
            .unwrap_or(false)
    }

    fn rebuild_upper_levels(&mut self) {
        self.levels.truncate(1);
        while self.levels.last().map(Vec::len).unwrap_or(0) > 1 {
            let below = &self.levels[self.levels.len() - 1];
            let next = below
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => hash_node(left, right),
                    [single] => *single,
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            self.levels.push(next);
        }
    }
}
