//! Nugget and flake key derivation with an LRU-backed cache
//!
//! Key hierarchy:
//!
//! ```text
//! master secret --(nugget index)--> nugget key
//! nugget key --(nugget || flake || generation)--> flake key
//! ```
//!
//! Bumping a nugget's keycount changes the generation input, so every flake
//! key of that nugget changes while the nugget key stays the same.

use ahash::RandomState;
use lru::LruCache;
use std::num::NonZeroUsize;

/// 256-bit symmetric key
pub type Key = [u8; 32];

const NUGGET_CONTEXT: &[u8] = b"switchcrypt nugget key";
const FLAKE_CONTEXT: &[u8] = b"switchcrypt flake key";

/// One-way keyed derivation function
pub trait Kdf: Send {
    /// Derive a 32-byte key from `key` and a context string
    fn derive(&self, key: &Key, context: &[u8]) -> Key;
}

/// BLAKE3 keyed-hash derivation
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Kdf;

impl Kdf for Blake3Kdf {
    fn derive(&self, key: &Key, context: &[u8]) -> Key {
        *blake3::keyed_hash(key, context).as_bytes()
    }
}

/// Composite cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Nugget(u64),
    Flake {
        nugget: u64,
        flake: u32,
        generation: u64,
    },
}

/// Memoizes derived keys for the lifetime of an open device
pub struct KeyCache {
    kdf: Box<dyn Kdf>,
    entries: LruCache<CacheKey, Key, RandomState>,
}

impl KeyCache {
    /// Create a cache; `None` or zero capacity means unbounded
    pub fn new(kdf: Box<dyn Kdf>, capacity: Option<usize>) -> Self {
        let entries = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::with_hasher(cap, RandomState::new()),
            None => LruCache::unbounded_with_hasher(RandomState::new()),
        };
        KeyCache { kdf, entries }
    }

    /// Nugget key, derived on first use
    pub fn nugget_key(&mut self, master: &Key, nugget: u64) -> Key {
        let cache_key = CacheKey::Nugget(nugget);
        if let Some(key) = self.entries.get(&cache_key) {
            return *key;
        }

        let mut context = Vec::with_capacity(NUGGET_CONTEXT.len() + 8);
        context.extend_from_slice(NUGGET_CONTEXT);
        context.extend_from_slice(&nugget.to_le_bytes());

        let key = self.kdf.derive(master, &context);
        self.insert(cache_key, key);
        key
    }

    /// Flake key for a given generation, derived on first use
    pub fn flake_key(&mut self, master: &Key, nugget: u64, flake: u32, generation: u64) -> Key {
        let cache_key = CacheKey::Flake {
            nugget,
            flake,
            generation,
        };
        if let Some(key) = self.entries.get(&cache_key) {
            return *key;
        }

        let nugget_key = self.nugget_key(master, nugget);

        let mut context = Vec::with_capacity(FLAKE_CONTEXT.len() + 20);
        context.extend_from_slice(FLAKE_CONTEXT);
        context.extend_from_slice(&nugget.to_le_bytes());
        context.extend_from_slice(&flake.to_le_bytes());
        context.extend_from_slice(&generation.to_le_bytes());

        let key = self.kdf.derive(&nugget_key, &context);
        self.insert(cache_key, key);
        key
    }

    /// Insert a key; re-inserting an existing entry is a no-op
    pub fn insert(&mut self, cache_key: CacheKey, key: Key) {
        if self.entries.contains(&cache_key) {
            return;
        }
        self.entries.put(cache_key, key);
    }

    /// Check presence without touching recency
    pub fn contains(&self, cache_key: &CacheKey) -> bool {
        self.entries.contains(cache_key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
