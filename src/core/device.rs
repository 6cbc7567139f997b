//! Open device session
//!
//! A [`Device`] owns everything that belongs to one open backing file: the
//! backstore, the master secret, the header Merkle tree, the key cache, the
//! swap engine and in-memory copies of the keycount, journal and metadata
//! regions. Every change to those copies is written through to disk before
//! the call that made it returns.

use crate::backstore::Backstore;
use crate::cipher::SwappableCipher;
use crate::config::{DeviceConfig, ResolvedConfig};
use crate::counter::{counter_value, MonotonicCounter};
use crate::dispatch;
use crate::error::{Result, SwitchCryptError};
use crate::header::{
    commit_header, open_header, write_header, Header, HeaderType, CURRENT_VERSION, IS_INITIALIZED,
    SALT_BYTES,
};
use crate::journal::{commit_tj_entry, load_tj_entries, wipe_tj_entries, TJournalEntry};
use crate::keycount::{commit_keycount, load_keycounts};
use crate::keys::{Blake3Kdf, Kdf, KeyCache};
use crate::layout::Layout;
use crate::merkle::MerkleTree;
use crate::metadata::{commit_nugget_metadata, load_nugget_metadata, NuggetMetadata};
use crate::secret::{
    ct_eq, generate_salt, verification_tag, Argon2Deriver, MasterSecret, SecretDeriver,
};
use crate::swap::{Migration, SwapCommand, SwapEngine, SwapStrategy};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// External collaborators a device needs
pub struct Capabilities {
    pub counter: Box<dyn MonotonicCounter>,
    pub deriver: Box<dyn SecretDeriver>,
    pub kdf: Box<dyn Kdf>,
}

impl Capabilities {
    /// Argon2id password derivation and BLAKE3 key derivation over `counter`
    pub fn new<C: MonotonicCounter + 'static>(counter: C) -> Self {
        Capabilities {
            counter: Box::new(counter),
            deriver: Box::new(Argon2Deriver::default()),
            kdf: Box::new(Blake3Kdf),
        }
    }

    pub fn with_deriver<D: SecretDeriver + 'static>(mut self, deriver: D) -> Self {
        self.deriver = Box::new(deriver);
        self
    }

    pub fn with_kdf<K: Kdf + 'static>(mut self, kdf: K) -> Self {
        self.kdf = Box::new(kdf);
        self
    }
}

/// Summary of a device, suitable for printing
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStats {
    pub path: String,
    pub layout: Layout,
    pub logical_size: u64,
    pub strategy: String,
    pub primary_cipher: String,
    pub swap_cipher: String,
    pub active_cipher: String,
    pub nuggets_per_cipher: BTreeMap<String, u64>,
    pub pristine_nuggets: u64,
    pub key_cache_entries: usize,
    pub global_version: u64,
}

/// An open, unlocked device
pub struct Device {
    backstore: Backstore,
    master: MasterSecret,
    tree: MerkleTree,
    keys: KeyCache,
    engine: SwapEngine,
    counter: Box<dyn MonotonicCounter>,
    counter_slot: u8,
    counter_fallback: Option<u64>,
    keycounts: Vec<u64>,
    journals: Vec<TJournalEntry>,
    metadata: Vec<NuggetMetadata>,
    swap_tx: Sender<SwapCommand>,
    swap_rx: Receiver<SwapCommand>,
    global_version: u64,
    modified: bool,
}

impl Device {
    /// Create and initialize a new backing file
    ///
    /// Fails with `FileAlreadyExists` if `path` is present. The file is only
    /// marked initialized once every other header has been written.
    pub fn create<P: AsRef<Path>>(
        path: P,
        config: &DeviceConfig,
        password: &[u8],
        caps: Capabilities,
    ) -> Result<Self> {
        let resolved = config.validate()?;
        let layout = Layout::compute(
            resolved.backstore_size,
            resolved.flakes_per_nugget,
            resolved.flake_size,
            resolved.md_bytes_per_nugget,
        )?;
        check_strategy_geometry(&resolved, &layout)?;

        let counter = caps.counter;
        let global_version = match resolved.counter_fallback {
            Some(fallback) => {
                warn!("Using manual counter fallback {}; rollback protection is off", fallback);
                fallback
            }
            None => counter_value(&counter.read_counter(resolved.counter_slot)?) + 1,
        };

        let mut backstore = Backstore::create(path.as_ref(), resolved.backstore_size)?;
        backstore.apply_layout(layout);

        let salt = generate_salt();
        let master = caps.deriver.derive_master_secret(password, &salt)?;
        let tag = verification_tag(&master, &salt);

        for header in [
            Header::from_u32(HeaderType::Version, CURRENT_VERSION),
            Header::new(HeaderType::Salt, &salt),
            Header::from_u64(HeaderType::GlobalVersion, global_version),
            Header::new(HeaderType::Verification, &tag),
            Header::from_u32(HeaderType::NumNuggets, layout.num_nuggets),
            Header::from_u32(HeaderType::FlakesPerNugget, layout.flakes_per_nugget),
            Header::from_u32(HeaderType::FlakeSize, layout.flake_size),
        ] {
            write_header(&mut backstore, &header)?;
        }

        let engine = SwapEngine::new(resolved.strategy, resolved.primary, resolved.swap);
        let num_nuggets = layout.num_nuggets as u64;
        let metadata: Vec<NuggetMetadata> = (0..num_nuggets)
            .map(|nugget| {
                let cipher = engine.initial_cipher(nugget, num_nuggets, layout.nugget_size());
                NuggetMetadata::new(cipher.ident(), layout.md_bytes_per_nugget)
            })
            .collect();
        for (nugget, md) in metadata.iter().enumerate() {
            commit_nugget_metadata(&mut backstore, nugget as u64, md)?;
        }

        let tree = MerkleTree::from_backstore(&mut backstore)?;
        write_header(&mut backstore, &Header::new(HeaderType::MasterRootHash, &tree.root()))?;
        write_header(&mut backstore, &Header::new(HeaderType::Initialized, &[IS_INITIALIZED]))?;
        backstore.sync()?;

        if resolved.counter_fallback.is_none() {
            counter.write_counter(resolved.counter_slot, &global_version.to_le_bytes())?;
        }

        info!(
            "Created device {}: {} nuggets x {} flakes x {} bytes, strategy {}",
            backstore.path().display(),
            layout.num_nuggets,
            layout.flakes_per_nugget,
            layout.flake_size,
            resolved.strategy.name()
        );

        let (swap_tx, swap_rx) = unbounded();
        Ok(Device {
            keycounts: vec![0; num_nuggets as usize],
            journals: vec![TJournalEntry::new(layout.flakes_per_nugget); num_nuggets as usize],
            metadata,
            backstore,
            master,
            tree,
            keys: KeyCache::new(caps.kdf, resolved.key_cache_capacity),
            engine,
            counter,
            counter_slot: resolved.counter_slot,
            counter_fallback: resolved.counter_fallback,
            swap_tx,
            swap_rx,
            global_version,
            modified: false,
        })
    }

    /// Open an existing backing file
    ///
    /// Runs, in order: the initialized-flag check, the password check, the
    /// Merkle root check and the monotonic counter check. With
    /// `ignore_integrity` set the last two only log a warning.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: &DeviceConfig,
        password: &[u8],
        caps: Capabilities,
        ignore_integrity: bool,
    ) -> Result<Self> {
        let resolved = config.validate()?;
        let mut backstore = Backstore::open(path)?;

        let initialized = open_header(&mut backstore, HeaderType::Initialized)?;
        if initialized.data != [IS_INITIALIZED] {
            return Err(SwitchCryptError::BackstoreNotInitialized);
        }

        backstore.finish_setup(resolved.md_bytes_per_nugget);
        Self::soft_open(backstore, &resolved, password, caps, ignore_integrity)
    }

    fn soft_open(
        mut backstore: Backstore,
        resolved: &ResolvedConfig,
        password: &[u8],
        caps: Capabilities,
        ignore_integrity: bool,
    ) -> Result<Self> {
        let salt_header = open_header(&mut backstore, HeaderType::Salt)?;
        let mut salt = [0u8; SALT_BYTES];
        salt.copy_from_slice(&salt_header.data);

        let master = caps.deriver.derive_master_secret(password, &salt)?;
        let expected_tag = open_header(&mut backstore, HeaderType::Verification)?;
        if !ct_eq(&verification_tag(&master, &salt), &expected_tag.data) {
            return Err(SwitchCryptError::BadPassword);
        }

        let tree = MerkleTree::from_backstore(&mut backstore)?;
        let root = open_header(&mut backstore, HeaderType::MasterRootHash)?;
        if !ct_eq(&tree.root(), &root.data) {
            if !ignore_integrity {
                return Err(SwitchCryptError::IntegrityFailure(
                    "header Merkle root does not match master root hash".to_string(),
                ));
            }
            warn!("Header Merkle root mismatch ignored by request");
        }

        let global_version = open_header(&mut backstore, HeaderType::GlobalVersion)?.as_u64();
        let counter = caps.counter;
        if ignore_integrity {
            debug!("Skipping monotonic counter check");
        } else {
            let expected = match resolved.counter_fallback {
                Some(fallback) => {
                    warn!("Using manual counter fallback {}; rollback protection is off", fallback);
                    fallback
                }
                None => counter_value(&counter.read_counter(resolved.counter_slot)?),
            };
            if expected != global_version {
                return Err(SwitchCryptError::IntegrityFailure(format!(
                    "global version {} does not match monotonic counter {}",
                    global_version, expected
                )));
            }
        }

        backstore.layout().validate()?;

        let keycounts = load_keycounts(&mut backstore)?;
        let journals = load_tj_entries(&mut backstore)?;
        let metadata = load_nugget_metadata(&mut backstore)?;
        for (nugget, md) in metadata.iter().enumerate() {
            if SwappableCipher::from_ident(md.cipher_ident).is_none() {
                return Err(SwitchCryptError::IntegrityFailure(format!(
                    "nugget {} names unknown cipher {}",
                    nugget, md.cipher_ident
                )));
            }
        }

        let mut keys = KeyCache::new(caps.kdf, resolved.key_cache_capacity);
        for (nugget, entry) in journals.iter().enumerate() {
            if entry.is_pristine() {
                continue;
            }
            let nugget = nugget as u64;
            keys.nugget_key(&master, nugget);
            for flake in entry.bitmask.iter_set() {
                keys.flake_key(&master, nugget, flake as u32, keycounts[nugget as usize]);
            }
        }

        info!(
            "Opened device {}: {} nuggets, {} cached keys",
            backstore.path().display(),
            backstore.layout().num_nuggets,
            keys.len()
        );

        let (swap_tx, swap_rx) = unbounded();
        Ok(Device {
            backstore,
            master,
            tree,
            keys,
            engine: SwapEngine::new(resolved.strategy, resolved.primary, resolved.swap),
            counter,
            counter_slot: resolved.counter_slot,
            counter_fallback: resolved.counter_fallback,
            keycounts,
            journals,
            metadata,
            swap_tx,
            swap_rx,
            global_version,
            modified: false,
        })
    }

    /// Read `buf.len()` bytes at `offset`
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        dispatch::dispatch_read(self, buf, offset)
    }

    /// Write `buf` at `offset`
    pub fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        dispatch::dispatch_write(self, buf, offset)
    }

    /// Handle for queueing swap commands from another thread
    pub fn swap_sender(&self) -> Sender<SwapCommand> {
        self.swap_tx.clone()
    }

    /// Apply at most one queued swap command; true if one was consumed
    pub fn consume_pending_swap(&mut self) -> bool {
        match self.swap_rx.try_recv() {
            Ok(command) => {
                if self.engine.apply(command) {
                    info!("Active cipher is now {}", self.engine.active_cipher());
                } else {
                    debug!("Swap command ignored under {}", self.engine.strategy().name());
                }
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Return every nugget to pristine without touching ciphertext
    pub fn wipe_journal(&mut self) -> Result<()> {
        wipe_tj_entries(&mut self.backstore)?;
        for entry in &mut self.journals {
            entry.bitmask.clear_all();
        }
        self.modified = true;
        warn!("Transaction journal wiped on {}", self.backstore.path().display());
        Ok(())
    }

    /// Bytes addressable through [`Device::read`] and [`Device::write`]
    pub fn size(&self) -> u64 {
        self.engine.logical_nuggets(self.num_nuggets()) * self.nugget_size()
    }

    pub fn layout(&self) -> &Layout {
        self.backstore.layout()
    }

    pub fn num_nuggets(&self) -> u64 {
        self.layout().num_nuggets as u64
    }

    pub fn nugget_size(&self) -> u64 {
        self.layout().nugget_size()
    }

    pub fn flake_size(&self) -> u64 {
        self.layout().flake_size as u64
    }

    pub fn engine(&self) -> &SwapEngine {
        &self.engine
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.keys
    }

    pub fn merkle_tree(&self) -> &MerkleTree {
        &self.tree
    }

    pub fn keycount(&self, nugget: u64) -> Option<u64> {
        self.keycounts.get(nugget as usize).copied()
    }

    pub fn journal(&self, nugget: u64) -> Option<&TJournalEntry> {
        self.journals.get(nugget as usize)
    }

    pub fn nugget_metadata(&self, nugget: u64) -> Option<&NuggetMetadata> {
        self.metadata.get(nugget as usize)
    }

    /// Cipher currently recorded for a nugget
    pub fn nugget_cipher(&self, nugget: u64) -> Result<SwappableCipher> {
        let ident = self
            .metadata
            .get(nugget as usize)
            .map(|md| md.cipher_ident)
            .ok_or(SwitchCryptError::OutOfBounds {
                offset: nugget,
                len: 1,
                size: self.num_nuggets(),
            })?;
        SwappableCipher::from_ident(ident).ok_or_else(|| {
            SwitchCryptError::IntegrityFailure(format!(
                "nugget {} names unknown cipher {}",
                nugget, ident
            ))
        })
    }

    pub fn is_pristine(&self, nugget: u64) -> bool {
        self.journals
            .get(nugget as usize)
            .map(TJournalEntry::is_pristine)
            .unwrap_or(true)
    }

    pub fn global_version(&self) -> u64 {
        self.global_version
    }

    pub fn stats(&self) -> DeviceStats {
        let mut nuggets_per_cipher = BTreeMap::new();
        for md in &self.metadata {
            let name = SwappableCipher::from_ident(md.cipher_ident)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| format!("unknown({})", md.cipher_ident));
            *nuggets_per_cipher.entry(name).or_insert(0u64) += 1;
        }

        DeviceStats {
            path: self.backstore.path().display().to_string(),
            layout: *self.layout(),
            logical_size: self.size(),
            strategy: self.engine.strategy().name(),
            primary_cipher: self.engine.primary().name().to_string(),
            swap_cipher: self.engine.swap().name().to_string(),
            active_cipher: self.engine.active_cipher().name().to_string(),
            nuggets_per_cipher,
            pristine_nuggets: self.journals.iter().filter(|e| e.is_pristine()).count() as u64,
            key_cache_entries: self.keys.len(),
            global_version: self.global_version,
        }
    }

    /// Flush and release the device
    ///
    /// A device that was written to gets a new global version, anchored in
    /// the monotonic counter, so older copies of the file fail to open.
    pub fn close(mut self) -> Result<()> {
        if self.modified {
            self.bump_global_version()?;
        }
        self.backstore.sync()?;
        info!("Closed device {}", self.backstore.path().display());
        Ok(())
    }

    fn bump_global_version(&mut self) -> Result<()> {
        if self.counter_fallback.is_some() {
            warn!("Counter fallback in effect; global version left at {}", self.global_version);
            return Ok(());
        }

        let current = counter_value(&self.counter.read_counter(self.counter_slot)?);
        let next = self.global_version.max(current) + 1;

        let header = Header::from_u64(HeaderType::GlobalVersion, next);
        commit_header(&mut self.backstore, &mut self.tree, &header)?;
        self.backstore.sync()?;
        self.counter.write_counter(self.counter_slot, &next.to_le_bytes())?;

        debug!("Global version bumped {} -> {}", self.global_version, next);
        self.global_version = next;
        Ok(())
    }

    /// Decrypt one flake into `out`; flakes not yet written read as zeros
    pub(crate) fn read_flake(&mut self, nugget: u64, flake: u32, out: &mut [u8]) -> Result<()> {
        let written = self
            .journals
            .get(nugget as usize)
            .map(|entry| entry.bitmask.is_set(flake as usize))
            .unwrap_or(false);
        if !written {
            out.fill(0);
            return Ok(());
        }

        let cipher = self.nugget_cipher(nugget)?;
        let generation = self.keycounts[nugget as usize];
        let key = self.keys.flake_key(&self.master, nugget, flake, generation);

        let offset = nugget * self.nugget_size() + flake as u64 * self.flake_size();
        self.backstore.read_body(out, offset)?;
        cipher.decrypt(&key, nugget, flake, out);
        Ok(())
    }

    /// Encrypt and store one full flake, then mark it current
    pub(crate) fn write_flake(&mut self, nugget: u64, flake: u32, plaintext: &[u8]) -> Result<()> {
        let cipher = self.nugget_cipher(nugget)?;
        let generation = self.keycounts[nugget as usize];
        let key = self.keys.flake_key(&self.master, nugget, flake, generation);

        let mut ciphertext = plaintext.to_vec();
        cipher.encrypt(&key, nugget, flake, &mut ciphertext);
        let offset = nugget * self.nugget_size() + flake as u64 * self.flake_size();
        self.backstore.write_body(&ciphertext, offset)?;

        let entry = &mut self.journals[nugget as usize];
        entry.bitmask.set(flake as usize);
        commit_tj_entry(&mut self.backstore, nugget, entry)?;
        self.modified = true;
        Ok(())
    }

    /// Reassign a pristine nugget to `cipher` without re-encrypting
    pub(crate) fn flip_label(&mut self, nugget: u64, cipher: SwappableCipher) -> Result<()> {
        let md = &mut self.metadata[nugget as usize];
        md.cipher_ident = cipher.ident();
        commit_nugget_metadata(&mut self.backstore, nugget, md)?;
        self.modified = true;
        debug!("Nugget {} relabelled to {}", nugget, cipher);
        Ok(())
    }

    /// Re-encrypt a nugget under `cipher` and a new generation
    ///
    /// Current flakes are decrypted first, `patch` (an intra-nugget offset and
    /// bytes) is merged in, then the metadata, keycount and cleared journal
    /// are committed in that order before the flakes are written back.
    pub(crate) fn rekey(
        &mut self,
        nugget: u64,
        cipher: SwappableCipher,
        patch: Option<(u64, &[u8])>,
    ) -> Result<()> {
        let flake_size = self.flake_size() as usize;
        let fpn = self.layout().flakes_per_nugget as usize;
        let dirty = self.journals[nugget as usize].bitmask.clone();
        let mut plain = vec![0u8; self.nugget_size() as usize];

        let patch_range = patch.map(|(offset, data)| offset as usize..offset as usize + data.len());

        for flake in dirty.iter_set() {
            let range = flake * flake_size..(flake + 1) * flake_size;
            let overwritten = patch_range
                .as_ref()
                .map(|p| p.start <= range.start && range.end <= p.end)
                .unwrap_or(false);
            if !overwritten {
                self.read_flake(nugget, flake as u32, &mut plain[range])?;
            }
        }

        let mut rewrite = dirty;
        if let (Some((_, data)), Some(range)) = (patch, patch_range.clone()) {
            if !range.is_empty() {
                plain[range.clone()].copy_from_slice(data);
                rewrite.set_range(range.start / flake_size..(range.end - 1) / flake_size + 1);
            }
        }

        let md = &mut self.metadata[nugget as usize];
        md.cipher_ident = cipher.ident();
        commit_nugget_metadata(&mut self.backstore, nugget, md)?;

        let next = self.keycounts[nugget as usize] + 1;
        commit_keycount(&mut self.backstore, nugget, next)?;
        self.keycounts[nugget as usize] = next;

        let entry = &mut self.journals[nugget as usize];
        entry.bitmask.clear_all();
        commit_tj_entry(&mut self.backstore, nugget, entry)?;

        for flake in 0..fpn {
            if rewrite.is_set(flake) {
                let range = flake * flake_size..(flake + 1) * flake_size;
                self.write_flake(nugget, flake as u32, &plain[range])?;
            }
        }

        self.modified = true;
        debug!(
            "Nugget {} rekeyed under {} (generation {}, {} flakes)",
            nugget,
            cipher,
            self.keycounts[nugget as usize],
            rewrite.count_ones()
        );
        Ok(())
    }

    /// Carry out a swap engine decision for one nugget
    pub(crate) fn migrate(&mut self, nugget: u64, migration: Migration) -> Result<()> {
        let target = self.engine.active_cipher();
        match migration {
            Migration::None => Ok(()),
            Migration::LabelFlip => self.flip_label(nugget, target),
            Migration::Rekey => self.rekey(nugget, target, None),
        }
    }

    /// Whether nuggets are mirrored across the two halves of the body
    pub(crate) fn is_mirrored(&self) -> bool {
        matches!(self.engine.strategy(), SwapStrategy::Mirrored)
    }
}

fn check_strategy_geometry(resolved: &ResolvedConfig, layout: &Layout) -> Result<()> {
    match resolved.strategy {
        SwapStrategy::Mirrored if layout.num_nuggets < 2 => {
            Err(SwitchCryptError::InvalidBackstoreSize(format!(
                "mirrored strategy needs at least 2 nuggets, got {}",
                layout.num_nuggets
            )))
        }
        SwapStrategy::Selective(range) if range.end > layout.writeable_size() => {
            Err(SwitchCryptError::InvalidSelectiveRange(format!(
                "{}..{} exceeds device size {}",
                range.start,
                range.end,
                layout.writeable_size()
            )))
        }
        _ => Ok(()),
    }
}
