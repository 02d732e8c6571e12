//! Storage engine
//!
//! Owns the backing stream and every in-memory structure of an open compound
//! file: header, FAT/DIFAT, MiniFAT, ministream and directory. Storage and
//! stream handles reach it through a shared mutex and address entries by
//! SID plus an identity token.
//!
//! Nothing is written to the backing stream until [`Engine::write_out`]:
//! data, directory and MiniFAT sectors first, then FAT and DIFAT sectors,
//! then the header.

use super::config::{StorageOptions, UpdateMode, Version};
use super::consts::*;
use super::difat::Difat;
use super::directory::entry::{DirEntry, ObjectType};
use super::directory::{Directory, Entry, ROOT_SID};
use super::fat::Fat;
use super::header::Header;
use super::minifat::MiniFat;
use super::sector::{Backing, SectorStore};
use super::time::filetime_now;
use super::view::{ChainView, MiniDevice, UnitDevice};
use crate::common::binary::read_u16_le;
use crate::common::{Error, Result};
use fixedbitset::FixedBitSet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Weak};

/// Engine shared between a container and its handles
pub(crate) type SharedEngine<F> = Arc<Mutex<Engine<F>>>;

/// Run `f` against the engine behind a handle's weak reference
pub(crate) fn with_engine<F: Backing, T>(
    engine: &Weak<Mutex<Engine<F>>>,
    f: impl FnOnce(&mut Engine<F>) -> Result<T>,
) -> Result<T> {
    let shared = engine.upgrade().ok_or(Error::Disposed)?;
    let mut guard = shared.lock();
    f(&mut guard)
}

/// Structures decoded from the backing stream
struct Tables {
    header: Header,
    fat: Fat,
    difat: Difat,
    minifat: MiniFat,
    directory: Directory,
    dir_chain: Vec<u32>,
    minifat_chain: Vec<u32>,
    ministream: Vec<u32>,
}

/// An open compound file
pub(crate) struct Engine<F> {
    pub(super) store: SectorStore<F>,
    pub(super) header: Header,
    pub(super) fat: Fat,
    pub(super) difat: Difat,
    pub(super) minifat: MiniFat,
    pub(super) directory: Directory,
    /// Sectors of the directory stream
    pub(super) dir_chain: Vec<u32>,
    /// Sectors of the MiniFAT
    pub(super) minifat_chain: Vec<u32>,
    /// Sectors of the ministream (the root entry's chain)
    pub(super) ministream: Vec<u32>,
    /// Resolved stream chains by SID
    pub(super) chains: HashMap<u32, Vec<u32>>,
    pub(super) options: StorageOptions,
    /// Whether in-memory state differs from the backing stream
    pub(super) dirty: bool,
    /// Slot identities as of the last commit
    pub(super) committed_tokens: Vec<u64>,
}

impl<F: Backing> Engine<F> {
    /// Start a new, empty compound file on `inner`, discarding its content
    pub fn create(inner: F, options: StorageOptions) -> Result<Self> {
        if options.read_only {
            return Err(Error::InvalidOperation(
                "Cannot create a compound file read-only".to_string(),
            ));
        }
        let version = options.version;
        let mut store = SectorStore::new(inner, version.sector_size(), options.cache_sectors)?;
        store.set_sector_count(0)?;

        let mut engine = Self {
            store,
            header: Header::new(version),
            fat: Fat::new(version, options.sector_recycle),
            difat: Difat::default(),
            minifat: MiniFat::default(),
            directory: Directory::new(),
            dir_chain: Vec::new(),
            minifat_chain: Vec::new(),
            ministream: Vec::new(),
            chains: HashMap::new(),
            options,
            dirty: true,
            committed_tokens: Vec::new(),
        };
        engine.write_out()?;
        tracing::debug!(version = version.major(), "created compound file");
        Ok(engine)
    }

    /// Open an existing compound file
    pub fn open(inner: F, options: StorageOptions) -> Result<Self> {
        let mut store = SectorStore::new(inner, SECTOR_SIZE_V3, options.cache_sectors)?;
        let tables = Self::load_tables(&mut store, &options, 1)?;
        let mut engine = Self {
            store,
            header: tables.header,
            fat: tables.fat,
            difat: tables.difat,
            minifat: tables.minifat,
            directory: tables.directory,
            dir_chain: tables.dir_chain,
            minifat_chain: tables.minifat_chain,
            ministream: tables.ministream,
            chains: HashMap::new(),
            options,
            dirty: false,
            committed_tokens: Vec::new(),
        };
        engine.committed_tokens = engine.directory.tokens();
        tracing::debug!(
            version = engine.header.version.major(),
            fat_sectors = engine.difat.fat_sectors().len(),
            difat_sectors = engine.difat.difat_sectors().len(),
            mini_sectors = engine.minifat.len(),
            entries = engine.directory.len(),
            "opened compound file"
        );
        Ok(engine)
    }

    fn load_tables(
        store: &mut SectorStore<F>,
        options: &StorageOptions,
        first_token: u64,
    ) -> Result<Tables> {
        store.discard();
        let prefix = store.read_prefix(HEADER_SIZE).map_err(|e| match e {
            Error::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                Error::InvalidFormat("File is too small to be a compound file".to_string())
            },
            other => other,
        })?;

        let sector_size = match read_u16_le(&prefix, 0x1E)? {
            12 => SECTOR_SIZE_V4,
            _ => SECTOR_SIZE_V3,
        };
        if store.sector_size() != sector_size {
            store.reset_geometry(sector_size)?;
        }

        let header = Header::parse(&prefix, u64::from(store.physical_sectors()))?;
        let version = header.version;
        let difat = Difat::load(&header, store)?;
        let fat = Fat::load(difat.fat_sectors(), store, version, options.sector_recycle)?;

        let dir_chain = fat.resolve_chain(header.first_dir_sector)?;
        if dir_chain.is_empty() {
            return Err(Error::InvalidFormat("Directory chain is empty".to_string()));
        }
        let dir_bytes = Self::read_whole_chain(store, &dir_chain)?;
        let directory = Directory::load(&dir_bytes, version, first_token)?;

        let minifat_chain = match header.first_minifat_sector {
            ENDOFCHAIN | FREESECT => Vec::new(),
            start => fat.resolve_chain(start)?,
        };
        let minifat = MiniFat::from_bytes(&Self::read_whole_chain(store, &minifat_chain)?)?;

        let root = directory.root();
        let ministream = if root.size == 0 {
            Vec::new()
        } else {
            fat.resolve_chain(root.start_sector)?
        };
        if (ministream.len() as u64) * (sector_size as u64) < root.size {
            return Err(Error::CorruptedFile(format!(
                "Ministream of {} bytes does not fit its {} sectors",
                root.size,
                ministream.len()
            )));
        }

        Ok(Tables {
            header,
            fat,
            difat,
            minifat,
            directory,
            dir_chain,
            minifat_chain,
            ministream,
        })
    }

    fn read_whole_chain(store: &mut SectorStore<F>, chain: &[u32]) -> Result<Vec<u8>> {
        let len = (chain.len() * store.sector_size()) as u64;
        let mut bytes = vec![0u8; len as usize];
        ChainView::new(store, chain, len).read_at(0, &mut bytes)?;
        Ok(bytes)
    }

    fn install(&mut self, tables: Tables) {
        self.header = tables.header;
        self.fat = tables.fat;
        self.difat = tables.difat;
        self.minifat = tables.minifat;
        self.directory = tables.directory;
        self.dir_chain = tables.dir_chain;
        self.minifat_chain = tables.minifat_chain;
        self.ministream = tables.ministream;
        self.chains.clear();
    }

    /// Re-read everything from the backing stream. Tokens continue from the
    /// current counter so stale handles never match a new object.
    pub(super) fn reload(&mut self) -> Result<()> {
        let tables =
            Self::load_tables(&mut self.store, &self.options, self.directory.next_token())?;
        self.install(tables);
        self.dirty = false;
        Ok(())
    }

    pub fn version(&self) -> Version {
        self.header.version
    }

    pub fn mode(&self) -> UpdateMode {
        self.options.mode
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.options.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    // ---- persistence ----

    /// Write every pending change to the backing stream
    pub(super) fn write_out(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let sector_size = self.store.sector_size();
        let version = self.header.version;

        // Directory
        let dir_bytes = self.directory.to_bytes(version, sector_size);
        let mut chain = std::mem::take(&mut self.dir_chain);
        let resized = self.resize_regular(&mut chain, dir_bytes.len() / sector_size);
        self.dir_chain = chain;
        resized?;
        for (&sector, chunk) in self.dir_chain.iter().zip(dir_bytes.chunks(sector_size)) {
            self.store.put(sector, chunk.to_vec());
        }
        self.header.first_dir_sector = self.dir_chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.num_dir_sectors = self.dir_chain.len() as u32;

        // MiniFAT
        let minifat_bytes = self.minifat.to_bytes(sector_size);
        let mut chain = std::mem::take(&mut self.minifat_chain);
        let resized = self.resize_regular(&mut chain, minifat_bytes.len() / sector_size);
        self.minifat_chain = chain;
        resized?;
        for (&sector, chunk) in self.minifat_chain.iter().zip(minifat_bytes.chunks(sector_size)) {
            self.store.put(sector, chunk.to_vec());
        }
        self.header.first_minifat_sector =
            self.minifat_chain.first().copied().unwrap_or(ENDOFCHAIN);
        self.header.num_minifat_sectors = self.minifat_chain.len() as u32;

        // FAT and DIFAT, reserved last since reserving can grow the FAT
        self.difat.reserve(&mut self.fat, sector_size)?;
        self.difat.write(&self.fat, &mut self.header, &mut self.store)?;

        let mut tables = FixedBitSet::with_capacity(self.fat.len());
        for &sector in self.difat.fat_sectors().iter().chain(self.difat.difat_sectors()) {
            tables.insert(sector as usize);
        }
        let data_sectors = self
            .store
            .write_dirty(|sector| !tables.contains(sector as usize))?;
        let table_sectors = self.store.write_dirty(|_| true)?;
        if self.store.physical_sectors() < self.fat.high_water() {
            self.store.set_sector_count(self.fat.high_water())?;
        }
        self.store.write_header(&self.header.to_bytes())?;
        self.store.flush()?;

        self.dirty = false;
        self.committed_tokens = self.directory.tokens();
        tracing::info!(
            data_sectors,
            table_sectors,
            bytes = (u64::from(self.store.physical_sectors()) + 1) * sector_size as u64,
            "committed compound file"
        );
        Ok(())
    }

    /// Persist pending changes
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty {
            self.check_writable()?;
        }
        self.write_out()
    }

    /// Discard everything since the last commit
    pub fn revert(&mut self) -> Result<()> {
        if self.options.mode != UpdateMode::Transacted {
            return Err(Error::InvalidOperation(
                "revert requires transacted mode".to_string(),
            ));
        }
        self.reload()?;
        let tokens = std::mem::take(&mut self.committed_tokens);
        self.directory.restore_tokens(&tokens);
        self.committed_tokens = tokens;
        tracing::debug!("reverted uncommitted changes");
        Ok(())
    }

    /// Move the container to `destination`, writing the full image there,
    /// and hand back the previous backing stream
    pub fn switch_to(&mut self, destination: F) -> Result<F> {
        self.store.materialize(self.fat.high_water())?;
        let previous = self.store.replace_inner(destination);
        self.dirty = true;
        self.write_out()?;
        self.store.set_sector_count(self.fat.high_water())?;
        self.store.flush()?;
        tracing::info!(
            sectors = self.fat.high_water(),
            "switched compound file to a new backing stream"
        );
        Ok(previous)
    }

    /// Release the backing stream without writing anything
    pub fn into_inner(self) -> F {
        self.store.into_inner()
    }

    // ---- sector chains ----

    fn release_regular(&mut self, freed: &[u32]) {
        for &sector in freed {
            if self.options.erase_free_sectors {
                self.store.zero(sector);
            } else {
                self.store.forget(sector);
            }
        }
    }

    /// Grow or shrink a regular chain to `sectors` sectors. New sectors are
    /// zeroed; a failed allocation leaves the chain as it was.
    pub(super) fn resize_regular(&mut self, chain: &mut Vec<u32>, sectors: usize) -> Result<()> {
        let before = chain.len();
        if sectors > before {
            match self.fat.extend_chain(chain, sectors - before) {
                Ok(added) => {
                    for sector in added {
                        self.store.zero(sector);
                    }
                },
                Err(e) => {
                    self.fat.truncate_chain(chain, before);
                    return Err(e);
                },
            }
        } else if sectors < before {
            let freed = self.fat.truncate_chain(chain, sectors);
            self.release_regular(&freed);
        }
        Ok(())
    }

    /// Make the ministream at least `bytes` long
    fn grow_ministream(&mut self, bytes: u64) -> Result<()> {
        if bytes <= self.directory.root().size {
            return Ok(());
        }
        let sectors = bytes.div_ceil(self.store.sector_size() as u64) as usize;
        if sectors > self.ministream.len() {
            let mut chain = std::mem::take(&mut self.ministream);
            let resized = self.resize_regular(&mut chain, sectors);
            self.ministream = chain;
            resized?;
        }
        let start = self.ministream.first().copied().unwrap_or(ENDOFCHAIN);
        let root = self.directory.root_mut();
        root.size = bytes;
        root.start_sector = start;
        Ok(())
    }

    fn zero_mini(&mut self, sectors: &[u32]) -> Result<()> {
        let zeros = [0u8; MINI_SECTOR_SIZE];
        let mut device = MiniDevice::new(&mut self.store, &self.ministream);
        for &sector in sectors {
            device.write_unit(sector, 0, &zeros)?;
        }
        Ok(())
    }

    /// Grow or shrink a mini chain to `units` mini sectors, growing the
    /// ministream when needed
    pub(super) fn resize_mini(&mut self, chain: &mut Vec<u32>, units: usize) -> Result<()> {
        let before = chain.len();
        if units > before {
            let added = self.minifat.extend_chain(chain, units - before);
            let highest = added.iter().copied().max().unwrap_or(0);
            let needed = (u64::from(highest) + 1) * MINI_SECTOR_SIZE as u64;
            if let Err(e) = self.grow_ministream(needed) {
                self.minifat.truncate_chain(chain, before);
                return Err(e);
            }
            self.zero_mini(&added)?;
        } else if units < before {
            let freed = self.minifat.truncate_chain(chain, units);
            if self.options.erase_free_sectors {
                self.zero_mini(&freed)?;
            }
        }
        Ok(())
    }

    fn is_mini(&self, len: u64) -> bool {
        len < u64::from(self.header.mini_stream_cutoff)
    }

    fn check_stream_size(&self, len: u64) -> Result<()> {
        if self.header.version == Version::V3 && len > MAX_STREAM_SIZE_V3 {
            return Err(Error::Capacity(format!(
                "Stream length {} exceeds the 2 GiB limit of version 3 files",
                len
            )));
        }
        Ok(())
    }

    /// Take the chain of stream `sid` out of the cache, resolving it if needed
    fn take_chain(&mut self, sid: u32) -> Result<Vec<u32>> {
        if let Some(chain) = self.chains.remove(&sid) {
            return Ok(chain);
        }
        let entry = self.stream_entry(sid)?;
        let (size, start) = (entry.size, entry.start_sector);
        if size == 0 {
            return Ok(Vec::new());
        }

        let (chain, unit) = if self.is_mini(size) {
            let chain = self.minifat.resolve_chain(start)?;
            let capacity = self.ministream.len() * self.store.sector_size() / MINI_SECTOR_SIZE;
            if let Some(&bad) = chain.iter().find(|&&id| id as usize >= capacity) {
                return Err(Error::CorruptedFile(format!(
                    "Mini sector {} of stream {} lies beyond the ministream",
                    bad, sid
                )));
            }
            (chain, MINI_SECTOR_SIZE)
        } else {
            (self.fat.resolve_chain(start)?, self.store.sector_size())
        };
        if (chain.len() as u64) * (unit as u64) < size {
            return Err(Error::CorruptedFile(format!(
                "Stream {} declares {} bytes but its chain holds {} units",
                sid,
                size,
                chain.len()
            )));
        }
        Ok(chain)
    }

    /// Resolve and cache the chain of stream `sid`, surfacing corruption early
    pub fn validate_stream(&mut self, sid: u32) -> Result<()> {
        let chain = self.take_chain(sid)?;
        self.chains.insert(sid, chain);
        Ok(())
    }

    fn read_chain(
        &mut self,
        chain: &[u32],
        mini: bool,
        len: u64,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if mini {
            let mut device = MiniDevice::new(&mut self.store, &self.ministream);
            ChainView::new(&mut device, chain, len).read_at(pos, buf)
        } else {
            ChainView::new(&mut self.store, chain, len).read_at(pos, buf)
        }
    }

    fn write_chain(&mut self, chain: &[u32], mini: bool, pos: u64, data: &[u8]) -> Result<()> {
        if mini {
            let mut device = MiniDevice::new(&mut self.store, &self.ministream);
            ChainView::new(&mut device, chain, pos).write_at(pos, data)
        } else {
            ChainView::new(&mut self.store, chain, pos).write_at(pos, data)
        }
    }

    /// Zero the slack between the logical end and the end of the last unit
    fn zero_tail(&mut self, chain: &[u32], mini: bool, len: u64) -> Result<()> {
        let unit = if mini {
            MINI_SECTOR_SIZE
        } else {
            self.store.sector_size()
        };
        let capacity = (chain.len() * unit) as u64;
        if len < capacity {
            let zeros = vec![0u8; (capacity - len) as usize];
            self.write_chain(chain, mini, len, &zeros)?;
        }
        Ok(())
    }

    fn resize_chain(
        &mut self,
        chain: &mut Vec<u32>,
        old_len: u64,
        new_len: u64,
    ) -> Result<()> {
        let sector_size = self.store.sector_size() as u64;
        let mini_size = MINI_SECTOR_SIZE as u64;
        match (self.is_mini(old_len), self.is_mini(new_len)) {
            (true, true) => {
                if new_len > old_len {
                    self.zero_tail(chain, true, old_len)?;
                }
                self.resize_mini(chain, new_len.div_ceil(mini_size) as usize)
            },
            (false, false) => {
                if new_len > old_len {
                    self.zero_tail(chain, false, old_len)?;
                }
                self.resize_regular(chain, new_len.div_ceil(sector_size) as usize)
            },
            (true, false) => {
                // Promote: move the data out of the ministream
                let mut data = vec![0u8; old_len as usize];
                self.read_chain(chain, true, old_len, 0, &mut data)?;
                let mut fresh = Vec::new();
                self.resize_regular(&mut fresh, new_len.div_ceil(sector_size) as usize)?;
                self.write_chain(&fresh, false, 0, &data)?;
                self.resize_mini(chain, 0)?;
                *chain = fresh;
                Ok(())
            },
            (false, true) => {
                // Demote: move the kept prefix into the ministream
                let mut data = vec![0u8; new_len as usize];
                self.read_chain(chain, false, old_len, 0, &mut data)?;
                let mut fresh = Vec::new();
                self.resize_mini(&mut fresh, new_len.div_ceil(mini_size) as usize)?;
                self.write_chain(&fresh, true, 0, &data)?;
                self.resize_regular(chain, 0)?;
                *chain = fresh;
                Ok(())
            },
        }
    }

    // ---- stream data ----

    fn stream_entry(&self, sid: u32) -> Result<&DirEntry> {
        match self.directory.get(sid) {
            Some(entry) if entry.object_type == ObjectType::Stream => Ok(entry),
            _ => Err(Error::NotFound(format!("Stream {} does not exist", sid))),
        }
    }

    /// Change the length of stream `sid`, moving it between the ministream
    /// and regular sectors when it crosses the cutoff
    pub(super) fn resize_stream(&mut self, sid: u32, new_len: u64) -> Result<()> {
        let old_len = self.stream_entry(sid)?.size;
        if new_len == old_len {
            return Ok(());
        }
        self.check_stream_size(new_len)?;

        let mut chain = self.take_chain(sid)?;
        let result = self.resize_chain(&mut chain, old_len, new_len);
        if result.is_ok()
            && let Some(entry) = self.directory.get_mut(sid)
        {
            entry.size = new_len;
            entry.start_sector = chain.first().copied().unwrap_or(ENDOFCHAIN);
            self.dirty = true;
        }
        self.chains.insert(sid, chain);
        result
    }

    /// Read from stream `sid` at `pos`, returning the byte count
    pub(super) fn read_sid(&mut self, sid: u32, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.stream_entry(sid)?.size;
        if pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let mini = self.is_mini(len);
        let chain = self.take_chain(sid)?;
        let result = self.read_chain(&chain, mini, len, pos, buf);
        self.chains.insert(sid, chain);
        result
    }

    /// Write all of `data` into stream `sid` at `pos`, growing it as needed
    pub(super) fn write_sid(&mut self, sid: u32, pos: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let end = pos
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::Capacity("Write position overflows".to_string()))?;
        let len = self.stream_entry(sid)?.size;
        if end > len {
            self.resize_stream(sid, end)?;
        }
        let mini = self.is_mini(len.max(end));
        let chain = self.take_chain(sid)?;
        let result = self.write_chain(&chain, mini, pos, data);
        self.chains.insert(sid, chain);
        self.dirty = true;
        result
    }

    // ---- handle-facing operations ----

    /// Entry behind a handle
    pub fn entry(&self, sid: u32, token: u64) -> Result<&DirEntry> {
        self.directory.resolve(sid, token)
    }

    fn container(&self, sid: u32, token: u64) -> Result<&DirEntry> {
        let entry = self.directory.resolve(sid, token)?;
        if !entry.object_type.is_container() {
            return Err(Error::NotFound(format!(
                "{} is a stream, not a storage",
                entry.name_string()
            )));
        }
        Ok(entry)
    }

    fn stream(&self, sid: u32, token: u64) -> Result<&DirEntry> {
        let entry = self.directory.resolve(sid, token)?;
        if entry.object_type != ObjectType::Stream {
            return Err(Error::NotFound(format!(
                "{} is a storage, not a stream",
                entry.name_string()
            )));
        }
        Ok(entry)
    }

    /// Token of the root entry
    pub fn root_token(&self) -> u64 {
        self.directory.root().token
    }

    /// Public metadata of an entry
    pub fn describe(&self, sid: u32, token: u64) -> Result<Entry> {
        let entry = self.directory.resolve(sid, token)?;
        Ok(Entry::from_dir(sid, entry, self.directory.path_of(sid)))
    }

    /// Find a child of storage `sid` by name
    pub fn lookup(&self, sid: u32, token: u64, name: &str) -> Result<Option<(u32, u64, ObjectType)>> {
        self.container(sid, token)?;
        Ok(self.directory.find(sid, name).and_then(|child| {
            self.directory
                .get(child)
                .map(|entry| (child, entry.token, entry.object_type))
        }))
    }

    fn touch(&mut self, sid: u32) {
        if let Some(entry) = self.directory.get_mut(sid) {
            entry.modified = filetime_now();
        }
    }

    /// Create a storage or stream inside storage `sid`
    pub fn create_child(
        &mut self,
        sid: u32,
        token: u64,
        name: &str,
        object_type: ObjectType,
    ) -> Result<(u32, u64)> {
        self.check_writable()?;
        self.container(sid, token)?;
        let child = self.directory.insert(sid, name, object_type)?;
        let Some(entry) = self.directory.get_mut(child) else {
            return Err(Error::NotFound(name.to_string()));
        };
        if object_type == ObjectType::Storage {
            let now = filetime_now();
            entry.created = now;
            entry.modified = now;
        }
        let child_token = entry.token;
        self.touch(sid);
        self.dirty = true;
        tracing::trace!(parent = sid, sid = child, name, "created entry");
        Ok((child, child_token))
    }

    /// Delete the child `name` of storage `sid`, with everything below it
    pub fn delete_child(&mut self, sid: u32, token: u64, name: &str) -> Result<()> {
        self.check_writable()?;
        self.container(sid, token)?;
        let child = self
            .directory
            .find(sid, name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        if child == ROOT_SID {
            return Err(Error::InvalidOperation(
                "The root storage cannot be deleted".to_string(),
            ));
        }
        self.directory.ensure_valid_tree(sid)?;

        let mut victims = vec![child];
        if self
            .directory
            .get(child)
            .is_some_and(|entry| entry.object_type.is_container())
        {
            victims.extend(self.directory.descendants(child));
        }

        // Resolve every chain before freeing anything
        let mut doomed = Vec::new();
        for &victim in &victims {
            let Some(entry) = self.directory.get(victim) else {
                continue;
            };
            if entry.object_type == ObjectType::Stream {
                let mini = self.is_mini(entry.size);
                doomed.push((victim, mini, self.take_chain(victim)?));
            }
        }
        for (victim, mini, mut chain) in doomed {
            if mini {
                self.resize_mini(&mut chain, 0)?;
            } else {
                self.resize_regular(&mut chain, 0)?;
            }
            self.chains.remove(&victim);
        }

        self.directory.remove(sid, child)?;
        for &victim in &victims[1..] {
            self.directory.release(victim);
        }
        self.touch(sid);
        self.dirty = true;
        tracing::trace!(parent = sid, name, entries = victims.len(), "deleted entry");
        Ok(())
    }

    /// Rename the child `old` of storage `sid`
    pub fn rename_child(&mut self, sid: u32, token: u64, old: &str, new: &str) -> Result<()> {
        self.check_writable()?;
        self.container(sid, token)?;
        let child = self
            .directory
            .find(sid, old)
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        self.directory.rename(sid, child, new)?;
        self.touch(sid);
        self.dirty = true;
        Ok(())
    }

    /// Children of storage `sid` in name order, optionally with all descendants
    pub fn enumerate(&self, sid: u32, token: u64, recursive: bool) -> Result<Vec<Entry>> {
        self.container(sid, token)?;
        let base = if sid == ROOT_SID {
            Vec::new()
        } else {
            self.directory.path_of(sid)
        };

        let mut result = Vec::new();
        let mut stack: Vec<(u32, Vec<String>)> = self
            .directory
            .children(sid)
            .into_iter()
            .rev()
            .map(|child| (child, base.clone()))
            .collect();
        while let Some((child, mut path)) = stack.pop() {
            let Some(entry) = self.directory.get(child) else {
                continue;
            };
            path.push(entry.name_string());
            if recursive && entry.object_type.is_container() {
                for grandchild in self.directory.children(child).into_iter().rev() {
                    stack.push((grandchild, path.clone()));
                }
            }
            result.push(Entry::from_dir(child, entry, path));
        }
        Ok(result)
    }

    /// Set the class id of an entry
    pub fn set_clsid(&mut self, sid: u32, token: u64, clsid: [u8; 16]) -> Result<()> {
        self.check_writable()?;
        self.directory.resolve(sid, token)?;
        if let Some(entry) = self.directory.get_mut(sid) {
            entry.clsid = clsid;
        }
        self.dirty = true;
        Ok(())
    }

    /// Set the state bits of an entry
    pub fn set_state_bits(&mut self, sid: u32, token: u64, bits: u32) -> Result<()> {
        self.check_writable()?;
        self.directory.resolve(sid, token)?;
        if let Some(entry) = self.directory.get_mut(sid) {
            entry.state_bits = bits;
        }
        self.dirty = true;
        Ok(())
    }

    /// Length of stream `sid`
    pub fn stream_len(&self, sid: u32, token: u64) -> Result<u64> {
        Ok(self.stream(sid, token)?.size)
    }

    /// Read from a stream handle
    pub fn read_at(&mut self, sid: u32, token: u64, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.stream(sid, token)?;
        self.read_sid(sid, pos, buf)
    }

    /// Write through a stream handle
    pub fn write_at(&mut self, sid: u32, token: u64, pos: u64, data: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.stream(sid, token)?;
        self.write_sid(sid, pos, data)
    }

    /// Truncate or zero-extend a stream
    pub fn set_len(&mut self, sid: u32, token: u64, len: u64) -> Result<()> {
        self.check_writable()?;
        self.stream(sid, token)?;
        self.resize_stream(sid, len)
    }

    /// Walk `path` from the root
    pub fn resolve_path(&self, path: &[&str]) -> Option<(u32, u64, ObjectType)> {
        let mut current = ROOT_SID;
        for name in path {
            let entry = self.directory.get(current)?;
            if !entry.object_type.is_container() {
                return None;
            }
            current = self.directory.find(current, name)?;
        }
        self.directory
            .get(current)
            .map(|entry| (current, entry.token, entry.object_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn engine() -> Engine<Cursor<Vec<u8>>> {
        Engine::create(Cursor::new(Vec::new()), StorageOptions::default()).unwrap()
    }

    fn new_stream(engine: &mut Engine<Cursor<Vec<u8>>>, name: &str) -> (u32, u64) {
        let root = engine.root_token();
        engine
            .create_child(ROOT_SID, root, name, ObjectType::Stream)
            .unwrap()
    }

    #[test]
    fn test_empty_file_layout() {
        let engine = engine();
        let bytes = engine.into_inner().into_inner();
        // Header, one directory sector, one FAT sector
        assert_eq!(bytes.len(), 512 * 3);
        assert_eq!(&bytes[..8], MAGIC);
    }

    #[test]
    fn test_stream_growth_and_promotion() {
        let mut engine = engine();
        let (sid, token) = new_stream(&mut engine, "data");

        engine.write_at(sid, token, 0, &[7u8; 100]).unwrap();
        assert_eq!(engine.directory.get(sid).unwrap().size, 100);
        assert_eq!(engine.directory.root().size, 128);

        engine.write_at(sid, token, 4000, &[9u8; 200]).unwrap();
        assert_eq!(engine.stream_len(sid, token).unwrap(), 4200);

        let mut out = vec![0xFFu8; 4200];
        assert_eq!(engine.read_at(sid, token, 0, &mut out).unwrap(), 4200);
        assert!(out[..100].iter().all(|&b| b == 7));
        assert!(out[100..4000].iter().all(|&b| b == 0));
        assert!(out[4000..].iter().all(|&b| b == 9));
        // The mini chain was released
        assert_eq!(engine.minifat.highest_used(), None);
    }

    #[test]
    fn test_demotion_keeps_prefix() {
        let mut engine = engine();
        let (sid, token) = new_stream(&mut engine, "big");
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        engine.write_at(sid, token, 0, &data).unwrap();
        engine.set_len(sid, token, 10).unwrap();

        let mut out = vec![0u8; 10];
        engine.read_at(sid, token, 0, &mut out).unwrap();
        assert_eq!(out, data[..10]);
        assert!(engine.minifat.highest_used().is_some());

        // Regrowing zero-fills
        engine.set_len(sid, token, 20).unwrap();
        let mut out = vec![0xFFu8; 20];
        engine.read_at(sid, token, 0, &mut out).unwrap();
        assert_eq!(&out[..10], &data[..10]);
        assert!(out[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_v3_stream_limit() {
        let mut engine = engine();
        let (sid, token) = new_stream(&mut engine, "huge");
        assert!(matches!(
            engine.set_len(sid, token, MAX_STREAM_SIZE_V3 + 1),
            Err(Error::Capacity(_))
        ));
        assert_eq!(engine.stream_len(sid, token).unwrap(), 0);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let bytes = engine().into_inner();
        let options = StorageOptions::new().with_read_only(true);
        let mut engine = Engine::open(bytes, options).unwrap();
        let root = engine.root_token();
        assert!(matches!(
            engine.create_child(ROOT_SID, root, "x", ObjectType::Stream),
            Err(Error::ReadOnly)
        ));
    }
}
