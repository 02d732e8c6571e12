//! Sector store
//!
//! Raw fixed-size block access over the backing stream. Sector `i` lives at
//! byte offset `(i + 1) * sector_size` (the first sector-sized block holds the
//! header). Sectors are read lazily; modified sectors are kept in memory until
//! the engine writes them out, in ascending id order, on commit.

use crate::common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// A seekable byte stream that can hold a compound file.
///
/// Implemented for [`File`], in-memory [`Cursor<Vec<u8>>`], and mutable
/// references or boxes of either.
pub trait Backing: Read + Write + Seek {
    /// Truncate or extend the underlying stream to `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl Backing for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl Backing for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::FileTooLarge, "length exceeds memory"))?;
        self.get_mut().resize(len, 0);
        Ok(())
    }
}

impl<B: Backing + ?Sized> Backing for &mut B {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }
}

impl<B: Backing + ?Sized> Backing for Box<B> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        (**self).set_len(len)
    }
}

/// Lazily materialized sectors over a backing stream
#[derive(Debug)]
pub(crate) struct SectorStore<F> {
    /// Backing stream
    inner: F,
    /// Sector size (512 or 4096 bytes)
    sector_size: usize,
    /// Sectors physically present in the backing stream
    physical_sectors: u32,
    /// Modified sectors, written in ascending order on commit
    dirty: BTreeMap<u32, Box<[u8]>>,
    /// Unmodified sectors read from the backing stream
    clean: HashMap<u32, Box<[u8]>>,
    /// Clean sectors kept before the cache is dropped
    cache_limit: usize,
}

impl<F: Backing> SectorStore<F> {
    /// Wrap a backing stream whose sectors are `sector_size` bytes
    pub fn new(mut inner: F, sector_size: usize, cache_limit: usize) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        let physical_sectors = Self::sectors_in(len, sector_size)?;
        Ok(Self {
            inner,
            sector_size,
            physical_sectors,
            dirty: BTreeMap::new(),
            clean: HashMap::new(),
            cache_limit: cache_limit.max(1),
        })
    }

    fn sectors_in(len: u64, sector_size: usize) -> Result<u32> {
        let count = len
            .saturating_sub(sector_size as u64)
            .div_ceil(sector_size as u64);
        u32::try_from(count)
            .map_err(|_| Error::Capacity(format!("Backing stream of {} bytes is too large", len)))
    }

    /// Sector size in bytes
    #[inline]
    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Number of sectors present in the backing stream
    #[inline]
    pub fn physical_sectors(&self) -> u32 {
        self.physical_sectors
    }

    fn offset_of(&self, id: u32) -> u64 {
        (u64::from(id) + 1) * self.sector_size as u64
    }

    /// Read one sector from the backing stream. A sector cut short by the end
    /// of the stream is zero-padded; sectors past the end read as zeros.
    fn load(&mut self, id: u32) -> Result<Box<[u8]>> {
        let mut buffer = vec![0u8; self.sector_size].into_boxed_slice();
        if id >= self.physical_sectors {
            return Ok(buffer);
        }
        self.inner.seek(SeekFrom::Start(self.offset_of(id)))?;
        let mut filled = 0;
        while filled < buffer.len() {
            match self.inner.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buffer)
    }

    /// Borrow a sector for reading
    pub fn sector(&mut self, id: u32) -> Result<&[u8]> {
        if self.dirty.contains_key(&id) {
            return Ok(&self.dirty[&id]);
        }
        if !self.clean.contains_key(&id) {
            if self.clean.len() >= self.cache_limit {
                self.clean.clear();
            }
            let data = self.load(id)?;
            self.clean.insert(id, data);
        }
        Ok(&self.clean[&id])
    }

    /// Borrow a sector for writing; it becomes dirty
    pub fn sector_mut(&mut self, id: u32) -> Result<&mut [u8]> {
        if !self.dirty.contains_key(&id) {
            let data = match self.clean.remove(&id) {
                Some(data) => data,
                None => self.load(id)?,
            };
            self.dirty.insert(id, data);
        }
        self.dirty
            .get_mut(&id)
            .map(|data| &mut data[..])
            .ok_or_else(|| Error::InvalidOperation(format!("Sector {} vanished from cache", id)))
    }

    /// Copy `buf.len()` bytes starting at `offset` within sector `id`
    pub fn read_into(&mut self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let sector = self.sector(id)?;
        buf.copy_from_slice(&sector[offset..offset + buf.len()]);
        Ok(())
    }

    /// Overwrite part of sector `id`
    pub fn write_at(&mut self, id: u32, offset: usize, data: &[u8]) -> Result<()> {
        let sector = self.sector_mut(id)?;
        sector[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Replace a whole sector without reading it first
    pub fn put(&mut self, id: u32, mut data: Vec<u8>) {
        data.resize(self.sector_size, 0);
        self.clean.remove(&id);
        self.dirty.insert(id, data.into_boxed_slice());
    }

    /// Mark a sector as freshly allocated: its content becomes zeros
    pub fn zero(&mut self, id: u32) {
        self.put(id, Vec::new());
    }

    /// Drop any cached content of a sector that is no longer in use
    pub fn forget(&mut self, id: u32) {
        self.dirty.remove(&id);
        self.clean.remove(&id);
    }

    /// Write dirty sectors selected by `filter`, in ascending id order
    pub fn write_dirty(&mut self, filter: impl Fn(u32) -> bool) -> Result<usize> {
        let ids: Vec<u32> = self.dirty.keys().copied().filter(|&id| filter(id)).collect();
        let mut position = None;
        for &id in &ids {
            let offset = self.offset_of(id);
            if position != Some(offset) {
                self.inner.seek(SeekFrom::Start(offset))?;
            }
            if let Some(data) = self.dirty.remove(&id) {
                self.inner.write_all(&data)?;
                if self.clean.len() < self.cache_limit {
                    self.clean.insert(id, data);
                }
            }
            position = Some(offset + self.sector_size as u64);
            self.physical_sectors = self.physical_sectors.max(id + 1);
        }
        Ok(ids.len())
    }

    /// Write the header block at offset 0
    pub fn write_header(&mut self, header: &[u8]) -> Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(header)?;
        Ok(())
    }

    /// Read the first `len` bytes of the backing stream
    pub fn read_prefix(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Flush the backing stream
    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Cut the backing stream down (or extend it) to `sectors` sectors after the header
    pub fn set_sector_count(&mut self, sectors: u32) -> Result<()> {
        self.inner.set_len(self.offset_of(sectors))?;
        self.physical_sectors = sectors;
        self.dirty.retain(|&id, _| id < sectors);
        self.clean.retain(|&id, _| id < sectors);
        Ok(())
    }

    /// Drop every cached and pending sector
    pub fn discard(&mut self) {
        self.dirty.clear();
        self.clean.clear();
    }

    /// Pull every physically present sector below `limit` into the dirty set
    /// so that the whole image can be rewritten elsewhere
    pub fn materialize(&mut self, limit: u32) -> Result<()> {
        for id in 0..self.physical_sectors.min(limit) {
            self.sector_mut(id)?;
        }
        Ok(())
    }

    /// Swap the backing stream. The new stream is treated as empty.
    pub fn replace_inner(&mut self, inner: F) -> F {
        self.clean.clear();
        self.physical_sectors = 0;
        std::mem::replace(&mut self.inner, inner)
    }

    /// Overwrite the whole backing stream with `image` and forget all caches
    pub fn overwrite(&mut self, image: &[u8]) -> Result<()> {
        self.discard();
        self.inner.seek(SeekFrom::Start(0))?;
        self.inner.write_all(image)?;
        self.inner.set_len(image.len() as u64)?;
        self.inner.flush()?;
        self.physical_sectors = Self::sectors_in(image.len() as u64, self.sector_size)?;
        Ok(())
    }

    /// Change the sector size, used when reopening a stream whose header
    /// declares a different version
    pub fn reset_geometry(&mut self, sector_size: usize) -> Result<()> {
        self.discard();
        self.sector_size = sector_size;
        let len = self.inner.seek(SeekFrom::End(0))?;
        self.physical_sectors = Self::sectors_in(len, sector_size)?;
        Ok(())
    }

    /// Release the backing stream
    pub fn into_inner(self) -> F {
        self.inner
    }
}
