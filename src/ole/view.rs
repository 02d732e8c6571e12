//! Chain views
//!
//! A [`ChainView`] presents a chain of fixed-size units (regular sectors or
//! 64-byte mini sectors) as one contiguous byte range of a given length.
//! Mini sectors are addressed through the root entry's chain, which holds
//! the ministream.

use super::consts::MINI_SECTOR_SIZE;
use super::sector::{Backing, SectorStore};
use crate::common::{Error, Result};

/// Fixed-size units addressable by id
pub(crate) trait UnitDevice {
    /// Size of one unit in bytes
    fn unit_size(&self) -> usize;
    /// Copy bytes out of unit `id` starting at `offset`
    fn read_unit(&mut self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()>;
    /// Copy bytes into unit `id` starting at `offset`
    fn write_unit(&mut self, id: u32, offset: usize, data: &[u8]) -> Result<()>;
}

impl<F: Backing> UnitDevice for SectorStore<F> {
    fn unit_size(&self) -> usize {
        self.sector_size()
    }

    fn read_unit(&mut self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.read_into(id, offset, buf)
    }

    fn write_unit(&mut self, id: u32, offset: usize, data: &[u8]) -> Result<()> {
        self.write_at(id, offset, data)
    }
}

/// Mini sectors stored inside the ministream
pub(crate) struct MiniDevice<'a, F> {
    store: &'a mut SectorStore<F>,
    ministream: &'a [u32],
}

impl<'a, F: Backing> MiniDevice<'a, F> {
    pub fn new(store: &'a mut SectorStore<F>, ministream: &'a [u32]) -> Self {
        Self { store, ministream }
    }

    /// Regular sector and in-sector offset holding byte `offset` of mini sector `id`
    fn locate(&self, id: u32, offset: usize) -> Result<(u32, usize)> {
        let sector_size = self.store.sector_size();
        let position = id as usize * MINI_SECTOR_SIZE + offset;
        let sector = self
            .ministream
            .get(position / sector_size)
            .copied()
            .ok_or_else(|| {
                Error::CorruptedFile(format!("Mini sector {} lies beyond the ministream", id))
            })?;
        Ok((sector, position % sector_size))
    }
}

impl<F: Backing> UnitDevice for MiniDevice<'_, F> {
    fn unit_size(&self) -> usize {
        MINI_SECTOR_SIZE
    }

    fn read_unit(&mut self, id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        // A mini sector never straddles two regular sectors
        let (sector, within) = self.locate(id, offset)?;
        self.store.read_into(sector, within, buf)
    }

    fn write_unit(&mut self, id: u32, offset: usize, data: &[u8]) -> Result<()> {
        let (sector, within) = self.locate(id, offset)?;
        self.store.write_at(sector, within, data)
    }
}

/// A chain of units seen as a byte range of `len` bytes
pub(crate) struct ChainView<'a, D> {
    device: &'a mut D,
    chain: &'a [u32],
    len: u64,
}

impl<'a, D: UnitDevice> ChainView<'a, D> {
    pub fn new(device: &'a mut D, chain: &'a [u32], len: u64) -> Self {
        Self {
            device,
            chain,
            len,
        }
    }

    /// Bytes the chain can hold without growing
    pub fn capacity(&self) -> u64 {
        (self.chain.len() * self.device.unit_size()) as u64
    }

    /// Read up to `buf.len()` bytes at `pos`, stopping at the logical end
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.len {
            return Ok(0);
        }
        let total = buf.len().min((self.len - pos) as usize);
        let unit = self.device.unit_size();
        let mut done = 0;
        while done < total {
            let position = pos as usize + done;
            let index = position / unit;
            let within = position % unit;
            let id = *self.chain.get(index).ok_or_else(|| {
                Error::CorruptedFile(format!(
                    "Chain of {} units is shorter than its length {}",
                    self.chain.len(),
                    self.len
                ))
            })?;
            let n = (unit - within).min(total - done);
            self.device.read_unit(id, within, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(total)
    }

    /// Write all of `data` at `pos`; the chain must already be long enough
    pub fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        let end = pos + data.len() as u64;
        if end > self.capacity() {
            return Err(Error::InvalidOperation(format!(
                "Write to {} exceeds chain capacity {}",
                end,
                self.capacity()
            )));
        }
        let unit = self.device.unit_size();
        let mut done = 0;
        while done < data.len() {
            let position = pos as usize + done;
            let id = self.chain[position / unit];
            let within = position % unit;
            let n = (unit - within).min(data.len() - done);
            self.device.write_unit(id, within, &data[done..done + n])?;
            done += n;
        }
        self.len = self.len.max(end);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_view_over_sectors() {
        let mut store = SectorStore::new(Cursor::new(Vec::new()), 512, 8).unwrap();
        let chain = [3, 1, 2];
        for &id in &chain {
            store.zero(id);
        }
        let data: Vec<u8> = (0..1200u32).map(|i| i as u8).collect();

        let mut view = ChainView::new(&mut store, &chain, 0);
        view.write_at(0, &data).unwrap();

        let mut out = vec![0u8; 1200];
        assert_eq!(view.read_at(0, &mut out).unwrap(), 1200);
        assert_eq!(out, data);
        assert!(view.write_at(1500, &[0; 100]).is_err());

        // Sector 3 holds the first 512 bytes
        assert_eq!(store.sector(3).unwrap()[..4], [0, 1, 2, 3]);
    }

    #[test]
    fn test_mini_view() {
        let mut store = SectorStore::new(Cursor::new(Vec::new()), 512, 8).unwrap();
        store.zero(5);
        store.zero(9);
        let ministream = [5, 9];
        let mut mini = MiniDevice::new(&mut store, &ministream);
        // Mini sector 8 is the first one inside sector 9
        let chain = [8, 0];
        let mut view = ChainView::new(&mut mini, &chain, 0);
        view.write_at(0, &[0xAB; 100]).unwrap();
        let mut out = vec![0u8; 128];
        assert_eq!(view.read_at(0, &mut out).unwrap(), 100);
        assert_eq!(out[..100], [0xAB; 100]);

        assert!(store.sector(9).unwrap()[..64].iter().all(|&b| b == 0xAB));
        assert!(store.sector(5).unwrap()[..36].iter().all(|&b| b == 0xAB));
    }
}
