//! FAT (File Allocation Table)
//!
//! The FAT maps every sector id to the next sector of its chain:
//! - Regular entries hold the next sector id
//! - FAT sectors are marked with FATSECT (0xFFFFFFFD)
//! - DIFAT sectors are marked with DIFSECT (0xFFFFFFFC)
//! - End of chain is marked with ENDOFCHAIN (0xFFFFFFFE)
//! - Free sectors are marked with FREESECT (0xFFFFFFFF)
//!
//! The table is held in memory as a plain `Vec<u32>` and serialized back
//! into the FAT sectors listed by the DIFAT on commit.

use super::config::Version;
use super::consts::*;
use super::sector::{Backing, SectorStore};
use crate::common::binary::read_u32_table;
use crate::common::{Error, Result};
use fixedbitset::FixedBitSet;

/// Follow a chain through an allocation table.
///
/// Detects cycles, out-of-range ids and chains that run into sentinel
/// values. `what` names the table in error messages.
pub(crate) fn follow_chain(table: &[u32], start: u32, what: &str) -> Result<Vec<u32>> {
    let mut chain = Vec::new();
    if start == ENDOFCHAIN {
        return Ok(chain);
    }

    let mut visited = FixedBitSet::with_capacity(table.len());
    let mut current = start;
    while current != ENDOFCHAIN {
        let index = current as usize;
        if index >= table.len() {
            return Err(Error::CorruptedFile(match current {
                FREESECT => format!("{} chain runs into a free entry", what),
                FATSECT | DIFSECT => format!("{} chain runs into a reserved sector", what),
                _ => format!(
                    "{} chain references sector {} beyond {} entries",
                    what,
                    current,
                    table.len()
                ),
            }));
        }
        if visited.put(index) {
            return Err(Error::CorruptedFile(format!(
                "{} chain starting at {} loops back to sector {}",
                what, start, current
            )));
        }
        chain.push(current);
        current = table[index];
    }

    Ok(chain)
}

/// In-memory FAT with sector allocation
#[derive(Debug, Clone)]
pub(crate) struct Fat {
    /// The FAT table (maps sector ID to next sector in chain)
    next: Vec<u32>,
    /// One past the highest sector ever allocated
    high_water: u32,
    /// Lowest index that may hold a free entry
    free_hint: usize,
    /// Reuse freed sectors (first fit) instead of always appending
    recycle: bool,
    /// Format version, decides what happens at the range-lock sector
    version: Version,
}

impl Fat {
    /// Create an empty FAT
    pub fn new(version: Version, recycle: bool) -> Self {
        Self::from_entries(Vec::new(), version, recycle)
    }

    /// Wrap a table read from disk
    pub fn from_entries(next: Vec<u32>, version: Version, recycle: bool) -> Self {
        let high_water = next
            .iter()
            .rposition(|&entry| entry != FREESECT)
            .map_or(0, |pos| pos as u32 + 1);
        Self {
            next,
            high_water,
            free_hint: 0,
            recycle,
            version,
        }
    }

    /// Read the FAT sectors listed by the DIFAT
    pub fn load<F: Backing>(
        fat_sectors: &[u32],
        store: &mut SectorStore<F>,
        version: Version,
        recycle: bool,
    ) -> Result<Self> {
        let entries_per_sector = store.sector_size() / 4;
        let mut next = Vec::with_capacity(fat_sectors.len() * entries_per_sector);
        for &sector in fat_sectors {
            let table = read_u32_table(store.sector(sector)?)?;
            next.extend_from_slice(&table);
        }
        Ok(Self::from_entries(next, version, recycle))
    }

    /// Number of entries in the table
    #[inline]
    pub fn len(&self) -> usize {
        self.next.len()
    }

    /// The raw table
    #[inline]
    pub fn entries(&self) -> &[u32] {
        &self.next
    }

    /// One past the highest allocated sector; the file never needs more sectors
    #[inline]
    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    /// Sector id that covers the range-lock byte offset
    pub fn range_lock_sector(sector_size: usize) -> u32 {
        (RANGE_LOCK_OFFSET / sector_size as u64) as u32 - 1
    }

    fn set(&mut self, sector: u32, value: u32) {
        let index = sector as usize;
        // Expand FAT if necessary
        if index >= self.next.len() {
            self.next.resize(index + 1, FREESECT);
        }
        self.next[index] = value;
    }

    /// Resolve the chain starting at `start`
    pub fn resolve_chain(&self, start: u32) -> Result<Vec<u32>> {
        follow_chain(&self.next, start, "FAT")
    }

    fn candidate(&mut self) -> u32 {
        if self.recycle {
            let end = self.next.len().min(self.high_water as usize);
            if let Some(offset) = self.next[self.free_hint.min(end)..end]
                .iter()
                .position(|&entry| entry == FREESECT)
            {
                return (self.free_hint.min(end) + offset) as u32;
            }
            self.free_hint = end;
        }
        self.high_water
    }

    /// Allocate one sector and mark it with `marker`
    pub fn allocate(&mut self, marker: u32) -> Result<u32> {
        let sector_size = self.version.sector_size();
        let range_lock = Self::range_lock_sector(sector_size);
        loop {
            let sector = self.candidate();
            if sector > MAXREGSECT {
                return Err(Error::Capacity("FAT has no sector ids left".to_string()));
            }
            if sector == range_lock {
                match self.version {
                    Version::V3 => {
                        return Err(Error::Capacity(
                            "Version 3 files cannot grow past 2 GiB".to_string(),
                        ));
                    },
                    Version::V4 => {
                        // Never hand out the sector covering the lock range
                        self.set(sector, ENDOFCHAIN);
                        self.high_water = self.high_water.max(sector + 1);
                        continue;
                    },
                }
            }

            self.set(sector, marker);
            self.high_water = self.high_water.max(sector + 1);
            if self.recycle {
                self.free_hint = sector as usize + 1;
            }
            tracing::trace!(sector, marker, "allocated sector");
            return Ok(sector);
        }
    }

    /// Append `count` sectors to `chain`, returning the new sector ids
    pub fn extend_chain(&mut self, chain: &mut Vec<u32>, count: usize) -> Result<Vec<u32>> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let sector = self.allocate(ENDOFCHAIN)?;
            if let Some(&last) = chain.last() {
                self.set(last, sector);
            }
            chain.push(sector);
            added.push(sector);
        }
        Ok(added)
    }

    /// Keep the first `keep` sectors of `chain` and free the rest.
    ///
    /// Returns the freed sector ids.
    pub fn truncate_chain(&mut self, chain: &mut Vec<u32>, keep: usize) -> Vec<u32> {
        if keep >= chain.len() {
            return Vec::new();
        }
        let freed = chain.split_off(keep);
        self.free(&freed);
        if let Some(&last) = chain.last() {
            self.set(last, ENDOFCHAIN);
        }
        freed
    }

    /// Mark sectors as free
    pub fn free(&mut self, sectors: &[u32]) {
        for &sector in sectors {
            self.set(sector, FREESECT);
            self.free_hint = self.free_hint.min(sector as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_resolution() {
        let fat = Fat::from_entries(vec![1, 2, ENDOFCHAIN, FREESECT], Version::V3, true);
        assert_eq!(fat.resolve_chain(0).unwrap(), vec![0, 1, 2]);
        assert!(fat.resolve_chain(ENDOFCHAIN).unwrap().is_empty());
        assert_eq!(fat.high_water(), 3);
    }

    #[test]
    fn test_cycle_detected() {
        let fat = Fat::from_entries(vec![1, 2, 0], Version::V3, true);
        let err = fat.resolve_chain(0).unwrap_err();
        assert!(matches!(err, Error::CorruptedFile(_)));
    }

    #[test]
    fn test_out_of_range_detected() {
        let fat = Fat::from_entries(vec![7, FREESECT], Version::V3, true);
        assert!(matches!(fat.resolve_chain(0), Err(Error::CorruptedFile(_))));
        assert!(matches!(fat.resolve_chain(1), Err(Error::CorruptedFile(_))));
    }

    #[test]
    fn test_recycle_first_fit() {
        let mut fat = Fat::new(Version::V3, true);
        let mut a = Vec::new();
        let mut b = Vec::new();
        fat.extend_chain(&mut a, 3).unwrap();
        fat.extend_chain(&mut b, 2).unwrap();
        assert_eq!(a, vec![0, 1, 2]);
        assert_eq!(b, vec![3, 4]);

        let freed = fat.truncate_chain(&mut a, 1);
        assert_eq!(freed, vec![1, 2]);
        assert_eq!(fat.entries()[0], ENDOFCHAIN);

        let mut c = Vec::new();
        fat.extend_chain(&mut c, 3).unwrap();
        assert_eq!(c, vec![1, 2, 5]);
        assert_eq!(fat.resolve_chain(1).unwrap(), vec![1, 2, 5]);
    }

    #[test]
    fn test_append_only_without_recycle() {
        let mut fat = Fat::new(Version::V3, false);
        let mut a = Vec::new();
        fat.extend_chain(&mut a, 2).unwrap();
        fat.truncate_chain(&mut a, 0);
        let mut b = Vec::new();
        fat.extend_chain(&mut b, 1).unwrap();
        assert_eq!(b, vec![2]);
    }

    #[test]
    fn test_range_lock_sector() {
        assert_eq!(Fat::range_lock_sector(512), 0x3F_FFFE);
        assert_eq!(Fat::range_lock_sector(4096), 0x7_FFFE);

        // Version 4 skips the reserved sector
        let mut entries = vec![ENDOFCHAIN; 0x7_FFFE];
        entries[0] = ENDOFCHAIN;
        let mut fat = Fat::from_entries(entries, Version::V4, true);
        let sector = fat.allocate(ENDOFCHAIN).unwrap();
        assert_eq!(sector, 0x7_FFFF);
        assert_eq!(fat.entries()[0x7_FFFE], ENDOFCHAIN);

        // Version 3 refuses to grow into it
        let entries = vec![ENDOFCHAIN; 0x3F_FFFE];
        let mut fat = Fat::from_entries(entries, Version::V3, true);
        assert!(matches!(
            fat.allocate(ENDOFCHAIN),
            Err(Error::Capacity(_))
        ));
    }
}
