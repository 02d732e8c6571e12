//! DIFAT (Double Indirect FAT)
//!
//! The header stores the first 109 FAT sector ids; the rest are listed in a
//! chain of DIFAT sectors.
//! - Each DIFAT sector holds `sector_size / 4 - 1` FAT sector ids plus a
//!   pointer to the next DIFAT sector
//! - For 512-byte sectors: 127 ids + 1 next pointer
//! - For 4096-byte sectors: 1023 ids + 1 next pointer
//!
//! Reading accepts FREESECT as a chain terminator (some writers emit it);
//! writing always terminates with ENDOFCHAIN.

use super::consts::*;
use super::fat::Fat;
use super::header::Header;
use super::sector::{Backing, SectorStore};
use crate::common::binary::{read_u32_table, write_u32_table};
use crate::common::{Error, Result};
use fixedbitset::FixedBitSet;

/// Location of every FAT and DIFAT sector
#[derive(Debug, Clone, Default)]
pub(crate) struct Difat {
    /// FAT sectors in table order
    fat_sectors: Vec<u32>,
    /// DIFAT sectors in chain order
    difat_sectors: Vec<u32>,
}

impl Difat {
    /// Collect the FAT sector list from the header and the DIFAT chain
    pub fn load<F: Backing>(header: &Header, store: &mut SectorStore<F>) -> Result<Self> {
        let wanted = header.num_fat_sectors as usize;
        let physical = store.physical_sectors();
        let ids_per_sector = store.sector_size() / 4 - 1;

        let mut fat_sectors = Vec::with_capacity(wanted);
        for &id in header.difat.iter() {
            if fat_sectors.len() == wanted || id == FREESECT || id == ENDOFCHAIN {
                break;
            }
            fat_sectors.push(id);
        }

        let mut difat_sectors = Vec::new();
        let mut visited = FixedBitSet::with_capacity(physical as usize);
        let mut current = header.first_difat_sector;
        while fat_sectors.len() < wanted && current != ENDOFCHAIN && current != FREESECT {
            if current >= physical {
                return Err(Error::CorruptedFile(format!(
                    "DIFAT sector {} lies beyond the end of the file",
                    current
                )));
            }
            if visited.put(current as usize) {
                return Err(Error::CorruptedFile(format!(
                    "DIFAT chain loops back to sector {}",
                    current
                )));
            }
            difat_sectors.push(current);

            let table = read_u32_table(store.sector(current)?)?;
            for &id in &table[..ids_per_sector] {
                if fat_sectors.len() == wanted {
                    break;
                }
                if id != FREESECT && id != ENDOFCHAIN {
                    fat_sectors.push(id);
                }
            }
            current = table[ids_per_sector];
        }

        if current == FREESECT && !difat_sectors.is_empty() {
            tracing::warn!("DIFAT chain terminated with FREESECT instead of ENDOFCHAIN");
        }
        if difat_sectors.len() != header.num_difat_sectors as usize {
            tracing::warn!(
                declared = header.num_difat_sectors,
                found = difat_sectors.len(),
                "DIFAT sector count does not match the header"
            );
        }
        if fat_sectors.len() < wanted {
            return Err(Error::InvalidFormat(format!(
                "Header declares {} FAT sectors but the DIFAT lists {}",
                wanted,
                fat_sectors.len()
            )));
        }
        if let Some(&bad) = fat_sectors.iter().find(|&&id| id >= physical) {
            return Err(Error::CorruptedFile(format!(
                "FAT sector {} lies beyond the end of the file",
                bad
            )));
        }

        Ok(Self {
            fat_sectors,
            difat_sectors,
        })
    }

    /// FAT sectors in table order
    pub fn fat_sectors(&self) -> &[u32] {
        &self.fat_sectors
    }

    /// DIFAT sectors in chain order
    pub fn difat_sectors(&self) -> &[u32] {
        &self.difat_sectors
    }

    /// FAT and DIFAT sector counts needed to describe `entries` FAT entries
    pub fn required_counts(entries: usize, sector_size: usize) -> (usize, usize) {
        let fat = entries.div_ceil(sector_size / 4);
        let overflow = fat.saturating_sub(HEADER_DIFAT_ENTRIES);
        let difat = overflow.div_ceil(sector_size / 4 - 1);
        (fat, difat)
    }

    /// Reserve enough FAT and DIFAT sectors to describe the whole table.
    ///
    /// Reserving a sector can itself grow the table, so this iterates until
    /// the counts stop changing. Returns the newly reserved sector ids.
    pub fn reserve(&mut self, fat: &mut Fat, sector_size: usize) -> Result<Vec<u32>> {
        let mut reserved = Vec::new();
        loop {
            let (need_fat, need_difat) = Self::required_counts(fat.len(), sector_size);
            if self.fat_sectors.len() < need_fat {
                let id = fat.allocate(FATSECT)?;
                self.fat_sectors.push(id);
                reserved.push(id);
            } else if self.difat_sectors.len() < need_difat {
                let id = fat.allocate(DIFSECT)?;
                self.difat_sectors.push(id);
                reserved.push(id);
            } else {
                break;
            }
        }
        if !reserved.is_empty() {
            tracing::trace!(
                fat_sectors = self.fat_sectors.len(),
                difat_sectors = self.difat_sectors.len(),
                "reserved allocation table sectors"
            );
        }
        Ok(reserved)
    }

    /// Serialize the FAT into its sectors, the DIFAT chain into its sectors
    /// and record both in the header
    pub fn write<F: Backing>(
        &self,
        fat: &Fat,
        header: &mut Header,
        store: &mut SectorStore<F>,
    ) -> Result<()> {
        let sector_size = store.sector_size();
        let entries_per_sector = sector_size / 4;
        let entries = fat.entries();

        for (i, &sector) in self.fat_sectors.iter().enumerate() {
            let start = (i * entries_per_sector).min(entries.len());
            let end = (start + entries_per_sector).min(entries.len());
            let mut buffer = vec![0u8; sector_size];
            write_u32_table(&entries[start..end], &mut buffer, FREESECT);
            store.put(sector, buffer);
        }

        header.num_fat_sectors = u32::try_from(self.fat_sectors.len())
            .map_err(|_| Error::Capacity("Too many FAT sectors".to_string()))?;
        header.difat = [FREESECT; HEADER_DIFAT_ENTRIES];
        for (slot, &sector) in header.difat.iter_mut().zip(&self.fat_sectors) {
            *slot = sector;
        }

        // Generate DIFAT sectors for the FAT sector ids beyond the first 109
        let ids_per_sector = entries_per_sector - 1;
        let overflow = self.fat_sectors.get(HEADER_DIFAT_ENTRIES..).unwrap_or(&[]);
        for (i, &sector) in self.difat_sectors.iter().enumerate() {
            let start = (i * ids_per_sector).min(overflow.len());
            let end = (start + ids_per_sector).min(overflow.len());
            let mut buffer = vec![0u8; sector_size];
            write_u32_table(&overflow[start..end], &mut buffer[..ids_per_sector * 4], FREESECT);
            let next = self.difat_sectors.get(i + 1).copied().unwrap_or(ENDOFCHAIN);
            buffer[ids_per_sector * 4..].copy_from_slice(&next.to_le_bytes());
            store.put(sector, buffer);
        }

        header.first_difat_sector = self.difat_sectors.first().copied().unwrap_or(ENDOFCHAIN);
        header.num_difat_sectors = self.difat_sectors.len() as u32;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ole::config::Version;
    use std::io::Cursor;

    #[test]
    fn test_required_counts() {
        assert_eq!(Difat::required_counts(0, 512), (0, 0));
        assert_eq!(Difat::required_counts(128, 512), (1, 0));
        assert_eq!(Difat::required_counts(129, 512), (2, 0));
        // 109 FAT sectors fit in the header
        assert_eq!(Difat::required_counts(109 * 128, 512), (109, 0));
        assert_eq!(Difat::required_counts(110 * 128, 512), (110, 1));
        // 127 ids per DIFAT sector
        assert_eq!(Difat::required_counts((109 + 128) * 128, 512), (237, 2));
        assert_eq!(Difat::required_counts(1024, 4096), (1, 0));
    }

    #[test]
    fn test_reserve_reaches_fixed_point() {
        let mut fat = Fat::new(Version::V3, true);
        let mut chain = Vec::new();
        fat.extend_chain(&mut chain, 127).unwrap();

        let mut difat = Difat::default();
        difat.reserve(&mut fat, 512).unwrap();
        // 127 data sectors + 1 FAT sector fit in one FAT sector
        assert_eq!(difat.fat_sectors(), &[127]);
        assert_eq!(fat.entries()[127], FATSECT);

        fat.extend_chain(&mut chain, 1).unwrap();
        difat.reserve(&mut fat, 512).unwrap();
        assert_eq!(difat.fat_sectors().len(), 2);
        let (need_fat, _) = Difat::required_counts(fat.len(), 512);
        assert!(difat.fat_sectors().len() >= need_fat);
    }

    #[test]
    fn test_write_and_load_overflow() {
        let mut fat = Fat::new(Version::V3, true);
        let mut chain = Vec::new();
        fat.extend_chain(&mut chain, 110 * 128).unwrap();
        let mut difat = Difat::default();
        difat.reserve(&mut fat, 512).unwrap();
        assert!(difat.fat_sectors().len() > HEADER_DIFAT_ENTRIES);
        assert_eq!(difat.difat_sectors().len(), 1);

        let mut store = SectorStore::new(Cursor::new(Vec::new()), 512, 16).unwrap();
        for id in 0..fat.high_water() {
            store.zero(id);
        }
        let mut header = Header::new(Version::V3);
        difat.write(&fat, &mut header, &mut store).unwrap();
        store.write_dirty(|_| true).unwrap();

        let loaded = Difat::load(&header, &mut store).unwrap();
        assert_eq!(loaded.fat_sectors(), difat.fat_sectors());
        assert_eq!(loaded.difat_sectors(), difat.difat_sectors());

        let reloaded = Fat::load(loaded.fat_sectors(), &mut store, Version::V3, true).unwrap();
        assert_eq!(reloaded.resolve_chain(0).unwrap().len(), 110 * 128);
    }

    #[test]
    fn test_freesect_terminator_accepted() {
        let mut store = SectorStore::new(Cursor::new(vec![0u8; 512 * 4]), 512, 16).unwrap();
        let mut header = Header::new(Version::V3);
        header.num_fat_sectors = 1;
        header.difat[0] = 0;
        header.first_difat_sector = FREESECT;
        let difat = Difat::load(&header, &mut store).unwrap();
        assert_eq!(difat.fat_sectors(), &[0]);
    }
}
