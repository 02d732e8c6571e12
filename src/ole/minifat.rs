//! MiniFAT
//!
//! Streams smaller than the mini stream cutoff (4096 bytes) are stored in
//! 64-byte mini sectors inside the ministream, which is itself the normal
//! sector chain of the root entry. The MiniFAT chains mini sectors the same
//! way the FAT chains regular sectors, and is stored as a regular chain.
//!
//! Freed mini sectors are always reused (first fit).

use super::consts::*;
use super::fat::follow_chain;
use crate::common::binary::{read_u32_table, write_u32_table};
use crate::common::Result;

/// In-memory MiniFAT
#[derive(Debug, Clone, Default)]
pub(crate) struct MiniFat {
    /// The MiniFAT table (maps mini sector ID to the next mini sector)
    next: Vec<u32>,
    /// Lowest index that may hold a free entry
    free_hint: usize,
}

impl MiniFat {
    /// Decode the MiniFAT from the bytes of its chain
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut next = read_u32_table(bytes)?;
        // Trailing free entries carry no information
        let used = next
            .iter()
            .rposition(|&entry| entry != FREESECT)
            .map_or(0, |pos| pos + 1);
        next.truncate(used);
        Ok(Self { next, free_hint: 0 })
    }

    /// Number of entries in the table
    #[inline]
    pub fn len(&self) -> usize {
        self.next.len()
    }

    /// Highest mini sector in use, if any
    pub fn highest_used(&self) -> Option<u32> {
        self.next
            .iter()
            .rposition(|&entry| entry != FREESECT)
            .map(|pos| pos as u32)
    }

    /// Resolve the mini chain starting at `start`
    pub fn resolve_chain(&self, start: u32) -> Result<Vec<u32>> {
        follow_chain(&self.next, start, "MiniFAT")
    }

    fn allocate(&mut self) -> u32 {
        let found = self.next[self.free_hint.min(self.next.len())..]
            .iter()
            .position(|&entry| entry == FREESECT)
            .map(|offset| self.free_hint.min(self.next.len()) + offset);
        let index = match found {
            Some(index) => index,
            None => {
                self.next.push(FREESECT);
                self.next.len() - 1
            },
        };
        self.next[index] = ENDOFCHAIN;
        self.free_hint = index + 1;
        index as u32
    }

    /// Append `count` mini sectors to `chain`, returning the new ids
    pub fn extend_chain(&mut self, chain: &mut Vec<u32>, count: usize) -> Vec<u32> {
        let mut added = Vec::with_capacity(count);
        for _ in 0..count {
            let sector = self.allocate();
            if let Some(&last) = chain.last() {
                self.next[last as usize] = sector;
            }
            chain.push(sector);
            added.push(sector);
        }
        added
    }

    /// Keep the first `keep` mini sectors of `chain` and free the rest
    pub fn truncate_chain(&mut self, chain: &mut Vec<u32>, keep: usize) -> Vec<u32> {
        if keep >= chain.len() {
            return Vec::new();
        }
        let freed = chain.split_off(keep);
        for &sector in &freed {
            if let Some(entry) = self.next.get_mut(sector as usize) {
                *entry = FREESECT;
            }
            self.free_hint = self.free_hint.min(sector as usize);
        }
        if let Some(&last) = chain.last() {
            self.next[last as usize] = ENDOFCHAIN;
        }
        freed
    }

    /// Serialize into whole sectors, trailing space filled with FREESECT
    pub fn to_bytes(&self, sector_size: usize) -> Vec<u8> {
        let used = self.highest_used().map_or(0, |id| id as usize + 1);
        let sectors = (used * 4).div_ceil(sector_size);
        let mut bytes = vec![0u8; sectors * sector_size];
        write_u32_table(&self.next[..used], &mut bytes, FREESECT);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_mini_chain() {
        let mut minifat = MiniFat::default();
        let mut chain = Vec::new();
        let added = minifat.extend_chain(&mut chain, 3);
        assert_eq!(added, vec![0, 1, 2]);
        assert_eq!(minifat.resolve_chain(0).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reuse_after_truncate() {
        let mut minifat = MiniFat::default();
        let mut a = Vec::new();
        let mut b = Vec::new();
        minifat.extend_chain(&mut a, 4);
        minifat.extend_chain(&mut b, 1);
        assert_eq!(minifat.truncate_chain(&mut a, 2), vec![2, 3]);

        let mut c = Vec::new();
        minifat.extend_chain(&mut c, 3);
        assert_eq!(c, vec![2, 3, 5]);
        assert_eq!(minifat.highest_used(), Some(5));
    }

    #[test]
    fn test_serialization() {
        let mut minifat = MiniFat::default();
        assert!(minifat.to_bytes(512).is_empty());

        let mut chain = Vec::new();
        minifat.extend_chain(&mut chain, 130);
        let bytes = minifat.to_bytes(512);
        assert_eq!(bytes.len(), 1024);

        let decoded = MiniFat::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.len(), 130);
        assert_eq!(decoded.resolve_chain(0).unwrap().len(), 130);
    }
}
