/// Options controlling how a compound file is created or opened.
///
/// # Examples
///
/// ```rust
/// use olestore::{StorageOptions, UpdateMode, Version};
///
/// // Create with defaults (version 3, direct mode)
/// let options = StorageOptions::default();
///
/// // Or customize
/// let options = StorageOptions::new()
///     .with_version(Version::V4)
///     .with_mode(UpdateMode::Transacted)
///     .with_sector_recycle(false);
/// ```
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Format version used when creating a new file (ignored when opening)
    pub version: Version,
    /// How mutations reach the backing stream
    pub mode: UpdateMode,
    /// Reject every mutation
    pub read_only: bool,
    /// Reuse freed sectors before growing the file
    pub sector_recycle: bool,
    /// Overwrite freed sectors with zeros on commit
    pub erase_free_sectors: bool,
    /// Number of clean sectors kept in memory before the cache is dropped
    pub cache_sectors: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            version: Version::V3,
            mode: UpdateMode::Direct,
            read_only: false,
            sector_recycle: true,
            erase_free_sectors: false,
            cache_sectors: 1024,
        }
    }
}

impl StorageOptions {
    /// Create a new `StorageOptions` with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the format version for newly created files.
    #[inline]
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Set the update mode.
    ///
    /// In [`UpdateMode::Direct`] pending changes are written by `flush`,
    /// `commit`, `close` or drop. In [`UpdateMode::Transacted`] they are only
    /// written by `commit` and can be discarded with `revert`.
    #[inline]
    pub fn with_mode(mut self, mode: UpdateMode) -> Self {
        self.mode = mode;
        self
    }

    /// Open without write access. Files are locked shared instead of exclusive.
    #[inline]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set whether freed sectors are reused by later allocations.
    ///
    /// When disabled, every new sector is appended to the end of the file and
    /// space is only reclaimed by `shrink`.
    #[inline]
    pub fn with_sector_recycle(mut self, recycle: bool) -> Self {
        self.sector_recycle = recycle;
        self
    }

    /// Set whether freed sectors are zeroed on disk at the next commit.
    #[inline]
    pub fn with_erase_free_sectors(mut self, erase: bool) -> Self {
        self.erase_free_sectors = erase;
        self
    }

    /// Bound the number of clean sectors cached in memory.
    #[inline]
    pub fn with_cache_sectors(mut self, sectors: usize) -> Self {
        self.cache_sectors = sectors.max(1);
        self
    }
}

/// Compound file format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    /// Major version 3: 512-byte sectors, 32-bit stream sizes
    V3,
    /// Major version 4: 4096-byte sectors, 64-bit stream sizes
    V4,
}

impl Version {
    /// Map a header major version number.
    pub fn from_major(major: u16) -> Option<Self> {
        match major {
            3 => Some(Version::V3),
            4 => Some(Version::V4),
            _ => None,
        }
    }

    /// Header major version number.
    pub fn major(self) -> u16 {
        match self {
            Version::V3 => 3,
            Version::V4 => 4,
        }
    }

    /// Sector shift stored in the header.
    pub fn sector_shift(self) -> u16 {
        match self {
            Version::V3 => 9,
            Version::V4 => 12,
        }
    }

    /// Sector size in bytes.
    pub fn sector_size(self) -> usize {
        1 << self.sector_shift()
    }
}

/// How pending mutations are written to the backing stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Changes are written on flush/commit and when the file is closed
    Direct,
    /// Changes are written only on commit and can be reverted
    Transacted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_geometry() {
        assert_eq!(Version::V3.sector_size(), 512);
        assert_eq!(Version::V4.sector_size(), 4096);
        assert_eq!(Version::from_major(4), Some(Version::V4));
        assert_eq!(Version::from_major(5), None);
    }

    #[test]
    fn test_builder() {
        let options = StorageOptions::new()
            .with_mode(UpdateMode::Transacted)
            .with_cache_sectors(0);
        assert_eq!(options.mode, UpdateMode::Transacted);
        assert_eq!(options.cache_sectors, 1);
        assert!(options.sector_recycle);
    }
}
