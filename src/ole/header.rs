//! Compound file header
//!
//! The first 512 bytes of the file describe the format version, sector
//! geometry and the entry points of the FAT, DIFAT, MiniFAT and directory
//! chains. For version 4 files the header occupies a whole 4096-byte sector,
//! the rest of which is zero.

use super::config::Version;
use super::consts::*;
use crate::common::{Error, Result};
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable, IntoBytes as DeriveIntoBytes, KnownLayout,
};

/// Raw header structure (512 bytes)
///
/// This represents the on-disk layout, field for field.
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    /// Magic signature
    signature: [u8; 8],
    /// Reserved class id (zero)
    clsid: [u8; 16],
    /// Minor version (0x003E)
    minor_version: U16<LE>,
    /// Major version (3 or 4)
    major_version: U16<LE>,
    /// Byte order mark (0xFFFE)
    byte_order: U16<LE>,
    /// Sector shift (9 or 12)
    sector_shift: U16<LE>,
    /// Mini sector shift (6)
    mini_sector_shift: U16<LE>,
    /// Reserved
    reserved: [u8; 6],
    /// Number of directory sectors (0 for version 3)
    num_dir_sectors: U32<LE>,
    /// Number of FAT sectors
    num_fat_sectors: U32<LE>,
    /// First directory sector
    first_dir_sector: U32<LE>,
    /// Transaction signature
    transaction_signature: U32<LE>,
    /// Mini stream cutoff size
    mini_stream_cutoff: U32<LE>,
    /// First MiniFAT sector
    first_minifat_sector: U32<LE>,
    /// Number of MiniFAT sectors
    num_minifat_sectors: U32<LE>,
    /// First DIFAT sector
    first_difat_sector: U32<LE>,
    /// Number of DIFAT sectors
    num_difat_sectors: U32<LE>,
    /// First 109 FAT sector ids
    difat: [U32<LE>; HEADER_DIFAT_ENTRIES],
}

/// Parsed compound file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version
    pub version: Version,
    /// Streams smaller than this are stored in the ministream
    pub mini_stream_cutoff: u32,
    /// Number of directory sectors (only meaningful for version 4)
    pub num_dir_sectors: u32,
    /// Number of FAT sectors
    pub num_fat_sectors: u32,
    /// First directory sector
    pub first_dir_sector: u32,
    /// Transaction signature (carried through unchanged)
    pub transaction_signature: u32,
    /// First MiniFAT sector
    pub first_minifat_sector: u32,
    /// Number of MiniFAT sectors
    pub num_minifat_sectors: u32,
    /// First DIFAT sector
    pub first_difat_sector: u32,
    /// Number of DIFAT sectors
    pub num_difat_sectors: u32,
    /// Inline FAT sector ids; unused slots hold FREESECT
    pub difat: [u32; HEADER_DIFAT_ENTRIES],
}

impl Header {
    /// Header for an empty file of the given version
    pub fn new(version: Version) -> Self {
        Self {
            version,
            mini_stream_cutoff: MINI_STREAM_CUTOFF,
            num_dir_sectors: 0,
            num_fat_sectors: 0,
            first_dir_sector: ENDOFCHAIN,
            transaction_signature: 0,
            first_minifat_sector: ENDOFCHAIN,
            num_minifat_sectors: 0,
            first_difat_sector: ENDOFCHAIN,
            num_difat_sectors: 0,
            difat: [FREESECT; HEADER_DIFAT_ENTRIES],
        }
    }

    /// Parse and validate the 512-byte header.
    ///
    /// `physical_sectors` is the number of sectors actually present after the
    /// header; declared counts larger than that cannot be valid.
    pub fn parse(bytes: &[u8], physical_sectors: u64) -> Result<Self> {
        let raw = RawHeader::read_from_prefix(bytes)
            .map(|(raw, _)| raw)
            .map_err(|_| Error::InvalidFormat("Header is shorter than 512 bytes".to_string()))?;

        // Validate magic bytes
        if &raw.signature != MAGIC {
            return Err(Error::InvalidFormat("Invalid signature".to_string()));
        }

        // Validate byte order (must be little-endian)
        if raw.byte_order.get() != BYTE_ORDER_MARK {
            return Err(Error::InvalidFormat(format!(
                "Invalid byte order mark 0x{:04X}",
                raw.byte_order.get()
            )));
        }

        let version = Version::from_major(raw.major_version.get()).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "Unsupported major version {}",
                raw.major_version.get()
            ))
        })?;

        // Validate sector size matches version
        if raw.sector_shift.get() != version.sector_shift() {
            return Err(Error::InvalidFormat(format!(
                "Sector shift {} does not match version {}",
                raw.sector_shift.get(),
                version.major()
            )));
        }
        if raw.mini_sector_shift.get() != MINI_SECTOR_SHIFT {
            return Err(Error::InvalidFormat(format!(
                "Unsupported mini sector shift {}",
                raw.mini_sector_shift.get()
            )));
        }

        let header = Header {
            version,
            mini_stream_cutoff: raw.mini_stream_cutoff.get(),
            num_dir_sectors: raw.num_dir_sectors.get(),
            num_fat_sectors: raw.num_fat_sectors.get(),
            first_dir_sector: raw.first_dir_sector.get(),
            transaction_signature: raw.transaction_signature.get(),
            first_minifat_sector: raw.first_minifat_sector.get(),
            num_minifat_sectors: raw.num_minifat_sectors.get(),
            first_difat_sector: raw.first_difat_sector.get(),
            num_difat_sectors: raw.num_difat_sectors.get(),
            difat: raw.difat.map(|id| id.get()),
        };

        if header.mini_stream_cutoff == 0 {
            return Err(Error::InvalidFormat("Mini stream cutoff is zero".to_string()));
        }

        for (what, count) in [
            ("FAT", header.num_fat_sectors),
            ("DIFAT", header.num_difat_sectors),
            ("MiniFAT", header.num_minifat_sectors),
        ] {
            if u64::from(count) > physical_sectors {
                return Err(Error::InvalidFormat(format!(
                    "Header declares {} {} sectors but the file holds {}",
                    count, what, physical_sectors
                )));
            }
        }

        Ok(header)
    }

    /// Sector size in bytes
    #[inline]
    pub fn sector_size(&self) -> usize {
        self.version.sector_size()
    }

    /// Serialize the header into a buffer of one sector
    pub fn to_bytes(&self) -> Vec<u8> {
        let raw = RawHeader {
            signature: *MAGIC,
            clsid: [0; 16],
            minor_version: U16::new(MINOR_VERSION),
            major_version: U16::new(self.version.major()),
            byte_order: U16::new(BYTE_ORDER_MARK),
            sector_shift: U16::new(self.version.sector_shift()),
            mini_sector_shift: U16::new(MINI_SECTOR_SHIFT),
            reserved: [0; 6],
            // For 512-byte sectors the directory sector count must be 0
            num_dir_sectors: U32::new(match self.version {
                Version::V3 => 0,
                Version::V4 => self.num_dir_sectors,
            }),
            num_fat_sectors: U32::new(self.num_fat_sectors),
            first_dir_sector: U32::new(self.first_dir_sector),
            transaction_signature: U32::new(self.transaction_signature),
            mini_stream_cutoff: U32::new(self.mini_stream_cutoff),
            first_minifat_sector: U32::new(self.first_minifat_sector),
            num_minifat_sectors: U32::new(self.num_minifat_sectors),
            first_difat_sector: U32::new(self.first_difat_sector),
            num_difat_sectors: U32::new(self.num_difat_sectors),
            difat: self.difat.map(U32::new),
        };

        let mut bytes = vec![0u8; self.sector_size()];
        bytes[..HEADER_SIZE].copy_from_slice(raw.as_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let mut header = Header::new(Version::V3);
        header.first_dir_sector = 10;
        header.num_fat_sectors = 3;
        header.difat[0] = 1;
        header.difat[1] = 2;
        header.difat[2] = 3;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..8], MAGIC);
        assert_eq!(&bytes[28..30], &0xFFFEu16.to_le_bytes()); // Little-endian marker

        let parsed = Header::parse(&bytes, 16).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_sector_size_4096() {
        let header = Header::new(Version::V4);
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), 4096);
        // Major version should be 4
        assert_eq!(&bytes[26..28], &4u16.to_le_bytes());
        // Sector shift should be 12 (2^12 = 4096)
        assert_eq!(&bytes[30..32], &12u16.to_le_bytes());
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = Header::new(Version::V3).to_bytes();
        bytes[0] = 0;
        let err = Header::parse(&bytes, 4).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = Header::new(Version::V3).to_bytes();
        bytes[26..28].copy_from_slice(&5u16.to_le_bytes());
        assert!(matches!(
            Header::parse(&bytes, 4),
            Err(Error::InvalidFormat(_))
        ));

        // Version 3 with a 4096-byte sector shift
        let mut bytes = Header::new(Version::V3).to_bytes();
        bytes[30..32].copy_from_slice(&12u16.to_le_bytes());
        assert!(Header::parse(&bytes, 4).is_err());
    }

    #[test]
    fn test_rejects_counts_beyond_file() {
        let mut header = Header::new(Version::V3);
        header.num_fat_sectors = 50;
        let bytes = header.to_bytes();
        assert!(matches!(
            Header::parse(&bytes, 2),
            Err(Error::InvalidFormat(_))
        ));
    }
}
