/// Magic bytes that should be at the beginning of every compound file
pub const MAGIC: &[u8; 8] = b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1";

/// Minimal size of an empty compound file with 512-byte sectors (1536 bytes)
pub const MINIMAL_OLEFILE_SIZE: usize = 1536;

/// Size of the on-disk header structure (always 512 bytes)
pub const HEADER_SIZE: usize = 512;

/// Size of a directory entry in bytes
pub const DIRENTRY_SIZE: usize = 128;

/// Default sector size for version 3 (512 bytes)
pub const SECTOR_SIZE_V3: usize = 512;

/// Default sector size for version 4 (4096 bytes)
pub const SECTOR_SIZE_V4: usize = 4096;

/// Mini sector size (64 bytes for both versions)
pub const MINI_SECTOR_SIZE: usize = 64;

/// Mini sector shift stored in the header (2^6 = 64)
pub const MINI_SECTOR_SHIFT: u16 = 6;

/// Streams strictly smaller than this live in the ministream
pub const MINI_STREAM_CUTOFF: u32 = 4096;

/// Minor version written to new headers
pub const MINOR_VERSION: u16 = 0x003E;

/// Byte order mark (little-endian)
pub const BYTE_ORDER_MARK: u16 = 0xFFFE;

/// Number of DIFAT entries stored inline in the header
pub const HEADER_DIFAT_ENTRIES: usize = 109;

/// Longest entry name in UTF-16 code units (excluding the terminator)
pub const MAX_NAME_LEN: usize = 31;

/// Largest stream a version 3 file can describe (2 GiB)
pub const MAX_STREAM_SIZE_V3: u64 = 0x8000_0000;

/// File offset whose sector is reserved for range locks
pub const RANGE_LOCK_OFFSET: u64 = 0x7FFF_FF00;

// Sector IDs (from MS-CFB)
/// Maximum regular sector ID
pub const MAXREGSECT: u32 = 0xFFFFFFFA; // -6
/// Denotes a DIFAT sector in a FAT
pub const DIFSECT: u32 = 0xFFFFFFFC; // -4
/// Denotes a FAT sector in a FAT
pub const FATSECT: u32 = 0xFFFFFFFD; // -3
/// End of a virtual stream chain
pub const ENDOFCHAIN: u32 = 0xFFFFFFFE; // -2
/// Unallocated sector
pub const FREESECT: u32 = 0xFFFFFFFF; // -1

// Directory Entry IDs (from MS-CFB)
/// Maximum directory entry ID
pub const MAXREGSID: u32 = 0xFFFFFFFA; // -6
/// Unallocated directory entry
pub const NOSTREAM: u32 = 0xFFFFFFFF; // -1

// Object types in storage (from MS-CFB)
/// Empty directory entry
pub const STGTY_EMPTY: u8 = 0;
/// Element is a storage object
pub const STGTY_STORAGE: u8 = 1;
/// Element is a stream object
pub const STGTY_STREAM: u8 = 2;
/// Element is a root storage
pub const STGTY_ROOT: u8 = 5;

// Red-black node colors
/// Red node
pub const COLOR_RED: u8 = 0;
/// Black node
pub const COLOR_BLACK: u8 = 1;

/// Name of the root directory entry
pub const ROOT_ENTRY_NAME: &str = "Root Entry";
