//! Directory entries
//!
//! Every 128-byte record of the directory stream describes one storage,
//! stream or unused slot. Records are addressed by their index (SID).

use crate::common::binary::encode_name_field;
use crate::common::{Error, Result};
use crate::ole::config::Version;
use crate::ole::consts::*;
use crate::ole::time::from_filetime;
use chrono::{DateTime, Utc};
use zerocopy::{FromBytes, IntoBytes, LE, U16, U32, U64};
use zerocopy_derive::{
    FromBytes as DeriveFromBytes, Immutable, IntoBytes as DeriveIntoBytes, KnownLayout,
};

/// Raw directory entry structure (128 bytes)
///
/// This represents the on-disk format of a directory entry.
#[derive(Debug, Clone, DeriveFromBytes, DeriveIntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawDirectoryEntry {
    /// Entry name in UTF-16LE (64 bytes, null-padded)
    name: [u8; 64],
    /// Length of name in bytes (including null terminator)
    name_len: U16<LE>,
    /// Entry type (0 = empty, 1 = storage, 2 = stream, 5 = root)
    entry_type: u8,
    /// Node color (0 = red, 1 = black)
    node_color: u8,
    /// Left sibling SID
    sid_left: U32<LE>,
    /// Right sibling SID
    sid_right: U32<LE>,
    /// Child SID
    sid_child: U32<LE>,
    /// CLSID (16 bytes)
    clsid: [u8; 16],
    /// State bits
    state_bits: U32<LE>,
    /// Creation time (FILETIME)
    creation_time: U64<LE>,
    /// Modified time (FILETIME)
    modified_time: U64<LE>,
    /// Starting sector
    start_sector: U32<LE>,
    /// Stream size
    stream_size: U64<LE>,
}

/// Kind of object a directory slot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectType {
    Empty,
    Storage,
    Stream,
    Root,
}

impl ObjectType {
    fn from_raw(value: u8) -> Option<Self> {
        match value {
            STGTY_EMPTY => Some(ObjectType::Empty),
            STGTY_STORAGE => Some(ObjectType::Storage),
            STGTY_STREAM => Some(ObjectType::Stream),
            STGTY_ROOT => Some(ObjectType::Root),
            _ => None,
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            ObjectType::Empty => STGTY_EMPTY,
            ObjectType::Storage => STGTY_STORAGE,
            ObjectType::Stream => STGTY_STREAM,
            ObjectType::Root => STGTY_ROOT,
        }
    }

    /// Whether entries of this type own a sibling tree of children
    pub fn is_container(self) -> bool {
        matches!(self, ObjectType::Storage | ObjectType::Root)
    }
}

/// Red-black node color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// One directory slot held in memory
#[derive(Debug, Clone)]
pub(crate) struct DirEntry {
    /// Name as UTF-16 code units, without terminator
    pub name: Vec<u16>,
    pub object_type: ObjectType,
    pub color: Color,
    pub left: u32,
    pub right: u32,
    pub child: u32,
    pub clsid: [u8; 16],
    pub state_bits: u32,
    pub created: u64,
    pub modified: u64,
    pub start_sector: u32,
    pub size: u64,
    /// Tree parent within the sibling tree, NOSTREAM for the tree root.
    /// Not stored on disk.
    pub parent: u32,
    /// Identity of the object in this slot; changes when the slot is reused
    pub token: u64,
}

impl DirEntry {
    /// An unused slot
    pub fn empty(token: u64) -> Self {
        Self {
            name: Vec::new(),
            object_type: ObjectType::Empty,
            color: Color::Black,
            left: NOSTREAM,
            right: NOSTREAM,
            child: NOSTREAM,
            clsid: [0; 16],
            state_bits: 0,
            created: 0,
            modified: 0,
            start_sector: 0,
            size: 0,
            parent: NOSTREAM,
            token,
        }
    }

    /// A fresh storage or stream with no data
    pub fn new(name: Vec<u16>, object_type: ObjectType, token: u64) -> Self {
        let start_sector = match object_type {
            ObjectType::Stream | ObjectType::Root => ENDOFCHAIN,
            _ => 0,
        };
        Self {
            name,
            object_type,
            color: Color::Red,
            start_sector,
            ..Self::empty(token)
        }
    }

    /// The root entry of a new file
    pub fn root(token: u64) -> Self {
        let mut root = Self::new(
            ROOT_ENTRY_NAME.encode_utf16().collect(),
            ObjectType::Root,
            token,
        );
        root.color = Color::Black;
        root
    }

    /// Parse one 128-byte record
    pub fn parse(data: &[u8], version: Version, token: u64) -> Result<Self> {
        let raw = RawDirectoryEntry::read_from_bytes(data).map_err(|_| {
            Error::InvalidFormat("Failed to parse directory entry".to_string())
        })?;

        let object_type = ObjectType::from_raw(raw.entry_type).ok_or_else(|| {
            Error::CorruptedFile(format!("Unknown directory entry type {}", raw.entry_type))
        })?;
        if object_type == ObjectType::Empty {
            return Ok(Self::empty(token));
        }

        // Decode name from UTF-16LE; the length includes the terminator
        let name_len = (raw.name_len.get() as usize).min(64);
        let name: Vec<u16> = raw.name[..name_len.saturating_sub(2)]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();

        // Handle size based on version (512-byte sectors only use low 32 bits)
        let size = match version {
            Version::V3 => raw.stream_size.get() & 0xFFFF_FFFF,
            Version::V4 => raw.stream_size.get(),
        };

        Ok(Self {
            name,
            object_type,
            color: if raw.node_color == COLOR_RED {
                Color::Red
            } else {
                Color::Black
            },
            left: raw.sid_left.get(),
            right: raw.sid_right.get(),
            child: raw.sid_child.get(),
            clsid: raw.clsid,
            state_bits: raw.state_bits.get(),
            created: raw.creation_time.get(),
            modified: raw.modified_time.get(),
            start_sector: raw.start_sector.get(),
            size,
            parent: NOSTREAM,
            token,
        })
    }

    /// Serialize into a 128-byte record
    pub fn write_to(&self, out: &mut [u8], version: Version) {
        let empty = self.object_type == ObjectType::Empty;
        let raw = RawDirectoryEntry {
            name: encode_name_field(&self.name),
            name_len: U16::new(if empty {
                0
            } else {
                ((self.name.len().min(MAX_NAME_LEN) + 1) * 2) as u16
            }),
            entry_type: self.object_type.to_raw(),
            node_color: match self.color {
                Color::Red => COLOR_RED,
                Color::Black => COLOR_BLACK,
            },
            sid_left: U32::new(self.left),
            sid_right: U32::new(self.right),
            sid_child: U32::new(self.child),
            clsid: self.clsid,
            state_bits: U32::new(self.state_bits),
            creation_time: U64::new(self.created),
            modified_time: U64::new(self.modified),
            start_sector: U32::new(self.start_sector),
            // Version 3 readers only look at the low 32 bits
            stream_size: U64::new(match version {
                Version::V3 => self.size & 0xFFFF_FFFF,
                Version::V4 => self.size,
            }),
        };
        out[..DIRENTRY_SIZE].copy_from_slice(raw.as_bytes());
    }

    /// Name decoded as a string
    pub fn name_string(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }
}

/// Kind of a public directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// The root storage
    Root,
    /// A storage (directory)
    Storage,
    /// A stream (file)
    Stream,
}

/// Snapshot of a directory entry's metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Entry name
    pub name: String,
    /// Names of the storages leading to this entry, root excluded, followed by `name`
    pub path: Vec<String>,
    /// Storage, stream or root
    pub kind: EntryKind,
    /// Stream length in bytes (0 for storages)
    pub len: u64,
    /// Class id
    pub clsid: [u8; 16],
    /// User-defined state bits
    pub state_bits: u32,
    /// Creation time, if recorded
    pub created: Option<DateTime<Utc>>,
    /// Last modification time, if recorded
    pub modified: Option<DateTime<Utc>>,
    /// Directory slot index
    pub sid: u32,
}

impl Entry {
    pub(crate) fn from_dir(sid: u32, entry: &DirEntry, path: Vec<String>) -> Self {
        let kind = match entry.object_type {
            ObjectType::Root => EntryKind::Root,
            ObjectType::Storage | ObjectType::Empty => EntryKind::Storage,
            ObjectType::Stream => EntryKind::Stream,
        };
        Self {
            name: entry.name_string(),
            path,
            kind,
            len: if kind == EntryKind::Stream { entry.size } else { 0 },
            clsid: entry.clsid,
            state_bits: entry.state_bits,
            created: from_filetime(entry.created),
            modified: from_filetime(entry.modified),
            sid,
        }
    }

    /// Whether this entry is a stream
    pub fn is_stream(&self) -> bool {
        self.kind == EntryKind::Stream
    }

    /// Whether this entry is a storage or the root
    pub fn is_storage(&self) -> bool {
        matches!(self.kind, EntryKind::Storage | EntryKind::Root)
    }

    /// CLSID formatted as `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX`, empty when unset
    pub fn clsid_string(&self) -> String {
        format_clsid(&self.clsid)
    }
}

/// Format a CLSID in its registry form, or an empty string when all zeros
pub(crate) fn format_clsid(bytes: &[u8; 16]) -> String {
    // Check if all zeros
    if bytes.iter().all(|&b| b == 0) {
        return String::new();
    }

    let data1 = U32::<LE>::read_from_bytes(&bytes[0..4]).map_or(0, |v| v.get());
    let data2 = U16::<LE>::read_from_bytes(&bytes[4..6]).map_or(0, |v| v.get());
    let data3 = U16::<LE>::read_from_bytes(&bytes[6..8]).map_or(0, |v| v.get());
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        data1,
        data2,
        data3,
        bytes[8],
        bytes[9],
        bytes[10],
        bytes[11],
        bytes[12],
        bytes[13],
        bytes[14],
        bytes[15],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::binary::decode_utf16le;

    #[test]
    fn test_root_entry() {
        let root = DirEntry::root(1);
        let mut bytes = [0u8; 128];
        root.write_to(&mut bytes, Version::V3);

        assert_eq!(bytes[66], STGTY_ROOT);
        assert_eq!(bytes[67], COLOR_BLACK);
        assert_eq!(u16::from_le_bytes([bytes[64], bytes[65]]), 22);
        assert_eq!(decode_utf16le(&bytes[..64]), "Root Entry");

        let parsed = DirEntry::parse(&bytes, Version::V3, 7).unwrap();
        assert_eq!(parsed.name_string(), "Root Entry");
        assert_eq!(parsed.object_type, ObjectType::Root);
        assert_eq!(parsed.start_sector, ENDOFCHAIN);
        assert_eq!(parsed.token, 7);
    }

    #[test]
    fn test_stream_entry() {
        let mut entry = DirEntry::new("Data".encode_utf16().collect(), ObjectType::Stream, 1);
        entry.size = 0x1_0000_0010;
        entry.start_sector = 4;

        let mut bytes = [0u8; 128];
        entry.write_to(&mut bytes, Version::V3);
        // High 32 bits are dropped for version 3
        assert_eq!(DirEntry::parse(&bytes, Version::V3, 1).unwrap().size, 0x10);

        entry.write_to(&mut bytes, Version::V4);
        assert_eq!(
            DirEntry::parse(&bytes, Version::V4, 1).unwrap().size,
            0x1_0000_0010
        );
    }

    #[test]
    fn test_empty_and_unknown_types() {
        let mut bytes = [0u8; 128];
        DirEntry::empty(1).write_to(&mut bytes, Version::V3);
        assert_eq!(bytes[64..66], [0, 0]);
        assert_eq!(
            DirEntry::parse(&bytes, Version::V3, 1).unwrap().object_type,
            ObjectType::Empty
        );

        bytes[66] = 3;
        assert!(matches!(
            DirEntry::parse(&bytes, Version::V3, 1),
            Err(Error::CorruptedFile(_))
        ));
    }

    #[test]
    fn test_format_clsid() {
        let bytes = [
            0x10, 0x8D, 0x81, 0x64, 0x9B, 0x4F, 0xCF, 0x11, 0x86, 0xEA, 0x00, 0xAA, 0x00, 0xB9,
            0x29, 0xE8,
        ];
        assert_eq!(format_clsid(&bytes), "64818D10-4F9B-11CF-86EA-00AA00B929E8");
        assert_eq!(format_clsid(&[0; 16]), "");
    }
}
