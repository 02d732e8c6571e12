/// Constants for the compound file format
pub mod consts;

/// Options for creating and opening compound files
mod config;

/// File header
mod header;

/// Sector-granular cache over the backing stream
mod sector;

/// FILETIME conversion
mod time;

/// Sector allocation table
mod fat;

/// Locations of the FAT sectors
mod difat;

/// Allocation table of the ministream
mod minifat;

/// Directory entries and their sibling trees
mod directory;

/// Byte views over sector chains
mod view;

/// Storage engine shared by the container and its handles
mod engine;

/// Rewriting a file without unused space
mod compact;

/// Storage handles
mod storage;

/// Stream handles
mod stream;

/// Compound file container
mod file;


// Re-export public types for convenient access
pub use compact::shrink_file;
pub use config::{StorageOptions, UpdateMode, Version};
pub use directory::{Entry, EntryKind};
pub use file::{CompoundFile, is_compound_file};
pub use sector::Backing;
pub use storage::Storage;
pub use stream::Stream;
