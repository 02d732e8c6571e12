//! olestore - A Rust engine for reading and writing Compound File Binary
//! (OLE2 structured storage) containers
//!
//! A compound file is a small file system inside a single file: a tree of
//! storages (directories) and streams (files) addressed by name. It is the
//! container behind legacy Office documents, MSI packages and Outlook
//! messages.
//!
//! # Features
//!
//! - **Versions 3 and 4**: 512-byte and 4096-byte sectors
//! - **Full read/write**: create, delete, rename, resize and enumerate entries
//! - **Direct and transacted modes**: commit or revert pending changes
//! - **Compaction**: rewrite a file without unused sectors
//! - **Corruption detection**: cycles and out-of-range references are errors,
//!   never infinite loops
//!
//! # Example - Writing and reading back
//!
//! ```rust
//! use olestore::{CompoundFile, StorageOptions, Version};
//! use std::io::{Cursor, Read, Write};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = StorageOptions::new().with_version(Version::V4);
//! let cf = CompoundFile::create(Cursor::new(Vec::new()), options)?;
//!
//! let mut stream = cf.root()?.create_stream("Contents")?;
//! stream.write_all(b"Hello, compound file")?;
//! cf.commit()?;
//!
//! let bytes = cf.into_inner()?.into_inner();
//! assert!(olestore::is_compound_file(&bytes));
//!
//! let cf = CompoundFile::open(Cursor::new(bytes), StorageOptions::default())?;
//! let mut text = String::new();
//! cf.root()?.open_stream("Contents")?.read_to_string(&mut text)?;
//! assert_eq!(text, "Hello, compound file");
//! # Ok(())
//! # }
//! ```
//!
//! # Example - Files on disk
//!
//! ```no_run
//! use olestore::{CompoundFile, StorageOptions};
//!
//! # fn main() -> olestore::Result<()> {
//! let cf = CompoundFile::open_path("setup.msi", StorageOptions::new().with_read_only(true))?;
//! for path in cf.list_streams()? {
//!     println!("Stream: {}", path.join("/"));
//! }
//! # Ok(())
//! # }
//! ```

/// Error types and byte helpers
pub mod common;

/// Compound file engine
///
/// This module provides the container, storage and stream handles, and the
/// on-disk structures behind them.
pub mod ole;

// Re-export commonly used types for convenience
pub use common::{Error, Result};
pub use ole::{
    Backing, CompoundFile, Entry, EntryKind, Storage, StorageOptions, Stream, UpdateMode, Version,
    is_compound_file, shrink_file,
};
