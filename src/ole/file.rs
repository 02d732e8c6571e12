//! Compound file container
//!
//! [`CompoundFile`] owns the storage engine and hands out [`Storage`] and
//! [`Stream`] handles. Handles only keep a weak reference, so closing or
//! dropping the container disposes every handle at once.

use super::config::{StorageOptions, UpdateMode, Version};
use super::consts::{MAGIC, MINIMAL_OLEFILE_SIZE};
use super::directory::ROOT_SID;
use super::engine::{Engine, SharedEngine};
use super::sector::Backing;
use super::storage::Storage;
use super::stream::Stream;
use crate::common::{Error, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions, TryLockError};
use std::path::Path;
use std::sync::Arc;

/// An open compound file on a backing stream `F`.
///
/// # Examples
///
/// ```rust
/// use olestore::{CompoundFile, StorageOptions};
/// use std::io::Cursor;
///
/// # fn main() -> olestore::Result<()> {
/// let cf = CompoundFile::create(Cursor::new(Vec::new()), StorageOptions::default())?;
/// let root = cf.root()?;
/// let stream = root.create_storage("Docs")?.create_stream("Body")?;
/// stream.write_at(b"hello", 0)?;
/// cf.commit()?;
///
/// let bytes = cf.into_inner()?.into_inner();
/// let cf = CompoundFile::open(Cursor::new(bytes), StorageOptions::default())?;
/// assert_eq!(cf.read_stream(&["Docs", "Body"])?, b"hello");
/// # Ok(())
/// # }
/// ```
pub struct CompoundFile<F: Backing> {
    engine: Option<SharedEngine<F>>,
}

impl<F: Backing> CompoundFile<F> {
    fn wrap(engine: Engine<F>) -> Self {
        Self {
            engine: Some(Arc::new(Mutex::new(engine))),
        }
    }

    fn shared(&self) -> Result<&SharedEngine<F>> {
        self.engine.as_ref().ok_or(Error::Disposed)
    }

    fn with<T>(&self, f: impl FnOnce(&mut Engine<F>) -> Result<T>) -> Result<T> {
        let shared = self.shared()?;
        let mut guard = shared.lock();
        f(&mut guard)
    }

    /// Create a new, empty compound file on `inner`. Existing content of
    /// `inner` is discarded.
    pub fn create(inner: F, options: StorageOptions) -> Result<Self> {
        Ok(Self::wrap(Engine::create(inner, options)?))
    }

    /// Open an existing compound file
    pub fn open(inner: F, options: StorageOptions) -> Result<Self> {
        Ok(Self::wrap(Engine::open(inner, options)?))
    }

    /// The root storage
    pub fn root(&self) -> Result<Storage<F>> {
        let shared = self.shared()?;
        let token = shared.lock().root_token();
        Ok(Storage::new(Arc::downgrade(shared), ROOT_SID, token))
    }

    /// Format version of the open file
    pub fn version(&self) -> Result<Version> {
        self.with(|engine| Ok(engine.version()))
    }

    pub fn mode(&self) -> Result<UpdateMode> {
        self.with(|engine| Ok(engine.mode()))
    }

    /// Whether there are changes not yet written to the backing stream
    pub fn is_dirty(&self) -> Result<bool> {
        self.with(|engine| Ok(engine.is_dirty()))
    }

    /// Write pending changes to the backing stream
    pub fn commit(&self) -> Result<()> {
        self.with(|engine| engine.commit())
    }

    /// Same as [`CompoundFile::commit`]
    pub fn flush(&self) -> Result<()> {
        self.commit()
    }

    /// Discard every change since the last commit (transacted mode only).
    /// Handles created since then become stale.
    pub fn revert(&self) -> Result<()> {
        self.with(|engine| engine.revert())
    }

    /// Move the file to `destination`, writing the full image there
    /// including pending changes, and return the previous backing stream.
    /// Existing handles keep working against the new stream.
    pub fn switch_to(&self, destination: F) -> Result<F> {
        self.with(|engine| engine.switch_to(destination))
    }

    /// Rewrite the file without unused sectors or directory slots. Pending
    /// changes are included. Every handle except the root becomes stale.
    pub fn shrink(&self) -> Result<()> {
        self.with(|engine| engine.shrink())
    }

    fn finish(&mut self) -> Result<Option<Engine<F>>> {
        let Some(shared) = self.engine.take() else {
            return Ok(None);
        };
        let mut engine = match Arc::try_unwrap(shared) {
            Ok(mutex) => mutex.into_inner(),
            Err(shared) => {
                self.engine = Some(shared);
                return Err(Error::InvalidOperation(
                    "Compound file is still in use".to_string(),
                ));
            },
        };
        if engine.mode() == UpdateMode::Direct && engine.is_dirty() {
            engine.commit()?;
        }
        Ok(Some(engine))
    }

    /// Close the file. In direct mode pending changes are written first;
    /// in transacted mode they are discarded.
    pub fn close(mut self) -> Result<()> {
        self.finish().map(drop)
    }

    /// Close the file and hand back the backing stream
    pub fn into_inner(mut self) -> Result<F> {
        self.finish()?
            .map(Engine::into_inner)
            .ok_or(Error::Disposed)
    }

    /// Paths of every stream, in pre-order
    pub fn list_streams(&self) -> Result<Vec<Vec<String>>> {
        let root = self.root()?;
        Ok(root
            .enumerate_entries(true)?
            .into_iter()
            .filter(|entry| entry.is_stream())
            .map(|entry| entry.path)
            .collect())
    }

    /// Whether an entry exists at `path`
    pub fn exists(&self, path: &[&str]) -> Result<bool> {
        self.with(|engine| Ok(engine.resolve_path(path).is_some()))
    }

    /// Open the stream at `path`
    pub fn open_stream(&self, path: &[&str]) -> Result<Stream<F>> {
        let Some((last, parents)) = path.split_last() else {
            return Err(Error::NotFound("empty path".to_string()));
        };
        let mut storage = self.root()?;
        for name in parents {
            storage = storage.open_storage(name)?;
        }
        storage.open_stream(last)
    }

    /// Whole content of the stream at `path`
    pub fn read_stream(&self, path: &[&str]) -> Result<Vec<u8>> {
        self.open_stream(path)?.read_to_vec()
    }
}

impl CompoundFile<File> {
    /// Open a compound file on disk. Writers take an exclusive lock and
    /// read-only opens a shared one; a conflicting lock is a
    /// `SharingViolation`.
    pub fn open_path(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!options.read_only)
            .open(path)?;
        lock(&file, path, options.read_only)?;
        Self::open(file, options)
    }

    /// Create (or replace) a compound file on disk, holding an exclusive lock
    pub fn create_path(path: impl AsRef<Path>, options: StorageOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // Truncation happens once the lock is held
        lock(&file, path, false)?;
        Self::create(file, options)
    }
}

pub(super) fn lock(file: &File, path: &Path, shared: bool) -> Result<()> {
    let result = if shared {
        file.try_lock_shared()
    } else {
        file.try_lock()
    };
    match result {
        Ok(()) => Ok(()),
        Err(TryLockError::WouldBlock) => Err(Error::SharingViolation(path.display().to_string())),
        Err(TryLockError::Error(e)) => Err(Error::Io(e)),
    }
}

impl<F: Backing> Drop for CompoundFile<F> {
    fn drop(&mut self) {
        let Some(shared) = self.engine.take() else {
            return;
        };
        let mut engine = shared.lock();
        if engine.mode() == UpdateMode::Direct
            && engine.is_dirty()
            && engine.check_writable().is_ok()
            && let Err(e) = engine.commit()
        {
            tracing::warn!(error = %e, "failed to flush compound file on drop");
        }
    }
}

/// Check if data starts like a compound file
pub fn is_compound_file(data: &[u8]) -> bool {
    data.len() >= MINIMAL_OLEFILE_SIZE && &data[0..8] == MAGIC
}
