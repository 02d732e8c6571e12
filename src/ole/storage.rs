//! Storage handles

use super::directory::entry::ObjectType;
use super::directory::{Entry, ROOT_SID};
use super::engine::{Engine, with_engine};
use super::sector::Backing;
use super::stream::Stream;
use crate::common::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;

/// A storage (directory) inside an open compound file.
///
/// Handles are cheap to clone. They stay valid across commits and become
/// `NotFound` once their entry is deleted, or `Disposed` once the container
/// is closed.
pub struct Storage<F: Backing> {
    engine: Weak<Mutex<Engine<F>>>,
    sid: u32,
    token: u64,
}

impl<F: Backing> Storage<F> {
    pub(crate) fn new(engine: Weak<Mutex<Engine<F>>>, sid: u32, token: u64) -> Self {
        Self { engine, sid, token }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Engine<F>) -> Result<T>) -> Result<T> {
        with_engine(&self.engine, f)
    }

    /// Whether this is the root storage
    pub fn is_root(&self) -> bool {
        self.sid == ROOT_SID
    }

    /// Name of this storage
    pub fn name(&self) -> Result<String> {
        self.with(|engine| Ok(engine.entry(self.sid, self.token)?.name_string()))
    }

    /// Metadata of this storage
    pub fn entry(&self) -> Result<Entry> {
        self.with(|engine| engine.describe(self.sid, self.token))
    }

    /// Create a child storage
    pub fn create_storage(&self, name: &str) -> Result<Storage<F>> {
        let (sid, token) = self.with(|engine| {
            engine.create_child(self.sid, self.token, name, ObjectType::Storage)
        })?;
        Ok(Storage::new(self.engine.clone(), sid, token))
    }

    /// Create an empty child stream
    pub fn create_stream(&self, name: &str) -> Result<Stream<F>> {
        let (sid, token) = self.with(|engine| {
            engine.create_child(self.sid, self.token, name, ObjectType::Stream)
        })?;
        Ok(Stream::new(self.engine.clone(), sid, token))
    }

    /// Open a child storage by name
    pub fn open_storage(&self, name: &str) -> Result<Storage<F>> {
        self.try_open_storage(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Open a child stream by name. The stream's chain is resolved right
    /// away so corruption surfaces here rather than on the first read.
    pub fn open_stream(&self, name: &str) -> Result<Stream<F>> {
        self.try_open_stream(name)?
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Open a child storage, returning `None` when no entry has that name
    pub fn try_open_storage(&self, name: &str) -> Result<Option<Storage<F>>> {
        let found = self.with(|engine| engine.lookup(self.sid, self.token, name))?;
        match found {
            None => Ok(None),
            Some((sid, token, object_type)) if object_type.is_container() => {
                Ok(Some(Storage::new(self.engine.clone(), sid, token)))
            },
            Some(_) => Err(Error::NotFound(format!(
                "{} is a stream, not a storage",
                name
            ))),
        }
    }

    /// Open a child stream, returning `None` when no entry has that name
    pub fn try_open_stream(&self, name: &str) -> Result<Option<Stream<F>>> {
        let found = self.with(|engine| {
            let found = engine.lookup(self.sid, self.token, name)?;
            if let Some((sid, _, ObjectType::Stream)) = found {
                engine.validate_stream(sid)?;
            }
            Ok(found)
        })?;
        match found {
            None => Ok(None),
            Some((sid, token, ObjectType::Stream)) => {
                Ok(Some(Stream::new(self.engine.clone(), sid, token)))
            },
            Some(_) => Err(Error::NotFound(format!(
                "{} is a storage, not a stream",
                name
            ))),
        }
    }

    /// Whether a child with this name exists
    pub fn contains(&self, name: &str) -> Result<bool> {
        self.with(|engine| Ok(engine.lookup(self.sid, self.token, name)?.is_some()))
    }

    /// Delete a child and everything below it
    pub fn delete(&self, name: &str) -> Result<()> {
        self.with(|engine| engine.delete_child(self.sid, self.token, name))
    }

    /// Rename a child
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.with(|engine| engine.rename_child(self.sid, self.token, old_name, new_name))
    }

    /// Children in sibling order, or every descendant in pre-order
    pub fn enumerate_entries(&self, recursive: bool) -> Result<Vec<Entry>> {
        self.with(|engine| engine.enumerate(self.sid, self.token, recursive))
    }

    pub fn clsid(&self) -> Result<[u8; 16]> {
        self.with(|engine| Ok(engine.entry(self.sid, self.token)?.clsid))
    }

    pub fn set_clsid(&self, clsid: [u8; 16]) -> Result<()> {
        self.with(|engine| engine.set_clsid(self.sid, self.token, clsid))
    }

    pub fn state_bits(&self) -> Result<u32> {
        self.with(|engine| Ok(engine.entry(self.sid, self.token)?.state_bits))
    }

    pub fn set_state_bits(&self, bits: u32) -> Result<()> {
        self.with(|engine| engine.set_state_bits(self.sid, self.token, bits))
    }
}

impl<F: Backing> Clone for Storage<F> {
    fn clone(&self) -> Self {
        Self::new(self.engine.clone(), self.sid, self.token)
    }
}

impl<F: Backing> fmt::Debug for Storage<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("sid", &self.sid)
            .field("token", &self.token)
            .finish()
    }
}
