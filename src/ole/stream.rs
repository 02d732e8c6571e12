//! Stream handles

use super::directory::Entry;
use super::engine::{Engine, with_engine};
use super::sector::Backing;
use crate::common::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Weak;

const COPY_CHUNK: usize = 64 * 1024;

/// A stream (file) inside an open compound file.
///
/// Besides positional access through [`Stream::read_at`] and
/// [`Stream::write_at`], every handle carries its own cursor for the
/// `std::io` traits. Clones start with an independent cursor at the same
/// position.
pub struct Stream<F: Backing> {
    engine: Weak<Mutex<Engine<F>>>,
    sid: u32,
    token: u64,
    pos: u64,
}

impl<F: Backing> Stream<F> {
    pub(crate) fn new(engine: Weak<Mutex<Engine<F>>>, sid: u32, token: u64) -> Self {
        Self {
            engine,
            sid,
            token,
            pos: 0,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Engine<F>) -> Result<T>) -> Result<T> {
        with_engine(&self.engine, f)
    }

    /// Current length in bytes
    pub fn len(&self) -> Result<u64> {
        self.with(|engine| engine.stream_len(self.sid, self.token))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn name(&self) -> Result<String> {
        self.with(|engine| Ok(engine.entry(self.sid, self.token)?.name_string()))
    }

    /// Metadata of this stream
    pub fn entry(&self) -> Result<Entry> {
        self.with(|engine| engine.describe(self.sid, self.token))
    }

    /// Read up to `buf.len()` bytes starting at `position`. Returns 0 at or
    /// past the end.
    pub fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.with(|engine| engine.read_at(self.sid, self.token, position, buf))
    }

    /// Write all of `buf` at `offset`, growing the stream when it ends past
    /// the current length. A gap between the old end and `offset` reads as
    /// zeros.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.with(|engine| engine.write_at(self.sid, self.token, offset, buf))
    }

    /// Truncate or zero-extend to `len` bytes
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.with(|engine| engine.set_len(self.sid, self.token, len))
    }

    /// Write `data` at the end of the stream
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.with(|engine| {
            let len = engine.stream_len(self.sid, self.token)?;
            engine.write_at(self.sid, self.token, len, data)
        })
    }

    /// Append everything `reader` yields, returning the byte count
    pub fn copy_from<R: Read>(&self, reader: &mut R) -> Result<u64> {
        let mut buffer = vec![0u8; COPY_CHUNK];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.append(&buffer[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    /// Whole content of the stream
    pub fn read_to_vec(&self) -> Result<Vec<u8>> {
        self.with(|engine| {
            let len = engine.stream_len(self.sid, self.token)?;
            let len = usize::try_from(len)
                .map_err(|_| Error::Capacity(format!("Stream of {} bytes does not fit in memory", len)))?;
            let mut data = vec![0u8; len];
            let n = engine.read_at(self.sid, self.token, 0, &mut data)?;
            data.truncate(n);
            Ok(data)
        })
    }
}

impl<F: Backing> Read for Stream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<F: Backing> Write for Stream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_at(buf, self.pos)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Data reaches the backing stream when the container commits
        Ok(())
    }
}

impl<F: Backing> Seek for Stream<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => self.len()?.checked_add_signed(delta),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            },
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}

impl<F: Backing> Clone for Stream<F> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            sid: self.sid,
            token: self.token,
            pos: self.pos,
        }
    }
}

impl<F: Backing> fmt::Debug for Stream<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("sid", &self.sid)
            .field("token", &self.token)
            .field("pos", &self.pos)
            .finish()
    }
}
