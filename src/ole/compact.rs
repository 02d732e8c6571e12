//! Compaction
//!
//! Rebuilds a compound file into a fresh image holding only live data:
//! entries are re-inserted in pre-order, streams are copied in chunks and the
//! result replaces the original content. The root keeps its identity so root
//! handles stay usable; every other handle goes stale.

use super::config::{StorageOptions, UpdateMode};
use super::directory::ROOT_SID;
use super::directory::entry::ObjectType;
use super::engine::Engine;
use super::file::lock;
use super::sector::Backing;
use crate::common::Result;
use std::fs::OpenOptions;
use std::io::Cursor;
use std::path::Path;

const COPY_CHUNK: usize = 64 * 1024;

impl<F: Backing> Engine<F> {
    /// Serialize the live content of this file into a new, gap-free image
    fn compacted_image(&mut self) -> Result<Vec<u8>> {
        let options = StorageOptions::new()
            .with_version(self.version())
            .with_mode(UpdateMode::Direct)
            .with_cache_sectors(self.options.cache_sectors);
        let mut fresh = Engine::create(Cursor::new(Vec::new()), options)?;

        {
            let source = self.directory.root();
            let (clsid, state_bits, created, modified) =
                (source.clsid, source.state_bits, source.created, source.modified);
            let root = fresh.directory.root_mut();
            root.clsid = clsid;
            root.state_bits = state_bits;
            root.created = created;
            root.modified = modified;
        }

        let mut buffer = vec![0u8; COPY_CHUNK];
        let mut pending: Vec<(u32, u32)> = self
            .directory
            .children(ROOT_SID)
            .into_iter()
            .rev()
            .map(|sid| (sid, ROOT_SID))
            .collect();
        while let Some((old, parent)) = pending.pop() {
            let Some(entry) = self.directory.get(old) else {
                continue;
            };
            let (name, object_type, size) = (entry.name.clone(), entry.object_type, entry.size);
            let (clsid, state_bits, created, modified) =
                (entry.clsid, entry.state_bits, entry.created, entry.modified);

            let new = fresh.directory.insert_units(parent, name, object_type)?;
            if let Some(copy) = fresh.directory.get_mut(new) {
                copy.clsid = clsid;
                copy.state_bits = state_bits;
                copy.created = created;
                copy.modified = modified;
            }

            match object_type {
                ObjectType::Stream => {
                    fresh.resize_stream(new, size)?;
                    let mut pos = 0u64;
                    while pos < size {
                        let n = self.read_sid(old, pos, &mut buffer)?;
                        if n == 0 {
                            break;
                        }
                        fresh.write_sid(new, pos, &buffer[..n])?;
                        pos += n as u64;
                    }
                },
                _ => {
                    for child in self.directory.children(old).into_iter().rev() {
                        pending.push((child, new));
                    }
                },
            }
        }

        fresh.dirty = true;
        fresh.write_out()?;
        Ok(fresh.into_inner().into_inner())
    }

    /// Rewrite the file without free sectors or unused directory slots.
    /// Uncommitted changes are part of the result.
    pub fn shrink(&mut self) -> Result<()> {
        self.check_writable()?;
        let before = (u64::from(self.store.physical_sectors()) + 1) * self.store.sector_size() as u64;
        let image = self.compacted_image()?;
        let root_token = self.root_token();

        self.store.overwrite(&image)?;
        self.reload()?;
        self.directory.root_mut().token = root_token;
        self.committed_tokens = self.directory.tokens();
        tracing::info!(before, after = image.len(), "compacted compound file");
        Ok(())
    }
}

/// Compact the compound file at `path` in place. Fails with
/// `SharingViolation` while another handle holds the file open.
pub fn shrink_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    lock(&file, path, false)?;
    let mut engine = Engine::open(file, StorageOptions::default())?;
    engine.shrink()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shrink_drops_deleted_data() {
        let mut engine = Engine::create(Cursor::new(Vec::new()), StorageOptions::default()).unwrap();
        let root = engine.root_token();
        let (keep, keep_token) = engine
            .create_child(ROOT_SID, root, "keep", ObjectType::Stream)
            .unwrap();
        let (gone, gone_token) = engine
            .create_child(ROOT_SID, root, "drop", ObjectType::Stream)
            .unwrap();
        engine.write_at(keep, keep_token, 0, &[1u8; 10_000]).unwrap();
        engine.write_at(gone, gone_token, 0, &[2u8; 50_000]).unwrap();
        engine.commit().unwrap();
        let full = engine.store.physical_sectors();

        engine.delete_child(ROOT_SID, root, "drop").unwrap();
        engine.shrink().unwrap();
        assert!(engine.store.physical_sectors() < full);
        assert_eq!(engine.root_token(), root);

        let (sid, token, _) = engine.resolve_path(&["keep"]).unwrap();
        let mut out = vec![0u8; 10_000];
        assert_eq!(engine.read_at(sid, token, 0, &mut out).unwrap(), 10_000);
        assert!(out.iter().all(|&b| b == 1));
        assert!(engine.resolve_path(&["drop"]).is_none());
    }
}
