//! Directory
//!
//! The directory stream is an array of 128-byte entries. Entry 0 is the root
//! storage; the children of every storage form a red-black tree rooted at the
//! storage's `child` field.
//!
//! The whole directory is held in memory and rewritten on commit. Slots freed
//! by deletion are reused, lowest index first.

pub(crate) mod entry;
pub(crate) mod name;
mod tree;

use crate::common::{Error, Result};
use crate::ole::config::Version;
use crate::ole::consts::*;
use entry::{DirEntry, ObjectType};
use fixedbitset::FixedBitSet;
use name::validate_name;

pub use entry::{Entry, EntryKind};

/// SID of the root entry
pub(crate) const ROOT_SID: u32 = 0;

/// In-memory directory
#[derive(Debug, Clone)]
pub(crate) struct Directory {
    entries: Vec<DirEntry>,
    /// Next identity handed to a newly created object
    next_token: u64,
}

impl Directory {
    /// Directory of a new, empty file
    pub fn new() -> Self {
        Self {
            entries: vec![DirEntry::root(1)],
            next_token: 2,
        }
    }

    /// Parse the directory stream.
    ///
    /// Entries not reachable from the root are treated as unused; references
    /// outside the directory, cycles and misplaced root entries are rejected.
    /// Tokens are assigned starting at `first_token`.
    pub fn load(bytes: &[u8], version: Version, first_token: u64) -> Result<Self> {
        let mut next_token = first_token;
        let mut entries = Vec::with_capacity(bytes.len() / DIRENTRY_SIZE);
        let mut unparsable = FixedBitSet::with_capacity(bytes.len() / DIRENTRY_SIZE);
        for (sid, record) in bytes.chunks_exact(DIRENTRY_SIZE).enumerate() {
            match DirEntry::parse(record, version, next_token) {
                Ok(entry) => entries.push(entry),
                // Only fatal once the record turns out to be reachable
                Err(_) if sid > 0 => {
                    unparsable.insert(sid);
                    entries.push(DirEntry::empty(next_token));
                },
                Err(e) => return Err(e),
            }
            next_token += 1;
        }

        match entries.first() {
            Some(root) if root.object_type == ObjectType::Root => {},
            _ => {
                return Err(Error::InvalidFormat(
                    "First directory entry is not the root storage".to_string(),
                ));
            },
        }

        let mut directory = Self {
            entries,
            next_token,
        };
        directory.link_and_validate(&unparsable)?;
        Ok(directory)
    }

    /// Walk every sibling tree from the root, fill in parent links and
    /// reset unreachable slots
    fn link_and_validate(&mut self, unparsable: &FixedBitSet) -> Result<()> {
        let count = self.entries.len();
        let mut visited = FixedBitSet::with_capacity(count);
        visited.insert(ROOT_SID as usize);

        let mut storages = vec![ROOT_SID];
        while let Some(storage) = storages.pop() {
            let mut nodes = vec![(self.entries[storage as usize].child, NOSTREAM)];
            while let Some((sid, parent)) = nodes.pop() {
                if sid == NOSTREAM {
                    continue;
                }
                if sid as usize >= count {
                    return Err(Error::CorruptedFile(format!(
                        "Directory entry {} references SID {} beyond {} entries",
                        parent, sid, count
                    )));
                }
                if visited.put(sid as usize) {
                    return Err(Error::CorruptedFile(format!(
                        "Directory entry {} is reachable twice",
                        sid
                    )));
                }
                if unparsable.contains(sid as usize) {
                    return Err(Error::CorruptedFile(format!(
                        "Directory entry {} has an unknown object type",
                        sid
                    )));
                }

                let entry = &mut self.entries[sid as usize];
                match entry.object_type {
                    ObjectType::Storage => storages.push(sid),
                    ObjectType::Stream => {},
                    ObjectType::Empty | ObjectType::Root => {
                        return Err(Error::CorruptedFile(format!(
                            "Directory entry {} in storage {} is not a storage or stream",
                            sid, storage
                        )));
                    },
                }
                entry.parent = parent;
                nodes.push((entry.left, sid));
                nodes.push((entry.right, sid));
            }
        }

        let mut unreachable = 0usize;
        for (sid, entry) in self.entries.iter_mut().enumerate().skip(1) {
            if visited.contains(sid) {
                continue;
            }
            if entry.object_type != ObjectType::Empty {
                unreachable += 1;
            }
            *entry = DirEntry::empty(entry.token);
        }
        if unreachable > 0 {
            tracing::debug!(unreachable, "ignoring unreachable directory entries");
        }
        Ok(())
    }

    /// Serialize into whole sectors, padding with unused entries
    pub fn to_bytes(&self, version: Version, sector_size: usize) -> Vec<u8> {
        let used = self
            .entries
            .iter()
            .rposition(|entry| entry.object_type != ObjectType::Empty)
            .map_or(1, |pos| pos + 1);
        let per_sector = sector_size / DIRENTRY_SIZE;
        let slots = used.div_ceil(per_sector) * per_sector;

        let mut bytes = vec![0u8; slots * DIRENTRY_SIZE];
        let padding = DirEntry::empty(0);
        for (i, record) in bytes.chunks_exact_mut(DIRENTRY_SIZE).enumerate() {
            self.entries
                .get(i)
                .unwrap_or(&padding)
                .write_to(record, version);
        }
        bytes
    }

    /// Number of slots (used or not)
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, sid: u32) -> Option<&DirEntry> {
        self.entries.get(sid as usize)
    }

    pub fn get_mut(&mut self, sid: u32) -> Option<&mut DirEntry> {
        self.entries.get_mut(sid as usize)
    }

    pub fn root(&self) -> &DirEntry {
        &self.entries[ROOT_SID as usize]
    }

    pub fn root_mut(&mut self) -> &mut DirEntry {
        &mut self.entries[ROOT_SID as usize]
    }

    /// Look up a live entry through a handle's SID and token
    pub fn resolve(&self, sid: u32, token: u64) -> Result<&DirEntry> {
        match self.entries.get(sid as usize) {
            Some(entry) if entry.token == token && entry.object_type != ObjectType::Empty => {
                Ok(entry)
            },
            _ => Err(Error::NotFound(format!(
                "Entry {} no longer exists",
                sid
            ))),
        }
    }

    /// Find a child of `storage` by name
    pub fn find(&self, storage: u32, name: &str) -> Option<u32> {
        let units: Vec<u16> = name.encode_utf16().collect();
        self.find_in_tree(storage, &units)
    }

    /// Make sure the tree of `storage` can be mutated safely, rebuilding it
    /// when it breaks the red-black rules
    pub fn ensure_valid_tree(&mut self, storage: u32) -> Result<()> {
        if !self.tree_is_valid(storage) {
            tracing::warn!(
                storage,
                name = %self.entries[storage as usize].name_string(),
                "rebuilding malformed sibling tree"
            );
            self.tree_rebuild(storage)?;
        }
        Ok(())
    }

    fn fresh_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    /// Create a new child of `storage`. Fails without side effects on a bad
    /// or duplicate name.
    pub fn insert(&mut self, storage: u32, name: &str, object_type: ObjectType) -> Result<u32> {
        let units = validate_name(name)?;
        self.insert_units(storage, units, object_type)
    }

    /// Create a new child from a name already known to be acceptable
    pub fn insert_units(
        &mut self,
        storage: u32,
        units: Vec<u16>,
        object_type: ObjectType,
    ) -> Result<u32> {
        if self.find_in_tree(storage, &units).is_some() {
            return Err(Error::Duplicate(String::from_utf16_lossy(&units)));
        }
        if self.entries.len() > MAXREGSID as usize {
            return Err(Error::Capacity("Directory is full".to_string()));
        }
        self.ensure_valid_tree(storage)?;

        let token = self.fresh_token();
        let entry = DirEntry::new(units, object_type, token);
        let sid = match self
            .entries
            .iter()
            .skip(1)
            .position(|e| e.object_type == ObjectType::Empty)
        {
            Some(offset) => {
                let sid = offset as u32 + 1;
                self.entries[sid as usize] = entry;
                sid
            },
            None => {
                self.entries.push(entry);
                (self.entries.len() - 1) as u32
            },
        };
        self.tree_insert(storage, sid)?;
        Ok(sid)
    }

    /// Remove `sid` from the tree of `storage` and free its slot
    pub fn remove(&mut self, storage: u32, sid: u32) -> Result<()> {
        self.ensure_valid_tree(storage)?;
        self.tree_remove(storage, sid);
        let token = self.fresh_token();
        self.entries[sid as usize] = DirEntry::empty(token);
        Ok(())
    }

    /// Free a slot that is not linked into any live tree
    pub fn release(&mut self, sid: u32) {
        let token = self.fresh_token();
        self.entries[sid as usize] = DirEntry::empty(token);
    }

    /// Rename `sid` within `storage`, keeping its SID
    pub fn rename(&mut self, storage: u32, sid: u32, new_name: &str) -> Result<()> {
        let units = validate_name(new_name)?;
        if let Some(existing) = self.find_in_tree(storage, &units)
            && existing != sid
        {
            return Err(Error::Duplicate(new_name.to_string()));
        }
        self.ensure_valid_tree(storage)?;
        self.tree_remove(storage, sid);
        self.entries[sid as usize].name = units;
        self.tree_insert(storage, sid)
    }

    /// Children of `storage` in sibling order
    pub fn children(&self, storage: u32) -> Vec<u32> {
        self.tree_in_order(storage)
    }

    /// Every entry below `storage`, in pre-order
    pub fn descendants(&self, storage: u32) -> Vec<u32> {
        let mut result = Vec::new();
        let mut stack: Vec<u32> = self.children(storage).into_iter().rev().collect();
        while let Some(sid) = stack.pop() {
            result.push(sid);
            if self.entries[sid as usize].object_type.is_container() {
                stack.extend(self.children(sid).into_iter().rev());
            }
        }
        result
    }

    /// Storage that holds `sid` in its tree
    pub fn owner(&self, sid: u32) -> Option<u32> {
        let mut top = sid;
        let mut steps = 0;
        while self.entries.get(top as usize)?.parent != NOSTREAM {
            top = self.entries[top as usize].parent;
            steps += 1;
            if steps > self.entries.len() {
                return None;
            }
        }
        self.entries
            .iter()
            .position(|e| e.object_type.is_container() && e.child == top)
            .map(|pos| pos as u32)
    }

    /// Names of the storages from the root down to `sid`, root excluded
    pub fn path_of(&self, sid: u32) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = sid;
        while current != ROOT_SID {
            let Some(entry) = self.entries.get(current as usize) else {
                break;
            };
            path.push(entry.name_string());
            match self.owner(current) {
                Some(owner) => current = owner,
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Identity of every slot, used to revive handles after a revert
    pub fn tokens(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.token).collect()
    }

    /// Restore slot identities saved by [`Directory::tokens`]
    pub fn restore_tokens(&mut self, tokens: &[u64]) {
        for (entry, &token) in self.entries.iter_mut().zip(tokens) {
            entry.token = token;
        }
        let highest = tokens.iter().copied().max().unwrap_or(0);
        self.next_token = self.next_token.max(highest + 1);
    }

    /// Next token this directory will hand out
    pub fn next_token(&self) -> u64 {
        self.next_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_directory_round_trip() {
        let mut dir = Directory::new();
        let storage = dir.insert(ROOT_SID, "Storage", ObjectType::Storage).unwrap();
        dir.insert(storage, "Inner", ObjectType::Stream).unwrap();
        dir.insert(ROOT_SID, "Stream", ObjectType::Stream).unwrap();

        let bytes = dir.to_bytes(Version::V3, 512);
        assert_eq!(bytes.len(), 512);

        let loaded = Directory::load(&bytes, Version::V3, 100).unwrap();
        assert_eq!(loaded.find(ROOT_SID, "stream"), Some(3));
        let storage = loaded.find(ROOT_SID, "STORAGE").unwrap();
        assert_eq!(loaded.find(storage, "Inner"), Some(2));
        assert_eq!(loaded.path_of(2), vec!["Storage", "Inner"]);
        assert_eq!(loaded.descendants(ROOT_SID), vec![3, 1, 2]);
    }

    #[test]
    fn test_slot_reuse_and_tokens() {
        let mut dir = Directory::new();
        let a = dir.insert(ROOT_SID, "a", ObjectType::Stream).unwrap();
        let b = dir.insert(ROOT_SID, "b", ObjectType::Stream).unwrap();
        let token_a = dir.get(a).unwrap().token;

        dir.remove(ROOT_SID, a).unwrap();
        assert!(dir.resolve(a, token_a).is_err());
        let c = dir.insert(ROOT_SID, "c", ObjectType::Stream).unwrap();
        assert_eq!(c, a);
        assert!(dir.resolve(c, token_a).is_err());
        assert!(dir.resolve(b, dir.get(b).unwrap().token).is_ok());
    }

    #[test]
    fn test_insert_errors_have_no_side_effects() {
        let mut dir = Directory::new();
        dir.insert(ROOT_SID, "Data", ObjectType::Stream).unwrap();
        let before = dir.len();
        assert!(matches!(
            dir.insert(ROOT_SID, "DATA", ObjectType::Stream),
            Err(Error::Duplicate(_))
        ));
        assert!(matches!(
            dir.insert(ROOT_SID, "a:b", ObjectType::Stream),
            Err(Error::InvalidName(_))
        ));
        assert_eq!(dir.len(), before);
    }

    #[test]
    fn test_rename() {
        let mut dir = Directory::new();
        let a = dir.insert(ROOT_SID, "alpha", ObjectType::Stream).unwrap();
        dir.insert(ROOT_SID, "beta", ObjectType::Stream).unwrap();
        assert!(matches!(
            dir.rename(ROOT_SID, a, "BETA"),
            Err(Error::Duplicate(_))
        ));
        dir.rename(ROOT_SID, a, "ALPHA").unwrap();
        dir.rename(ROOT_SID, a, "z").unwrap();
        assert_eq!(dir.find(ROOT_SID, "z"), Some(a));
        assert_eq!(dir.find(ROOT_SID, "alpha"), None);
        assert!(dir.tree_is_valid(ROOT_SID));
    }

    #[test]
    fn test_rejects_cycle() {
        let mut dir = Directory::new();
        let a = dir.insert(ROOT_SID, "a", ObjectType::Stream).unwrap();
        dir.get_mut(a).unwrap().left = a;
        let bytes = dir.to_bytes(Version::V3, 512);
        assert!(matches!(
            Directory::load(&bytes, Version::V3, 1),
            Err(Error::CorruptedFile(_))
        ));
    }

    #[test]
    fn test_rejects_dangling_sid() {
        let mut dir = Directory::new();
        let a = dir.insert(ROOT_SID, "a", ObjectType::Stream).unwrap();
        dir.get_mut(a).unwrap().right = 40;
        let bytes = dir.to_bytes(Version::V3, 512);
        assert!(matches!(
            Directory::load(&bytes, Version::V3, 1),
            Err(Error::CorruptedFile(_))
        ));
    }

    #[test]
    fn test_unreachable_entries_become_empty() {
        let mut dir = Directory::new();
        let a = dir.insert(ROOT_SID, "a", ObjectType::Stream).unwrap();
        let b = dir.insert(ROOT_SID, "b", ObjectType::Stream).unwrap();
        // Detach "b" without clearing its slot
        dir.tree_remove(ROOT_SID, b);
        let bytes = dir.to_bytes(Version::V3, 512);

        let loaded = Directory::load(&bytes, Version::V3, 1).unwrap();
        assert_eq!(loaded.get(b).unwrap().object_type, ObjectType::Empty);
        assert_eq!(loaded.find(ROOT_SID, "a"), Some(a));
    }
}
