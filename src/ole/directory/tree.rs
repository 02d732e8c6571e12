//! Red-black sibling trees
//!
//! The children of a storage form a red-black tree threaded through the
//! `left`/`right` fields of their directory entries, rooted at the storage's
//! `child` field. Insertion and removal follow the classic algorithms with
//! parent links (kept in memory only). Removal relinks the successor node
//! instead of copying it, so the SID of every surviving entry is stable.

use super::entry::Color;
use super::name::compare_names;
use super::Directory;
use crate::common::{Error, Result};
use crate::ole::consts::NOSTREAM;
use std::cmp::Ordering;

impl Directory {
    fn color(&self, sid: u32) -> Color {
        if sid == NOSTREAM {
            Color::Black
        } else {
            self.entries[sid as usize].color
        }
    }

    fn set_color(&mut self, sid: u32, color: Color) {
        if sid != NOSTREAM {
            self.entries[sid as usize].color = color;
        }
    }

    fn left(&self, sid: u32) -> u32 {
        self.entries[sid as usize].left
    }

    fn right(&self, sid: u32) -> u32 {
        self.entries[sid as usize].right
    }

    fn parent(&self, sid: u32) -> u32 {
        self.entries[sid as usize].parent
    }

    fn set_parent(&mut self, sid: u32, parent: u32) {
        if sid != NOSTREAM {
            self.entries[sid as usize].parent = parent;
        }
    }

    /// Point whatever referenced `old` (a tree parent or the storage) at `new`
    fn replace_link(&mut self, storage: u32, parent: u32, old: u32, new: u32) {
        if parent == NOSTREAM {
            self.entries[storage as usize].child = new;
        } else if self.left(parent) == old {
            self.entries[parent as usize].left = new;
        } else {
            self.entries[parent as usize].right = new;
        }
    }

    fn rotate_left(&mut self, storage: u32, x: u32) {
        let y = self.right(x);
        let y_left = self.left(y);
        self.entries[x as usize].right = y_left;
        self.set_parent(y_left, x);
        let x_parent = self.parent(x);
        self.set_parent(y, x_parent);
        self.replace_link(storage, x_parent, x, y);
        self.entries[y as usize].left = x;
        self.set_parent(x, y);
    }

    fn rotate_right(&mut self, storage: u32, x: u32) {
        let y = self.left(x);
        let y_right = self.right(y);
        self.entries[x as usize].left = y_right;
        self.set_parent(y_right, x);
        let x_parent = self.parent(x);
        self.set_parent(y, x_parent);
        self.replace_link(storage, x_parent, x, y);
        self.entries[y as usize].right = x;
        self.set_parent(x, y);
    }

    fn minimum(&self, mut sid: u32) -> u32 {
        while self.left(sid) != NOSTREAM {
            sid = self.left(sid);
        }
        sid
    }

    /// Find the child of `storage` whose name compares equal to `name`.
    ///
    /// Trees written by other producers may not be ordered; a miss in such a
    /// tree falls back to scanning every sibling.
    pub(crate) fn find_in_tree(&self, storage: u32, name: &[u16]) -> Option<u32> {
        let mut current = self.entries.get(storage as usize)?.child;
        let mut steps = 0;
        while current != NOSTREAM && steps <= self.entries.len() {
            let entry = self.entries.get(current as usize)?;
            match compare_names(name, &entry.name) {
                Ordering::Less => current = entry.left,
                Ordering::Greater => current = entry.right,
                Ordering::Equal => return Some(current),
            }
            steps += 1;
        }
        if self.tree_is_ordered(storage) {
            return None;
        }
        self.tree_in_order(storage).into_iter().find(|&sid| {
            compare_names(name, &self.entries[sid as usize].name) == Ordering::Equal
        })
    }

    /// Link the prepared entry `node` into the tree of `storage`
    pub(crate) fn tree_insert(&mut self, storage: u32, node: u32) -> Result<()> {
        let mut parent = NOSTREAM;
        let mut current = self.entries[storage as usize].child;
        let mut went_left = false;
        while current != NOSTREAM {
            parent = current;
            match compare_names(
                &self.entries[node as usize].name,
                &self.entries[current as usize].name,
            ) {
                Ordering::Less => {
                    current = self.left(current);
                    went_left = true;
                },
                Ordering::Greater => {
                    current = self.right(current);
                    went_left = false;
                },
                Ordering::Equal => {
                    return Err(Error::Duplicate(self.entries[node as usize].name_string()));
                },
            }
        }

        let entry = &mut self.entries[node as usize];
        entry.parent = parent;
        entry.left = NOSTREAM;
        entry.right = NOSTREAM;
        entry.color = Color::Red;
        if parent == NOSTREAM {
            self.entries[storage as usize].child = node;
        } else if went_left {
            self.entries[parent as usize].left = node;
        } else {
            self.entries[parent as usize].right = node;
        }

        self.insert_fixup(storage, node);
        Ok(())
    }

    fn insert_fixup(&mut self, storage: u32, mut node: u32) {
        loop {
            let parent = self.parent(node);
            if parent == NOSTREAM || self.color(parent) == Color::Black {
                break;
            }
            let grandparent = self.parent(parent);
            if grandparent == NOSTREAM {
                break;
            }

            if parent == self.left(grandparent) {
                let uncle = self.right(grandparent);
                if self.color(uncle) == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    node = grandparent;
                } else {
                    let mut parent = parent;
                    if node == self.right(parent) {
                        node = parent;
                        self.rotate_left(storage, node);
                        parent = self.parent(node);
                    }
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_right(storage, grandparent);
                }
            } else {
                let uncle = self.left(grandparent);
                if self.color(uncle) == Color::Red {
                    self.set_color(parent, Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    node = grandparent;
                } else {
                    let mut parent = parent;
                    if node == self.left(parent) {
                        node = parent;
                        self.rotate_right(storage, node);
                        parent = self.parent(node);
                    }
                    self.set_color(parent, Color::Black);
                    self.set_color(grandparent, Color::Red);
                    self.rotate_left(storage, grandparent);
                }
            }
        }
        let root = self.entries[storage as usize].child;
        self.set_color(root, Color::Black);
    }

    /// Unlink `node` from the tree of `storage`
    pub(crate) fn tree_remove(&mut self, storage: u32, node: u32) {
        let node_left = self.left(node);
        let node_right = self.right(node);

        let x;
        let x_parent;
        let removed_color;
        if node_left != NOSTREAM && node_right != NOSTREAM {
            // Two children: the in-order successor takes the node's place
            let successor = self.minimum(node_right);
            x = self.right(successor);

            self.set_parent(node_left, successor);
            self.entries[successor as usize].left = node_left;
            if successor != node_right {
                x_parent = self.parent(successor);
                self.set_parent(x, x_parent);
                self.entries[x_parent as usize].left = x;
                self.entries[successor as usize].right = node_right;
                self.set_parent(node_right, successor);
            } else {
                x_parent = successor;
            }

            let node_parent = self.parent(node);
            self.replace_link(storage, node_parent, node, successor);
            self.set_parent(successor, node_parent);

            removed_color = self.color(successor);
            let node_color = self.color(node);
            self.set_color(successor, node_color);
        } else {
            x = if node_left == NOSTREAM {
                node_right
            } else {
                node_left
            };
            x_parent = self.parent(node);
            self.set_parent(x, x_parent);
            self.replace_link(storage, x_parent, node, x);
            removed_color = self.color(node);
        }

        let entry = &mut self.entries[node as usize];
        entry.left = NOSTREAM;
        entry.right = NOSTREAM;
        entry.parent = NOSTREAM;

        if removed_color == Color::Black {
            self.remove_fixup(storage, x, x_parent);
        }
    }

    fn remove_fixup(&mut self, storage: u32, mut x: u32, mut x_parent: u32) {
        while x != self.entries[storage as usize].child && self.color(x) == Color::Black {
            if x_parent == NOSTREAM {
                break;
            }
            if x == self.left(x_parent) {
                let mut sibling = self.right(x_parent);
                if self.color(sibling) == Color::Red {
                    self.set_color(sibling, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_left(storage, x_parent);
                    sibling = self.right(x_parent);
                }
                if sibling == NOSTREAM {
                    x = x_parent;
                    x_parent = self.parent(x);
                    continue;
                }
                if self.color(self.left(sibling)) == Color::Black
                    && self.color(self.right(sibling)) == Color::Black
                {
                    self.set_color(sibling, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.right(sibling)) == Color::Black {
                        let sibling_left = self.left(sibling);
                        self.set_color(sibling_left, Color::Black);
                        self.set_color(sibling, Color::Red);
                        self.rotate_right(storage, sibling);
                        sibling = self.right(x_parent);
                    }
                    let parent_color = self.color(x_parent);
                    self.set_color(sibling, parent_color);
                    self.set_color(x_parent, Color::Black);
                    let sibling_right = self.right(sibling);
                    self.set_color(sibling_right, Color::Black);
                    self.rotate_left(storage, x_parent);
                    break;
                }
            } else {
                let mut sibling = self.left(x_parent);
                if self.color(sibling) == Color::Red {
                    self.set_color(sibling, Color::Black);
                    self.set_color(x_parent, Color::Red);
                    self.rotate_right(storage, x_parent);
                    sibling = self.left(x_parent);
                }
                if sibling == NOSTREAM {
                    x = x_parent;
                    x_parent = self.parent(x);
                    continue;
                }
                if self.color(self.right(sibling)) == Color::Black
                    && self.color(self.left(sibling)) == Color::Black
                {
                    self.set_color(sibling, Color::Red);
                    x = x_parent;
                    x_parent = self.parent(x);
                } else {
                    if self.color(self.left(sibling)) == Color::Black {
                        let sibling_right = self.right(sibling);
                        self.set_color(sibling_right, Color::Black);
                        self.set_color(sibling, Color::Red);
                        self.rotate_left(storage, sibling);
                        sibling = self.left(x_parent);
                    }
                    let parent_color = self.color(x_parent);
                    self.set_color(sibling, parent_color);
                    self.set_color(x_parent, Color::Black);
                    let sibling_left = self.left(sibling);
                    self.set_color(sibling_left, Color::Black);
                    self.rotate_right(storage, x_parent);
                    break;
                }
            }
        }
        self.set_color(x, Color::Black);
        let root = self.entries[storage as usize].child;
        self.set_color(root, Color::Black);
    }

    /// Children of `storage` in sibling (name) order
    pub(crate) fn tree_in_order(&self, storage: u32) -> Vec<u32> {
        let mut result = Vec::new();
        let mut stack = Vec::new();
        let mut current = self.entries[storage as usize].child;
        while current != NOSTREAM || !stack.is_empty() {
            while current != NOSTREAM {
                stack.push(current);
                current = self.left(current);
            }
            if let Some(sid) = stack.pop() {
                result.push(sid);
                current = self.right(sid);
            }
        }
        result
    }

    /// Whether an in-order walk of `storage`'s tree visits names in sibling order
    fn tree_is_ordered(&self, storage: u32) -> bool {
        self.tree_in_order(storage).windows(2).all(|pair| {
            compare_names(
                &self.entries[pair[0] as usize].name,
                &self.entries[pair[1] as usize].name,
            ) == Ordering::Less
        })
    }

    /// Check ordering, red-red and black-height rules for the tree of `storage`
    pub(crate) fn tree_is_valid(&self, storage: u32) -> bool {
        if !self.tree_is_ordered(storage) {
            return false;
        }

        let root = self.entries[storage as usize].child;
        if self.color(root) == Color::Red {
            return false;
        }

        // Walk every root-to-leaf path, counting black nodes
        let mut black_height = None;
        let mut stack = vec![(root, 0usize)];
        while let Some((sid, blacks)) = stack.pop() {
            if sid == NOSTREAM {
                match black_height {
                    None => black_height = Some(blacks),
                    Some(height) if height != blacks => return false,
                    Some(_) => {},
                }
                continue;
            }
            let color = self.color(sid);
            if color == Color::Red
                && (self.color(self.left(sid)) == Color::Red
                    || self.color(self.right(sid)) == Color::Red)
            {
                return false;
            }
            let blacks = blacks + usize::from(color == Color::Black);
            stack.push((self.left(sid), blacks));
            stack.push((self.right(sid), blacks));
        }
        true
    }

    /// Rebuild the tree of `storage` as a balanced, correctly colored tree
    pub(crate) fn tree_rebuild(&mut self, storage: u32) -> Result<()> {
        let mut members = self.tree_in_order(storage);
        members.sort_by(|&a, &b| {
            compare_names(&self.entries[a as usize].name, &self.entries[b as usize].name)
        });
        if let Some(pair) = members.windows(2).find(|pair| {
            compare_names(
                &self.entries[pair[0] as usize].name,
                &self.entries[pair[1] as usize].name,
            ) == Ordering::Equal
        }) {
            return Err(Error::CorruptedFile(format!(
                "Storage holds two entries named {:?}",
                self.entries[pair[1] as usize].name_string()
            )));
        }

        // Nodes on the deepest, partially filled level are red
        let red_depth = if members.is_empty() {
            0
        } else {
            members.len().ilog2() as usize
        };
        let root = self.build_balanced(&members, NOSTREAM, 0, red_depth);
        self.entries[storage as usize].child = root;
        Ok(())
    }

    fn build_balanced(&mut self, members: &[u32], parent: u32, depth: usize, red_depth: usize) -> u32 {
        if members.is_empty() {
            return NOSTREAM;
        }
        let mid = members.len() / 2;
        let node = members[mid];
        let left = self.build_balanced(&members[..mid], node, depth + 1, red_depth);
        let right = self.build_balanced(&members[mid + 1..], node, depth + 1, red_depth);

        let entry = &mut self.entries[node as usize];
        entry.left = left;
        entry.right = right;
        entry.parent = parent;
        entry.color = if depth > 0 && depth == red_depth {
            Color::Red
        } else {
            Color::Black
        };
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ole::consts::NOSTREAM;
    use crate::ole::directory::entry::{DirEntry, ObjectType};
    use proptest::prelude::*;

    fn insert(dir: &mut Directory, name: &str) -> u32 {
        let sid = dir.entries.len() as u32;
        dir.entries.push(DirEntry::new(
            name.encode_utf16().collect(),
            ObjectType::Stream,
            sid as u64 + 1,
        ));
        dir.tree_insert(0, sid).unwrap();
        sid
    }

    fn names(dir: &Directory) -> Vec<String> {
        dir.tree_in_order(0)
            .into_iter()
            .map(|sid| dir.entries[sid as usize].name_string())
            .collect()
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut dir = Directory::new();
        for name in ["delta", "a", "Charlie", "bb", "echo", "B2"] {
            insert(&mut dir, name);
            assert!(dir.tree_is_valid(0));
        }
        assert_eq!(names(&dir), vec!["a", "B2", "bb", "echo", "delta", "Charlie"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut dir = Directory::new();
        insert(&mut dir, "Stream");
        dir.entries.push(DirEntry::new(
            "STREAM".encode_utf16().collect(),
            ObjectType::Stream,
            99,
        ));
        assert!(matches!(dir.tree_insert(0, 2), Err(Error::Duplicate(_))));
    }

    #[test]
    fn test_remove_keeps_sids() {
        let mut dir = Directory::new();
        let sids: Vec<u32> = (0..20).map(|i| insert(&mut dir, &format!("s{:02}", i))).collect();
        for &sid in sids.iter().step_by(3) {
            dir.tree_remove(0, sid);
            assert!(dir.tree_is_valid(0));
        }
        let remaining = dir.tree_in_order(0);
        assert_eq!(remaining.len(), 13);
        for sid in remaining {
            let name = dir.entries[sid as usize].name_string();
            assert_eq!(name, format!("s{:02}", sid - 1));
        }
    }

    #[test]
    fn test_rebuild_degenerate_tree() {
        let mut dir = Directory::new();
        // A right-leaning chain, all black: ordered but unbalanced
        for i in 0..7u32 {
            let mut entry = DirEntry::new(
                format!("n{}", i).encode_utf16().collect(),
                ObjectType::Stream,
                u64::from(i) + 1,
            );
            entry.color = Color::Black;
            entry.right = if i < 6 { i + 2 } else { NOSTREAM };
            dir.entries.push(entry);
        }
        dir.entries[0].child = 1;
        assert!(!dir.tree_is_valid(0));

        dir.tree_rebuild(0).unwrap();
        assert!(dir.tree_is_valid(0));
        assert_eq!(dir.tree_in_order(0).len(), 7);
        let root = dir.entries[0].child;
        assert_eq!(dir.entries[root as usize].name_string(), "n3");
    }

    #[test]
    fn test_find_in_misordered_tree() {
        let mut dir = Directory::new();
        // "AA" at the top with "B" to its right: lexicographic, not sibling order
        for (i, name) in ["AA", "B"].into_iter().enumerate() {
            let mut entry = DirEntry::new(name.encode_utf16().collect(), ObjectType::Stream, i as u64 + 2);
            entry.color = Color::Black;
            dir.entries.push(entry);
        }
        dir.entries[0].child = 1;
        dir.entries[1].right = 2;
        dir.entries[2].parent = 1;
        assert!(!dir.tree_is_valid(0));

        assert_eq!(dir.find(0, "aa"), Some(1));
        assert_eq!(dir.find(0, "B"), Some(2));
        assert_eq!(dir.find(0, "C"), None);
        assert!(matches!(
            dir.insert(0, "b", ObjectType::Stream),
            Err(Error::Duplicate(_))
        ));

        dir.insert(0, "C", ObjectType::Stream).unwrap();
        assert!(dir.tree_is_valid(0));
        assert_eq!(names(&dir), vec!["B", "C", "AA"]);
    }

    proptest! {
        #[test]
        fn prop_random_insert_remove(ops in prop::collection::vec((0u8..40, any::<bool>()), 1..120)) {
            let mut dir = Directory::new();
            let mut live: std::collections::BTreeMap<u8, u32> = Default::default();
            for (key, add) in ops {
                let name = format!("k{}", key);
                if add {
                    if !live.contains_key(&key) {
                        let sid = insert(&mut dir, &name);
                        live.insert(key, sid);
                    }
                } else if let Some(sid) = live.remove(&key) {
                    dir.tree_remove(0, sid);
                }
                prop_assert!(dir.tree_is_valid(0));
                prop_assert_eq!(dir.tree_in_order(0).len(), live.len());
            }
        }
    }
}
