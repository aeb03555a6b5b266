//! B+-tree (C3): ordered on-disk `key -> bytes` map with range scans.
//!
//! Interior nodes hold `n` separator keys and `n + 1` child pointers; leaves
//! are linked left-to-right so [`BPlusTree::scan`] never has to touch an
//! interior node once it reaches the first leaf in range. Splits happen when
//! a node's encoded size would exceed the page size; merges/borrows happen
//! when a node's encoded size drops below half that.

use crate::node::Node;
use crate::page_store::{PageError, PageStore};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BTreeError {
    #[error("page error: {0}")]
    Page(#[from] PageError),
    #[error("metadata page is corrupt")]
    CorruptMeta,
}

const META_PAGE: u64 = 0;
const META_MAGIC: u32 = 0x4254_5245;

/// An ordered on-disk map, backed by any [`PageStore`].
pub struct BPlusTree {
    store: Box<dyn PageStore>,
    root: u64,
}

impl BPlusTree {
    /// Opens an existing tree or initializes a fresh empty one.
    pub fn open(mut store: Box<dyn PageStore>) -> Result<Self, BTreeError> {
        match store.read_page(META_PAGE) {
            Ok(buf) => {
                let mut cur = Cursor::new(&buf);
                let magic = cur.read_u32::<LittleEndian>().map_err(|_| BTreeError::CorruptMeta)?;
                if magic != META_MAGIC {
                    return Err(BTreeError::CorruptMeta);
                }
                let root = cur.read_u64::<LittleEndian>().map_err(|_| BTreeError::CorruptMeta)?;
                Ok(Self { store, root })
            }
            Err(PageError::NotFound(_)) => {
                let root = store.allocate_page()?;
                store.write_page(root, &Node::new_leaf().encode())?;
                Self::persist_meta(&mut *store, root)?;
                Ok(Self { store, root })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist_meta(store: &mut dyn PageStore, root: u64) -> Result<(), BTreeError> {
        let mut buf = Vec::with_capacity(12);
        buf.write_u32::<LittleEndian>(META_MAGIC).unwrap();
        buf.write_u64::<LittleEndian>(root).unwrap();
        store.write_page(META_PAGE, &buf)?;
        Ok(())
    }

    fn load(&self, id: u64) -> Result<Node, BTreeError> {
        let buf = self.store.read_page(id)?;
        Node::decode(&buf).map_err(|_| BTreeError::CorruptMeta)
    }

    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    /// Point lookup.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BTreeError> {
        let mut id = self.root;
        loop {
            match self.load(id)? {
                Node::Leaf { entries, .. } => {
                    return Ok(entries
                        .binary_search_by(|(k, _)| k.as_slice().cmp(key))
                        .ok()
                        .map(|i| entries[i].1.clone()));
                }
                Node::Interior { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    id = children[idx];
                }
            }
        }
    }

    /// Inserts or overwrites `key -> value`.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), BTreeError> {
        if let Some((sep, right_id)) = self.put_recursive(self.root, key, value)? {
            let new_root = self.store.allocate_page()?;
            let node = Node::Interior {
                keys: vec![sep],
                children: vec![self.root, right_id],
            };
            self.store.write_page(new_root, &node.encode())?;
            self.root = new_root;
            Self::persist_meta(&mut *self.store, self.root)?;
        }
        Ok(())
    }

    fn put_recursive(
        &mut self,
        node_id: u64,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<(Vec<u8>, u64)>, BTreeError> {
        let node = self.load(node_id)?;
        match node {
            Node::Leaf { mut entries, next } => {
                match entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                    Ok(i) => entries[i].1 = value.to_vec(),
                    Err(i) => entries.insert(i, (key.to_vec(), value.to_vec())),
                }
                let candidate = Node::Leaf { entries, next };
                if candidate.encode().len() <= self.page_size() {
                    self.store.write_page(node_id, &candidate.encode())?;
                    return Ok(None);
                }
                let Node::Leaf { mut entries, next } = candidate else {
                    unreachable!()
                };
                let mid = entries.len() / 2;
                let right_entries = entries.split_off(mid);
                let right_id = self.store.allocate_page()?;
                let sep = right_entries[0].0.clone();
                let left = Node::Leaf {
                    entries,
                    next: Some(right_id),
                };
                let right = Node::Leaf {
                    entries: right_entries,
                    next,
                };
                self.store.write_page(node_id, &left.encode())?;
                self.store.write_page(right_id, &right.encode())?;
                Ok(Some((sep, right_id)))
            }
            Node::Interior { mut keys, mut children } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key);
                let child_id = children[idx];
                let split = self.put_recursive(child_id, key, value)?;
                let Some((sep, new_child)) = split else {
                    return Ok(None);
                };
                keys.insert(idx, sep);
                children.insert(idx + 1, new_child);
                let candidate = Node::Interior {
                    keys: keys.clone(),
                    children: children.clone(),
                };
                if candidate.encode().len() <= self.page_size() {
                    self.store.write_page(node_id, &candidate.encode())?;
                    return Ok(None);
                }
                let mid = keys.len() / 2;
                let up_key = keys[mid].clone();
                let right_keys = keys.split_off(mid + 1);
                keys.pop();
                let right_children = children.split_off(mid + 1);
                let right_id = self.store.allocate_page()?;
                let left = Node::Interior { keys, children };
                let right = Node::Interior {
                    keys: right_keys,
                    children: right_children,
                };
                self.store.write_page(node_id, &left.encode())?;
                self.store.write_page(right_id, &right.encode())?;
                Ok(Some((up_key, right_id)))
            }
        }
    }

    /// Removes `key`, if present. Absent keys are a no-op (idempotent).
    pub fn delete(&mut self, key: &[u8]) -> Result<(), BTreeError> {
        self.delete_recursive(self.root, key)?;
        // Collapse a root interior node that lost all its separators.
        if let Node::Interior { keys, children } = self.load(self.root)? {
            if keys.is_empty() && children.len() == 1 {
                self.root = children[0];
                Self::persist_meta(&mut *self.store, self.root)?;
            }
        }
        Ok(())
    }

    fn is_underflow(&self, node: &Node) -> bool {
        node.encode().len() < self.page_size() / 2
    }

    fn delete_recursive(&mut self, node_id: u64, key: &[u8]) -> Result<bool, BTreeError> {
        match self.load(node_id)? {
            Node::Leaf { mut entries, next } => {
                if let Ok(i) = entries.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
                    entries.remove(i);
                }
                let node = Node::Leaf { entries, next };
                let underflow = self.is_underflow(&node);
                self.store.write_page(node_id, &node.encode())?;
                Ok(underflow)
            }
            Node::Interior { mut keys, mut children } => {
                let idx = keys.partition_point(|k| k.as_slice() <= key);
                let child_underflow = self.delete_recursive(children[idx], key)?;
                if child_underflow {
                    self.fix_underflow(&mut keys, &mut children, idx)?;
                }
                let node = Node::Interior {
                    keys: keys.clone(),
                    children: children.clone(),
                };
                let underflow = keys.len() > 0 && self.is_underflow(&node);
                self.store.write_page(node_id, &node.encode())?;
                Ok(underflow)
            }
        }
    }

    /// Attempts to fix underflow in `children[idx]` by borrowing a sibling
    /// entry, or merging with a sibling if neither side has spare capacity.
    fn fix_underflow(
        &mut self,
        keys: &mut Vec<Vec<u8>>,
        children: &mut Vec<u64>,
        idx: usize,
    ) -> Result<(), BTreeError> {
        if idx > 0 {
            let left = self.load(children[idx - 1])?;
            if self.has_spare_capacity(&left) {
                return self.borrow_from_left(keys, children, idx, left);
            }
        }
        if idx + 1 < children.len() {
            let right = self.load(children[idx + 1])?;
            if self.has_spare_capacity(&right) {
                return self.borrow_from_right(keys, children, idx, right);
            }
        }
        if idx > 0 {
            self.merge_with_left(keys, children, idx)
        } else {
            self.merge_with_left(keys, children, idx + 1)
        }
    }

    fn has_spare_capacity(&self, node: &Node) -> bool {
        !self.is_underflow(node) && min_entry_count(node) > 1
    }

    fn borrow_from_left(
        &mut self,
        keys: &mut [Vec<u8>],
        children: &[u64],
        idx: usize,
        left: Node,
    ) -> Result<(), BTreeError> {
        let right_id = children[idx];
        match (left, self.load(right_id)?) {
            (Node::Leaf { mut entries, next: left_next }, Node::Leaf { entries: mut rentries, next: rnext }) => {
                let moved = entries.pop().unwrap();
                rentries.insert(0, moved);
                keys[idx - 1] = rentries[0].0.clone();
                self.store
                    .write_page(children[idx - 1], &Node::Leaf { entries, next: left_next }.encode())?;
                self.store
                    .write_page(right_id, &Node::Leaf { entries: rentries, next: rnext }.encode())?;
                Ok(())
            }
            (Node::Interior { mut keys: lk, mut children: lc }, Node::Interior { keys: mut rk, children: mut rc }) => {
                let moved_child = lc.pop().unwrap();
                let moved_key = lk.pop().unwrap();
                rk.insert(0, keys[idx - 1].clone());
                rc.insert(0, moved_child);
                keys[idx - 1] = moved_key;
                self.store
                    .write_page(children[idx - 1], &Node::Interior { keys: lk, children: lc }.encode())?;
                self.store
                    .write_page(right_id, &Node::Interior { keys: rk, children: rc }.encode())?;
                Ok(())
            }
            _ => unreachable!("siblings at the same level always share node kind"),
        }
    }

    fn borrow_from_right(
        &mut self,
        keys: &mut [Vec<u8>],
        children: &[u64],
        idx: usize,
        right: Node,
    ) -> Result<(), BTreeError> {
        let left_id = children[idx];
        match (self.load(left_id)?, right) {
            (Node::Leaf { mut entries, next: _ }, Node::Leaf { entries: mut rentries, next: rnext }) => {
                let moved = rentries.remove(0);
                keys[idx] = rentries.first().map(|(k, _)| k.clone()).unwrap_or_else(|| moved.0.clone());
                entries.push(moved);
                self.store
                    .write_page(left_id, &Node::Leaf { entries, next: Some(children[idx + 1]) }.encode())?;
                self.store
                    .write_page(children[idx + 1], &Node::Leaf { entries: rentries, next: rnext }.encode())?;
                Ok(())
            }
            (Node::Interior { mut keys: lk, mut children: lc }, Node::Interior { keys: mut rk, children: mut rc }) => {
                let moved_child = rc.remove(0);
                let moved_key = rk.remove(0);
                lk.push(keys[idx].clone());
                lc.push(moved_child);
                keys[idx] = moved_key;
                self.store
                    .write_page(left_id, &Node::Interior { keys: lk, children: lc }.encode())?;
                self.store
                    .write_page(children[idx + 1], &Node::Interior { keys: rk, children: rc }.encode())?;
                Ok(())
            }
            _ => unreachable!("siblings at the same level always share node kind"),
        }
    }

    /// Merges `children[merge_idx]` into `children[merge_idx - 1]`, removing
    /// the separator `keys[merge_idx - 1]` and the now-empty child slot.
    fn merge_with_left(
        &mut self,
        keys: &mut Vec<Vec<u8>>,
        children: &mut Vec<u64>,
        merge_idx: usize,
    ) -> Result<(), BTreeError> {
        let left_id = children[merge_idx - 1];
        let right_id = children[merge_idx];
        let separator = keys.remove(merge_idx - 1);
        children.remove(merge_idx);
        match (self.load(left_id)?, self.load(right_id)?) {
            (Node::Leaf { mut entries, .. }, Node::Leaf { entries: rentries, next: rnext }) => {
                entries.extend(rentries);
                self.store
                    .write_page(left_id, &Node::Leaf { entries, next: rnext }.encode())?;
            }
            (Node::Interior { mut keys: lk, mut children: lc }, Node::Interior { keys: rk, children: rc }) => {
                lk.push(separator);
                lk.extend(rk);
                lc.extend(rc);
                self.store
                    .write_page(left_id, &Node::Interior { keys: lk, children: lc }.encode())?;
            }
            _ => unreachable!("siblings at the same level always share node kind"),
        }
        Ok(())
    }

    /// Range scan `[start, end)` (start inclusive, end exclusive; either
    /// bound may be omitted). `callback` returns `true` to keep scanning.
    pub fn scan<F>(&self, start: Option<&[u8]>, end: Option<&[u8]>, mut callback: F) -> Result<(), BTreeError>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let mut leaf_id = match start {
            Some(k) => self.find_leaf_for(k)?,
            None => self.leftmost_leaf()?,
        };
        loop {
            let Node::Leaf { entries, next } = self.load(leaf_id)? else {
                unreachable!("leaf chain must only contain leaves")
            };
            for (k, v) in &entries {
                if let Some(s) = start {
                    if k.as_slice() < s {
                        continue;
                    }
                }
                if let Some(e) = end {
                    if k.as_slice() >= e {
                        return Ok(());
                    }
                }
                if !callback(k, v) {
                    return Ok(());
                }
            }
            match next {
                Some(n) => leaf_id = n,
                None => return Ok(()),
            }
        }
    }

    fn find_leaf_for(&self, key: &[u8]) -> Result<u64, BTreeError> {
        let mut id = self.root;
        loop {
            match self.load(id)? {
                Node::Leaf { .. } => return Ok(id),
                Node::Interior { keys, children } => {
                    let idx = keys.partition_point(|k| k.as_slice() <= key);
                    id = children[idx];
                }
            }
        }
    }

    fn leftmost_leaf(&self) -> Result<u64, BTreeError> {
        let mut id = self.root;
        loop {
            match self.load(id)? {
                Node::Leaf { .. } => return Ok(id),
                Node::Interior { children, .. } => id = children[0],
            }
        }
    }

    /// Drops every entry, leaving a single empty root leaf.
    pub fn clear(&mut self) -> Result<(), BTreeError> {
        let root = self.store.allocate_page()?;
        self.store.write_page(root, &Node::new_leaf().encode())?;
        self.root = root;
        Self::persist_meta(&mut *self.store, self.root)?;
        Ok(())
    }

    /// Flushes all pending pages to the underlying store.
    pub fn close(&mut self) -> Result<(), BTreeError> {
        self.store.sync()?;
        Ok(())
    }
}

fn min_entry_count(node: &Node) -> usize {
    match node {
        Node::Leaf { entries, .. } => entries.len(),
        Node::Interior { children, .. } => children.len(),
    }
}
