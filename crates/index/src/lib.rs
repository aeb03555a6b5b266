//! # Secondary index manager (C9)
//!
//! Maintains one [`btree::BPlusTree`] per `(collection, field)` secondary
//! index, each opened at `<base>/indexes/<collection>_<field>/` (§6). Posting
//! keys are [`value::Value::encode_key`]'s canonical byte encoding so that a
//! B+-tree range scan over posting keys walks values in their natural order
//! (§4.9).
//!
//! The manager has no knowledge of the document store itself — `create_index`
//! takes an iterator of `(doc_id, field_value)` pairs supplied by the caller
//! (the storage engine, which alone knows how to scan `<collection>:`
//! prefixes) rather than reaching back into storage itself. This keeps the
//! dependency arrow pointing one way, same as `txn`'s `StorageBackend` trait.

mod postings;

use btree::{BPlusTree, FilePageStore};
use crypto::Cipher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use value::Value;

/// Errors raised by index creation, maintenance, and lookup.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("no index on {collection}.{field}")]
    Missing { collection: String, field: String },
    #[error("index already exists on {collection}.{field}")]
    AlreadyExists { collection: String, field: String },
    #[error("corrupt posting list for key in {collection}.{field}")]
    CorruptPostings { collection: String, field: String },
    #[error(transparent)]
    BTree(#[from] btree::BTreeError),
    #[error(transparent)]
    Page(#[from] btree::PageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type IndexKey = (String, String);

/// Owns every open secondary index for one database.
pub struct IndexManager {
    base_dir: PathBuf,
    page_size: usize,
    cipher: Arc<Cipher>,
    trees: Mutex<HashMap<IndexKey, BPlusTree>>,
}

impl IndexManager {
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, page_size: usize, cipher: Arc<Cipher>) -> Self {
        IndexManager {
            base_dir: base_dir.into(),
            page_size,
            cipher,
            trees: Mutex::new(HashMap::new()),
        }
    }

    fn index_dir(&self, collection: &str, field: &str) -> PathBuf {
        self.base_dir
            .join("indexes")
            .join(format!("{collection}_{field}"))
    }

    fn index_file(dir: &Path) -> PathBuf {
        dir.join("tree.db")
    }

    /// Returns whether an index exists on `(collection, field)`.
    #[must_use]
    pub fn has_index(&self, collection: &str, field: &str) -> bool {
        self.trees
            .lock()
            .contains_key(&(collection.to_string(), field.to_string()))
    }

    /// Allocates a dedicated B+-tree for `(collection, field)` and populates
    /// it from `existing_docs` — `(doc_id, field_value)` pairs the caller has
    /// already extracted by scanning `<collection>:` keys (§4.9: "then
    /// populates it by scanning all existing keys... and extracting
    /// `field`" — the scan itself is the caller's job; a real back-fill
    /// here, not the no-op the original source took per the open question
    /// this resolves).
    #[tracing::instrument(skip(self, existing_docs), fields(collection, field))]
    pub fn create_index<'a>(
        &self,
        collection: &str,
        field: &str,
        existing_docs: impl IntoIterator<Item = (&'a str, &'a Value)>,
    ) -> Result<(), IndexError> {
        let key = (collection.to_string(), field.to_string());
        if self.trees.lock().contains_key(&key) {
            return Err(IndexError::AlreadyExists {
                collection: collection.to_string(),
                field: field.to_string(),
            });
        }

        let dir = self.index_dir(collection, field);
        std::fs::create_dir_all(&dir)?;
        let store = FilePageStore::open(Self::index_file(&dir), self.page_size, self.cipher.clone())?;
        let mut tree = BPlusTree::open(Box::new(store))?;

        let mut backfilled = 0usize;
        for (doc_id, value) in existing_docs {
            Self::append_posting(&mut tree, value, doc_id)?;
            backfilled += 1;
        }
        tracing::debug!(collection, field, backfilled, "index created");

        self.trees.lock().insert(key, tree);
        Ok(())
    }

    /// Closes and removes the on-disk B+-tree backing `(collection, field)`.
    #[tracing::instrument(skip(self), fields(collection, field))]
    pub fn drop_index(&self, collection: &str, field: &str) -> Result<(), IndexError> {
        let key = (collection.to_string(), field.to_string());
        if let Some(mut tree) = self.trees.lock().remove(&key) {
            tree.close()?;
        }
        let dir = self.index_dir(collection, field);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        tracing::debug!(collection, field, "index dropped");
        Ok(())
    }

    /// Per-document hook: adds `doc_id` to the posting for every index
    /// defined on `collection`.
    #[tracing::instrument(level = "trace", skip(self, doc), fields(collection, doc_id))]
    pub fn on_insert(&self, collection: &str, doc_id: &str, doc: &Value) -> Result<(), IndexError> {
        let mut guard = self.trees.lock();
        for ((coll, field), tree) in guard.iter_mut() {
            if coll != collection {
                continue;
            }
            let value = field_value(doc, field);
            Self::append_posting(tree, &value, doc_id)?;
        }
        Ok(())
    }

    /// Per-document hook: for every index on `collection` whose field value
    /// changed between `old` and `new`, moves `doc_id` from the old posting
    /// to the new one.
    #[tracing::instrument(level = "trace", skip(self, old, new), fields(collection, doc_id))]
    pub fn on_update(
        &self,
        collection: &str,
        doc_id: &str,
        old: &Value,
        new: &Value,
    ) -> Result<(), IndexError> {
        let mut guard = self.trees.lock();
        for ((coll, field), tree) in guard.iter_mut() {
            if coll != collection {
                continue;
            }
            let old_value = field_value(old, field);
            let new_value = field_value(new, field);
            if old_value == new_value {
                continue;
            }
            Self::remove_posting(tree, &old_value, doc_id)?;
            Self::append_posting(tree, &new_value, doc_id)?;
        }
        Ok(())
    }

    /// Per-document hook: removes `doc_id` from every index on `collection`.
    #[tracing::instrument(level = "trace", skip(self, doc), fields(collection, doc_id))]
    pub fn on_delete(&self, collection: &str, doc_id: &str, doc: &Value) -> Result<(), IndexError> {
        let mut guard = self.trees.lock();
        for ((coll, field), tree) in guard.iter_mut() {
            if coll != collection {
                continue;
            }
            let value = field_value(doc, field);
            Self::remove_posting(tree, &value, doc_id)?;
        }
        Ok(())
    }

    /// Equality lookup: document IDs whose indexed field equals `value`.
    pub fn find_equals(&self, collection: &str, field: &str, value: &Value) -> Result<Vec<String>, IndexError> {
        let mut guard = self.trees.lock();
        let tree = Self::tree_mut(&mut guard, collection, field)?;
        match tree.get(&value.encode_key())? {
            Some(bytes) => postings::decode(&bytes).ok_or_else(|| IndexError::CorruptPostings {
                collection: collection.to_string(),
                field: field.to_string(),
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Range lookup over an indexed field, unioning and deduplicating every
    /// posting whose encoded value falls in `[start, end]` per the
    /// inclusivity flags (§4.9).
    pub fn find_range(
        &self,
        collection: &str,
        field: &str,
        start: Option<&Value>,
        end: Option<&Value>,
        inc_start: bool,
        inc_end: bool,
    ) -> Result<Vec<String>, IndexError> {
        let mut guard = self.trees.lock();
        let tree = Self::tree_mut(&mut guard, collection, field)?;

        let start_bytes = start.map(Value::encode_key);
        let end_bytes = end.map(|v| {
            let mut bytes = v.encode_key();
            if inc_end {
                // The tree's scan end bound is exclusive; appending a byte
                // pushes the bound just past the exact encoded value so an
                // exact match is still included.
                bytes.push(0);
            }
            bytes
        });

        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        let mut decode_err = false;

        tree.scan(start_bytes.as_deref(), end_bytes.as_deref(), |key, posting| {
            if !inc_start {
                if let Some(sb) = &start_bytes {
                    if key == sb.as_slice() {
                        return true;
                    }
                }
            }
            match postings::decode(posting) {
                Some(list) => {
                    for id in list {
                        if seen.insert(id.clone()) {
                            ids.push(id);
                        }
                    }
                    true
                }
                None => {
                    decode_err = true;
                    false
                }
            }
        })?;

        if decode_err {
            return Err(IndexError::CorruptPostings {
                collection: collection.to_string(),
                field: field.to_string(),
            });
        }
        Ok(ids)
    }

    fn tree_mut<'a>(
        guard: &'a mut HashMap<IndexKey, BPlusTree>,
        collection: &str,
        field: &str,
    ) -> Result<&'a mut BPlusTree, IndexError> {
        guard
            .get_mut(&(collection.to_string(), field.to_string()))
            .ok_or_else(|| IndexError::Missing {
                collection: collection.to_string(),
                field: field.to_string(),
            })
    }

    fn append_posting(tree: &mut BPlusTree, value: &Value, doc_id: &str) -> Result<(), IndexError> {
        let key = value.encode_key();
        let mut ids = tree
            .get(&key)?
            .and_then(|b| postings::decode(&b))
            .unwrap_or_default();
        if !ids.iter().any(|id| id == doc_id) {
            ids.push(doc_id.to_string());
            tree.put(&key, &postings::encode(&ids))?;
        }
        Ok(())
    }

    fn remove_posting(tree: &mut BPlusTree, value: &Value, doc_id: &str) -> Result<(), IndexError> {
        let key = value.encode_key();
        let Some(bytes) = tree.get(&key)? else {
            return Ok(());
        };
        let mut ids = postings::decode(&bytes).unwrap_or_default();
        ids.retain(|id| id != doc_id);
        if ids.is_empty() {
            tree.delete(&key)?;
        } else {
            tree.put(&key, &postings::encode(&ids))?;
        }
        Ok(())
    }
}

/// Extracts `doc[field]`, or `Value::Null` if `doc` isn't a map or lacks the
/// field — matching `on_insert`/`on_update`'s implicit "absent field sorts
/// with nulls" behavior.
fn field_value(doc: &Value, field: &str) -> Value {
    match doc {
        Value::Map(fields) => fields.get(field).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
