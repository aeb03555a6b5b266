//! # B+-tree (C3)
//!
//! A disk-resident ordered `key -> bytes` map used both as the primary
//! sorted index over flushed LSM data and as the backing store for every
//! secondary index. See [`tree::BPlusTree`] for the public contract and
//! [`page_store`] for the storage abstraction it is built on.

mod node;
mod page_store;
mod tree;

pub use node::Node;
pub use page_store::{FilePageStore, MemPageStore, PageError, PageStore};
pub use tree::{BPlusTree, BTreeError};

/// Default page size (§3: "framed into fixed pages (default 4 KiB)").
pub const DEFAULT_PAGE_SIZE: usize = 4096;
