//! Page storage backends.
//!
//! `PageStore` is the minimal file-system abstraction the B+-tree depends
//! on (§1: "platform file-system abstractions beyond a minimal interface"
//! are a host collaborator — this trait is that minimal interface). Pages
//! are encrypted independently by the configured [`crypto::Cipher`] before
//! they hit disk, so each slot on disk reserves extra room for cipher
//! overhead (AES-GCM's 12-byte IV + 16-byte tag).
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crypto::Cipher;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Fixed slack reserved per on-disk slot beyond the logical page size, to
/// absorb the length prefix and worst-case AES-GCM frame overhead.
const SLOT_OVERHEAD: usize = 64;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("page {0} not found")]
    NotFound(u64),
    #[error("encoded page exceeds the configured page size")]
    TooLarge,
    #[error("page decryption failed: {0}")]
    Crypto(#[from] crypto::CryptoError),
}

/// Minimal storage abstraction a B+-tree needs: fixed-size addressable
/// pages, allocated monotonically, flushable on demand.
pub trait PageStore: Send {
    fn page_size(&self) -> usize;
    fn read_page(&self, id: u64) -> Result<Vec<u8>, PageError>;
    fn write_page(&mut self, id: u64, data: &[u8]) -> Result<(), PageError>;
    fn allocate_page(&mut self) -> Result<u64, PageError>;
    fn sync(&mut self) -> Result<(), PageError>;
}

/// A `PageStore` backed by a single on-disk file. Page `0` is reserved for
/// tree metadata (root page id, next free id); node pages start at `1`.
pub struct FilePageStore {
    file: File,
    page_size: usize,
    slot_size: usize,
    next_id: u64,
    cipher: Arc<Cipher>,
}

impl FilePageStore {
    /// Opens (creating if absent) a page file at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        cipher: Arc<Cipher>,
    ) -> Result<Self, PageError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let slot_size = page_size + SLOT_OVERHEAD;
        let len = file.metadata()?.len();
        let next_id = if slot_size > 0 { len / slot_size as u64 } else { 0 };
        Ok(Self {
            file,
            page_size,
            slot_size,
            next_id: next_id.max(1),
            cipher,
        })
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: u64) -> Result<Vec<u8>, PageError> {
        let mut file = self.file.try_clone()?;
        let offset = id * self.slot_size as u64;
        if offset + self.slot_size as u64 > file.metadata()?.len() {
            return Err(PageError::NotFound(id));
        }
        file.seek(SeekFrom::Start(offset))?;
        let len = file.read_u32::<LittleEndian>()? as usize;
        if len == 0 {
            return Err(PageError::NotFound(id));
        }
        let mut frame = vec![0u8; len];
        file.read_exact(&mut frame)?;
        Ok(self.cipher.decrypt(&frame)?)
    }

    fn write_page(&mut self, id: u64, data: &[u8]) -> Result<(), PageError> {
        let frame = self.cipher.encrypt(data)?;
        if frame.len() + 4 > self.slot_size {
            return Err(PageError::TooLarge);
        }
        let offset = id * self.slot_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_u32::<LittleEndian>(frame.len() as u32)?;
        self.file.write_all(&frame)?;
        let padding = self.slot_size - 4 - frame.len();
        if padding > 0 {
            self.file.write_all(&vec![0u8; padding])?;
        }
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<u64, PageError> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn sync(&mut self) -> Result<(), PageError> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// An in-memory `PageStore`, used by unit and property tests so B+-tree
/// logic can be exercised without touching the file system.
#[derive(Default)]
pub struct MemPageStore {
    page_size: usize,
    pages: HashMap<u64, Vec<u8>>,
    next_id: u64,
}

impl MemPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            pages: HashMap::new(),
            next_id: 1,
        }
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, id: u64) -> Result<Vec<u8>, PageError> {
        self.pages.get(&id).cloned().ok_or(PageError::NotFound(id))
    }

    fn write_page(&mut self, id: u64, data: &[u8]) -> Result<(), PageError> {
        if data.len() > self.page_size {
            return Err(PageError::TooLarge);
        }
        self.pages.insert(id, data.to_vec());
        Ok(())
    }

    fn allocate_page(&mut self) -> Result<u64, PageError> {
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn sync(&mut self) -> Result<(), PageError> {
        Ok(())
    }
}
