//! Page allocation and mapping over a single backing file.
//!
//! Page 0 is the metadata page:
//!
//! - bytes 0-3: page count (u32)
//! - bytes 4-11: root page offset (u64, 0 = empty tree)
//! - bytes 16-23: magic number
//! - bytes 24-27: format version
//! - remainder reserved
//!
//! The page count and the root offset are only ever changed through
//! compare-and-swap, so allocation and root publication are lock-free from
//! the caller's point of view: a lost race is reported and the caller
//! retries. The swap itself is a narrowly-scoped lock over the mapped
//! metadata page.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;
use parking_lot::Mutex;

use crate::storage::page::{MappedPage, PAGE_SIZE, PAGE_SIZE_U64, PageOffset, block_start};

/// Magic number identifying a tdb file: "TDBPAGER"
pub const MAGIC: [u8; 8] = *b"TDBPAGER";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Upper bound on lost allocation races before giving up. Hitting it means
/// the page count is not moving forward, i.e. the metadata is corrupt.
const MAX_APPEND_ATTEMPTS: u32 = 1 << 16;

/// Metadata page field offsets.
mod offsets {
    pub const PAGE_COUNT: usize = 0;
    pub const ROOT_OFFSET: usize = 4;
    pub const MAGIC: usize = 16;
    pub const FORMAT_VERSION: usize = 24;
}

/// Owner of the backing file.
///
/// A `Pager` is `Sync`; share it between threads behind an `Arc`.
pub struct Pager {
    path: PathBuf,
    file: File,
    meta: Mutex<MappedPage>,
    extend_lock: Mutex<()>,
}

impl Pager {
    /// Size of every page in bytes.
    #[must_use]
    pub const fn block_size() -> usize {
        PAGE_SIZE
    }

    /// Create a new file at `path` holding only the metadata page.
    ///
    /// Returns an error if the file already exists.
    pub fn create(path: &Path) -> Result<Self, PagerError> {
        if path.exists() {
            return Err(PagerError::AlreadyExists(path.to_path_buf()));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(PagerError::Io)?;

        let mut block = [0u8; PAGE_SIZE];
        block[offsets::PAGE_COUNT..offsets::PAGE_COUNT + 4].copy_from_slice(&1u32.to_le_bytes());
        block[offsets::ROOT_OFFSET..offsets::ROOT_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
        block[offsets::MAGIC..offsets::MAGIC + 8].copy_from_slice(&MAGIC);
        block[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());

        file.write_all(&block).map_err(PagerError::Io)?;
        file.sync_all().map_err(PagerError::Io)?;

        tracing::info!("created page file {}", path.display());
        Self::from_file(path, file)
    }

    /// Open an existing file and validate its metadata page.
    pub fn open(path: &Path) -> Result<Self, PagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(PagerError::Io)?;

        let pager = Self::from_file(path, file)?;
        pager.validate_metadata()?;

        tracing::info!(
            "opened page file {} (pages={}, root={})",
            path.display(),
            pager.page_count(),
            pager.root_ofs()
        );
        Ok(pager)
    }

    /// Open an existing file or create a new one if it doesn't exist.
    pub fn open_or_create(path: &Path) -> Result<Self, PagerError> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    fn from_file(path: &Path, file: File) -> Result<Self, PagerError> {
        let file_len = file.metadata().map_err(PagerError::Io)?.len();
        if file_len < PAGE_SIZE_U64 {
            return Err(PagerError::Truncated {
                file_len,
                required: PAGE_SIZE_U64,
            });
        }

        let meta = map_block(&file, 0)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            meta: Mutex::new(MappedPage::new(meta, 0, 0)),
            extend_lock: Mutex::new(()),
        })
    }

    fn validate_metadata(&self) -> Result<(), PagerError> {
        let meta = self.meta.lock();

        let mut magic = [0u8; 8];
        magic.copy_from_slice(meta.read_bytes(offsets::MAGIC, 8));
        if magic != MAGIC {
            return Err(PagerError::InvalidMagic(magic));
        }

        let version = meta.read_u32(offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(PagerError::UnsupportedVersion(version));
        }

        let page_count = meta.read_u32(offsets::PAGE_COUNT);
        if page_count == 0 {
            return Err(PagerError::InvalidPageCount(page_count));
        }

        let required = u64::from(page_count) * PAGE_SIZE_U64;
        let file_len = self.file.metadata().map_err(PagerError::Io)?.len();
        if file_len < required {
            return Err(PagerError::Truncated { file_len, required });
        }

        let root = meta.read_u64(offsets::ROOT_OFFSET);
        if root % PAGE_SIZE_U64 != 0 || root >= required {
            return Err(PagerError::InvalidRoot(root));
        }

        Ok(())
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start offset of the block containing `ofs`.
    #[must_use]
    pub const fn block_start_from(&self, ofs: PageOffset) -> PageOffset {
        block_start(ofs)
    }

    /// Map the whole block containing `ofs`.
    ///
    /// The returned view's `intra_offset()` is `ofs - block_start`. Offsets
    /// past the last allocated page are rejected rather than mapped.
    pub fn map_page_from(&self, ofs: PageOffset) -> Result<MappedPage, PagerError> {
        let start = block_start(ofs);
        let page_count = self.page_count();
        if start >= u64::from(page_count) * PAGE_SIZE_U64 {
            return Err(PagerError::OutOfRange { ofs, page_count });
        }
        let map = map_block(&self.file, start)?;
        #[allow(clippy::cast_possible_truncation)] // always < PAGE_SIZE
        let intra = (ofs - start) as usize;
        Ok(MappedPage::new(map, start, intra))
    }

    /// Reserve a fresh page at the end of the file and return its offset.
    ///
    /// Reads the page count, grows the file to cover one more page, then
    /// tries to swap the count forward. A lost swap means another writer
    /// took that page; the loop re-reads and tries the next one. Growing the
    /// file more than once is harmless because only the winning swap's count
    /// is authoritative.
    pub fn append_page(&self) -> Result<PageOffset, PagerError> {
        for attempt in 0..MAX_APPEND_ATTEMPTS {
            let count = self.page_count();
            let next = count.checked_add(1).ok_or(PagerError::PageCountOverflow)?;
            self.ensure_len(u64::from(next) * PAGE_SIZE_U64)?;

            if self.compare_and_swap_page_count(count, next) {
                let ofs = u64::from(count) * PAGE_SIZE_U64;
                tracing::trace!("allocated page at offset {ofs}");
                return Ok(ofs);
            }

            tracing::trace!("lost page allocation race (attempt {attempt})");
        }

        tracing::warn!("page allocation retries exhausted for {}", self.path.display());
        Err(PagerError::RetriesExhausted {
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    /// Number of allocated pages, including the metadata page.
    #[must_use]
    pub fn page_count(&self) -> u32 {
        self.meta.lock().read_u32(offsets::PAGE_COUNT)
    }

    /// Offset of the current root node, or 0 for an empty tree.
    #[must_use]
    pub fn root_ofs(&self) -> PageOffset {
        self.meta.lock().read_u64(offsets::ROOT_OFFSET)
    }

    /// Swap the root offset from `expected` to `new`.
    ///
    /// Returns `false` without writing if the stored root is no longer
    /// `expected`.
    pub fn set_root_ofs(&self, expected: PageOffset, new: PageOffset) -> bool {
        let mut meta = self.meta.lock();
        if meta.read_u64(offsets::ROOT_OFFSET) != expected {
            return false;
        }
        meta.write_u64(offsets::ROOT_OFFSET, new);
        true
    }

    /// Flush the metadata page and all file data to durable storage.
    pub fn sync(&self) -> Result<(), PagerError> {
        self.meta.lock().flush().map_err(PagerError::Io)?;
        self.file.sync_all().map_err(PagerError::Io)
    }

    fn compare_and_swap_page_count(&self, expected: u32, new: u32) -> bool {
        let mut meta = self.meta.lock();
        if meta.read_u32(offsets::PAGE_COUNT) != expected {
            return false;
        }
        meta.write_u32(offsets::PAGE_COUNT, new);
        true
    }

    /// Grow the file to at least `len` bytes. Never shrinks it, so a stale
    /// page count can't truncate pages another writer already owns.
    fn ensure_len(&self, len: u64) -> Result<(), PagerError> {
        let _guard = self.extend_lock.lock();
        let current = self.file.metadata().map_err(PagerError::Io)?.len();
        if current < len {
            self.file.set_len(len).map_err(PagerError::Io)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_count", &self.page_count())
            .field("root_ofs", &self.root_ofs())
            .finish_non_exhaustive()
    }
}

#[allow(unsafe_code)]
fn map_block(file: &File, start: PageOffset) -> Result<memmap2::MmapMut, PagerError> {
    // SAFETY: the mapping is shared and file-backed. Pages are appended and
    // never truncated (`ensure_len` only grows the file), so the mapped range
    // stays valid for the life of the mapping. Concurrent writers only write
    // pages they allocated themselves; published pages are read-only.
    unsafe {
        MmapOptions::new()
            .offset(start)
            .len(PAGE_SIZE)
            .map_mut(file)
            .map_err(PagerError::Io)
    }
}

/// Errors that can occur during pager operations.
#[derive(Debug)]
pub enum PagerError {
    /// I/O error (file extend, mmap, fsync).
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(PathBuf),
    /// The file does not start with the expected magic number.
    InvalidMagic([u8; 8]),
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Stored page count is not usable.
    InvalidPageCount(u32),
    /// File is shorter than its metadata claims.
    Truncated { file_len: u64, required: u64 },
    /// Stored root offset is misaligned or past the allocated pages.
    InvalidRoot(PageOffset),
    /// Requested offset lies past the last allocated page.
    OutOfRange { ofs: PageOffset, page_count: u32 },
    /// The u32 page count cannot grow further.
    PageCountOverflow,
    /// Allocation kept losing its compare-and-swap.
    RetriesExhausted { attempts: u32 },
}

impl std::fmt::Display for PagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::InvalidMagic(m) => write!(f, "invalid magic number: {m:02x?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageCount(n) => write!(f, "invalid page count: {n}"),
            Self::Truncated { file_len, required } => {
                write!(f, "file truncated: {file_len} bytes, need {required}")
            }
            Self::InvalidRoot(ofs) => write!(f, "invalid root offset: {ofs}"),
            Self::OutOfRange { ofs, page_count } => {
                write!(f, "offset {ofs} is past the last of {page_count} pages")
            }
            Self::PageCountOverflow => write!(f, "page count overflow"),
            Self::RetriesExhausted { attempts } => {
                write!(f, "page allocation failed after {attempts} attempts")
            }
        }
    }
}

impl std::error::Error for PagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}
