//! Page constants and memory-mapped page views.
//!
//! The storage engine uses 4KB pages as the unit of allocation and mapping.
//! Pages are addressed by byte offset into the backing file; offset 0 is the
//! metadata page and doubles as the "no page" sentinel.

use memmap2::MmapMut;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Byte offset of a page (or of a field inside a page) in the backing file.
pub type PageOffset = u64;

/// Offset value meaning "no node". It is also the metadata page, which is
/// never a valid node.
pub const NULL_OFFSET: PageOffset = 0;

/// Start offset of the block containing `ofs`.
#[must_use]
pub const fn block_start(ofs: PageOffset) -> PageOffset {
    (ofs / PAGE_SIZE_U64) * PAGE_SIZE_U64
}

/// A mapped view of one whole page.
///
/// The view always covers the full 4096-byte block; `intra_offset` records
/// where inside the block the originally requested offset fell. All
/// multi-byte fields are little-endian.
pub struct MappedPage {
    map: MmapMut,
    block_start: PageOffset,
    intra_offset: usize,
}

impl MappedPage {
    pub(crate) const fn new(map: MmapMut, block_start: PageOffset, intra_offset: usize) -> Self {
        Self {
            map,
            block_start,
            intra_offset,
        }
    }

    /// File offset of the first byte of this page.
    #[must_use]
    pub const fn block_start(&self) -> PageOffset {
        self.block_start
    }

    /// Position of the requested offset inside this block.
    #[must_use]
    pub const fn intra_offset(&self) -> usize {
        self.intra_offset
    }

    /// Get the raw page data.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.map[..PAGE_SIZE]
    }

    /// Get mutable access to the raw page data.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map[..PAGE_SIZE]
    }

    /// Read bytes at a specific offset.
    #[must_use]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.map[offset..offset + len]
    }

    /// Write bytes at a specific offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Read a u8 at the given offset.
    #[must_use]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.map[offset]
    }

    /// Write a u8 at the given offset.
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.map[offset] = value;
    }

    /// Read a u16 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.map[offset], self.map[offset + 1]])
    }

    /// Write a u16 (little-endian) at the given offset.
    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.map[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u32 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[offset..offset + 4]);
        u32::from_le_bytes(buf)
    }

    /// Write a u32 (little-endian) at the given offset.
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Read a u64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_le_bytes(buf)
    }

    /// Write a u64 (little-endian) at the given offset.
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Read an i64 (little-endian) at the given offset.
    #[must_use]
    pub fn read_i64(&self, offset: usize) -> i64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        i64::from_le_bytes(buf)
    }

    /// Write an i64 (little-endian) at the given offset.
    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Compute the CRC32 of the first `len` bytes of the page.
    #[must_use]
    pub fn compute_checksum(&self, len: usize) -> u32 {
        crc32fast::hash(&self.map[..len])
    }

    /// Flush this page's dirty bytes to the backing file.
    pub fn flush(&self) -> std::io::Result<()> {
        self.map.flush()
    }
}

impl std::fmt::Debug for MappedPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedPage")
            .field("block_start", &self.block_start)
            .field("intra_offset", &self.intra_offset)
            .field("first_16_bytes", &&self.map[..16])
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Pager;
    use tempfile::tempdir;

    #[test]
    fn test_block_start() {
        assert_eq!(block_start(0), 0);
        assert_eq!(block_start(4095), 0);
        assert_eq!(block_start(4096), 4096);
        assert_eq!(block_start(4096 * 3 + 17), 4096 * 3);
    }

    #[test]
    fn test_page_read_write() {
        let dir = tempdir().expect("create temp dir");
        let pager = Pager::create(&dir.path().join("test.db")).expect("create pager");
        let ofs = pager.append_page().expect("append");
        let mut page = pager.map_page_from(ofs).expect("map");

        page.write_u8(0, 0xFF);
        assert_eq!(page.read_u8(0), 0xFF);

        page.write_u16(10, 0xBEEF);
        assert_eq!(page.read_u16(10), 0xBEEF);

        page.write_u32(100, 0x1234_5678);
        assert_eq!(page.read_u32(100), 0x1234_5678);

        page.write_u64(200, 0x0102_0304_0506_0708);
        assert_eq!(page.read_u64(200), 0x0102_0304_0506_0708);

        page.write_i64(300, -42);
        assert_eq!(page.read_i64(300), -42);

        page.write_bytes(500, b"hello");
        assert_eq!(page.read_bytes(500, 5), b"hello");
    }

    #[test]
    fn test_writes_visible_through_new_mapping() {
        let dir = tempdir().expect("create temp dir");
        let pager = Pager::create(&dir.path().join("test.db")).expect("create pager");
        let ofs = pager.append_page().expect("append");

        {
            let mut page = pager.map_page_from(ofs).expect("map");
            page.write_u64(8, 0xDEAD_BEEF_CAFE_BABE);
        }

        let page = pager.map_page_from(ofs + 8).expect("map again");
        assert_eq!(page.block_start(), ofs);
        assert_eq!(page.intra_offset(), 8);
        assert_eq!(page.read_u64(page.intra_offset()), 0xDEAD_BEEF_CAFE_BABE);
    }
}
