//! Flash persistence: the board-storage seam, the image header and the
//! append-only flash memory manager.
//!
//! The partition holds, page-aligned from the base: the header, then the
//! frozen class/method/clause tables, the constant heap and the
//! special-token list, each serialized with explicit little-endian layouts
//! (interior pointers become offsets rebased to the flash image). The
//! header is stamped last, after every root region is committed, which
//! makes a freeze atomic-by-redo: a power cut before the header write
//! leaves the image invalid and the next boot re-erases.

use microclr_asm::{StartupFlags, Token};

use crate::consts::*;
use crate::error::EngineFault;

use thiserror::Error;
use tracing::{debug, warn};

/// Flash-manager failure modes. `OutOfSpace` is recoverable (reported to
/// the host as an out-of-memory Nack); the others poison the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    /// The reserved extent cannot hold the requested allocation.
    #[error("out of flash memory")]
    OutOfSpace,
    /// The board driver rejected a write.
    #[error("error writing flash")]
    WriteFailed,
    /// A write was attempted outside the reserved extent.
    #[error("flash memory address out of bounds")]
    OutOfBounds,
}

impl From<FlashError> for EngineFault {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::OutOfSpace => EngineFault::FlashCorruption("out of flash memory"),
            FlashError::WriteFailed => EngineFault::FlashCorruption("error writing flash"),
            FlashError::OutOfBounds => EngineFault::FlashCorruption("write out of bounds"),
        }
    }
}

/// Board-support seam for the flash partition. The engine reads through the
/// memory-mapped view and writes through the driver.
pub trait FlashStorage {
    /// Partition size in bytes.
    fn len(&self) -> usize;
    /// Erase-page size in bytes.
    fn page_size(&self) -> usize;
    /// The memory-mapped read view of the partition.
    fn mapped(&self) -> &[u8];
    /// Write `data` at `offset`. Returns false on driver failure.
    fn write(&mut self, offset: usize, data: &[u8]) -> bool;
    /// Erase the whole partition.
    fn erase_all(&mut self) -> bool;
}

/// An in-RAM flash simulator, for tests and the host-side simulator build.
#[derive(Debug, Clone)]
pub struct SimFlashStorage {
    data: Vec<u8>,
    page_size: usize,
}

impl SimFlashStorage {
    /// A simulated partition of `len` bytes with `page_size` erase pages.
    pub fn new(len: usize, page_size: usize) -> Self {
        Self {
            data: vec![0xff; len],
            page_size,
        }
    }
}

impl Default for SimFlashStorage {
    fn default() -> Self {
        Self::new(256 * 1024, 4096)
    }
}

impl FlashStorage for SimFlashStorage {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn mapped(&self) -> &[u8] {
        &self.data
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> bool {
        if offset + data.len() > self.data.len() {
            return false;
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        true
    }

    fn erase_all(&mut self) -> bool {
        self.data.fill(0xff);
        true
    }
}

/// Offsets of the frozen root regions inside the flash image. Zero means
/// the region is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageRoots {
    /// Frozen class descriptors.
    pub classes: u32,
    /// Frozen method descriptors.
    pub methods: u32,
    /// Constant heap bytes.
    pub constants: u32,
    /// Exception-clause table.
    pub clauses: u32,
    /// String heap; shares the constant heap region on this engine.
    pub string_heap: u32,
    /// Special-token registry.
    pub special_tokens: u32,
}

/// The parsed flash image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashHeader {
    /// Host-assigned program version.
    pub data_version: u32,
    /// Host-assigned program hash.
    pub data_hash: u32,
    /// Root-region offsets.
    pub roots: ImageRoots,
    /// First free byte past the used region.
    pub end_of_heap: u32,
    /// Method token seeded on boot when auto-start is set.
    pub startup_token: Token,
    /// Startup behavior bits.
    pub startup_flags: StartupFlags,
    /// Reserved size of the static variable vector.
    pub static_vector_size: u32,
    /// Build fingerprint of the firmware that wrote the image.
    pub build_timestamp: [u8; FLASH_TIMESTAMP_LEN],
}

/// Serialized header length.
const HEADER_LEN: usize = 52 + FLASH_TIMESTAMP_LEN;

/// The current firmware's build fingerprint, padded to the header field.
pub fn build_fingerprint() -> [u8; FLASH_TIMESTAMP_LEN] {
    let mut out = [0u8; FLASH_TIMESTAMP_LEN];
    let stamp = BUILD_TIMESTAMP.as_bytes();
    let n = stamp.len().min(FLASH_TIMESTAMP_LEN);
    out[..n].copy_from_slice(&stamp[..n]);
    out
}

impl FlashHeader {
    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(&FLASH_IMAGE_IDENTIFIER.to_le_bytes());
        out.extend_from_slice(&self.data_version.to_le_bytes());
        out.extend_from_slice(&self.data_hash.to_le_bytes());
        out.extend_from_slice(&self.roots.classes.to_le_bytes());
        out.extend_from_slice(&self.roots.methods.to_le_bytes());
        out.extend_from_slice(&self.roots.constants.to_le_bytes());
        out.extend_from_slice(&self.roots.clauses.to_le_bytes());
        out.extend_from_slice(&self.roots.string_heap.to_le_bytes());
        out.extend_from_slice(&self.end_of_heap.to_le_bytes());
        out.extend_from_slice(&self.roots.special_tokens.to_le_bytes());
        out.extend_from_slice(&self.startup_token.to_le_bytes());
        out.extend_from_slice(&self.startup_flags.bits().to_le_bytes());
        out.extend_from_slice(&self.static_vector_size.to_le_bytes());
        out.extend_from_slice(&self.build_timestamp);
        out
    }

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        if word(0) != FLASH_IMAGE_IDENTIFIER {
            return None;
        }
        let mut build_timestamp = [0u8; FLASH_TIMESTAMP_LEN];
        build_timestamp.copy_from_slice(&data[52..52 + FLASH_TIMESTAMP_LEN]);
        Some(Self {
            data_version: word(4),
            data_hash: word(8),
            roots: ImageRoots {
                classes: word(12),
                methods: word(16),
                constants: word(20),
                clauses: word(24),
                string_heap: word(28),
                special_tokens: word(36),
            },
            end_of_heap: word(32),
            startup_token: word(40),
            startup_flags: StartupFlags::from_bits_truncate(word(44)),
            static_vector_size: word(48),
            build_timestamp,
        })
    }
}

/// Cursor over the memory-mapped image used to decode frozen tables.
#[derive(Debug, Clone, Copy)]
pub struct ImageReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    /// A reader positioned at `offset` of the mapped image.
    pub const fn new(data: &'a [u8], offset: usize) -> Self {
        Self { data, pos: offset }
    }

    /// Current position inside the image.
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EngineFault> {
        let bytes = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(EngineFault::FlashCorruption("image truncated"))?;
        self.pos += n;
        Ok(bytes)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, EngineFault> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, EngineFault> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, EngineFault> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], EngineFault> {
        self.take(n)
    }
}

/// Page-aligned allocator into flash with the pinned-roots header.
#[derive(Debug)]
pub struct FlashMemoryManager<F> {
    storage: F,
    end_of_heap: usize,
    header: Option<FlashHeader>,
    flash_clear: bool,
}

impl<F: FlashStorage> FlashMemoryManager<F> {
    /// Map the partition and validate any existing header.
    pub fn new(storage: F) -> Self {
        let mut manager = Self {
            end_of_heap: storage.page_size(),
            header: None,
            flash_clear: false,
            storage,
        };
        manager.init_header();
        manager
    }

    fn init_header(&mut self) -> bool {
        self.end_of_heap = self.storage.page_size();
        self.header = None;
        let Some(header) = FlashHeader::parse(self.storage.mapped()) else {
            return false;
        };
        if header.data_version == 0 || header.data_version == u32::MAX {
            return false;
        }
        if header.build_timestamp != build_fingerprint() {
            // A firmware rebuild invalidates every stored image.
            warn!("flash image was written by a different firmware build");
            return false;
        }
        self.end_of_heap = header.end_of_heap as usize;
        self.header = Some(header);
        true
    }

    /// The validated header, when an image is mounted.
    pub const fn header(&self) -> Option<&FlashHeader> {
        self.header.as_ref()
    }

    /// Partition size in bytes.
    pub fn total_flash(&self) -> usize {
        self.storage.len()
    }

    /// Bytes used by the current image.
    pub const fn used_flash(&self) -> usize {
        self.end_of_heap
    }

    /// True when a valid image matches the given version and hash.
    pub fn contains_matching_data(&self, data_version: u32, data_hash: u32) -> bool {
        match &self.header {
            Some(h) => {
                let matches = h.data_version == data_version && h.data_hash == data_hash;
                if matches {
                    debug!("found matching data in flash");
                }
                matches
            }
            None => false,
        }
    }

    /// Erase the partition and reserve the header page again. Idempotent.
    pub fn clear(&mut self) -> Result<(), FlashError> {
        if !self.flash_clear {
            debug_assert!(HEADER_LEN <= self.storage.page_size());
            if !self.storage.erase_all() {
                return Err(FlashError::WriteFailed);
            }
            self.end_of_heap = self.storage.page_size();
            self.header = None;
            self.flash_clear = true;
        }
        Ok(())
    }

    /// Reserve `bytes` of flash. No write happens yet; the returned offset
    /// is a target for [`Self::copy_to_flash`].
    pub fn flash_alloc(&mut self, bytes: usize) -> Result<u32, FlashError> {
        let rounded = (bytes + ALLOC_ALIGNMENT - 1) & !(ALLOC_ALIGNMENT - 1);
        if self.end_of_heap + rounded + ALLOC_ALIGNMENT >= self.storage.len() {
            warn!(
                wanted = bytes,
                free = self.storage.len() - self.end_of_heap,
                "not enough flash"
            );
            return Err(FlashError::OutOfSpace);
        }
        let offset = self.end_of_heap;
        self.end_of_heap += rounded;
        Ok(offset as u32)
    }

    /// Write `src` at a previously reserved `target` offset. Zero-length
    /// writes are a no-op.
    pub fn copy_to_flash(&mut self, src: &[u8], target: u32, usage: &str) -> Result<(), FlashError> {
        debug!(usage, len = src.len(), "flashing block");
        self.flash_clear = false;
        if src.is_empty() {
            return Ok(());
        }
        let target = target as usize;
        if target < self.storage.page_size() || target + src.len() > self.end_of_heap {
            return Err(FlashError::OutOfBounds);
        }
        if !self.storage.write(target, src) {
            return Err(FlashError::WriteFailed);
        }
        Ok(())
    }

    /// Stamp the header. Called last, after every root region is written.
    pub fn write_header(
        &mut self,
        data_version: u32,
        data_hash: u32,
        roots: ImageRoots,
        startup_token: Token,
        startup_flags: StartupFlags,
        static_vector_size: u32,
    ) -> Result<(), FlashError> {
        self.flash_clear = false;
        let header = FlashHeader {
            data_version,
            data_hash,
            roots,
            end_of_heap: self.end_of_heap as u32,
            startup_token,
            startup_flags,
            static_vector_size,
            build_timestamp: build_fingerprint(),
        };
        if !self.storage.write(0, &header.serialize()) {
            return Err(FlashError::WriteFailed);
        }
        let valid = self.init_header();
        debug!(
            used = self.used_flash(),
            total = self.total_flash(),
            valid,
            "flash header written"
        );
        if !valid {
            return Err(FlashError::WriteFailed);
        }
        Ok(())
    }

    /// A reader over the mapped image at `offset`.
    pub fn reader_at(&self, offset: u32) -> ImageReader<'_> {
        ImageReader::new(self.storage.mapped(), offset as usize)
    }

    /// Access the board storage, e.g. to persist it across a simulated
    /// reset.
    pub fn into_storage(self) -> F {
        self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> FlashMemoryManager<SimFlashStorage> {
        FlashMemoryManager::new(SimFlashStorage::new(64 * 1024, 1024))
    }

    #[test]
    fn fresh_flash_has_no_header() {
        let m = manager();
        assert!(m.header().is_none());
        assert!(!m.contains_matching_data(1, 2));
    }

    #[test]
    fn header_survives_remount() {
        let mut m = manager();
        m.clear().unwrap();
        let root = m.flash_alloc(16).unwrap();
        m.copy_to_flash(&[1, 2, 3, 4], root, "test").unwrap();
        m.write_header(3, 0xbeef, ImageRoots { classes: root, ..Default::default() }, 0, StartupFlags::empty(), 0)
            .unwrap();
        assert!(m.contains_matching_data(3, 0xbeef));

        let storage = m.into_storage();
        let m = FlashMemoryManager::new(storage);
        assert!(m.contains_matching_data(3, 0xbeef));
        assert!(!m.contains_matching_data(3, 0xbee0));
        let mut r = m.reader_at(root);
        assert_eq!(r.read_u32().unwrap(), u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn mismatched_fingerprint_invalidates_image() {
        let mut m = manager();
        m.clear().unwrap();
        m.write_header(1, 1, ImageRoots::default(), 0, StartupFlags::empty(), 0)
            .unwrap();

        let mut storage = m.into_storage();
        // Corrupt the stored fingerprint, as a firmware rebuild would.
        let mut stamp = [0u8; FLASH_TIMESTAMP_LEN];
        stamp[0] = b'x';
        assert!(storage.write(52, &stamp));
        let m = FlashMemoryManager::new(storage);
        assert!(m.header().is_none());
    }

    #[test]
    fn writes_outside_reserved_extent_are_rejected() {
        let mut m = manager();
        m.clear().unwrap();
        let root = m.flash_alloc(8).unwrap();
        assert_eq!(m.copy_to_flash(&[0; 16], root, "test"), Err(FlashError::OutOfBounds));
        assert_eq!(m.copy_to_flash(&[], root, "empty"), Ok(()));
    }

    #[test]
    fn alloc_is_aligned_and_bounded() {
        let mut m = FlashMemoryManager::new(SimFlashStorage::new(4096, 1024));
        m.clear().unwrap();
        let a = m.flash_alloc(5).unwrap();
        let b = m.flash_alloc(3).unwrap();
        assert_eq!(a % ALLOC_ALIGNMENT as u32, 0);
        assert_eq!(b, a + 8);
        assert!(m.flash_alloc(8192).is_err());
    }
}
