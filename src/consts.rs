//! Engine parameters

/// Managed pointer width. Object references are packed 32-bit handles, so
/// every reference-kind slot occupies exactly four bytes.
pub const POINTER_SIZE: usize = 4;

/// GC sub-block alignment. Also the size of an embedded sub-block header.
pub const ALLOC_ALIGNMENT: usize = 4;

/// Marker byte stamped into every GC sub-block header.
pub const BLOCK_MARKER: u8 = 0xcb;

/// Fresh GC blocks are at least this large.
pub const DEFAULT_GC_BLOCK_SIZE: usize = 16 * 1024;

/// Marker of an ordinary variable slot.
pub const VARIABLE_DEFAULT_MARKER: u8 = 0x37;

/// Marker of a declaration-only slot (field and signature metadata).
pub const VARIABLE_DECLARATION_MARKER: u8 = 0x39;

/// Guard word bracketing every execution frame.
pub const FRAME_GUARD: u32 = 0xcccc_cccc;

/// Instructions executed per interpreter slice before yielding back to the
/// host event loop.
pub const INSTRUCTIONS_PER_SLICE: usize = 32;

/// Maximum managed call depth; exceeding it raises `StackOverflow`.
pub const MAX_CALL_DEPTH: usize = 64;

/// Identifier stamped at the start of a valid flash image.
pub const FLASH_IMAGE_IDENTIFIER: u32 = 0x7aab_cdbb;

/// Width of the build-timestamp field in the flash header.
pub const FLASH_TIMESTAMP_LEN: usize = 30;

/// Every managed object begins with the token of its class.
pub const OBJECT_HEADER_SIZE: usize = 4;

/// Byte offset of the element count within an array object.
pub const ARRAY_LENGTH_OFFSET: usize = 4;

/// Byte offset of the element-type token within an array object.
pub const ARRAY_TYPE_OFFSET: usize = 8;

/// Byte offset of element storage within an array object.
pub const ARRAY_DATA_OFFSET: usize = 12;

/// Fingerprint of this firmware build, stamped by `build.rs`.
pub const BUILD_TIMESTAMP: &str = env!("MICROCLR_BUILD_TIMESTAMP");
