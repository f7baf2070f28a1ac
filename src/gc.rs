//! The managed heap: a segregated free-list allocator over coarse blocks
//! with a precise, non-compacting mark-and-sweep collector.
//!
//! Each block is a byte arena whose sub-blocks are delimited by embedded
//! four-byte headers `(size: u16, flags: u8, marker: u8)`; the header chain
//! exactly covers the block. Object references are packed 32-bit handles
//! (`block << 24 | payload offset`), the engine's pointer size.

use microclr_asm::{KnownTypeToken, SystemException, Token, VariableKind};

use crate::class::ClassDeclaration;
use crate::consts::*;
use crate::error::{ClrException, EngineFault};
use crate::value::{Value, Variable};

use core::num::NonZeroU32;
use std::sync::Arc;

use tracing::{debug, trace};

/// Sub-block header size; equals the allocation alignment.
const HDR: usize = ALLOC_ALIGNMENT;

/// Largest backing block the u16 sub-block size field can describe.
const MAX_BLOCK_SIZE: usize = u16::MAX as usize - HDR;

const FLAG_FREE: u8 = 0;
const FLAG_USED: u8 = 1;

/// A packed reference to a managed object: block index in the top byte,
/// payload byte offset in the low 24 bits. The offset is always at least
/// one header past the block start, so the packed word is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    fn pack(block: usize, offset: usize) -> Self {
        let word = ((block as u32) << 24) | (offset as u32 & 0x00ff_ffff);
        Self(NonZeroU32::new(word).expect("payload offset is never zero"))
    }

    /// Index of the backing block.
    pub const fn block(&self) -> usize {
        (self.0.get() >> 24) as usize
    }

    /// Payload byte offset inside the block.
    pub const fn offset(&self) -> usize {
        (self.0.get() & 0x00ff_ffff) as usize
    }

    /// The packed word as stored in object fields and array elements.
    pub const fn to_word(self) -> u32 {
        self.0.get()
    }

    /// Re-interpret a stored word; zero is the null reference.
    pub fn from_word(word: u32) -> Option<Self> {
        NonZeroU32::new(word).map(Self)
    }
}

/// Class-table view the collector needs while tracing.
pub trait ClassLookup {
    /// The class declaration for `token`, if loaded.
    fn lookup_class(&self, token: Token) -> Option<Arc<ClassDeclaration>>;
}

/// Lookup over an empty class table; used by the boot self-test.
pub(crate) struct NoClasses;

impl ClassLookup for NoClasses {
    fn lookup_class(&self, _token: Token) -> Option<Arc<ClassDeclaration>> {
        None
    }
}

#[derive(Debug)]
struct GcBlock {
    data: Vec<u8>,
    free_bytes: usize,
    /// Offset of the trailing free header while linear fill is possible;
    /// once the block first fills this moves to the block end and
    /// allocations scan the chain instead.
    tail: usize,
}

impl GcBlock {
    fn new(size: usize) -> Self {
        let mut block = Self {
            data: vec![0u8; size],
            free_bytes: size - HDR,
            tail: 0,
        };
        block.set_header(0, size - HDR, FLAG_FREE);
        block
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn header_size(&self, offset: usize) -> usize {
        u16::from_le_bytes([self.data[offset], self.data[offset + 1]]) as usize
    }

    fn header_flags(&self, offset: usize) -> u8 {
        self.data[offset + 2]
    }

    fn header_marker(&self, offset: usize) -> u8 {
        self.data[offset + 3]
    }

    fn set_header(&mut self, offset: usize, size: usize, flags: u8) {
        let bytes = (size as u16).to_le_bytes();
        self.data[offset] = bytes[0];
        self.data[offset + 1] = bytes[1];
        self.data[offset + 2] = flags;
        self.data[offset + 3] = BLOCK_MARKER;
    }

    fn set_flags(&mut self, offset: usize, flags: u8) {
        self.data[offset + 2] = flags;
    }

    /// Try to carve `size` bytes (already alignment-rounded) out of this
    /// block. Linear tail fill first; once the block has filled, scan the
    /// chain for a free sub-block of at most twice the wanted size.
    fn try_allocate(&mut self, size: usize) -> Option<usize> {
        if size > self.free_bytes {
            return None;
        }

        // Linear fill: the tail header must cover the request plus a
        // residual free header, so no zero-length sub-block appears.
        if self.tail < self.len() {
            let avail = self.header_size(self.tail);
            if self.header_flags(self.tail) == FLAG_FREE && avail >= size + HDR + ALLOC_ALIGNMENT {
                let payload = self.tail + HDR;
                self.set_header(self.tail, size, FLAG_USED);
                let next = self.tail + HDR + size;
                self.set_header(next, avail - size - HDR, FLAG_FREE);
                self.tail = next;
                self.free_bytes -= size + HDR;
                return Some(payload);
            }
            // The block filled for the first time; retire the tail.
            self.tail = self.len();
        }

        // Best-fit scan: accept a free sub-block between size and 2*size,
        // splitting when the remainder can host its own header.
        let mut offset = 0;
        while offset < self.len() {
            let this_size = self.header_size(offset);
            if this_size == 0 {
                break;
            }
            if self.header_flags(offset) != FLAG_FREE {
                offset += this_size + HDR;
                continue;
            }
            if this_size >= size && this_size <= 2 * size {
                let payload = offset + HDR;
                if this_size >= size + HDR + ALLOC_ALIGNMENT {
                    self.set_header(offset, size, FLAG_USED);
                    self.set_header(offset + HDR + size, this_size - size - HDR, FLAG_FREE);
                    self.free_bytes -= size + HDR;
                } else {
                    self.set_flags(offset, FLAG_USED);
                    self.free_bytes -= this_size + HDR;
                }
                return Some(payload);
            }
            offset += this_size + HDR;
        }

        None
    }
}

/// The collector and its heap.
#[derive(Debug, Default)]
pub struct GarbageCollector {
    blocks: Vec<GcBlock>,
    memory_limit: Option<usize>,
    total_alloc_bytes: u64,
    total_allocations: u64,
    current_usage: usize,
    max_usage: usize,
}

impl GarbageCollector {
    /// A collector without a backing-memory limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// A collector that refuses to grow past `limit` bytes of backing
    /// memory, emulating the target's heap budget.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            memory_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Total backing memory owned by the heap.
    pub fn allocated_memory(&self) -> usize {
        self.blocks.iter().map(GcBlock::len).sum()
    }

    /// Live bytes as of the last collection.
    pub const fn current_memory_usage(&self) -> usize {
        self.current_usage
    }

    /// High-water mark of live bytes.
    pub const fn max_memory_usage(&self) -> usize {
        self.max_usage
    }

    /// Lifetime allocation statistics: `(bytes, allocations)`.
    pub const fn allocation_totals(&self) -> (u64, u64) {
        (self.total_alloc_bytes, self.total_allocations)
    }

    /// Drop every block and reset statistics.
    pub fn clear(&mut self) {
        debug!(
            total = self.total_alloc_bytes,
            count = self.total_allocations,
            max_used = self.max_usage,
            "releasing gc heap"
        );
        self.blocks.clear();
        self.total_alloc_bytes = 0;
        self.total_allocations = 0;
        self.current_usage = 0;
        self.max_usage = 0;
    }

    fn new_block(&mut self, wanted: usize) -> Option<()> {
        // Halve on failure until the request itself no longer fits.
        let mut size = usize::max(DEFAULT_GC_BLOCK_SIZE, wanted).min(MAX_BLOCK_SIZE);
        while size >= wanted {
            let within_budget = match self.memory_limit {
                Some(limit) => self.allocated_memory() + size <= limit,
                None => true,
            };
            if within_budget {
                trace!(size, "new gc block");
                self.blocks.push(GcBlock::new(size));
                return Some(());
            }
            size /= 2;
        }
        None
    }

    /// Allocate `size` payload bytes. Fails with a recoverable
    /// `OutOfMemory` when no block can satisfy the request; the caller is
    /// expected to collect and retry once.
    pub fn allocate(&mut self, size: usize) -> Result<ObjRef, ClrException> {
        let size = usize::max(size, 1);
        let rounded = (size + ALLOC_ALIGNMENT - 1) & !(ALLOC_ALIGNMENT - 1);
        if rounded + HDR > MAX_BLOCK_SIZE {
            return Err(ClrException::new(SystemException::OutOfMemory, 0));
        }

        let mut payload = None;
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            if let Some(offset) = block.try_allocate(rounded) {
                payload = Some((idx, offset));
                break;
            }
        }

        if payload.is_none() && self.new_block(rounded + HDR + ALLOC_ALIGNMENT).is_some() {
            let idx = self.blocks.len() - 1;
            payload = self.blocks[idx].try_allocate(rounded).map(|offset| (idx, offset));
        }

        let (block, offset) =
            payload.ok_or_else(|| ClrException::new(SystemException::OutOfMemory, 0))?;

        self.total_alloc_bytes += size as u64;
        self.total_allocations += 1;

        debug_assert!(offset % ALLOC_ALIGNMENT == 0);
        debug_assert!(self.validate_blocks().is_ok());

        Ok(ObjRef::pack(block, offset))
    }

    /// Walk every block asserting chain consistency, marker correctness and
    /// exact coverage.
    pub fn validate_blocks(&self) -> Result<(), EngineFault> {
        for block in &self.blocks {
            let len = block.len();
            let mut offset = 0;
            while offset < len {
                if offset + HDR > len {
                    return Err(EngineFault::MemoryCorruption("header past block end"));
                }
                let size = block.header_size(offset);
                if size == 0 {
                    return Err(EngineFault::MemoryCorruption("zero-size sub-block"));
                }
                if size > len {
                    return Err(EngineFault::MemoryCorruption("sub-block larger than block"));
                }
                if block.header_marker(offset) != BLOCK_MARKER {
                    return Err(EngineFault::MemoryCorruption("sub-block marker missing"));
                }
                offset += size + HDR;
            }
            if offset != len {
                return Err(EngineFault::MemoryCorruption("chain does not cover block"));
            }
        }
        Ok(())
    }

    fn checked_header(&self, r: ObjRef) -> Result<usize, EngineFault> {
        let block = self
            .blocks
            .get(r.block())
            .ok_or(EngineFault::MemoryCorruption("reference to unknown block"))?;
        let offset = r.offset();
        if offset < HDR || offset >= block.len() {
            return Err(EngineFault::MemoryCorruption("reference offset out of range"));
        }
        let hd = offset - HDR;
        if block.header_marker(hd) != BLOCK_MARKER {
            return Err(EngineFault::MemoryCorruption("reference header marker missing"));
        }
        let size = block.header_size(hd);
        if size == 0 || offset + size > block.len() {
            return Err(EngineFault::MemoryCorruption("reference header size bad"));
        }
        Ok(hd)
    }

    /// True when `r` names a live, well-formed sub-block.
    pub fn is_valid_ref(&self, r: ObjRef) -> bool {
        self.checked_header(r).is_ok()
    }

    /// Payload size of the object behind `r`.
    pub fn size_of(&self, r: ObjRef) -> Result<usize, EngineFault> {
        let hd = self.checked_header(r)?;
        Ok(self.blocks[r.block()].header_size(hd))
    }

    /// Borrow the payload bytes of `r`.
    pub fn payload(&self, r: ObjRef) -> Result<&[u8], EngineFault> {
        let hd = self.checked_header(r)?;
        let block = &self.blocks[r.block()];
        let size = block.header_size(hd);
        Ok(&block.data[r.offset()..r.offset() + size])
    }

    /// Mutably borrow the payload bytes of `r`.
    pub fn payload_mut(&mut self, r: ObjRef) -> Result<&mut [u8], EngineFault> {
        let hd = self.checked_header(r)?;
        let block = &mut self.blocks[r.block()];
        let size = block.header_size(hd);
        Ok(&mut block.data[r.offset()..r.offset() + size])
    }

    /// Zero the payload of a fresh allocation. The allocator itself does
    /// not zero reused sub-blocks.
    pub fn zero_payload(&mut self, r: ObjRef) -> Result<(), EngineFault> {
        self.payload_mut(r)?.fill(0);
        Ok(())
    }

    /// Read the class token from an object header.
    pub fn class_token(&self, r: ObjRef) -> Result<Token, EngineFault> {
        let payload = self.payload(r)?;
        if payload.len() < OBJECT_HEADER_SIZE {
            return Err(EngineFault::MemoryCorruption("object smaller than its header"));
        }
        Ok(u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]))
    }

    /// Read a little-endian word from an object payload.
    pub fn read_word(&self, r: ObjRef, offset: usize) -> Result<u32, EngineFault> {
        let payload = self.payload(r)?;
        let bytes = payload
            .get(offset..offset + 4)
            .ok_or(EngineFault::MemoryCorruption("word read past object end"))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian word into an object payload.
    pub fn write_word(&mut self, r: ObjRef, offset: usize, word: u32) -> Result<(), EngineFault> {
        let payload = self.payload_mut(r)?;
        let bytes = payload
            .get_mut(offset..offset + 4)
            .ok_or(EngineFault::MemoryCorruption("word write past object end"))?;
        bytes.copy_from_slice(&word.to_le_bytes());
        Ok(())
    }

    /// Resolve a word found in untyped value-type storage. Returns the
    /// canonical reference of the enclosing sub-block when the word decodes
    /// to an address inside the heap, scanning the chain so interior
    /// pointers resolve to their object start.
    fn ref_from_word(&self, word: u32) -> Option<ObjRef> {
        let r = ObjRef::from_word(word)?;
        let block = self.blocks.get(r.block())?;
        let target = r.offset();
        if target < HDR || target >= block.len() {
            return None;
        }
        let mut offset = 0;
        while offset < block.len() {
            let size = block.header_size(offset);
            if size == 0 {
                return None;
            }
            let payload = offset + HDR;
            if target >= payload && target < payload + size {
                return Some(ObjRef::pack(r.block(), payload));
            }
            offset += size + HDR;
        }
        None
    }

    fn mark_all_free(&mut self) {
        for block in &mut self.blocks {
            let len = block.len();
            let mut offset = 0;
            while offset < len {
                let size = block.header_size(offset);
                if size == 0 {
                    break;
                }
                block.set_flags(offset, FLAG_FREE);
                offset += size + HDR;
            }
        }
    }

    /// Mark one root slot. Non-reference primitives terminate immediately;
    /// slot addresses are not followed because they always alias storage
    /// that is itself a root; untyped large-value payloads are probed
    /// word-wise.
    fn mark_variable(
        &mut self,
        variable: &Variable,
        work: &mut Vec<(ObjRef, VariableKind)>,
    ) {
        match &variable.value {
            Value::Boolean(_) | Value::Float(_) | Value::Double(_) | Value::Address(_) => {}
            Value::Object(Some(r)) => work.push((*r, VariableKind::Object)),
            Value::ValueArray(Some(r)) => work.push((*r, VariableKind::ValueArray)),
            Value::ReferenceArray(Some(r)) => work.push((*r, VariableKind::ReferenceArray)),
            Value::LargeValue(bytes) => {
                for chunk in bytes.chunks_exact(POINTER_SIZE) {
                    let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                    if let Some(canon) = self.ref_from_word(word) {
                        work.push((canon, VariableKind::Object));
                    }
                }
            }
            _ => {}
        }
    }

    fn mark_object(
        &mut self,
        r: ObjRef,
        kind: VariableKind,
        classes: &dyn ClassLookup,
        work: &mut Vec<(ObjRef, VariableKind)>,
    ) -> Result<(), EngineFault> {
        let hd = self.checked_header(r)?;
        let block_idx = r.block();
        if self.blocks[block_idx].header_flags(hd) == FLAG_USED {
            // Already reached; cuts reference cycles.
            return Ok(());
        }
        self.blocks[block_idx].set_flags(hd, FLAG_USED);

        match kind {
            VariableKind::ReferenceArray => {
                let length = self.read_word(r, ARRAY_LENGTH_OFFSET)? as usize;
                let elem_token = self.read_word(r, ARRAY_TYPE_OFFSET)?;
                let mut elem_kind = VariableKind::Object;
                if let Some(elem_class) = classes.lookup_class(elem_token) {
                    if elem_class.is_value_type {
                        return Err(EngineFault::MemoryCorruption(
                            "reference array of value types",
                        ));
                    }
                    if elem_class.token == KnownTypeToken::Array as u32 {
                        elem_kind = VariableKind::ReferenceArray;
                    }
                }
                for i in 0..length {
                    let word = self.read_word(r, ARRAY_DATA_OFFSET + i * POINTER_SIZE)?;
                    if let Some(elem) = ObjRef::from_word(word) {
                        work.push((elem, elem_kind));
                    }
                }
            }
            VariableKind::ValueArray => {
                let length = self.read_word(r, ARRAY_LENGTH_OFFSET)? as usize;
                let elem_token = self.read_word(r, ARRAY_TYPE_OFFSET)?;
                // Declarations for simple value types may be absent; such
                // elements cannot hold references.
                let Some(elem_class) = classes.lookup_class(elem_token) else {
                    return Ok(());
                };
                let elem_size = elem_class.dynamic_size as usize;
                for i in 0..length {
                    let base = ARRAY_DATA_OFFSET + i * elem_size;
                    self.mark_fields(r, base, &elem_class, work)?;
                }
            }
            _ => {
                let class_token = self.class_token(r)?;
                let Some(class) = classes.lookup_class(class_token) else {
                    // Reached through a conservative probe or a builtin
                    // without a declaration; keeping it alive is enough.
                    return Ok(());
                };
                self.mark_fields(r, OBJECT_HEADER_SIZE, &class, work)?;
            }
        }
        Ok(())
    }

    fn mark_fields(
        &mut self,
        r: ObjRef,
        base: usize,
        class: &ClassDeclaration,
        work: &mut Vec<(ObjRef, VariableKind)>,
    ) -> Result<(), EngineFault> {
        for (offset, field) in class.instance_fields() {
            let kind = field.desc.kind;
            if matches!(
                kind,
                VariableKind::Object | VariableKind::ReferenceArray | VariableKind::ValueArray
            ) {
                let word = self.read_word(r, base + offset as usize)?;
                if let Some(target) = ObjRef::from_word(word) {
                    work.push((target, kind));
                }
            }
        }
        Ok(())
    }

    fn recompute_free(&mut self) -> usize {
        let mut total_freed = 0;
        let mut in_use = 0;
        for block in &mut self.blocks {
            let len = block.len();
            let mut offset = 0;
            let mut block_free = 0;
            while offset < len {
                let size = block.header_size(offset);
                if size == 0 {
                    break;
                }
                if block.header_flags(offset) == FLAG_FREE {
                    block_free += size;
                } else {
                    in_use += size;
                }
                offset += size + HDR;
            }
            if block_free > block.free_bytes {
                total_freed += block_free - block.free_bytes;
                block.free_bytes = block_free;
            }
        }
        self.current_usage = in_use;
        if in_use > self.max_usage {
            self.max_usage = in_use;
        }
        total_freed
    }

    /// A full collection: every sub-block is marked free, the roots are
    /// traced, and per-block free counters are recomputed. Returns the
    /// number of bytes reclaimed.
    pub fn collect<'a>(
        &mut self,
        roots: impl Iterator<Item = &'a Variable>,
        classes: &dyn ClassLookup,
    ) -> Result<usize, EngineFault> {
        trace!("beginning gc");
        self.mark_all_free();

        let mut work = Vec::new();
        for root in roots {
            self.mark_variable(root, &mut work);
        }
        while let Some((r, kind)) = work.pop() {
            self.mark_object(r, kind, classes, &mut work)?;
        }

        let freed = self.recompute_free();
        self.validate_blocks()?;
        trace!(freed, in_use = self.current_usage, "gc done");
        Ok(freed)
    }

    /// Boot-time self-test: three small allocations must be reclaimed in
    /// full by a collection over no roots, and the chain must stay valid.
    pub fn self_test(&mut self) -> Result<(), EngineFault> {
        let sizes = [20usize, 31, 40];
        let mut total = 0;
        for (i, &size) in sizes.iter().enumerate() {
            let r = self
                .allocate(size)
                .map_err(|_| EngineFault::MemoryCorruption("self-test allocation failed"))?;
            self.payload_mut(r)?.fill(i as u8 + 1);
            total += (size + ALLOC_ALIGNMENT - 1) & !(ALLOC_ALIGNMENT - 1);
        }
        self.validate_blocks()?;
        let collected = self.collect(core::iter::empty(), &NoClasses)?;
        if collected < total {
            return Err(EngineFault::MemoryCorruption("self-test reclaim too small"));
        }
        self.validate_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_of_returned_references() {
        let mut gc = GarbageCollector::new();
        for size in [1usize, 3, 4, 7, 20, 31, 40, 100] {
            let r = gc.allocate(size).unwrap();
            assert_eq!(r.offset() % ALLOC_ALIGNMENT, 0);
            assert_eq!((r.offset() - HDR) % ALLOC_ALIGNMENT, 0);
        }
        gc.validate_blocks().unwrap();
    }

    #[test]
    fn chain_exactly_covers_blocks() {
        let mut gc = GarbageCollector::new();
        for _ in 0..50 {
            gc.allocate(24).unwrap();
        }
        gc.validate_blocks().unwrap();
    }

    #[test]
    fn self_test_reclaims_everything() {
        let mut gc = GarbageCollector::new();
        gc.self_test().unwrap();
    }

    #[test]
    fn roots_survive_collection() {
        let mut gc = GarbageCollector::new();
        let live = gc.allocate(16).unwrap();
        let dead = gc.allocate(16).unwrap();
        gc.write_word(live, 0, 0).unwrap();
        gc.write_word(dead, 0, 0).unwrap();

        let root = Variable::new(Value::Object(Some(live)));
        let freed = gc.collect([&root].into_iter(), &NoClasses).unwrap();
        assert!(freed >= 16);

        // The live object's sub-block is used, the dead one's is free.
        let hd = live.offset() - HDR;
        assert_eq!(gc.blocks[live.block()].header_flags(hd), FLAG_USED);
        let hd = dead.offset() - HDR;
        assert_eq!(gc.blocks[dead.block()].header_flags(hd), FLAG_FREE);
    }

    #[test]
    fn freed_storage_is_reused() {
        let mut gc = GarbageCollector::with_limit(DEFAULT_GC_BLOCK_SIZE);
        let mut refs = Vec::new();
        for _ in 0..100 {
            refs.push(gc.allocate(100).unwrap());
        }
        // No roots: everything is garbage.
        gc.collect(core::iter::empty(), &NoClasses).unwrap();
        for _ in 0..100 {
            gc.allocate(100).unwrap();
        }
        gc.validate_blocks().unwrap();
        assert_eq!(gc.allocated_memory(), DEFAULT_GC_BLOCK_SIZE);
    }

    #[test]
    fn memory_limit_produces_out_of_memory() {
        let mut gc = GarbageCollector::with_limit(1024);
        let mut allocated = 0;
        loop {
            match gc.allocate(64) {
                Ok(_) => allocated += 1,
                Err(e) => {
                    assert_eq!(e.kind, SystemException::OutOfMemory);
                    break;
                }
            }
            assert!(allocated < 100, "limit never hit");
        }
    }

    #[test]
    fn interior_words_resolve_to_object_start() {
        let mut gc = GarbageCollector::new();
        let r = gc.allocate(32).unwrap();
        let interior = ObjRef::pack(r.block(), r.offset() + 8);
        assert_eq!(gc.ref_from_word(interior.to_word()), Some(r));
        assert_eq!(gc.ref_from_word(0), None);
    }
}
