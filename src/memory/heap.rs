//! The VM's managed memory: a single flat byte array split into an
//! immutable program region and a heap region served by a first-fit
//! allocator (`spec.md` §3, §4.1).
//!
//! No raw pointers are ever handed out. Every accessor takes or returns a
//! `u64` address, so a caller can never hold a reference across a `grow()`
//! or an `allocate_*` call that might relocate the backing buffer -- see
//! the design notes' "re-resolve after grow" rule.

use crate::error::{VmError, VmResult};
use crate::memory::block::{align8, BlockType, Header, HEADER_SIZE};

/// Sentinel written into a free block's `next` field to mark the end of
/// the free list (`spec.md` §3, invariant I2). Never collides with a real
/// free block address because no block's header can live at address 0
/// once a program has been loaded (the program region always occupies at
/// least a few bytes by then); see `DESIGN.md`.
const NO_NEXT: u64 = 0;

/// Minimum post-split free block payload (`spec.md` §4.1: "Free block
/// payload ≥ 8").
const MIN_FREE_PAYLOAD: u64 = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub current_size: u64,
    pub max_size: u64,
    pub bytes_free: u64,
    pub block_count: u64,
    pub free_block_count: u64,
}

pub struct Heap {
    bytes: Vec<u8>,
    max_size: u64,
    program_size: u64,
    /// Header address of the first free block, or `None` if the free list
    /// is empty. This is pure bookkeeping, not part of the observable
    /// byte array; the free list's *links* (the `next` field inside each
    /// free block) are the part invariant I2 actually talks about.
    first_free: Option<u64>,
    bytes_free: u64,
}

impl Heap {
    /// Create a new heap with `initial_size` bytes, growable up to
    /// `max_size`. Both are rounded up to a multiple of 8. No program
    /// region is reserved yet; the whole memory starts out as a single
    /// Free block, which is what lets the first `reserve_program` call
    /// succeed (`spec.md` §4.1).
    pub fn new(initial_size: u64, max_size: u64) -> Heap {
        let initial_size = align8(initial_size);
        let max_size = align8(max_size).max(initial_size);
        let mut heap = Heap {
            bytes: vec![0u8; initial_size as usize],
            max_size,
            program_size: 0,
            first_free: None,
            bytes_free: 0,
        };
        heap.init_whole_region_as_free(0, initial_size);
        heap
    }

    fn init_whole_region_as_free(&mut self, start: u64, end: u64) {
        if end < start + 16 {
            self.first_free = None;
            self.bytes_free = 0;
            return;
        }
        let payload = end - start - HEADER_SIZE;
        self.write_header(start, Header::new(BlockType::Free, payload));
        self.write_free_next(start, NO_NEXT);
        self.first_free = Some(start);
        self.bytes_free = payload;
    }

    pub fn current_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn program_size(&self) -> u64 {
        self.program_size
    }

    pub fn heap_start(&self) -> u64 {
        self.program_size
    }

    pub fn bytes_free(&self) -> u64 {
        self.bytes_free
    }

    pub fn is_valid_address(&self, addr: u64) -> bool {
        addr < self.current_size()
    }

    pub fn is_program_address(&self, addr: u64) -> bool {
        addr < self.program_size
    }

    pub fn stats(&self) -> HeapStats {
        let mut block_count = 0u64;
        let mut free_block_count = 0u64;
        for (_, header) in self.blocks() {
            block_count += 1;
            if header.block_type == BlockType::Free {
                free_block_count += 1;
            }
        }
        HeapStats {
            current_size: self.current_size(),
            max_size: self.max_size,
            bytes_free: self.bytes_free,
            block_count,
            free_block_count,
        }
    }

    // ---- raw byte access -------------------------------------------------

    pub fn slice(&self, addr: u64, len: u64) -> VmResult<&[u8]> {
        let end = addr
            .checked_add(len)
            .ok_or(VmError::IllegalAddress(addr))?;
        if end > self.current_size() {
            return Err(VmError::IllegalAddress(addr));
        }
        Ok(&self.bytes[addr as usize..end as usize])
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> VmResult<()> {
        let end = addr
            .checked_add(data.len() as u64)
            .ok_or(VmError::IllegalAddress(addr))?;
        if end > self.current_size() {
            return Err(VmError::IllegalAddress(addr));
        }
        self.bytes[addr as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> VmResult<u8> {
        Ok(self.slice(addr, 1)?[0])
    }

    pub fn read_u32(&self, addr: u64) -> VmResult<u32> {
        let s = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn read_u64(&self, addr: u64) -> VmResult<u64> {
        let s = self.slice(addr, 8)?;
        Ok(u64::from_le_bytes(s.try_into().unwrap()))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> VmResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> VmResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    // ---- block headers (crate-internal; the GC walks these directly) ----

    /// Decode the header at `header_addr`, panicking if the type tag is
    /// the unused value `3`. Only call this on addresses the heap itself
    /// produced and maintains (block iteration, sweep, the free list) --
    /// there, an invalid tag means the allocator's own bookkeeping is
    /// corrupt, which is unrecoverable. Any address reached by following
    /// program-influenced data (a PUSH operand, a handle popped off a
    /// stack) MUST go through [`Heap::try_read_header`] instead, since a
    /// malformed operand is an ordinary, reportable fault, not a panic.
    pub(crate) fn read_header(&self, header_addr: u64) -> Header {
        let word = u64::from_le_bytes(
            self.bytes[header_addr as usize..header_addr as usize + 8]
                .try_into()
                .unwrap(),
        );
        Header::decode(word).expect("corrupt block header: unused type tag")
    }

    /// Like [`Heap::read_header`], but returns `None` instead of panicking
    /// when the word at `header_addr` doesn't decode to a known type tag.
    /// Used wherever the address under inspection was derived from
    /// program-influenced data rather than the heap's own bookkeeping
    /// (`spec.md` §4.6, §7: a malformed operand is reported, never a
    /// crash).
    pub(crate) fn try_read_header(&self, header_addr: u64) -> Option<Header> {
        let word = u64::from_le_bytes(
            self.bytes[header_addr as usize..header_addr as usize + 8]
                .try_into()
                .unwrap(),
        );
        Header::decode(word)
    }

    pub(crate) fn write_header(&mut self, header_addr: u64, header: Header) {
        let word = header.encode();
        self.bytes[header_addr as usize..header_addr as usize + 8]
            .copy_from_slice(&word.to_le_bytes());
    }

    pub(crate) fn read_free_next(&self, header_addr: u64) -> u64 {
        let addr = header_addr + HEADER_SIZE;
        u64::from_le_bytes(self.bytes[addr as usize..addr as usize + 8].try_into().unwrap())
    }

    pub(crate) fn write_free_next(&mut self, header_addr: u64, next: u64) {
        let addr = header_addr + HEADER_SIZE;
        self.bytes[addr as usize..addr as usize + 8].copy_from_slice(&next.to_le_bytes());
    }

    pub(crate) fn first_free(&self) -> Option<u64> {
        self.first_free
    }

    pub(crate) fn set_first_free(&mut self, addr: Option<u64>) {
        self.first_free = addr;
    }

    pub(crate) fn adjust_bytes_free(&mut self, delta: i64) {
        self.bytes_free = (self.bytes_free as i64 + delta) as u64;
    }

    pub(crate) fn set_bytes_free(&mut self, value: u64) {
        self.bytes_free = value;
    }

    pub(crate) fn set_marked(&mut self, header_addr: u64, marked: bool) {
        let mut header = self.read_header(header_addr);
        header.marked = marked;
        self.write_header(header_addr, header);
    }

    /// Handle (payload address) -> header address, validating that it
    /// actually lands inside the heap region.
    pub fn handle_to_header(&self, handle: u64) -> VmResult<u64> {
        if handle < HEADER_SIZE {
            return Err(VmError::IllegalAddress(handle));
        }
        let header_addr = handle - HEADER_SIZE;
        if header_addr < self.program_size || header_addr >= self.current_size() {
            return Err(VmError::IllegalAddress(handle));
        }
        Ok(header_addr)
    }

    /// `handle`, like every handle accepted here, may come straight from
    /// program-influenced data (an address stack slot popped by RESTORE),
    /// so a corrupt header tag is reported as `IllegalAddress`, not a
    /// panic.
    pub fn block_type_of_handle(&self, handle: u64) -> VmResult<BlockType> {
        let header_addr = self.handle_to_header(handle)?;
        self.try_read_header(header_addr)
            .map(|h| h.block_type)
            .ok_or(VmError::IllegalAddress(handle))
    }

    pub fn block_size_of_handle(&self, handle: u64) -> VmResult<u64> {
        let header_addr = self.handle_to_header(handle)?;
        self.try_read_header(header_addr)
            .map(|h| h.size)
            .ok_or(VmError::IllegalAddress(handle))
    }

    // ---- block iteration --------------------------------------------------

    /// All blocks in address order, from the first byte of the heap region
    /// to the end of memory.
    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            heap: self,
            addr: self.program_size,
        }
    }

    /// Blocks reachable from `first_free` by following `next` pointers
    /// (not necessarily address order -- see `spec.md` §9).
    pub fn free_list(&self) -> FreeListIter<'_> {
        FreeListIter {
            heap: self,
            next: self.first_free,
        }
    }

    // ---- program region ----------------------------------------------------

    /// Reserve `size` bytes (rounded up to a multiple of 8) for the
    /// program region. Fails with `IllegalArgument` unless the entire heap
    /// region is currently a single Free block (`spec.md` §4.1).
    pub fn reserve_program(&mut self, size: u64) -> VmResult<()> {
        let requested = align8(size);

        if !self.heap_region_is_single_free_block() {
            return Err(VmError::IllegalArgument(
                "cannot reserve program region: heap is in use".to_string(),
            ));
        }

        while self.current_size() < requested {
            self.grow()?;
        }

        let new_size = self.current_size();
        self.program_size = requested;
        let remaining = new_size - requested;

        if remaining >= 16 {
            self.init_whole_region_as_free(requested, new_size);
        } else {
            self.program_size = new_size;
            self.first_free = None;
            self.bytes_free = 0;
        }

        Ok(())
    }

    fn heap_region_is_single_free_block(&self) -> bool {
        let start = self.program_size;
        let end = self.current_size();
        if end <= start {
            return true;
        }
        let header = self.read_header(start);
        header.block_type == BlockType::Free && start + HEADER_SIZE + header.size == end
    }

    // ---- allocation --------------------------------------------------------

    pub fn allocate_code(&mut self, size: u64) -> VmResult<u64> {
        self.allocate(BlockType::Code, size)
    }

    pub fn allocate_state(&mut self, call_frame_count: u64, addr_slot_count: u64) -> VmResult<u64> {
        let payload = 8 /* guard */ + 4 + 4 /* counts */ + 16 * call_frame_count + 8 * addr_slot_count;
        self.allocate(BlockType::State, payload)
    }

    fn allocate(&mut self, block_type: BlockType, requested_payload: u64) -> VmResult<u64> {
        let aligned = align8(requested_payload);

        let mut prev: Option<u64> = None;
        let mut cursor = self.first_free;

        while let Some(addr) = cursor {
            let header = self.read_header(addr);
            debug_assert_eq!(header.block_type, BlockType::Free);

            if header.size >= aligned {
                let next = self.read_free_next(addr);

                if header.size >= aligned + HEADER_SIZE + MIN_FREE_PAYLOAD {
                    // Split: `addr` becomes the allocated block, a new
                    // Free block follows it.
                    let new_free_addr = addr + HEADER_SIZE + aligned;
                    let new_free_size = header.size - aligned - HEADER_SIZE;

                    self.write_header(addr, Header::new(block_type, aligned));
                    self.write_header(new_free_addr, Header::new(BlockType::Free, new_free_size));
                    self.write_free_next(new_free_addr, next);

                    match prev {
                        Some(p) => self.write_free_next(p, new_free_addr),
                        None => self.first_free = Some(new_free_addr),
                    }
                    self.adjust_bytes_free(-((aligned + HEADER_SIZE) as i64));
                } else {
                    // Not enough room left to split; the whole block is
                    // consumed, including any slack beyond `aligned`.
                    self.write_header(addr, Header::new(block_type, header.size));
                    match prev {
                        Some(p) => self.write_free_next(p, next),
                        None => self.first_free = next_or_none(next),
                    }
                    self.adjust_bytes_free(-(header.size as i64));
                }

                return Ok(addr + HEADER_SIZE);
            }

            prev = Some(addr);
            cursor = next_or_none(self.read_free_next(addr));
        }

        Err(VmError::OutOfMemory)
    }

    // ---- growth --------------------------------------------------------------

    /// Double the heap's current size, capped at `max_size`. All existing
    /// addresses remain valid (the backing buffer simply grows), but any
    /// reference borrowed from this `Heap` before the call must be
    /// re-resolved afterward, since the underlying `Vec` may reallocate.
    pub fn grow(&mut self) -> VmResult<()> {
        let current = self.current_size();
        if current >= self.max_size {
            return Err(VmError::OutOfMemory);
        }

        let new_size = current.saturating_mul(2).min(self.max_size);
        let added = new_size - current;
        if added == 0 {
            return Err(VmError::OutOfMemory);
        }

        self.bytes.resize(new_size as usize, 0);
        log::debug!("heap grown from {current} to {new_size} bytes");

        if self.program_size >= current {
            // No heap region existed before; the new tail is the entire
            // heap region.
            self.append_tail_as_free(current, added);
            return Ok(());
        }

        let last_block_addr = self.last_block_address(current);
        let last_header = self.read_header(last_block_addr);

        if last_header.block_type == BlockType::Free {
            self.write_header(
                last_block_addr,
                Header::new(BlockType::Free, last_header.size + added),
            );
            self.adjust_bytes_free(added as i64);
        } else {
            self.append_tail_as_free(current, added);
        }

        Ok(())
    }

    fn append_tail_as_free(&mut self, at: u64, added: u64) {
        if added < 16 {
            // Too small to host a block; the bytes are unreachable
            // padding (see `spec.md` §9's free-block-minimum open
            // question).
            return;
        }
        let payload = added - HEADER_SIZE;
        self.write_header(at, Header::new(BlockType::Free, payload));
        let old_head = self.first_free.unwrap_or(NO_NEXT);
        self.write_free_next(at, old_head);
        self.first_free = Some(at);
        self.adjust_bytes_free(payload as i64);
    }

    fn last_block_address(&self, end: u64) -> u64 {
        let mut addr = self.program_size;
        let mut last = addr;
        while addr < end {
            last = addr;
            let header = self.read_header(addr);
            addr += HEADER_SIZE + header.size;
        }
        last
    }
}

fn next_or_none(raw: u64) -> Option<u64> {
    if raw == NO_NEXT {
        None
    } else {
        Some(raw)
    }
}

pub struct BlockIter<'a> {
    heap: &'a Heap,
    addr: u64,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = (u64, Header);

    fn next(&mut self) -> Option<Self::Item> {
        if self.addr >= self.heap.current_size() {
            return None;
        }
        let header = self.heap.read_header(self.addr);
        let addr = self.addr;
        self.addr += HEADER_SIZE + header.size;
        Some((addr, header))
    }
}

pub struct FreeListIter<'a> {
    heap: &'a Heap,
    next: Option<u64>,
}

impl<'a> Iterator for FreeListIter<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.next?;
        self.next = next_or_none(self.heap.read_free_next(addr));
        Some(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_program_leaves_single_free_block() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(8).unwrap();
        assert_eq!(heap.program_size(), 8);
        assert_eq!(heap.bytes_free(), 1024 - 8 - 8);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn reserve_program_rounds_up_to_8() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(1).unwrap();
        assert_eq!(heap.program_size(), 8);
    }

    #[test]
    fn reserve_program_fails_when_heap_in_use() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(8).unwrap();
        heap.allocate_code(16).unwrap();
        assert!(matches!(
            heap.reserve_program(16),
            Err(VmError::IllegalArgument(_))
        ));
    }

    #[test]
    fn allocate_splits_free_block() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(8).unwrap();
        let handle = heap.allocate_code(16).unwrap();
        assert_eq!(handle, 8 + 8);
        assert_eq!(heap.block_size_of_handle(handle).unwrap(), 16);
        // original free block payload was 1024 - 8 (program) - 8 (header) = 1008;
        // allocating 16 bytes consumes 16 + 8 (new header) from the free pool.
        assert_eq!(heap.bytes_free(), 1008 - 16 - 8);
    }

    #[test]
    fn allocate_consumes_whole_block_when_split_too_small() {
        let mut heap = Heap::new(64, 64);
        heap.reserve_program(8).unwrap();
        // heap region is 48 payload bytes in one free block; ask for 40,
        // leaving only 8 bytes, not enough to host a new block (needs 16).
        let handle = heap.allocate_code(40).unwrap();
        assert_eq!(heap.block_size_of_handle(handle).unwrap(), 48);
        assert_eq!(heap.bytes_free(), 0);
        assert_eq!(heap.first_free(), None);
    }

    #[test]
    fn allocate_fails_with_out_of_memory() {
        let mut heap = Heap::new(64, 64);
        heap.reserve_program(8).unwrap();
        assert!(matches!(heap.allocate_code(1000), Err(VmError::OutOfMemory)));
        // Failure must not mutate the heap.
        assert_eq!(heap.bytes_free(), 48);
    }

    #[test]
    fn grow_doubles_and_extends_trailing_free_block() {
        let mut heap = Heap::new(64, 256);
        heap.reserve_program(8).unwrap();
        let before_free = heap.bytes_free();
        heap.grow().unwrap();
        assert_eq!(heap.current_size(), 128);
        assert_eq!(heap.bytes_free(), before_free + 64);
        assert_eq!(heap.blocks().count(), 1);
    }

    #[test]
    fn grow_caps_at_max_size() {
        let mut heap = Heap::new(64, 100);
        heap.reserve_program(8).unwrap();
        heap.grow().unwrap();
        assert_eq!(heap.current_size(), 100);
        assert!(matches!(heap.grow(), Err(VmError::OutOfMemory)));
    }

    #[test]
    fn grow_after_allocation_creates_new_free_block_when_tail_is_used() {
        let mut heap = Heap::new(64, 256);
        heap.reserve_program(8).unwrap();
        heap.allocate_code(48).unwrap(); // consumes the whole free block
        assert_eq!(heap.bytes_free(), 0);
        heap.grow().unwrap();
        assert_eq!(heap.current_size(), 128);
        assert_eq!(heap.bytes_free(), 64 - 8);
        assert_eq!(heap.blocks().count(), 2);
    }
}
