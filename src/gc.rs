//! Mark-and-sweep garbage collection (`spec.md` §4.6).
//!
//! Roots are every value currently on the AddressStack, plus the
//! `block_entry` field of every CallStack frame -- `return_address` is an
//! intra-block offset, never a handle, and is never a root (`spec.md`
//! §4.6's block-entry/return-address distinction). Marking walks Code
//! blocks by decoding their instructions with [`crate::vm::instructions`]
//! (the same table the dispatcher uses) to find embedded `PUSH` operands
//! that are themselves handles, and walks State blocks by re-reading the
//! saved call/address stacks verbatim.
//!
//! Two shapes of address are not just "not a handle" -- they are
//! themselves invariant violations, and must be reported through
//! `on_fault` rather than quietly skipped (`spec.md` §4.6):
//!
//! - any reachable address (root or embedded operand) that resolves to a
//!   Free block, since a Free block can never legitimately still be
//!   referenced;
//! - a PUSH operand embedded in a Code block that resolves to anything
//!   other than a Code block -- roots themselves (address-stack slots,
//!   call-stack `block_entry`s) are untyped, since a continuation handle
//!   produced by SAVE legitimately sits on the address stack as a State
//!   block reference, but a closure template's captured values are only
//!   ever other closures.
//!
//! The mark phase is iterative, not recursive: cyclic structures (a
//! closure that captures a continuation that resumes into code that
//! rebuilds the same closure) are routine in this VM, and a recursive
//! marker would blow the native stack on them.

use std::collections::VecDeque;

use crate::memory::{BlockType, Heap};
use crate::stack::{AddressStack, CallStack};
use crate::vm::instructions::{self, PUSH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcFault {
    /// A root or an embedded PUSH operand pointed outside any block.
    DanglingHandle(u64),
    /// A Code block's bytecode ended mid-instruction, or named an opcode
    /// `instruction_size` doesn't recognize.
    CorruptCode(u64),
    /// A header decoded to the unused type tag `3` -- the byte at this
    /// handle's block isn't a valid block at all (`spec.md` §4.6: reached
    /// by following program-influenced data, not the heap's own
    /// bookkeeping).
    CorruptHeader(u64),
    /// A reachable address resolved to a block already on the free list.
    /// A Free block being referenced from anywhere live is an I1/I2
    /// violation (`spec.md` §4.6: "this is an invariant violation").
    ReachableFreeBlock(u64),
    /// A Code block's PUSH operand resolved to a block of the wrong type
    /// (only Code-block references are legal there; `spec.md` §4.6:
    /// "that block MUST be a Code block ... report a GC error and do not
    /// recurse").
    WrongBlockType {
        handle: u64,
        expected: BlockType,
        found: BlockType,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub blocks_marked: u64,
    pub blocks_freed: u64,
    pub bytes_reclaimed: u64,
}

/// Run one full collection. Faults encountered while walking a heap value
/// (as opposed to a structural bug in the collector itself) are reported
/// to `on_fault` rather than aborting the sweep -- a single malformed
/// embedded address shouldn't stop every other reachable block from being
/// correctly preserved.
pub fn collect(
    heap: &mut Heap,
    call_stack: &CallStack,
    addr_stack: &AddressStack,
    on_fault: &mut dyn FnMut(GcFault),
) -> GcStats {
    mark(heap, call_stack, addr_stack, on_fault);
    sweep(heap)
}

/// A pending address to visit, tagged with whether the place it came from
/// constrains what type of block it's allowed to resolve to. Roots (stack
/// slots, call-frame `block_entry`s, a State block's saved stacks) are
/// untyped -- a continuation handle is a State block sitting where a
/// "plain" address would otherwise be. A Code block's PUSH operand is
/// typed: it MUST resolve to another Code block (`spec.md` §4.6).
#[derive(Debug, Clone, Copy)]
struct WorkItem {
    handle: u64,
    required_type: Option<BlockType>,
}

fn root(handle: u64) -> WorkItem {
    WorkItem {
        handle,
        required_type: None,
    }
}

fn code_operand(handle: u64) -> WorkItem {
    WorkItem {
        handle,
        required_type: Some(BlockType::Code),
    }
}

fn mark(heap: &mut Heap, call_stack: &CallStack, addr_stack: &AddressStack, on_fault: &mut dyn FnMut(GcFault)) {
    let mut worklist: VecDeque<WorkItem> = VecDeque::new();

    for frame in call_stack.frames() {
        worklist.push_back(root(frame.block_entry));
    }
    for n in 0..addr_stack.depth() {
        if let Ok(v) = addr_stack.peek(n) {
            worklist.push_back(root(v));
        }
    }

    while let Some(item) = worklist.pop_front() {
        mark_one(heap, item, &mut worklist, on_fault);
    }
}

/// Mark the block containing `item.handle`, and if not already marked,
/// enqueue whatever it references in turn. Silently ignores addresses that
/// plainly aren't handles at all (program addresses, zero) -- the
/// AddressStack and State-block payloads legitimately hold non-handle
/// values too (`spec.md` doesn't tag stack slots by kind), so a
/// handle-shaped scan has to expect some false candidates. A handle that
/// *does* resolve to a block, but the wrong kind of block (reachable Free,
/// or a Code-block operand that isn't itself Code), is reported via
/// `on_fault` rather than marked or recursed into.
fn mark_one(heap: &mut Heap, item: WorkItem, worklist: &mut VecDeque<WorkItem>, on_fault: &mut dyn FnMut(GcFault)) {
    let handle = item.handle;
    if handle == 0 || heap.is_program_address(handle) {
        return;
    }

    let header_addr = match heap.handle_to_header(handle) {
        Ok(addr) => addr,
        Err(_) => return,
    };

    let header = match heap.try_read_header(header_addr) {
        Some(h) => h,
        None => {
            on_fault(GcFault::CorruptHeader(handle));
            return;
        }
    };

    if header.block_type == BlockType::Free {
        // Mark-then-unmark mirrors the reference collector's handshake
        // (`original_source/src/vmmem.c`'s `visitBlock`): there is nothing
        // to recurse into, but the fault must still be reported before
        // returning.
        heap.set_marked(header_addr, true);
        heap.set_marked(header_addr, false);
        on_fault(GcFault::ReachableFreeBlock(handle));
        return;
    }

    if let Some(expected) = item.required_type {
        if header.block_type != expected {
            on_fault(GcFault::WrongBlockType {
                handle,
                expected,
                found: header.block_type,
            });
            return;
        }
    }

    if header.marked {
        return;
    }
    heap.set_marked(header_addr, true);

    match header.block_type {
        BlockType::Code => scan_code_block(heap, handle, header.size, worklist, on_fault),
        BlockType::State => scan_state_block(heap, handle, worklist, on_fault),
        BlockType::Free => unreachable!(),
    }
}

/// Walk a Code block's bytecode, decoding each instruction with the same
/// size table the dispatcher uses, and enqueue the operand of every `PUSH`
/// found as a Code-typed reference -- a Code block's captured values are
/// only ever other closures (`spec.md` §4.6), so anything a PUSH operand
/// resolves to that isn't a Code block is a fault, not a silently-ignored
/// non-handle.
fn scan_code_block(
    heap: &Heap,
    handle: u64,
    size: u64,
    worklist: &mut VecDeque<WorkItem>,
    on_fault: &mut dyn FnMut(GcFault),
) {
    let mut pc = handle;
    let end = handle + size;
    while pc < end {
        let opcode = match heap.read_u8(pc) {
            Ok(b) => b,
            Err(_) => {
                on_fault(GcFault::CorruptCode(pc));
                return;
            }
        };
        let ilen = match instructions::instruction_size(opcode) {
            Some(n) => n as u64,
            None => {
                on_fault(GcFault::CorruptCode(pc));
                return;
            }
        };
        if pc + ilen > end {
            on_fault(GcFault::CorruptCode(pc));
            return;
        }
        if opcode == PUSH {
            match heap.read_u64(pc + 1) {
                Ok(operand) => worklist.push_back(code_operand(operand)),
                Err(_) => on_fault(GcFault::DanglingHandle(pc + 1)),
            }
        }
        pc += ilen;
    }
}

/// A State block's saved call-stack frames (`block_entry` only) and saved
/// address-stack slots are all roots in their own right, per `spec.md`
/// §4.6's recursive rule for State blocks -- untyped, exactly like the
/// top-level stack roots.
fn scan_state_block(heap: &Heap, handle: u64, worklist: &mut VecDeque<WorkItem>, on_fault: &mut dyn FnMut(GcFault)) {
    let call_frame_count = match heap.read_u32(handle + 8) {
        Ok(n) => n as u64,
        Err(_) => {
            on_fault(GcFault::CorruptCode(handle));
            return;
        }
    };
    let addr_slot_count = match heap.read_u32(handle + 12) {
        Ok(n) => n as u64,
        Err(_) => {
            on_fault(GcFault::CorruptCode(handle));
            return;
        }
    };

    let frames_start = handle + 16;
    for i in 0..call_frame_count {
        let frame_addr = frames_start + 16 * i;
        match heap.read_u64(frame_addr) {
            Ok(block_entry) => worklist.push_back(root(block_entry)),
            Err(_) => on_fault(GcFault::DanglingHandle(frame_addr)),
        }
        // return_address at frame_addr + 8 is never a root.
    }

    let addr_start = frames_start + 16 * call_frame_count;
    for i in 0..addr_slot_count {
        let slot_addr = addr_start + 8 * i;
        match heap.read_u64(slot_addr) {
            Ok(v) => worklist.push_back(root(v)),
            Err(_) => on_fault(GcFault::DanglingHandle(slot_addr)),
        }
    }
}

/// Walk the heap in address order, turning every unmarked non-Free block
/// into Free, clearing the mark bit on everything that survives, and
/// coalescing adjacent Free blocks as it goes. The free list is rebuilt
/// from scratch rather than patched in place, since coalescing can merge
/// several old free-list entries into one.
fn sweep(heap: &mut Heap) -> GcStats {
    let mut stats = GcStats::default();

    let mut new_first_free: Option<u64> = None;
    let mut last_free_addr: Option<u64> = None;
    let mut running_bytes_free: u64 = 0;

    let mut addr = heap.heap_start();
    let end = heap.current_size();

    // `pending_free` accumulates a coalesced run of (addr, total_span)
    // before it's committed as a single Free block header.
    let mut pending_free: Option<(u64, u64)> = None;

    while addr < end {
        let header = heap.read_header(addr);
        let span = 8 + header.size;

        let is_free_after_sweep = match header.block_type {
            BlockType::Free => true,
            _ if header.marked => {
                heap.set_marked(addr, false);
                false
            }
            _ => {
                stats.blocks_freed += 1;
                stats.bytes_reclaimed += header.size;
                true
            }
        };

        if !is_free_after_sweep {
            stats.blocks_marked += 1;
        }

        if is_free_after_sweep {
            pending_free = Some(match pending_free {
                Some((start, total)) => (start, total + span),
                None => (addr, span),
            });
        } else {
            if let Some((start, total)) = pending_free.take() {
                commit_free_block(heap, start, total, &mut new_first_free, &mut last_free_addr, &mut running_bytes_free);
            }
        }

        addr += span;
    }
    if let Some((start, total)) = pending_free.take() {
        commit_free_block(heap, start, total, &mut new_first_free, &mut last_free_addr, &mut running_bytes_free);
    }

    heap.set_first_free(new_first_free);
    heap.set_bytes_free(running_bytes_free);
    stats
}

fn commit_free_block(
    heap: &mut Heap,
    start: u64,
    total_span: u64,
    new_first_free: &mut Option<u64>,
    last_free_addr: &mut Option<u64>,
    running_bytes_free: &mut u64,
) {
    use crate::memory::Header;

    let payload = total_span - 8;
    heap.write_header(start, Header::new(BlockType::Free, payload));
    heap.write_free_next(start, 0);

    match last_free_addr {
        Some(prev) => heap.write_free_next(*prev, start),
        None => *new_first_free = Some(start),
    }
    *last_free_addr = Some(start);
    *running_bytes_free += payload;
}
