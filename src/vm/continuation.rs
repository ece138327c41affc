//! `SAVE`/`RESTORE` and the State block layout that backs first-class
//! continuations (`spec.md` §4.5).
//!
//! A State block's payload is laid out as:
//!
//! ```text
//! offset 0   8 bytes   reserved (always zero)
//! offset 8   u32       number of saved call-stack frames
//! offset 12  u32       number of saved address-stack slots
//! offset 16  ..        saved call stack, 16 bytes per frame
//! offset 16+16*frames  saved address stack, 8 bytes per slot
//! ```
//!
//! The reserved field costs 8 bytes for every continuation ever taken, but
//! keeps the frame/slot counts 8-byte aligned without fiddly packing, and
//! leaves room for a future format tag without reshuffling the rest.

use crate::error::{VmError, VmResult};
use crate::memory::{BlockType, Heap};
use crate::stack::{AddressStack, CallStack, Frame};

const RESERVED_SIZE: u64 = 8;
const COUNTS_OFFSET: u64 = 8;
const FRAMES_OFFSET: u64 = 16;

struct StateLayout {
    call_frame_count: u64,
    addr_slot_count: u64,
}

impl StateLayout {
    fn total_payload(&self) -> u64 {
        FRAMES_OFFSET + 16 * self.call_frame_count + 8 * self.addr_slot_count
    }
}

/// `SAVE k`: snapshot the entire call stack and the bottom `s - k` slots of
/// the address stack into a new State block, and return its handle. Neither
/// stack is mutated by this call; the caller is responsible for popping the
/// handle's own slot bookkeeping (there isn't any -- SAVE only reads).
pub fn save(heap: &mut Heap, call_stack: &CallStack, addr_stack: &AddressStack, k: u64) -> VmResult<u64> {
    let depth = addr_stack.depth();
    if depth < k {
        return Err(VmError::AddressStackUnderflow);
    }
    let kept_slots = depth - k;

    let layout = StateLayout {
        call_frame_count: call_stack.depth(),
        addr_slot_count: kept_slots,
    };

    let handle = heap.allocate_state(layout.call_frame_count, layout.addr_slot_count)?;

    heap.write_bytes(handle, &[0u8; RESERVED_SIZE as usize])?;
    heap.write_u32(handle + COUNTS_OFFSET, layout.call_frame_count as u32)?;
    heap.write_u32(handle + COUNTS_OFFSET + 4, layout.addr_slot_count as u32)?;

    let mut offset = handle + FRAMES_OFFSET;
    for frame in call_stack.frames() {
        heap.write_u64(offset, frame.block_entry)?;
        heap.write_u64(offset + 8, frame.return_address)?;
        offset += 16;
    }

    // The bottom `kept_slots` values of the address stack, bottom to top.
    let addr_bytes = addr_stack.bytes_slice();
    let keep_len = (kept_slots * 8) as usize;
    heap.write_bytes(offset, &addr_bytes[..keep_len])?;

    debug_assert_eq!(heap.block_size_of_handle(handle)?, layout.total_payload());
    Ok(handle)
}

/// `RESTORE k`: pop a State-block handle from the address stack, replace
/// both stacks wholesale from the snapshot, then push the top `k` slots
/// that were on the address stack back on top. Rolls back cleanly (handle
/// re-pushed, neither stack mutated) on any failure.
pub fn restore(
    heap: &Heap,
    call_stack: &mut CallStack,
    addr_stack: &mut AddressStack,
    k: u64,
) -> VmResult<()> {
    let handle = addr_stack.pop()?;

    match restore_inner(heap, call_stack, addr_stack, handle, k) {
        Ok(()) => Ok(()),
        Err(e) => {
            // Roll back: put the handle back exactly where it was.
            let _ = addr_stack.push(handle);
            Err(e)
        }
    }
}

fn restore_inner(
    heap: &Heap,
    call_stack: &mut CallStack,
    addr_stack: &mut AddressStack,
    handle: u64,
    k: u64,
) -> VmResult<()> {
    let depth_before_pop = addr_stack.depth() + 1;
    if depth_before_pop < 1 + k {
        return Err(VmError::AddressStackUnderflow);
    }

    let block_type = heap.block_type_of_handle(handle).map_err(|_| {
        VmError::Fatal(format!("RESTORE: {handle:#x} is not a valid heap handle"))
    })?;
    if block_type != BlockType::State {
        return Err(VmError::Fatal(format!(
            "RESTORE: handle {handle:#x} refers to a {block_type:?} block, not State"
        )));
    }

    // Scratch-copy the top k slots before anything is overwritten.
    let mut scratch = Vec::with_capacity(k as usize);
    for n in 0..k {
        scratch.push(addr_stack.peek(n)?);
    }
    scratch.reverse(); // peek(0) is the top; we want bottom-to-top for re-push.

    let call_frame_count = heap.read_u32(handle + COUNTS_OFFSET)? as u64;
    let addr_slot_count = heap.read_u32(handle + COUNTS_OFFSET + 4)? as u64;

    let frames_start = handle + FRAMES_OFFSET;
    let frames_bytes = heap.slice(frames_start, 16 * call_frame_count)?;
    let addr_start = frames_start + 16 * call_frame_count;
    let addr_bytes = heap.slice(addr_start, 8 * addr_slot_count)?;

    let mut new_addr_bytes = addr_bytes.to_vec();
    for v in &scratch {
        new_addr_bytes.extend_from_slice(&v.to_le_bytes());
    }
    // Validate before mutating anything: set_bytes on AddressStack checks
    // its own max, but CallStack's replacement never fails on size alone.
    if new_addr_bytes.len() as u64 > addr_stack_capacity(addr_stack) {
        return Err(VmError::AddressStackOverflow);
    }

    call_stack.set_bytes(frames_bytes)?;
    addr_stack.set_bytes(&new_addr_bytes)?;

    Ok(())
}

fn addr_stack_capacity(addr_stack: &AddressStack) -> u64 {
    addr_stack.max_depth() * 8
}
