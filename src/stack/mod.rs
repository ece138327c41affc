//! The VM's two byte-addressable stacks (`spec.md` §4.2).
//!
//! Both `AddressStack` and `CallStack` are thin, element-shaped wrappers
//! around [`ByteStack`], a growable byte buffer bounded by a configured
//! maximum size. This mirrors the original C implementation's single
//! generic `Stack` type (`original_source/src/stack.h`), reused for both
//! the 8-byte address stack and the 16-byte call stack.

mod byte_stack;
pub use byte_stack::ByteStack;

use crate::error::{VmError, VmResult};

/// The address stack: a sequence of 8-byte handles/addresses, bottom to
/// top (`spec.md` §3, §4.2).
pub struct AddressStack {
    bytes: ByteStack,
}

impl AddressStack {
    pub fn new(initial_capacity: u64, max_capacity: u64) -> AddressStack {
        AddressStack {
            bytes: ByteStack::new(initial_capacity, max_capacity),
        }
    }

    /// Number of 8-byte slots currently on the stack.
    pub fn depth(&self) -> u64 {
        self.bytes.size() / 8
    }

    pub fn max_depth(&self) -> u64 {
        self.bytes.max_size() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.size() == 0
    }

    pub fn push(&mut self, value: u64) -> VmResult<()> {
        self.bytes
            .push(&value.to_le_bytes())
            .map_err(|_| VmError::AddressStackOverflow)
    }

    pub fn pop(&mut self) -> VmResult<u64> {
        let mut buf = [0u8; 8];
        self.bytes
            .pop(&mut buf)
            .map_err(|_| VmError::AddressStackUnderflow)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read the `n`th value from the top without popping (0 = top).
    pub fn peek(&self, n: u64) -> VmResult<u64> {
        let buf = self
            .bytes
            .peek_at((n + 1) * 8, 8)
            .map_err(|_| VmError::AddressStackUnderflow)?;
        Ok(u64::from_le_bytes(buf.try_into().unwrap()))
    }

    pub fn swap_top(&mut self) -> VmResult<()> {
        self.bytes.swap_top(8).map_err(|_| VmError::AddressStackUnderflow)
    }

    pub fn dup_top(&mut self) -> VmResult<()> {
        self.bytes
            .dup_top(8)
            .map_err(|e| dup_error(e))
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn bytes_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    /// Replace the stack's contents wholesale (used by RESTORE). Fails
    /// without mutating the stack if `data` would exceed the configured
    /// maximum.
    pub fn set_bytes(&mut self, data: &[u8]) -> VmResult<()> {
        self.bytes
            .set_bytes(data)
            .map_err(|_| VmError::AddressStackOverflow)
    }
}

/// The call stack: 16-byte frames of `(block_entry_address,
/// return_address)`, bottom to top (`spec.md` §3, §4.2).
pub struct CallStack {
    bytes: ByteStack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub block_entry: u64,
    pub return_address: u64,
}

impl Frame {
    fn to_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.block_entry.to_le_bytes());
        buf[8..16].copy_from_slice(&self.return_address.to_le_bytes());
        buf
    }

    fn from_bytes(buf: [u8; 16]) -> Frame {
        Frame {
            block_entry: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            return_address: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        }
    }
}

impl CallStack {
    pub fn new(initial_capacity: u64, max_capacity: u64) -> CallStack {
        CallStack {
            bytes: ByteStack::new(initial_capacity, max_capacity),
        }
    }

    pub fn depth(&self) -> u64 {
        self.bytes.size() / 16
    }

    pub fn max_depth(&self) -> u64 {
        self.bytes.max_size() / 16
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.size() == 0
    }

    pub fn push(&mut self, frame: Frame) -> VmResult<()> {
        self.bytes
            .push(&frame.to_bytes())
            .map_err(|_| VmError::CallStackOverflow)
    }

    pub fn pop(&mut self) -> VmResult<Frame> {
        let mut buf = [0u8; 16];
        self.bytes
            .pop(&mut buf)
            .map_err(|_| VmError::CallStackUnderflow)?;
        Ok(Frame::from_bytes(buf))
    }

    pub fn bytes_slice(&self) -> &[u8] {
        self.bytes.as_slice()
    }

    pub fn set_bytes(&mut self, data: &[u8]) -> VmResult<()> {
        self.bytes
            .set_bytes(data)
            .map_err(|_| VmError::CallStackOverflow)
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Iterate frames bottom-to-top, for the garbage collector's root scan.
    pub fn frames(&self) -> impl Iterator<Item = Frame> + '_ {
        self.bytes
            .as_slice()
            .chunks_exact(16)
            .map(|chunk| Frame::from_bytes(chunk.try_into().unwrap()))
    }
}

fn dup_error(e: byte_stack::StackFault) -> VmError {
    match e {
        byte_stack::StackFault::Overflow => VmError::AddressStackOverflow,
        byte_stack::StackFault::Underflow => VmError::AddressStackUnderflow,
    }
}
