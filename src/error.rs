//! The closed error tag set for the VM core.
//!
//! Every fallible public operation returns `Result<T, VmError>`. Variants
//! are matched by discriminant (`matches!`), never by the message text --
//! the message exists purely for diagnostics.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("a program is already loaded")]
    ProgramAlreadyLoaded,

    #[error("no program has been loaded")]
    NoProgram,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed program image: {0}")]
    BadProgramImage(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("the VM has halted")]
    Halted,

    #[error("the VM panicked")]
    Panic,

    #[error("illegal instruction: opcode {0}")]
    IllegalInstruction(u8),

    #[error("illegal address: {0:#x}")]
    IllegalAddress(u64),

    #[error("call stack underflow")]
    CallStackUnderflow,

    #[error("call stack overflow")]
    CallStackOverflow,

    #[error("address stack underflow")]
    AddressStackUnderflow,

    #[error("address stack overflow")]
    AddressStackOverflow,

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("fatal VM error: {0}")]
    Fatal(String),
}

pub type VmResult<T> = Result<T, VmError>;
