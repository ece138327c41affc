//! A virtual machine for a minimal combinator-based language: a two-stack
//! bytecode interpreter over a managed heap, with a mark-and-sweep
//! collector that walks bytecode to find reachable references, and
//! first-class continuations implemented by snapshotting both stacks onto
//! the heap (`spec.md` §1, §2).

pub mod config;
pub mod error;
pub mod gc;
#[cfg(test)]
mod invariants;
pub mod loader;
pub mod memory;
pub mod stack;
pub mod symtab;
pub mod vm;

pub use config::VmConfig;
pub use error::{VmError, VmResult};
pub use vm::{ByteSink, Stdout, Vm, VmState};
