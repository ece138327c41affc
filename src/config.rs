//! VM sizing knobs (SPEC_FULL.md §6). Nothing here is observable bytecode
//! behavior -- it only bounds how big the stacks and heap are allowed to
//! grow before the VM starts reporting overflow/out-of-memory.

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub address_stack_initial: u64,
    pub address_stack_max: u64,
    pub call_stack_initial: u64,
    pub call_stack_max: u64,
    pub heap_initial: u64,
    pub heap_max: u64,
}

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

impl Default for VmConfig {
    fn default() -> VmConfig {
        VmConfig {
            address_stack_initial: 64 * KIB,
            address_stack_max: 64 * KIB,
            call_stack_initial: 64 * KIB,
            call_stack_max: 64 * KIB,
            heap_initial: MIB,
            heap_max: 16 * MIB,
        }
    }
}
