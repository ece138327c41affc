//! Property-based fuzzing of the universal invariants from `spec.md` §8,
//! supplementing the fixed scenarios in `gc.rs`/`memory/heap.rs`/`vm/mod.rs`
//! with randomly generated bounded-length instruction streams. Run in the
//! style the VM/allocator crates in the corpus use `proptest` for: assert
//! an invariant holds after *every* step, not just on hand-picked inputs.

use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

use crate::config::VmConfig;
use crate::memory::BlockType;
use crate::vm::instructions::{
    DUP, HALT, MKD, MKK, MKS0, MKS1, MKS2, PCALL, POP, PRINT, PUSH, RET, SAVE, SWAP,
};
use crate::vm::{Vm, VmState};

/// Every universal invariant in `spec.md` §8, checked against one `Vm`.
/// Panics (via `assert!`) on violation, so this can be dropped straight
/// into a proptest body or a plain `#[test]`.
fn assert_universal_invariants(vm: &Vm) {
    let heap = vm.heap();

    let mut tiled_bytes = 0u64;
    let mut free_bytes_by_scan = 0u64;
    let mut prev_was_free = false;
    for (_, header) in heap.blocks() {
        tiled_bytes += 8 + header.size;
        if header.block_type == BlockType::Free {
            assert!(!prev_was_free, "two adjacent Free blocks were not coalesced");
            free_bytes_by_scan += header.size;
            prev_was_free = true;
        } else {
            prev_was_free = false;
        }
    }
    assert_eq!(
        tiled_bytes,
        heap.current_size() - heap.heap_start(),
        "blocks must tile the heap region exactly"
    );

    let mut free_list_addrs: Vec<u64> = heap.free_list().collect();
    let mut actual_free_addrs: Vec<u64> = heap
        .blocks()
        .filter(|(_, h)| h.block_type == BlockType::Free)
        .map(|(a, _)| a)
        .collect();
    free_list_addrs.sort_unstable();
    actual_free_addrs.sort_unstable();
    assert_eq!(
        free_list_addrs, actual_free_addrs,
        "free list must enumerate exactly the Free blocks, no more, no less"
    );

    assert_eq!(
        heap.bytes_free(),
        free_bytes_by_scan,
        "bytes_free must equal the sum of Free block payloads"
    );

    assert_eq!(vm.address_stack().bytes_slice().len() % 8, 0, "address stack must stay 8-byte aligned");
    assert_eq!(vm.call_stack().bytes_slice().len() % 16, 0, "call stack must stay 16-byte aligned");

    match vm.state() {
        VmState::Halted | VmState::Panic | VmState::NoProgram => {}
        VmState::Ready => {
            assert!(heap.is_valid_address(vm.pc()), "PC must be a valid address while Ready");
        }
    }
}

fn image_for(bytecode: &[u8]) -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(b"MOO4COWS");
    image.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(&0u32.to_le_bytes());
    image.extend_from_slice(bytecode);
    image
}

/// A small fixed-length opcode alphabet, biased toward opcodes that don't
/// immediately halt/panic the VM, so sequences run long enough to exercise
/// allocation and GC.
fn arb_opcode() -> impl Strategy<Value = u8> {
    prop_oneof![
        3 => Just(PUSH),
        2 => Just(POP),
        2 => Just(SWAP),
        2 => Just(DUP),
        1 => Just(PCALL),
        1 => Just(RET),
        1 => Just(MKK),
        1 => Just(MKS0),
        1 => Just(MKS1),
        1 => Just(MKS2),
        1 => Just(MKD),
        1 => Just(SAVE),
        1 => Just(PRINT),
    ]
}

fn build_program(opcodes: &[u8], operand_seed: u64) -> Vec<u8> {
    let mut code = Vec::new();
    for (i, &op) in opcodes.iter().enumerate() {
        code.push(op);
        match op {
            PUSH => code.extend_from_slice(&(operand_seed.wrapping_add(i as u64) & 0xFF).to_le_bytes()),
            SAVE => code.push(0),
            _ => {}
        }
    }
    code.push(HALT);
    // Generous HALT padding so any PCALL landing inside this region halts
    // quickly instead of running off into garbage bytes.
    code.resize(code.len() + 64, HALT);
    code
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn universal_invariants_hold_after_every_step(
        opcodes in prop_vec(arb_opcode(), 1..40),
        operand_seed in any::<u64>(),
    ) {
        let bytecode = build_program(&opcodes, operand_seed);
        let image = image_for(&bytecode);

        let mut vm = Vm::new(VmConfig {
            heap_initial: 4096,
            heap_max: 65536,
            ..VmConfig::default()
        });
        vm.load_program(&mut image.as_slice()).unwrap();
        assert_universal_invariants(&vm);

        let mut sink: Vec<u8> = Vec::new();
        for _ in 0..opcodes.len() + 2 {
            match vm.step(&mut sink) {
                Ok(()) => assert_universal_invariants(&vm),
                Err(_) => {
                    assert_universal_invariants(&vm);
                    if !matches!(vm.state(), VmState::Ready) {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod fixed_checks {
    use super::*;

    #[test]
    fn fresh_vm_with_trivial_program_satisfies_invariants() {
        let image = image_for(&[HALT]);
        let mut vm = Vm::new(VmConfig::default());
        vm.load_program(&mut image.as_slice()).unwrap();
        assert_universal_invariants(&vm);
    }
}
