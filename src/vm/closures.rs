//! Closure-construction templates: `MKK`, `MKS0`, `MKS1`, `MKS2`, `MKD`
//! and `MKC` (`spec.md` §4.4, §4.5).
//!
//! Each of these opcodes reads the top `k` values of the address stack
//! *without popping them*, writes a short fixed bytecode template into a
//! freshly allocated Code block (the template's `PUSH` operands are the
//! captured values), then pops the `k` inputs and pushes the new block's
//! handle. Reading before popping is load-bearing: it keeps the captured
//! values reachable from the address stack in case allocating the Code
//! block triggers a GC pass (`spec.md` §9).
//!
//! The templates are produced from one small data-driven table rather
//! than six hand-written byte-pushing functions, because the table is
//! also what the disassembler round-trip test in `src/vm/disassembler.rs`
//! checks against.

use crate::vm::instructions::{DUP, MKS1, MKS2, PCALL, POP, PUSH, RESTORE, RET, SWAP};

/// How many address-stack slots a closure-construction opcode captures,
/// and the resulting Code block's payload size.
#[derive(Debug, Clone, Copy)]
pub struct ClosureSpec {
    pub captures: u8,
    pub size: u64,
}

pub fn spec_for(opcode: u8) -> Option<ClosureSpec> {
    use crate::vm::instructions::{MKC, MKD, MKK, MKS0};
    match opcode {
        MKK => Some(ClosureSpec { captures: 1, size: 12 }),
        MKS0 => Some(ClosureSpec { captures: 1, size: 12 }),
        MKS1 => Some(ClosureSpec { captures: 2, size: 25 }),
        MKS2 => Some(ClosureSpec { captures: 2, size: 20 }),
        MKD => Some(ClosureSpec { captures: 1, size: 15 }),
        MKC => Some(ClosureSpec { captures: 1, size: 13 }),
        _ => None,
    }
}

fn push(buf: &mut Vec<u8>, value: u64) {
    buf.push(PUSH);
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Build the bytecode template for `opcode`, given its captured values in
/// the order the spec names them (`captures[0]` is the value that was on
/// top of the address stack).
///
/// # Panics
/// Panics if `captures.len()` doesn't match `spec_for(opcode).captures` --
/// the dispatcher is responsible for checking stack depth before calling
/// this, so a mismatch here is a programming error, not a runtime fault.
pub fn build(opcode: u8, captures: &[u64]) -> Vec<u8> {
    use crate::vm::instructions::{MKC, MKD, MKK, MKS0};

    let spec = spec_for(opcode).expect("build() called with a non-closure opcode");
    assert_eq!(captures.len(), spec.captures as usize);

    let mut code = Vec::with_capacity(spec.size as usize);
    match opcode {
        MKK => {
            // PCALL, POP, PUSH <u>, RET
            code.push(PCALL);
            code.push(POP);
            push(&mut code, captures[0]);
            code.push(RET);
        }
        MKS0 => {
            // PCALL, PUSH <u>, MKS1, RET
            code.push(PCALL);
            push(&mut code, captures[0]);
            code.push(MKS1);
            code.push(RET);
        }
        MKS1 => {
            // PCALL, DUP, PUSH <v>, MKS2, SWAP, PUSH <u>, PCALL, PCALL, RET
            let (u, v) = (captures[0], captures[1]);
            code.push(PCALL);
            code.push(DUP);
            push(&mut code, v);
            code.push(MKS2);
            code.push(SWAP);
            push(&mut code, u);
            code.push(PCALL);
            code.push(PCALL);
            code.push(RET);
        }
        MKS2 => {
            // PUSH <v>, PUSH <u>, PCALL, RET
            let (u, v) = (captures[0], captures[1]);
            push(&mut code, v);
            push(&mut code, u);
            code.push(PCALL);
            code.push(RET);
        }
        MKD => {
            // PUSH <x>, PCALL, SWAP, PCALL, SWAP, PCALL, RET
            push(&mut code, captures[0]);
            code.push(PCALL);
            code.push(SWAP);
            code.push(PCALL);
            code.push(SWAP);
            code.push(PCALL);
            code.push(RET);
        }
        MKC => {
            // PCALL, PUSH <state>, RESTORE 1, RET
            code.push(PCALL);
            push(&mut code, captures[0]);
            code.push(RESTORE);
            code.push(1);
            code.push(RET);
        }
        _ => unreachable!("build() called with a non-closure opcode"),
    }

    debug_assert_eq!(code.len() as u64, spec.size);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::instructions::MKK;

    #[test]
    fn mkk_template_matches_scenario_3_in_spec() {
        // spec.md §8, scenario 3: MKK with u=17 produces this exact block.
        let code = build(MKK, &[17]);
        assert_eq!(
            code,
            vec![0x05, 0x02, 0x01, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06]
        );
    }

    #[test]
    fn every_template_matches_its_declared_size() {
        for opcode in [
            crate::vm::instructions::MKK,
            crate::vm::instructions::MKS0,
            MKS1,
            MKS2,
            crate::vm::instructions::MKD,
            crate::vm::instructions::MKC,
        ] {
            let spec = spec_for(opcode).unwrap();
            let captures = vec![0xAAAAu64; spec.captures as usize];
            let code = build(opcode, &captures);
            assert_eq!(code.len() as u64, spec.size);
        }
    }
}
