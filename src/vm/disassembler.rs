//! Single-instruction decoding, shared by the garbage collector's code
//! walker and the optional `--disassemble` driver mode (SPEC_FULL.md §4.3
//! supplement). This is deliberately a decoder only -- there is no
//! assembler here and no interactive command grammar; both are named
//! out of scope.

use crate::error::{VmError, VmResult};
use crate::memory::Heap;
use crate::vm::instructions::{self, PUSH, RESTORE, SAVE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub mnemonic: &'static str,
    /// `Some` for PUSH (the 8-byte operand) and for SAVE/RESTORE/PRINT (the
    /// 1-byte operand, widened), `None` for opcodes with no operand.
    pub operand: Option<u64>,
    pub size: u8,
}

/// Decode the single instruction starting at `addr`. `addr` may point into
/// the program region or into a Code block's payload -- both are ordinary
/// offsets into the same flat memory.
pub fn decode_one(heap: &Heap, addr: u64) -> VmResult<DecodedInstruction> {
    let opcode = heap.read_u8(addr)?;
    let size = instructions::instruction_size(opcode).ok_or(VmError::IllegalInstruction(opcode))?;
    let mnemonic = instructions::instruction_name(opcode);

    let operand = match opcode {
        PUSH => Some(heap.read_u64(addr + 1)?),
        SAVE | RESTORE => Some(heap.read_u8(addr + 1)? as u64),
        instructions::PRINT => Some(heap.read_u8(addr + 1)? as u64),
        _ => None,
    };

    Ok(DecodedInstruction {
        address: addr,
        mnemonic,
        operand,
        size,
    })
}

/// Decode every instruction in `[start, start + len)`, stopping early (and
/// returning what was decoded so far as an error-free prefix is not
/// available) only on a hard decode failure.
pub fn disassemble_range(heap: &Heap, start: u64, len: u64) -> VmResult<Vec<DecodedInstruction>> {
    let end = start + len;
    let mut out = Vec::new();
    let mut addr = start;
    while addr < end {
        let instr = decode_one(heap, addr)?;
        addr += instr.size as u64;
        out.push(instr);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::closures::build;
    use crate::vm::instructions::MKK;

    #[test]
    fn mkk_template_round_trips_through_disassembly() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(8).unwrap();
        let handle = heap.allocate_code(12).unwrap();
        heap.write_bytes(handle, &build(MKK, &[17])).unwrap();

        let instrs = disassemble_range(&heap, handle, 12).unwrap();
        let mnemonics: Vec<&str> = instrs.iter().map(|i| i.mnemonic).collect();
        assert_eq!(mnemonics, ["PCALL", "POP", "PUSH", "RET"]);
        assert_eq!(instrs[2].operand, Some(17));
    }

    #[test]
    fn unknown_opcode_is_illegal_instruction() {
        let mut heap = Heap::new(1024, 1024);
        heap.reserve_program(8).unwrap();
        let handle = heap.allocate_code(8).unwrap();
        heap.write_bytes(handle, &[255, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            decode_one(&heap, handle),
            Err(VmError::IllegalInstruction(255))
        ));
    }
}
