//! Program image parsing (`spec.md` §4.7, §6). The on-disk format beyond
//! this minimal header, and the assembler that produces it, are both out
//! of scope -- this module only has to turn the documented byte layout
//! into bytecode plus a start address plus a symbol table.

use std::collections::HashSet;
use std::io::Read;

use crate::error::{VmError, VmResult};
use crate::memory::block::align8;
use crate::vm::instructions::HALT;

const MAGIC: &[u8; 8] = b"MOO4COWS";

pub struct ParsedProgram {
    /// Bytecode, already padded to an 8-byte boundary with HALT.
    pub bytecode: Vec<u8>,
    pub start_address: u64,
    pub symbols: Vec<(String, u64)>,
}

/// Parse a program image from `reader`. A truncated image surfaces as
/// `VmError::Io`; a structurally malformed one (bad magic, non-zero
/// reserved field, non-UTF-8 or duplicate symbol name) surfaces as
/// `VmError::BadProgramImage`.
pub fn load_image<R: Read>(reader: &mut R) -> VmResult<ParsedProgram> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(VmError::BadProgramImage(format!(
            "bad magic: expected {:?}, found {:?}",
            MAGIC, magic
        )));
    }

    let mut header = [0u8; 16];
    reader.read_exact(&mut header)?;
    let program_size = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
    let num_symbols = u32::from_le_bytes(header[4..8].try_into().unwrap());
    let start_address = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64;
    let reserved = u32::from_le_bytes(header[12..16].try_into().unwrap());
    if reserved != 0 {
        return Err(VmError::BadProgramImage(
            "reserved header field must be zero".to_string(),
        ));
    }

    let mut bytecode = vec![0u8; program_size as usize];
    reader.read_exact(&mut bytecode)?;
    let padded_len = align8(bytecode.len() as u64) as usize;
    bytecode.resize(padded_len, HALT);

    let mut symbols = Vec::with_capacity(num_symbols as usize);
    let mut seen_names = HashSet::with_capacity(num_symbols as usize);
    for _ in 0..num_symbols {
        let mut entry_len = [0u8; 1];
        reader.read_exact(&mut entry_len)?;
        let entry_len = entry_len[0] as usize;
        if entry_len < 8 {
            return Err(VmError::BadProgramImage(format!(
                "symbol entry length {entry_len} is shorter than the 8-byte address field"
            )));
        }

        let mut addr_bytes = [0u8; 8];
        reader.read_exact(&mut addr_bytes)?;
        let address = u64::from_le_bytes(addr_bytes);

        let mut name_bytes = vec![0u8; entry_len - 8];
        reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| VmError::BadProgramImage("symbol name is not valid UTF-8".to_string()))?;

        if !seen_names.insert(name.clone()) {
            return Err(VmError::BadProgramImage(format!(
                "duplicate symbol name '{name}'"
            )));
        }
        symbols.push((name, address));
    }

    log::debug!(
        "parsed program image: {} bytecode bytes (padded from {}), {} symbols, start={:#x}",
        bytecode.len(),
        program_size,
        symbols.len(),
        start_address
    );

    Ok(ParsedProgram {
        bytecode,
        start_address,
        symbols,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(program: &[u8], symbols: &[(&str, u64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(program.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // start_address
        buf.extend_from_slice(&0u32.to_le_bytes()); // reserved
        buf.extend_from_slice(program);
        for (name, addr) in symbols {
            buf.push((name.len() + 8) as u8);
            buf.extend_from_slice(&addr.to_le_bytes());
            buf.extend_from_slice(name.as_bytes());
        }
        buf
    }

    #[test]
    fn parses_bytecode_and_pads_with_halt() {
        let raw = image(&[1, 2, 3, 4, 5], &[]);
        let parsed = load_image(&mut raw.as_slice()).unwrap();
        assert_eq!(parsed.bytecode, vec![1, 2, 3, 4, 5, HALT, HALT, HALT]);
    }

    #[test]
    fn parses_symbol_table() {
        let raw = image(&[0u8; 8], &[("main", 0), ("loop", 16)]);
        let parsed = load_image(&mut raw.as_slice()).unwrap();
        assert_eq!(
            parsed.symbols,
            vec![("main".to_string(), 0), ("loop".to_string(), 16)]
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = image(&[0u8; 8], &[]);
        raw[0] = b'X';
        assert!(matches!(
            load_image(&mut raw.as_slice()),
            Err(VmError::BadProgramImage(_))
        ));
    }

    #[test]
    fn rejects_duplicate_symbol_names() {
        let raw = image(&[0u8; 8], &[("dup", 0), ("dup", 8)]);
        assert!(matches!(
            load_image(&mut raw.as_slice()),
            Err(VmError::BadProgramImage(_))
        ));
    }

    #[test]
    fn truncated_image_is_an_io_error() {
        let raw = image(&[0u8; 8], &[("main", 0)]);
        let mut truncated = &raw[..raw.len() - 2];
        assert!(matches!(load_image(&mut truncated), Err(VmError::Io(_))));
    }
}
