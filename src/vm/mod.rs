//! The instruction dispatcher and the `Vm` state machine that ties the
//! heap, stacks, garbage collector, and continuation subsystem together
//! (`spec.md` §2, §4.3).

pub mod closures;
pub mod continuation;
pub mod disassembler;
pub mod instructions;

use std::io::Read;

use crate::config::VmConfig;
use crate::error::{VmError, VmResult};
use crate::gc::{self, GcFault, GcStats};
use crate::loader;
use crate::memory::Heap;
use crate::stack::{AddressStack, CallStack, Frame};
use crate::symtab::SymbolTable;
use instructions::*;

/// `spec.md` §4.3's state machine: `NoProgram -> Ready <-> Halted/Panic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    NoProgram,
    Ready,
    Halted,
    Panic,
}

/// Where PRINT's output bytes go. A real driver wires this to stdout; tests
/// wire it to an in-memory buffer so output is assertable without capturing
/// a process stream.
pub trait ByteSink {
    fn write_byte(&mut self, byte: u8) -> VmResult<()>;
}

impl ByteSink for Vec<u8> {
    fn write_byte(&mut self, byte: u8) -> VmResult<()> {
        self.push(byte);
        Ok(())
    }
}

/// Writes to the process's standard output, one byte at a time, matching
/// PRINT's single-byte synchronous semantics (`spec.md` §5).
pub struct Stdout;

impl ByteSink for Stdout {
    fn write_byte(&mut self, byte: u8) -> VmResult<()> {
        use std::io::Write;
        std::io::stdout().write_all(&[byte]).map_err(VmError::from)
    }
}

pub struct Vm {
    heap: Heap,
    address_stack: AddressStack,
    call_stack: CallStack,
    pc: u64,
    state: VmState,
    symbols: SymbolTable,
    gc_faults: Vec<GcFault>,
}

impl Vm {
    pub fn new(config: VmConfig) -> Vm {
        Vm {
            heap: Heap::new(config.heap_initial, config.heap_max),
            address_stack: AddressStack::new(config.address_stack_initial, config.address_stack_max),
            call_stack: CallStack::new(config.call_stack_initial, config.call_stack_max),
            pc: 0,
            state: VmState::NoProgram,
            symbols: SymbolTable::new(),
            gc_faults: Vec::new(),
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn address_stack(&self) -> &AddressStack {
        &self.address_stack
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// GC invariant violations accumulated since the VM was created or last
    /// drained, each reported during collection rather than aborting it
    /// (`spec.md` §4.6, §7).
    pub fn take_gc_faults(&mut self) -> Vec<GcFault> {
        std::mem::take(&mut self.gc_faults)
    }

    /// Load a program image (`spec.md` §4.7). Fails with
    /// `ProgramAlreadyLoaded` unless the VM is freshly constructed.
    pub fn load_program<R: Read>(&mut self, reader: &mut R) -> VmResult<()> {
        if self.state != VmState::NoProgram {
            return Err(VmError::ProgramAlreadyLoaded);
        }

        let parsed = loader::load_image(reader)?;
        self.heap.reserve_program(parsed.bytecode.len() as u64)?;
        self.heap.write_bytes(0, &parsed.bytecode)?;

        for (name, address) in parsed.symbols {
            if !self.symbols.insert(name.clone(), address) {
                return Err(VmError::BadProgramImage(format!(
                    "duplicate symbol name '{name}'"
                )));
            }
        }

        self.pc = parsed.start_address;
        self.state = VmState::Ready;
        log::info!("program loaded, start address {:#x}", self.pc);
        Ok(())
    }

    /// Execute exactly one instruction (`spec.md` §4.3, §5). Stepping in a
    /// terminal state returns the corresponding error without side effects.
    pub fn step(&mut self, sink: &mut dyn ByteSink) -> VmResult<()> {
        match self.state {
            VmState::NoProgram => return Err(VmError::NoProgram),
            VmState::Halted => return Err(VmError::Halted),
            VmState::Panic => return Err(VmError::Panic),
            VmState::Ready => {}
        }

        let opcode = self.heap.read_u8(self.pc)?;
        let size = instruction_size(opcode).ok_or(VmError::IllegalInstruction(opcode))? as u64;

        match opcode {
            PANIC => {
                self.state = VmState::Panic;
                return Err(VmError::Panic);
            }
            PUSH => {
                let value = self.heap.read_u64(self.pc + 1)?;
                self.address_stack.push(value)?;
                self.pc += size;
            }
            POP => {
                self.address_stack.pop()?;
                self.pc += size;
            }
            SWAP => {
                self.address_stack.swap_top()?;
                self.pc += size;
            }
            DUP => {
                self.address_stack.dup_top()?;
                self.pc += size;
            }
            PCALL => {
                let target = self.address_stack.pop()?;
                if !self.heap.is_valid_address(target) {
                    // Roll back: the popped value still belongs on the stack.
                    let _ = self.address_stack.push(target);
                    return Err(VmError::IllegalAddress(target));
                }
                let return_address = self.pc + size;
                if let Err(e) = self.call_stack.push(Frame {
                    block_entry: target,
                    return_address,
                }) {
                    let _ = self.address_stack.push(target);
                    return Err(e);
                }
                self.pc = target;
            }
            RET => {
                let frame = self.call_stack.pop()?;
                self.pc = frame.return_address;
            }
            MKK | MKS0 | MKS1 | MKS2 | MKD => {
                self.make_closure(opcode)?;
                self.pc += size;
            }
            MKC => {
                self.make_continuation()?;
                self.pc += size;
            }
            SAVE => {
                let k = self.heap.read_u8(self.pc + 1)? as u64;
                let handle = self.allocate_with_gc(|vm| {
                    continuation::save(&mut vm.heap, &vm.call_stack, &vm.address_stack, k)
                })?;
                self.address_stack.push(handle)?;
                self.pc += size;
            }
            RESTORE => {
                let k = self.heap.read_u8(self.pc + 1)? as u64;
                continuation::restore(&self.heap, &mut self.call_stack, &mut self.address_stack, k)?;
                self.pc += size;
            }
            PRINT => {
                let byte = self.heap.read_u8(self.pc + 1)?;
                sink.write_byte(byte)?;
                self.pc += size;
            }
            HALT => {
                self.state = VmState::Halted;
                return Err(VmError::Halted);
            }
            _ => return Err(VmError::IllegalInstruction(opcode)),
        }

        Ok(())
    }

    fn make_closure(&mut self, opcode: u8) -> VmResult<()> {
        // Peek (never pop) first: the captured values must stay reachable
        // from the address stack in case allocating the block triggers a
        // GC pass (`spec.md` §4.4, §9).
        let spec = closures::spec_for(opcode).expect("opcode already matched as a closure builder");

        let (block_handle, template) = self.allocate_with_gc(|vm: &mut Vm| -> VmResult<(u64, Vec<u8>)> {
            let captures = captures_for(vm, opcode)?;
            let template = closures::build(opcode, &captures);
            let handle = vm.heap.allocate_code(template.len() as u64)?;
            Ok((handle, template))
        })?;
        self.heap.write_bytes(block_handle, &template)?;

        for _ in 0..spec.captures {
            self.address_stack.pop()?;
        }
        self.address_stack.push(block_handle)?;
        Ok(())
    }

    fn make_continuation(&mut self) -> VmResult<()> {
        let state_handle = self.address_stack.peek(0)?;
        let template = closures::build(MKC, &[state_handle]);

        let block_handle = self.allocate_with_gc(|vm| vm.heap.allocate_code(template.len() as u64))?;
        self.heap.write_bytes(block_handle, &template)?;

        self.address_stack.pop()?;
        self.address_stack.push(block_handle)?;
        Ok(())
    }

    /// Run `f`, and on `OutOfMemory`, collect garbage and retry; if still
    /// short, grow the heap and retry, repeating until success, a non-OOM
    /// error, or `grow` itself fails (`spec.md` §4.6).
    fn allocate_with_gc<T>(&mut self, mut f: impl FnMut(&mut Vm) -> VmResult<T>) -> VmResult<T> {
        loop {
            match f(self) {
                Ok(v) => return Ok(v),
                Err(VmError::OutOfMemory) => {
                    let stats = self.collect_garbage();
                    log::debug!(
                        "GC reclaimed {} blocks / {} bytes",
                        stats.blocks_freed,
                        stats.bytes_reclaimed
                    );
                    if stats.bytes_reclaimed > 0 {
                        continue;
                    }
                    self.heap.grow()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the collector with the default fault policy (`spec.md` §7:
    /// "collection continues best-effort"): every invariant violation is
    /// logged at `error!` and recorded for the driver to inspect, but never
    /// aborts the sweep.
    fn collect_garbage(&mut self) -> GcStats {
        let faults = &mut self.gc_faults;
        let mut on_fault = |f: GcFault| {
            log::error!("GC invariant violation: {f:?}");
            faults.push(f);
        };
        gc::collect(&mut self.heap, &self.call_stack, &self.address_stack, &mut on_fault)
    }
}

/// Re-reads the top `spec.captures` address-stack values for `opcode`.
/// Exists only so `make_closure`'s GC-retry closure can re-derive the
/// captured values after a retry rather than capturing a stale `Vec`
/// across a call that might itself trigger GC and shuffle nothing (the
/// address stack itself is never touched by allocation) -- kept anyway
/// because `allocate_with_gc`'s closure must be retryable with no
/// assumptions about what ran before it.
fn captures_for(vm: &Vm, opcode: u8) -> VmResult<Vec<u64>> {
    let spec = closures::spec_for(opcode).expect("opcode already matched as a closure builder");
    let mut captures = Vec::with_capacity(spec.captures as usize);
    for n in 0..spec.captures as u64 {
        captures.push(vm.address_stack.peek(n)?);
    }
    Ok(captures)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_vm(bytecode: &[u8]) -> Vm {
        let mut image = Vec::new();
        image.extend_from_slice(b"MOO4COWS");
        image.extend_from_slice(&(bytecode.len() as u32).to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(bytecode);

        let mut vm = Vm::new(VmConfig::default());
        vm.load_program(&mut image.as_slice()).unwrap();
        vm
    }

    #[test]
    fn push_pop_halt_scenario() {
        let mut code = vec![PUSH];
        code.extend_from_slice(&0xDEADBEEFFEEDBEADu64.to_le_bytes());
        code.push(POP);
        code.push(HALT);
        let mut vm = loaded_vm(&code);
        let mut sink = Vec::new();

        vm.step(&mut sink).unwrap();
        assert_eq!(vm.address_stack().peek(0).unwrap(), 0xDEADBEEFFEEDBEAD);
        assert_eq!(vm.pc(), 9);

        vm.step(&mut sink).unwrap();
        assert!(vm.address_stack().is_empty());
        assert_eq!(vm.pc(), 10);

        assert!(matches!(vm.step(&mut sink), Err(VmError::Halted)));
        assert_eq!(vm.state(), VmState::Halted);
    }

    #[test]
    fn pcall_pushes_a_frame_and_jumps() {
        // Program region big enough that address 520 is a valid jump target.
        let mut code = vec![PUSH];
        code.extend_from_slice(&520u64.to_le_bytes());
        code.push(PCALL);
        while code.len() < 521 {
            code.push(HALT);
        }
        let mut vm = loaded_vm(&code);
        let mut sink = Vec::new();

        vm.step(&mut sink).unwrap(); // PUSH
        vm.step(&mut sink).unwrap(); // PCALL
        assert_eq!(vm.pc(), 520);
        assert_eq!(vm.call_stack().frames().next().unwrap().block_entry, 520);
        assert_eq!(vm.call_stack().frames().next().unwrap().return_address, 10);
        assert!(vm.address_stack().is_empty());
    }

    #[test]
    fn mkk_builds_the_documented_template() {
        let mut code = vec![PUSH];
        code.extend_from_slice(&17u64.to_le_bytes());
        code.push(MKK);
        code.push(HALT);
        let mut vm = loaded_vm(&code);
        let mut sink = Vec::new();

        vm.step(&mut sink).unwrap(); // PUSH 17
        vm.step(&mut sink).unwrap(); // MKK

        let handle = vm.address_stack().peek(0).unwrap();
        let block = vm.heap().slice(handle, 12).unwrap();
        assert_eq!(
            block,
            &[0x05, 0x02, 0x01, 0x11, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x06]
        );
    }

    #[test]
    fn print_writes_bytes_to_the_sink() {
        let code = vec![PRINT, b'!', HALT];
        let mut vm = loaded_vm(&code);
        let mut sink = Vec::new();
        vm.step(&mut sink).unwrap();
        assert_eq!(sink, vec![b'!']);
    }

    #[test]
    fn stepping_a_halted_vm_errors() {
        let code = vec![HALT];
        let mut vm = loaded_vm(&code);
        let mut sink = Vec::new();
        assert!(matches!(vm.step(&mut sink), Err(VmError::Halted)));
        assert!(matches!(vm.step(&mut sink), Err(VmError::Halted)));
    }

    #[test]
    fn double_load_is_rejected() {
        let mut vm = loaded_vm(&[HALT]);
        let mut image = Vec::new();
        image.extend_from_slice(b"MOO4COWS");
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.push(HALT);
        assert!(matches!(
            vm.load_program(&mut image.as_slice()),
            Err(VmError::ProgramAlreadyLoaded)
        ));
    }
}
