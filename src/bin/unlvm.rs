//! Thin runner: load an image, step to completion, report the outcome.
//! Not a respecification of the excluded command-line driver or its
//! debugger grammar -- just enough to exercise the library end to end.

use std::fs::File;
use std::process::ExitCode;

use clap::Parser;
use unlvm::{Stdout, VmConfig, VmError};

#[derive(Parser)]
#[command(about = "Run a combinator VM program image to completion")]
struct Args {
    /// Path to a program image (magic "MOO4COWS").
    image: String,

    /// Print a disassembly of the loaded program instead of running it.
    #[arg(long)]
    disassemble: bool,

    /// Maximum heap size in bytes.
    #[arg(long)]
    heap_max: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = VmConfig::default();
    if let Some(heap_max) = args.heap_max {
        config.heap_max = heap_max;
    }

    let mut vm = unlvm::Vm::new(config);
    let mut file = match File::open(&args.image) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("unlvm: cannot open '{}': {e}", args.image);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = vm.load_program(&mut file) {
        eprintln!("unlvm: failed to load '{}': {e}", args.image);
        return ExitCode::FAILURE;
    }

    if args.disassemble {
        print_disassembly(&vm);
        return ExitCode::SUCCESS;
    }

    let mut sink = Stdout;
    loop {
        match vm.step(&mut sink) {
            Ok(()) => continue,
            Err(VmError::Halted) => {
                log::info!("program halted normally at pc {:#x}", vm.pc());
                return ExitCode::SUCCESS;
            }
            Err(VmError::Panic) => {
                eprintln!("unlvm: program panicked at pc {:#x}", vm.pc());
                return ExitCode::FAILURE;
            }
            Err(e) => {
                eprintln!("unlvm: step failed at pc {:#x}: {e}", vm.pc());
                return ExitCode::FAILURE;
            }
        }
    }
}

fn print_disassembly(vm: &unlvm::Vm) {
    use unlvm::vm::disassembler::disassemble_range;
    let program_size = vm.heap().program_size();
    match disassemble_range(vm.heap(), 0, program_size) {
        Ok(instrs) => {
            for instr in instrs {
                match instr.operand {
                    Some(op) => println!("{:#06x}  {:<8} {op}", instr.address, instr.mnemonic),
                    None => println!("{:#06x}  {}", instr.address, instr.mnemonic),
                }
            }
        }
        Err(e) => eprintln!("unlvm: failed to disassemble: {e}"),
    }
}
