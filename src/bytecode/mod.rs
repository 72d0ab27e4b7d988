//=====================================================
// File: bytecode/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Bytecode format and the bytecode-level optimizer
// Objective: Group the program format, listing, peephole pass and register
//            allocator behind one module
//=====================================================

pub mod disasm;
pub mod peephole;
pub mod register_alloc;
pub mod spec;

pub use disasm::disassemble;
pub use peephole::{PeepholeError, PeepholeStats};
pub use register_alloc::{AllocationReport, Assignment, LiveInterval};
pub use spec::{
    BYTECODE_MAGIC, BYTECODE_VERSION, BytecodeError, CompiledProgram, FunctionEntry, Opcode,
    REGISTER_COUNT, SlotHome,
};
