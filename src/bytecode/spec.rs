//=====================================================
// File: bytecode/spec.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Strata bytecode format
// Objective: Closed opcode set, the compiled program with its side tables,
//            structural validation and the versioned `.stbc` file form
//=====================================================

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::Constant;
use crate::symbol::Symbol;

pub const BYTECODE_MAGIC: &[u8; 4] = b"STBC";
pub const BYTECODE_VERSION: u32 = 1;
/// Registers available to every call frame.
pub const REGISTER_COUNT: usize = 16;

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid bytecode magic")]
    InvalidMagic,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bytecode encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid opcode {word} at offset {offset}")]
    InvalidOpcode { offset: usize, word: u32 },
    #[error("instruction at offset {offset} is truncated")]
    Truncated { offset: usize },
    #[error("{what} index {index} out of range at offset {offset}")]
    BadOperand {
        offset: usize,
        what: &'static str,
        index: u32,
    },
    #[error("jump target {target} at offset {offset} is not an instruction of the same function")]
    BadJumpTarget { offset: usize, target: u32 },
    #[error("function '{name}' has an invalid code range")]
    BadFunction { name: String },
}

macro_rules! opcodes {
    ($($name:ident = $operands:expr),* $(,)?) => {
        /// Instruction opcodes. Each one is followed by a fixed number of
        /// operand words in the code stream.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn operand_count(self) -> usize {
                match self {
                    $(Opcode::$name => $operands),*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0,
    Push = 1,
    Pop = 0,
    Dup = 0,
    Add = 0,
    Sub = 0,
    Mul = 0,
    Div = 0,
    Mod = 0,
    Neg = 0,
    Not = 0,
    BitNot = 0,
    Eq = 0,
    Ne = 0,
    Lt = 0,
    Le = 0,
    Gt = 0,
    Ge = 0,
    And = 0,
    Or = 0,
    BitAnd = 0,
    BitOr = 0,
    BitXor = 0,
    Shl = 0,
    Shr = 0,
    Jump = 1,
    JumpIfFalse = 1,
    JumpIfTrue = 1,
    LoadVar = 1,
    StoreVar = 1,
    LoadReg = 1,
    StoreReg = 1,
    LoadGlobal = 1,
    StoreGlobal = 1,
    LoadFunction = 1,
    Call = 2,
    CallNative = 2,
    CallValue = 1,
    CallMethod = 2,
    Return = 0,
    MakeClosure = 2,
    EnterTry = 1,
    ExitTry = 0,
    Throw = 0,
    NewObject = 1,
    NewStruct = 2,
    GetField = 1,
    SetField = 1,
    MakeArray = 1,
    Index = 0,
    StoreIndex = 0,
    Box = 0,
    Deref = 0,
    StoreDeref = 0,
    Ext = 1,
    Halt = 0,
}

impl Opcode {
    pub fn from_word(word: u32) -> Option<Opcode> {
        Opcode::ALL.get(usize::try_from(word).ok()?).copied()
    }

    pub fn word(self) -> u32 {
        self as u32
    }

    /// Opcodes whose single operand is an absolute code offset.
    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue)
    }

    pub fn width(self) -> usize {
        1 + self.operand_count()
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a local slot lives at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotHome {
    Local(u16),
    Register(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEntry {
    pub name: Symbol,
    /// First code word of the function.
    pub start: u32,
    /// One past the last code word.
    pub end: u32,
    /// Parameters, including `self` for methods.
    pub arity: u16,
    pub captures: u16,
    /// Total local slots: parameters, captures, then block locals.
    pub locals: u16,
    /// Home of every slot. Arguments and captures are placed here on entry.
    pub homes: Vec<SlotHome>,
}

impl FunctionEntry {
    pub fn contains(&self, offset: usize) -> bool {
        (self.start as usize..self.end as usize).contains(&offset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub name: Symbol,
    pub parent: Option<u32>,
    pub interfaces: Vec<u32>,
    /// Field names, inherited fields first.
    pub fields: Vec<Symbol>,
    /// Methods declared by this class. Lookup walks the parent chain.
    pub methods: Vec<(Symbol, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceEntry {
    pub name: Symbol,
    pub methods: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructEntry {
    pub name: Symbol,
    pub fields: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumEntry {
    pub name: Symbol,
    pub variants: Vec<Symbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchEntry {
    /// `None` catches every thrown value.
    pub class: Option<u32>,
    pub target: u32,
}

/// One `try` region. `ENTER_TRY` names the entry by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerEntry {
    pub start: u32,
    pub end: u32,
    pub catches: Vec<CatchEntry>,
    /// Runs the finally block with the exception on the stack, then rethrows.
    pub finally: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub offset: u32,
    pub line: u32,
    pub column: u32,
    pub function: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredSymbol {
    pub name: Symbol,
    pub kind: String,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledProgram {
    pub version: u32,
    pub constants: Vec<Constant>,
    /// Global, field, method and native names referenced by operands.
    pub names: Vec<Symbol>,
    pub code: Vec<u32>,
    pub functions: Vec<FunctionEntry>,
    pub classes: Vec<ClassEntry>,
    pub interfaces: Vec<InterfaceEntry>,
    pub structs: Vec<StructEntry>,
    pub enums: Vec<EnumEntry>,
    pub handlers: Vec<HandlerEntry>,
    pub debug: Vec<DebugEntry>,
    pub symbols: Vec<DeclaredSymbol>,
}

/// Decoded view of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: &'a [u32],
}

impl Instruction<'_> {
    pub fn operand(&self, index: usize) -> u32 {
        self.operands.get(index).copied().unwrap_or_default()
    }

    pub fn next_offset(&self) -> usize {
        self.offset + self.opcode.width()
    }
}

/// Decodes `code[range]` one instruction at a time.
pub fn decode(code: &[u32], start: usize, end: usize) -> Result<Vec<Instruction<'_>>, BytecodeError> {
    let mut instructions = Vec::new();
    let mut offset = start;
    while offset < end {
        let word = code[offset];
        let opcode = Opcode::from_word(word).ok_or(BytecodeError::InvalidOpcode { offset, word })?;
        let next = offset + opcode.width();
        if next > end {
            return Err(BytecodeError::Truncated { offset });
        }
        instructions.push(Instruction {
            offset,
            opcode,
            operands: &code[offset + 1..next],
        });
        offset = next;
    }
    Ok(instructions)
}

impl Default for CompiledProgram {
    fn default() -> Self {
        Self {
            version: BYTECODE_VERSION,
            constants: Vec::new(),
            names: Vec::new(),
            code: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
            interfaces: Vec::new(),
            structs: Vec::new(),
            enums: Vec::new(),
            handlers: Vec::new(),
            debug: Vec::new(),
            symbols: Vec::new(),
        }
    }
}

impl CompiledProgram {
    pub fn function_instructions(&self, index: usize) -> Result<Vec<Instruction<'_>>, BytecodeError> {
        let function = self
            .functions
            .get(index)
            .ok_or(BytecodeError::BadOperand {
                offset: 0,
                what: "function",
                index: index as u32,
            })?;
        decode(&self.code, function.start as usize, function.end as usize)
    }

    pub fn function_at(&self, offset: usize) -> Option<usize> {
        self.functions.iter().position(|f| f.contains(offset))
    }

    pub fn name(&self, index: u32) -> Option<&Symbol> {
        self.names.get(index as usize)
    }

    /// Closest debug entry at or before `offset`.
    pub fn debug_at(&self, offset: usize) -> Option<&DebugEntry> {
        self.debug
            .iter()
            .filter(|entry| entry.offset as usize <= offset)
            .max_by_key(|entry| entry.offset)
    }

    pub fn class_index(&self, name: &str) -> Option<u32> {
        self.classes
            .iter()
            .position(|class| class.name.as_str() == name)
            .map(|index| index as u32)
    }

    /// Resolves a method through the class chain.
    pub fn find_method(&self, class: u32, method: &str) -> Option<u32> {
        let mut current = Some(class);
        while let Some(index) = current {
            let entry = self.classes.get(index as usize)?;
            if let Some((_, function)) = entry.methods.iter().find(|(name, _)| name.as_str() == method) {
                return Some(*function);
            }
            current = entry.parent;
        }
        None
    }

    /// True when `class` is `ancestor` or derives from it.
    pub fn is_subclass(&self, class: u32, ancestor: u32) -> bool {
        let mut current = Some(class);
        while let Some(index) = current {
            if index == ancestor {
                return true;
            }
            current = self.classes.get(index as usize).and_then(|entry| entry.parent);
        }
        false
    }

    /// Checks that every operand indexes a valid table entry and every code
    /// target lands on an instruction boundary of its own function.
    pub fn validate(&self) -> Result<(), BytecodeError> {
        if self.version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(self.version));
        }
        for function in &self.functions {
            if function.start > function.end
                || function.end as usize > self.code.len()
                || function.homes.len() != function.locals as usize
                || u32::from(function.arity) + u32::from(function.captures) > u32::from(function.locals)
            {
                return Err(BytecodeError::BadFunction {
                    name: function.name.to_string(),
                });
            }
        }
        for (index, function) in self.functions.iter().enumerate() {
            let instructions = self.function_instructions(index)?;
            let boundaries: std::collections::HashSet<usize> =
                instructions.iter().map(|i| i.offset).collect();
            let in_function = |target: u32| {
                boundaries.contains(&(target as usize)) || target == function.end
            };
            for instruction in &instructions {
                self.validate_operands(instruction, function)?;
                if instruction.opcode.is_jump() && !in_function(instruction.operand(0)) {
                    return Err(BytecodeError::BadJumpTarget {
                        offset: instruction.offset,
                        target: instruction.operand(0),
                    });
                }
                if instruction.opcode == Opcode::EnterTry {
                    let handler = &self.handlers[instruction.operand(0) as usize];
                    let targets = handler
                        .catches
                        .iter()
                        .map(|c| c.target)
                        .chain(handler.finally);
                    for target in targets {
                        if !in_function(target) {
                            return Err(BytecodeError::BadJumpTarget {
                                offset: instruction.offset,
                                target,
                            });
                        }
                    }
                }
            }
        }
        for class in &self.classes {
            for (_, function) in &class.methods {
                if *function as usize >= self.functions.len() {
                    return Err(BytecodeError::BadOperand {
                        offset: 0,
                        what: "method",
                        index: *function,
                    });
                }
            }
        }
        Ok(())
    }

    fn validate_operands(
        &self,
        instruction: &Instruction<'_>,
        function: &FunctionEntry,
    ) -> Result<(), BytecodeError> {
        let check = |what: &'static str, index: u32, len: usize| {
            if (index as usize) < len {
                Ok(())
            } else {
                Err(BytecodeError::BadOperand {
                    offset: instruction.offset,
                    what,
                    index,
                })
            }
        };
        let a = instruction.operand(0);
        match instruction.opcode {
            Opcode::Push => check("constant", a, self.constants.len()),
            Opcode::LoadVar | Opcode::StoreVar => check("local", a, function.locals as usize),
            Opcode::LoadReg | Opcode::StoreReg => check("register", a, REGISTER_COUNT),
            Opcode::LoadGlobal
            | Opcode::StoreGlobal
            | Opcode::GetField
            | Opcode::SetField
            | Opcode::CallNative
            | Opcode::CallMethod => check("name", a, self.names.len()),
            Opcode::LoadFunction | Opcode::Call | Opcode::MakeClosure => {
                check("function", a, self.functions.len())
            }
            Opcode::EnterTry => check("handler", a, self.handlers.len()),
            Opcode::NewObject => check("class", a, self.classes.len()),
            Opcode::NewStruct => check("struct", a, self.structs.len()),
            _ => Ok(()),
        }
    }

    //=====================================================
    // Section 2.0 - File form
    //=====================================================

    pub fn encode<W: Write>(&self, mut writer: W) -> Result<(), BytecodeError> {
        writer.write_all(BYTECODE_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        let body = bincode::serialize(self)?;
        writer.write_all(&body)?;
        Ok(())
    }

    pub fn decode<R: Read>(mut reader: R) -> Result<Self, BytecodeError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != BYTECODE_MAGIC {
            return Err(BytecodeError::InvalidMagic);
        }
        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != BYTECODE_VERSION {
            return Err(BytecodeError::UnsupportedVersion(version));
        }
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        let program: CompiledProgram = bincode::deserialize(&body)?;
        program.validate()?;
        Ok(program)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BytecodeError> {
        let mut buffer = Vec::new();
        self.encode(&mut buffer)?;
        Ok(buffer)
    }

    pub fn save(&self, path: &Path) -> Result<(), BytecodeError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, BytecodeError> {
        let bytes = fs::read(path)?;
        Self::decode(bytes.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_program() -> CompiledProgram {
        CompiledProgram {
            constants: vec![Constant::Int(14)],
            code: vec![Opcode::Push.word(), 0, Opcode::Return.word()],
            functions: vec![FunctionEntry {
                name: Symbol::from("__main__"),
                start: 0,
                end: 3,
                arity: 0,
                captures: 0,
                locals: 0,
                homes: Vec::new(),
            }],
            ..CompiledProgram::default()
        }
    }

    #[test]
    fn opcode_words_round_trip() {
        for opcode in Opcode::ALL {
            assert_eq!(Opcode::from_word(opcode.word()), Some(*opcode));
        }
        assert_eq!(Opcode::from_word(Opcode::ALL.len() as u32), None);
    }

    #[test]
    fn validation_rejects_out_of_range_operands() {
        let mut program = tiny_program();
        assert!(program.validate().is_ok());
        program.code[1] = 5;
        assert!(matches!(
            program.validate(),
            Err(BytecodeError::BadOperand { what: "constant", .. })
        ));
    }

    #[test]
    fn validation_rejects_mid_instruction_jumps() {
        let mut program = tiny_program();
        program.code = vec![Opcode::Jump.word(), 1, Opcode::Return.word()];
        program.constants.clear();
        assert!(matches!(
            program.validate(),
            Err(BytecodeError::BadJumpTarget { target: 1, .. })
        ));
    }

    #[test]
    fn file_form_checks_magic_and_version() {
        let program = tiny_program();
        let bytes = program.to_bytes().expect("encode");
        assert_eq!(&bytes[..4], BYTECODE_MAGIC);
        assert_eq!(CompiledProgram::decode(bytes.as_slice()).expect("decode"), program);

        let mut wrong_version = bytes.clone();
        wrong_version[4] = 9;
        assert!(matches!(
            CompiledProgram::decode(wrong_version.as_slice()),
            Err(BytecodeError::UnsupportedVersion(9))
        ));
        assert!(matches!(
            CompiledProgram::decode(&b"NOPE\x01\x00\x00\x00"[..]),
            Err(BytecodeError::InvalidMagic)
        ));
    }
}
