//=====================================================
// File: bytecode/disasm.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Human readable listing of compiled programs
// Objective: Print each function with offsets, resolved operands, slot homes
//            and the handler table
//=====================================================

use std::fmt::Write;

use super::spec::{BytecodeError, CompiledProgram, Instruction, Opcode, SlotHome};

pub fn disassemble(program: &CompiledProgram) -> Result<String, BytecodeError> {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "; strata bytecode v{} | {} constants | {} functions | {} words",
        program.version,
        program.constants.len(),
        program.functions.len(),
        program.code.len()
    );
    for (index, function) in program.functions.iter().enumerate() {
        let _ = writeln!(
            out,
            "\nfn #{index} {} (arity {}, captures {}, locals {})",
            function.name, function.arity, function.captures, function.locals
        );
        let registers: Vec<String> = function
            .homes
            .iter()
            .enumerate()
            .filter_map(|(slot, home)| match home {
                SlotHome::Register(r) => Some(format!("s{slot}->r{r}")),
                SlotHome::Local(_) => None,
            })
            .collect();
        if !registers.is_empty() {
            let _ = writeln!(out, "  ; registers {}", registers.join(" "));
        }
        for instruction in program.function_instructions(index)? {
            let _ = writeln!(out, "  {}", render(program, &instruction));
        }
    }
    if !program.handlers.is_empty() {
        let _ = writeln!(out, "\nhandlers:");
        for (index, handler) in program.handlers.iter().enumerate() {
            let catches: Vec<String> = handler
                .catches
                .iter()
                .map(|c| {
                    let class = c
                        .class
                        .and_then(|i| program.classes.get(i as usize))
                        .map_or("*".to_string(), |class| class.name.to_string());
                    format!("{class} -> {:04}", c.target)
                })
                .collect();
            let _ = write!(
                out,
                "  #{index} [{:04}, {:04}) {}",
                handler.start,
                handler.end,
                catches.join(", ")
            );
            if let Some(finally) = handler.finally {
                let _ = write!(out, " finally -> {finally:04}");
            }
            out.push('\n');
        }
    }
    Ok(out)
}

pub fn render(program: &CompiledProgram, instruction: &Instruction<'_>) -> String {
    let a = instruction.operand(0);
    let b = instruction.operand(1);
    let name = |index: u32| {
        program
            .name(index)
            .map_or_else(|| format!("?{index}"), ToString::to_string)
    };
    let function = |index: u32| {
        program
            .functions
            .get(index as usize)
            .map_or_else(|| format!("?{index}"), |f| f.name.to_string())
    };
    let detail = match instruction.opcode {
        Opcode::Push => program
            .constants
            .get(a as usize)
            .map_or_else(|| format!("?{a}"), ToString::to_string),
        Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue => format!("{a:04}"),
        Opcode::LoadVar | Opcode::StoreVar => format!("s{a}"),
        Opcode::LoadReg | Opcode::StoreReg => format!("r{a}"),
        Opcode::LoadGlobal | Opcode::StoreGlobal | Opcode::GetField | Opcode::SetField => name(a),
        Opcode::LoadFunction => function(a),
        Opcode::Call => format!("{} argc={b}", function(a)),
        Opcode::CallNative | Opcode::CallMethod => format!("{} argc={b}", name(a)),
        Opcode::MakeClosure => format!("{} captures={b}", function(a)),
        Opcode::NewObject => program
            .classes
            .get(a as usize)
            .map_or_else(|| format!("?{a}"), |c| c.name.to_string()),
        Opcode::NewStruct => program
            .structs
            .get(a as usize)
            .map_or_else(|| format!("?{a}"), |s| format!("{} fields={b}", s.name)),
        Opcode::CallValue | Opcode::MakeArray => format!("{a}"),
        Opcode::EnterTry => format!("handler #{a}"),
        Opcode::Ext => format!("ext #{a}"),
        _ => String::new(),
    };
    let mnemonic = instruction.opcode.name();
    if detail.is_empty() {
        format!("{:04}  {mnemonic}", instruction.offset)
    } else {
        format!("{:04}  {mnemonic:<13} {detail}", instruction.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::spec::FunctionEntry;
    use crate::runtime::Constant;
    use crate::symbol::Symbol;

    #[test]
    fn listing_resolves_constants() {
        let program = CompiledProgram {
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
        };
        let text = disassemble(&program).expect("listing");
        assert!(text.contains("fn #0 __main__"));
        let push = text
            .lines()
            .find(|line| line.contains("Push"))
            .expect("push line");
        assert!(push.trim_start().starts_with("0000"));
        assert!(push.trim_end().ends_with("14"));
        assert!(text.contains("0002  Return"));
    }
}
