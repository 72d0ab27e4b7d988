//=====================================================
// File: compiler/asm.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Lower inline assembly blocks
// Objective: Map mnemonics onto opcodes, resolve labels inside the block and
//            reject blocks whose stack effect does not balance
//=====================================================

use std::collections::HashMap;

use tracing::trace;

use super::{CompileError, CompileResult, Compiler, Resolved};
use crate::ast::{AsmItem, AsmLine, AsmOp, AsmOperand, Position};
use crate::bytecode::spec::Opcode;
use crate::runtime::{Constant, native_spec};
use crate::symbol::Symbol;

/// Net stack effect of one lowered mnemonic: (values required, values left).
fn stack_effect(op: AsmOp, call_arity: usize) -> (i32, i32) {
    match op {
        AsmOp::Nop | AsmOp::Jmp => (0, 0),
        AsmOp::Push | AsmOp::Load => (0, 1),
        AsmOp::Pop | AsmOp::Store | AsmOp::Jz | AsmOp::Jnz | AsmOp::Print | AsmOp::Ret => (1, 0),
        AsmOp::Dup => (1, 2),
        AsmOp::Neg | AsmOp::Not => (1, 1),
        AsmOp::Call => (call_arity as i32, 1),
        AsmOp::Add
        | AsmOp::Sub
        | AsmOp::Mul
        | AsmOp::Div
        | AsmOp::Mod
        | AsmOp::Eq
        | AsmOp::Ne
        | AsmOp::Lt
        | AsmOp::Le
        | AsmOp::Gt
        | AsmOp::Ge
        | AsmOp::And
        | AsmOp::Or => (2, 1),
    }
}

fn direct_opcode(op: AsmOp) -> Option<Opcode> {
    Some(match op {
        AsmOp::Nop => Opcode::Nop,
        AsmOp::Pop => Opcode::Pop,
        AsmOp::Dup => Opcode::Dup,
        AsmOp::Add => Opcode::Add,
        AsmOp::Sub => Opcode::Sub,
        AsmOp::Mul => Opcode::Mul,
        AsmOp::Div => Opcode::Div,
        AsmOp::Mod => Opcode::Mod,
        AsmOp::Neg => Opcode::Neg,
        AsmOp::Not => Opcode::Not,
        AsmOp::Eq => Opcode::Eq,
        AsmOp::Ne => Opcode::Ne,
        AsmOp::Lt => Opcode::Lt,
        AsmOp::Le => Opcode::Le,
        AsmOp::Gt => Opcode::Gt,
        AsmOp::Ge => Opcode::Ge,
        AsmOp::And => Opcode::And,
        AsmOp::Or => Opcode::Or,
        _ => return None,
    })
}

/// Abstract stack depth while walking a block. `None` after `jmp`/`ret`
/// until the next label.
struct DepthCheck {
    depth: Option<i32>,
    labels: HashMap<Symbol, i32>,
}

impl DepthCheck {
    fn unbalanced(detail: String, position: Position) -> CompileError {
        CompileError::UnbalancedAssembly { detail, position }
    }

    fn join(&mut self, label: &Symbol, depth: i32, position: Position) -> CompileResult<()> {
        match self.labels.get(label) {
            Some(expected) if *expected != depth => Err(Self::unbalanced(
                format!("label '{label}' reached with depth {depth} and {expected}"),
                position,
            )),
            Some(_) => Ok(()),
            None => {
                self.labels.insert(label.clone(), depth);
                Ok(())
            }
        }
    }

    fn label(&mut self, label: &Symbol, position: Position) -> CompileResult<()> {
        match (self.depth, self.labels.get(label).copied()) {
            (Some(depth), _) => self.join(label, depth, position),
            (None, Some(depth)) => {
                self.depth = Some(depth);
                Ok(())
            }
            // Only reachable through a backward jump not seen yet.
            (None, None) => {
                self.depth = Some(0);
                self.labels.insert(label.clone(), 0);
                Ok(())
            }
        }
    }

    fn apply(&mut self, (pops, pushes): (i32, i32), mnemonic: AsmOp, position: Position) -> CompileResult<()> {
        let Some(depth) = self.depth else {
            return Ok(());
        };
        if depth < pops {
            return Err(Self::unbalanced(
                format!("{mnemonic:?} needs {pops} value(s) but the stack holds {depth}"),
                position,
            ));
        }
        self.depth = Some(depth - pops + pushes);
        Ok(())
    }
}

impl<'a> Compiler<'a> {
    /// Lowers one block of inline assembly.
    pub(super) fn lower_asm(&mut self, items: &'a [AsmItem], position: Position) -> CompileResult<()> {
        let mut check = DepthCheck {
            depth: Some(0),
            labels: HashMap::new(),
        };
        let mut defined: HashMap<Symbol, usize> = HashMap::new();
        let mut fixups: Vec<(Symbol, usize, Position)> = Vec::new();

        for item in items {
            match &item.line {
                AsmLine::Label(label) => {
                    if defined.insert(label.clone(), self.here()).is_some() {
                        return Err(CompileError::DuplicateLabel {
                            label: label.clone(),
                            position: item.position,
                        });
                    }
                    check.label(label, item.position)?;
                }
                AsmLine::Instruction { op, operand } => {
                    self.lower_instruction(*op, operand.as_ref(), item.position, &mut check, &mut fixups)?;
                }
            }
        }

        if let Some(depth) = check.depth {
            if depth != 0 {
                return Err(DepthCheck::unbalanced(
                    format!("block leaves {depth} value(s) on the stack"),
                    position,
                ));
            }
        }
        for (label, operand_at, at) in fixups {
            let Some(target) = defined.get(&label).copied() else {
                return Err(CompileError::UndefinedLabel { label, position: at });
            };
            self.patch(operand_at, target);
        }
        trace!(items = items.len(), "inline assembly lowered");
        Ok(())
    }

    fn lower_instruction(
        &mut self,
        op: AsmOp,
        operand: Option<&'a AsmOperand>,
        position: Position,
        check: &mut DepthCheck,
        fixups: &mut Vec<(Symbol, usize, Position)>,
    ) -> CompileResult<()> {
        let name = match operand {
            Some(AsmOperand::Name(name)) => Some(name),
            _ => None,
        };
        let missing = || CompileError::Unsupported {
            what: format!("{op:?} without its operand"),
            position,
        };

        let mut call_arity = 0;
        match op {
            AsmOp::Push => {
                let Some(AsmOperand::Literal(literal)) = operand else {
                    return Err(missing());
                };
                self.emit_constant(Constant::from_literal(literal));
            }
            AsmOp::Load => {
                let name = name.ok_or_else(missing)?;
                self.load_variable(name, position)?;
            }
            AsmOp::Store => {
                let name = name.ok_or_else(missing)?;
                self.store_asm_name(name, position)?;
            }
            AsmOp::Jmp | AsmOp::Jz | AsmOp::Jnz => {
                let label = name.ok_or_else(missing)?;
                let opcode = match op {
                    AsmOp::Jmp => Opcode::Jump,
                    AsmOp::Jz => Opcode::JumpIfFalse,
                    _ => Opcode::JumpIfTrue,
                };
                check.apply(stack_effect(op, 0), op, position)?;
                if let Some(depth) = check.depth {
                    check.join(label, depth, position)?;
                }
                let operand_at = self.emit_jump(opcode);
                fixups.push((label.clone(), operand_at, position));
                if op == AsmOp::Jmp {
                    check.depth = None;
                }
                return Ok(());
            }
            AsmOp::Call => {
                let target = name.ok_or_else(missing)?;
                match self.resolve(target) {
                    Resolved::Function(index) => {
                        call_arity = usize::from(self.program.functions[index as usize].arity);
                        self.emit(Opcode::Call, &[index, call_arity as u32]);
                    }
                    Resolved::Native => {
                        call_arity = native_spec(target).map_or(0, |spec| spec.min_args);
                        let native = self.name(target);
                        self.emit(Opcode::CallNative, &[native, call_arity as u32]);
                    }
                    Resolved::Slot(_) | Resolved::Global => {
                        return Err(CompileError::UnknownCallTarget {
                            name: target.clone(),
                            position,
                        });
                    }
                }
            }
            AsmOp::Ret => {
                check.apply(stack_effect(op, 0), op, position)?;
                self.unwind_tries(0)?;
                self.emit_op(Opcode::Return);
                check.depth = None;
                return Ok(());
            }
            AsmOp::Print => {
                let println = self.name("println");
                self.emit(Opcode::CallNative, &[println, 1]);
                self.emit_op(Opcode::Pop);
            }
            other => {
                let opcode = direct_opcode(other).ok_or_else(missing)?;
                self.emit_op(opcode);
            }
        }
        check.apply(stack_effect(op, call_arity), op, position)
    }

    /// `store x` into an unknown name creates a global in the main program and
    /// a local elsewhere.
    fn store_asm_name(&mut self, name: &Symbol, position: Position) -> CompileResult<()> {
        let creates_local = matches!(self.resolve(name), Resolved::Global)
            && !self.state.is_main
            && !self.global_names.contains(name);
        if creates_local {
            let slot = self.declare_slot(name, position)?;
            self.emit(Opcode::StoreVar, &[u32::from(slot)]);
            return Ok(());
        }
        self.store_variable(name, position)
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::spec::Opcode;
    use crate::compiler::{CompileError, compile};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;
    use crate::typeck::TypedProgram;

    fn compile_asm(source: &str) -> Result<crate::bytecode::CompiledProgram, CompileError> {
        let parsed = parse_source(source, SyntaxLevel::Assembly);
        assert!(!parsed.diagnostics.has_errors(), "{}", parsed.diagnostics);
        compile(&TypedProgram::unchecked(parsed.program))
    }

    #[test]
    fn counting_loop_lowers_with_resolved_labels() {
        let program = compile_asm(
            "push 0\nstore i\ntop:\nload i\npush 3\nlt\njz done\nload i\nprint\nload i\npush 1\nadd\nstore i\njmp top\ndone:\n",
        )
        .expect("compile");
        assert!(program.validate().is_ok());
        let ops: Vec<Opcode> = program
            .function_instructions(0)
            .expect("decode")
            .iter()
            .map(|i| i.opcode)
            .collect();
        assert!(ops.contains(&Opcode::JumpIfFalse));
        assert!(ops.contains(&Opcode::CallNative));
    }

    #[test]
    fn leftover_values_are_rejected() {
        let err = compile_asm("push 1\npush 2\n").expect_err("unbalanced");
        assert!(matches!(err, CompileError::UnbalancedAssembly { .. }));
    }

    #[test]
    fn popping_an_empty_stack_is_rejected() {
        let err = compile_asm("add\n").expect_err("underflow");
        assert!(matches!(err, CompileError::UnbalancedAssembly { .. }));
    }

    #[test]
    fn undefined_labels_are_reported() {
        let err = compile_asm("jmp nowhere\n").expect_err("label");
        assert!(matches!(err, CompileError::UndefinedLabel { .. }));
    }

    #[test]
    fn ret_ends_the_block() {
        let program = compile_asm("push 7\nret\n").expect("compile");
        let ops: Vec<Opcode> = program
            .function_instructions(0)
            .expect("decode")
            .iter()
            .map(|i| i.opcode)
            .collect();
        assert_eq!(&ops[..2], &[Opcode::Push, Opcode::Return]);
    }
}
