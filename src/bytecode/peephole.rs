//=====================================================
// File: bytecode/peephole.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Peephole rewriting over the flat instruction stream
// Objective: Blank out redundant instruction pairs with NOPs, thread jump
//            chains, then squeeze the NOPs out and remap every code offset
//=====================================================

use std::collections::HashSet;

use thiserror::Error;
use tracing::{debug, instrument, trace};

use super::spec::{BytecodeError, CompiledProgram, Instruction, Opcode, decode};
use crate::runtime::Constant;

#[derive(Debug, Error)]
pub enum PeepholeError {
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error("target {target} of instruction at {offset} no longer lands on the same instruction")]
    TargetMoved { offset: usize, target: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeepholeStats {
    pub rewrites: usize,
    pub removed_words: usize,
}

/// Rewrites every function to a fixed point, then removes the NOPs.
/// Running it on its own output changes nothing.
#[instrument(skip_all)]
pub fn optimize(program: &mut CompiledProgram) -> Result<PeepholeStats, PeepholeError> {
    let mut stats = PeepholeStats::default();
    for index in 0..program.functions.len() {
        loop {
            let changed = rewrite_function(program, index)?;
            if changed == 0 {
                break;
            }
            stats.rewrites += changed;
        }
    }
    stats.removed_words = remove_nops(program)?;
    debug!(
        rewrites = stats.rewrites,
        removed = stats.removed_words,
        "peephole finished"
    );
    Ok(stats)
}

//=====================================================
// Section 1.0 - Pattern rewriting
//=====================================================

/// Instruction view of one function with NOPs skipped.
struct LiveView {
    live: Vec<(usize, Opcode, Vec<u32>)>,
    end: usize,
}

impl LiveView {
    fn build(instructions: &[Instruction<'_>], end: usize) -> Self {
        let live = instructions
            .iter()
            .filter(|i| i.opcode != Opcode::Nop)
            .map(|i| (i.offset, i.opcode, i.operands.to_vec()))
            .collect();
        Self { live, end }
    }

    /// Offset of the first live instruction at or after `offset`.
    fn lands_on(&self, offset: usize) -> usize {
        self.live
            .iter()
            .map(|(at, _, _)| *at)
            .find(|at| *at >= offset)
            .unwrap_or(self.end)
    }

    fn position(&self, offset: usize) -> Option<usize> {
        self.live.iter().position(|(at, _, _)| *at == offset)
    }
}

fn rewrite_function(program: &mut CompiledProgram, index: usize) -> Result<usize, PeepholeError> {
    let function = &program.functions[index];
    let (start, end) = (function.start as usize, function.end as usize);
    let instructions = decode(&program.code, start, end)?;
    let view = LiveView::build(&instructions, end);
    let targets = landing_targets(program, &view, &instructions);

    let mut blanked: HashSet<usize> = HashSet::new();
    let mut retargets: Vec<(usize, u32)> = Vec::new();
    let mut position = 0;
    while position < view.live.len() {
        let (offset, opcode, ref operands) = view.live[position];
        if opcode.is_jump() {
            let target = operands[0] as usize;
            if opcode == Opcode::Jump && jumps_to_next(&view, position, target) {
                blanked.insert(offset);
                position += 1;
                continue;
            }
            if let Some(threaded) = thread_jump(&view, offset, target) {
                retargets.push((offset + 1, threaded));
            }
            position += 1;
            continue;
        }
        let Some((next_offset, next_opcode, _)) = view.live.get(position + 1) else {
            break;
        };
        let paired = match (opcode, *next_opcode) {
            (Opcode::Push, Opcode::Pop)
            | (Opcode::LoadVar, Opcode::Pop)
            | (Opcode::LoadReg, Opcode::Pop)
            | (Opcode::Dup, Opcode::Pop) => true,
            (Opcode::Push, Opcode::Add | Opcode::Sub) => {
                is_int(program, operands[0], 0)
                    && !targets.contains(&offset)
                    && produces_int(program, &view, position)
            }
            (Opcode::Push, Opcode::Mul) => {
                is_int(program, operands[0], 1)
                    && !targets.contains(&offset)
                    && produces_int(program, &view, position)
            }
            _ => false,
        };
        if paired && !targets.contains(next_offset) {
            trace!(offset, first = %opcode, second = %next_opcode, "pair removed");
            blanked.insert(offset);
            blanked.insert(*next_offset);
            position += 2;
            continue;
        }
        position += 1;
    }

    let changes = blanked.len() + retargets.len();
    for (operand_at, target) in retargets {
        program.code[operand_at] = target;
    }
    for offset in blanked {
        let width = Opcode::from_word(program.code[offset])
            .map(Opcode::width)
            .unwrap_or(1);
        for word in &mut program.code[offset..offset + width] {
            *word = Opcode::Nop.word();
        }
    }
    Ok(changes)
}

/// Live offsets that some jump, catch or finally entry lands on.
fn landing_targets(
    program: &CompiledProgram,
    view: &LiveView,
    instructions: &[Instruction<'_>],
) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for instruction in instructions {
        if instruction.opcode.is_jump() {
            targets.insert(view.lands_on(instruction.operand(0) as usize));
        }
        if instruction.opcode == Opcode::EnterTry {
            if let Some(handler) = program.handlers.get(instruction.operand(0) as usize) {
                for catch in &handler.catches {
                    targets.insert(view.lands_on(catch.target as usize));
                }
                if let Some(finally) = handler.finally {
                    targets.insert(view.lands_on(finally as usize));
                }
            }
        }
    }
    targets
}

fn jumps_to_next(view: &LiveView, position: usize, target: usize) -> bool {
    let next = view
        .live
        .get(position + 1)
        .map(|(at, _, _)| *at)
        .unwrap_or(view.end);
    view.lands_on(target) == next
}

/// Final target of a chain of unconditional jumps starting at `target`.
/// Chains that loop back on themselves are left alone.
fn thread_jump(view: &LiveView, origin: usize, target: usize) -> Option<u32> {
    let mut seen = HashSet::from([origin]);
    let mut current = target;
    loop {
        let landed = view.lands_on(current);
        let Some(position) = view.position(landed) else {
            break;
        };
        let (at, opcode, operands) = &view.live[position];
        if *opcode != Opcode::Jump {
            break;
        }
        if !seen.insert(*at) {
            return None;
        }
        current = operands[0] as usize;
    }
    (current != target).then_some(current as u32)
}

fn is_int(program: &CompiledProgram, constant: u32, expected: i64) -> bool {
    matches!(program.constants.get(constant as usize), Some(Constant::Int(n)) if *n == expected)
}

/// Whether the value below a `PUSH c` at `position` is known to be an int,
/// which makes `+ 0`, `- 0` and `* 1` exact identities.
fn produces_int(program: &CompiledProgram, view: &LiveView, position: usize) -> bool {
    let Some(previous) = position.checked_sub(1).and_then(|p| view.live.get(p)) else {
        return false;
    };
    match previous.1 {
        Opcode::Push => matches!(
            program.constants.get(previous.2[0] as usize),
            Some(Constant::Int(_))
        ),
        Opcode::BitAnd
        | Opcode::BitOr
        | Opcode::BitXor
        | Opcode::Shl
        | Opcode::Shr
        | Opcode::BitNot => true,
        _ => false,
    }
}

//=====================================================
// Section 2.0 - NOP removal
//=====================================================

fn remove_nops(program: &mut CompiledProgram) -> Result<usize, PeepholeError> {
    let old_code = program.code.clone();
    let mut kept = vec![true; old_code.len()];
    for function in &program.functions {
        for instruction in decode(&old_code, function.start as usize, function.end as usize)? {
            if instruction.opcode == Opcode::Nop {
                kept[instruction.offset] = false;
            }
        }
    }
    let removed = kept.iter().filter(|k| !**k).count();
    if removed == 0 {
        return Ok(0);
    }

    // map[o] = number of kept words before o; a removed word maps to the
    // next kept one.
    let mut map = Vec::with_capacity(old_code.len() + 1);
    let mut count = 0u32;
    for keep in &kept {
        map.push(count);
        if *keep {
            count += 1;
        }
    }
    map.push(count);

    let mut code = Vec::with_capacity(count as usize);
    for function in &program.functions {
        for instruction in decode(&old_code, function.start as usize, function.end as usize)? {
            if instruction.opcode == Opcode::Nop {
                continue;
            }
            code.push(instruction.opcode.word());
            if instruction.opcode.is_jump() {
                code.push(map[instruction.operand(0) as usize]);
            } else {
                code.extend_from_slice(instruction.operands);
            }
        }
    }

    let remap = |offset: u32| map[offset as usize];
    let bounds: Vec<(u32, u32)> = program.functions.iter().map(|f| (f.start, f.end)).collect();
    for function in &mut program.functions {
        function.start = remap(function.start);
        function.end = remap(function.end);
    }
    for handler in &mut program.handlers {
        handler.start = remap(handler.start);
        handler.end = remap(handler.end);
        for catch in &mut handler.catches {
            catch.target = remap(catch.target);
        }
        handler.finally = handler.finally.map(remap);
    }
    for entry in &mut program.debug {
        entry.offset = remap(entry.offset);
    }
    program.debug.reverse();
    program.debug.sort_by_key(|entry| entry.offset);
    program.debug.dedup_by_key(|entry| entry.offset);

    verify_targets(&old_code, &code, &bounds, &map)?;
    program.code = code;
    Ok(removed)
}

/// Every jump must still land on the instruction it reached before, looking
/// past NOPs in the old stream.
fn verify_targets(
    old: &[u32],
    new: &[u32],
    functions: &[(u32, u32)],
    map: &[u32],
) -> Result<(), PeepholeError> {
    for (start, end) in functions {
        let instructions = decode(old, *start as usize, *end as usize)?;
        let view = LiveView::build(&instructions, *end as usize);
        for instruction in instructions.iter().filter(|i| i.opcode.is_jump()) {
            let target = instruction.operand(0);
            let landed = view.lands_on(target as usize);
            let moved = map[target as usize];
            let same = if landed == *end as usize {
                moved == map[*end as usize]
            } else {
                new.get(moved as usize) == old.get(landed)
            };
            if !same {
                return Err(PeepholeError::TargetMoved {
                    offset: instruction.offset,
                    target,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::spec::{CatchEntry, FunctionEntry, HandlerEntry, SlotHome};
    use crate::symbol::Symbol;

    fn program(constants: Vec<Constant>, code: Vec<u32>) -> CompiledProgram {
        let end = code.len() as u32;
        CompiledProgram {
            constants,
            code,
            functions: vec![FunctionEntry {
                name: Symbol::from("__main__"),
                start: 0,
                end,
                arity: 0,
                captures: 0,
                locals: 1,
                homes: vec![SlotHome::Local(0)],
            }],
            ..CompiledProgram::default()
        }
    }

    fn op(opcode: Opcode) -> u32 {
        opcode.word()
    }

    #[test]
    fn push_pop_pairs_disappear() {
        let mut p = program(
            vec![Constant::Int(5)],
            vec![op(Opcode::Push), 0, op(Opcode::Pop), op(Opcode::Push), 0, op(Opcode::Return)],
        );
        let stats = optimize(&mut p).expect("peephole");
        assert_eq!(stats.removed_words, 3);
        assert_eq!(p.code, vec![op(Opcode::Push), 0, op(Opcode::Return)]);
        assert_eq!(p.functions[0].end, 3);
    }

    #[test]
    fn add_zero_needs_a_known_int() {
        let code = vec![
            op(Opcode::LoadVar), 0,
            op(Opcode::Push), 1,
            op(Opcode::Add),
            op(Opcode::Push), 0,
            op(Opcode::Push), 1,
            op(Opcode::Add),
            op(Opcode::Return),
        ];
        let mut p = program(vec![Constant::Int(3), Constant::Int(0)], code);
        optimize(&mut p).expect("peephole");
        // The variable may hold a string, so only the second `+ 0` goes.
        assert_eq!(
            p.code,
            vec![
                op(Opcode::LoadVar), 0,
                op(Opcode::Push), 1,
                op(Opcode::Add),
                op(Opcode::Push), 0,
                op(Opcode::Return),
            ]
        );
    }

    #[test]
    fn jump_chains_are_threaded() {
        let code = vec![
            op(Opcode::Push), 0,          // 0
            op(Opcode::JumpIfFalse), 7,   // 2
            op(Opcode::Push), 0,          // 4
            op(Opcode::Return),           // 6
            op(Opcode::Jump), 4,          // 7
        ];
        let mut p = program(vec![Constant::Bool(false)], code);
        optimize(&mut p).expect("peephole");
        assert_eq!(p.code[3], 4);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn jump_over_removed_code_becomes_a_fallthrough() {
        let code = vec![
            op(Opcode::Jump), 5,      // 0
            op(Opcode::Push), 0,      // 2
            op(Opcode::Pop),          // 4
            op(Opcode::Push), 0,      // 5
            op(Opcode::Return),       // 7
        ];
        let mut p = program(vec![Constant::Int(1)], code);
        optimize(&mut p).expect("peephole");
        assert_eq!(p.code, vec![op(Opcode::Push), 0, op(Opcode::Return)]);
    }

    #[test]
    fn patterns_with_a_target_inside_are_kept() {
        let code = vec![
            op(Opcode::Push), 0,          // 0
            op(Opcode::JumpIfFalse), 6,   // 2
            op(Opcode::Push), 0,          // 4
            op(Opcode::Pop),              // 6
            op(Opcode::Return),           // 7
        ];
        let mut p = program(vec![Constant::Bool(true)], code);
        optimize(&mut p).expect("peephole");
        assert!(p.code.contains(&op(Opcode::Pop)));
    }

    #[test]
    fn handler_addresses_follow_the_removal() {
        let code = vec![
            op(Opcode::EnterTry), 0,   // 0
            op(Opcode::Push), 0,       // 2
            op(Opcode::Pop),           // 4
            op(Opcode::ExitTry),       // 5
            op(Opcode::Push), 0,       // 6
            op(Opcode::Return),        // 8
            op(Opcode::Pop),           // 9 catch
            op(Opcode::Push), 0,       // 10
            op(Opcode::Return),        // 12
        ];
        let mut p = program(vec![Constant::Null], code);
        p.handlers.push(HandlerEntry {
            start: 2,
            end: 5,
            catches: vec![CatchEntry { class: None, target: 9 }],
            finally: None,
        });
        optimize(&mut p).expect("peephole");
        assert_eq!(p.handlers[0].catches[0].target, 6);
        assert_eq!(p.code[6], op(Opcode::Pop));
        assert!(p.validate().is_ok());
    }

    #[test]
    fn second_run_changes_nothing() {
        let code = vec![
            op(Opcode::Jump), 5,
            op(Opcode::Push), 0,
            op(Opcode::Pop),
            op(Opcode::Dup),
            op(Opcode::Pop),
            op(Opcode::Push), 0,
            op(Opcode::Return),
        ];
        let mut p = program(vec![Constant::Int(2)], code);
        optimize(&mut p).expect("first run");
        let once = p.clone();
        let stats = optimize(&mut p).expect("second run");
        assert_eq!(stats, PeepholeStats::default());
        assert_eq!(p, once);
    }
}
