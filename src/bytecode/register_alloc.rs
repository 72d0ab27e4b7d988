//=====================================================
// File: bytecode/register_alloc.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Linear-scan register allocation for local slots
// Objective: Compute one live interval per slot, hand out the 16 frame
//            registers in start order and rewrite slot access to registers
//=====================================================

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, instrument, trace};

use super::spec::{BytecodeError, CompiledProgram, Opcode, REGISTER_COUNT, SlotHome, decode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Assignment {
    Register(u8),
    Spill,
}

/// Code range, inclusive on both ends, over which a slot holds a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveInterval {
    pub slot: u16,
    pub start: usize,
    pub end: usize,
    pub assignment: Assignment,
}

impl LiveInterval {
    pub fn overlaps(&self, other: &LiveInterval) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AllocationReport {
    /// Intervals per function, indexed like the function table.
    pub functions: Vec<Vec<LiveInterval>>,
}

impl AllocationReport {
    pub fn spilled(&self) -> usize {
        self.functions
            .iter()
            .flatten()
            .filter(|interval| interval.assignment == Assignment::Spill)
            .count()
    }
}

#[instrument(skip_all)]
pub fn allocate(program: &mut CompiledProgram) -> Result<AllocationReport, BytecodeError> {
    let mut report = AllocationReport::default();
    for index in 0..program.functions.len() {
        let mut intervals = live_intervals(program, index)?;
        linear_scan(&mut intervals);
        rewrite(program, index, &intervals)?;
        report.functions.push(intervals);
    }
    debug!(spilled = report.spilled(), "register allocation finished");
    Ok(report)
}

/// One interval per slot that is touched or pre-filled on entry.
pub fn live_intervals(
    program: &CompiledProgram,
    index: usize,
) -> Result<Vec<LiveInterval>, BytecodeError> {
    let function = &program.functions[index];
    let start = function.start as usize;
    let instructions = decode(&program.code, start, function.end as usize)?;

    let mut ranges: BTreeMap<u16, (usize, usize)> = BTreeMap::new();
    let mut touch = |slot: u16, offset: usize| {
        let range = ranges.entry(slot).or_insert((offset, offset));
        range.0 = range.0.min(offset);
        range.1 = range.1.max(offset);
    };
    for slot in 0..function.arity + function.captures {
        touch(slot, start);
    }
    let mut backward = Vec::new();
    for instruction in &instructions {
        match instruction.opcode {
            Opcode::LoadVar | Opcode::StoreVar => {
                touch(instruction.operand(0) as u16, instruction.offset);
            }
            opcode if opcode.is_jump() => {
                let target = instruction.operand(0) as usize;
                if target <= instruction.offset {
                    backward.push((target, instruction.offset));
                }
            }
            _ => {}
        }
    }

    // A slot used inside a loop body stays live for the whole loop.
    let mut changed = true;
    while changed {
        changed = false;
        for range in ranges.values_mut() {
            for (head, tail) in &backward {
                if range.0 <= *tail && *head <= range.1 {
                    let widened = (range.0.min(*head), range.1.max(*tail));
                    if widened != *range {
                        *range = widened;
                        changed = true;
                    }
                }
            }
        }
    }

    Ok(ranges
        .into_iter()
        .map(|(slot, (start, end))| LiveInterval {
            slot,
            start,
            end,
            assignment: Assignment::Spill,
        })
        .collect())
}

/// Classic linear scan: expire intervals that ended, take a free register,
/// otherwise spill whichever interval ends last.
pub fn linear_scan(intervals: &mut [LiveInterval]) {
    intervals.sort_by_key(|interval| (interval.start, interval.slot));
    let mut free: Vec<u8> = (0..REGISTER_COUNT as u8).rev().collect();
    let mut active: Vec<usize> = Vec::new();
    for current in 0..intervals.len() {
        let start = intervals[current].start;
        active.retain(|&other| {
            if intervals[other].end < start {
                if let Assignment::Register(register) = intervals[other].assignment {
                    free.push(register);
                }
                false
            } else {
                true
            }
        });
        if let Some(register) = free.pop() {
            intervals[current].assignment = Assignment::Register(register);
            active.push(current);
            continue;
        }
        let furthest = active
            .iter()
            .copied()
            .max_by_key(|&other| intervals[other].end);
        match furthest {
            Some(victim) if intervals[victim].end > intervals[current].end => {
                intervals[current].assignment = intervals[victim].assignment;
                intervals[victim].assignment = Assignment::Spill;
                active.retain(|&other| other != victim);
                active.push(current);
                trace!(slot = intervals[victim].slot, "spilled");
            }
            _ => trace!(slot = intervals[current].slot, "spilled"),
        }
    }
}

fn rewrite(
    program: &mut CompiledProgram,
    index: usize,
    intervals: &[LiveInterval],
) -> Result<(), BytecodeError> {
    let function = &program.functions[index];
    let offsets: Vec<(usize, Opcode)> = decode(&program.code, function.start as usize, function.end as usize)?
        .into_iter()
        .filter(|i| matches!(i.opcode, Opcode::LoadVar | Opcode::StoreVar))
        .map(|i| (i.offset, i.opcode))
        .collect();

    let mut homes = program.functions[index].homes.clone();
    for interval in intervals {
        if let Assignment::Register(register) = interval.assignment {
            if let Some(home) = homes.get_mut(interval.slot as usize) {
                *home = SlotHome::Register(register);
            }
        }
    }
    for (offset, opcode) in offsets {
        let slot = program.code[offset + 1] as usize;
        if let Some(SlotHome::Register(register)) = homes.get(slot) {
            program.code[offset] = match opcode {
                Opcode::LoadVar => Opcode::LoadReg.word(),
                _ => Opcode::StoreReg.word(),
            };
            program.code[offset + 1] = u32::from(*register);
        }
    }
    program.functions[index].homes = homes;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(slot: u16, start: usize, end: usize) -> LiveInterval {
        LiveInterval {
            slot,
            start,
            end,
            assignment: Assignment::Spill,
        }
    }

    #[test]
    fn disjoint_intervals_share_a_register() {
        let mut intervals = vec![interval(0, 0, 4), interval(1, 6, 9)];
        linear_scan(&mut intervals);
        assert_eq!(intervals[0].assignment, intervals[1].assignment);
    }

    #[test]
    fn pressure_spills_the_longest_interval() {
        let mut intervals: Vec<LiveInterval> = (0..REGISTER_COUNT as u16)
            .map(|slot| interval(slot, slot as usize, 100))
            .collect();
        intervals.push(interval(99, 50, 60));
        linear_scan(&mut intervals);
        let spilled: Vec<_> = intervals
            .iter()
            .filter(|i| i.assignment == Assignment::Spill)
            .collect();
        assert_eq!(spilled.len(), 1);
        assert_ne!(spilled[0].slot, 99);
        for a in &intervals {
            for b in &intervals {
                if a.slot != b.slot && a.overlaps(b) && a.assignment != Assignment::Spill {
                    assert_ne!(a.assignment, b.assignment);
                }
            }
        }
    }
}
