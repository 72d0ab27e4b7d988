//=====================================================
// File: bin/strata_disasm.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Standalone bytecode disassembler
// Objective: Print the function table and instruction listing of a
//            compiled .stbc file
//=====================================================

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use strata::bytecode::{CompiledProgram, disassemble};

fn main() -> Result<()> {
    let input = env::args()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: strata_disasm FILE.stbc"))?;
    let program = CompiledProgram::load(&input).with_context(|| format!("failed to load {}", input.display()))?;

    for (index, function) in program.functions.iter().enumerate() {
        println!(
            "function {}: {} (arity {}, captures {}, locals {}, words {}..{})",
            index, function.name, function.arity, function.captures, function.locals, function.start, function.end
        );
    }
    println!();
    print!("{}", disassemble(&program)?);
    Ok(())
}
