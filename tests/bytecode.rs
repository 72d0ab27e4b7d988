// Strata bytecode tests: peephole, register allocation and the file form
// Covers: idempotent peephole, interval/register invariants, .stbc round trip

use strata::bytecode::register_alloc::{self, Assignment};
use strata::bytecode::{BytecodeError, CompiledProgram, Opcode, SlotHome, disassemble, peephole};
use strata::config::{GcConfig, OptimizerConfig, StrataConfig};
use strata::{Pipeline, Value, Vm};

const PROGRAM: &str = r#"
fn fib(n) {
    let a = 0;
    let b = 1;
    let i = 0;
    while i < n {
        let next = a + b;
        a = b;
        b = next;
        i = i + 1;
    }
    return a;
}
fn describe(x) {
    x;
    if x > 10 { return "big"; }
    return "small";
}
fib(int("20")) + len(describe(int("3")))
"#;

fn config(peephole: bool, registers: bool) -> StrataConfig {
    StrataConfig {
        optimizer: OptimizerConfig {
            peephole,
            register_allocation: registers,
            ..OptimizerConfig::default()
        },
        gc: GcConfig {
            background: false,
            ..GcConfig::default()
        },
        ..StrataConfig::default()
    }
}

fn compile(peephole: bool, registers: bool) -> CompiledProgram {
    Pipeline::new(config(peephole, registers))
        .compile(PROGRAM)
        .expect("compile")
}

fn function_index(program: &CompiledProgram, name: &str) -> usize {
    program
        .functions
        .iter()
        .position(|function| function.name.as_str() == name)
        .expect("function")
}

#[test]
fn peephole_is_idempotent() {
    let mut program = compile(true, false);
    let before = program.clone();
    let stats = peephole::optimize(&mut program).expect("second pass");
    assert_eq!(stats.rewrites, 0);
    assert_eq!(stats.removed_words, 0);
    assert_eq!(program, before);
}

#[test]
fn peephole_removes_identities_and_keeps_behavior() {
    let raw = compile(false, false);
    let optimized = compile(true, false);
    assert!(optimized.code.len() < raw.code.len());
    let pops = |program: &CompiledProgram| {
        program
            .function_instructions(function_index(program, "describe"))
            .expect("decode")
            .iter()
            .filter(|i| i.opcode == Opcode::Pop)
            .count()
    };
    assert_eq!(pops(&raw), 1);
    assert_eq!(pops(&optimized), 0);

    let config = config(true, false);
    let slow = Vm::new(raw, &config).run().expect("raw run");
    let fast = Vm::new(optimized, &config).run().expect("optimized run");
    assert_eq!(slow, fast);
    assert_eq!(fast, Value::Int(6765 + 5));
}

#[test]
fn overlapping_intervals_never_share_a_register() {
    let mut locals = String::new();
    let mut sum = String::from("0");
    for i in 0..24 {
        locals.push_str(&format!("let v{i} = n + {i};\n"));
        sum.push_str(&format!(" + v{i}"));
    }
    let source = format!("fn wide(n) {{\n{locals}return {sum};\n}}\nwide(int(\"1\"))");
    let mut program = Pipeline::new(config(true, false))
        .compile(&source)
        .expect("compile");
    let report = register_alloc::allocate(&mut program).expect("allocate");
    let intervals = &report.functions[function_index(&program, "wide")];
    assert!(report.spilled() > 0, "25 simultaneously live slots must spill");
    for (i, a) in intervals.iter().enumerate() {
        for b in &intervals[i + 1..] {
            if let (Assignment::Register(ra), Assignment::Register(rb)) = (a.assignment, b.assignment) {
                assert!(!(a.overlaps(b) && ra == rb), "{a:?} and {b:?} share r{ra}");
            }
        }
    }
    let config = config(true, false);
    let expected = (0..24).map(|i| 1 + i).sum::<i64>();
    assert_eq!(Vm::new(program, &config).run().expect("run"), Value::Int(expected));
}

#[test]
fn small_functions_live_entirely_in_registers() {
    let program = compile(true, true);
    let index = function_index(&program, "fib");
    let ops: Vec<Opcode> = program
        .function_instructions(index)
        .expect("decode")
        .iter()
        .map(|i| i.opcode)
        .collect();
    assert!(!ops.contains(&Opcode::LoadVar));
    assert!(!ops.contains(&Opcode::StoreVar));
    assert!(ops.contains(&Opcode::LoadReg));
    assert!(matches!(program.functions[index].homes[0], SlotHome::Register(_)));
}

#[test]
fn bytecode_files_round_trip() {
    let program = compile(true, true);
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fib.stbc");
    program.save(&path).expect("save");
    let loaded = CompiledProgram::load(&path).expect("load");
    assert_eq!(loaded, program);

    let listing = disassemble(&loaded).expect("disassemble");
    assert!(listing.contains("fib"));
    assert!(listing.contains("describe"));
}

#[test]
fn corrupt_files_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.stbc");
    std::fs::write(&path, b"NOPE\x01\x00\x00\x00").expect("write");
    assert!(CompiledProgram::load(&path).is_err());

    // Slot counts that overflow when added must be rejected, not panic.
    let mut program = compile(true, true);
    program.functions[0].arity = u16::MAX;
    program.functions[0].captures = 1;
    let bytes = program.to_bytes().expect("encode");
    assert!(matches!(
        CompiledProgram::decode(bytes.as_slice()),
        Err(BytecodeError::BadFunction { .. })
    ));
}
