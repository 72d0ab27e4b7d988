// Strata optimizer tests: AST passes observed through the generated bytecode
// Covers: inlining equivalence, loop unrolling, dead code after return, CSE,
//         guarded expressions that must not be evaluated early

use strata::bytecode::{CompiledProgram, Opcode};
use strata::config::{GcConfig, OptimizerConfig, StrataConfig};
use strata::{Pipeline, Value};

fn config(optimizer: OptimizerConfig) -> StrataConfig {
    StrataConfig {
        optimizer,
        gc: GcConfig {
            background: false,
            ..GcConfig::default()
        },
        ..StrataConfig::default()
    }
}

fn optimized() -> Pipeline {
    Pipeline::new(config(OptimizerConfig::default()))
}

fn unoptimized() -> Pipeline {
    Pipeline::new(config(OptimizerConfig::disabled()))
}

fn opcodes_of(program: &CompiledProgram, name: &str) -> Vec<Opcode> {
    let index = program
        .functions
        .iter()
        .position(|function| function.name.as_str() == name)
        .unwrap_or_else(|| panic!("function {name} not found"));
    program
        .function_instructions(index)
        .expect("decode")
        .iter()
        .map(|instruction| instruction.opcode)
        .collect()
}

#[test]
fn inlined_calls_match_real_calls() {
    let sources = [
        "fn double(x) { return x * 2; }\ndouble(21)",
        "fn pick(c) { if c { return 10; } return 20; }\npick(false) + pick(true)",
        "fn area(w, h) { let a = w * h; return a; }\nlet side = int(\"6\");\narea(side, side + 1)",
        "let g = 1;\nfn bump() { g = 10; return 0; }\nfn f(p) { return bump() + p; }\nf(g)",
    ];
    for source in sources {
        let inlined = optimized().run(source).expect("optimized run");
        let called = unoptimized().run(source).expect("plain run");
        assert_eq!(inlined, called, "{source}");
    }
}

#[test]
fn inlining_removes_the_call() {
    let program = optimized()
        .compile("fn double(x) { return x * 2; }\nlet n = int(\"4\");\ndouble(n)")
        .expect("compile");
    assert!(!opcodes_of(&program, "__main__").contains(&Opcode::Call));
    let program = unoptimized()
        .compile("fn double(x) { return x * 2; }\nlet n = int(\"4\");\ndouble(n)")
        .expect("compile");
    assert!(opcodes_of(&program, "__main__").contains(&Opcode::Call));
}

#[test]
fn short_counting_loops_unroll_without_jumps() {
    for trips in 1..=4 {
        let source = format!("fn f() {{ for (let i = 0; i < {trips}; i = i + 1) {{ print(i); }} }}");
        let program = optimized().compile(&source).expect("compile");
        let ops = opcodes_of(&program, "f");
        assert!(!ops.iter().any(|op| op.is_jump()), "trip {trips}: {ops:?}");
        let prints = ops.iter().filter(|op| **op == Opcode::CallNative).count();
        assert_eq!(prints, trips, "trip {trips}");
    }
}

#[test]
fn longer_loops_keep_their_back_edge() {
    let program = optimized()
        .compile("fn f() { for i in 0..10 { print(i); } }")
        .expect("compile");
    assert!(opcodes_of(&program, "f").contains(&Opcode::Jump));
}

#[test]
fn unrolled_loops_print_the_same_values() {
    let source = "for (let i = 0; i < 3; i = i + 1) { print(i); }";
    let mut fast = optimized().load(source).expect("compile").capture_output();
    fast.run().expect("run");
    let mut slow = unoptimized().load(source).expect("compile").capture_output();
    slow.run().expect("run");
    assert_eq!(fast.take_output(), "012");
    assert_eq!(slow.take_output(), "012");
}

#[test]
fn statements_after_return_are_gone() {
    let program = optimized()
        .compile("fn f() { print(0); return 1; print(2); print(3); }")
        .expect("compile");
    let ops = opcodes_of(&program, "f");
    assert_eq!(ops.iter().filter(|op| **op == Opcode::CallNative).count(), 1);
    assert_eq!(ops.iter().filter(|op| **op == Opcode::Return).count(), 1);
    assert_eq!(ops.last(), Some(&Opcode::Return));
}

#[test]
fn common_subexpressions_compute_once() {
    let source = "fn g(a, b) { let p = (a - b) * 2; let q = (a - b) * 3; return p + q; }\ng(int(\"7\"), 2)";
    let program = optimized().compile(source).expect("compile");
    let subs = opcodes_of(&program, "g")
        .into_iter()
        .filter(|op| *op == Opcode::Sub)
        .count();
    assert_eq!(subs, 1);
    assert_eq!(optimized().run(source).expect("run"), Value::Int(25));
}

#[test]
fn guarded_expressions_are_not_evaluated_early() {
    let sources = [
        "fn f(a) { let r = a != null ? a + 1 : 0; let s = a != null ? a + 1 : 0; return r + s; }\nf(null)",
        "fn f(a) { let r = a && a * 2; let s = a && a * 2; return r == s; }\nf(false)",
        "fn f(a, n) { let i = 0; while i < n { let k = a * 2; i = i + k; } return i; }\nf(null, int(\"0\"))",
    ];
    for source in sources {
        let plain = unoptimized().run(source).expect("plain run");
        let fast = optimized().run(source).expect("optimized run");
        assert_eq!(fast, plain, "{source}");
    }
}
