// Strata smoke tests: every syntax level through the whole pipeline
// Covers: literal folding, mixed-level programs, inline assembly, printing,
//         expression nesting limits

use strata::bytecode::{CompiledProgram, Opcode};
use strata::config::{GcConfig, StrataConfig};
use strata::runtime::Constant;
use strata::tokenizer::SyntaxLevel;
use strata::{Pipeline, Value};

fn pipeline() -> Pipeline {
    Pipeline::new(StrataConfig {
        gc: GcConfig {
            background: false,
            ..GcConfig::default()
        },
        ..StrataConfig::default()
    })
}

fn main_opcodes(program: &CompiledProgram) -> Vec<Opcode> {
    program
        .function_instructions(0)
        .expect("decode main")
        .iter()
        .map(|instruction| instruction.opcode)
        .collect()
}

fn run_captured(pipeline: &Pipeline, source: &str) -> (Value, String) {
    let mut vm = pipeline.load(source).expect("compile").capture_output();
    let value = vm.run().expect("run");
    (value, vm.take_output())
}

#[test]
fn literal_arithmetic_folds_to_one_push() {
    let program = pipeline().compile("2 + 3 * 4").expect("compile");
    assert_eq!(main_opcodes(&program), vec![Opcode::Push, Opcode::Return]);
    let push = &program.function_instructions(0).expect("decode")[0];
    assert_eq!(program.constants[push.operand(0) as usize], Constant::Int(14));
}

#[test]
fn high_and_medium_segments_share_one_program() {
    let pipeline = pipeline();
    let source = "@high\nlet x be 2 plus 3\n@medium\nlet y = x * 2;\ny";
    let checked = pipeline.check(source).expect("check");
    assert!(checked.typed.symbols.lookup("x").next().is_some());
    assert!(checked.typed.symbols.lookup("y").next().is_some());
    assert_eq!(pipeline.run(source).expect("run"), Value::Int(10));
}

#[test]
fn high_level_loops_and_functions_run() {
    let source = "define function add with a and b\nreturn a plus b\nend\n\
                  let total be 0\n\
                  for each i from 1 to 4 do\nset total to total plus call add with i and 1\nend\n\
                  print total\n";
    let (_, output) = run_captured(&pipeline().with_level(SyntaxLevel::High), source);
    assert_eq!(output.trim(), "14");
}

#[test]
fn assembly_blocks_run_inside_functions() {
    let source = "#[noinline]\nfn seven() {\n@assembly\npush 3\npush 4\nadd\nret\n}\nseven() * 2";
    assert_eq!(pipeline().run(source).expect("run"), Value::Int(14));
}

#[test]
fn assembly_programs_print() {
    let source = "@assembly\npush 2\npush 3\nadd\nprint\n";
    let (_, output) = run_captured(&pipeline(), source);
    assert_eq!(output, "5\n");
}

#[test]
fn syntax_errors_are_reported_with_their_level() {
    let err = pipeline().compile("let = 4;").expect_err("syntax error");
    let diagnostics = err.diagnostics().expect("diagnostics");
    assert!(diagnostics.has_errors());
    assert!(diagnostics.to_string().contains("E002"));
}

#[test]
fn runaway_operator_chains_are_rejected_before_compiling() {
    let source = format!("let x = 1;\n{}x", "x + ".repeat(400));
    let err = pipeline().compile(&source).expect_err("nesting limit");
    let diagnostics = err.diagnostics().expect("diagnostics");
    assert!(diagnostics.to_string().contains("too deep"));

    let source = format!("let x = 1;\n{}x", "x + ".repeat(100));
    assert_eq!(pipeline().run(&source).expect("run"), Value::Int(101));
}
