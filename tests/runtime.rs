// Strata runtime tests: the VM running compiled programs
// Covers: exceptions and finally, fatal reports, closures, classes, limits,
//         opcode extensions

use strata::config::{GcConfig, StrataConfig, VmConfig};
use strata::runtime::RuntimeFault;
use strata::vm::OpcodeExtension;
use strata::{Pipeline, PipelineError, Value, VmError};

fn config() -> StrataConfig {
    StrataConfig {
        gc: GcConfig {
            background: false,
            ..GcConfig::default()
        },
        ..StrataConfig::default()
    }
}

fn run(source: &str) -> (Result<Value, VmError>, String) {
    let mut vm = Pipeline::new(config())
        .load(source)
        .expect("compile")
        .capture_output();
    let result = vm.run();
    (result, vm.take_output())
}

#[test]
fn faults_are_caught_by_class() {
    let source = r#"
        let zero = int("0");
        try {
            let r = 10 / zero;
            println("unreachable");
        } catch (e: IndexError) {
            println("wrong handler");
        } catch (e: DivisionByZero) {
            println(e.message);
        }
        "done"
    "#;
    let (result, output) = run(source);
    assert_eq!(result.expect("run"), Value::str("done"));
    assert_eq!(output, "division by zero\n");
}

#[test]
fn error_catches_every_builtin_fault() {
    let source = r#"
        let items = [1, 2, 3];
        try { items[7]; } catch (e: Error) { println(type_of(e)); }
    "#;
    let (result, output) = run(source);
    result.expect("run");
    assert_eq!(output, "IndexError\n");
}

#[test]
fn finally_runs_before_an_uncaught_exception_escapes() {
    let source = r#"
        #[noinline]
        fn risky(tag) { throw new TypeError("bad " + tag); }
        try { risky("input"); } catch (e: IndexError) { println("wrong"); } finally { println("cleanup"); }
    "#;
    let (result, output) = run(source);
    assert_eq!(output, "cleanup\n");
    let err = result.expect_err("uncaught");
    let fatal = err.as_fatal().expect("fatal");
    assert_eq!(fatal.exception, "TypeError");
    assert_eq!(fatal.message, "bad input");
    assert_eq!(fatal.trace[0].function, "risky");
}

#[test]
fn finally_runs_on_normal_exit_and_return() {
    let source = r#"
        #[noinline]
        fn guarded(flag) {
            try {
                if flag { return 1; }
                print("body ");
            } finally {
                print("finally ");
            }
            return 2;
        }
        guarded(true) * 10 + guarded(false)
    "#;
    let (result, output) = run(source);
    assert_eq!(result.expect("run"), Value::Int(12));
    assert_eq!(output, "finally body finally ");
}

#[test]
fn fatal_report_names_the_line() {
    let source = "let a = 1;\nlet b = int(\"0\");\nlet c = a / b;\n";
    let pipeline = Pipeline::new(config());
    let err = pipeline.run(source).expect_err("fatal");
    let PipelineError::Vm(VmError::Fatal(fatal)) = err else {
        panic!("expected fatal error, got {err}");
    };
    assert_eq!(fatal.exception, "DivisionByZero");
    assert_eq!(fatal.trace[0].line, 3);
    assert!(fatal.report().contains("let c = a / b;"));
}

#[test]
fn closures_capture_their_environment() {
    let source = r#"
        #[noinline]
        fn make_adder(n) { return fn(x) => x + n; }
        let add5 = make_adder(5);
        let add7 = make_adder(7);
        add5(10) * 100 + add7(1)
    "#;
    let (result, _) = run(source);
    assert_eq!(result.expect("run"), Value::Int(1508));
}

#[test]
fn classes_construct_inherit_and_dispatch() {
    let source = r#"
        class Counter {
            count: int = 0;
            fn init(start: int) { self.count = start; }
            fn bump() -> int { self.count = self.count + 1; return self.count; }
        }
        class Double : Counter {
            fn bump() -> int { self.count = self.count + 2; return self.count; }
        }
        let c = new Counter(5);
        c.bump();
        let d = new Double(1);
        d.bump();
        c.bump() * 10 + d.bump()
    "#;
    let (result, _) = run(source);
    assert_eq!(result.expect("run"), Value::Int(75));
}

#[test]
fn runaway_loops_hit_the_step_limit() {
    let config = StrataConfig {
        vm: VmConfig {
            step_limit: Some(10_000),
            ..VmConfig::default()
        },
        ..config()
    };
    let err = Pipeline::new(config)
        .run("while true { }")
        .expect_err("limit");
    assert!(matches!(err, PipelineError::Vm(VmError::StepLimit(10_000))));
}

#[test]
fn deep_recursion_is_a_catchable_stack_overflow() {
    let source = r#"
        fn down(n) { return down(n + 1); }
        try { down(0); } catch (e: StackOverflow) { println("deep"); }
    "#;
    let (result, output) = run(source);
    result.expect("run");
    assert_eq!(output, "deep\n");
}

#[test]
fn arrays_and_pointers_work_at_low_level() {
    let source = "@low\nlet xs = [1, 2];\nxs.push(3);\nlet p = &10;\n*p = *p + xs[2];\n*p + len(xs)";
    let (result, _) = run(source);
    assert_eq!(result.expect("run"), Value::Int(16));
}

struct Square;

impl OpcodeExtension for Square {
    fn name(&self) -> &str {
        "square"
    }

    fn execute(&mut self, stack: &mut Vec<Value>) -> Result<(), RuntimeFault> {
        match stack.pop() {
            Some(Value::Int(n)) => {
                stack.push(Value::Int(n * n));
                Ok(())
            }
            other => Err(RuntimeFault::TypeError(format!("square expects an int, got {other:?}"))),
        }
    }
}

#[test]
fn extensions_extend_compiled_programs() {
    use strata::bytecode::Opcode;

    let mut program = Pipeline::new(config()).compile("9").expect("compile");
    // PUSH 9; RETURN  becomes  PUSH 9; EXT 0; RETURN
    let ret = program.code.pop().expect("return");
    program.code.extend([Opcode::Ext.word(), 0, ret]);
    program.functions[0].end = program.code.len() as u32;
    let mut vm = strata::Vm::new(program, &config());
    vm.register_extension(Box::new(Square));
    assert_eq!(vm.run().expect("run"), Value::Int(81));
}
