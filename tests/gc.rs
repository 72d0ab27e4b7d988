// Strata collector tests: the VM driving mark-sweep over its own roots
// Covers: global reachability, collection during allocation loops,
//         the background collector thread, in-place growth, observer callbacks

use std::sync::Arc;

use parking_lot::Mutex;
use strata::config::{GcConfig, StrataConfig};
use strata::memory::{CycleReport, GcRef};
use strata::vm::VmObserver;
use strata::{Pipeline, Value, Vm};

const CHURN: &str = r#"
#[noinline]
fn churn(n) {
    let total = 0;
    let i = 0;
    while i < n {
        let tmp = [i, i, i];
        total = total + len(tmp);
        i = i + 1;
    }
    return total;
}
churn(int("200"))
"#;

fn config(background: bool, threshold_bytes: usize) -> StrataConfig {
    StrataConfig {
        gc: GcConfig {
            threshold_bytes,
            background,
            poll_interval_ms: 1,
            compact: true,
        },
        ..StrataConfig::default()
    }
}

fn load(source: &str, config: StrataConfig) -> Vm {
    Pipeline::new(config).load(source).expect("compile")
}

#[test]
fn globals_keep_objects_alive_until_cleared() {
    let mut vm = load("let keep = [1, 2, 3];\n0", config(false, 1024 * 1024));
    vm.run().expect("run");
    let Some(Value::Object(reference)) = vm.global("keep").cloned() else {
        panic!("keep should hold an array");
    };

    let report = vm.collect_garbage();
    assert!(!report.swept.contains(&reference));
    assert!(vm.collector().heap().contains(reference));

    vm.set_global("keep", Value::Null);
    let report = vm.collect_garbage();
    assert!(report.swept.contains(&reference));
    assert!(!vm.collector().heap().contains(reference));
}

#[test]
fn allocation_loops_trigger_collections() {
    let mut vm = load(CHURN, config(false, 256));
    assert_eq!(vm.run().expect("run"), Value::Int(600));
    let profile = vm.profile();
    assert!(profile.collections >= 1, "{profile:?}");
    assert!(profile.objects_freed > 0, "{profile:?}");
    assert!(vm.collector().stats().cycles >= 1);
}

#[test]
fn background_collector_serves_the_vm() {
    let mut vm = load(CHURN, config(true, 256));
    assert!(vm.collector().runs_in_background());
    assert_eq!(vm.run().expect("run"), Value::Int(600));
    let before = vm.collector().stats().cycles;
    vm.collect_garbage();
    assert_eq!(vm.collector().stats().cycles, before + 1);
    // The result is on no root anymore, so every array is garbage.
    assert_eq!(vm.collector().stats().live_objects, 0);
}

#[test]
fn pushes_are_charged_to_the_heap() {
    let source = "let xs = [];\nlet i = 0;\nwhile i < int(\"100\") { push(xs, i); i = i + 1; }\n0";
    let mut vm = load(source, config(false, 1024 * 1024));
    vm.run().expect("run");
    vm.collect_garbage();
    let grown = vm.collector().stats().outstanding_bytes;
    assert!(grown >= 100 * 8, "{grown}");

    vm.set_global("xs", Value::Null);
    vm.collect_garbage();
    assert_eq!(vm.collector().stats().outstanding_bytes, 0);
}

#[derive(Default)]
struct Counts {
    allocs: usize,
    frees: usize,
    cycles: usize,
}

struct Counter(Arc<Mutex<Counts>>);

impl VmObserver for Counter {
    fn on_alloc(&mut self, _reference: GcRef, kind: &'static str, bytes: usize) {
        assert_eq!(kind, "array");
        assert!(bytes > 0);
        self.0.lock().allocs += 1;
    }

    fn on_free(&mut self, _reference: GcRef) {
        self.0.lock().frees += 1;
    }

    fn on_collect(&mut self, _report: &CycleReport) {
        self.0.lock().cycles += 1;
    }
}

#[test]
fn observers_see_every_allocation_and_free() {
    let counts = Arc::new(Mutex::new(Counts::default()));
    let mut vm = load(CHURN, config(false, 1024 * 1024));
    vm.add_observer(Box::new(Counter(Arc::clone(&counts))));
    vm.run().expect("run");
    assert_eq!(counts.lock().allocs, 200);
    assert_eq!(counts.lock().cycles, 0);

    vm.collect_garbage();
    let counts = counts.lock();
    assert_eq!(counts.cycles, 1);
    assert_eq!(counts.frees, 200);
}
