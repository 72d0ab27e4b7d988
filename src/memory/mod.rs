//=====================================================
// File: memory/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Heap memory for the virtual machine
// Objective: Expose the slot heap, its traceable object enum and the
//            collector that decides when a cycle runs
//=====================================================

pub mod gc;
pub mod heap;

pub use gc::{Collector, GcStats};
pub use heap::{CycleReport, GcRef, Heap, HeapObject, ObjectKind, Trace};
