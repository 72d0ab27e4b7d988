//=====================================================
// File: memory/heap.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Slot heap with generation-checked handles
// Objective: Store heap objects, trace them from roots with an explicit
//            worklist and sweep whatever was not reached
//=====================================================

use std::fmt;

use crate::runtime::Value;

/// Weak handle into the heap. A handle stops resolving once its slot is
/// swept, because the slot's generation moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GcRef {
    index: u32,
    generation: u32,
}

impl GcRef {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for GcRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Class instances and struct values share a representation; the kind
/// selects the table that names their fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Class(u32),
    Struct(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Array(Vec<Value>),
    Object { kind: ObjectKind, fields: Vec<Value> },
    Closure { function: u32, captures: Vec<Value> },
    /// Target of a pointer created by `&e`.
    Cell(Value),
}

/// Reports the heap references an object holds.
pub trait Trace {
    fn trace(&self, out: &mut Vec<GcRef>);
}

impl Trace for Value {
    fn trace(&self, out: &mut Vec<GcRef>) {
        if let Value::Object(reference) = self {
            out.push(*reference);
        }
    }
}

impl Trace for [Value] {
    fn trace(&self, out: &mut Vec<GcRef>) {
        for value in self {
            value.trace(out);
        }
    }
}

impl Trace for HeapObject {
    fn trace(&self, out: &mut Vec<GcRef>) {
        match self {
            HeapObject::Array(items) => items.trace(out),
            HeapObject::Object { fields, .. } => fields.trace(out),
            HeapObject::Closure { captures, .. } => captures.trace(out),
            HeapObject::Cell(value) => value.trace(out),
        }
    }
}

const HEADER_BYTES: usize = 32;
const VALUE_BYTES: usize = std::mem::size_of::<Value>();

impl HeapObject {
    /// Bytes charged against the collection threshold.
    pub fn size_bytes(&self) -> usize {
        let values = match self {
            HeapObject::Array(items) => items.len(),
            HeapObject::Object { fields, .. } => fields.len(),
            HeapObject::Closure { captures, .. } => captures.len(),
            HeapObject::Cell(_) => 1,
        };
        HEADER_BYTES + values * VALUE_BYTES
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Array(_) => "array",
            HeapObject::Object { .. } => "object",
            HeapObject::Closure { .. } => "closure",
            HeapObject::Cell(_) => "pointer",
        }
    }
}

#[derive(Debug)]
struct Allocation {
    object: HeapObject,
    size: usize,
    marked: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    record: Option<Allocation>,
}

/// Result of one mark-sweep cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub marked: usize,
    pub swept: Vec<GcRef>,
    pub freed_bytes: usize,
    pub compacted_slots: usize,
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Generation given to slots created after compaction truncated the
    /// slot vector, so handles into truncated slots never match again.
    generation_floor: u32,
    allocated_bytes: usize,
    freed_bytes: usize,
    live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, object: HeapObject) -> GcRef {
        let size = object.size_bytes();
        self.allocated_bytes += size;
        self.live += 1;
        let record = Allocation {
            object,
            size,
            marked: false,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                GcRef {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: self.generation_floor,
                    record: Some(record),
                });
                GcRef {
                    index,
                    generation: self.generation_floor,
                }
            }
        }
    }

    fn slot(&self, reference: GcRef) -> Option<&Allocation> {
        let slot = self.slots.get(reference.index())?;
        if slot.generation != reference.generation {
            return None;
        }
        slot.record.as_ref()
    }

    pub fn get(&self, reference: GcRef) -> Option<&HeapObject> {
        self.slot(reference).map(|record| &record.object)
    }

    pub fn get_mut(&mut self, reference: GcRef) -> Option<&mut HeapObject> {
        let slot = self.slots.get_mut(reference.index())?;
        if slot.generation != reference.generation {
            return None;
        }
        slot.record.as_mut().map(|record| &mut record.object)
    }

    /// Re-charges an object after it grew or shrank in place.
    pub fn resize(&mut self, reference: GcRef) {
        let Some(slot) = self.slots.get_mut(reference.index()) else {
            return;
        };
        if slot.generation != reference.generation {
            return;
        }
        let Some(record) = slot.record.as_mut() else {
            return;
        };
        let size = record.object.size_bytes();
        if size > record.size {
            self.allocated_bytes += size - record.size;
        } else {
            self.freed_bytes += record.size - size;
        }
        record.size = size;
    }

    pub fn contains(&self, reference: GcRef) -> bool {
        self.slot(reference).is_some()
    }

    /// Bytes allocated and not yet freed.
    pub fn outstanding_bytes(&self) -> usize {
        self.allocated_bytes - self.freed_bytes
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn freed_bytes(&self) -> usize {
        self.freed_bytes
    }

    pub fn live_objects(&self) -> usize {
        self.live
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Marks everything reachable from `roots`; returns the number of
    /// objects marked.
    pub fn mark(&mut self, roots: &[GcRef]) -> usize {
        let mut worklist: Vec<GcRef> = roots.to_vec();
        let mut marked = 0;
        while let Some(reference) = worklist.pop() {
            let Some(slot) = self.slots.get_mut(reference.index()) else {
                continue;
            };
            if slot.generation != reference.generation {
                continue;
            }
            let Some(record) = slot.record.as_mut() else {
                continue;
            };
            if record.marked {
                continue;
            }
            record.marked = true;
            marked += 1;
            record.object.trace(&mut worklist);
        }
        marked
    }

    /// Frees unmarked objects and clears marks on survivors.
    pub fn sweep(&mut self) -> (Vec<GcRef>, usize) {
        let mut swept = Vec::new();
        let mut freed = 0;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let keep = match slot.record.as_mut() {
                Some(record) if record.marked => {
                    record.marked = false;
                    true
                }
                Some(_) => false,
                None => continue,
            };
            if keep {
                continue;
            }
            if let Some(record) = slot.record.take() {
                freed += record.size;
                swept.push(GcRef {
                    index: index as u32,
                    generation: slot.generation,
                });
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.freed_bytes += freed;
        self.live -= swept.len();
        (swept, freed)
    }

    /// Drops trailing empty slots and rebuilds the free list in ascending
    /// order. Returns the number of slots removed.
    pub fn compact(&mut self) -> usize {
        let before = self.slots.len();
        while let Some(last) = self.slots.last() {
            if last.record.is_some() {
                break;
            }
            self.generation_floor = self.generation_floor.max(last.generation.wrapping_add(1));
            self.slots.pop();
        }
        self.free = self
            .slots
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, slot)| slot.record.is_none())
            .map(|(index, _)| index as u32)
            .collect();
        before - self.slots.len()
    }

    /// Full cycle: mark from `roots`, sweep, optionally compact.
    pub fn collect(&mut self, roots: &[GcRef], compact: bool) -> CycleReport {
        let marked = self.mark(roots);
        let (swept, freed_bytes) = self.sweep();
        let compacted_slots = if compact { self.compact() } else { 0 };
        CycleReport {
            marked,
            swept,
            freed_bytes,
            compacted_slots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_objects_are_swept_and_handles_go_stale() {
        let mut heap = Heap::new();
        let kept = heap.allocate(HeapObject::Array(vec![Value::Int(1)]));
        let dropped = heap.allocate(HeapObject::Cell(Value::Null));
        let report = heap.collect(&[kept], false);
        assert_eq!(report.marked, 1);
        assert_eq!(report.swept, vec![dropped]);
        assert!(heap.contains(kept));
        assert!(!heap.contains(dropped));
        let reused = heap.allocate(HeapObject::Cell(Value::Int(2)));
        assert_eq!(reused.index(), dropped.index());
        assert_ne!(reused, dropped);
        assert!(heap.get(dropped).is_none());
    }

    #[test]
    fn arrays_growing_in_place_are_recharged() {
        let mut heap = Heap::new();
        let array = heap.allocate(HeapObject::Array(Vec::new()));
        let before = heap.outstanding_bytes();
        if let Some(HeapObject::Array(items)) = heap.get_mut(array) {
            items.extend((0..64).map(Value::Int));
        }
        heap.resize(array);
        assert_eq!(heap.outstanding_bytes(), before + 64 * VALUE_BYTES);

        if let Some(HeapObject::Array(items)) = heap.get_mut(array) {
            items.truncate(4);
        }
        heap.resize(array);
        assert_eq!(heap.outstanding_bytes(), before + 4 * VALUE_BYTES);

        let report = heap.collect(&[], false);
        assert_eq!(report.freed_bytes, before + 4 * VALUE_BYTES);
        assert_eq!(heap.outstanding_bytes(), 0);
    }

    #[test]
    fn tracing_follows_nested_references() {
        let mut heap = Heap::new();
        let inner = heap.allocate(HeapObject::Cell(Value::Int(7)));
        let outer = heap.allocate(HeapObject::Array(vec![Value::Object(inner)]));
        let closure = heap.allocate(HeapObject::Closure {
            function: 1,
            captures: vec![Value::Object(outer)],
        });
        let report = heap.collect(&[closure], false);
        assert_eq!(report.marked, 3);
        assert!(report.swept.is_empty());
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapObject::Array(Vec::new()));
        let b = heap.allocate(HeapObject::Array(vec![Value::Object(a)]));
        if let Some(HeapObject::Array(items)) = heap.get_mut(a) {
            items.push(Value::Object(b));
        }
        let report = heap.collect(&[], true);
        assert_eq!(report.swept.len(), 2);
        assert_eq!(heap.live_objects(), 0);
        assert_eq!(heap.outstanding_bytes(), 0);
    }

    #[test]
    fn compaction_keeps_truncated_handles_stale() {
        let mut heap = Heap::new();
        let first = heap.allocate(HeapObject::Cell(Value::Null));
        let second = heap.allocate(HeapObject::Cell(Value::Null));
        let report = heap.collect(&[first], true);
        assert_eq!(report.compacted_slots, 1);
        assert_eq!(heap.slot_count(), 1);
        let fresh = heap.allocate(HeapObject::Cell(Value::Null));
        assert_eq!(fresh.index(), second.index());
        assert!(heap.get(second).is_none());
        assert!(heap.get(fresh).is_some());
    }
}
