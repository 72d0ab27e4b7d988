//=====================================================
// File: vm/exceptions.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Exception dispatch for the virtual machine
// Objective: Turn runtime faults into exception objects, walk exception
//            frames to a matching catch or finally block and report
//            uncaught exceptions with a stack trace
//=====================================================

use std::fmt::Write;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::builtins::{render_value, type_name_of};
use super::{Vm, VmError};
use crate::bytecode::BytecodeError;
use crate::memory::{HeapObject, ObjectKind};
use crate::runtime::{ERROR_CLASS, MESSAGE_FIELD, RuntimeFault, Value};

/// Frames kept in a fatal report, innermost first.
const TRACE_LIMIT: usize = 32;

/// Pushed by `ENTER_TRY`, popped by `EXIT_TRY` or when an exception unwinds
/// through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExceptionFrame {
    pub handler: u32,
    /// Call frames alive when the region was entered.
    pub frame_depth: usize,
    pub stack_height: usize,
}

/// Exception currently propagating, with the trace captured where it was
/// first raised. A finally block that rethrows keeps the original trace.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub value: Value,
    pub trace: Vec<TraceFrame>,
    pub stack: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceFrame {
    pub function: String,
    pub line: u32,
    pub column: u32,
    pub source: Option<String>,
}

/// An exception no handler caught.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("uncaught {exception}: {message}")]
pub struct FatalError {
    pub exception: String,
    pub message: String,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
    /// Operand stack at the throw, top first.
    pub stack: Vec<String>,
}

impl FatalError {
    /// Multi-line report printed by the command line driver.
    pub fn report(&self) -> String {
        let mut out = format!("{self}\n");
        for frame in &self.trace {
            let _ = writeln!(out, "  at {} (line {}, column {})", frame.function, frame.line, frame.column);
            if let Some(source) = &frame.source {
                let _ = writeln!(out, "      {}", source.trim());
            }
        }
        if !self.stack.is_empty() {
            out.push_str("operand stack (top first):\n");
            for (depth, value) in self.stack.iter().enumerate() {
                let _ = writeln!(out, "  [{depth}] {value}");
            }
        }
        out
    }
}

impl Vm {
    /// Allocates an instance of the builtin class named after the fault.
    pub(super) fn exception_from_fault(&mut self, fault: &RuntimeFault) -> Result<Value, VmError> {
        for observer in &mut self.observers {
            observer.on_fault(fault);
        }
        let class = self
            .program
            .class_index(fault.class_name())
            .or_else(|| self.program.class_index(ERROR_CLASS))
            .ok_or_else(|| VmError::MissingExceptionClass(fault.class_name().to_string()))?;
        let names = &self.program.classes[class as usize].fields;
        let mut fields = vec![Value::Null; names.len().max(1)];
        let message = names
            .iter()
            .position(|name| name.as_str() == MESSAGE_FIELD)
            .unwrap_or(0);
        fields[message] = Value::str(&fault.to_string());
        debug!(exception = fault.class_name(), %fault, "runtime fault");
        Ok(self.allocate(HeapObject::Object {
            kind: ObjectKind::Class(class),
            fields,
        }))
    }

    /// Unwinds to the innermost handler that takes `value`. Returns the
    /// fatal error when none does.
    pub(super) fn raise(&mut self, value: Value) -> Result<(), VmError> {
        let rethrow = self
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.value == value);
        if !rethrow {
            self.in_flight = Some(InFlight {
                value: value.clone(),
                trace: self.capture_trace(),
                stack: self.dump_stack(),
            });
        }
        let class = self.class_of(&value);

        while let Some(frame) = self.handlers.pop() {
            self.frames.truncate(frame.frame_depth);
            self.stack.truncate(frame.stack_height);
            let entry = self
                .program
                .handlers
                .get(frame.handler as usize)
                .ok_or(BytecodeError::BadOperand {
                    offset: self.current_offset,
                    what: "handler",
                    index: frame.handler,
                })?;
            let caught = entry
                .catches
                .iter()
                .find(|catch| match catch.class {
                    None => true,
                    Some(expected) => class.is_some_and(|own| self.program.is_subclass(own, expected)),
                })
                .map(|catch| catch.target);
            let target = match (caught, entry.finally) {
                (Some(target), _) => {
                    self.in_flight = None;
                    target
                }
                (None, Some(finally)) => finally,
                (None, None) => continue,
            };
            self.set_ip(target as usize);
            self.stack.push(value);
            return Ok(());
        }

        let in_flight = self.in_flight.take();
        Err(VmError::Fatal(Box::new(self.fatal(&value, in_flight))))
    }

    fn class_of(&self, value: &Value) -> Option<u32> {
        let reference = value.as_object()?;
        match self.collector.heap().get(reference) {
            Some(HeapObject::Object {
                kind: ObjectKind::Class(class),
                ..
            }) => Some(*class),
            _ => None,
        }
    }

    fn fatal(&self, value: &Value, in_flight: Option<InFlight>) -> FatalError {
        let heap = self.collector.heap();
        let exception = type_name_of(&self.program, &heap, value);
        let message = match value.as_object().and_then(|r| heap.get(r)) {
            Some(HeapObject::Object {
                kind: ObjectKind::Class(class),
                fields,
            }) => self.program.classes[*class as usize]
                .fields
                .iter()
                .position(|name| name.as_str() == MESSAGE_FIELD)
                .and_then(|index| fields.get(index))
                .map_or_else(|| render_value(&self.program, &heap, value), |m| {
                    render_value(&self.program, &heap, m)
                }),
            _ => render_value(&self.program, &heap, value),
        };
        drop(heap);
        let (trace, stack) = match in_flight {
            Some(in_flight) => (in_flight.trace, in_flight.stack),
            None => (self.capture_trace(), self.dump_stack()),
        };
        FatalError {
            exception,
            message,
            trace,
            stack,
        }
    }

    pub(super) fn capture_trace(&self) -> Vec<TraceFrame> {
        let depth = self.frames.len();
        self.frames
            .iter()
            .enumerate()
            .rev()
            .take(TRACE_LIMIT)
            .map(|(index, frame)| {
                // Callers resume after their call instruction.
                let offset = if index + 1 == depth {
                    self.current_offset
                } else {
                    frame.ip.saturating_sub(1)
                };
                let (line, column) = self
                    .program
                    .debug_at(offset)
                    .map_or((0, 0), |entry| (entry.line, entry.column));
                let function = self
                    .program
                    .functions
                    .get(frame.function as usize)
                    .map_or_else(|| format!("#{}", frame.function), |f| f.name.to_string());
                let source = self
                    .source
                    .as_ref()
                    .and_then(|lines| lines.get((line as usize).checked_sub(1)?))
                    .cloned();
                TraceFrame {
                    function,
                    line,
                    column,
                    source,
                }
            })
            .collect()
    }

    pub(super) fn dump_stack(&self) -> Vec<String> {
        let heap = self.collector.heap();
        self.stack
            .iter()
            .rev()
            .map(|value| render_value(&self.program, &heap, value))
            .collect()
    }
}
