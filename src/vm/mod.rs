//=====================================================
// File: vm/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Stack virtual machine for compiled Strata programs
// Objective: Dispatch bytecode over an operand stack and call frames with
//            registers, route faults through exception frames and stop at
//            safe points for the garbage collector
//=====================================================

mod builtins;
mod exceptions;
mod profiling;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, instrument, trace};

pub use builtins::{NativeContext, NativeFn, NativeResult, Natives, Output, render_value, type_name_of};
pub use exceptions::{FatalError, TraceFrame};
pub use profiling::{HotFunctionTable, RunProfile};

use exceptions::{ExceptionFrame, InFlight};

use crate::ast::{BinaryOp, UnaryOp};
use crate::bytecode::{BytecodeError, CompiledProgram, Opcode, REGISTER_COUNT, SlotHome};
use crate::config::{StrataConfig, VmConfig};
use crate::memory::{Collector, CycleReport, GcRef, HeapObject, ObjectKind, Trace};
use crate::runtime::{RuntimeFault, Value, ops};
use crate::symbol::Symbol;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Fatal(Box<FatalError>),
    #[error("step limit of {0} instructions exceeded")]
    StepLimit(u64),
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),
    #[error("operand stack underflow at offset {0}")]
    StackUnderflow(usize),
    #[error("no opcode extension registered as #{0}")]
    UnknownExtension(u32),
    #[error("exception class '{0}' is missing from the class table")]
    MissingExceptionClass(String),
}

impl VmError {
    pub fn as_fatal(&self) -> Option<&FatalError> {
        match self {
            VmError::Fatal(fatal) => Some(fatal),
            _ => None,
        }
    }
}

/// Collaborator-defined instruction reached through `EXT id`.
pub trait OpcodeExtension: Send {
    fn name(&self) -> &str;
    /// Runs against the operand stack; may pop and push values.
    fn execute(&mut self, stack: &mut Vec<Value>) -> Result<(), RuntimeFault>;
}

/// Hooks for allocation, deallocation and fault events.
pub trait VmObserver: Send {
    fn on_alloc(&mut self, _reference: GcRef, _kind: &'static str, _bytes: usize) {}
    fn on_free(&mut self, _reference: GcRef) {}
    fn on_fault(&mut self, _fault: &RuntimeFault) {}
    fn on_collect(&mut self, _report: &CycleReport) {}
}

#[derive(Debug)]
struct Frame {
    function: u32,
    /// Next instruction to run.
    ip: usize,
    locals: Vec<Value>,
    registers: Vec<Value>,
    stack_base: usize,
}

/// Why dispatch left the happy path.
enum Unwind {
    Fault(RuntimeFault),
    Throw(Value),
    Vm(VmError),
}

impl From<RuntimeFault> for Unwind {
    fn from(fault: RuntimeFault) -> Self {
        Unwind::Fault(fault)
    }
}

impl From<VmError> for Unwind {
    fn from(error: VmError) -> Self {
        Unwind::Vm(error)
    }
}

impl From<BytecodeError> for Unwind {
    fn from(error: BytecodeError) -> Self {
        Unwind::Vm(VmError::Bytecode(error))
    }
}

type Step<T = ()> = Result<T, Unwind>;

pub struct Vm {
    program: CompiledProgram,
    config: VmConfig,
    collector: Collector,
    natives: Natives,
    extensions: Vec<Box<dyn OpcodeExtension>>,
    observers: Vec<Box<dyn VmObserver>>,
    output: Output,
    globals: HashMap<Symbol, Value>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    handlers: Vec<ExceptionFrame>,
    in_flight: Option<InFlight>,
    source: Option<Vec<String>>,
    current_offset: usize,
    profile: RunProfile,
}

impl Vm {
    pub fn new(program: CompiledProgram, config: &StrataConfig) -> Self {
        Self {
            program,
            config: config.vm.clone(),
            collector: Collector::new(&config.gc),
            natives: Natives::new(),
            extensions: Vec::new(),
            observers: Vec::new(),
            output: Output::Stdout,
            globals: HashMap::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            handlers: Vec::new(),
            in_flight: None,
            source: None,
            current_offset: 0,
            profile: RunProfile::new(),
        }
    }

    /// Source text used to print lines in fatal stack traces.
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.lines().map(str::to_string).collect());
        self
    }

    /// Buffers `print` output instead of writing to stdout.
    pub fn capture_output(mut self) -> Self {
        self.output = Output::Captured(String::new());
        self
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.output {
            Output::Captured(buffer) => std::mem::take(buffer),
            Output::Stdout => String::new(),
        }
    }

    pub fn register_native(&mut self, name: &str, func: NativeFn) {
        self.natives.register_sync(name, func);
    }

    /// Returns the id used as the operand of `EXT`.
    pub fn register_extension(&mut self, extension: Box<dyn OpcodeExtension>) -> u32 {
        debug!(name = extension.name(), "opcode extension registered");
        self.extensions.push(extension);
        (self.extensions.len() - 1) as u32
    }

    pub fn add_observer(&mut self, observer: Box<dyn VmObserver>) {
        self.observers.push(observer);
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(Symbol::from(name), value);
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    pub fn profile(&self) -> &RunProfile {
        &self.profile
    }

    pub fn render(&self, value: &Value) -> String {
        render_value(&self.program, &self.collector.heap(), value)
    }

    /// Copy of the heap object behind a value, if it still exists.
    pub fn heap_object(&self, value: &Value) -> Option<HeapObject> {
        let reference = value.as_object()?;
        self.collector.heap().get(reference).cloned()
    }

    //=================================================
    // Section 1.0 - Run loop
    //=================================================

    /// Runs function 0 to completion and returns its result.
    #[instrument(skip_all, fields(functions = self.program.functions.len()))]
    pub fn run(&mut self) -> Result<Value, VmError> {
        self.program.validate()?;
        if self.program.functions.is_empty() {
            return Err(BytecodeError::BadFunction {
                name: "__main__".to_string(),
            }
            .into());
        }
        self.stack.clear();
        self.frames.clear();
        self.handlers.clear();
        self.in_flight = None;
        self.profile.begin();
        let pending = self.call_function(0, Vec::new(), Vec::new()).err();
        let result = self.execute(pending);
        self.profile.end();
        debug!(
            steps = self.profile.steps,
            collections = self.profile.collections,
            ok = result.is_ok(),
            "run finished"
        );
        result
    }

    fn execute(&mut self, mut pending: Option<Unwind>) -> Result<Value, VmError> {
        loop {
            let outcome = match pending.take() {
                Some(unwind) => Err(unwind),
                None => self.step(),
            };
            match outcome {
                Ok(None) => {}
                Ok(Some(value)) => return Ok(value),
                Err(Unwind::Fault(fault)) => {
                    let exception = self.exception_from_fault(&fault)?;
                    self.raise(exception)?;
                }
                Err(Unwind::Throw(value)) => self.raise(value)?,
                Err(Unwind::Vm(error)) => return Err(error),
            }
        }
    }

    /// Executes one instruction. `Some` carries the program result.
    fn step(&mut self) -> Step<Option<Value>> {
        let Some(ip) = self.frames.last().map(|frame| frame.ip) else {
            return Ok(Some(Value::Null));
        };
        if let Some(limit) = self.config.step_limit {
            if self.profile.steps >= limit {
                return Err(VmError::StepLimit(limit).into());
            }
        }
        self.profile.steps += 1;
        self.current_offset = ip;

        let word = *self
            .program
            .code
            .get(ip)
            .ok_or(BytecodeError::Truncated { offset: ip })?;
        let opcode = Opcode::from_word(word).ok_or(BytecodeError::InvalidOpcode { offset: ip, word })?;
        let next = ip + opcode.width();
        if next > self.program.code.len() {
            return Err(BytecodeError::Truncated { offset: ip }.into());
        }
        let a = self.operand(ip, 0);
        let b = self.operand(ip, 1);
        self.set_ip(next);
        trace!(offset = ip, %opcode, "dispatch");

        match opcode {
            Opcode::Nop => {}
            Opcode::Push => {
                let value = self
                    .program
                    .constants
                    .get(a as usize)
                    .map(|constant| constant.to_value())
                    .ok_or(self.bad_operand("constant", a))?;
                self.stack.push(value);
            }
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self.stack.last().cloned().ok_or(VmError::StackUnderflow(ip))?;
                self.stack.push(top);
            }
            Opcode::Neg | Opcode::Not | Opcode::BitNot => {
                let operand = self.pop()?;
                let op = match opcode {
                    Opcode::Neg => UnaryOp::Negate,
                    Opcode::Not => UnaryOp::Not,
                    _ => UnaryOp::BitwiseNot,
                };
                self.stack.push(ops::unary(op, &operand)?);
            }
            Opcode::Jump => self.jump(ip, a as usize),
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
                let condition = self.pop()?.is_truthy();
                if condition == (opcode == Opcode::JumpIfTrue) {
                    self.jump(ip, a as usize);
                }
            }
            Opcode::LoadVar | Opcode::LoadReg => {
                let frame = self.frame()?;
                let slots = if opcode == Opcode::LoadVar { &frame.locals } else { &frame.registers };
                let value = slots.get(a as usize).cloned();
                let value = value.ok_or(self.bad_operand("slot", a))?;
                self.stack.push(value);
            }
            Opcode::StoreVar | Opcode::StoreReg => {
                let value = self.pop()?;
                let missing = self.bad_operand("slot", a);
                let frame = self.frame_mut()?;
                let slots = if opcode == Opcode::StoreVar {
                    &mut frame.locals
                } else {
                    &mut frame.registers
                };
                *slots.get_mut(a as usize).ok_or(missing)? = value;
            }
            Opcode::LoadGlobal => {
                let name = self.name_operand(a)?;
                let value = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| RuntimeFault::UndefinedVariable(name.to_string()))?;
                self.stack.push(value);
            }
            Opcode::StoreGlobal => {
                let name = self.name_operand(a)?;
                let value = self.pop()?;
                self.globals.insert(name, value);
            }
            Opcode::LoadFunction => self.stack.push(Value::Function(a)),
            Opcode::Call => {
                self.safepoint();
                let args = self.pop_n(b as usize)?;
                self.call_function(a, args, Vec::new())?;
            }
            Opcode::CallNative => {
                self.safepoint();
                let name = self.name_operand(a)?;
                let args = self.pop_n(b as usize)?;
                self.call_native(&name, args)?;
            }
            Opcode::CallValue => {
                self.safepoint();
                let args = self.pop_n(a as usize)?;
                let callee = self.pop()?;
                self.call_value(callee, args)?;
            }
            Opcode::CallMethod => {
                self.safepoint();
                let name = self.name_operand(a)?;
                let args = self.pop_n(b as usize)?;
                let receiver = self.pop()?;
                self.call_method(receiver, &name, args)?;
            }
            Opcode::Return => {
                self.safepoint();
                let result = self.pop()?;
                let Some(frame) = self.frames.pop() else {
                    return Ok(Some(result));
                };
                self.stack.truncate(frame.stack_base);
                while self
                    .handlers
                    .last()
                    .is_some_and(|handler| handler.frame_depth > self.frames.len())
                {
                    self.handlers.pop();
                }
                if self.frames.is_empty() {
                    return Ok(Some(result));
                }
                self.stack.push(result);
            }
            Opcode::MakeClosure => {
                let captures = self.pop_n(b as usize)?;
                let closure = self.allocate(HeapObject::Closure { function: a, captures });
                self.stack.push(closure);
            }
            Opcode::EnterTry => {
                self.handlers.push(ExceptionFrame {
                    handler: a,
                    frame_depth: self.frames.len(),
                    stack_height: self.stack.len(),
                });
            }
            Opcode::ExitTry => {
                self.handlers.pop();
            }
            Opcode::Throw => {
                let value = self.pop()?;
                return Err(Unwind::Throw(value));
            }
            Opcode::NewObject => {
                let count = self
                    .program
                    .classes
                    .get(a as usize)
                    .map(|class| class.fields.len())
                    .ok_or(self.bad_operand("class", a))?;
                let object = self.allocate(HeapObject::Object {
                    kind: ObjectKind::Class(a),
                    fields: vec![Value::Null; count],
                });
                self.stack.push(object);
            }
            Opcode::NewStruct => {
                let fields = self.pop_n(b as usize)?;
                let object = self.allocate(HeapObject::Object {
                    kind: ObjectKind::Struct(a),
                    fields,
                });
                self.stack.push(object);
            }
            Opcode::GetField => {
                let name = self.name_operand(a)?;
                let object = self.pop()?;
                let value = self.get_field(&object, &name)?;
                self.stack.push(value);
            }
            Opcode::SetField => {
                let name = self.name_operand(a)?;
                let value = self.pop()?;
                let object = self.pop()?;
                self.set_field(&object, &name, value.clone())?;
                self.stack.push(value);
            }
            Opcode::MakeArray => {
                let items = self.pop_n(a as usize)?;
                let array = self.allocate(HeapObject::Array(items));
                self.stack.push(array);
            }
            Opcode::Index => {
                let index = self.pop()?;
                let object = self.pop()?;
                let value = self.index_value(&object, &index)?;
                self.stack.push(value);
            }
            Opcode::StoreIndex => {
                let value = self.pop()?;
                let index = self.pop()?;
                let object = self.pop()?;
                self.store_index(&object, &index, value.clone())?;
                self.stack.push(value);
            }
            Opcode::Box => {
                let value = self.pop()?;
                let cell = self.allocate(HeapObject::Cell(value));
                self.stack.push(cell);
            }
            Opcode::Deref => {
                let pointer = self.pop()?;
                let value = self.deref(&pointer)?;
                self.stack.push(value);
            }
            Opcode::StoreDeref => {
                let value = self.pop()?;
                let pointer = self.pop()?;
                self.store_deref(&pointer, value.clone())?;
                self.stack.push(value);
            }
            Opcode::Ext => {
                let extension = self
                    .extensions
                    .get_mut(a as usize)
                    .ok_or(VmError::UnknownExtension(a))?;
                extension.execute(&mut self.stack)?;
            }
            Opcode::Halt => return Ok(Some(self.stack.pop().unwrap_or_default())),
            binary => {
                let op = binary_op(binary).ok_or(BytecodeError::InvalidOpcode { offset: ip, word })?;
                let right = self.pop()?;
                let left = self.pop()?;
                self.stack.push(ops::binary(op, &left, &right)?);
            }
        }
        Ok(None)
    }

    //=================================================
    // Section 1.1 - Frames and operands
    //=================================================

    fn operand(&self, ip: usize, index: usize) -> u32 {
        self.program.code.get(ip + 1 + index).copied().unwrap_or(0)
    }

    fn bad_operand(&self, what: &'static str, index: u32) -> BytecodeError {
        BytecodeError::BadOperand {
            offset: self.current_offset,
            what,
            index,
        }
    }

    fn name_operand(&self, index: u32) -> Step<Symbol> {
        self.program
            .name(index)
            .cloned()
            .ok_or_else(|| self.bad_operand("name", index).into())
    }

    fn frame(&self) -> Step<&Frame> {
        self.frames
            .last()
            .ok_or(Unwind::Vm(VmError::StackUnderflow(self.current_offset)))
    }

    fn frame_mut(&mut self) -> Step<&mut Frame> {
        let offset = self.current_offset;
        self.frames
            .last_mut()
            .ok_or(Unwind::Vm(VmError::StackUnderflow(offset)))
    }

    fn set_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    /// Backward jumps are safe points.
    fn jump(&mut self, from: usize, target: usize) {
        self.set_ip(target);
        if target <= from {
            self.safepoint();
        }
    }

    fn pop(&mut self) -> Step<Value> {
        let floor = self.frames.last().map_or(0, |frame| frame.stack_base);
        if self.stack.len() <= floor {
            return Err(VmError::StackUnderflow(self.current_offset).into());
        }
        self.stack
            .pop()
            .ok_or(Unwind::Vm(VmError::StackUnderflow(self.current_offset)))
    }

    fn pop_n(&mut self, count: usize) -> Step<Vec<Value>> {
        let floor = self.frames.last().map_or(0, |frame| frame.stack_base);
        if self.stack.len() < floor + count {
            return Err(VmError::StackUnderflow(self.current_offset).into());
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    //=================================================
    // Section 2.0 - Calls
    //=================================================

    /// Pushes a frame for `index`. Arguments then captures fill the first
    /// slots, each placed in the home the register allocator chose.
    fn call_function(&mut self, index: u32, args: Vec<Value>, captures: Vec<Value>) -> Step {
        let entry = self
            .program
            .functions
            .get(index as usize)
            .ok_or_else(|| self.bad_operand("function", index))?;
        if args.len() != usize::from(entry.arity) {
            return Err(RuntimeFault::ArityError {
                name: entry.name.to_string(),
                expected: usize::from(entry.arity),
                found: args.len(),
            }
            .into());
        }
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeFault::StackOverflow(self.config.max_call_depth).into());
        }
        let mut locals = vec![Value::Null; usize::from(entry.locals)];
        let mut registers = vec![Value::Null; REGISTER_COUNT];
        for (slot, value) in args.into_iter().chain(captures).enumerate() {
            match entry.homes.get(slot) {
                Some(SlotHome::Register(register)) => {
                    if let Some(target) = registers.get_mut(usize::from(*register)) {
                        *target = value;
                    }
                }
                Some(SlotHome::Local(local)) => {
                    if let Some(target) = locals.get_mut(usize::from(*local)) {
                        *target = value;
                    }
                }
                None => {}
            }
        }
        self.profile.record_function(entry.name.as_str());
        self.frames.push(Frame {
            function: index,
            ip: entry.start as usize,
            locals,
            registers,
            stack_base: self.stack.len(),
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Step {
        match callee {
            Value::Function(index) => self.call_function(index, args, Vec::new()),
            Value::Object(reference) => {
                let closure = match self.collector.heap().get(reference) {
                    Some(HeapObject::Closure { function, captures }) => Some((*function, captures.clone())),
                    _ => None,
                };
                match closure {
                    Some((function, captures)) => self.call_function(function, args, captures),
                    None => Err(RuntimeFault::TypeError("object is not callable".to_string()).into()),
                }
            }
            Value::Null => Err(RuntimeFault::NullReference("call of null".to_string()).into()),
            other => Err(RuntimeFault::TypeError(format!("value of type {} is not callable", other.type_name())).into()),
        }
    }

    fn call_native(&mut self, name: &str, args: Vec<Value>) -> Step {
        let mut context = NativeContext {
            program: &self.program,
            collector: &self.collector,
            output: &mut self.output,
            collect_requested: false,
        };
        let result = self.natives.call(name, &mut context, &args);
        let collect = context.collect_requested;
        self.stack.push(result?);
        if collect {
            self.collect_garbage();
        }
        Ok(())
    }

    /// Class methods first, then array and string helpers, then a callable
    /// stored in a field of that name.
    fn call_method(&mut self, receiver: Value, name: &str, args: Vec<Value>) -> Step {
        enum Target {
            Method(u32),
            Field(Value),
            Array,
        }
        let reference = match &receiver {
            Value::Object(reference) => *reference,
            Value::Str(text) if name == "len" && args.is_empty() => {
                self.stack.push(Value::Int(text.chars().count() as i64));
                return Ok(());
            }
            Value::Null => {
                return Err(RuntimeFault::NullReference(format!("call of method '{name}' on null")).into());
            }
            other => {
                return Err(RuntimeFault::TypeError(format!(
                    "{} has no method '{name}'",
                    other.type_name()
                ))
                .into());
            }
        };
        let target = {
            let heap = self.collector.heap();
            match heap.get(reference) {
                Some(HeapObject::Object { kind, fields }) => {
                    let method = match kind {
                        ObjectKind::Class(class) => self.program.find_method(*class, name),
                        ObjectKind::Struct(_) => None,
                    };
                    match method {
                        Some(function) => Some(Target::Method(function)),
                        None => self
                            .field_index(*kind, name)
                            .and_then(|index| fields.get(index).cloned())
                            .map(Target::Field),
                    }
                }
                Some(HeapObject::Array(_)) if matches!(name, "len" | "push" | "pop") => Some(Target::Array),
                _ => None,
            }
        };
        match target {
            Some(Target::Method(function)) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend(args);
                self.call_function(function, full, Vec::new())
            }
            Some(Target::Field(callee)) => self.call_value(callee, args),
            Some(Target::Array) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(receiver);
                full.extend(args);
                self.call_native(name, full)
            }
            None => {
                let type_name = type_name_of(&self.program, &self.collector.heap(), &receiver);
                Err(RuntimeFault::TypeError(format!("{type_name} has no method '{name}'")).into())
            }
        }
    }

    //=================================================
    // Section 3.0 - Heap access
    //=================================================

    fn allocate(&mut self, object: HeapObject) -> Value {
        let kind = object.kind_name();
        let (reference, bytes) = self.collector.allocate(object);
        for observer in &mut self.observers {
            observer.on_alloc(reference, kind, bytes);
        }
        Value::Object(reference)
    }

    fn field_index(&self, kind: ObjectKind, field: &str) -> Option<usize> {
        let names = match kind {
            ObjectKind::Class(index) => &self.program.classes.get(index as usize)?.fields,
            ObjectKind::Struct(index) => &self.program.structs.get(index as usize)?.fields,
        };
        names.iter().position(|name| name.as_str() == field)
    }

    fn object_ref(value: &Value, action: impl FnOnce() -> String) -> Result<GcRef, RuntimeFault> {
        match value {
            Value::Object(reference) => Ok(*reference),
            Value::Null => Err(RuntimeFault::NullReference(action())),
            other => Err(RuntimeFault::TypeError(format!("{} on {}", action(), other.type_name()))),
        }
    }

    fn get_field(&self, object: &Value, field: &str) -> Result<Value, RuntimeFault> {
        let reference = Self::object_ref(object, || format!("read of field '{field}'"))?;
        let heap = self.collector.heap();
        match heap.get(reference) {
            Some(HeapObject::Object { kind, fields }) => self
                .field_index(*kind, field)
                .and_then(|index| fields.get(index).cloned())
                .ok_or_else(|| {
                    RuntimeFault::TypeError(format!(
                        "{} has no field '{field}'",
                        type_name_of(&self.program, &heap, object)
                    ))
                }),
            Some(other) => Err(RuntimeFault::TypeError(format!(
                "cannot read field '{field}' of {}",
                other.kind_name()
            ))),
            None => Err(RuntimeFault::NullReference(format!("read of field '{field}'"))),
        }
    }

    fn set_field(&self, object: &Value, field: &str, value: Value) -> Result<(), RuntimeFault> {
        let reference = Self::object_ref(object, || format!("write of field '{field}'"))?;
        let mut heap = self.collector.heap();
        let kind = match heap.get(reference) {
            Some(HeapObject::Object { kind, .. }) => *kind,
            Some(other) => {
                return Err(RuntimeFault::TypeError(format!(
                    "cannot write field '{field}' of {}",
                    other.kind_name()
                )));
            }
            None => return Err(RuntimeFault::NullReference(format!("write of field '{field}'"))),
        };
        let index = self
            .field_index(kind, field)
            .ok_or_else(|| RuntimeFault::TypeError(format!("object has no field '{field}'")))?;
        if let Some(HeapObject::Object { fields, .. }) = heap.get_mut(reference) {
            if let Some(slot) = fields.get_mut(index) {
                *slot = value;
            }
        }
        Ok(())
    }

    fn index_value(&self, object: &Value, index: &Value) -> Result<Value, RuntimeFault> {
        let position = expect_index(index)?;
        if let Value::Str(text) = object {
            let len = text.chars().count();
            return usize::try_from(position)
                .ok()
                .and_then(|at| text.chars().nth(at))
                .map(|c| Value::str(c.encode_utf8(&mut [0; 4])))
                .ok_or(RuntimeFault::IndexError { index: position, len });
        }
        let reference = Self::object_ref(object, || "indexing".to_string())?;
        match self.collector.heap().get(reference) {
            Some(HeapObject::Array(items)) => usize::try_from(position)
                .ok()
                .and_then(|at| items.get(at).cloned())
                .ok_or(RuntimeFault::IndexError {
                    index: position,
                    len: items.len(),
                }),
            Some(other) => Err(RuntimeFault::TypeError(format!("cannot index {}", other.kind_name()))),
            None => Err(RuntimeFault::NullReference("indexing".to_string())),
        }
    }

    fn store_index(&self, object: &Value, index: &Value, value: Value) -> Result<(), RuntimeFault> {
        let position = expect_index(index)?;
        let reference = Self::object_ref(object, || "index assignment".to_string())?;
        match self.collector.heap().get_mut(reference) {
            Some(HeapObject::Array(items)) => {
                let len = items.len();
                let slot = usize::try_from(position)
                    .ok()
                    .and_then(|at| items.get_mut(at))
                    .ok_or(RuntimeFault::IndexError { index: position, len })?;
                *slot = value;
                Ok(())
            }
            Some(other) => Err(RuntimeFault::TypeError(format!("cannot index {}", other.kind_name()))),
            None => Err(RuntimeFault::NullReference("index assignment".to_string())),
        }
    }

    fn deref(&self, pointer: &Value) -> Result<Value, RuntimeFault> {
        let reference = Self::object_ref(pointer, || "dereference".to_string())?;
        match self.collector.heap().get(reference) {
            Some(HeapObject::Cell(value)) => Ok(value.clone()),
            Some(other) => Err(RuntimeFault::TypeError(format!("cannot dereference {}", other.kind_name()))),
            None => Err(RuntimeFault::NullReference("dereference".to_string())),
        }
    }

    fn store_deref(&self, pointer: &Value, value: Value) -> Result<(), RuntimeFault> {
        let reference = Self::object_ref(pointer, || "store through pointer".to_string())?;
        match self.collector.heap().get_mut(reference) {
            Some(HeapObject::Cell(slot)) => {
                *slot = value;
                Ok(())
            }
            Some(other) => Err(RuntimeFault::TypeError(format!("cannot store through {}", other.kind_name()))),
            None => Err(RuntimeFault::NullReference("store through pointer".to_string())),
        }
    }

    //=================================================
    // Section 4.0 - Garbage collection
    //=================================================

    fn safepoint(&mut self) {
        if self.collector.collection_pending() {
            self.collect_garbage();
        }
    }

    /// Runs a full cycle from the current roots.
    pub fn collect_garbage(&mut self) -> CycleReport {
        let roots = self.roots();
        let report = self.collector.collect(roots);
        for observer in &mut self.observers {
            for reference in &report.swept {
                observer.on_free(*reference);
            }
            observer.on_collect(&report);
        }
        self.profile.record_collection(report.swept.len());
        report
    }

    /// Globals, the operand stack, every frame's locals and registers, and
    /// the exception in flight.
    fn roots(&self) -> Vec<GcRef> {
        let mut roots = Vec::new();
        for value in self.globals.values() {
            value.trace(&mut roots);
        }
        self.stack.as_slice().trace(&mut roots);
        for frame in &self.frames {
            frame.locals.as_slice().trace(&mut roots);
            frame.registers.as_slice().trace(&mut roots);
        }
        if let Some(in_flight) = &self.in_flight {
            in_flight.value.trace(&mut roots);
        }
        roots
    }
}

fn expect_index(index: &Value) -> Result<i64, RuntimeFault> {
    index
        .as_int()
        .ok_or_else(|| RuntimeFault::TypeError(format!("index must be an int, got {}", index.type_name())))
}

fn binary_op(opcode: Opcode) -> Option<BinaryOp> {
    Some(match opcode {
        Opcode::Add => BinaryOp::Add,
        Opcode::Sub => BinaryOp::Subtract,
        Opcode::Mul => BinaryOp::Multiply,
        Opcode::Div => BinaryOp::Divide,
        Opcode::Mod => BinaryOp::Modulo,
        Opcode::Eq => BinaryOp::Equal,
        Opcode::Ne => BinaryOp::NotEqual,
        Opcode::Lt => BinaryOp::Less,
        Opcode::Le => BinaryOp::LessEqual,
        Opcode::Gt => BinaryOp::Greater,
        Opcode::Ge => BinaryOp::GreaterEqual,
        Opcode::And => BinaryOp::And,
        Opcode::Or => BinaryOp::Or,
        Opcode::BitAnd => BinaryOp::BitwiseAnd,
        Opcode::BitOr => BinaryOp::BitwiseOr,
        Opcode::BitXor => BinaryOp::BitwiseXor,
        Opcode::Shl => BinaryOp::LeftShift,
        Opcode::Shr => BinaryOp::RightShift,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::FunctionEntry;
    use crate::config::GcConfig;
    use crate::runtime::Constant;

    fn config() -> StrataConfig {
        StrataConfig {
            gc: GcConfig {
                background: false,
                ..GcConfig::default()
            },
            ..StrataConfig::default()
        }
    }

    fn main_only(constants: Vec<Constant>, code: Vec<u32>) -> CompiledProgram {
        let end = code.len() as u32;
        CompiledProgram {
            constants,
            code,
            functions: vec![FunctionEntry {
                name: Symbol::from("__main__"),
                start: 0,
                end,
                arity: 0,
                captures: 0,
                locals: 0,
                homes: Vec::new(),
            }],
            ..CompiledProgram::default()
        }
    }

    #[test]
    fn arithmetic_runs_to_a_result() {
        let program = main_only(
            vec![Constant::Int(6), Constant::Int(7)],
            vec![
                Opcode::Push.word(),
                0,
                Opcode::Push.word(),
                1,
                Opcode::Mul.word(),
                Opcode::Return.word(),
            ],
        );
        let mut vm = Vm::new(program, &config());
        assert_eq!(vm.run().expect("run"), Value::Int(42));
    }

    #[test]
    fn step_limit_stops_infinite_loops() {
        let program = main_only(Vec::new(), vec![Opcode::Jump.word(), 0]);
        let mut config = config();
        config.vm.step_limit = Some(100);
        let mut vm = Vm::new(program, &config);
        assert!(matches!(vm.run(), Err(VmError::StepLimit(100))));
    }

    struct Doubler;

    impl OpcodeExtension for Doubler {
        fn name(&self) -> &str {
            "double"
        }

        fn execute(&mut self, stack: &mut Vec<Value>) -> Result<(), RuntimeFault> {
            match stack.pop() {
                Some(Value::Int(n)) => {
                    stack.push(Value::Int(n * 2));
                    Ok(())
                }
                _ => Err(RuntimeFault::TypeError("double expects an int".to_string())),
            }
        }
    }

    #[test]
    fn extensions_run_through_ext() {
        let program = main_only(
            vec![Constant::Int(21)],
            vec![Opcode::Push.word(), 0, Opcode::Ext.word(), 0, Opcode::Return.word()],
        );
        let mut vm = Vm::new(program, &config());
        assert_eq!(vm.register_extension(Box::new(Doubler)), 0);
        assert_eq!(vm.run().expect("run"), Value::Int(42));
    }

    #[test]
    fn unknown_extensions_are_errors() {
        let program = main_only(Vec::new(), vec![Opcode::Ext.word(), 3, Opcode::Halt.word()]);
        let mut vm = Vm::new(program, &config());
        assert!(matches!(vm.run(), Err(VmError::UnknownExtension(3))));
    }
}
