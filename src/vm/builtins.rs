//=====================================================
// File: vm/builtins.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Native functions callable from every program
// Objective: Keep a name -> function registry, check arities against the
//            shared native table and render values for printing
//=====================================================

use std::collections::HashMap;
use std::fmt::Write;

use crate::bytecode::CompiledProgram;
use crate::memory::{Collector, Heap, HeapObject, ObjectKind};
use crate::runtime::{RuntimeFault, Value, native_spec};

pub type NativeResult = Result<Value, RuntimeFault>;
pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> NativeResult;

/// Where `print` and `println` write.
#[derive(Debug, Default)]
pub enum Output {
    #[default]
    Stdout,
    Captured(String),
}

impl Output {
    fn write(&mut self, text: &str) {
        match self {
            Output::Stdout => print!("{text}"),
            Output::Captured(buffer) => buffer.push_str(text),
        }
    }
}

/// What a native function may touch while it runs.
pub struct NativeContext<'a> {
    pub program: &'a CompiledProgram,
    pub collector: &'a Collector,
    pub output: &'a mut Output,
    /// Set by `gc()`; the machine collects once the call returns.
    pub collect_requested: bool,
}

impl NativeContext<'_> {
    pub fn render(&self, value: &Value) -> String {
        render_value(self.program, &self.collector.heap(), value)
    }
}

#[derive(Clone, Default)]
pub struct Natives {
    sync: HashMap<String, NativeFn>,
}

impl Natives {
    pub fn new() -> Self {
        let mut natives = Self::default();
        natives.register_sync("print", native_print);
        natives.register_sync("println", native_println);
        natives.register_sync("len", native_len);
        natives.register_sync("push", native_push);
        natives.register_sync("pop", native_pop);
        natives.register_sync("str", native_str);
        natives.register_sync("int", native_int);
        natives.register_sync("float", native_float);
        natives.register_sync("sqrt", native_sqrt);
        natives.register_sync("abs", native_abs);
        natives.register_sync("floor", native_floor);
        natives.register_sync("pow", native_pow);
        natives.register_sync("type_of", native_type_of);
        natives.register_sync("assert", native_assert);
        natives.register_sync("gc", native_gc);
        natives
    }

    pub fn register_sync(&mut self, name: &str, func: NativeFn) {
        self.sync.insert(name.to_string(), func);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sync.contains_key(name)
    }

    pub fn call(&self, name: &str, context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
        let func = self
            .sync
            .get(name)
            .ok_or_else(|| RuntimeFault::UndefinedVariable(name.to_string()))?;
        if let Some(spec) = native_spec(name) {
            if args.len() < spec.min_args || args.len() > spec.max_args {
                return Err(RuntimeFault::ArityError {
                    name: name.to_string(),
                    expected: spec.min_args,
                    found: args.len(),
                });
            }
        }
        func(context, args)
    }
}

/// Text form used by `print`, `str` and fault messages.
pub fn render_value(program: &CompiledProgram, heap: &Heap, value: &Value) -> String {
    let mut out = String::new();
    render_into(program, heap, value, 0, &mut out);
    out
}

const RENDER_DEPTH: usize = 8;

fn render_into(program: &CompiledProgram, heap: &Heap, value: &Value, depth: usize, out: &mut String) {
    let reference = match value {
        Value::Function(index) => {
            let name = program
                .functions
                .get(*index as usize)
                .map_or("?", |f| f.name.as_str());
            let _ = write!(out, "<fn {name}>");
            return;
        }
        Value::Object(reference) => *reference,
        other => {
            let _ = write!(out, "{other}");
            return;
        }
    };
    if depth >= RENDER_DEPTH {
        out.push_str("...");
        return;
    }
    match heap.get(reference) {
        None => out.push_str("<freed>"),
        Some(HeapObject::Array(items)) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_into(program, heap, item, depth + 1, out);
            }
            out.push(']');
        }
        Some(HeapObject::Object { kind, fields }) => {
            let (name, names) = match kind {
                ObjectKind::Class(index) => program
                    .classes
                    .get(*index as usize)
                    .map(|c| (c.name.as_str(), c.fields.as_slice())),
                ObjectKind::Struct(index) => program
                    .structs
                    .get(*index as usize)
                    .map(|s| (s.name.as_str(), s.fields.as_slice())),
            }
            .unwrap_or(("?", &[][..]));
            out.push_str(name);
            out.push_str(" {");
            for (i, (field, value)) in names.iter().zip(fields).enumerate() {
                out.push_str(if i == 0 { " " } else { ", " });
                let _ = write!(out, "{field}: ");
                render_into(program, heap, value, depth + 1, out);
            }
            out.push_str(if fields.is_empty() { "}" } else { " }" });
        }
        Some(HeapObject::Closure { function, .. }) => {
            let name = program
                .functions
                .get(*function as usize)
                .map_or("?", |f| f.name.as_str());
            let _ = write!(out, "<closure {name}>");
        }
        Some(HeapObject::Cell(inner)) => {
            out.push('&');
            render_into(program, heap, inner, depth + 1, out);
        }
    }
}

/// Runtime type name; objects report their class or struct.
pub fn type_name_of(program: &CompiledProgram, heap: &Heap, value: &Value) -> String {
    let Value::Object(reference) = value else {
        return value.type_name().to_string();
    };
    match heap.get(*reference) {
        Some(HeapObject::Object {
            kind: ObjectKind::Class(index),
            ..
        }) => program
            .classes
            .get(*index as usize)
            .map_or_else(|| "object".to_string(), |c| c.name.to_string()),
        Some(HeapObject::Object {
            kind: ObjectKind::Struct(index),
            ..
        }) => program
            .structs
            .get(*index as usize)
            .map_or_else(|| "struct".to_string(), |s| s.name.to_string()),
        Some(object) => object.kind_name().to_string(),
        None => "null".to_string(),
    }
}

fn number(name: &str, value: &Value) -> Result<f64, RuntimeFault> {
    value
        .as_float()
        .ok_or_else(|| RuntimeFault::TypeError(format!("{name} expects a number, got {}", value.type_name())))
}

fn array_ref(name: &str, value: &Value) -> Result<crate::memory::GcRef, RuntimeFault> {
    match value {
        Value::Object(reference) => Ok(*reference),
        Value::Null => Err(RuntimeFault::NullReference(format!("{name} on null"))),
        other => Err(RuntimeFault::TypeError(format!(
            "{name} expects an array, got {}",
            other.type_name()
        ))),
    }
}

fn native_print(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let text = context.render(&args[0]);
    context.output.write(&text);
    Ok(Value::Null)
}

fn native_println(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let mut text = context.render(&args[0]);
    text.push('\n');
    context.output.write(&text);
    Ok(Value::Null)
}

fn native_len(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match &args[0] {
        Value::Str(text) => Ok(Value::Int(text.chars().count() as i64)),
        value => {
            let reference = array_ref("len", value)?;
            match context.collector.heap().get(reference) {
                Some(HeapObject::Array(items)) => Ok(Value::Int(items.len() as i64)),
                Some(HeapObject::Object { fields, .. }) => Ok(Value::Int(fields.len() as i64)),
                _ => Err(RuntimeFault::TypeError("len expects a string or array".to_string())),
            }
        }
    }
}

fn native_push(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let reference = array_ref("push", &args[0])?;
    let mut heap = context.collector.heap();
    let len = match heap.get_mut(reference) {
        Some(HeapObject::Array(items)) => {
            items.push(args[1].clone());
            items.len()
        }
        _ => return Err(RuntimeFault::TypeError("push expects an array".to_string())),
    };
    heap.resize(reference);
    Ok(Value::Int(len as i64))
}

fn native_pop(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let reference = array_ref("pop", &args[0])?;
    let mut heap = context.collector.heap();
    let popped = match heap.get_mut(reference) {
        Some(HeapObject::Array(items)) => items
            .pop()
            .ok_or(RuntimeFault::IndexError { index: -1, len: 0 })?,
        _ => return Err(RuntimeFault::TypeError("pop expects an array".to_string())),
    };
    heap.resize(reference);
    Ok(popped)
}

fn native_str(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    Ok(Value::str(&context.render(&args[0])))
}

fn native_int(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        Value::Float(n) => Ok(Value::Int(n.trunc() as i64)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Str(text) => text
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| RuntimeFault::TypeError(format!("cannot convert '{text}' to int"))),
        other => Err(RuntimeFault::TypeError(format!(
            "cannot convert {} to int",
            other.type_name()
        ))),
    }
}

fn native_float(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match &args[0] {
        Value::Str(text) => text
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| RuntimeFault::TypeError(format!("cannot convert '{text}' to float"))),
        Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
        other => number("float", other).map(Value::Float),
    }
}

fn native_sqrt(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    Ok(Value::Float(number("sqrt", &args[0])?.sqrt()))
}

fn native_abs(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(n.wrapping_abs())),
        other => Ok(Value::Float(number("abs", other)?.abs())),
    }
}

fn native_floor(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match &args[0] {
        Value::Int(n) => Ok(Value::Int(*n)),
        other => Ok(Value::Int(number("floor", other)?.floor() as i64)),
    }
}

fn native_pow(_context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    match (&args[0], &args[1]) {
        (Value::Int(base), Value::Int(exp)) if (0..=u32::MAX as i64).contains(exp) => {
            Ok(Value::Int(base.wrapping_pow(*exp as u32)))
        }
        (base, exp) => Ok(Value::Float(number("pow", base)?.powf(number("pow", exp)?))),
    }
}

fn native_type_of(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let name = type_name_of(context.program, &context.collector.heap(), &args[0]);
    Ok(Value::str(&name))
}

fn native_assert(context: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    if args[0].is_truthy() {
        return Ok(Value::Null);
    }
    let message = match args.get(1) {
        Some(message) => context.render(message),
        None => format!("condition was {}", args[0]),
    };
    Err(RuntimeFault::AssertionError(message))
}

fn native_gc(context: &mut NativeContext<'_>, _args: &[Value]) -> NativeResult {
    context.collect_requested = true;
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;

    fn context<'a>(
        program: &'a CompiledProgram,
        collector: &'a Collector,
        output: &'a mut Output,
    ) -> NativeContext<'a> {
        NativeContext {
            program,
            collector,
            output,
            collect_requested: false,
        }
    }

    fn foreground() -> GcConfig {
        GcConfig {
            background: false,
            ..GcConfig::default()
        }
    }

    #[test]
    fn println_writes_rendered_arrays() {
        let program = CompiledProgram::default();
        let collector = Collector::new(&foreground());
        let (array, _) = collector.allocate(HeapObject::Array(vec![Value::Int(1), Value::str("a")]));
        let mut output = Output::Captured(String::new());
        let natives = Natives::new();
        let mut ctx = context(&program, &collector, &mut output);
        natives
            .call("println", &mut ctx, &[Value::Object(array)])
            .expect("println");
        drop(ctx);
        match output {
            Output::Captured(text) => assert_eq!(text, "[1, a]\n"),
            Output::Stdout => panic!("expected captured output"),
        }
    }

    #[test]
    fn arity_is_checked_against_the_native_table() {
        let program = CompiledProgram::default();
        let collector = Collector::new(&foreground());
        let mut output = Output::Captured(String::new());
        let natives = Natives::new();
        let mut ctx = context(&program, &collector, &mut output);
        let err = natives.call("sqrt", &mut ctx, &[]).expect_err("arity");
        assert!(matches!(err, RuntimeFault::ArityError { expected: 1, found: 0, .. }));
    }

    #[test]
    fn failed_assertions_carry_the_message() {
        let program = CompiledProgram::default();
        let collector = Collector::new(&foreground());
        let mut output = Output::Captured(String::new());
        let natives = Natives::new();
        let mut ctx = context(&program, &collector, &mut output);
        let err = natives
            .call("assert", &mut ctx, &[Value::Bool(false), Value::str("boom")])
            .expect_err("assert");
        assert_eq!(err, RuntimeFault::AssertionError("boom".to_string()));
    }

    #[test]
    fn conversions() {
        let program = CompiledProgram::default();
        let collector = Collector::new(&foreground());
        let mut output = Output::Captured(String::new());
        let natives = Natives::new();
        let mut ctx = context(&program, &collector, &mut output);
        assert_eq!(natives.call("int", &mut ctx, &[Value::str(" 42 ")]), Ok(Value::Int(42)));
        assert_eq!(natives.call("floor", &mut ctx, &[Value::Float(2.7)]), Ok(Value::Int(2)));
        assert_eq!(natives.call("pow", &mut ctx, &[Value::Int(2), Value::Int(10)]), Ok(Value::Int(1024)));
        assert!(natives.call("int", &mut ctx, &[Value::str("x")]).is_err());
    }
}
