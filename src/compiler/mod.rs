//=====================================================
// File: compiler/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Lower the checked AST to Strata bytecode
// Objective: Lay out one contiguous code range per function, resolve names
//            to slots, functions, natives or globals, and build the class,
//            struct, enum, handler and debug tables alongside the code
//=====================================================

mod asm;

use std::collections::{HashMap, HashSet, VecDeque};

use thiserror::Error;
use tracing::{debug, instrument, trace};

use crate::ast::{
    BinaryOp, CatchClause, ClassDecl, Expr, ExprKind, FunctionDecl, MatchArm, Param,
    Pattern, Position, Stmt, StmtKind, TypeExpr, UnaryOp,
};
use crate::bytecode::spec::{
    CatchEntry, ClassEntry, CompiledProgram, DebugEntry, DeclaredSymbol, EnumEntry,
    FunctionEntry, HandlerEntry, InterfaceEntry, Opcode, SlotHome, StructEntry,
};
use crate::optimizer::rewrite::mentioned_in_block;
use crate::runtime::{BUILTIN_EXCEPTIONS, Constant, ERROR_CLASS, MESSAGE_FIELD, native_spec};
use crate::symbol::Symbol;
use crate::typeck::TypedProgram;

/// Name of function 0, which runs the top-level statements.
pub const MAIN_FUNCTION: &str = "__main__";
/// Method run by `new C(args)` after field initializers.
pub const CONSTRUCTOR: &str = "init";
/// Bytes charged per field or scalar by `sizeof`.
pub const WORD_SIZE: i64 = 8;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("unknown class '{name}' at {position}")]
    UnknownClass { name: Symbol, position: Position },
    #[error("unknown struct '{name}' at {position}")]
    UnknownStruct { name: Symbol, position: Position },
    #[error("struct '{name}' has no field '{field}' ({position})")]
    UnknownField {
        name: Symbol,
        field: Symbol,
        position: Position,
    },
    #[error("unknown enum variant '{enum_name}::{variant}' at {position}")]
    UnknownVariant {
        enum_name: Symbol,
        variant: Symbol,
        position: Position,
    },
    #[error("class '{class}' has no init method but was given {found} argument(s) ({position})")]
    ConstructorArity {
        class: Symbol,
        found: usize,
        position: Position,
    },
    #[error("class '{name}' inherits from itself ({position})")]
    InheritanceCycle { name: Symbol, position: Position },
    #[error("invalid assignment target at {0}")]
    InvalidAssignmentTarget(Position),
    #[error("'{keyword}' outside of a loop at {position}")]
    OutsideLoop {
        keyword: &'static str,
        position: Position,
    },
    #[error("unbalanced assembly at {position}: {detail}")]
    UnbalancedAssembly { detail: String, position: Position },
    #[error("undefined label '{label}' at {position}")]
    UndefinedLabel { label: Symbol, position: Position },
    #[error("label '{label}' defined twice ({position})")]
    DuplicateLabel { label: Symbol, position: Position },
    #[error("'{name}' is not a callable function in assembly ({position})")]
    UnknownCallTarget { name: Symbol, position: Position },
    #[error("too many {what} at {position}")]
    TooMany {
        what: &'static str,
        position: Position,
    },
    #[error("{what} is not supported here ({position})")]
    Unsupported { what: String, position: Position },
}

impl CompileError {
    pub fn position(&self) -> Position {
        match self {
            CompileError::UnknownClass { position, .. }
            | CompileError::UnknownStruct { position, .. }
            | CompileError::UnknownField { position, .. }
            | CompileError::UnknownVariant { position, .. }
            | CompileError::ConstructorArity { position, .. }
            | CompileError::InheritanceCycle { position, .. }
            | CompileError::OutsideLoop { position, .. }
            | CompileError::UnbalancedAssembly { position, .. }
            | CompileError::UndefinedLabel { position, .. }
            | CompileError::DuplicateLabel { position, .. }
            | CompileError::UnknownCallTarget { position, .. }
            | CompileError::TooMany { position, .. }
            | CompileError::Unsupported { position, .. } => *position,
            CompileError::InvalidAssignmentTarget(position) => *position,
        }
    }
}

type CompileResult<T> = Result<T, CompileError>;

/// Compiles a checked program. Only called when checking raised no errors.
#[instrument(skip_all, fields(statements = typed.program.statements.len()))]
pub fn compile(typed: &TypedProgram) -> CompileResult<CompiledProgram> {
    let mut compiler = Compiler::new(typed);
    compiler.declare_program()?;
    while let Some(pending) = compiler.queue.pop_front() {
        compiler.compile_function(pending)?;
    }
    let program = compiler.finish();
    debug!(
        functions = program.functions.len(),
        words = program.code.len(),
        constants = program.constants.len(),
        "compile finished"
    );
    Ok(program)
}

//=====================================================
// Section 1.0 - Compiler state
//=====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Slot(u16),
    /// Local function that captures nothing; called directly.
    Function(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    Slot(u16),
    Function(u32),
    Native,
    Global,
}

enum Body<'a> {
    Main(&'a [Stmt]),
    Statements(&'a [Stmt]),
    ErrorInit,
}

struct Pending<'a> {
    index: u32,
    params: Vec<Symbol>,
    captures: Vec<Symbol>,
    statics: Vec<(Symbol, u32)>,
    body: Body<'a>,
}

#[derive(Default)]
struct LoopContext {
    breaks: Vec<usize>,
    continues: Vec<usize>,
    try_depth: usize,
}

struct FunctionState<'a> {
    index: u32,
    is_main: bool,
    scopes: Vec<HashMap<Symbol, Binding>>,
    next_slot: u16,
    loops: Vec<LoopContext>,
    /// Finally blocks of the try regions enclosing the current point.
    tries: Vec<Option<&'a [Stmt]>>,
    /// Field initializers only see globals.
    global_only: bool,
}

impl FunctionState<'_> {
    fn new(index: u32, is_main: bool) -> Self {
        Self {
            index,
            is_main,
            scopes: vec![HashMap::new()],
            next_slot: 0,
            loops: Vec::new(),
            tries: Vec::new(),
            global_only: false,
        }
    }
}

pub(crate) struct Compiler<'a> {
    typed: &'a TypedProgram,
    program: CompiledProgram,
    names: HashMap<Symbol, u32>,
    functions: HashMap<Symbol, u32>,
    global_names: HashSet<Symbol>,
    class_decls: HashMap<Symbol, &'a ClassDecl>,
    structs: HashMap<Symbol, u32>,
    enums: HashMap<(Symbol, Symbol), i64>,
    interfaces: HashMap<Symbol, u32>,
    /// Local function declarations already bound by block hoisting.
    hoisted: HashSet<*const FunctionDecl>,
    queue: VecDeque<Pending<'a>>,
    state: FunctionState<'a>,
}

impl<'a> Compiler<'a> {
    fn new(typed: &'a TypedProgram) -> Self {
        Self {
            typed,
            program: CompiledProgram::default(),
            names: HashMap::new(),
            functions: HashMap::new(),
            global_names: HashSet::new(),
            class_decls: HashMap::new(),
            structs: HashMap::new(),
            enums: HashMap::new(),
            interfaces: HashMap::new(),
            hoisted: HashSet::new(),
            queue: VecDeque::new(),
            state: FunctionState::new(0, true),
        }
    }

    fn finish(mut self) -> CompiledProgram {
        self.program.symbols = self
            .typed
            .symbols
            .iter()
            .map(|info| DeclaredSymbol {
                name: info.name.clone(),
                kind: info.kind.to_string(),
                ty: info.ty.to_string(),
            })
            .collect();
        self.program
    }

    //=================================================
    // Section 1.1 - Tables
    //=================================================

    fn constant(&mut self, constant: Constant) -> u32 {
        if let Some(index) = self
            .program
            .constants
            .iter()
            .position(|existing| existing.same_as(&constant))
        {
            return index as u32;
        }
        self.program.constants.push(constant);
        (self.program.constants.len() - 1) as u32
    }

    fn name(&mut self, name: &str) -> u32 {
        if let Some(index) = self.names.get(name) {
            return *index;
        }
        let index = self.program.names.len() as u32;
        let symbol = Symbol::from(name);
        self.program.names.push(symbol.clone());
        self.names.insert(symbol, index);
        index
    }

    fn reserve_function(&mut self, name: &str, arity: usize, captures: usize, position: Position) -> CompileResult<u32> {
        let arity = u16::try_from(arity).map_err(|_| CompileError::TooMany {
            what: "parameters",
            position,
        })?;
        let captures = u16::try_from(captures).map_err(|_| CompileError::TooMany {
            what: "captured variables",
            position,
        })?;
        self.program.functions.push(FunctionEntry {
            name: Symbol::from(name),
            start: 0,
            end: 0,
            arity,
            captures,
            locals: 0,
            homes: Vec::new(),
        });
        Ok((self.program.functions.len() - 1) as u32)
    }

    //=================================================
    // Section 1.2 - Emission
    //=================================================

    fn here(&self) -> usize {
        self.program.code.len()
    }

    fn emit(&mut self, opcode: Opcode, operands: &[u32]) -> usize {
        debug_assert_eq!(operands.len(), opcode.operand_count(), "{opcode}");
        let offset = self.here();
        self.program.code.push(opcode.word());
        self.program.code.extend_from_slice(operands);
        offset
    }

    fn emit_op(&mut self, opcode: Opcode) -> usize {
        self.emit(opcode, &[])
    }

    /// Emits a jump with a placeholder target; returns the operand position.
    fn emit_jump(&mut self, opcode: Opcode) -> usize {
        self.emit(opcode, &[u32::MAX]) + 1
    }

    fn patch(&mut self, operand_at: usize, target: usize) {
        self.program.code[operand_at] = target as u32;
    }

    fn emit_constant(&mut self, constant: Constant) {
        let index = self.constant(constant);
        self.emit(Opcode::Push, &[index]);
    }

    fn emit_null(&mut self) {
        self.emit_constant(Constant::Null);
    }

    fn mark(&mut self, position: Position) {
        let entry = DebugEntry {
            offset: self.here() as u32,
            line: position.line as u32,
            column: position.column as u32,
            function: self.state.index,
        };
        match self.program.debug.last_mut() {
            Some(last) if last.offset == entry.offset => *last = entry,
            _ => self.program.debug.push(entry),
        }
    }

    //=================================================
    // Section 1.3 - Scopes
    //=================================================

    fn push_scope(&mut self) {
        self.state.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.state.scopes.pop();
    }

    fn anonymous_slot(&mut self, position: Position) -> CompileResult<u16> {
        let slot = self.state.next_slot;
        self.state.next_slot = slot.checked_add(1).ok_or(CompileError::TooMany {
            what: "local variables",
            position,
        })?;
        Ok(slot)
    }

    fn declare_slot(&mut self, name: &Symbol, position: Position) -> CompileResult<u16> {
        let slot = self.anonymous_slot(position)?;
        self.bind(name.clone(), Binding::Slot(slot));
        Ok(slot)
    }

    fn bind(&mut self, name: Symbol, binding: Binding) {
        if let Some(scope) = self.state.scopes.last_mut() {
            scope.insert(name, binding);
        }
    }

    fn lookup_scopes(&self, name: &str) -> Option<Binding> {
        if self.state.global_only {
            return None;
        }
        self.state
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
    }

    fn resolve(&self, name: &str) -> Resolved {
        match self.lookup_scopes(name) {
            Some(Binding::Slot(slot)) => return Resolved::Slot(slot),
            Some(Binding::Function(index)) => return Resolved::Function(index),
            None => {}
        }
        if let Some(index) = self.functions.get(name) {
            return Resolved::Function(*index);
        }
        if native_spec(name).is_some() && !self.global_names.contains(name) {
            return Resolved::Native;
        }
        Resolved::Global
    }

    fn is_global_level(&self) -> bool {
        self.state.is_main && self.state.scopes.len() == 1
    }

    /// Local functions visible here, innermost declaration winning.
    fn visible_statics(&self) -> Vec<(Symbol, u32)> {
        let mut seen: HashMap<Symbol, u32> = HashMap::new();
        for scope in &self.state.scopes {
            for (name, binding) in scope {
                match binding {
                    Binding::Function(index) => {
                        seen.insert(name.clone(), *index);
                    }
                    Binding::Slot(_) => {
                        seen.remove(name);
                    }
                }
            }
        }
        let mut statics: Vec<(Symbol, u32)> = seen.into_iter().collect();
        statics.sort_by(|a, b| a.0.cmp(&b.0));
        statics
    }

    /// Enclosing locals a nested body reads, in name order.
    fn captures_for(&self, params: &[Param], body: &[Stmt]) -> Vec<(Symbol, u16)> {
        let mut captures: Vec<(Symbol, u16)> = mentioned_in_block(body)
            .names
            .into_iter()
            .filter(|name| !params.iter().any(|param| &param.name == name))
            .filter_map(|name| match self.lookup_scopes(&name) {
                Some(Binding::Slot(slot)) => Some((name, slot)),
                _ => None,
            })
            .collect();
        captures.sort_by(|a, b| a.0.cmp(&b.0));
        captures
    }

    //=================================================
    // Section 2.0 - Declarations
    //=================================================

    fn declare_program(&mut self) -> CompileResult<()> {
        let typed = self.typed;
        let statements = &typed.program.statements;
        let main = self.reserve_function(MAIN_FUNCTION, 0, 0, Position::default())?;
        self.queue.push_back(Pending {
            index: main,
            params: Vec::new(),
            captures: Vec::new(),
            statics: Vec::new(),
            body: Body::Main(statements),
        });

        for stmt in statements {
            match &stmt.kind {
                StmtKind::Let(decl) => {
                    self.global_names.insert(decl.name.clone());
                }
                StmtKind::Function(decl) => {
                    let index = self.reserve_function(&decl.name, decl.params.len(), 0, decl.position)?;
                    self.functions.insert(decl.name.clone(), index);
                    self.queue.push_back(Pending {
                        index,
                        params: decl.params.iter().map(|p| p.name.clone()).collect(),
                        captures: Vec::new(),
                        statics: Vec::new(),
                        body: Body::Statements(&decl.body),
                    });
                }
                StmtKind::Class(decl) => {
                    self.class_decls.insert(decl.name.clone(), decl);
                }
                _ => {}
            }
        }

        self.declare_builtin_classes()?;
        for stmt in statements {
            match &stmt.kind {
                StmtKind::Interface(decl) => {
                    let index = self.program.interfaces.len() as u32;
                    self.program.interfaces.push(InterfaceEntry {
                        name: decl.name.clone(),
                        methods: decl.methods.iter().map(|m| m.name.clone()).collect(),
                    });
                    self.interfaces.insert(decl.name.clone(), index);
                }
                StmtKind::Struct(decl) => {
                    let index = self.program.structs.len() as u32;
                    self.program.structs.push(StructEntry {
                        name: decl.name.clone(),
                        fields: decl.fields.iter().map(|(name, _)| name.clone()).collect(),
                    });
                    self.structs.insert(decl.name.clone(), index);
                }
                StmtKind::Enum(decl) => {
                    for (value, variant) in decl.variants.iter().enumerate() {
                        self.enums
                            .insert((decl.name.clone(), variant.clone()), value as i64);
                    }
                    self.program.enums.push(EnumEntry {
                        name: decl.name.clone(),
                        variants: decl.variants.clone(),
                    });
                }
                _ => {}
            }
        }

        let mut class_names: Vec<&'a Symbol> = Vec::new();
        for stmt in statements {
            if let StmtKind::Class(decl) = &stmt.kind {
                class_names.push(&decl.name);
            }
        }
        for name in class_names {
            self.declare_class(name, &mut Vec::new())?;
        }
        Ok(())
    }

    /// `Error` with a one-argument init storing the message, then one
    /// subclass per runtime fault.
    fn declare_builtin_classes(&mut self) -> CompileResult<()> {
        let init = self.reserve_function(&format!("{ERROR_CLASS}.{CONSTRUCTOR}"), 2, 0, Position::default())?;
        self.queue.push_back(Pending {
            index: init,
            params: vec![Symbol::from("self"), Symbol::from(MESSAGE_FIELD)],
            captures: Vec::new(),
            statics: Vec::new(),
            body: Body::ErrorInit,
        });
        self.program.classes.push(ClassEntry {
            name: Symbol::from(ERROR_CLASS),
            parent: None,
            interfaces: Vec::new(),
            fields: vec![Symbol::from(MESSAGE_FIELD)],
            methods: vec![(Symbol::from(CONSTRUCTOR), init)],
        });
        for name in BUILTIN_EXCEPTIONS {
            self.program.classes.push(ClassEntry {
                name: Symbol::from(*name),
                parent: Some(0),
                interfaces: Vec::new(),
                fields: vec![Symbol::from(MESSAGE_FIELD)],
                methods: Vec::new(),
            });
        }
        Ok(())
    }

    /// Registers a user class after its parent so inherited fields can be
    /// laid out first.
    fn declare_class(&mut self, name: &Symbol, visiting: &mut Vec<Symbol>) -> CompileResult<u32> {
        if let Some(index) = self.program.class_index(name) {
            return Ok(index);
        }
        let Some(decl) = self.class_decls.get(name).copied() else {
            return Err(CompileError::UnknownClass {
                name: name.clone(),
                position: Position::default(),
            });
        };
        if visiting.contains(name) {
            return Err(CompileError::InheritanceCycle {
                name: name.clone(),
                position: decl.position,
            });
        }
        visiting.push(name.clone());

        let mut parent = None;
        let mut interfaces = Vec::new();
        for base in &decl.parents {
            if let Some(index) = self.interfaces.get(base) {
                interfaces.push(*index);
            } else if parent.is_none() {
                parent = Some(self.declare_class(base, visiting)?);
            } else {
                return Err(CompileError::Unsupported {
                    what: format!("second base class '{base}' of '{name}'"),
                    position: decl.position,
                });
            }
        }
        visiting.pop();

        let mut fields = parent
            .map(|index| self.program.classes[index as usize].fields.clone())
            .unwrap_or_default();
        for field in &decl.fields {
            if !fields.contains(&field.name) {
                fields.push(field.name.clone());
            }
        }
        let mut methods = Vec::new();
        for method in &decl.methods {
            let qualified = format!("{name}.{}", method.name);
            let index = self.reserve_function(&qualified, method.params.len() + 1, 0, method.position)?;
            let mut params = vec![Symbol::from("self")];
            params.extend(method.params.iter().map(|p| p.name.clone()));
            self.queue.push_back(Pending {
                index,
                params,
                captures: Vec::new(),
                statics: Vec::new(),
                body: Body::Statements(&method.body),
            });
            methods.push((method.name.clone(), index));
        }
        self.program.classes.push(ClassEntry {
            name: name.clone(),
            parent,
            interfaces,
            fields,
            methods,
        });
        trace!(class = %name, "class declared");
        Ok((self.program.classes.len() - 1) as u32)
    }

    fn class_index(&self, name: &Symbol, position: Position) -> CompileResult<u32> {
        self.program
            .class_index(name)
            .ok_or_else(|| CompileError::UnknownClass {
                name: name.clone(),
                position,
            })
    }

    //=================================================
    // Section 3.0 - Functions
    //=================================================

    fn compile_function(&mut self, pending: Pending<'a>) -> CompileResult<()> {
        let is_main = matches!(pending.body, Body::Main(_));
        self.state = FunctionState::new(pending.index, is_main);
        let start = self.here();
        for (name, index) in &pending.statics {
            self.bind(name.clone(), Binding::Function(*index));
        }
        for name in pending.params.iter().chain(&pending.captures) {
            self.declare_slot(name, Position::default())?;
        }

        match pending.body {
            Body::Main(statements) => self.compile_main(statements)?,
            Body::Statements(statements) => {
                self.compile_statements(statements)?;
                if !statements.last().is_some_and(Stmt::is_terminator) {
                    self.emit_null();
                    self.emit_op(Opcode::Return);
                }
            }
            Body::ErrorInit => {
                let message = self.name(MESSAGE_FIELD);
                self.emit(Opcode::LoadVar, &[0]);
                self.emit(Opcode::LoadVar, &[1]);
                self.emit(Opcode::SetField, &[message]);
                self.emit_op(Opcode::Pop);
                self.emit_null();
                self.emit_op(Opcode::Return);
            }
        }

        let end = self.here();
        let locals = self.state.next_slot;
        let entry = &mut self.program.functions[pending.index as usize];
        entry.start = start as u32;
        entry.end = end as u32;
        entry.locals = locals;
        entry.homes = (0..locals).map(SlotHome::Local).collect();
        trace!(function = %entry.name, start, end, locals, "function compiled");
        Ok(())
    }

    /// Top-level statements. A trailing expression statement is the result
    /// of the program.
    fn compile_main(&mut self, statements: &'a [Stmt]) -> CompileResult<()> {
        for (index, stmt) in statements.iter().enumerate() {
            let last = index + 1 == statements.len();
            match &stmt.kind {
                StmtKind::Function(_)
                | StmtKind::Class(_)
                | StmtKind::Interface(_)
                | StmtKind::Struct(_)
                | StmtKind::Enum(_) => {}
                StmtKind::Expr(expr) if last => {
                    self.mark(stmt.position);
                    self.compile_expr(expr)?;
                    self.emit_op(Opcode::Return);
                    return Ok(());
                }
                _ => self.compile_stmt(stmt)?,
            }
        }
        self.emit_null();
        self.emit_op(Opcode::Return);
        Ok(())
    }

    /// Compiles a statement list in the current scope, binding local
    /// functions that capture nothing before the first statement runs.
    fn compile_statements(&mut self, statements: &'a [Stmt]) -> CompileResult<()> {
        self.hoist_local_functions(statements)?;
        for stmt in statements {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_block(&mut self, statements: &'a [Stmt]) -> CompileResult<()> {
        self.push_scope();
        let result = self.compile_statements(statements);
        self.pop_scope();
        result
    }

    fn hoist_local_functions(&mut self, statements: &'a [Stmt]) -> CompileResult<()> {
        let decls: Vec<&'a FunctionDecl> = statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Function(decl) => Some(decl),
                _ => None,
            })
            .collect();
        if decls.is_empty() {
            return Ok(());
        }
        let block_lets: HashSet<&Symbol> = statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Let(decl) => Some(&decl.name),
                _ => None,
            })
            .collect();

        let mut statics = Vec::new();
        for decl in decls {
            let reads_locals = mentioned_in_block(&decl.body).names.iter().any(|name| {
                !decl.params.iter().any(|p| &p.name == name)
                    && (block_lets.contains(name)
                        || matches!(self.lookup_scopes(name), Some(Binding::Slot(_))))
            });
            if reads_locals {
                continue;
            }
            let index = self.reserve_function(&decl.name, decl.params.len(), 0, decl.position)?;
            self.hoisted.insert(decl as *const FunctionDecl);
            statics.push((decl, index));
        }
        for (decl, index) in &statics {
            self.bind(decl.name.clone(), Binding::Function(*index));
        }
        let visible = self.visible_statics();
        for (decl, index) in statics {
            self.queue.push_back(Pending {
                index,
                params: decl.params.iter().map(|p| p.name.clone()).collect(),
                captures: Vec::new(),
                statics: visible.clone(),
                body: Body::Statements(&decl.body),
            });
        }
        Ok(())
    }

    /// Queues a nested body and leaves a function or closure value on the
    /// stack.
    fn emit_closure(
        &mut self,
        name: &str,
        params: &'a [Param],
        body: &'a [Stmt],
        position: Position,
    ) -> CompileResult<()> {
        let captures = self.captures_for(params, body);
        let index = self.reserve_function(name, params.len(), captures.len(), position)?;
        self.queue.push_back(Pending {
            index,
            params: params.iter().map(|p| p.name.clone()).collect(),
            captures: captures.iter().map(|(name, _)| name.clone()).collect(),
            statics: self.visible_statics(),
            body: Body::Statements(body),
        });
        if captures.is_empty() {
            self.emit(Opcode::LoadFunction, &[index]);
        } else {
            for (_, slot) in &captures {
                self.emit(Opcode::LoadVar, &[u32::from(*slot)]);
            }
            self.emit(Opcode::MakeClosure, &[index, captures.len() as u32]);
        }
        Ok(())
    }

    //=================================================
    // Section 4.0 - Statements
    //=================================================

    fn compile_stmt(&mut self, stmt: &'a Stmt) -> CompileResult<()> {
        self.mark(stmt.position);
        match &stmt.kind {
            StmtKind::Expr(expr) => self.compile_discarded(expr),
            StmtKind::Let(decl) => {
                match &decl.init {
                    Some(init) => self.compile_expr(init)?,
                    None => self.emit_null(),
                }
                if self.is_global_level() {
                    let name = self.name(&decl.name);
                    self.emit(Opcode::StoreGlobal, &[name]);
                } else {
                    let slot = self.declare_slot(&decl.name, stmt.position)?;
                    self.emit(Opcode::StoreVar, &[u32::from(slot)]);
                }
                Ok(())
            }
            StmtKind::Function(decl) => {
                if self.hoisted.contains(&(decl as *const FunctionDecl)) {
                    return Ok(());
                }
                self.emit_closure(&decl.name, &decl.params, &decl.body, decl.position)?;
                let slot = self.declare_slot(&decl.name, stmt.position)?;
                self.emit(Opcode::StoreVar, &[u32::from(slot)]);
                Ok(())
            }
            StmtKind::Class(_) | StmtKind::Interface(_) | StmtKind::Struct(_) | StmtKind::Enum(_) => {
                Err(CompileError::Unsupported {
                    what: "nested type declaration".to_string(),
                    position: stmt.position,
                })
            }
            StmtKind::Block(statements) => self.compile_block(statements),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let skip_then = self.emit_jump(Opcode::JumpIfFalse);
                self.compile_block(then_branch)?;
                match else_branch {
                    Some(else_branch) => {
                        let skip_else = self.emit_jump(Opcode::Jump);
                        let here = self.here();
                        self.patch(skip_then, here);
                        self.compile_block(else_branch)?;
                        let here = self.here();
                        self.patch(skip_else, here);
                    }
                    None => {
                        let here = self.here();
                        self.patch(skip_then, here);
                    }
                }
                Ok(())
            }
            StmtKind::While { condition, body } => {
                let top = self.here();
                self.compile_expr(condition)?;
                let exit = self.emit_jump(Opcode::JumpIfFalse);
                let context = self.compile_loop_body(body)?;
                self.emit(Opcode::Jump, &[top as u32]);
                let end = self.here();
                self.patch(exit, end);
                self.close_loop(context, top, end);
                Ok(())
            }
            StmtKind::For {
                init,
                condition,
                update,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.compile_stmt(init)?;
                }
                let top = self.here();
                let exit = match condition {
                    Some(condition) => {
                        self.compile_expr(condition)?;
                        Some(self.emit_jump(Opcode::JumpIfFalse))
                    }
                    None => None,
                };
                let context = self.compile_loop_body(body)?;
                let next = self.here();
                if let Some(update) = update {
                    self.compile_discarded(update)?;
                }
                self.emit(Opcode::Jump, &[top as u32]);
                let end = self.here();
                if let Some(exit) = exit {
                    self.patch(exit, end);
                }
                self.close_loop(context, next, end);
                self.pop_scope();
                Ok(())
            }
            StmtKind::ForRange {
                variable,
                start,
                end,
                inclusive,
                body,
            } => {
                self.push_scope();
                self.compile_expr(start)?;
                let counter = u32::from(self.declare_slot(variable, stmt.position)?);
                self.emit(Opcode::StoreVar, &[counter]);
                self.compile_expr(end)?;
                let limit = u32::from(self.anonymous_slot(stmt.position)?);
                self.emit(Opcode::StoreVar, &[limit]);
                let top = self.here();
                self.emit(Opcode::LoadVar, &[counter]);
                self.emit(Opcode::LoadVar, &[limit]);
                self.emit_op(if *inclusive { Opcode::Le } else { Opcode::Lt });
                let exit = self.emit_jump(Opcode::JumpIfFalse);
                let context = self.compile_loop_body(body)?;
                let next = self.here();
                self.emit(Opcode::LoadVar, &[counter]);
                self.emit_constant(Constant::Int(1));
                self.emit_op(Opcode::Add);
                self.emit(Opcode::StoreVar, &[counter]);
                self.emit(Opcode::Jump, &[top as u32]);
                let end = self.here();
                self.patch(exit, end);
                self.close_loop(context, next, end);
                self.pop_scope();
                Ok(())
            }
            StmtKind::Loop(body) => {
                let top = self.here();
                let context = self.compile_loop_body(body)?;
                self.emit(Opcode::Jump, &[top as u32]);
                let end = self.here();
                self.close_loop(context, top, end);
                Ok(())
            }
            StmtKind::Match { scrutinee, arms } => self.compile_match(scrutinee, arms, stmt.position),
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.compile_expr(value)?,
                    None => self.emit_null(),
                }
                self.unwind_tries(0)?;
                self.emit_op(Opcode::Return);
                Ok(())
            }
            StmtKind::Break | StmtKind::Continue => {
                let is_break = matches!(stmt.kind, StmtKind::Break);
                let Some(try_depth) = self.state.loops.last().map(|l| l.try_depth) else {
                    return Err(CompileError::OutsideLoop {
                        keyword: if is_break { "break" } else { "continue" },
                        position: stmt.position,
                    });
                };
                self.unwind_tries(try_depth)?;
                let jump = self.emit_jump(Opcode::Jump);
                if let Some(context) = self.state.loops.last_mut() {
                    if is_break {
                        context.breaks.push(jump);
                    } else {
                        context.continues.push(jump);
                    }
                }
                Ok(())
            }
            StmtKind::Throw(value) => {
                self.compile_expr(value)?;
                self.emit_op(Opcode::Throw);
                Ok(())
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => self.compile_try(body, catches, finally.as_deref(), stmt.position),
            StmtKind::Asm(items) => self.lower_asm(items, stmt.position),
        }
    }

    fn compile_loop_body(&mut self, body: &'a [Stmt]) -> CompileResult<LoopContext> {
        self.state.loops.push(LoopContext {
            try_depth: self.state.tries.len(),
            ..LoopContext::default()
        });
        let result = self.compile_block(body);
        let context = self.state.loops.pop().unwrap_or_default();
        result.map(|()| context)
    }

    fn close_loop(&mut self, context: LoopContext, next: usize, end: usize) {
        for jump in context.continues {
            self.patch(jump, next);
        }
        for jump in context.breaks {
            self.patch(jump, end);
        }
    }

    /// Leaves every try region deeper than `depth`, running finally blocks
    /// innermost first.
    fn unwind_tries(&mut self, depth: usize) -> CompileResult<()> {
        for level in (depth..self.state.tries.len()).rev() {
            self.emit_op(Opcode::ExitTry);
            if let Some(finally) = self.state.tries[level] {
                let outer = self.state.tries.split_off(level);
                let result = self.compile_block(finally);
                self.state.tries.extend(outer);
                result?;
            }
        }
        Ok(())
    }

    fn new_handler(&mut self) -> u32 {
        self.program.handlers.push(HandlerEntry {
            start: 0,
            end: 0,
            catches: Vec::new(),
            finally: None,
        });
        (self.program.handlers.len() - 1) as u32
    }

    /// Layout:
    /// `ENTER_TRY h; body; EXIT_TRY; finally; JUMP end`, then one entry per
    /// catch (binding, body guarded by a finally-only region, finally,
    /// `JUMP end`), then the rethrow block `finally; THROW`.
    fn compile_try(
        &mut self,
        body: &'a [Stmt],
        catches: &'a [CatchClause],
        finally: Option<&'a [Stmt]>,
        position: Position,
    ) -> CompileResult<()> {
        let handler = self.new_handler();
        self.emit(Opcode::EnterTry, &[handler]);
        let start = self.here();
        self.state.tries.push(finally);
        let result = self.compile_block(body);
        self.state.tries.pop();
        result?;
        let end = self.here();
        self.emit_op(Opcode::ExitTry);
        if let Some(finally) = finally {
            self.compile_block(finally)?;
        }
        let mut exits = vec![self.emit_jump(Opcode::Jump)];

        let mut entries = Vec::new();
        let mut guarded = Vec::new();
        for clause in catches {
            let class = match &clause.class {
                Some(name) => Some(self.class_index(name, clause.position)?),
                None => None,
            };
            entries.push(CatchEntry {
                class,
                target: self.here() as u32,
            });
            self.mark(clause.position);
            self.push_scope();
            let slot = self.declare_slot(&clause.name, clause.position)?;
            self.emit(Opcode::StoreVar, &[u32::from(slot)]);
            match finally {
                Some(finally) => {
                    let inner = self.new_handler();
                    self.emit(Opcode::EnterTry, &[inner]);
                    let guard_start = self.here();
                    self.state.tries.push(Some(finally));
                    let result = self.compile_statements(&clause.body);
                    self.state.tries.pop();
                    result?;
                    guarded.push((inner, guard_start, self.here()));
                    self.emit_op(Opcode::ExitTry);
                    self.pop_scope();
                    self.compile_block(finally)?;
                }
                None => {
                    let result = self.compile_statements(&clause.body);
                    self.pop_scope();
                    result?;
                }
            }
            exits.push(self.emit_jump(Opcode::Jump));
        }

        let rethrow = match finally {
            Some(finally) => {
                let at = self.here();
                let held = u32::from(self.anonymous_slot(position)?);
                self.emit(Opcode::StoreVar, &[held]);
                self.compile_block(finally)?;
                self.emit(Opcode::LoadVar, &[held]);
                self.emit_op(Opcode::Throw);
                Some(at as u32)
            }
            None => None,
        };
        let done = self.here();
        for exit in exits {
            self.patch(exit, done);
        }
        self.program.handlers[handler as usize] = HandlerEntry {
            start: start as u32,
            end: end as u32,
            catches: entries,
            finally: rethrow,
        };
        for (inner, guard_start, guard_end) in guarded {
            self.program.handlers[inner as usize] = HandlerEntry {
                start: guard_start as u32,
                end: guard_end as u32,
                catches: Vec::new(),
                finally: rethrow,
            };
        }
        Ok(())
    }

    fn compile_match(&mut self, scrutinee: &'a Expr, arms: &'a [MatchArm], position: Position) -> CompileResult<()> {
        self.compile_expr(scrutinee)?;
        let held = u32::from(self.anonymous_slot(position)?);
        self.emit(Opcode::StoreVar, &[held]);
        let mut exits = Vec::new();
        for arm in arms {
            self.mark(arm.position);
            self.push_scope();
            let mut misses = Vec::new();
            match &arm.pattern {
                Pattern::Wildcard => {}
                Pattern::Literal(literal) => {
                    self.emit(Opcode::LoadVar, &[held]);
                    self.emit_constant(Constant::from_literal(literal));
                    self.emit_op(Opcode::Eq);
                    misses.push(self.emit_jump(Opcode::JumpIfFalse));
                }
                Pattern::EnumVariant { enum_name, variant } => {
                    let value = self.enum_value(enum_name, variant, arm.position)?;
                    self.emit(Opcode::LoadVar, &[held]);
                    self.emit_constant(Constant::Int(value));
                    self.emit_op(Opcode::Eq);
                    misses.push(self.emit_jump(Opcode::JumpIfFalse));
                }
                Pattern::Binding(name) => {
                    self.emit(Opcode::LoadVar, &[held]);
                    let slot = self.declare_slot(name, arm.position)?;
                    self.emit(Opcode::StoreVar, &[u32::from(slot)]);
                }
            }
            if let Some(guard) = &arm.guard {
                self.compile_expr(guard)?;
                misses.push(self.emit_jump(Opcode::JumpIfFalse));
            }
            let result = self.compile_statements(&arm.body);
            self.pop_scope();
            result?;
            exits.push(self.emit_jump(Opcode::Jump));
            let next = self.here();
            for miss in misses {
                self.patch(miss, next);
            }
        }
        let end = self.here();
        for exit in exits {
            self.patch(exit, end);
        }
        Ok(())
    }

    fn enum_value(&self, enum_name: &Symbol, variant: &Symbol, position: Position) -> CompileResult<i64> {
        self.enums
            .get(&(enum_name.clone(), variant.clone()))
            .copied()
            .ok_or_else(|| CompileError::UnknownVariant {
                enum_name: enum_name.clone(),
                variant: variant.clone(),
                position,
            })
    }

    //=================================================
    // Section 5.0 - Expressions
    //=================================================

    /// Expression statement: evaluate for effect only.
    fn compile_discarded(&mut self, expr: &'a Expr) -> CompileResult<()> {
        if let ExprKind::Assign { target, value } = &expr.kind {
            if let ExprKind::Variable(name) = &target.kind {
                self.compile_expr(value)?;
                return self.store_variable(name, expr.position);
            }
        }
        self.compile_expr(expr)?;
        self.emit_op(Opcode::Pop);
        Ok(())
    }

    fn load_variable(&mut self, name: &Symbol, position: Position) -> CompileResult<()> {
        match self.resolve(name) {
            Resolved::Slot(slot) => {
                self.emit(Opcode::LoadVar, &[u32::from(slot)]);
            }
            Resolved::Function(index) => {
                self.emit(Opcode::LoadFunction, &[index]);
            }
            Resolved::Native => {
                return Err(CompileError::Unsupported {
                    what: format!("native function '{name}' as a value"),
                    position,
                });
            }
            Resolved::Global => {
                let index = self.name(name);
                self.emit(Opcode::LoadGlobal, &[index]);
            }
        }
        Ok(())
    }

    fn store_variable(&mut self, name: &Symbol, position: Position) -> CompileResult<()> {
        match self.resolve(name) {
            Resolved::Slot(slot) => {
                self.emit(Opcode::StoreVar, &[u32::from(slot)]);
            }
            Resolved::Global | Resolved::Native => {
                let index = self.name(name);
                self.emit(Opcode::StoreGlobal, &[index]);
            }
            Resolved::Function(_) => return Err(CompileError::InvalidAssignmentTarget(position)),
        }
        Ok(())
    }

    fn compile_args(&mut self, args: &'a [Expr]) -> CompileResult<u32> {
        for arg in args {
            self.compile_expr(arg)?;
        }
        Ok(args.len() as u32)
    }

    pub(crate) fn compile_expr(&mut self, expr: &'a Expr) -> CompileResult<()> {
        match &expr.kind {
            ExprKind::Literal(literal) => self.emit_constant(Constant::from_literal(literal)),
            ExprKind::Variable(name) => self.load_variable(name, expr.position)?,
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right)?,
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                self.emit_op(match op {
                    UnaryOp::Negate => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitwiseNot => Opcode::BitNot,
                });
            }
            ExprKind::Assign { target, value } => self.compile_assign(target, value, expr.position)?,
            ExprKind::Call { callee, args } => self.compile_call(callee, args)?,
            ExprKind::MethodCall {
                receiver,
                method,
                args,
            } => {
                self.compile_expr(receiver)?;
                let argc = self.compile_args(args)?;
                let name = self.name(method);
                self.emit(Opcode::CallMethod, &[name, argc]);
            }
            ExprKind::Field { object, field } => {
                self.compile_expr(object)?;
                let name = self.name(field);
                self.emit(Opcode::GetField, &[name]);
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit_op(Opcode::Index);
            }
            ExprKind::Array(items) => {
                let count = self.compile_args(items)?;
                self.emit(Opcode::MakeArray, &[count]);
            }
            ExprKind::Lambda(lambda) => {
                self.emit_closure("<lambda>", &lambda.params, &lambda.body, expr.position)?;
            }
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(condition)?;
                let skip_then = self.emit_jump(Opcode::JumpIfFalse);
                self.compile_expr(then_expr)?;
                let skip_else = self.emit_jump(Opcode::Jump);
                let here = self.here();
                self.patch(skip_then, here);
                self.compile_expr(else_expr)?;
                let here = self.here();
                self.patch(skip_else, here);
            }
            ExprKind::New { class, args } => self.compile_new(class, args, expr.position)?,
            ExprKind::StructLiteral { name, fields } => {
                self.compile_struct_literal(name, fields, expr.position)?;
            }
            ExprKind::AddressOf(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::Box);
            }
            ExprKind::Deref(inner) => {
                self.compile_expr(inner)?;
                self.emit_op(Opcode::Deref);
            }
            ExprKind::SizeOf(ty) => {
                let size = self.size_of(ty);
                self.emit_constant(Constant::Int(size));
            }
            ExprKind::EnumVariant { enum_name, variant } => {
                let value = self.enum_value(enum_name, variant, expr.position)?;
                self.emit_constant(Constant::Int(value));
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinaryOp, left: &'a Expr, right: &'a Expr) -> CompileResult<()> {
        self.compile_expr(left)?;
        if op.is_short_circuit() {
            self.emit_op(Opcode::Dup);
            let skip = self.emit_jump(if op == BinaryOp::And {
                Opcode::JumpIfFalse
            } else {
                Opcode::JumpIfTrue
            });
            self.emit_op(Opcode::Pop);
            self.compile_expr(right)?;
            let here = self.here();
            self.patch(skip, here);
            return Ok(());
        }
        self.compile_expr(right)?;
        self.emit_op(binary_opcode(op));
        Ok(())
    }

    fn compile_assign(&mut self, target: &'a Expr, value: &'a Expr, position: Position) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Variable(name) => {
                self.compile_expr(value)?;
                self.emit_op(Opcode::Dup);
                self.store_variable(name, position)
            }
            ExprKind::Field { object, field } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let name = self.name(field);
                self.emit(Opcode::SetField, &[name]);
                Ok(())
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit_op(Opcode::StoreIndex);
                Ok(())
            }
            ExprKind::Deref(pointer) => {
                self.compile_expr(pointer)?;
                self.compile_expr(value)?;
                self.emit_op(Opcode::StoreDeref);
                Ok(())
            }
            _ => Err(CompileError::InvalidAssignmentTarget(target.position)),
        }
    }

    fn compile_call(&mut self, callee: &'a Expr, args: &'a [Expr]) -> CompileResult<()> {
        let ExprKind::Variable(name) = &callee.kind else {
            self.compile_expr(callee)?;
            let argc = self.compile_args(args)?;
            self.emit(Opcode::CallValue, &[argc]);
            return Ok(());
        };
        match self.resolve(name) {
            Resolved::Function(index) => {
                let argc = self.compile_args(args)?;
                self.emit(Opcode::Call, &[index, argc]);
            }
            Resolved::Native => {
                let argc = self.compile_args(args)?;
                let native = self.name(name);
                self.emit(Opcode::CallNative, &[native, argc]);
            }
            Resolved::Slot(_) | Resolved::Global => {
                self.load_variable(name, callee.position)?;
                let argc = self.compile_args(args)?;
                self.emit(Opcode::CallValue, &[argc]);
            }
        }
        Ok(())
    }

    /// Allocates the object, runs field initializers base class first, then
    /// the nearest `init` with the arguments.
    fn compile_new(&mut self, class: &Symbol, args: &'a [Expr], position: Position) -> CompileResult<()> {
        let index = self.class_index(class, position)?;
        self.emit(Opcode::NewObject, &[index]);

        let mut chain = Vec::new();
        let mut current = Some(index);
        while let Some(at) = current {
            let entry = &self.program.classes[at as usize];
            chain.push(entry.name.clone());
            current = entry.parent;
        }
        let saved = self.state.global_only;
        self.state.global_only = true;
        for name in chain.iter().rev() {
            let Some(decl) = self.class_decls.get(name).copied() else {
                continue;
            };
            for field in &decl.fields {
                let Some(init) = &field.init else {
                    continue;
                };
                self.emit_op(Opcode::Dup);
                if let Err(err) = self.compile_expr(init) {
                    self.state.global_only = saved;
                    return Err(err);
                }
                let field_name = self.name(&field.name);
                self.emit(Opcode::SetField, &[field_name]);
                self.emit_op(Opcode::Pop);
            }
        }
        self.state.global_only = saved;

        if self.program.find_method(index, CONSTRUCTOR).is_some() {
            self.emit_op(Opcode::Dup);
            let argc = self.compile_args(args)?;
            let init = self.name(CONSTRUCTOR);
            self.emit(Opcode::CallMethod, &[init, argc]);
            self.emit_op(Opcode::Pop);
        } else if !args.is_empty() {
            return Err(CompileError::ConstructorArity {
                class: class.clone(),
                found: args.len(),
                position,
            });
        }
        Ok(())
    }

    fn compile_struct_literal(
        &mut self,
        name: &Symbol,
        fields: &'a [(Symbol, Expr)],
        position: Position,
    ) -> CompileResult<()> {
        let index = *self.structs.get(name).ok_or_else(|| CompileError::UnknownStruct {
            name: name.clone(),
            position,
        })?;
        let declared = self.program.structs[index as usize].fields.clone();
        if let Some((field, value)) = fields.iter().find(|(field, _)| !declared.contains(field)) {
            return Err(CompileError::UnknownField {
                name: name.clone(),
                field: field.clone(),
                position: value.position,
            });
        }
        for field in &declared {
            match fields.iter().find(|(given, _)| given == field) {
                Some((_, value)) => self.compile_expr(value)?,
                None => self.emit_null(),
            }
        }
        self.emit(Opcode::NewStruct, &[index, declared.len() as u32]);
        Ok(())
    }

    fn size_of(&self, ty: &TypeExpr) -> i64 {
        let TypeExpr::Named(name) = ty else {
            return WORD_SIZE;
        };
        let fields = match self.structs.get(name) {
            Some(index) => self.program.structs[*index as usize].fields.len(),
            None => self
                .program
                .class_index(name)
                .map_or(1, |index| self.program.classes[index as usize].fields.len()),
        };
        WORD_SIZE * fields.max(1) as i64
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Sub,
        BinaryOp::Multiply => Opcode::Mul,
        BinaryOp::Divide => Opcode::Div,
        BinaryOp::Modulo => Opcode::Mod,
        BinaryOp::Equal => Opcode::Eq,
        BinaryOp::NotEqual => Opcode::Ne,
        BinaryOp::Less => Opcode::Lt,
        BinaryOp::LessEqual => Opcode::Le,
        BinaryOp::Greater => Opcode::Gt,
        BinaryOp::GreaterEqual => Opcode::Ge,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::BitwiseAnd => Opcode::BitAnd,
        BinaryOp::BitwiseOr => Opcode::BitOr,
        BinaryOp::BitwiseXor => Opcode::BitXor,
        BinaryOp::LeftShift => Opcode::Shl,
        BinaryOp::RightShift => Opcode::Shr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn compile_source(source: &str) -> CompiledProgram {
        let parsed = parse_source(source, SyntaxLevel::Medium);
        assert!(!parsed.diagnostics.has_errors(), "{}", parsed.diagnostics);
        compile(&TypedProgram::unchecked(parsed.program)).expect("compile")
    }

    fn opcodes(program: &CompiledProgram, function: usize) -> Vec<Opcode> {
        program
            .function_instructions(function)
            .expect("decode")
            .iter()
            .map(|i| i.opcode)
            .collect()
    }

    #[test]
    fn trailing_expression_is_returned() {
        let program = compile_source("1 + 2");
        assert_eq!(
            opcodes(&program, 0),
            vec![Opcode::Push, Opcode::Push, Opcode::Add, Opcode::Return]
        );
        assert!(program.validate().is_ok());
    }

    #[test]
    fn functions_are_contiguous_and_in_table_order() {
        let program = compile_source(
            "fn add(a, b) { return a + b; }\nlet f = fn(x) => x * 2;\nadd(1, f(2));",
        );
        let mut previous_end = 0;
        for function in &program.functions {
            assert_eq!(function.start, previous_end);
            previous_end = function.end;
        }
        assert_eq!(previous_end as usize, program.code.len());
        assert_eq!(program.functions[1].name.as_str(), "add");
        assert!(opcodes(&program, 0).contains(&Opcode::Call));
    }

    #[test]
    fn builtin_exception_classes_are_always_present() {
        let program = compile_source("let x = 1;");
        let error = program.class_index(ERROR_CLASS).expect("Error class");
        for name in BUILTIN_EXCEPTIONS {
            let index = program.class_index(name).expect("builtin class");
            assert!(program.is_subclass(index, error));
        }
        assert!(program.find_method(error, CONSTRUCTOR).is_some());
    }

    #[test]
    fn lambdas_capture_enclosing_locals() {
        let program = compile_source("fn outer(n) { let add = fn(x) => x + n; return add(1); }");
        let lambda = program
            .functions
            .iter()
            .find(|f| f.name.as_str() == "<lambda>")
            .expect("lambda");
        assert_eq!((lambda.arity, lambda.captures), (1, 1));
        assert!(opcodes(&program, 1).contains(&Opcode::MakeClosure));
    }

    #[test]
    fn try_regions_get_handler_entries() {
        let program = compile_source(
            "try { throw new TypeError(\"bad\"); } catch (e: TypeError) { print(e.message); } finally { print(1); }",
        );
        let handler = &program.handlers[0];
        assert_eq!(handler.catches.len(), 1);
        assert!(handler.catches[0].class.is_some());
        assert!(handler.finally.is_some());
        assert_eq!(program.handlers.len(), 2);
        assert!(program.validate().is_ok());
    }

    #[test]
    fn break_outside_a_loop_is_rejected() {
        let parsed = parse_source("fn f() { break; }", SyntaxLevel::Medium);
        let err = compile(&TypedProgram::unchecked(parsed.program)).expect_err("must fail");
        assert!(matches!(err, CompileError::OutsideLoop { keyword: "break", .. }));
    }

    #[test]
    fn local_functions_without_captures_are_called_directly() {
        let program = compile_source(
            "fn outer() { fn twice(x) { return x * 2; } return twice(4); }",
        );
        let outer = opcodes(&program, 1);
        assert!(outer.contains(&Opcode::Call));
        assert!(!outer.contains(&Opcode::MakeClosure));
    }
}
