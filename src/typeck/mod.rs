//=====================================================
// File: typeck/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Static checking for every syntax level
// Objective: Hoist declarations into one global scope, walk the unified AST
//            and report type, symbol and unit problems without stopping
//=====================================================

mod expr;
pub mod types;

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::ast::{
    AsmLine, AsmOperand, ClassDecl, EnumDecl, FunctionDecl, InterfaceDecl, LetDecl, NodeId,
    Pattern, Position, Program, Stmt, StmtKind, StructDecl, TypeExpr,
};
use crate::diagnostics::{Diagnostic, Diagnostics, ErrorCode};
use crate::runtime::{BUILTIN_EXCEPTIONS, ERROR_CLASS, MESSAGE_FIELD};
use crate::symbol::Symbol;

pub use types::{FnSig, SymbolInfo, SymbolKind, SymbolTable, Type};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("type mismatch: expected {expected}, found {found}")]
    Mismatch { expected: Type, found: Type },
    #[error("undefined symbol '{0}'")]
    Undefined(Symbol),
    #[error("unknown type '{0}'")]
    UnknownType(Symbol),
    #[error("'{name}' expects {expected} argument(s), found {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("cannot infer type parameter '{param}' of '{function}' from its arguments")]
    AmbiguousGeneric { function: Symbol, param: Symbol },
    #[error("unit mismatch: {left} and {right}")]
    UnitMismatch { left: Type, right: Type },
    #[error("operator '{op}' cannot be applied to {left} and {right}")]
    InvalidOperands {
        op: &'static str,
        left: Type,
        right: Type,
    },
    #[error("operator '{op}' cannot be applied to {operand}")]
    InvalidOperand { op: &'static str, operand: Type },
    #[error("{ty} has no field '{field}'")]
    UnknownField { ty: Type, field: Symbol },
    #[error("{ty} has no method '{method}'")]
    UnknownMethod { ty: Type, method: Symbol },
    #[error("{0} is not callable")]
    NotCallable(Type),
    #[error("cannot dereference non-pointer type {0}")]
    NotAPointer(Type),
    #[error("cannot index into {0}")]
    NotIndexable(Type),
    #[error("'{0}' outside of a loop")]
    OutsideLoop(&'static str),
    #[error("cannot assign to constant '{0}'")]
    ConstantAssignment(Symbol),
    #[error("invalid assignment target")]
    InvalidTarget,
    #[error("'{0}' is declared more than once")]
    Duplicate(Symbol),
    #[error("{0}")]
    InvalidDeclaration(String),
    #[error("condition has type {0}, expected bool")]
    NonBooleanCondition(Type),
}

/// Checked program: the AST plus everything the checker learned about it.
#[derive(Debug, Clone)]
pub struct TypedProgram {
    pub program: Program,
    pub symbols: SymbolTable,
    pub types: HashMap<NodeId, Type>,
}

impl TypedProgram {
    /// Wraps a program without checking it. Optimizer passes and tests that
    /// build ASTs by hand go through here.
    pub fn unchecked(program: Program) -> Self {
        Self {
            program,
            symbols: SymbolTable::new(),
            types: HashMap::new(),
        }
    }

    pub fn type_of(&self, id: NodeId) -> Option<&Type> {
        self.types.get(&id)
    }
}

/// Checks a whole program. Never stops at the first error; every problem is
/// reported through the returned diagnostics.
#[instrument(skip_all, fields(statements = program.statements.len()))]
pub fn check(program: Program) -> (TypedProgram, Diagnostics) {
    let mut checker = Checker::new();
    checker.check_program(&program);
    debug!(
        symbols = checker.symbols.len(),
        diagnostics = checker.diagnostics.len(),
        "type check finished"
    );
    let typed = TypedProgram {
        program,
        symbols: checker.symbols,
        types: checker.types,
    };
    (typed, checker.diagnostics)
}

//=====================================================
// Section 1.0 - Checker state
//=====================================================

#[derive(Debug, Clone)]
struct Binding {
    ty: Type,
    constant: bool,
}

#[derive(Debug, Clone, Default)]
struct ClassInfo {
    parent: Option<Symbol>,
    interfaces: Vec<Symbol>,
    fields: Vec<(Symbol, Type)>,
    methods: HashMap<Symbol, FnSig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TypeKind {
    Class,
    Interface,
    Struct,
    Enum,
}

/// Per-function checking context. Lambdas push their own so `break` inside a
/// lambda never binds to a loop outside it.
#[derive(Debug, Clone, Default)]
struct FnContext {
    /// `None` when the return type is not annotated.
    ret: Option<Type>,
    generics: Vec<Symbol>,
    loop_depth: usize,
}

pub(crate) struct Checker {
    diagnostics: Diagnostics,
    symbols: SymbolTable,
    types: HashMap<NodeId, Type>,
    scopes: Vec<HashMap<Symbol, Binding>>,
    type_names: HashMap<Symbol, TypeKind>,
    functions: HashMap<Symbol, FnSig>,
    classes: HashMap<Symbol, ClassInfo>,
    interfaces: HashMap<Symbol, Vec<(Symbol, FnSig)>>,
    structs: HashMap<Symbol, Vec<(Symbol, Type)>>,
    enums: HashMap<Symbol, Vec<Symbol>>,
    contexts: Vec<FnContext>,
}

impl Checker {
    fn new() -> Self {
        let mut checker = Self {
            diagnostics: Diagnostics::new(),
            symbols: SymbolTable::new(),
            types: HashMap::new(),
            scopes: vec![HashMap::new()],
            type_names: HashMap::new(),
            functions: HashMap::new(),
            classes: HashMap::new(),
            interfaces: HashMap::new(),
            structs: HashMap::new(),
            enums: HashMap::new(),
            contexts: vec![FnContext::default()],
        };
        checker.install_builtin_classes();
        checker
    }

    fn install_builtin_classes(&mut self) {
        let init = FnSig::new(vec![Type::Any], Type::Void);
        let root = Symbol::from(ERROR_CLASS);
        let mut methods = HashMap::new();
        methods.insert(Symbol::from("init"), init);
        self.type_names.insert(root.clone(), TypeKind::Class);
        self.classes.insert(
            root.clone(),
            ClassInfo {
                parent: None,
                interfaces: Vec::new(),
                fields: vec![(Symbol::from(MESSAGE_FIELD), Type::Any)],
                methods,
            },
        );
        for name in BUILTIN_EXCEPTIONS {
            let name = Symbol::from(*name);
            self.type_names.insert(name.clone(), TypeKind::Class);
            self.classes.insert(
                name,
                ClassInfo {
                    parent: Some(root.clone()),
                    ..ClassInfo::default()
                },
            );
        }
    }

    //=================================================
    // Section 1.1 - Diagnostics and scopes
    //=================================================

    pub(crate) fn error(&mut self, error: TypeError, position: Position) {
        self.diagnostics
            .push(Diagnostic::error(ErrorCode::Type, error.to_string(), position));
    }

    fn warning(&mut self, error: TypeError, position: Position) {
        self.diagnostics
            .push(Diagnostic::warning(ErrorCode::Type, error.to_string(), position));
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn depth(&self) -> usize {
        self.scopes.len().saturating_sub(1)
    }

    fn declare(
        &mut self,
        name: &Symbol,
        kind: SymbolKind,
        ty: Type,
        constant: bool,
        position: Position,
    ) {
        self.symbols.record(SymbolInfo {
            name: name.clone(),
            kind,
            ty: ty.clone(),
            position,
            scope_depth: self.depth(),
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.clone(), Binding { ty, constant });
        }
    }

    fn lookup(&self, name: &str) -> Option<&Binding> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn context(&mut self) -> &mut FnContext {
        if self.contexts.is_empty() {
            self.contexts.push(FnContext::default());
        }
        let last = self.contexts.len() - 1;
        &mut self.contexts[last]
    }

    fn record_type(&mut self, id: NodeId, ty: &Type) {
        self.types.insert(id, ty.clone());
    }

    //=================================================
    // Section 1.2 - Type resolution
    //=================================================

    fn resolve_type(&mut self, ty: &TypeExpr, position: Position) -> Type {
        match ty {
            TypeExpr::Named(name) => match name.as_str() {
                "int" => Type::Int,
                "float" => Type::Float,
                "string" | "str" => Type::Str,
                "bool" => Type::Bool,
                "void" => Type::Void,
                "any" => Type::Any,
                "null" => Type::Null,
                _ => {
                    let generic = self
                        .contexts
                        .iter()
                        .rev()
                        .any(|ctx| ctx.generics.contains(name));
                    if generic {
                        return Type::Param(name.clone());
                    }
                    match self.type_names.get(name) {
                        Some(TypeKind::Class) => Type::Class(name.clone()),
                        Some(TypeKind::Interface) => Type::Interface(name.clone()),
                        Some(TypeKind::Struct) => Type::Struct(name.clone()),
                        Some(TypeKind::Enum) => Type::Enum(name.clone()),
                        None => {
                            self.error(TypeError::UnknownType(name.clone()), position);
                            Type::Error
                        }
                    }
                }
            },
            TypeExpr::Array(inner) => Type::Array(Box::new(self.resolve_type(inner, position))),
            TypeExpr::Pointer(inner) => {
                Type::Pointer(Box::new(self.resolve_type(inner, position)))
            }
            TypeExpr::Function { params, ret } => Type::Function {
                params: params
                    .iter()
                    .map(|p| self.resolve_type(p, position))
                    .collect(),
                ret: Box::new(self.resolve_type(ret, position)),
            },
            TypeExpr::Quantity(unit) => Type::quantity(unit.clone()),
        }
    }

    fn resolve_optional(&mut self, ty: Option<&TypeExpr>, position: Position) -> Type {
        match ty {
            Some(ty) => self.resolve_type(ty, position),
            None => Type::Any,
        }
    }

    fn function_signature(&mut self, decl: &FunctionDecl) -> FnSig {
        self.contexts.push(FnContext {
            generics: decl.generics.clone(),
            ..FnContext::default()
        });
        let params = decl
            .params
            .iter()
            .map(|p| self.resolve_optional(p.ty.as_ref(), p.position))
            .collect::<Vec<_>>();
        let ret = self.resolve_optional(decl.return_type.as_ref(), decl.position);
        self.contexts.pop();
        FnSig {
            generics: decl.generics.clone(),
            min_args: params.len(),
            params,
            ret,
        }
    }

    //=================================================
    // Section 1.3 - Class relationships
    //=================================================

    /// Superclass chain starting at `name` itself. Stops on cycles.
    fn class_chain(&self, name: &Symbol) -> Vec<Symbol> {
        let mut chain = Vec::new();
        let mut current = Some(name.clone());
        while let Some(class) = current {
            if chain.contains(&class) {
                break;
            }
            current = self.classes.get(&class).and_then(|info| info.parent.clone());
            chain.push(class);
        }
        chain
    }

    fn is_subclass(&self, class: &Symbol, ancestor: &Symbol) -> bool {
        self.class_chain(class).contains(ancestor)
    }

    fn implements(&self, class: &Symbol, interface: &Symbol) -> bool {
        self.class_chain(class).iter().any(|c| {
            self.classes
                .get(c)
                .is_some_and(|info| info.interfaces.contains(interface))
        })
    }

    fn find_field(&self, class: &Symbol, field: &str) -> Option<Type> {
        self.class_chain(class).iter().find_map(|c| {
            self.classes.get(c).and_then(|info| {
                info.fields
                    .iter()
                    .find(|(name, _)| name.as_str() == field)
                    .map(|(_, ty)| ty.clone())
            })
        })
    }

    fn find_method(&self, class: &Symbol, method: &str) -> Option<FnSig> {
        self.class_chain(class)
            .iter()
            .find_map(|c| self.classes.get(c).and_then(|info| info.methods.get(method).cloned()))
    }

    /// Assignment compatibility of a `source` value into a `target` slot.
    pub(crate) fn assignable(&self, target: &Type, source: &Type) -> bool {
        if target == source || target.is_dynamic() || source.is_dynamic() {
            return true;
        }
        match (target, source) {
            (Type::Float, Type::Int) => true,
            (target, Type::Null) => target.is_reference(),
            (Type::Class(base), Type::Class(sub)) => self.is_subclass(sub, base),
            (Type::Interface(iface), Type::Class(class)) => self.implements(class, iface),
            (Type::Array(t), Type::Array(s)) | (Type::Pointer(t), Type::Pointer(s)) => {
                t == s || t.is_dynamic() || s.is_dynamic()
            }
            (
                Type::Function {
                    params: tp,
                    ret: tr,
                },
                Type::Function {
                    params: sp,
                    ret: sr,
                },
            ) => {
                tp.len() == sp.len()
                    && tp
                        .iter()
                        .zip(sp)
                        .all(|(t, s)| t == s || t.is_dynamic() || s.is_dynamic())
                    && (tr == sr || tr.is_dynamic() || sr.is_dynamic() || **tr == Type::Void)
            }
            _ => false,
        }
    }

    fn expect_assignable(&mut self, target: &Type, source: &Type, position: Position) {
        if !self.assignable(target, source) {
            self.error(
                TypeError::Mismatch {
                    expected: target.clone(),
                    found: source.clone(),
                },
                position,
            );
        }
    }

    //=================================================
    // Section 2.0 - Program and hoisting
    //=================================================

    fn check_program(&mut self, program: &Program) {
        let statements = &program.statements;
        self.declare_type_names(statements);
        self.declare_members(statements);
        for stmt in statements {
            if let StmtKind::Function(decl) = &stmt.kind {
                self.declare_function(decl);
            }
        }

        let mut deferred_functions = Vec::new();
        let mut deferred_classes = Vec::new();
        for stmt in statements {
            match &stmt.kind {
                StmtKind::Function(decl) => deferred_functions.push(decl),
                StmtKind::Class(decl) => deferred_classes.push(decl),
                StmtKind::Interface(_) | StmtKind::Struct(_) | StmtKind::Enum(_) => {}
                _ => self.check_stmt(stmt),
            }
        }
        // Bodies are checked once every global is known, matching run-time
        // lookup of globals by name.
        for decl in deferred_classes {
            self.check_class_body(decl);
        }
        for decl in deferred_functions {
            let sig = self.functions.get(&decl.name).cloned();
            if let Some(sig) = sig {
                self.check_function_body(decl, &sig, None);
            }
        }
    }

    fn declare_type_names(&mut self, statements: &[Stmt]) {
        for stmt in statements {
            let (name, kind) = match &stmt.kind {
                StmtKind::Class(decl) => (&decl.name, TypeKind::Class),
                StmtKind::Interface(decl) => (&decl.name, TypeKind::Interface),
                StmtKind::Struct(decl) => (&decl.name, TypeKind::Struct),
                StmtKind::Enum(decl) => (&decl.name, TypeKind::Enum),
                _ => continue,
            };
            if self.type_names.insert(name.clone(), kind).is_some() {
                self.error(TypeError::Duplicate(name.clone()), stmt.position);
            }
        }
    }

    fn declare_members(&mut self, statements: &[Stmt]) {
        for stmt in statements {
            match &stmt.kind {
                StmtKind::Struct(decl) => self.declare_struct(decl),
                StmtKind::Enum(decl) => self.declare_enum(decl),
                StmtKind::Interface(decl) => self.declare_interface(decl),
                _ => {}
            }
        }
        for stmt in statements {
            if let StmtKind::Class(decl) = &stmt.kind {
                self.declare_class(decl);
            }
        }
        for stmt in statements {
            if let StmtKind::Class(decl) = &stmt.kind {
                self.check_interfaces_implemented(decl);
            }
        }
    }

    fn declare_function(&mut self, decl: &FunctionDecl) {
        if self.functions.contains_key(&decl.name) {
            self.error(TypeError::Duplicate(decl.name.clone()), decl.position);
            return;
        }
        let sig = self.function_signature(decl);
        self.symbols.record(SymbolInfo {
            name: decl.name.clone(),
            kind: SymbolKind::Function,
            ty: sig.as_type(),
            position: decl.position,
            scope_depth: self.depth(),
        });
        self.functions.insert(decl.name.clone(), sig);
    }

    fn declare_struct(&mut self, decl: &StructDecl) {
        let fields = decl
            .fields
            .iter()
            .map(|(name, ty)| (name.clone(), self.resolve_type(ty, decl.position)))
            .collect::<Vec<_>>();
        self.record_decl(&decl.name, SymbolKind::Struct, Type::Struct(decl.name.clone()), decl.position);
        for (name, ty) in &fields {
            self.record_decl(name, SymbolKind::Field, ty.clone(), decl.position);
        }
        self.structs.insert(decl.name.clone(), fields);
    }

    fn declare_enum(&mut self, decl: &EnumDecl) {
        self.record_decl(&decl.name, SymbolKind::Enum, Type::Enum(decl.name.clone()), decl.position);
        self.enums.insert(decl.name.clone(), decl.variants.clone());
    }

    fn declare_interface(&mut self, decl: &InterfaceDecl) {
        let mut methods = Vec::new();
        for method in &decl.methods {
            let params = method
                .params
                .iter()
                .map(|p| self.resolve_optional(p.ty.as_ref(), p.position))
                .collect();
            let ret = self.resolve_optional(method.return_type.as_ref(), method.position);
            methods.push((method.name.clone(), FnSig::new(params, ret)));
        }
        self.record_decl(
            &decl.name,
            SymbolKind::Interface,
            Type::Interface(decl.name.clone()),
            decl.position,
        );
        self.interfaces.insert(decl.name.clone(), methods);
    }

    fn declare_class(&mut self, decl: &ClassDecl) {
        let mut info = ClassInfo::default();
        for parent in &decl.parents {
            match self.type_names.get(parent) {
                Some(TypeKind::Class) if info.parent.is_none() => info.parent = Some(parent.clone()),
                Some(TypeKind::Class) => self.error(
                    TypeError::InvalidDeclaration(format!(
                        "class '{}' may extend only one class",
                        decl.name
                    )),
                    decl.position,
                ),
                Some(TypeKind::Interface) => info.interfaces.push(parent.clone()),
                _ => self.error(TypeError::UnknownType(parent.clone()), decl.position),
            }
        }
        for field in &decl.fields {
            let ty = self.resolve_optional(field.ty.as_ref(), field.position);
            self.record_decl(&field.name, SymbolKind::Field, ty.clone(), field.position);
            info.fields.push((field.name.clone(), ty));
        }
        for method in &decl.methods {
            let sig = self.function_signature(method);
            self.record_decl(&method.name, SymbolKind::Method, sig.as_type(), method.position);
            if info.methods.insert(method.name.clone(), sig).is_some() {
                self.error(TypeError::Duplicate(method.name.clone()), method.position);
            }
        }
        self.record_decl(&decl.name, SymbolKind::Class, Type::Class(decl.name.clone()), decl.position);
        self.classes.insert(decl.name.clone(), info);
        if let Some(parent) = self.classes.get(&decl.name).and_then(|i| i.parent.clone()) {
            if self.is_subclass(&parent, &decl.name) {
                self.error(
                    TypeError::InvalidDeclaration(format!(
                        "class '{}' inherits from itself",
                        decl.name
                    )),
                    decl.position,
                );
            }
        }
    }

    fn check_interfaces_implemented(&mut self, decl: &ClassDecl) {
        let Some(info) = self.classes.get(&decl.name) else {
            return;
        };
        let mut missing = Vec::new();
        for iface in &info.interfaces {
            for (method, sig) in self.interfaces.get(iface).into_iter().flatten() {
                match self.find_method(&decl.name, method) {
                    Some(found) if found.params.len() == sig.params.len() => {}
                    _ => missing.push(format!(
                        "class '{}' does not implement '{iface}.{method}'",
                        decl.name
                    )),
                }
            }
        }
        for message in missing {
            self.error(TypeError::InvalidDeclaration(message), decl.position);
        }
    }

    fn record_decl(&mut self, name: &Symbol, kind: SymbolKind, ty: Type, position: Position) {
        self.symbols.record(SymbolInfo {
            name: name.clone(),
            kind,
            ty,
            position,
            scope_depth: self.depth(),
        });
    }

    //=================================================
    // Section 2.1 - Function and class bodies
    //=================================================

    fn check_function_body(&mut self, decl: &FunctionDecl, sig: &FnSig, receiver: Option<&Symbol>) {
        self.contexts.push(FnContext {
            ret: decl.return_type.as_ref().map(|_| sig.ret.clone()),
            generics: decl.generics.clone(),
            loop_depth: 0,
        });
        self.push_scope();
        if let Some(class) = receiver {
            self.declare(
                &Symbol::from("self"),
                SymbolKind::Parameter,
                Type::Class(class.clone()),
                true,
                decl.position,
            );
        }
        for (param, ty) in decl.params.iter().zip(&sig.params) {
            self.declare(&param.name, SymbolKind::Parameter, ty.clone(), false, param.position);
        }
        self.check_block_in_scope(&decl.body);
        self.pop_scope();
        self.contexts.pop();
    }

    fn check_class_body(&mut self, decl: &ClassDecl) {
        self.contexts.push(FnContext::default());
        self.push_scope();
        self.declare(
            &Symbol::from("self"),
            SymbolKind::Parameter,
            Type::Class(decl.name.clone()),
            true,
            decl.position,
        );
        for field in &decl.fields {
            if let Some(init) = &field.init {
                let value = self.check_expr(init);
                let declared = self.find_field(&decl.name, &field.name).unwrap_or(Type::Any);
                self.expect_assignable(&declared, &value, init.position);
            }
        }
        self.pop_scope();
        self.contexts.pop();
        for method in &decl.methods {
            let sig = self.find_method(&decl.name, &method.name);
            if let Some(sig) = sig {
                self.check_function_body(method, &sig, Some(&decl.name));
            }
        }
    }

    //=================================================
    // Section 3.0 - Statements
    //=================================================

    fn check_block(&mut self, statements: &[Stmt]) {
        self.push_scope();
        self.check_block_in_scope(statements);
        self.pop_scope();
    }

    /// Checks statements in the current scope, hoisting nested declarations
    /// first so local functions can call each other. Local functions are
    /// bindings in the block scope, not entries of the global function table.
    fn check_block_in_scope(&mut self, statements: &[Stmt]) {
        self.declare_type_names(statements);
        self.declare_members(statements);
        for stmt in statements {
            if let StmtKind::Function(decl) = &stmt.kind {
                let sig = self.function_signature(decl);
                self.declare(&decl.name, SymbolKind::Function, sig.as_type(), true, decl.position);
            }
        }
        for stmt in statements {
            self.check_stmt(stmt);
        }
    }

    fn check_condition(&mut self, condition: &crate::ast::Expr) {
        let ty = self.check_expr(condition);
        if !matches!(ty, Type::Bool) && !ty.is_dynamic() {
            self.warning(TypeError::NonBooleanCondition(ty), condition.position);
        }
    }

    fn check_loop_body(&mut self, body: &[Stmt]) {
        self.context().loop_depth += 1;
        self.check_block(body);
        self.context().loop_depth -= 1;
    }

    pub(crate) fn check_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.check_expr(expr);
            }
            StmtKind::Let(decl) => self.check_let(decl, stmt.position),
            StmtKind::Function(decl) => {
                let sig = self.function_signature(decl);
                self.check_function_body(decl, &sig, None);
            }
            StmtKind::Class(decl) => self.check_class_body(decl),
            StmtKind::Interface(_) | StmtKind::Struct(_) | StmtKind::Enum(_) => {}
            StmtKind::Block(statements) => self.check_block(statements),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.check_condition(condition);
                self.check_block(then_branch);
                if let Some(else_branch) = else_branch {
                    self.check_block(else_branch);
                }
            }
            StmtKind::While { condition, body } => {
                self.check_condition(condition);
                self.check_loop_body(body);
            }
            StmtKind::For {
                init,
                condition,
                update,
                body,
            } => {
                self.push_scope();
                if let Some(init) = init {
                    self.check_stmt(init);
                }
                if let Some(condition) = condition {
                    self.check_condition(condition);
                }
                if let Some(update) = update {
                    self.check_expr(update);
                }
                self.check_loop_body(body);
                self.pop_scope();
            }
            StmtKind::ForRange {
                variable,
                start,
                end,
                body,
                ..
            } => {
                for bound in [start, end] {
                    let ty = self.check_expr(bound);
                    self.expect_assignable(&Type::Int, &ty, bound.position);
                }
                self.push_scope();
                self.declare(variable, SymbolKind::Variable, Type::Int, false, stmt.position);
                self.check_loop_body(body);
                self.pop_scope();
            }
            StmtKind::Loop(body) => self.check_loop_body(body),
            StmtKind::Match { scrutinee, arms } => {
                let scrutinee_ty = self.check_expr(scrutinee);
                for arm in arms {
                    self.push_scope();
                    self.check_pattern(&arm.pattern, &scrutinee_ty, arm.position);
                    if let Some(guard) = &arm.guard {
                        self.check_condition(guard);
                    }
                    self.check_block(&arm.body);
                    self.pop_scope();
                }
            }
            StmtKind::Return(value) => self.check_return(value.as_ref(), stmt.position),
            StmtKind::Break => {
                if self.context().loop_depth == 0 {
                    self.error(TypeError::OutsideLoop("break"), stmt.position);
                }
            }
            StmtKind::Continue => {
                if self.context().loop_depth == 0 {
                    self.error(TypeError::OutsideLoop("continue"), stmt.position);
                }
            }
            StmtKind::Throw(value) => {
                self.check_expr(value);
            }
            StmtKind::Try {
                body,
                catches,
                finally,
            } => {
                self.check_block(body);
                for clause in catches {
                    let ty = match &clause.class {
                        Some(class) => match self.type_names.get(class) {
                            Some(TypeKind::Class) => Type::Class(class.clone()),
                            _ => {
                                self.error(TypeError::UnknownType(class.clone()), clause.position);
                                Type::Error
                            }
                        },
                        None => Type::Any,
                    };
                    self.push_scope();
                    self.declare(&clause.name, SymbolKind::Variable, ty, false, clause.position);
                    self.check_block(&clause.body);
                    self.pop_scope();
                }
                if let Some(finally) = finally {
                    self.check_block(finally);
                }
            }
            StmtKind::Asm(items) => self.check_asm(items),
        }
    }

    fn check_let(&mut self, decl: &LetDecl, position: Position) {
        let annotated = decl.ty.as_ref().map(|ty| self.resolve_type(ty, position));
        let init = decl.init.as_ref().map(|init| (self.check_expr(init), init.position));
        let ty = match (annotated, init) {
            (Some(declared), Some((value, at))) => {
                self.expect_assignable(&declared, &value, at);
                declared
            }
            (Some(declared), None) => declared,
            (None, Some((Type::Null | Type::Void, _))) | (None, None) => Type::Any,
            (None, Some((value, _))) => value,
        };
        let kind = if decl.constant {
            SymbolKind::Constant
        } else {
            SymbolKind::Variable
        };
        self.declare(&decl.name, kind, ty, decl.constant, position);
    }

    fn check_return(&mut self, value: Option<&crate::ast::Expr>, position: Position) {
        let found = match value {
            Some(expr) => self.check_expr(expr),
            None => Type::Void,
        };
        let Some(expected) = self.context().ret.clone() else {
            return;
        };
        match (&expected, value) {
            (Type::Void, Some(expr)) if !found.is_dynamic() => self.error(
                TypeError::Mismatch {
                    expected: Type::Void,
                    found,
                },
                expr.position,
            ),
            (Type::Void, _) => {}
            (expected, None) if !expected.is_dynamic() => self.error(
                TypeError::Mismatch {
                    expected: expected.clone(),
                    found: Type::Void,
                },
                position,
            ),
            (expected, Some(expr)) => {
                let expected = expected.clone();
                self.expect_assignable(&expected, &found, expr.position);
            }
            _ => {}
        }
    }

    fn check_pattern(&mut self, pattern: &Pattern, scrutinee: &Type, position: Position) {
        match pattern {
            Pattern::Wildcard => {}
            Pattern::Binding(name) => {
                self.declare(name, SymbolKind::Variable, scrutinee.clone(), false, position);
            }
            Pattern::Literal(literal) => {
                let ty = self.literal_type(literal);
                if !self.assignable(scrutinee, &ty) && !self.assignable(&ty, scrutinee) {
                    self.error(
                        TypeError::Mismatch {
                            expected: scrutinee.clone(),
                            found: ty,
                        },
                        position,
                    );
                }
            }
            Pattern::EnumVariant { enum_name, variant } => {
                let ty = self.enum_variant_type(enum_name, variant, position);
                if !self.assignable(scrutinee, &ty) {
                    self.error(
                        TypeError::Mismatch {
                            expected: scrutinee.clone(),
                            found: ty,
                        },
                        position,
                    );
                }
            }
        }
    }

    pub(crate) fn enum_variant_type(
        &mut self,
        enum_name: &Symbol,
        variant: &Symbol,
        position: Position,
    ) -> Type {
        match self.enums.get(enum_name) {
            Some(variants) if variants.contains(variant) => Type::Enum(enum_name.clone()),
            Some(_) => {
                self.error(
                    TypeError::UnknownField {
                        ty: Type::Enum(enum_name.clone()),
                        field: variant.clone(),
                    },
                    position,
                );
                Type::Error
            }
            None => {
                self.error(TypeError::UnknownType(enum_name.clone()), position);
                Type::Error
            }
        }
    }

    //=================================================
    // Section 3.1 - Inline assembly
    //=================================================

    /// Names used by `load`, `store` and `call`. Stack balance and labels are
    /// checked by the compiler.
    fn check_asm(&mut self, items: &[crate::ast::AsmItem]) {
        use crate::ast::AsmOp;
        for item in items {
            let AsmLine::Instruction {
                op,
                operand: Some(AsmOperand::Name(name)),
            } = &item.line
            else {
                continue;
            };
            match op {
                AsmOp::Load => {
                    if self.lookup(name).is_none() && !self.functions.contains_key(name) {
                        self.error(TypeError::Undefined(name.clone()), item.position);
                    }
                }
                AsmOp::Store => match self.lookup(name).map(|b| b.constant) {
                    Some(true) => self.error(TypeError::ConstantAssignment(name.clone()), item.position),
                    Some(false) => {}
                    None => self.declare(name, SymbolKind::Variable, Type::Any, false, item.position),
                },
                AsmOp::Call => {
                    let known = self.functions.contains_key(name)
                        || crate::runtime::native_spec(name).is_some();
                    if !known {
                        self.error(TypeError::Undefined(name.clone()), item.position);
                    }
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn check_source(source: &str, level: SyntaxLevel) -> (TypedProgram, Diagnostics) {
        let output = parse_source(source, level);
        assert!(
            !output.diagnostics.has_errors(),
            "parse errors: {}",
            output.diagnostics
        );
        check(output.program)
    }

    fn messages(diagnostics: &Diagnostics) -> Vec<String> {
        diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn accepts_a_well_typed_program() {
        let (_, diagnostics) = check_source(
            "fn add(a: int, b: int) -> int { return a + b; }\nlet x: float = add(1, 2);\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
    }

    #[test]
    fn reports_undefined_symbols_and_keeps_going() {
        let (_, diagnostics) = check_source("let a = b + 1;\nlet c = d;\n", SyntaxLevel::Medium);
        assert_eq!(diagnostics.error_count(), 2, "{diagnostics}");
    }

    #[test]
    fn rejects_narrowing_assignment() {
        let (_, diagnostics) = check_source("let x: int = 1.5;\n", SyntaxLevel::Medium);
        assert!(messages(&diagnostics)[0].contains("expected int, found float"));
    }

    #[test]
    fn null_fits_reference_types_only() {
        let (_, diagnostics) = check_source(
            "class Node { value: int }\nlet n: Node = null;\nlet i: int = null;\n",
            SyntaxLevel::Medium,
        );
        assert_eq!(diagnostics.error_count(), 1, "{diagnostics}");
    }

    #[test]
    fn subclasses_and_interfaces_widen_to_their_base() {
        let (_, diagnostics) = check_source(
            "interface Shape { fn area() -> float; }\n\
             class Base { }\n\
             class Square : Base, Shape { side: float\n fn area() -> float { return self.side * self.side; } }\n\
             let b: Base = new Square();\n\
             let s: Shape = new Square();\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
    }

    #[test]
    fn missing_interface_method_is_reported() {
        let (_, diagnostics) = check_source(
            "interface Shape { fn area() -> float; }\nclass Blob : Shape { }\n",
            SyntaxLevel::Medium,
        );
        assert!(messages(&diagnostics)[0].contains("does not implement"));
    }

    #[test]
    fn generic_parameters_are_inferred_from_arguments() {
        let (typed, diagnostics) = check_source(
            "fn id<T>(x: T) -> T { return x; }\nid(3);\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
        let call = match &typed.program.statements[1].kind {
            StmtKind::Expr(expr) => expr.id,
            other => panic!("expected call statement, found {other:?}"),
        };
        assert_eq!(typed.type_of(call), Some(&Type::Int));
    }

    #[test]
    fn undetermined_generic_is_ambiguous() {
        let (_, diagnostics) = check_source(
            "fn make<T>() -> T { return null; }\nmake();\n",
            SyntaxLevel::Medium,
        );
        assert!(
            messages(&diagnostics)
                .iter()
                .any(|m| m.contains("cannot infer type parameter 'T'")),
            "{diagnostics}"
        );
    }

    #[test]
    fn units_must_agree_for_addition() {
        let (_, diagnostics) = check_source(
            "let d = 3.0m;\nlet t = 2.0s;\nlet v: float[m/s] = d / t;\nlet bad = d + t;\n",
            SyntaxLevel::Medium,
        );
        assert_eq!(diagnostics.error_count(), 1, "{diagnostics}");
        assert!(messages(&diagnostics)[0].contains("unit mismatch"));
    }

    #[test]
    fn non_boolean_condition_is_a_warning() {
        let (_, diagnostics) = check_source("if 1 { }\n", SyntaxLevel::Medium);
        assert_eq!(diagnostics.len(), 1);
        assert!(!diagnostics.has_errors());
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let (_, diagnostics) = check_source("break;\n", SyntaxLevel::Medium);
        assert!(messages(&diagnostics)[0].contains("outside of a loop"));
    }

    #[test]
    fn pointer_deref_requires_a_pointer() {
        let (_, diagnostics) =
            check_source("let x = 1;\nlet p = &x;\nlet y: int = *p;\nlet z = *x;\n", SyntaxLevel::Low);
        assert_eq!(diagnostics.error_count(), 1, "{diagnostics}");
        assert!(messages(&diagnostics)[0].contains("non-pointer"));
    }

    #[test]
    fn call_arity_is_checked() {
        let (_, diagnostics) = check_source(
            "fn f(a: int) -> int { return a; }\nf(1, 2);\n",
            SyntaxLevel::Medium,
        );
        assert!(messages(&diagnostics)[0].contains("expects 1 argument"));
    }

    #[test]
    fn functions_see_globals_declared_after_them() {
        let (_, diagnostics) = check_source(
            "fn read() -> int { return counter; }\nlet counter = 4;\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
    }

    #[test]
    fn segments_share_one_global_scope() {
        let (typed, diagnostics) = check_source(
            "@high\nlet total be 5\n@medium\nlet doubled = total * 2;\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
        let globals: Vec<&str> = typed.symbols.globals().map(|s| s.name.as_str()).collect();
        assert_eq!(globals, vec!["total", "doubled"]);
    }

    #[test]
    fn assembly_store_declares_its_target() {
        let (_, diagnostics) = check_source(
            "@assembly\npush 1\nstore fresh\nload fresh\nprint\n",
            SyntaxLevel::Medium,
        );
        assert!(diagnostics.is_empty(), "{diagnostics}");
    }
}
