//=====================================================
// File: ast/mod.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Strata Abstract Syntax Tree definitions
// Objective: Define the single node vocabulary every syntax level parses
//            into: expressions, statements, declarations, patterns, type
//            annotations and inline assembly
//=====================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::symbol::Symbol;
pub use crate::tokenizer::{Position, SyntaxLevel};

pub type NodeId = u32;

static NODE_COUNTER: AtomicU32 = AtomicU32::new(1);

pub fn next_node_id() -> NodeId {
    NODE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Unit of measure as a product of base units with integer exponents.
/// `m/s^2` is `{m: 1, s: -2}`. The empty unit is dimensionless.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Unit {
    factors: BTreeMap<Symbol, i32>,
}

impl Unit {
    pub fn dimensionless() -> Self {
        Self::default()
    }

    pub fn base(name: impl Into<Symbol>) -> Self {
        let mut factors = BTreeMap::new();
        factors.insert(name.into(), 1);
        Self { factors }
    }

    pub fn is_dimensionless(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn pow(&self, exponent: i32) -> Self {
        let factors = self
            .factors
            .iter()
            .map(|(name, power)| (name.clone(), power * exponent))
            .filter(|(_, power)| *power != 0)
            .collect();
        Self { factors }
    }

    pub fn mul(&self, other: &Unit) -> Self {
        let mut factors = self.factors.clone();
        for (name, power) in &other.factors {
            let entry = factors.entry(name.clone()).or_insert(0);
            *entry += power;
        }
        factors.retain(|_, power| *power != 0);
        Self { factors }
    }

    pub fn div(&self, other: &Unit) -> Self {
        self.mul(&other.pow(-1))
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.factors.is_empty() {
            return f.write_str("1");
        }
        let mut numerator = Vec::new();
        let mut denominator = Vec::new();
        for (name, power) in &self.factors {
            let target = if *power > 0 {
                &mut numerator
            } else {
                &mut denominator
            };
            match power.abs() {
                1 => target.push(name.to_string()),
                n => target.push(format!("{name}^{n}")),
            }
        }
        if numerator.is_empty() {
            numerator.push("1".to_string());
        }
        write!(f, "{}", numerator.join("*"))?;
        for part in denominator {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

/// Written type annotation. Resolution to semantic types happens in the
/// type checker.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeExpr {
    /// `int`, `float`, `string`, `bool`, `void`, `any`, a class, struct,
    /// interface, enum or generic parameter name.
    Named(Symbol),
    Array(Box<TypeExpr>),
    Pointer(Box<TypeExpr>),
    Function {
        params: Vec<TypeExpr>,
        ret: Box<TypeExpr>,
    },
    /// `float[m/s]`
    Quantity(Unit),
}

impl fmt::Display for TypeExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeExpr::Named(name) => write!(f, "{name}"),
            TypeExpr::Array(inner) => write!(f, "[{inner}]"),
            TypeExpr::Pointer(inner) => write!(f, "*{inner}"),
            TypeExpr::Function { params, ret } => {
                let params: Vec<String> = params.iter().map(ToString::to_string).collect();
                write!(f, "fn({}) -> {ret}", params.join(", "))
            }
            TypeExpr::Quantity(unit) => write!(f, "float[{unit}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    Float(f64),
    Quantity(f64, Unit),
    String(Symbol),
    Boolean(bool),
    Null,
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Integer(n) => write!(f, "{n}"),
            Literal::Float(n) => write!(f, "{n:?}"),
            Literal::Quantity(n, unit) => write!(f, "{n:?}[{unit}]"),
            Literal::String(s) => write!(f, "{:?}", s.as_str()),
            Literal::Boolean(b) => write!(f, "{b}"),
            Literal::Null => f.write_str("null"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    LeftShift,
    RightShift,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "==",
            BinaryOp::NotEqual => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEqual => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEqual => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::BitwiseAnd => "&",
            BinaryOp::BitwiseOr => "|",
            BinaryOp::BitwiseXor => "^",
            BinaryOp::LeftShift => "<<",
            BinaryOp::RightShift => ">>",
        }
    }

    /// `&&` and `||` evaluate their right operand conditionally.
    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::LessEqual
                | BinaryOp::Greater
                | BinaryOp::GreaterEqual
        )
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            BinaryOp::BitwiseAnd
                | BinaryOp::BitwiseOr
                | BinaryOp::BitwiseXor
                | BinaryOp::LeftShift
                | BinaryOp::RightShift
        )
    }

    /// Operand order does not change the result for these operators.
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            BinaryOp::Multiply
                | BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::BitwiseAnd
                | BinaryOp::BitwiseOr
                | BinaryOp::BitwiseXor
        )
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Negate,
    Not,
    BitwiseNot,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Negate => "-",
            UnaryOp::Not => "!",
            UnaryOp::BitwiseNot => "~",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: NodeId,
    pub position: Position,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Variable(Symbol),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    /// Target is a variable, field, index or dereference expression.
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    MethodCall {
        receiver: Box<Expr>,
        method: Symbol,
        args: Vec<Expr>,
    },
    Field {
        object: Box<Expr>,
        field: Symbol,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Array(Vec<Expr>),
    Lambda(Box<LambdaExpr>),
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `new C(args)`
    New {
        class: Symbol,
        args: Vec<Expr>,
    },
    /// `new S { f: e, ... }`
    StructLiteral {
        name: Symbol,
        fields: Vec<(Symbol, Expr)>,
    },
    /// `&e`: boxes the value into a heap cell and yields a pointer to it.
    AddressOf(Box<Expr>),
    /// `*p`
    Deref(Box<Expr>),
    SizeOf(TypeExpr),
    /// `Color::Red`
    EnumVariant {
        enum_name: Symbol,
        variant: Symbol,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LambdaExpr {
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    /// Expression lambdas (`fn(a) => e`) are stored as `[return e]`.
    pub body: Vec<Stmt>,
}

impl Expr {
    pub fn new(kind: ExprKind, position: Position) -> Self {
        Self {
            id: next_node_id(),
            position,
            kind,
        }
    }

    pub fn literal(value: Literal, position: Position) -> Self {
        Self::new(ExprKind::Literal(value), position)
    }

    pub fn variable(name: impl Into<Symbol>, position: Position) -> Self {
        Self::new(ExprKind::Variable(name.into()), position)
    }

    pub fn binary(op: BinaryOp, left: Expr, right: Expr, position: Position) -> Self {
        Self::new(
            ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            position,
        )
    }

    pub fn unary(op: UnaryOp, operand: Expr, position: Position) -> Self {
        Self::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            position,
        )
    }

    pub fn assign(target: Expr, value: Expr, position: Position) -> Self {
        Self::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            position,
        )
    }

    pub fn call(callee: Expr, args: Vec<Expr>, position: Position) -> Self {
        Self::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args,
            },
            position,
        )
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match &self.kind {
            ExprKind::Literal(literal) => Some(literal),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Symbol> {
        match &self.kind {
            ExprKind::Variable(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self.kind, ExprKind::Literal(_))
    }

    /// True when evaluating the expression has no side effects and its only
    /// reads are variables. Operators may still fault on the operand types
    /// they meet at run time; see [`Expr::cannot_fault`].
    pub fn is_pure(&self) -> bool {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Variable(_) | ExprKind::EnumVariant { .. } => true,
            ExprKind::SizeOf(_) => true,
            ExprKind::Unary { operand, .. } => operand.is_pure(),
            ExprKind::Binary { op, left, right } => {
                let divisor_safe = match op {
                    BinaryOp::Divide | BinaryOp::Modulo => matches!(
                        right.as_literal(),
                        Some(Literal::Integer(n)) if *n != 0
                    ) || matches!(
                        right.as_literal(),
                        Some(Literal::Float(_) | Literal::Quantity(..))
                    ),
                    _ => true,
                };
                divisor_safe && left.is_pure() && right.is_pure()
            }
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => condition.is_pure() && then_expr.is_pure() && else_expr.is_pure(),
            _ => false,
        }
    }

    /// Pure and free of any operator that can raise at run time, whatever
    /// the operand values. Only such expressions may be evaluated where the
    /// source would not have evaluated them.
    pub fn cannot_fault(&self) -> bool {
        match &self.kind {
            ExprKind::Literal(_) | ExprKind::Variable(_) | ExprKind::EnumVariant { .. } => true,
            ExprKind::SizeOf(_) => true,
            ExprKind::Unary {
                op: UnaryOp::Not,
                operand,
            } => operand.cannot_fault(),
            ExprKind::Binary { op, left, right } => {
                matches!(
                    op,
                    BinaryOp::Equal | BinaryOp::NotEqual | BinaryOp::And | BinaryOp::Or
                ) && left.cannot_fault()
                    && right.cannot_fault()
            }
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => condition.cannot_fault() && then_expr.cannot_fault() && else_expr.cannot_fault(),
            _ => false,
        }
    }

    /// True when the expression contains a call of any kind, including object
    /// construction.
    pub fn contains_call(&self) -> bool {
        match &self.kind {
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } | ExprKind::New { .. } => true,
            ExprKind::Literal(_)
            | ExprKind::Variable(_)
            | ExprKind::EnumVariant { .. }
            | ExprKind::SizeOf(_)
            | ExprKind::Lambda(_) => false,
            ExprKind::Binary { left, right, .. } => left.contains_call() || right.contains_call(),
            ExprKind::Unary { operand, .. } => operand.contains_call(),
            ExprKind::Assign { target, value } => target.contains_call() || value.contains_call(),
            ExprKind::Field { object, .. } => object.contains_call(),
            ExprKind::Index { object, index } => object.contains_call() || index.contains_call(),
            ExprKind::Array(items) => items.iter().any(Expr::contains_call),
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => condition.contains_call() || then_expr.contains_call() || else_expr.contains_call(),
            ExprKind::StructLiteral { fields, .. } => fields.iter().any(|(_, e)| e.contains_call()),
            ExprKind::AddressOf(inner) | ExprKind::Deref(inner) => inner.contains_call(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Symbol,
    pub ty: Option<TypeExpr>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LetDecl {
    pub name: Symbol,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub mutable: bool,
    pub constant: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: Symbol,
    pub generics: Vec<Symbol>,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub body: Vec<Stmt>,
    /// Attribute names written as `#[name]` before the declaration.
    pub attributes: Vec<Symbol>,
    pub position: Position,
}

impl FunctionDecl {
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|attr| attr.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDecl {
    pub name: Symbol,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassDecl {
    pub name: Symbol,
    /// Names after `:`. At most one may be a class; the rest are interfaces.
    pub parents: Vec<Symbol>,
    pub fields: Vec<FieldDecl>,
    pub methods: Vec<FunctionDecl>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSignature {
    pub name: Symbol,
    pub params: Vec<Param>,
    pub return_type: Option<TypeExpr>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceDecl {
    pub name: Symbol,
    pub methods: Vec<MethodSignature>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDecl {
    pub name: Symbol,
    pub fields: Vec<(Symbol, TypeExpr)>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDecl {
    pub name: Symbol,
    pub variants: Vec<Symbol>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Literal(Literal),
    Wildcard,
    Binding(Symbol),
    EnumVariant { enum_name: Symbol, variant: Symbol },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<Expr>,
    pub body: Vec<Stmt>,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    pub name: Symbol,
    /// `None` catches every thrown value.
    pub class: Option<Symbol>,
    pub body: Vec<Stmt>,
    pub position: Position,
}

/// Assembly mnemonics accepted at `@assembly`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AsmOp {
    Nop,
    Push,
    Pop,
    Dup,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Load,
    Store,
    Jmp,
    Jz,
    Jnz,
    Call,
    Ret,
    Print,
}

impl AsmOp {
    pub fn from_mnemonic(text: &str) -> Option<Self> {
        Some(match text.to_ascii_lowercase().as_str() {
            "nop" => AsmOp::Nop,
            "push" => AsmOp::Push,
            "pop" => AsmOp::Pop,
            "dup" => AsmOp::Dup,
            "add" => AsmOp::Add,
            "sub" => AsmOp::Sub,
            "mul" => AsmOp::Mul,
            "div" => AsmOp::Div,
            "mod" => AsmOp::Mod,
            "neg" => AsmOp::Neg,
            "not" => AsmOp::Not,
            "eq" => AsmOp::Eq,
            "ne" => AsmOp::Ne,
            "lt" => AsmOp::Lt,
            "le" => AsmOp::Le,
            "gt" => AsmOp::Gt,
            "ge" => AsmOp::Ge,
            "and" => AsmOp::And,
            "or" => AsmOp::Or,
            "load" => AsmOp::Load,
            "store" => AsmOp::Store,
            "jmp" => AsmOp::Jmp,
            "jz" => AsmOp::Jz,
            "jnz" => AsmOp::Jnz,
            "call" => AsmOp::Call,
            "ret" => AsmOp::Ret,
            "print" => AsmOp::Print,
            _ => return None,
        })
    }

    /// Operand shape required by the mnemonic.
    pub fn operand_kind(self) -> AsmOperandKind {
        match self {
            AsmOp::Push => AsmOperandKind::Literal,
            AsmOp::Load | AsmOp::Store | AsmOp::Call => AsmOperandKind::Name,
            AsmOp::Jmp | AsmOp::Jz | AsmOp::Jnz => AsmOperandKind::Label,
            _ => AsmOperandKind::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsmOperandKind {
    None,
    Literal,
    Name,
    Label,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsmOperand {
    Literal(Literal),
    Name(Symbol),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AsmLine {
    Label(Symbol),
    Instruction {
        op: AsmOp,
        operand: Option<AsmOperand>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsmItem {
    pub line: AsmLine,
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub position: Position,
    pub kind: StmtKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Expr(Expr),
    Let(LetDecl),
    Function(FunctionDecl),
    Class(ClassDecl),
    Interface(InterfaceDecl),
    Struct(StructDecl),
    Enum(EnumDecl),
    Block(Vec<Stmt>),
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    /// C-style `for (init; condition; update)`.
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        update: Option<Expr>,
        body: Vec<Stmt>,
    },
    /// `for i in a..b`, `for each i from a to b`, `repeat n times`.
    ForRange {
        variable: Symbol,
        start: Expr,
        end: Expr,
        inclusive: bool,
        body: Vec<Stmt>,
    },
    Loop(Vec<Stmt>),
    Match {
        scrutinee: Expr,
        arms: Vec<MatchArm>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Throw(Expr),
    Try {
        body: Vec<Stmt>,
        catches: Vec<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
    Asm(Vec<AsmItem>),
}

impl Stmt {
    pub fn new(kind: StmtKind, position: Position) -> Self {
        Self { position, kind }
    }

    pub fn expr(expr: Expr) -> Self {
        let position = expr.position;
        Self::new(StmtKind::Expr(expr), position)
    }

    pub fn block(statements: Vec<Stmt>, position: Position) -> Self {
        Self::new(StmtKind::Block(statements), position)
    }

    pub fn let_decl(name: impl Into<Symbol>, init: Expr, position: Position) -> Self {
        Self::new(
            StmtKind::Let(LetDecl {
                name: name.into(),
                ty: None,
                init: Some(init),
                mutable: true,
                constant: false,
            }),
            position,
        )
    }

    /// Declarations survive dead-code elimination even after a `return`.
    pub fn is_declaration(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::Function(_)
                | StmtKind::Class(_)
                | StmtKind::Interface(_)
                | StmtKind::Struct(_)
                | StmtKind::Enum(_)
        )
    }

    /// Control never continues past these statements.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::Return(_) | StmtKind::Throw(_) | StmtKind::Break | StmtKind::Continue
        )
    }
}

/// A parsed translation unit. Segments written at different syntax levels
/// are concatenated into one statement list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }

    pub fn find_functions(&self) -> Vec<&FunctionDecl> {
        self.statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Function(decl) => Some(decl),
                _ => None,
            })
            .collect()
    }

    pub fn find_classes(&self) -> Vec<&ClassDecl> {
        self.statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StmtKind::Class(decl) => Some(decl),
                _ => None,
            })
            .collect()
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDecl> {
        self.find_functions()
            .into_iter()
            .find(|decl| decl.name.as_str() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> Position {
        Position::new(1, 1, 0)
    }

    #[test]
    fn unit_algebra_cancels_factors() {
        let speed = Unit::base("m").div(&Unit::base("s"));
        assert_eq!(speed.to_string(), "m/s");
        let distance = speed.mul(&Unit::base("s"));
        assert_eq!(distance, Unit::base("m"));
        assert!(Unit::base("m").div(&Unit::base("m")).is_dimensionless());
    }

    #[test]
    fn purity_rejects_faulting_division() {
        let safe = Expr::binary(
            BinaryOp::Divide,
            Expr::variable("x", pos()),
            Expr::literal(Literal::Integer(2), pos()),
            pos(),
        );
        let unsafe_div = Expr::binary(
            BinaryOp::Divide,
            Expr::variable("x", pos()),
            Expr::variable("y", pos()),
            pos(),
        );
        assert!(safe.is_pure());
        assert!(!unsafe_div.is_pure());
        assert!(!safe.cannot_fault());
        let compare = Expr::binary(
            BinaryOp::NotEqual,
            Expr::variable("x", pos()),
            Expr::literal(Literal::Null, pos()),
            pos(),
        );
        assert!(compare.cannot_fault());
        let call = Expr::call(Expr::variable("f", pos()), vec![], pos());
        assert!(!call.is_pure());
        assert!(call.contains_call());
    }

    #[test]
    fn node_ids_are_unique() {
        let a = Expr::variable("a", pos());
        let b = Expr::variable("a", pos());
        assert_ne!(a.id, b.id);
    }
}

//=====================================================
// End of file
//=====================================================
