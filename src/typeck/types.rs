//=====================================================
// File: typeck/types.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Semantic types and the declaration symbol table
// Objective: Give the checker a closed type vocabulary (units included) and
//            record every declaration it resolves for later stages
//=====================================================

use std::collections::HashMap;
use std::fmt;

use crate::ast::{Position, Unit};
use crate::symbol::Symbol;

#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    Null,
    Void,
    Any,
    /// Float carrying a unit of measure. Never dimensionless; see
    /// [`Type::quantity`].
    Quantity(Unit),
    Array(Box<Type>),
    Pointer(Box<Type>),
    Function {
        params: Vec<Type>,
        ret: Box<Type>,
    },
    Class(Symbol),
    Interface(Symbol),
    Struct(Symbol),
    Enum(Symbol),
    /// Generic type parameter, opaque inside the declaring function.
    Param(Symbol),
    /// Result of an expression that already produced a diagnostic. Compatible
    /// with everything so one mistake is reported once.
    Error,
}

impl Type {
    /// Dimensionless quantities collapse to plain floats.
    pub fn quantity(unit: Unit) -> Type {
        if unit.is_dimensionless() {
            Type::Float
        } else {
            Type::Quantity(unit)
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Quantity(_))
    }

    /// Types that accept `null`.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Type::Str
                | Type::Array(_)
                | Type::Pointer(_)
                | Type::Function { .. }
                | Type::Class(_)
                | Type::Interface(_)
                | Type::Struct(_)
                | Type::Null
        )
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Type::Any | Type::Error)
    }

    pub fn unit(&self) -> Option<&Unit> {
        match self {
            Type::Quantity(unit) => Some(unit),
            _ => None,
        }
    }

    /// Replaces generic parameters using `bindings`.
    pub fn substitute(&self, bindings: &HashMap<Symbol, Type>) -> Type {
        match self {
            Type::Param(name) => bindings.get(name).cloned().unwrap_or(Type::Any),
            Type::Array(inner) => Type::Array(Box::new(inner.substitute(bindings))),
            Type::Pointer(inner) => Type::Pointer(Box::new(inner.substitute(bindings))),
            Type::Function { params, ret } => Type::Function {
                params: params.iter().map(|p| p.substitute(bindings)).collect(),
                ret: Box::new(ret.substitute(bindings)),
            },
            other => other.clone(),
        }
    }

    pub fn mentions_param(&self) -> bool {
        match self {
            Type::Param(_) => true,
            Type::Array(inner) | Type::Pointer(inner) => inner.mentions_param(),
            Type::Function { params, ret } => {
                params.iter().any(Type::mentions_param) || ret.mentions_param()
            }
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => f.write_str("int"),
            Type::Float => f.write_str("float"),
            Type::Bool => f.write_str("bool"),
            Type::Str => f.write_str("string"),
            Type::Null => f.write_str("null"),
            Type::Void => f.write_str("void"),
            Type::Any => f.write_str("any"),
            Type::Quantity(unit) => write!(f, "float[{unit}]"),
            Type::Array(inner) => write!(f, "[{inner}]"),
            Type::Pointer(inner) => write!(f, "*{inner}"),
            Type::Function { params, ret } => {
                let params: Vec<String> = params.iter().map(ToString::to_string).collect();
                write!(f, "fn({}) -> {ret}", params.join(", "))
            }
            Type::Class(name)
            | Type::Interface(name)
            | Type::Struct(name)
            | Type::Enum(name)
            | Type::Param(name) => write!(f, "{name}"),
            Type::Error => f.write_str("<error>"),
        }
    }
}

/// Signature of a callable: user function, method, lambda or native.
#[derive(Debug, Clone, PartialEq)]
pub struct FnSig {
    pub generics: Vec<Symbol>,
    pub params: Vec<Type>,
    /// Trailing parameters beyond this count are optional.
    pub min_args: usize,
    pub ret: Type,
}

impl FnSig {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            generics: Vec::new(),
            min_args: params.len(),
            params,
            ret,
        }
    }

    pub fn as_type(&self) -> Type {
        Type::Function {
            params: self.params.clone(),
            ret: Box::new(self.ret.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Constant,
    Parameter,
    Function,
    Class,
    Interface,
    Struct,
    Enum,
    Field,
    Method,
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Parameter => "parameter",
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Interface => "interface",
            SymbolKind::Struct => "struct",
            SymbolKind::Enum => "enum",
            SymbolKind::Field => "field",
            SymbolKind::Method => "method",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
    pub name: Symbol,
    pub kind: SymbolKind,
    pub ty: Type,
    pub position: Position,
    pub scope_depth: usize,
}

/// Every declaration the checker resolved, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolTable {
    entries: Vec<SymbolInfo>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, info: SymbolInfo) {
        self.entries.push(info);
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All declarations of `name`, outermost first.
    pub fn lookup<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SymbolInfo> + 'a {
        self.entries.iter().filter(move |info| info.name.as_str() == name)
    }

    pub fn globals(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.entries.iter().filter(|info| info.scope_depth == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensionless_quantities_are_floats() {
        let unit = Unit::base("m").div(&Unit::base("m"));
        assert_eq!(Type::quantity(unit), Type::Float);
        assert_eq!(
            Type::quantity(Unit::base("s")).to_string(),
            "float[s]".to_string()
        );
    }

    #[test]
    fn substitution_replaces_parameters() {
        let mut bindings = HashMap::new();
        bindings.insert(Symbol::from("T"), Type::Int);
        let ty = Type::Array(Box::new(Type::Param(Symbol::from("T"))));
        assert_eq!(ty.substitute(&bindings), Type::Array(Box::new(Type::Int)));
        assert!(ty.mentions_param());
    }
}
