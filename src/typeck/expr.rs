//=====================================================
// File: typeck/expr.rs
//=====================================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Expression typing
// Objective: Infer a type for every expression node, including calls with
//            generic unification and unit arithmetic on quantities
//=====================================================

use std::collections::HashMap;

use super::{Checker, FnContext, FnSig, SymbolKind, Type, TypeError, TypeKind};
use crate::ast::{BinaryOp, Expr, ExprKind, LambdaExpr, Literal, Position, UnaryOp, Unit};
use crate::runtime::native_spec;
use crate::symbol::Symbol;

impl Checker {
    pub(crate) fn check_expr(&mut self, expr: &Expr) -> Type {
        let ty = self.infer(expr);
        self.record_type(expr.id, &ty);
        ty
    }

    fn infer(&mut self, expr: &Expr) -> Type {
        match &expr.kind {
            ExprKind::Literal(literal) => self.literal_type(literal),
            ExprKind::Variable(name) => self.variable_type(name, expr.position),
            ExprKind::Binary { op, left, right } => {
                let left_ty = self.check_expr(left);
                let right_ty = self.check_expr(right);
                self.binary_type(*op, left_ty, right_ty, expr.position)
            }
            ExprKind::Unary { op, operand } => {
                let operand_ty = self.check_expr(operand);
                self.unary_type(*op, operand_ty, expr.position)
            }
            ExprKind::Assign { target, value } => self.check_assign(target, value),
            ExprKind::Call { callee, args } => self.check_call(callee, args, expr.position),
            ExprKind::MethodCall {
                receiver,
                method,
                args,
            } => self.check_method_call(receiver, method, args, expr.position),
            ExprKind::Field { object, field } => {
                let object_ty = self.check_expr(object);
                self.field_type(&object_ty, field, expr.position)
            }
            ExprKind::Index { object, index } => {
                let object_ty = self.check_expr(object);
                let index_ty = self.check_expr(index);
                self.expect_assignable(&Type::Int, &index_ty, index.position);
                match object_ty {
                    Type::Array(element) => *element,
                    Type::Str => Type::Str,
                    ty if ty.is_dynamic() => Type::Any,
                    other => {
                        self.error(TypeError::NotIndexable(other), expr.position);
                        Type::Error
                    }
                }
            }
            ExprKind::Array(items) => {
                let mut element: Option<Type> = None;
                for item in items {
                    let ty = match self.check_expr(item) {
                        Type::Null => Type::Any,
                        ty => ty,
                    };
                    element = Some(match element {
                        None => ty,
                        Some(current) if self.assignable(&current, &ty) => current,
                        Some(current) if self.assignable(&ty, &current) => ty,
                        Some(_) => Type::Any,
                    });
                }
                Type::Array(Box::new(element.unwrap_or(Type::Any)))
            }
            ExprKind::Lambda(lambda) => self.check_lambda(lambda, expr.position),
            ExprKind::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.check_condition(condition);
                let then_ty = self.check_expr(then_expr);
                let else_ty = self.check_expr(else_expr);
                if self.assignable(&then_ty, &else_ty) && then_ty != Type::Null {
                    then_ty
                } else if self.assignable(&else_ty, &then_ty) {
                    else_ty
                } else {
                    Type::Any
                }
            }
            ExprKind::New { class, args } => self.check_new(class, args, expr.position),
            ExprKind::StructLiteral { name, fields } => {
                let layout = self.structs.get(name).cloned();
                let Some(layout) = layout else {
                    self.error(TypeError::UnknownType(name.clone()), expr.position);
                    for (_, value) in fields {
                        self.check_expr(value);
                    }
                    return Type::Error;
                };
                for (field, value) in fields {
                    let value_ty = self.check_expr(value);
                    match layout.iter().find(|(f, _)| f == field) {
                        Some((_, declared)) => {
                            let declared = declared.clone();
                            self.expect_assignable(&declared, &value_ty, value.position);
                        }
                        None => self.error(
                            TypeError::UnknownField {
                                ty: Type::Struct(name.clone()),
                                field: field.clone(),
                            },
                            value.position,
                        ),
                    }
                }
                Type::Struct(name.clone())
            }
            ExprKind::AddressOf(inner) => Type::Pointer(Box::new(self.check_expr(inner))),
            ExprKind::Deref(inner) => match self.check_expr(inner) {
                Type::Pointer(target) => *target,
                ty if ty.is_dynamic() => Type::Any,
                other => {
                    self.error(TypeError::NotAPointer(other), expr.position);
                    Type::Error
                }
            },
            ExprKind::SizeOf(ty) => {
                self.resolve_type(ty, expr.position);
                Type::Int
            }
            ExprKind::EnumVariant { enum_name, variant } => {
                self.enum_variant_type(enum_name, variant, expr.position)
            }
        }
    }

    pub(crate) fn literal_type(&self, literal: &Literal) -> Type {
        match literal {
            Literal::Integer(_) => Type::Int,
            Literal::Float(_) => Type::Float,
            Literal::Quantity(_, unit) => Type::quantity(unit.clone()),
            Literal::String(_) => Type::Str,
            Literal::Boolean(_) => Type::Bool,
            Literal::Null => Type::Null,
        }
    }

    fn variable_type(&mut self, name: &Symbol, position: Position) -> Type {
        if let Some(binding) = self.lookup(name) {
            return binding.ty.clone();
        }
        if let Some(sig) = self.functions.get(name) {
            return if sig.generics.is_empty() {
                sig.as_type()
            } else {
                Type::Any
            };
        }
        if native_spec(name).is_some() {
            return Type::Any;
        }
        self.error(TypeError::Undefined(name.clone()), position);
        Type::Error
    }

    //=================================================
    // Section 1.0 - Operators and units
    //=================================================

    fn binary_type(&mut self, op: BinaryOp, left: Type, right: Type, position: Position) -> Type {
        let opaque = |ty: &Type| ty.is_dynamic() || matches!(ty, Type::Param(_));
        if opaque(&left) || opaque(&right) {
            return if op.is_comparison() {
                Type::Bool
            } else {
                Type::Any
            };
        }
        let invalid = |checker: &mut Checker, left: Type, right: Type| {
            checker.error(
                TypeError::InvalidOperands {
                    op: op.symbol(),
                    left,
                    right,
                },
                position,
            );
            Type::Error
        };
        match op {
            BinaryOp::Add if left == Type::Str || right == Type::Str => Type::Str,
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Modulo => {
                if !left.is_numeric() || !right.is_numeric() {
                    return invalid(self, left, right);
                }
                match (left.unit(), right.unit()) {
                    (None, None) => numeric_result(&left, &right),
                    (Some(a), Some(b)) if a == b => left.clone(),
                    _ => self.unit_mismatch(left, right, position),
                }
            }
            BinaryOp::Multiply | BinaryOp::Divide => {
                if !left.is_numeric() || !right.is_numeric() {
                    return invalid(self, left, right);
                }
                if left.unit().is_none() && right.unit().is_none() {
                    return numeric_result(&left, &right);
                }
                let dimensionless = Unit::dimensionless();
                let a = left.unit().unwrap_or(&dimensionless);
                let b = right.unit().unwrap_or(&dimensionless);
                let unit = if op == BinaryOp::Multiply {
                    a.mul(b)
                } else {
                    a.div(b)
                };
                Type::quantity(unit)
            }
            BinaryOp::Less | BinaryOp::LessEqual | BinaryOp::Greater | BinaryOp::GreaterEqual => {
                if left == Type::Str && right == Type::Str {
                    return Type::Bool;
                }
                if !left.is_numeric() || !right.is_numeric() {
                    return invalid(self, left, right);
                }
                if left.unit() != right.unit() {
                    self.unit_mismatch(left, right, position);
                }
                Type::Bool
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                if left.is_numeric() && right.is_numeric() && left.unit() != right.unit() {
                    self.unit_mismatch(left, right, position);
                }
                Type::Bool
            }
            BinaryOp::And | BinaryOp::Or => {
                if left == Type::Bool && right == Type::Bool {
                    Type::Bool
                } else {
                    Type::Any
                }
            }
            BinaryOp::BitwiseAnd | BinaryOp::BitwiseOr | BinaryOp::BitwiseXor => {
                match (&left, &right) {
                    (Type::Int, Type::Int) => Type::Int,
                    (Type::Bool, Type::Bool) => Type::Bool,
                    _ => invalid(self, left, right),
                }
            }
            BinaryOp::LeftShift | BinaryOp::RightShift => match (&left, &right) {
                (Type::Int, Type::Int) => Type::Int,
                _ => invalid(self, left, right),
            },
        }
    }

    fn unit_mismatch(&mut self, left: Type, right: Type, position: Position) -> Type {
        self.error(TypeError::UnitMismatch { left, right }, position);
        Type::Error
    }

    fn unary_type(&mut self, op: UnaryOp, operand: Type, position: Position) -> Type {
        if operand.is_dynamic() || matches!(operand, Type::Param(_)) {
            return if op == UnaryOp::Not { Type::Bool } else { Type::Any };
        }
        match op {
            UnaryOp::Not => Type::Bool,
            UnaryOp::Negate if operand.is_numeric() => operand,
            UnaryOp::BitwiseNot if operand == Type::Int => Type::Int,
            _ => {
                let symbol = match op {
                    UnaryOp::Negate => "-",
                    UnaryOp::Not => "!",
                    UnaryOp::BitwiseNot => "~",
                };
                self.error(
                    TypeError::InvalidOperand {
                        op: symbol,
                        operand,
                    },
                    position,
                );
                Type::Error
            }
        }
    }

    //=================================================
    // Section 2.0 - Assignment
    //=================================================

    fn check_assign(&mut self, target: &Expr, value: &Expr) -> Type {
        let value_ty = self.check_expr(value);
        let target_ty = match &target.kind {
            ExprKind::Variable(name) => {
                let ty = match self.lookup(name).cloned() {
                    Some(binding) => {
                        if binding.constant {
                            self.error(TypeError::ConstantAssignment(name.clone()), target.position);
                        }
                        binding.ty
                    }
                    None if self.functions.contains_key(name) => {
                        self.error(TypeError::ConstantAssignment(name.clone()), target.position);
                        Type::Error
                    }
                    None => {
                        self.error(TypeError::Undefined(name.clone()), target.position);
                        Type::Error
                    }
                };
                self.record_type(target.id, &ty);
                ty
            }
            ExprKind::Field { .. } | ExprKind::Index { .. } | ExprKind::Deref(_) => {
                self.check_expr(target)
            }
            _ => {
                self.error(TypeError::InvalidTarget, target.position);
                Type::Error
            }
        };
        self.expect_assignable(&target_ty, &value_ty, value.position);
        target_ty
    }

    //=================================================
    // Section 3.0 - Calls
    //=================================================

    fn check_call(&mut self, callee: &Expr, args: &[Expr], position: Position) -> Type {
        if let ExprKind::Variable(name) = &callee.kind {
            if self.lookup(name).is_none() {
                if let Some(sig) = self.functions.get(name).cloned() {
                    self.record_type(callee.id, &sig.as_type());
                    return self.apply_signature(name.as_str(), &sig, args, position);
                }
                if let Some(sig) = native_signature(name) {
                    self.record_type(callee.id, &Type::Any);
                    return self.apply_signature(name.as_str(), &sig, args, position);
                }
            }
        }
        match self.check_expr(callee) {
            Type::Function { params, ret } => {
                let sig = FnSig::new(params, *ret);
                self.apply_signature("function value", &sig, args, position)
            }
            ty if ty.is_dynamic() => {
                for arg in args {
                    self.check_expr(arg);
                }
                Type::Any
            }
            other => {
                self.error(TypeError::NotCallable(other), position);
                for arg in args {
                    self.check_expr(arg);
                }
                Type::Error
            }
        }
    }

    fn check_method_call(
        &mut self,
        receiver: &Expr,
        method: &Symbol,
        args: &[Expr],
        position: Position,
    ) -> Type {
        let receiver_ty = self.check_expr(receiver);
        let sig = match &receiver_ty {
            Type::Class(class) => self.find_method(class, method),
            Type::Interface(iface) => self.interfaces.get(iface).and_then(|methods| {
                methods
                    .iter()
                    .find(|(name, _)| name == method)
                    .map(|(_, sig)| sig.clone())
            }),
            Type::Array(element) => match method.as_str() {
                "len" => Some(FnSig::new(Vec::new(), Type::Int)),
                "push" => Some(FnSig::new(vec![(**element).clone()], Type::Void)),
                "pop" => Some(FnSig::new(Vec::new(), (**element).clone())),
                _ => None,
            },
            Type::Str if method.as_str() == "len" => Some(FnSig::new(Vec::new(), Type::Int)),
            ty if ty.is_dynamic() => {
                for arg in args {
                    self.check_expr(arg);
                }
                return Type::Any;
            }
            _ => None,
        };
        match sig {
            Some(sig) => {
                let name = format!("{receiver_ty}.{method}");
                self.apply_signature(&name, &sig, args, position)
            }
            None => {
                self.error(
                    TypeError::UnknownMethod {
                        ty: receiver_ty,
                        method: method.clone(),
                    },
                    position,
                );
                for arg in args {
                    self.check_expr(arg);
                }
                Type::Error
            }
        }
    }

    fn check_new(&mut self, class: &Symbol, args: &[Expr], position: Position) -> Type {
        match self.type_names.get(class) {
            Some(TypeKind::Class) => {
                match self.find_method(class, "init") {
                    Some(sig) => {
                        self.apply_signature(&format!("{class}.init"), &sig, args, position);
                    }
                    None => {
                        for arg in args {
                            self.check_expr(arg);
                        }
                        if !args.is_empty() {
                            self.error(
                                TypeError::Arity {
                                    name: class.to_string(),
                                    expected: 0,
                                    found: args.len(),
                                },
                                position,
                            );
                        }
                    }
                }
                Type::Class(class.clone())
            }
            Some(_) => {
                self.error(
                    TypeError::InvalidDeclaration(format!("'{class}' cannot be constructed with new(..)")),
                    position,
                );
                Type::Error
            }
            None => {
                self.error(TypeError::UnknownType(class.clone()), position);
                Type::Error
            }
        }
    }

    /// Checks arguments against a signature, inferring generic parameters
    /// first, and yields the instantiated return type.
    fn apply_signature(&mut self, name: &str, sig: &FnSig, args: &[Expr], position: Position) -> Type {
        let arg_types: Vec<Type> = args.iter().map(|arg| self.check_expr(arg)).collect();
        if arg_types.len() < sig.min_args || arg_types.len() > sig.params.len() {
            self.error(
                TypeError::Arity {
                    name: name.to_string(),
                    expected: sig.params.len(),
                    found: arg_types.len(),
                },
                position,
            );
            return Type::Error;
        }
        let mut bindings = HashMap::new();
        if !sig.generics.is_empty() {
            for (param, (arg, ty)) in sig.params.iter().zip(args.iter().zip(&arg_types)) {
                self.unify(param, ty, &mut bindings, arg.position);
            }
            for generic in &sig.generics {
                if !bindings.contains_key(generic) {
                    self.error(
                        TypeError::AmbiguousGeneric {
                            function: Symbol::from(name),
                            param: generic.clone(),
                        },
                        position,
                    );
                    bindings.insert(generic.clone(), Type::Error);
                }
            }
        }
        for (param, (arg, ty)) in sig.params.iter().zip(args.iter().zip(&arg_types)) {
            let expected = if sig.generics.is_empty() {
                param.clone()
            } else {
                param.substitute(&bindings)
            };
            self.expect_assignable(&expected, ty, arg.position);
        }
        if sig.generics.is_empty() {
            sig.ret.clone()
        } else {
            sig.ret.substitute(&bindings)
        }
    }

    fn unify(
        &mut self,
        param: &Type,
        arg: &Type,
        bindings: &mut HashMap<Symbol, Type>,
        position: Position,
    ) {
        match (param, arg) {
            (Type::Param(name), arg) => {
                let arg = match arg {
                    Type::Null | Type::Void => Type::Any,
                    other => other.clone(),
                };
                match bindings.get(name).cloned() {
                    None => {
                        bindings.insert(name.clone(), arg);
                    }
                    Some(bound) if self.assignable(&bound, &arg) => {}
                    Some(bound) if self.assignable(&arg, &bound) => {
                        bindings.insert(name.clone(), arg);
                    }
                    Some(bound) => self.error(
                        TypeError::Mismatch {
                            expected: bound,
                            found: arg,
                        },
                        position,
                    ),
                }
            }
            (Type::Array(p), Type::Array(a)) | (Type::Pointer(p), Type::Pointer(a)) => {
                self.unify(p, a, bindings, position);
            }
            (
                Type::Function {
                    params: pp,
                    ret: pr,
                },
                Type::Function {
                    params: ap,
                    ret: ar,
                },
            ) if pp.len() == ap.len() => {
                for (p, a) in pp.iter().zip(ap) {
                    self.unify(p, a, bindings, position);
                }
                self.unify(pr, ar, bindings, position);
            }
            (param, arg) if arg.is_dynamic() => bind_unbound(param, bindings),
            _ => {}
        }
    }

    //=================================================
    // Section 4.0 - Members and lambdas
    //=================================================

    fn field_type(&mut self, object: &Type, field: &Symbol, position: Position) -> Type {
        let found = match object {
            Type::Class(class) => self.find_field(class, field),
            Type::Struct(name) => self.structs.get(name).and_then(|fields| {
                fields
                    .iter()
                    .find(|(f, _)| f == field)
                    .map(|(_, ty)| ty.clone())
            }),
            ty if ty.is_dynamic() => Some(Type::Any),
            _ => None,
        };
        found.unwrap_or_else(|| {
            self.error(
                TypeError::UnknownField {
                    ty: object.clone(),
                    field: field.clone(),
                },
                position,
            );
            Type::Error
        })
    }

    fn check_lambda(&mut self, lambda: &LambdaExpr, position: Position) -> Type {
        let params: Vec<Type> = lambda
            .params
            .iter()
            .map(|p| self.resolve_optional(p.ty.as_ref(), p.position))
            .collect();
        let annotated = lambda
            .return_type
            .as_ref()
            .map(|ty| self.resolve_type(ty, position));
        self.contexts.push(FnContext {
            ret: annotated.clone(),
            ..FnContext::default()
        });
        self.push_scope();
        for (param, ty) in lambda.params.iter().zip(&params) {
            self.declare(&param.name, SymbolKind::Parameter, ty.clone(), false, param.position);
        }
        self.check_block_in_scope(&lambda.body);
        self.pop_scope();
        self.contexts.pop();
        Type::Function {
            params,
            ret: Box::new(annotated.unwrap_or(Type::Any)),
        }
    }
}

fn numeric_result(left: &Type, right: &Type) -> Type {
    if *left == Type::Int && *right == Type::Int {
        Type::Int
    } else {
        Type::Float
    }
}

fn bind_unbound(ty: &Type, bindings: &mut HashMap<Symbol, Type>) {
    match ty {
        Type::Param(name) => {
            bindings.entry(name.clone()).or_insert(Type::Any);
        }
        Type::Array(inner) | Type::Pointer(inner) => bind_unbound(inner, bindings),
        Type::Function { params, ret } => {
            for param in params {
                bind_unbound(param, bindings);
            }
            bind_unbound(ret, bindings);
        }
        _ => {}
    }
}

/// Static signatures of the native functions every program can call.
fn native_signature(name: &str) -> Option<FnSig> {
    let spec = native_spec(name)?;
    let t = || Type::Param(Symbol::from("T"));
    let generic = |params: Vec<Type>, ret: Type| FnSig {
        generics: vec![Symbol::from("T")],
        min_args: params.len(),
        params,
        ret,
    };
    let sig = match spec.name {
        "print" | "println" => FnSig::new(vec![Type::Any], Type::Void),
        "len" => FnSig::new(vec![Type::Any], Type::Int),
        "push" => generic(vec![Type::Array(Box::new(t())), t()], Type::Void),
        "pop" => generic(vec![Type::Array(Box::new(t()))], t()),
        "str" | "type_of" => FnSig::new(vec![Type::Any], Type::Str),
        "int" => FnSig::new(vec![Type::Any], Type::Int),
        "abs" => generic(vec![t()], t()),
        "pow" => FnSig::new(vec![Type::Any, Type::Any], Type::Float),
        "gc" => FnSig::new(Vec::new(), Type::Void),
        _ => {
            let params = vec![Type::Any; spec.max_args];
            let ret = if spec.name == "assert" {
                Type::Void
            } else {
                Type::Float
            };
            FnSig {
                generics: Vec::new(),
                min_args: spec.min_args,
                params,
                ret,
            }
        }
    };
    Some(sig)
}

#[cfg(test)]
mod tests {
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;
    use crate::typeck::{Type, check};

    fn type_of_last(source: &str, level: SyntaxLevel) -> Type {
        let output = parse_source(source, level);
        assert!(!output.diagnostics.has_errors(), "{}", output.diagnostics);
        let (typed, diagnostics) = check(output.program);
        assert!(!diagnostics.has_errors(), "{diagnostics}");
        let last = typed.program.statements.last().map(|stmt| &stmt.kind);
        match last {
            Some(crate::ast::StmtKind::Expr(expr)) => typed
                .type_of(expr.id)
                .cloned()
                .unwrap_or_else(|| panic!("no type recorded for {expr:?}")),
            other => panic!("expected trailing expression, found {other:?}"),
        }
    }

    #[test]
    fn integer_and_float_arithmetic_widen() {
        assert_eq!(type_of_last("1 + 2;", SyntaxLevel::Medium), Type::Int);
        assert_eq!(type_of_last("1 + 2.5;", SyntaxLevel::Medium), Type::Float);
        assert_eq!(type_of_last("\"n\" + 2;", SyntaxLevel::Medium), Type::Str);
    }

    #[test]
    fn multiplying_quantities_combines_units() {
        let ty = type_of_last("let d = 10.0m;\nlet t = 2.0s;\nd / t / t;", SyntaxLevel::Medium);
        assert_eq!(ty.to_string(), "float[m/s^2]");
    }

    #[test]
    fn native_push_infers_the_element_type() {
        let ty = type_of_last("let xs = [1, 2];\npop(xs);", SyntaxLevel::Medium);
        assert_eq!(ty, Type::Int);
    }

    #[test]
    fn method_calls_resolve_through_the_class_chain() {
        let ty = type_of_last(
            "class A { fn name() -> string { return \"a\"; } }\nclass B : A { }\nlet b = new B();\nb.name();",
            SyntaxLevel::Medium,
        );
        assert_eq!(ty, Type::Str);
    }

    #[test]
    fn lambdas_have_function_types() {
        let ty = type_of_last("let f = fn(a: int) => a * 2;\nf;", SyntaxLevel::Medium);
        assert_eq!(
            ty,
            Type::Function {
                params: vec![Type::Int],
                ret: Box::new(Type::Any)
            }
        );
    }
}
