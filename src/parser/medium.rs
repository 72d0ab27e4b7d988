//=============================================
// strata/parser/medium.rs
//=============================================
// Author: ZobieLabs
// License: Duality Public License (DPL v1.0)
// Goal: Statement and declaration grammar for @medium and @low
// Objective: Parse C-like statements, classes, interfaces, enums and the
//            systems-level additions (structs, loop) into shared AST nodes
//=============================================

use super::{ParseResult, Parser};
use crate::ast::{
    CatchClause, ClassDecl, EnumDecl, FieldDecl, FunctionDecl, InterfaceDecl,
    LetDecl, Literal, MatchArm, MethodSignature, Pattern, Stmt, StmtKind, StructDecl,
};
use crate::symbol::Symbol;
use crate::tokenizer::TokenKind;

impl Parser {
    //=============================================
    //            Section 1: Statement Dispatch
    //=============================================

    pub(crate) fn parse_brace_statement(&mut self) -> ParseResult<Stmt> {
        let token = self.peek().clone();
        let position = token.position;
        let stmt = match token.kind {
            TokenKind::Hash => {
                let attributes = self.parse_attributes()?;
                let mut decl = self.parse_function_decl()?;
                decl.attributes = attributes;
                Stmt::new(StmtKind::Function(decl), position)
            }
            TokenKind::Let | TokenKind::Const => {
                let decl = self.parse_let_decl()?;
                Stmt::new(StmtKind::Let(decl), position)
            }
            TokenKind::Fn if matches!(self.peek_nth(1).kind, TokenKind::Identifier(_)) => {
                let decl = self.parse_function_decl()?;
                Stmt::new(StmtKind::Function(decl), position)
            }
            TokenKind::If => self.parse_if()?,
            TokenKind::While => {
                self.advance();
                let condition = self.parse_expression()?;
                let body = self.parse_brace_block()?;
                Stmt::new(StmtKind::While { condition, body }, position)
            }
            TokenKind::For => self.parse_for()?,
            TokenKind::Loop => {
                self.require_low("'loop'", position)?;
                self.advance();
                let body = self.parse_brace_block()?;
                Stmt::new(StmtKind::Loop(body), position)
            }
            TokenKind::Match => self.parse_match()?,
            TokenKind::Break => {
                self.advance();
                Stmt::new(StmtKind::Break, position)
            }
            TokenKind::Continue => {
                self.advance();
                Stmt::new(StmtKind::Continue, position)
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.peek().kind,
                    TokenKind::Semicolon | TokenKind::RightBrace | TokenKind::Eof
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Stmt::new(StmtKind::Return(value), position)
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_expression()?;
                Stmt::new(StmtKind::Throw(value), position)
            }
            TokenKind::Try => self.parse_try()?,
            TokenKind::Class => self.parse_class()?,
            TokenKind::Interface => self.parse_interface()?,
            TokenKind::Enum => self.parse_enum()?,
            TokenKind::Struct => {
                self.require_low("'struct'", position)?;
                self.parse_struct()?
            }
            TokenKind::LeftBrace => {
                let body = self.parse_brace_block()?;
                Stmt::block(body, position)
            }
            _ => Stmt::expr(self.parse_expression()?),
        };
        self.eat(&TokenKind::Semicolon);
        Ok(stmt)
    }

    /// `{ statements }`
    pub(crate) fn parse_brace_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.consume(&TokenKind::LeftBrace, "'{'")?;
        let body = self.parse_statements_until(&|p| p.check(&TokenKind::RightBrace));
        self.consume(&TokenKind::RightBrace, "'}'")?;
        Ok(body)
    }

    //=============================================
    //            Section 2: Declarations
    //=============================================

    /// `#[name] #[other]`
    fn parse_attributes(&mut self) -> ParseResult<Vec<Symbol>> {
        let mut attributes = Vec::new();
        while self.eat(&TokenKind::Hash) {
            self.consume(&TokenKind::LeftBracket, "'[' after '#'")?;
            attributes.push(self.consume_identifier("attribute name")?);
            self.consume(&TokenKind::RightBracket, "']' after attribute")?;
        }
        Ok(attributes)
    }

    /// `let [mut] name [: T] [= e]` or `const name [: T] = e`
    pub(crate) fn parse_let_decl(&mut self) -> ParseResult<LetDecl> {
        let constant = self.check(&TokenKind::Const);
        let keyword = self.advance();
        let mutable = !constant && self.eat(&TokenKind::Mut);
        let name = self.consume_identifier("variable name")?;
        let ty = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let init = if self.eat(&TokenKind::Equal) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        if constant && init.is_none() {
            return Err(self.invalid("constant requires an initializer", keyword.position));
        }
        Ok(LetDecl {
            name,
            ty,
            init,
            mutable,
            constant,
        })
    }

    /// `fn name<T>(params) [-> T] { body }`
    pub(crate) fn parse_function_decl(&mut self) -> ParseResult<FunctionDecl> {
        let position = self.consume(&TokenKind::Fn, "'fn'")?.position;
        let name = self.consume_identifier("function name")?;
        let mut generics = Vec::new();
        if self.eat(&TokenKind::Less) {
            loop {
                generics.push(self.consume_identifier("type parameter")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.consume(&TokenKind::Greater, "'>' after type parameters")?;
        }
        self.consume(&TokenKind::LeftParen, "'(' after function name")?;
        let params = self.parse_parameters()?;
        let return_type = if self.eat(&TokenKind::Arrow) {
            Some(self.parse_type()?)
        } else {
            None
        };
        let body = self.parse_brace_block()?;
        Ok(FunctionDecl {
            name,
            generics,
            params,
            return_type,
            body,
            attributes: Vec::new(),
            position,
        })
    }

    /// `class Name [: Base, Iface] { fields and methods }`
    fn parse_class(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Class, "'class'")?.position;
        let name = self.consume_identifier("class name")?;
        let mut parents = Vec::new();
        if self.eat(&TokenKind::Colon) {
            loop {
                parents.push(self.consume_identifier("base class or interface")?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::LeftBrace, "'{' after class header")?;
        let mut fields = Vec::new();
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            let member_position = self.current_position();
            match self.peek().kind {
                TokenKind::Hash => {
                    let attributes = self.parse_attributes()?;
                    let mut method = self.parse_function_decl()?;
                    method.attributes = attributes;
                    methods.push(method);
                }
                TokenKind::Fn => methods.push(self.parse_function_decl()?),
                TokenKind::Let => {
                    let decl = self.parse_let_decl()?;
                    fields.push(FieldDecl {
                        name: decl.name,
                        ty: decl.ty,
                        init: decl.init,
                        position: member_position,
                    });
                }
                TokenKind::Identifier(_) => {
                    let field_name = self.consume_identifier("field name")?;
                    self.consume(&TokenKind::Colon, "':' after field name")?;
                    let ty = Some(self.parse_type()?);
                    let init = if self.eat(&TokenKind::Equal) {
                        Some(self.parse_expression()?)
                    } else {
                        None
                    };
                    fields.push(FieldDecl {
                        name: field_name,
                        ty,
                        init,
                        position: member_position,
                    });
                }
                _ => return Err(self.unexpected("field or method")),
            }
            while self.eat(&TokenKind::Semicolon) || self.eat(&TokenKind::Comma) {}
        }
        self.consume(&TokenKind::RightBrace, "'}' after class body")?;
        Ok(Stmt::new(
            StmtKind::Class(ClassDecl {
                name,
                parents,
                fields,
                methods,
                position,
            }),
            position,
        ))
    }

    /// `interface Name { fn m(params) [-> T]; }`
    fn parse_interface(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Interface, "'interface'")?.position;
        let name = self.consume_identifier("interface name")?;
        self.consume(&TokenKind::LeftBrace, "'{' after interface name")?;
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            let method_position = self.consume(&TokenKind::Fn, "'fn' in interface")?.position;
            let method_name = self.consume_identifier("method name")?;
            self.consume(&TokenKind::LeftParen, "'(' after method name")?;
            let params = self.parse_parameters()?;
            let return_type = if self.eat(&TokenKind::Arrow) {
                Some(self.parse_type()?)
            } else {
                None
            };
            methods.push(MethodSignature {
                name: method_name,
                params,
                return_type,
                position: method_position,
            });
            while self.eat(&TokenKind::Semicolon) {}
        }
        self.consume(&TokenKind::RightBrace, "'}' after interface body")?;
        Ok(Stmt::new(
            StmtKind::Interface(InterfaceDecl {
                name,
                methods,
                position,
            }),
            position,
        ))
    }

    /// `enum Name { A, B, C }`
    fn parse_enum(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Enum, "'enum'")?.position;
        let name = self.consume_identifier("enum name")?;
        self.consume(&TokenKind::LeftBrace, "'{' after enum name")?;
        let mut variants = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            variants.push(self.consume_identifier("enum variant")?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "'}' after enum variants")?;
        Ok(Stmt::new(
            StmtKind::Enum(EnumDecl {
                name,
                variants,
                position,
            }),
            position,
        ))
    }

    /// `struct Name { field: T, ... }`
    fn parse_struct(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Struct, "'struct'")?.position;
        let name = self.consume_identifier("struct name")?;
        self.consume(&TokenKind::LeftBrace, "'{' after struct name")?;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RightBrace) {
            let field = self.consume_identifier("field name")?;
            self.consume(&TokenKind::Colon, "':' after field name")?;
            fields.push((field, self.parse_type()?));
            if !(self.eat(&TokenKind::Comma) || self.eat(&TokenKind::Semicolon)) {
                break;
            }
        }
        self.consume(&TokenKind::RightBrace, "'}' after struct fields")?;
        Ok(Stmt::new(
            StmtKind::Struct(StructDecl {
                name,
                fields,
                position,
            }),
            position,
        ))
    }

    //=============================================
    //            Section 3: Control Flow
    //=============================================

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::If, "'if'")?.position;
        let condition = self.parse_expression()?;
        let then_branch = self.parse_brace_block()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.check(&TokenKind::If) {
                Some(vec![self.parse_if()?])
            } else {
                Some(self.parse_brace_block()?)
            }
        } else {
            None
        };
        Ok(Stmt::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            position,
        ))
    }

    /// `for (init; cond; update) { }` or `for i in a..b { }`
    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::For, "'for'")?.position;
        if self.eat(&TokenKind::LeftParen) {
            let init = if self.check(&TokenKind::Semicolon) {
                None
            } else if matches!(self.peek().kind, TokenKind::Let | TokenKind::Const) {
                let init_position = self.current_position();
                let decl = self.parse_let_decl()?;
                Some(Box::new(Stmt::new(StmtKind::Let(decl), init_position)))
            } else {
                Some(Box::new(Stmt::expr(self.parse_expression()?)))
            };
            self.consume(&TokenKind::Semicolon, "';' after for initializer")?;
            let condition = if self.check(&TokenKind::Semicolon) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.consume(&TokenKind::Semicolon, "';' after for condition")?;
            let update = if self.check(&TokenKind::RightParen) {
                None
            } else {
                Some(self.parse_expression()?)
            };
            self.consume(&TokenKind::RightParen, "')' after for clauses")?;
            let body = self.parse_brace_block()?;
            return Ok(Stmt::new(
                StmtKind::For {
                    init,
                    condition,
                    update,
                    body,
                },
                position,
            ));
        }

        let variable = self.consume_identifier("loop variable")?;
        self.consume(&TokenKind::In, "'in' after loop variable")?;
        let start = self.parse_expression()?;
        let inclusive = if self.eat(&TokenKind::DotDotEqual) {
            true
        } else {
            self.consume(&TokenKind::DotDot, "'..' in range")?;
            false
        };
        let end = self.parse_expression()?;
        let body = self.parse_brace_block()?;
        Ok(Stmt::new(
            StmtKind::ForRange {
                variable,
                start,
                end,
                inclusive,
                body,
            },
            position,
        ))
    }

    /// `match e { pattern [if guard] => body, ... }`
    fn parse_match(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Match, "'match'")?.position;
        let scrutinee = self.parse_expression()?;
        self.consume(&TokenKind::LeftBrace, "'{' after match value")?;
        let mut arms = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            let arm_position = self.current_position();
            let pattern = self.parse_pattern()?;
            let guard = if self.eat(&TokenKind::If) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            self.consume(&TokenKind::FatArrow, "'=>' after pattern")?;
            let body = if self.check(&TokenKind::LeftBrace) {
                self.parse_brace_block()?
            } else {
                vec![self.parse_brace_statement()?]
            };
            arms.push(MatchArm {
                pattern,
                guard,
                body,
                position: arm_position,
            });
            self.eat(&TokenKind::Comma);
        }
        self.consume(&TokenKind::RightBrace, "'}' after match arms")?;
        Ok(Stmt::new(StmtKind::Match { scrutinee, arms }, position))
    }

    fn parse_pattern(&mut self) -> ParseResult<Pattern> {
        let token = self.peek().clone();
        if let Some(literal) = super::expr::literal_of(&token.kind) {
            self.advance();
            return Ok(Pattern::Literal(literal));
        }
        match token.kind {
            TokenKind::Minus => {
                self.advance();
                let negated = match self.peek().kind {
                    TokenKind::Integer(n) => Literal::Integer(n.wrapping_neg()),
                    TokenKind::Float(n) => Literal::Float(-n),
                    _ => return Err(self.unexpected("number after '-' in pattern")),
                };
                self.advance();
                Ok(Pattern::Literal(negated))
            }
            TokenKind::Identifier(name) => {
                self.advance();
                if self.eat(&TokenKind::ColonColon) {
                    let variant = self.consume_identifier("enum variant")?;
                    return Ok(Pattern::EnumVariant {
                        enum_name: name,
                        variant,
                    });
                }
                if name.as_str() == "_" {
                    Ok(Pattern::Wildcard)
                } else {
                    Ok(Pattern::Binding(name))
                }
            }
            _ => Err(self.unexpected("pattern")),
        }
    }

    /// `try { } catch (e: T) { } finally { }`
    fn parse_try(&mut self) -> ParseResult<Stmt> {
        let position = self.consume(&TokenKind::Try, "'try'")?.position;
        let body = self.parse_brace_block()?;
        let mut catches = Vec::new();
        while self.check(&TokenKind::Catch) {
            let catch_position = self.advance().position;
            let parenthesized = self.eat(&TokenKind::LeftParen);
            let name = self.consume_identifier("exception variable")?;
            let class = if self.eat(&TokenKind::Colon) {
                Some(self.consume_identifier("exception class")?)
            } else {
                None
            };
            if parenthesized {
                self.consume(&TokenKind::RightParen, "')' after catch clause")?;
            }
            let catch_body = self.parse_brace_block()?;
            catches.push(CatchClause {
                name,
                class,
                body: catch_body,
                position: catch_position,
            });
        }
        let finally = if self.eat(&TokenKind::Finally) {
            Some(self.parse_brace_block()?)
        } else {
            None
        };
        if catches.is_empty() && finally.is_none() {
            return Err(self.invalid("try requires a catch or finally block", position));
        }
        Ok(Stmt::new(
            StmtKind::Try {
                body,
                catches,
                finally,
            },
            position,
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{ExprKind, Pattern, Stmt, StmtKind};
    use crate::parser::parse_source;
    use crate::tokenizer::SyntaxLevel;

    fn is_call_to(stmt: &Stmt, name: &str) -> bool {
        match &stmt.kind {
            StmtKind::Expr(expr) => match &expr.kind {
                ExprKind::Call { callee, .. } => {
                    callee.as_variable().is_some_and(|n| n.as_str() == name)
                }
                _ => false,
            },
            _ => false,
        }
    }

    #[test]
    fn parses_generic_function_with_attribute() {
        let output = parse_source(
            "#[noinline]\nfn id<T>(x: T) -> T { return x; }",
            SyntaxLevel::Medium,
        );
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        match &output.program.statements[0].kind {
            StmtKind::Function(decl) => {
                assert!(decl.has_attribute("noinline"));
                assert_eq!(decl.generics.len(), 1);
            }
            other => panic!("expected function, found {other:?}"),
        }
    }

    #[test]
    fn parses_class_with_parents_fields_and_methods() {
        let output = parse_source(
            "class Dog : Animal, Named { name: string = \"rex\"; fn speak() { return self.name; } }",
            SyntaxLevel::Medium,
        );
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        match &output.program.statements[0].kind {
            StmtKind::Class(decl) => {
                assert_eq!(decl.parents.len(), 2);
                assert_eq!(decl.fields.len(), 1);
                assert_eq!(decl.methods.len(), 1);
            }
            other => panic!("expected class, found {other:?}"),
        }
    }

    #[test]
    fn parses_match_try_and_loops() {
        let source = r#"
            match x { 1 => println("one"), Color::Red => {}, n if n > 3 => {}, _ => {} }
            try { risky(); } catch (e: DivisionByZero) { } finally { done(); }
            for (let i = 0; i < 3; i++) { }
            for j in 0..=4 { }
        "#;
        let output = parse_source(source, SyntaxLevel::Medium);
        assert!(output.diagnostics.is_empty(), "{}", output.diagnostics);
        let statements = &output.program.statements;
        assert_eq!(statements.len(), 4);
        match &statements[0].kind {
            StmtKind::Match { arms, .. } => {
                assert_eq!(arms.len(), 4);
                assert!(is_call_to(&arms[0].body[0], "println"));
                assert!(matches!(arms[1].pattern, Pattern::EnumVariant { .. }));
                assert!(arms[2].guard.is_some());
                assert_eq!(arms[3].pattern, Pattern::Wildcard);
            }
            other => panic!("expected match, found {other:?}"),
        }
        assert!(matches!(statements[1].kind, StmtKind::Try { .. }));
        assert!(matches!(statements[2].kind, StmtKind::For { .. }));
        assert!(matches!(
            statements[3].kind,
            StmtKind::ForRange {
                inclusive: true,
                ..
            }
        ));
    }

    #[test]
    fn low_level_constructs_require_low() {
        let source = "struct P { x: int, y: int }\nlet p: *P = &new P { x: 1, y: 2 };\nloop { break; }";
        let low = parse_source(source, SyntaxLevel::Low);
        assert!(low.diagnostics.is_empty(), "{}", low.diagnostics);
        assert_eq!(low.program.statements.len(), 3);
        let medium = parse_source(source, SyntaxLevel::Medium);
        assert!(medium.diagnostics.error_count() >= 2);
    }
}
