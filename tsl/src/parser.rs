//! Recursive-descent frontend.
//!
//! The parser allocates AST nodes into the active compile region and reports
//! every top-level construct to the driver through [`ParserCallbacks`]. It
//! holds no state of its own beyond the token stream, which keeps it reusable
//! from any number of threads (each drives its own parse inside its own
//! region).

use crate::{
    ast::{
        self, BinaryOp, Expr, ExprId, FunctionDecl, FunctionId, GlobalDecl, GlobalId, ParamDecl, Span, Stmt, StmtId,
        StructDecl, StructId, TypeSpec, UnaryOp,
    },
    error::DiagnosticSink,
    lexer::Token,
    types::{ArgDirection, DataType},
};
use logos::Logos;
use smallvec::SmallVec;
use smol_str::SmolStr;

/// Services the driver provides to the parser; one call per syntactic
/// construct, all synchronous.
pub trait ParserCallbacks {
    fn push_function(&mut self, function: FunctionId, is_shader: bool);
    fn push_structure(&mut self, structure: StructId);
    fn push_global_parameter(&mut self, global: GlobalId);
    fn closure_touched(&mut self, name: &str);
    fn cache_data_type(&mut self, ty: TypeSpec);
    fn data_type_cache(&mut self) -> Option<TypeSpec>;
    fn claim_permanent_address(&mut self, s: &str) -> SmolStr;
}

struct ParseError {
    message: String,
    span: Span,
}

type PResult<T> = Result<T, ParseError>;

/// Parses `source`, allocating nodes into the innermost compile region and
/// reporting constructs to `callbacks`.
pub(crate) fn parse(source: &str, callbacks: &mut dyn ParserCallbacks) -> Result<(), DiagnosticSink> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);
    while let Some(token) = lexer.next() {
        let span = Span::new(lexer.span());
        if matches!(token, Token::Error) {
            let mut sink = DiagnosticSink::new();
            sink.error(format!("unrecognized token `{}`", lexer.slice()), Some(span));
            return Err(sink);
        }
        tokens.push((token, span));
    }

    let eof = Span::new(source.len()..source.len());
    let mut parser = Parser {
        tokens,
        pos: 0,
        eof,
        callbacks,
    };
    match parser.parse_module() {
        Ok(()) => Ok(()),
        Err(err) => {
            let mut sink = DiagnosticSink::new();
            sink.error(err.message, Some(err.span));
            Err(sink)
        }
    }
}

struct Parser<'input, 'cb> {
    tokens: Vec<(Token<'input>, Span)>,
    pos: usize,
    eof: Span,
    callbacks: &'cb mut dyn ParserCallbacks,
}

impl<'input, 'cb> Parser<'input, 'cb> {
    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Token stream helpers
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn peek(&self) -> Option<&Token<'input>> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek2(&self) -> Option<&Token<'input>> {
        self.tokens.get(self.pos + 1).map(|(t, _)| t)
    }

    fn peek_span(&self) -> Span {
        self.tokens.get(self.pos).map(|(_, s)| *s).unwrap_or(self.eof)
    }

    fn prev_span(&self) -> Span {
        if self.pos == 0 {
            self.eof
        } else {
            self.tokens[self.pos - 1].1
        }
    }

    fn advance(&mut self) -> Option<(Token<'input>, Span)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            span: self.peek_span(),
        }
    }

    fn expect(&mut self, token: Token, what: &str) -> PResult<Span> {
        if self.peek() == Some(&token) {
            let span = self.peek_span();
            self.pos += 1;
            Ok(span)
        } else {
            Err(self.error_here(format!("expected {}", what)))
        }
    }

    fn expect_ident(&mut self) -> PResult<(SmolStr, Span)> {
        match self.peek() {
            Some(Token::Ident(_)) => {
                let (token, span) = self.advance().unwrap();
                let name = self.callbacks.claim_permanent_address(token.as_str());
                Ok((name, span))
            }
            _ => Err(self.error_here("expected identifier")),
        }
    }

    fn alloc_expr(&mut self, expr: Expr, span: Span) -> ExprId {
        ast::with_region(|store| store.alloc_expr(expr, span))
    }

    fn alloc_stmt(&mut self, stmt: Stmt, span: Span) -> StmtId {
        ast::with_region(|store| store.alloc_stmt(stmt, span))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Types
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn base_type_of(token: &Token) -> Option<DataType> {
        match token {
            Token::Void => Some(DataType::Void),
            Token::Int => Some(DataType::Int),
            Token::Float => Some(DataType::Float),
            Token::Double => Some(DataType::Double),
            Token::Bool => Some(DataType::Bool),
            Token::Float3 => Some(DataType::Float3),
            Token::Float4 => Some(DataType::Float4),
            Token::Matrix => Some(DataType::Matrix),
            Token::Closure => Some(DataType::Closure),
            _ => None,
        }
    }

    fn parse_type_spec(&mut self) -> PResult<(TypeSpec, Span)> {
        if let Some(ty) = self.peek().and_then(Self::base_type_of) {
            let span = self.peek_span();
            self.pos += 1;
            return Ok((TypeSpec::Base(ty), span));
        }
        if matches!(self.peek(), Some(Token::Ident(_))) {
            let (name, span) = self.expect_ident()?;
            return Ok((TypeSpec::Named(name), span));
        }
        Err(self.error_here("expected type"))
    }

    /// Whether the upcoming tokens start a declaration (`type ident …`).
    fn at_declaration(&self) -> bool {
        let first_is_type = match self.peek() {
            Some(t) => Self::base_type_of(t).is_some() || matches!(t, Token::Ident(_)),
            None => false,
        };
        first_is_type && matches!(self.peek2(), Some(Token::Ident(_)))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Top level
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn parse_module(&mut self) -> PResult<()> {
        while !self.at_end() {
            match self.peek() {
                Some(Token::Struct) => self.parse_struct()?,
                Some(Token::Shader) => self.parse_shader()?,
                _ => self.parse_function_or_global()?,
            }
        }
        Ok(())
    }

    fn parse_struct(&mut self) -> PResult<()> {
        let start = self.expect(Token::Struct, "`struct`")?;
        let (name, _) = self.expect_ident()?;
        self.expect(Token::LBrace, "`{`")?;
        let mut fields = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error_here("unterminated struct declaration"));
            }
            let (ty, _) = self.parse_type_spec()?;
            let (field_name, _) = self.expect_ident()?;
            self.expect(Token::Semicolon, "`;`")?;
            fields.push((field_name, ty));
        }
        self.eat(&Token::Semicolon);
        let span = start.merge(self.prev_span());
        let id = ast::with_region(|store| store.alloc_struct(StructDecl { name, fields, span }));
        self.callbacks.push_structure(id);
        Ok(())
    }

    fn parse_shader(&mut self) -> PResult<()> {
        let start = self.expect(Token::Shader, "`shader`")?;
        let (name, _) = self.expect_ident()?;
        self.expect(Token::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                let direction = if self.eat(&Token::Out) {
                    ArgDirection::Out
                } else {
                    self.eat(&Token::In);
                    ArgDirection::In
                };
                let (ty, _) = self.parse_type_spec()?;
                let (param_name, _) = self.expect_ident()?;
                let default = if self.eat(&Token::Equal) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                params.push(ParamDecl {
                    name: param_name,
                    ty,
                    direction,
                    default,
                });
                if !self.eat(&Token::Comma) {
                    self.expect(Token::RParen, "`)`")?;
                    break;
                }
            }
        }
        let body = self.parse_block()?;
        let span = start.merge(self.prev_span());
        let id = ast::with_region(|store| {
            store.alloc_function(FunctionDecl {
                name,
                ret: TypeSpec::Base(DataType::Void),
                params,
                body,
                is_shader: true,
                span,
            })
        });
        self.callbacks.push_function(id, true);
        Ok(())
    }

    fn parse_function_or_global(&mut self) -> PResult<()> {
        let (ty, ty_span) = self.parse_type_spec()?;
        let (name, _) = self.expect_ident()?;
        if self.eat(&Token::LParen) {
            // plain function; parameters are `in` by value, no qualifiers
            let mut params = Vec::new();
            if !self.eat(&Token::RParen) {
                loop {
                    let (param_ty, _) = self.parse_type_spec()?;
                    let (param_name, _) = self.expect_ident()?;
                    params.push(ParamDecl {
                        name: param_name,
                        ty: param_ty,
                        direction: ArgDirection::In,
                        default: None,
                    });
                    if !self.eat(&Token::Comma) {
                        self.expect(Token::RParen, "`)`")?;
                        break;
                    }
                }
            }
            let body = self.parse_block()?;
            let span = ty_span.merge(self.prev_span());
            let id = ast::with_region(|store| {
                store.alloc_function(FunctionDecl {
                    name,
                    ret: ty,
                    params,
                    body,
                    is_shader: false,
                    span,
                })
            });
            self.callbacks.push_function(id, false);
            Ok(())
        } else {
            // one or more global parameters sharing a cached type
            self.callbacks.cache_data_type(ty);
            let mut pending_name = Some(name);
            loop {
                let decl_name = match pending_name.take() {
                    Some(n) => n,
                    None => self.expect_ident()?.0,
                };
                let init = if self.eat(&Token::Equal) {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                let decl_ty = self
                    .callbacks
                    .data_type_cache()
                    .ok_or_else(|| self.error_here("missing cached declaration type"))?;
                let span = ty_span.merge(self.prev_span());
                let id = ast::with_region(|store| {
                    store.alloc_global(GlobalDecl {
                        name: decl_name,
                        ty: decl_ty,
                        init,
                        span,
                    })
                });
                self.callbacks.push_global_parameter(id);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Semicolon, "`;`")?;
            Ok(())
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Statements
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn parse_block(&mut self) -> PResult<StmtId> {
        let start = self.expect(Token::LBrace, "`{`")?;
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.at_end() {
                return Err(self.error_here("unterminated block"));
            }
            self.parse_stmt_into(&mut stmts)?;
        }
        let span = start.merge(self.prev_span());
        Ok(self.alloc_stmt(Stmt::Block(stmts), span))
    }

    /// Parses one statement; a multi-declarator statement becomes a block.
    fn parse_stmt(&mut self) -> PResult<StmtId> {
        let start = self.peek_span();
        let mut stmts = Vec::new();
        self.parse_stmt_into(&mut stmts)?;
        if stmts.len() == 1 {
            Ok(stmts[0])
        } else {
            let span = start.merge(self.prev_span());
            Ok(self.alloc_stmt(Stmt::Block(stmts), span))
        }
    }

    fn parse_stmt_into(&mut self, out: &mut Vec<StmtId>) -> PResult<()> {
        match self.peek() {
            Some(Token::LBrace) => {
                let block = self.parse_block()?;
                out.push(block);
            }
            Some(Token::If) => {
                let stmt = self.parse_if()?;
                out.push(stmt);
            }
            Some(Token::While) => {
                let stmt = self.parse_while()?;
                out.push(stmt);
            }
            Some(Token::For) => {
                let stmt = self.parse_for()?;
                out.push(stmt);
            }
            Some(Token::Return) => {
                let start = self.peek_span();
                self.pos += 1;
                let value = if self.eat(&Token::Semicolon) {
                    None
                } else {
                    let value = self.parse_expr()?;
                    self.expect(Token::Semicolon, "`;`")?;
                    Some(value)
                };
                let span = start.merge(self.prev_span());
                out.push(self.alloc_stmt(Stmt::Return(value), span));
            }
            Some(Token::Break) => {
                let span = self.peek_span();
                self.pos += 1;
                self.expect(Token::Semicolon, "`;`")?;
                out.push(self.alloc_stmt(Stmt::Break, span));
            }
            Some(Token::Continue) => {
                let span = self.peek_span();
                self.pos += 1;
                self.expect(Token::Semicolon, "`;`")?;
                out.push(self.alloc_stmt(Stmt::Continue, span));
            }
            _ if self.at_declaration() => {
                self.parse_decl_into(out)?;
                self.expect(Token::Semicolon, "`;`")?;
            }
            Some(_) => {
                let stmt = self.parse_assign_or_expr()?;
                self.expect(Token::Semicolon, "`;`")?;
                out.push(stmt);
            }
            None => return Err(self.error_here("expected statement")),
        }
        Ok(())
    }

    fn parse_decl_into(&mut self, out: &mut Vec<StmtId>) -> PResult<()> {
        let (ty, ty_span) = self.parse_type_spec()?;
        self.callbacks.cache_data_type(ty);
        loop {
            let (name, _) = self.expect_ident()?;
            let init = if self.eat(&Token::Equal) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            let decl_ty = self
                .callbacks
                .data_type_cache()
                .ok_or_else(|| self.error_here("missing cached declaration type"))?;
            let span = ty_span.merge(self.prev_span());
            out.push(self.alloc_stmt(
                Stmt::Decl {
                    name,
                    ty: decl_ty,
                    init,
                },
                span,
            ));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(())
    }

    /// An assignment or a bare expression, without the trailing semicolon.
    fn parse_assign_or_expr(&mut self) -> PResult<StmtId> {
        let start = self.peek_span();
        let expr = self.parse_expr()?;
        if self.eat(&Token::Equal) {
            let value = self.parse_expr()?;
            let span = start.merge(self.prev_span());
            Ok(self.alloc_stmt(Stmt::Assign { place: expr, value }, span))
        } else {
            let span = start.merge(self.prev_span());
            Ok(self.alloc_stmt(Stmt::Expr(expr), span))
        }
    }

    /// A single declaration, assignment or expression, as allowed in `for`
    /// headers.
    fn parse_simple_stmt(&mut self) -> PResult<StmtId> {
        if self.at_declaration() {
            let start = self.peek_span();
            let (ty, _) = self.parse_type_spec()?;
            let (name, _) = self.expect_ident()?;
            let init = if self.eat(&Token::Equal) {
                Some(self.parse_expr()?)
            } else {
                None
            };
            let span = start.merge(self.prev_span());
            Ok(self.alloc_stmt(Stmt::Decl { name, ty, init }, span))
        } else {
            self.parse_assign_or_expr()
        }
    }

    fn parse_if(&mut self) -> PResult<StmtId> {
        let start = self.expect(Token::If, "`if`")?;
        self.expect(Token::LParen, "`(`")?;
        let cond = self.parse_expr()?;
        self.expect(Token::RParen, "`)`")?;
        let then_branch = self.parse_stmt()?;
        let else_branch = if self.eat(&Token::Else) {
            Some(self.parse_stmt()?)
        } else {
            None
        };
        let span = start.merge(self.prev_span());
        Ok(self.alloc_stmt(
            Stmt::If {
                cond,
                then_branch,
                else_branch,
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> PResult<StmtId> {
        let start = self.expect(Token::While, "`while`")?;
        self.expect(Token::LParen, "`(`")?;
        let cond = self.parse_expr()?;
        self.expect(Token::RParen, "`)`")?;
        let body = self.parse_stmt()?;
        let span = start.merge(self.prev_span());
        Ok(self.alloc_stmt(Stmt::While { cond, body }, span))
    }

    fn parse_for(&mut self) -> PResult<StmtId> {
        let start = self.expect(Token::For, "`for`")?;
        self.expect(Token::LParen, "`(`")?;
        let init = if self.peek() == Some(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_simple_stmt()?)
        };
        self.expect(Token::Semicolon, "`;`")?;
        let cond = if self.peek() == Some(&Token::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(Token::Semicolon, "`;`")?;
        let step = if self.peek() == Some(&Token::RParen) {
            None
        } else {
            Some(self.parse_simple_stmt()?)
        };
        self.expect(Token::RParen, "`)`")?;
        let body = self.parse_stmt()?;
        let span = start.merge(self.prev_span());
        Ok(self.alloc_stmt(
            Stmt::For {
                init,
                cond,
                step,
                body,
            },
            span,
        ))
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    // Expressions
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn parse_expr(&mut self) -> PResult<ExprId> {
        self.parse_or()
    }

    fn parse_binary<F>(&mut self, mut next: F, table: &[(Token<'static>, BinaryOp)]) -> PResult<ExprId>
    where
        F: FnMut(&mut Self) -> PResult<ExprId>,
    {
        let start = self.peek_span();
        let mut left = next(self)?;
        'outer: loop {
            for (token, op) in table {
                if self.eat(token) {
                    let right = next(self)?;
                    let span = start.merge(self.prev_span());
                    left = self.alloc_expr(
                        Expr::Binary {
                            op: *op,
                            left,
                            right,
                        },
                        span,
                    );
                    continue 'outer;
                }
            }
            break;
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> PResult<ExprId> {
        self.parse_binary(Self::parse_and, &[(Token::Or, BinaryOp::Or)])
    }

    fn parse_and(&mut self) -> PResult<ExprId> {
        self.parse_binary(Self::parse_equality, &[(Token::And, BinaryOp::And)])
    }

    fn parse_equality(&mut self) -> PResult<ExprId> {
        self.parse_binary(
            Self::parse_relational,
            &[(Token::DEqual, BinaryOp::Eq), (Token::BangEqual, BinaryOp::Ne)],
        )
    }

    fn parse_relational(&mut self) -> PResult<ExprId> {
        self.parse_binary(
            Self::parse_additive,
            &[
                (Token::LEqual, BinaryOp::Le),
                (Token::REqual, BinaryOp::Ge),
                (Token::LAngle, BinaryOp::Lt),
                (Token::RAngle, BinaryOp::Gt),
            ],
        )
    }

    fn parse_additive(&mut self) -> PResult<ExprId> {
        self.parse_binary(
            Self::parse_multiplicative,
            &[(Token::Plus, BinaryOp::Add), (Token::Dash, BinaryOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> PResult<ExprId> {
        self.parse_binary(
            Self::parse_unary,
            &[
                (Token::Star, BinaryOp::Mul),
                (Token::Slash, BinaryOp::Div),
                (Token::Percent, BinaryOp::Rem),
            ],
        )
    }

    fn parse_unary(&mut self) -> PResult<ExprId> {
        let start = self.peek_span();
        if self.eat(&Token::Dash) {
            let operand = self.parse_unary()?;
            let span = start.merge(self.prev_span());
            return Ok(self.alloc_expr(
                Expr::Unary {
                    op: UnaryOp::Neg,
                    operand,
                },
                span,
            ));
        }
        if self.eat(&Token::Bang) {
            let operand = self.parse_unary()?;
            let span = start.merge(self.prev_span());
            return Ok(self.alloc_expr(
                Expr::Unary {
                    op: UnaryOp::Not,
                    operand,
                },
                span,
            ));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> PResult<ExprId> {
        let start = self.peek_span();
        let mut expr = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            let (field, _) = self.expect_ident()?;
            let span = start.merge(self.prev_span());
            expr = self.alloc_expr(Expr::Field { base: expr, field }, span);
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> PResult<SmallVec<[ExprId; 4]>> {
        let mut args = SmallVec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.eat(&Token::Comma) {
                self.expect(Token::RParen, "`)`")?;
                break;
            }
        }
        Ok(args)
    }

    fn parse_primary(&mut self) -> PResult<ExprId> {
        let start = self.peek_span();
        match self.peek().cloned() {
            Some(Token::IntLiteral(value)) => {
                self.pos += 1;
                Ok(self.alloc_expr(Expr::IntConst(value), start))
            }
            Some(Token::FloatLiteral(value)) => {
                self.pos += 1;
                Ok(self.alloc_expr(Expr::FloatConst(value), start))
            }
            Some(Token::BoolLiteral(value)) => {
                self.pos += 1;
                Ok(self.alloc_expr(Expr::BoolConst(value), start))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(expr)
            }
            Some(Token::MakeClosure) => {
                self.pos += 1;
                self.expect(Token::LAngle, "`<`")?;
                let (closure, _) = self.expect_ident()?;
                self.expect(Token::RAngle, "`>`")?;
                self.expect(Token::LParen, "`(`")?;
                let args = self.parse_args()?;
                self.callbacks.closure_touched(&closure);
                let span = start.merge(self.prev_span());
                Ok(self.alloc_expr(Expr::MakeClosure { closure, args }, span))
            }
            Some(ref token) if matches!(token, Token::Float3 | Token::Float4 | Token::Matrix) => {
                let ty = Self::base_type_of(token).unwrap();
                self.pos += 1;
                self.expect(Token::LParen, "`(`")?;
                let args = self.parse_args()?;
                let span = start.merge(self.prev_span());
                Ok(self.alloc_expr(Expr::Construct { ty, args }, span))
            }
            Some(Token::Ident(_)) => {
                let (name, span) = self.expect_ident()?;
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    let span = start.merge(self.prev_span());
                    Ok(self.alloc_expr(Expr::Call { callee: name, args }, span))
                } else {
                    Ok(self.alloc_expr(Expr::Ident(name), span))
                }
            }
            _ => Err(self.error_here("expected expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::CompileRegion;
    use std::collections::HashSet;

    #[derive(Default)]
    struct RecordingCallbacks {
        functions: Vec<(FunctionId, bool)>,
        structures: Vec<StructId>,
        globals: Vec<GlobalId>,
        closures: Vec<String>,
        type_cache: Option<TypeSpec>,
        interned: HashSet<SmolStr>,
    }

    impl ParserCallbacks for RecordingCallbacks {
        fn push_function(&mut self, function: FunctionId, is_shader: bool) {
            self.functions.push((function, is_shader));
        }

        fn push_structure(&mut self, structure: StructId) {
            self.structures.push(structure);
        }

        fn push_global_parameter(&mut self, global: GlobalId) {
            self.globals.push(global);
        }

        fn closure_touched(&mut self, name: &str) {
            self.closures.push(name.to_owned());
        }

        fn cache_data_type(&mut self, ty: TypeSpec) {
            self.type_cache = Some(ty);
        }

        fn data_type_cache(&mut self) -> Option<TypeSpec> {
            self.type_cache.clone()
        }

        fn claim_permanent_address(&mut self, s: &str) -> SmolStr {
            if let Some(existing) = self.interned.get(s) {
                existing.clone()
            } else {
                let s = SmolStr::new(s);
                self.interned.insert(s.clone());
                s
            }
        }
    }

    #[test]
    fn parses_constant_shader() {
        let region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        parse("shader entry(out float o){ o = 3.5; }", &mut cb).unwrap();
        assert_eq!(cb.functions.len(), 1);
        assert!(cb.functions[0].1);
        let store = region.detach();
        let func = &store.functions[cb.functions[0].0];
        assert_eq!(func.name, "entry");
        assert_eq!(func.params.len(), 1);
        assert_eq!(func.params[0].direction, ArgDirection::Out);
        assert_eq!(func.params[0].ty, TypeSpec::Base(DataType::Float));
    }

    #[test]
    fn records_touched_closures() {
        let _region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        parse(
            "shader entry(out closure c){ c = make_closure<Lambert>(float3(0.5,0.5,0.5)); }",
            &mut cb,
        )
        .unwrap();
        assert_eq!(cb.closures, vec!["Lambert".to_owned()]);
    }

    #[test]
    fn multi_declarator_uses_type_cache() {
        let region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        parse("shader entry(out float o){ float a = 1.0, b = 2.0; o = a + b; }", &mut cb).unwrap();
        let store = region.detach();
        // two Decl statements were produced with the same cached type
        let decls: Vec<_> = store
            .stmts
            .iter()
            .filter(|s| matches!(s, Stmt::Decl { .. }))
            .collect();
        assert_eq!(decls.len(), 2);
    }

    #[test]
    fn parses_structures_functions_and_globals() {
        let _region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        parse(
            r#"
            struct Surface { float3 normal; float roughness; };
            float gain = 2.0;
            float twice(float x) { return x * gain; }
            shader entry(in float x, out float y) { y = twice(x); }
            "#,
            &mut cb,
        )
        .unwrap();
        assert_eq!(cb.structures.len(), 1);
        assert_eq!(cb.globals.len(), 1);
        assert_eq!(cb.functions.len(), 2);
        assert!(!cb.functions[0].1);
        assert!(cb.functions[1].1);
    }

    #[test]
    fn rejects_malformed_source() {
        let _region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        assert!(parse("shader entry(out float o){ o = ; }", &mut cb).is_err());
        assert!(parse("shader entry(out float o){", &mut cb).is_err());
    }

    #[test]
    fn control_flow_statements() {
        let region = CompileRegion::enter();
        let mut cb = RecordingCallbacks::default();
        parse(
            r#"
            shader entry(in int n, out float o) {
                o = 0.0;
                for (int i = 0; i < n; i = i + 1) {
                    if (i % 2 == 0) { o = o + 1.0; } else { continue; }
                }
                while (o > 100.0) { o = o - 1.0; break; }
            }
            "#,
            &mut cb,
        )
        .unwrap();
        let store = region.detach();
        assert!(store.stmts.iter().any(|s| matches!(s, Stmt::For { .. })));
        assert!(store.stmts.iter().any(|s| matches!(s, Stmt::While { .. })));
        assert!(store.stmts.iter().any(|s| matches!(s, Stmt::Break)));
    }
}
