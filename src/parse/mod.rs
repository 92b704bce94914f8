// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Recursive-descent parsing.
//!
//! Consumes one module's tokens and appends to the shared syntax tables.
//! `use` declarations are resolved eagerly: the imported module is parsed
//! (once) before the importer continues, so imported declarations always
//! precede their users in the tables.

use log::debug;

use crate::Compilation;
use crate::arena::{Arena, Span};
use crate::diag::{Diagnostic, Pos};
use crate::lex::{Lexer, Token, TokenKind, unescape_string};
use crate::registry::resolve_import;
use crate::syntax::{
    BinaryOp, CallData, Constant, Expr, ExprId, ExprKind, Function, FunctionFlags, ModuleId, NONE,
    Param, UnaryOp,
};
use crate::types::TypeId;

/// Parses `module` (and, transitively, everything it imports).
pub(crate) fn parse_module(
    arena: &Arena,
    comp: &mut Compilation,
    module: ModuleId,
) -> Result<(), Diagnostic> {
    if comp.modules[module as usize].parsed {
        return Ok(());
    }
    comp.modules[module as usize].parsed = true;

    let info = comp.modules[module as usize];
    let path = arena.text(info.path);
    let source = arena.slice(info.content);
    debug!("parsing {path}");

    let mut parser = Parser {
        arena,
        comp,
        module,
        path,
        content_ptr: info.content.ptr,
        lexer: Lexer::new(path, source),
        token: Token {
            kind: TokenKind::Eof,
            pos: Pos::START,
            start: 0,
            end: 0,
            int: 0,
            suffix: None,
        },
        no_struct_literal: false,
    };
    parser.token = parser.lexer.next_token()?;
    parser.items()
}

struct Parser<'a, 'c> {
    arena: &'a Arena,
    comp: &'c mut Compilation,
    module: ModuleId,
    path: &'a str,
    content_ptr: u32,
    lexer: Lexer<'a>,
    token: Token,
    no_struct_literal: bool,
}

impl<'a> Parser<'a, '_> {
    fn error(&self, pos: Pos, message: &str) -> Diagnostic {
        Diagnostic::at(self.path, pos, message)
    }

    fn bump(&mut self) -> Result<Token, Diagnostic> {
        let token = self.token;
        self.token = self.lexer.next_token()?;
        Ok(token)
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.token.kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> Result<bool, Diagnostic> {
        if self.at(kind) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: TokenKind, message: &str) -> Result<Token, Diagnostic> {
        if self.at(kind) {
            self.bump()
        } else {
            Err(self.error(self.token.pos, message))
        }
    }

    /// The token after the current one, for two-token decisions.
    fn peek_second(&self) -> Result<Token, Diagnostic> {
        self.lexer.clone().next_token()
    }

    fn token_text(&self, token: Token) -> &'a [u8] {
        let info = self.comp.modules[self.module as usize];
        &self.arena.slice(info.content)[token.start as usize..token.end as usize]
    }

    /// An arena span covering the token's source text.
    fn token_span(&self, token: Token) -> Span {
        Span {
            ptr: self.content_ptr + token.start,
            len: token.end - token.start,
        }
    }

    fn add_expr(&mut self, kind: ExprKind, pos: Pos, a: u32, b: u32, c: u32) -> Result<ExprId, Diagnostic> {
        self.comp
            .ast
            .add_expr(Expr {
                kind,
                a,
                b,
                c,
                aux: NONE,
                ty: TypeId::INVALID,
                pos,
            })
            .map_err(|d| d.locate(self.path, pos))
    }

    // --- items ---

    fn items(&mut self) -> Result<(), Diagnostic> {
        while !self.at(TokenKind::Eof) {
            match self.token.kind {
                TokenKind::KwUse => self.use_decl()?,
                TokenKind::KwType => self.type_alias()?,
                TokenKind::KwConst => self.const_decl()?,
                TokenKind::KwFn => {
                    self.bump()?;
                    self.function(FunctionFlags::empty())?;
                }
                _ => {
                    return Err(self.error(self.token.pos, "expected declaration"));
                }
            }
        }
        Ok(())
    }

    fn use_decl(&mut self) -> Result<(), Diagnostic> {
        self.bump()?;
        let token = self.expect(TokenKind::Str, "use requires a module path string")?;
        let import = unescape_string(self.token_text(token));
        let import = String::from_utf8(import)
            .map_err(|_| self.error(token.pos, "use requires a module path string"))?;
        self.expect(TokenKind::Semi, "expected ';' after use")?;

        let resolved = resolve_import(self.path, &import);
        let Some(target) = self.comp.find_module(self.arena, &resolved) else {
            return Err(self.error(token.pos, "module import not found"));
        };
        parse_module(self.arena, self.comp, target)
    }

    fn check_duplicate_constant(&self, name: Span, pos: Pos) -> Result<(), Diagnostic> {
        let text = self.arena.slice(name);
        for constant in &self.comp.ast.constants {
            if self.arena.slice(constant.name) == text {
                return Err(self.error(pos, "duplicate constant declaration"));
            }
        }
        Ok(())
    }

    fn type_alias(&mut self) -> Result<(), Diagnostic> {
        self.bump()?;
        let name_token = self.expect(TokenKind::Ident, "expected type alias name")?;
        let name = self.token_span(name_token);
        self.check_duplicate_constant(name, name_token.pos)?;
        self.expect(TokenKind::Assign, "expected '=' in type alias")?;
        let init = self.expr()?;
        self.expect(TokenKind::Semi, "expected ';' after type alias")?;
        self.comp
            .ast
            .add_constant(Constant {
                name,
                module: self.module,
                pos: name_token.pos,
                ty_expr: NONE,
                ty: TypeId::INVALID,
                init,
                value: None,
            })
            .map_err(|d| d.locate(self.path, name_token.pos))?;
        Ok(())
    }

    fn const_decl(&mut self) -> Result<(), Diagnostic> {
        self.bump()?;
        if self.eat(TokenKind::KwFn)? {
            self.function(FunctionFlags::CONST_FN)?;
            return Ok(());
        }
        let name_token = self.expect(TokenKind::Ident, "expected constant name")?;
        let name = self.token_span(name_token);
        self.check_duplicate_constant(name, name_token.pos)?;
        self.expect(TokenKind::Colon, "expected ':' after constant name")?;
        let ty_expr = self.expr()?;
        self.expect(TokenKind::Assign, "expected '=' in constant declaration")?;
        let init = self.expr()?;
        self.expect(TokenKind::Semi, "expected ';' after constant declaration")?;
        self.comp
            .ast
            .add_constant(Constant {
                name,
                module: self.module,
                pos: name_token.pos,
                ty_expr,
                ty: TypeId::INVALID,
                init,
                value: None,
            })
            .map_err(|d| d.locate(self.path, name_token.pos))?;
        Ok(())
    }

    /// Parses a function declaration after its introducing keyword(s) and
    /// appends it, returning the function index.
    fn function(&mut self, mut flags: FunctionFlags) -> Result<u32, Diagnostic> {
        let name_token = self.expect(TokenKind::Ident, "expected function name")?;
        let name = self.token_span(name_token);
        let text = self.arena.slice(name).to_vec();
        for function in &self.comp.ast.functions {
            if !function.flags.contains(FunctionFlags::ANONYMOUS)
                && self.arena.slice(function.name) == text
            {
                return Err(self.error(name_token.pos, "duplicate function declaration"));
            }
        }

        let params = self.params()?;
        if params.iter().any(|param| param.is_const) {
            flags |= FunctionFlags::HAS_CONST_PARAMS;
        }
        let ret_expr = if self.eat(TokenKind::Arrow)? {
            Some(self.expr()?)
        } else {
            None
        };
        let body = self.block()?;
        let function = Function {
            name,
            module: self.module,
            pos: name_token.pos,
            params,
            ret_expr,
            ret: TypeId::INVALID,
            body,
            flags,
            local_count: 0,
            locals: Vec::new(),
            origin: None,
        };
        self.comp
            .ast
            .add_function(function)
            .map_err(|d| d.locate(self.path, name_token.pos))
    }

    fn params(&mut self) -> Result<Vec<Param>, Diagnostic> {
        self.expect(TokenKind::LParen, "expected '(' before parameters")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.at(TokenKind::RParen) {
            let is_const = self.eat(TokenKind::KwConst)?;
            let name_token = self.expect(TokenKind::Ident, "expected parameter name")?;
            let name = self.token_span(name_token);
            if params
                .iter()
                .any(|param| self.arena.slice(param.name) == self.arena.slice(name))
            {
                return Err(self.error(name_token.pos, "duplicate parameter name"));
            }
            self.expect(TokenKind::Colon, "expected ':' after parameter name")?;
            let ty_expr = self.expr()?;
            params.push(Param {
                name,
                ty_expr,
                is_const,
                ty: TypeId::INVALID,
            });
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after parameters")?;
        Ok(params)
    }

    // --- statements ---

    fn block(&mut self) -> Result<ExprId, Diagnostic> {
        let open = self.expect(TokenKind::LBrace, "expected '{'")?;
        let mut items = Vec::new();
        let mut has_tail = false;
        while !self.at(TokenKind::RBrace) {
            if self.at(TokenKind::Eof) {
                return Err(self.error(open.pos, "unterminated block"));
            }
            if self.at(TokenKind::KwLet) {
                items.push(self.let_stmt()?);
                continue;
            }
            let expr = self.expr()?;
            if self.eat(TokenKind::Semi)? {
                items.push(expr);
                continue;
            }
            if self.at(TokenKind::RBrace) {
                items.push(expr);
                has_tail = true;
                break;
            }
            return Err(self.error(self.token.pos, "expected ';' after expression"));
        }
        self.expect(TokenKind::RBrace, "expected '}'")?;
        let range = self
            .comp
            .ast
            .add_extra(&items)
            .map_err(|d| d.locate(self.path, open.pos))?;
        self.add_expr(
            ExprKind::Block,
            open.pos,
            range.start,
            range.len,
            u32::from(has_tail),
        )
    }

    fn let_stmt(&mut self) -> Result<ExprId, Diagnostic> {
        let let_token = self.bump()?;
        let mutable = self.eat(TokenKind::KwMut)?;
        let name_token = self.expect(TokenKind::Ident, "expected binding name")?;
        let name = self.token_span(name_token);
        let ty_expr = if self.eat(TokenKind::Colon)? {
            self.expr()?
        } else {
            NONE
        };
        self.expect(TokenKind::Assign, "expected '=' in let binding")?;
        let init = self.expr()?;
        self.expect(TokenKind::Semi, "expected ';' after let binding")?;
        // Fourth word reserved for the validator's local slot.
        let range = self
            .comp
            .ast
            .add_extra(&[u32::from(mutable), ty_expr, init, NONE])
            .map_err(|d| d.locate(self.path, let_token.pos))?;
        self.add_expr(ExprKind::Let, let_token.pos, name.ptr, name.len, range.start)
    }

    // --- expressions, lowest to highest precedence ---

    fn expr(&mut self) -> Result<ExprId, Diagnostic> {
        match self.token.kind {
            TokenKind::KwBreak => {
                let token = self.bump()?;
                let value = if self.starts_expr() {
                    self.expr()?
                } else {
                    NONE
                };
                self.add_expr(ExprKind::Break, token.pos, value, 0, 0)
            }
            TokenKind::KwContinue => {
                let token = self.bump()?;
                self.add_expr(ExprKind::Continue, token.pos, 0, 0, 0)
            }
            TokenKind::KwReturn => {
                let token = self.bump()?;
                let value = if self.starts_expr() {
                    self.expr()?
                } else {
                    NONE
                };
                self.add_expr(ExprKind::Return, token.pos, value, 0, 0)
            }
            _ => self.assign_expr(),
        }
    }

    fn starts_expr(&self) -> bool {
        !matches!(
            self.token.kind,
            TokenKind::Semi
                | TokenKind::RBrace
                | TokenKind::RParen
                | TokenKind::RBracket
                | TokenKind::Comma
                | TokenKind::Eof
        )
    }

    fn assign_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let lhs = self.or_expr()?;
        if self.at(TokenKind::Assign) {
            let token = self.bump()?;
            let rhs = self.assign_expr()?;
            return self.add_expr(ExprKind::Assign, token.pos, lhs, rhs, 0);
        }
        Ok(lhs)
    }

    fn binary(
        &mut self,
        pos: Pos,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<ExprId, Diagnostic> {
        self.add_expr(ExprKind::Binary, pos, u32::from(u8::from(op)), lhs, rhs)
    }

    fn or_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.and_expr()?;
        while self.at(TokenKind::OrOr) {
            let token = self.bump()?;
            let rhs = self.and_expr()?;
            lhs = self.binary(token.pos, BinaryOp::Or, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.cmp_expr()?;
        while self.at(TokenKind::AndAnd) {
            let token = self.bump()?;
            let rhs = self.cmp_expr()?;
            lhs = self.binary(token.pos, BinaryOp::And, lhs, rhs)?;
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.bit_expr()?;
        loop {
            let op = match self.token.kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::Ne => BinaryOp::Ne,
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => return Ok(lhs),
            };
            let token = self.bump()?;
            let rhs = self.bit_expr()?;
            lhs = self.binary(token.pos, op, lhs, rhs)?;
        }
    }

    fn bit_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.shift_expr()?;
        loop {
            let op = match self.token.kind {
                TokenKind::Pipe => BinaryOp::BitOr,
                TokenKind::Caret => BinaryOp::BitXor,
                TokenKind::Amp => BinaryOp::BitAnd,
                _ => return Ok(lhs),
            };
            let token = self.bump()?;
            let rhs = self.shift_expr()?;
            lhs = self.binary(token.pos, op, lhs, rhs)?;
        }
    }

    fn shift_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.add_expr_level()?;
        loop {
            let op = match self.token.kind {
                TokenKind::Shl => BinaryOp::Shl,
                TokenKind::Shr => BinaryOp::Shr,
                _ => return Ok(lhs),
            };
            let token = self.bump()?;
            let rhs = self.add_expr_level()?;
            lhs = self.binary(token.pos, op, lhs, rhs)?;
        }
    }

    fn add_expr_level(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.token.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            let token = self.bump()?;
            let rhs = self.mul_expr()?;
            lhs = self.binary(token.pos, op, lhs, rhs)?;
        }
    }

    fn mul_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.token.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Rem,
                _ => return Ok(lhs),
            };
            let token = self.bump()?;
            let rhs = self.unary_expr()?;
            lhs = self.binary(token.pos, op, lhs, rhs)?;
        }
    }

    fn unary_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let op = match self.token.kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.cast_expr(),
        };
        let token = self.bump()?;
        let operand = self.unary_expr()?;
        self.add_expr(
            ExprKind::Unary,
            token.pos,
            u32::from(u8::from(op)),
            operand,
            0,
        )
    }

    fn cast_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut operand = self.postfix_expr()?;
        while self.at(TokenKind::KwAs) {
            let token = self.bump()?;
            let ty = self.postfix_expr()?;
            operand = self.add_expr(ExprKind::Cast, token.pos, operand, ty, 0)?;
        }
        Ok(operand)
    }

    fn postfix_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let mut expr = self.primary_expr()?;
        loop {
            match self.token.kind {
                TokenKind::LParen => {
                    let token = self.bump()?;
                    let mut args = Vec::new();
                    while !self.at(TokenKind::RParen) {
                        args.push(self.expr()?);
                        if !self.eat(TokenKind::Comma)? {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "expected ')' after arguments")?;
                    self.check_inline_wasm(expr, &args, token.pos)?;
                    let range = self
                        .comp
                        .ast
                        .add_extra(&args)
                        .map_err(|d| d.locate(self.path, token.pos))?;
                    let call = self
                        .comp
                        .ast
                        .add_call(CallData {
                            args: range,
                            resolved: None,
                            const_mask: 0,
                        })
                        .map_err(|d| d.locate(self.path, token.pos))?;
                    expr = self.add_expr(ExprKind::Call, token.pos, expr, call, 0)?;
                }
                TokenKind::LBracket => {
                    let token = self.bump()?;
                    let index = self.expr()?;
                    self.expect(TokenKind::RBracket, "expected ']' after index")?;
                    expr = self.add_expr(ExprKind::Index, token.pos, expr, index, 0)?;
                }
                TokenKind::Dot => {
                    let token = self.bump()?;
                    let field = match self.token.kind {
                        TokenKind::Ident | TokenKind::Int => self.bump()?,
                        _ => {
                            return Err(self.error(self.token.pos, "expected field name"));
                        }
                    };
                    let name = self.token_span(field);
                    expr = self.add_expr(ExprKind::Field, token.pos, expr, name.ptr, name.len)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    /// `inline_wasm` arguments are checked syntactically at the call site.
    fn check_inline_wasm(
        &self,
        callee: ExprId,
        args: &[ExprId],
        pos: Pos,
    ) -> Result<(), Diagnostic> {
        let expr = self.comp.ast.expr(callee);
        if expr.kind != ExprKind::Ident {
            return Ok(());
        }
        let name = self.arena.slice(Span {
            ptr: expr.a,
            len: expr.b,
        });
        if name != b"inline_wasm" {
            return Ok(());
        }
        if args.len() == 1 && self.comp.ast.expr(args[0]).kind == ExprKind::ArrayList {
            return Ok(());
        }
        Err(self.error(pos, "inline_wasm argument must be an array literal of u8 values"))
    }

    fn primary_expr(&mut self) -> Result<ExprId, Diagnostic> {
        match self.token.kind {
            TokenKind::Int => {
                let token = self.bump()?;
                let suffix = token.suffix.map_or(NONE, |prim| u32::from(u8::from(prim)));
                self.add_expr(
                    ExprKind::IntLiteral,
                    token.pos,
                    token.int as u32,
                    (token.int >> 32) as u32,
                    suffix,
                )
            }
            TokenKind::Char => {
                let token = self.bump()?;
                self.add_expr(ExprKind::CharLiteral, token.pos, token.int as u32, 0, 0)
            }
            TokenKind::Str => {
                let token = self.bump()?;
                let bytes = unescape_string(self.token_text(token));
                let start = self.comp.ast.add_string(&bytes);
                self.add_expr(
                    ExprKind::StringLiteral,
                    token.pos,
                    start,
                    bytes.len() as u32,
                    0,
                )
            }
            TokenKind::KwTrue | TokenKind::KwFalse => {
                let token = self.bump()?;
                let value = u32::from(token.kind == TokenKind::KwTrue);
                self.add_expr(ExprKind::BoolLiteral, token.pos, value, 0, 0)
            }
            TokenKind::Ident => self.ident_expr(),
            TokenKind::KwType => {
                // `type` doubles as the name of the type-of-types primitive.
                let token = self.bump()?;
                let name = self.token_span(token);
                self.add_expr(ExprKind::Ident, token.pos, name.ptr, name.len, 0)
            }
            TokenKind::LParen => self.paren_expr(),
            TokenKind::LBracket => self.array_expr(),
            TokenKind::LBrace => self.block(),
            TokenKind::KwIf => self.if_expr(),
            TokenKind::KwWhile => self.while_expr(),
            TokenKind::KwLoop => {
                let token = self.bump()?;
                let body = self.block()?;
                self.add_expr(ExprKind::Loop, token.pos, body, 0, 0)
            }
            TokenKind::KwStruct => self.struct_type_expr(),
            TokenKind::KwFn => self.fn_expr(),
            _ => Err(self.error(self.token.pos, "expected expression")),
        }
    }

    fn ident_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        let name = self.token_span(token);
        let ident = self.add_expr(ExprKind::Ident, token.pos, name.ptr, name.len, 0)?;

        // `Name { field: ... }` is a struct literal unless braces are spoken
        // for (if/while conditions) or the braces clearly open a block.
        if self.at(TokenKind::LBrace) && !self.no_struct_literal {
            let second = self.peek_second()?;
            let is_literal = second.kind == TokenKind::RBrace
                || (second.kind == TokenKind::Ident && {
                    let mut probe = self.lexer.clone();
                    probe.next_token()?;
                    probe.next_token()?.kind == TokenKind::Colon
                });
            if is_literal {
                return self.struct_literal(ident, token.pos);
            }
        }
        Ok(ident)
    }

    fn struct_literal(&mut self, ty_expr: ExprId, pos: Pos) -> Result<ExprId, Diagnostic> {
        self.expect(TokenKind::LBrace, "expected '{'")?;
        let mut words = Vec::new();
        let mut count = 0u32;
        while !self.at(TokenKind::RBrace) {
            let name_token = self.expect(TokenKind::Ident, "expected field name")?;
            let name = self.token_span(name_token);
            self.expect(TokenKind::Colon, "expected ':' after field name")?;
            let value = self.expr()?;
            words.extend_from_slice(&[name.ptr, name.len, value]);
            count += 1;
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' after struct literal")?;
        let range = self
            .comp
            .ast
            .add_extra(&words)
            .map_err(|d| d.locate(self.path, pos))?;
        self.add_expr(ExprKind::StructLiteral, pos, ty_expr, range.start, count)
    }

    fn struct_type_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        self.expect(TokenKind::LBrace, "expected '{' after struct")?;
        let mut words = Vec::new();
        let mut count = 0u32;
        while !self.at(TokenKind::RBrace) {
            let name_token = self.expect(TokenKind::Ident, "expected field name")?;
            let name = self.token_span(name_token);
            self.expect(TokenKind::Colon, "expected ':' after field name")?;
            let ty = self.expr()?;
            words.extend_from_slice(&[name.ptr, name.len, ty]);
            count += 1;
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "expected '}' after struct fields")?;
        let range = self
            .comp
            .ast
            .add_extra(&words)
            .map_err(|d| d.locate(self.path, token.pos))?;
        self.add_expr(ExprKind::StructTypeExpr, token.pos, range.start, count, 0)
    }

    fn paren_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        if self.eat(TokenKind::RParen)? {
            // `()` is the unit tuple.
            let range = self
                .comp
                .ast
                .add_extra(&[])
                .map_err(|d| d.locate(self.path, token.pos))?;
            return self.add_expr(ExprKind::TupleLiteral, token.pos, range.start, 0, 0);
        }
        let saved = self.no_struct_literal;
        self.no_struct_literal = false;
        let first = self.expr()?;
        if self.eat(TokenKind::Comma)? {
            let mut items = vec![first];
            while !self.at(TokenKind::RParen) {
                items.push(self.expr()?);
                if !self.eat(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "expected ')' after tuple")?;
            self.no_struct_literal = saved;
            let range = self
                .comp
                .ast
                .add_extra(&items)
                .map_err(|d| d.locate(self.path, token.pos))?;
            return self.add_expr(
                ExprKind::TupleLiteral,
                token.pos,
                range.start,
                range.len,
                0,
            );
        }
        self.expect(TokenKind::RParen, "expected ')'")?;
        self.no_struct_literal = saved;
        Ok(first)
    }

    fn array_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        if self.eat(TokenKind::RBracket)? {
            let range = self
                .comp
                .ast
                .add_extra(&[])
                .map_err(|d| d.locate(self.path, token.pos))?;
            return self.add_expr(ExprKind::ArrayList, token.pos, range.start, 0, 0);
        }
        let saved = self.no_struct_literal;
        self.no_struct_literal = false;
        let first = self.expr()?;
        if self.eat(TokenKind::Semi)? {
            let length = self.expr()?;
            self.expect(TokenKind::RBracket, "expected ']' after array length")?;
            self.no_struct_literal = saved;
            return self.add_expr(ExprKind::ArrayRepeat, token.pos, first, length, 0);
        }
        let mut items = vec![first];
        while self.eat(TokenKind::Comma)? {
            if self.at(TokenKind::RBracket) {
                break;
            }
            items.push(self.expr()?);
        }
        self.expect(TokenKind::RBracket, "expected ']' after array literal")?;
        self.no_struct_literal = saved;
        let range = self
            .comp
            .ast
            .add_extra(&items)
            .map_err(|d| d.locate(self.path, token.pos))?;
        self.add_expr(ExprKind::ArrayList, token.pos, range.start, range.len, 0)
    }

    fn condition(&mut self) -> Result<ExprId, Diagnostic> {
        let saved = self.no_struct_literal;
        self.no_struct_literal = true;
        let condition = self.expr();
        self.no_struct_literal = saved;
        condition
    }

    fn if_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        let condition = self
            .condition()
            .map_err(|_| self.error(token.pos, "if expression condition parse failed"))?;
        let then = self.block()?;
        let otherwise = if self.eat(TokenKind::KwElse)? {
            if self.at(TokenKind::KwIf) {
                self.if_expr()?
            } else {
                self.block()?
            }
        } else {
            NONE
        };
        self.add_expr(ExprKind::If, token.pos, condition, then, otherwise)
    }

    fn while_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        let condition = self.condition()?;
        let body = self.block()?;
        self.add_expr(ExprKind::While, token.pos, condition, body, 0)
    }

    /// `fn` in expression position: an anonymous function literal when the
    /// parameter list is named, a function-signature type otherwise.
    fn fn_expr(&mut self) -> Result<ExprId, Diagnostic> {
        let token = self.bump()?;
        self.expect(TokenKind::LParen, "expected '(' after fn")?;

        let named_params = if self.at(TokenKind::RParen) {
            // Look past `)` and any `-> type` for a body.
            false
        } else {
            (self.at(TokenKind::Ident) || self.at(TokenKind::KwConst))
                && (self.at(TokenKind::KwConst)
                    || self.peek_second()?.kind == TokenKind::Colon)
        };

        if named_params {
            let mut params: Vec<Param> = Vec::new();
            while !self.at(TokenKind::RParen) {
                let is_const = self.eat(TokenKind::KwConst)?;
                let name_token = self.expect(TokenKind::Ident, "expected parameter name")?;
                let name = self.token_span(name_token);
                if params
                    .iter()
                    .any(|param| self.arena.slice(param.name) == self.arena.slice(name))
                {
                    return Err(self.error(name_token.pos, "duplicate parameter name"));
                }
                self.expect(TokenKind::Colon, "expected ':' after parameter name")?;
                let ty_expr = self.expr()?;
                params.push(Param {
                    name,
                    ty_expr,
                    is_const,
                    ty: TypeId::INVALID,
                });
                if !self.eat(TokenKind::Comma)? {
                    break;
                }
            }
            self.expect(TokenKind::RParen, "expected ')' after parameters")?;
            let ret_expr = if self.eat(TokenKind::Arrow)? {
                Some(self.expr()?)
            } else {
                None
            };
            let body = self.block()?;
            let mut flags = FunctionFlags::ANONYMOUS;
            if params.iter().any(|param| param.is_const) {
                flags |= FunctionFlags::HAS_CONST_PARAMS;
            }
            let func = self
                .comp
                .ast
                .add_function(Function {
                    name: Span::default(),
                    module: self.module,
                    pos: token.pos,
                    params,
                    ret_expr,
                    ret: TypeId::INVALID,
                    body,
                    flags,
                    local_count: 0,
                    locals: Vec::new(),
                    origin: None,
                })
                .map_err(|d| d.locate(self.path, token.pos))?;
            return self.add_expr(ExprKind::AnonFn, token.pos, func, 0, 0);
        }

        // Signature type: fn(T, ...) -> R
        let mut param_tys = Vec::new();
        while !self.at(TokenKind::RParen) {
            param_tys.push(self.expr()?);
            if !self.eat(TokenKind::Comma)? {
                break;
            }
        }
        self.expect(TokenKind::RParen, "expected ')' after parameter types")?;
        let ret = if self.eat(TokenKind::Arrow)? {
            self.expr()?
        } else {
            NONE
        };
        if param_tys.is_empty() && self.at(TokenKind::LBrace) {
            // `fn() { ... }` / `fn() -> T { ... }`: a parameterless literal.
            let body = self.block()?;
            let func = self
                .comp
                .ast
                .add_function(Function {
                    name: Span::default(),
                    module: self.module,
                    pos: token.pos,
                    params: Vec::new(),
                    ret_expr: (ret != NONE).then_some(ret),
                    ret: TypeId::INVALID,
                    body,
                    flags: FunctionFlags::ANONYMOUS,
                    local_count: 0,
                    locals: Vec::new(),
                    origin: None,
                })
                .map_err(|d| d.locate(self.path, token.pos))?;
            return self.add_expr(ExprKind::AnonFn, token.pos, func, 0, 0);
        }
        let range = self
            .comp
            .ast
            .add_extra(&param_tys)
            .map_err(|d| d.locate(self.path, token.pos))?;
        self.add_expr(ExprKind::FnTypeExpr, token.pos, range.start, range.len, ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    fn setup(source: &str) -> (Arena, Compilation) {
        let mut arena = Arena::new();
        registry::load(&mut arena, "/main.bt", source).unwrap();
        let comp = Compilation::snapshot(&arena, 0);
        (arena, comp)
    }

    fn parse_ok(source: &str) -> (Arena, Compilation) {
        let (arena, mut comp) = setup(source);
        parse_module(&arena, &mut comp, 0).unwrap();
        (arena, comp)
    }

    fn parse_err(source: &str) -> String {
        let (arena, mut comp) = setup(source);
        parse_module(&arena, &mut comp, 0).unwrap_err().to_string()
    }

    #[test]
    fn parses_function_items() {
        let (arena, comp) = parse_ok("fn main() -> i32 { 42 }\nfn helper(a: i32) -> i32 { a }");
        assert_eq!(comp.ast.functions.len(), 2);
        assert_eq!(arena.slice(comp.ast.functions[0].name), b"main");
        assert_eq!(comp.ast.functions[1].params.len(), 1);
    }

    #[test]
    fn parses_const_declarations() {
        let (arena, comp) = parse_ok("const LIMIT: i32 = 4 * 16;\nfn main() -> i32 { LIMIT }");
        assert_eq!(comp.ast.constants.len(), 1);
        assert_eq!(arena.slice(comp.ast.constants[0].name), b"LIMIT");
    }

    #[test]
    fn duplicate_function_rejected() {
        assert_eq!(
            parse_err("fn f() {}\nfn f() {}"),
            "/main.bt:2:4: duplicate function declaration"
        );
    }

    #[test]
    fn duplicate_parameter_rejected() {
        assert_eq!(
            parse_err("fn f(a: i32, a: i32) {}"),
            "/main.bt:1:14: duplicate parameter name"
        );
    }

    #[test]
    fn duplicate_constant_rejected() {
        assert_eq!(
            parse_err("const A: i32 = 1;\nconst A: i32 = 2;"),
            "/main.bt:2:7: duplicate constant declaration"
        );
    }

    #[test]
    fn const_params_flag_functions() {
        let (_, comp) = parse_ok("fn f(const N: i32, v: i32) -> i32 { v }");
        assert!(
            comp.ast.functions[0]
                .flags
                .contains(FunctionFlags::HAS_CONST_PARAMS)
        );
    }

    #[test]
    fn precedence_shapes_trees() {
        let (_, comp) = parse_ok("fn f() -> i32 { 1 + 2 * 3 }");
        let body = comp.ast.expr(comp.ast.functions[0].body);
        let tail = comp.ast.extra_words(crate::syntax::ExtraRange {
            start: body.a,
            len: body.b,
        })[0];
        let add = comp.ast.expr(tail);
        assert_eq!(add.kind, ExprKind::Binary);
        assert_eq!(BinaryOp::try_from(add.a as u8).unwrap(), BinaryOp::Add);
        let rhs = comp.ast.expr(add.c);
        assert_eq!(BinaryOp::try_from(rhs.a as u8).unwrap(), BinaryOp::Mul);
    }

    #[test]
    fn cast_binds_tighter_than_unary() {
        let (_, comp) = parse_ok("fn f(x: i32) -> i32 { -x as i32 }");
        let body = comp.ast.expr(comp.ast.functions[0].body);
        let tail = comp.ast.extra_words(crate::syntax::ExtraRange {
            start: body.a,
            len: body.b,
        })[0];
        assert_eq!(comp.ast.expr(tail).kind, ExprKind::Unary);
    }

    #[test]
    fn if_condition_failure_is_wrapped() {
        assert_eq!(
            parse_err("fn f() { if { 1 } }"),
            "/main.bt:1:10: if expression condition parse failed"
        );
    }

    #[test]
    fn struct_literals_need_field_syntax() {
        // `S { x: ... }` is a literal; `while s { ... }` keeps its block.
        let (_, comp) =
            parse_ok("fn f(s: bool) { while s { let x = 1; } }");
        assert_eq!(comp.ast.functions.len(), 1);
    }

    #[test]
    fn inline_wasm_requires_array_literal() {
        assert_eq!(
            parse_err("fn f() { inline_wasm(1) }"),
            "/main.bt:1:21: inline_wasm argument must be an array literal of u8 values"
        );
        let (_, comp) = parse_ok("fn f() { inline_wasm([11u8, 0u8]); }");
        assert_eq!(comp.ast.calls.len(), 1);
    }

    #[test]
    fn use_resolves_against_registry() {
        let mut arena = Arena::new();
        registry::load(&mut arena, "/lib/util.bt", "const ONE: i32 = 1;").unwrap();
        registry::load(
            &mut arena,
            "/app/main.bt",
            "use \"../lib/util.bt\";\nfn main() -> i32 { ONE }",
        )
        .unwrap();
        let mut comp = Compilation::snapshot(&arena, 1);
        parse_module(&arena, &mut comp, 1).unwrap();
        assert!(comp.modules[0].parsed);
        assert_eq!(comp.ast.constants.len(), 1);
    }

    #[test]
    fn missing_import_is_located() {
        let (arena, mut comp) = setup("use \"./other.bt\";");
        let err = parse_module(&arena, &mut comp, 0).unwrap_err();
        assert_eq!(err.to_string(), "/main.bt:1:5: module import not found");
    }

    #[test]
    fn anonymous_function_literal() {
        let (_, comp) = parse_ok("const F: fn(i32) -> i32 = fn(x: i32) -> i32 { x + 1 };");
        assert_eq!(comp.ast.functions.len(), 1);
        assert!(
            comp.ast.functions[0]
                .flags
                .contains(FunctionFlags::ANONYMOUS)
        );
    }

    #[test]
    fn break_with_value_parses() {
        let (_, comp) = parse_ok("fn f() -> i32 { loop { break 7; } }");
        let has_break = comp
            .ast
            .exprs
            .iter()
            .any(|expr| expr.kind == ExprKind::Break && expr.a != NONE);
        assert!(has_break);
    }
}
