//! Recursive-descent parser for the C subset
//!
//! Consumes the scanner's token stream and delivers the [`Unit`] node
//! tree. Expressions use precedence climbing; statements are one
//! function per construct. Typedef names are tracked in a side table so
//! casts and declarations starting with an alias parse unambiguously.

pub mod ast;

pub use ast::{
    BaseName, BinaryOp, Decl, Expr, ExprKind, Function, Item, Param, PostfixOp, Span, Stmt,
    StructMember, SwitchArm, TypeSpec, UnaryOp, Unit,
};

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::lexer::{Token, TokenKind};

/// Recursive-descent parser over a token stream
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    typedefs: HashSet<String>,
}

impl Parser {
    /// Creates a parser over the given tokens
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            typedefs: HashSet::new(),
        }
    }

    /// Parses a whole translation unit
    pub fn parse(mut self) -> Result<Unit> {
        let mut items = Vec::new();
        while !self.check(&TokenKind::Eof) {
            items.push(self.item()?);
        }
        Ok(Unit { items })
    }

    // -------------------------------------------------------------------
    // Token helpers
    // -------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_nth(&self, n: usize) -> &Token {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)]
    }

    fn span(&self) -> Span {
        let t = self.peek();
        Span::new(t.line, t.column)
    }

    fn advance(&mut self) -> Token {
        let t = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.err(format!("expected {}, found {:?}", what, self.peek().kind)))
        }
    }

    fn ident(&mut self, what: &str) -> Result<(String, Span)> {
        let span = self.span();
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, span))
            }
            other => Err(self.err(format!("expected {}, found {:?}", what, other))),
        }
    }

    fn err(&self, msg: impl Into<String>) -> Error {
        let t = self.peek();
        if t.kind == TokenKind::Eof {
            Error::UnexpectedEof
        } else {
            Error::SyntaxError {
                line: t.line,
                col: t.column,
                message: msg.into(),
            }
        }
    }

    // -------------------------------------------------------------------
    // Types
    // -------------------------------------------------------------------

    fn starts_type(&self, n: usize) -> bool {
        match &self.peek_nth(n).kind {
            TokenKind::Char
            | TokenKind::Int
            | TokenKind::Long
            | TokenKind::FloatKw
            | TokenKind::Double
            | TokenKind::Void
            | TokenKind::Struct => true,
            TokenKind::Ident(name) => self.typedefs.contains(name),
            _ => false,
        }
    }

    fn base_name(&mut self) -> Result<BaseName> {
        let kind = self.peek().kind.clone();
        Ok(match kind {
            TokenKind::Char => {
                self.advance();
                BaseName::Char
            }
            TokenKind::Int => {
                self.advance();
                BaseName::Int
            }
            TokenKind::Long => {
                self.advance();
                BaseName::Long
            }
            TokenKind::FloatKw => {
                self.advance();
                BaseName::Float
            }
            TokenKind::Double => {
                self.advance();
                BaseName::Double
            }
            TokenKind::Void => {
                self.advance();
                BaseName::Void
            }
            TokenKind::Struct => {
                self.advance();
                let (name, _) = self.ident("struct tag")?;
                BaseName::Struct(name)
            }
            TokenKind::Ident(name) if self.typedefs.contains(&name) => {
                self.advance();
                BaseName::Named(name)
            }
            other => return Err(self.err(format!("expected type name, found {:?}", other))),
        })
    }

    /// Parses `base * * ...` into a full type spec
    fn type_spec(&mut self) -> Result<TypeSpec> {
        let base = self.base_name()?;
        let mut ptr = 0u8;
        while self.eat(&TokenKind::Star) {
            ptr += 1;
        }
        Ok(TypeSpec { base, ptr })
    }

    // -------------------------------------------------------------------
    // Items
    // -------------------------------------------------------------------

    fn item(&mut self) -> Result<Item> {
        let span = self.span();
        match self.peek().kind.clone() {
            TokenKind::Typedef => self.typedef_item(span),
            TokenKind::Enum => self.enum_item(span),
            TokenKind::Struct if self.peek_nth(2).kind == TokenKind::LBrace => {
                self.struct_item(span)
            }
            _ => self.func_or_globals(),
        }
    }

    fn typedef_item(&mut self, span: Span) -> Result<Item> {
        self.advance(); // typedef
        let ty = self.type_spec()?;
        let (name, _) = self.ident("typedef name")?;
        self.expect(&TokenKind::Semi, "`;`")?;
        self.typedefs.insert(name.clone());
        Ok(Item::Typedef { ty, name, span })
    }

    fn struct_item(&mut self, span: Span) -> Result<Item> {
        self.advance(); // struct
        let (name, _) = self.ident("struct tag")?;
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut members = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let base = self.base_name()?;
            loop {
                let mut ptr = 0u8;
                while self.eat(&TokenKind::Star) {
                    ptr += 1;
                }
                let (mname, mspan) = self.ident("member name")?;
                members.push(StructMember {
                    ty: TypeSpec {
                        base: base.clone(),
                        ptr,
                    },
                    name: mname,
                    span: mspan,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Semi, "`;`")?;
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(Item::StructDef {
            name,
            members,
            span,
        })
    }

    fn enum_item(&mut self, span: Span) -> Result<Item> {
        self.advance(); // enum
        let name = match self.peek().kind.clone() {
            TokenKind::Ident(n) => {
                self.advance();
                Some(n)
            }
            _ => None,
        };
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut variants = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let (vname, vspan) = self.ident("enumerator")?;
            let value = if self.eat(&TokenKind::Assign) {
                Some(self.ternary()?)
            } else {
                None
            };
            variants.push((vname, value, vspan));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(Item::EnumDef {
            name,
            variants,
            span,
        })
    }

    fn func_or_globals(&mut self) -> Result<Item> {
        let base = self.base_name()?;
        let mut ptr = 0u8;
        while self.eat(&TokenKind::Star) {
            ptr += 1;
        }
        let (name, span) = self.ident("declaration name")?;
        if self.check(&TokenKind::LParen) {
            return self.function(
                TypeSpec {
                    base: base.clone(),
                    ptr,
                },
                name,
                span,
            );
        }
        // Global variable list
        let mut decls = Vec::new();
        let mut cur = (ptr, name, span);
        loop {
            let init = if self.eat(&TokenKind::Assign) {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(Decl {
                ty: TypeSpec {
                    base: base.clone(),
                    ptr: cur.0,
                },
                name: cur.1,
                init,
                span: cur.2,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
            let mut p = 0u8;
            while self.eat(&TokenKind::Star) {
                p += 1;
            }
            let (n, s) = self.ident("declaration name")?;
            cur = (p, n, s);
        }
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(Item::Globals(decls))
    }

    fn function(&mut self, ret: TypeSpec, name: String, span: Span) -> Result<Item> {
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            if self.check(&TokenKind::Void) && self.peek_nth(1).kind == TokenKind::RParen {
                self.advance();
            } else {
                loop {
                    let ty = self.type_spec()?;
                    let (pname, pspan) = self.ident("parameter name")?;
                    params.push(Param {
                        ty,
                        name: pname,
                        span: pspan,
                    });
                    if !self.eat(&TokenKind::Comma) {
                        break;
                    }
                }
            }
        }
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::LBrace, "`{`")?;
        let body = self.block_body()?;
        Ok(Item::Function(Function {
            ret,
            name,
            params,
            body,
            span,
        }))
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn block_body(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(Error::UnexpectedEof);
            }
            stmts.push(self.statement()?);
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt> {
        let span = self.span();
        match self.peek().kind.clone() {
            TokenKind::LBrace => {
                self.advance();
                Ok(Stmt::Block(self.block_body()?))
            }
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::Do => self.do_while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Switch => self.switch_stmt(),
            TokenKind::Break => {
                self.advance();
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(Stmt::Break(span))
            }
            TokenKind::Continue => {
                self.advance();
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(Stmt::Continue(span))
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.check(&TokenKind::Semi) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(Stmt::Return(value, span))
            }
            TokenKind::Interrupt => {
                self.advance();
                let num = match self.peek().kind.clone() {
                    TokenKind::Integer(n) => {
                        self.advance();
                        n
                    }
                    other => {
                        return Err(
                            self.err(format!("expected interrupt number, found {:?}", other))
                        )
                    }
                };
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(Stmt::Interrupt(num, span))
            }
            TokenKind::Semi => {
                self.advance();
                Ok(Stmt::Block(Vec::new()))
            }
            _ if self.starts_type(0) => self.local_decl(),
            _ => {
                let expr = self.expression()?;
                self.expect(&TokenKind::Semi, "`;`")?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn local_decl(&mut self) -> Result<Stmt> {
        let base = self.base_name()?;
        let mut decls = Vec::new();
        loop {
            let mut ptr = 0u8;
            while self.eat(&TokenKind::Star) {
                ptr += 1;
            }
            let (name, span) = self.ident("declaration name")?;
            let init = if self.eat(&TokenKind::Assign) {
                Some(self.assignment()?)
            } else {
                None
            };
            decls.push(Decl {
                ty: TypeSpec {
                    base: base.clone(),
                    ptr,
                },
                name,
                init,
                span,
            });
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(Stmt::Decl(decls))
    }

    fn if_stmt(&mut self) -> Result<Stmt> {
        self.advance(); // if
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then = Box::new(self.statement()?);
        let els = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, els })
    }

    fn while_stmt(&mut self) -> Result<Stmt> {
        self.advance(); // while
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { cond, body })
    }

    fn do_while_stmt(&mut self) -> Result<Stmt> {
        self.advance(); // do
        let body = Box::new(self.statement()?);
        self.expect(&TokenKind::While, "`while`")?;
        self.expect(&TokenKind::LParen, "`(`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::Semi, "`;`")?;
        Ok(Stmt::DoWhile { body, cond })
    }

    fn for_stmt(&mut self) -> Result<Stmt> {
        self.advance(); // for
        self.expect(&TokenKind::LParen, "`(`")?;
        let init = if self.check(&TokenKind::Semi) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semi, "`;`")?;
        let cond = if self.check(&TokenKind::Semi) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semi, "`;`")?;
        let step = if self.check(&TokenKind::RParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::RParen, "`)`")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
        })
    }

    fn switch_stmt(&mut self) -> Result<Stmt> {
        self.advance(); // switch
        self.expect(&TokenKind::LParen, "`(`")?;
        let value = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        self.expect(&TokenKind::LBrace, "`{`")?;
        let mut arms = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            let span = self.span();
            let label = if self.eat(&TokenKind::Case) {
                let v = self.ternary()?;
                self.expect(&TokenKind::Colon, "`:`")?;
                Some(v)
            } else if self.eat(&TokenKind::Default) {
                self.expect(&TokenKind::Colon, "`:`")?;
                None
            } else {
                return Err(self.err("expected `case` or `default`"));
            };
            let mut body = Vec::new();
            while !self.check(&TokenKind::RBrace)
                && !self.check(&TokenKind::Case)
                && !self.check(&TokenKind::Default)
            {
                body.push(self.statement()?);
            }
            arms.push(SwitchArm {
                value: label,
                body,
                span,
            });
        }
        self.expect(&TokenKind::RBrace, "`}`")?;
        Ok(Stmt::Switch { value, arms })
    }

    // -------------------------------------------------------------------
    // Expressions (precedence climbing)
    // -------------------------------------------------------------------

    fn expression(&mut self) -> Result<Expr> {
        let span = self.span();
        let first = self.assignment()?;
        if !self.check(&TokenKind::Comma) {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat(&TokenKind::Comma) {
            exprs.push(self.assignment()?);
        }
        Ok(Expr::new(ExprKind::Comma(exprs), span))
    }

    fn assignment(&mut self) -> Result<Expr> {
        let lhs = self.ternary()?;
        let op = match self.peek().kind {
            TokenKind::Assign => None,
            TokenKind::PlusAssign => Some(BinaryOp::Add),
            TokenKind::MinusAssign => Some(BinaryOp::Sub),
            TokenKind::StarAssign => Some(BinaryOp::Mul),
            TokenKind::SlashAssign => Some(BinaryOp::Div),
            TokenKind::PercentAssign => Some(BinaryOp::Mod),
            TokenKind::AmpAssign => Some(BinaryOp::BitAnd),
            TokenKind::PipeAssign => Some(BinaryOp::BitOr),
            TokenKind::CaretAssign => Some(BinaryOp::BitXor),
            TokenKind::ShlAssign => Some(BinaryOp::Shl),
            TokenKind::ShrAssign => Some(BinaryOp::Shr),
            _ => return Ok(lhs),
        };
        let span = lhs.span;
        self.advance();
        let rhs = self.assignment()?;
        Ok(Expr::new(
            ExprKind::Assign(op, Box::new(lhs), Box::new(rhs)),
            span,
        ))
    }

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.binary(0)?;
        if !self.eat(&TokenKind::Question) {
            return Ok(cond);
        }
        let span = cond.span;
        let then = self.assignment()?;
        self.expect(&TokenKind::Colon, "`:`")?;
        let els = self.assignment()?;
        Ok(Expr::new(
            ExprKind::Ternary(Box::new(cond), Box::new(then), Box::new(els)),
            span,
        ))
    }

    fn binary_op(&self, level: u8) -> Option<BinaryOp> {
        let op = match (level, &self.peek().kind) {
            (0, TokenKind::OrOr) => BinaryOp::LogOr,
            (1, TokenKind::AndAnd) => BinaryOp::LogAnd,
            (2, TokenKind::Pipe) => BinaryOp::BitOr,
            (3, TokenKind::Caret) => BinaryOp::BitXor,
            (4, TokenKind::Amp) => BinaryOp::BitAnd,
            (5, TokenKind::EqEq) => BinaryOp::Eq,
            (5, TokenKind::NotEq) => BinaryOp::Ne,
            (6, TokenKind::Lt) => BinaryOp::Lt,
            (6, TokenKind::Gt) => BinaryOp::Gt,
            (6, TokenKind::Le) => BinaryOp::Le,
            (6, TokenKind::Ge) => BinaryOp::Ge,
            (7, TokenKind::Shl) => BinaryOp::Shl,
            (7, TokenKind::Shr) => BinaryOp::Shr,
            (8, TokenKind::Plus) => BinaryOp::Add,
            (8, TokenKind::Minus) => BinaryOp::Sub,
            (9, TokenKind::Star) => BinaryOp::Mul,
            (9, TokenKind::Slash) => BinaryOp::Div,
            (9, TokenKind::Percent) => BinaryOp::Mod,
            _ => return None,
        };
        Some(op)
    }

    fn binary(&mut self, level: u8) -> Result<Expr> {
        if level > 9 {
            return self.unary();
        }
        let mut lhs = self.binary(level + 1)?;
        while let Some(op) = self.binary_op(level) {
            let span = lhs.span;
            self.advance();
            let rhs = self.binary(level + 1)?;
            lhs = Expr::new(ExprKind::Binary(op, Box::new(lhs), Box::new(rhs)), span);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let span = self.span();
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Tilde => Some(UnaryOp::BitNot),
            TokenKind::Bang => Some(UnaryOp::LogNot),
            TokenKind::Star => Some(UnaryOp::Deref),
            TokenKind::Amp => Some(UnaryOp::Addr),
            TokenKind::Inc => Some(UnaryOp::PreInc),
            TokenKind::Dec => Some(UnaryOp::PreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.unary()?;
            return Ok(Expr::new(ExprKind::Unary(op, Box::new(operand)), span));
        }
        if self.check(&TokenKind::Sizeof) {
            self.advance();
            if self.check(&TokenKind::LParen) && self.starts_type(1) {
                self.advance();
                let ty = self.type_spec()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                return Ok(Expr::new(ExprKind::SizeofType(ty), span));
            }
            let operand = self.unary()?;
            return Ok(Expr::new(ExprKind::SizeofExpr(Box::new(operand)), span));
        }
        // Cast: `(` followed by a type name
        if self.check(&TokenKind::LParen) && self.starts_type(1) {
            self.advance();
            let ty = self.type_spec()?;
            self.expect(&TokenKind::RParen, "`)`")?;
            let operand = self.unary()?;
            return Ok(Expr::new(ExprKind::Cast(ty, Box::new(operand)), span));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            let span = expr.span;
            match self.peek().kind.clone() {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    if !self.check(&TokenKind::RParen) {
                        loop {
                            args.push(self.assignment()?);
                            if !self.eat(&TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(&TokenKind::RParen, "`)`")?;
                    expr = Expr::new(ExprKind::Call(Box::new(expr), args), span);
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "`]`")?;
                    expr = Expr::new(ExprKind::Index(Box::new(expr), Box::new(index)), span);
                }
                TokenKind::Dot => {
                    self.advance();
                    let (name, _) = self.ident("member name")?;
                    expr = Expr::new(ExprKind::Member(Box::new(expr), name), span);
                }
                TokenKind::Arrow => {
                    self.advance();
                    let (name, _) = self.ident("member name")?;
                    expr = Expr::new(ExprKind::Arrow(Box::new(expr), name), span);
                }
                TokenKind::Inc => {
                    self.advance();
                    expr = Expr::new(ExprKind::Postfix(PostfixOp::PostInc, Box::new(expr)), span);
                }
                TokenKind::Dec => {
                    self.advance();
                    expr = Expr::new(ExprKind::Postfix(PostfixOp::PostDec, Box::new(expr)), span);
                }
                _ => return Ok(expr),
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let span = self.span();
        match self.peek().kind.clone() {
            TokenKind::Integer(n) => {
                self.advance();
                Ok(Expr::new(ExprKind::Int(n), span))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::new(ExprKind::Float(f), span))
            }
            TokenKind::Str(s) => {
                self.advance();
                // Adjacent string literals concatenate
                let mut text = s;
                while let TokenKind::Str(next) = self.peek().kind.clone() {
                    self.advance();
                    text.push_str(&next);
                }
                Ok(Expr::new(ExprKind::Str(text), span))
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::new(ExprKind::Ident(name), span))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            other => Err(self.err(format!("expected expression, found {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Scanner;

    fn parse(src: &str) -> Unit {
        let tokens = Scanner::new(src).scan_tokens().unwrap();
        Parser::new(tokens).parse().unwrap()
    }

    #[test]
    fn test_parse_minimal_main() {
        let unit = parse("int main() { return 2 + 3 * 4; }");
        assert_eq!(unit.items.len(), 1);
        match &unit.items[0] {
            Item::Function(f) => {
                assert_eq!(f.name, "main");
                assert!(f.params.is_empty());
                assert_eq!(f.body.len(), 1);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence() {
        let unit = parse("int main() { return 2 + 3 * 4; }");
        let Item::Function(f) = &unit.items[0] else {
            panic!();
        };
        let Stmt::Return(Some(e), _) = &f.body[0] else {
            panic!();
        };
        // (+ 2 (* 3 4))
        match &e.kind {
            ExprKind::Binary(BinaryOp::Add, lhs, rhs) => {
                assert_eq!(lhs.kind, ExprKind::Int(2));
                assert!(matches!(rhs.kind, ExprKind::Binary(BinaryOp::Mul, _, _)));
            }
            other => panic!("unexpected tree: {:?}", other),
        }
    }

    #[test]
    fn test_pointer_declarators() {
        let unit = parse("int main() { char *p; char **q; p; q; }");
        let Item::Function(f) = &unit.items[0] else {
            panic!();
        };
        let Stmt::Decl(decls) = &f.body[0] else {
            panic!();
        };
        assert_eq!(decls[0].ty.ptr, 1);
    }

    #[test]
    fn test_typedef_enables_cast() {
        let unit = parse("typedef int word; int main() { return (word)1; }");
        let Item::Function(f) = &unit.items[1] else {
            panic!();
        };
        let Stmt::Return(Some(e), _) = &f.body[0] else {
            panic!();
        };
        assert!(matches!(e.kind, ExprKind::Cast(_, _)));
    }

    #[test]
    fn test_struct_def_and_member_access() {
        let unit = parse(
            "struct point { int x; int y; };\n\
             int main() { struct point p; p.x = 1; return p.x; }",
        );
        assert_eq!(unit.items.len(), 2);
        assert!(matches!(unit.items[0], Item::StructDef { .. }));
    }

    #[test]
    fn test_switch_arms() {
        let unit = parse(
            "int main(int c) { switch (c) { case 1: return 10; case 2: break; default: return 0; } }",
        );
        let Item::Function(f) = &unit.items[0] else {
            panic!();
        };
        let Stmt::Switch { arms, .. } = &f.body[0] else {
            panic!();
        };
        assert_eq!(arms.len(), 3);
        assert!(arms[2].value.is_none());
    }

    #[test]
    fn test_interrupt_statement() {
        let unit = parse("int put_char(char c) { c; interrupt 0; }");
        let Item::Function(f) = &unit.items[0] else {
            panic!();
        };
        assert!(matches!(f.body[1], Stmt::Interrupt(0, _)));
    }

    #[test]
    fn test_for_loop_decomposition() {
        let unit = parse("int main() { int i, s; for (i = 0, s = 0; i < 10; ++i) s += i; return s; }");
        let Item::Function(f) = &unit.items[0] else {
            panic!();
        };
        let Stmt::For {
            init, cond, step, ..
        } = &f.body[1]
        else {
            panic!();
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(step.is_some());
    }

    #[test]
    fn test_missing_semi_is_syntax_error() {
        let tokens = Scanner::new("int main() { return 1 }").scan_tokens().unwrap();
        assert!(Parser::new(tokens).parse().is_err());
    }
}
