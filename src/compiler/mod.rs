//! # Code generator — C subset to VM bytecode
//!
//! Walks the AST the parser delivers, resolves identifiers through the
//! scope stack, builds the typed expression model, and emits the
//! instruction stream plus a resolved data segment.
//!
//! ```text
//! source → Scanner → Parser → Codegen → Image (text, data, entry)
//! ```
//!
//! Emission follows the stack-machine convention: binary operators pop
//! their left operand and combine with `ax`; stores pop the destination
//! address pushed beforehand. Forward branch targets use a
//! slot-and-fixup pattern: the branch is emitted with a placeholder
//! immediate which is rewritten once the target is known. Loops and
//! switches collect their `break`/`continue` fixups in cycle frames.

pub mod instruction;
pub mod linker;
pub mod symbol;

pub use instruction::{
    Image, Opcode, Segment, DATA_BASE, EXIT_PC, HEAP_BASE, SEGMENT_MASK, STACK_BASE, STACK_SLOT,
    TEXT_BASE,
};
pub use linker::{Linker, SourceReader};
pub use symbol::{
    align_up, ExprNode, FuncSymbol, IdSymbol, NodeKind, Prim, SizeKind, Storage, Symbol,
    SymbolId, SymbolTable, Ty, PTR_SIZE,
};

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::lexer::Scanner;
use crate::parser::ast::{
    BaseName, BinaryOp, Decl, Expr, ExprKind, Function, Item, PostfixOp, Span, Stmt, TypeSpec,
    UnaryOp, Unit,
};
use crate::parser::Parser;

use symbol::arith_result;

/// Compiles one linked translation unit into an image
pub fn compile(source: &str) -> Result<Image> {
    let tokens = Scanner::new(source).scan_tokens()?;
    let unit = Parser::new(tokens).parse()?;
    Codegen::new().generate(&unit)
}

/// Collected `break`/`continue` patch slots of one enclosing construct
#[derive(Debug, Default)]
struct CycleFrame {
    /// Placeholder slots to rewrite with the exit target
    breaks: Vec<usize>,
    /// Placeholder slots to rewrite with the continue target
    continues: Vec<usize>,
    /// Switches accept `break` but pass `continue` through
    is_loop: bool,
}

/// The code generator
///
/// One instance compiles one translation unit; [`Codegen::generate`]
/// consumes it and returns the linkable image.
#[derive(Debug)]
pub struct Codegen {
    text: Vec<u32>,
    data: Vec<u8>,
    strings: HashMap<String, u32>,
    table: SymbolTable,
    cycles: Vec<CycleFrame>,
    current_fn: Option<SymbolId>,
    local_offset: u32,
}

impl Default for Codegen {
    fn default() -> Self {
        Self::new()
    }
}

impl Codegen {
    /// Creates a generator with an empty image and the global scope open
    pub fn new() -> Self {
        Codegen {
            text: Vec::new(),
            data: Vec::new(),
            strings: HashMap::new(),
            table: SymbolTable::new(),
            cycles: Vec::new(),
            current_fn: None,
            local_offset: 0,
        }
    }

    /// Lowers the whole unit and returns the image
    pub fn generate(mut self, unit: &Unit) -> Result<Image> {
        for item in &unit.items {
            self.gen_item(item)?;
        }
        let entry = match self.table.lookup("main").map(|id| self.table.get(id)) {
            Some(Symbol::Func(f)) => f.entry,
            _ => {
                return Err(Error::semantic(0, 0, "undefined entry function `main`"));
            }
        };
        debug!(
            text_words = self.text.len(),
            data_bytes = self.data.len(),
            entry,
            "generated image"
        );
        Ok(Image {
            text: self.text,
            data: self.data,
            entry,
        })
    }

    // -------------------------------------------------------------------
    // Emitter surface
    // -------------------------------------------------------------------

    /// Appends a zero-operand instruction
    pub fn emit(&mut self, op: Opcode) {
        self.text.push(op as u32);
    }

    /// Appends an instruction with one immediate
    pub fn emit1(&mut self, op: Opcode, imm: i32) {
        self.text.push(op as u32);
        self.text.push(imm as u32);
    }

    /// Appends an instruction with two immediates
    pub fn emit2(&mut self, op: Opcode, lo: u32, hi: u32) {
        self.text.push(op as u32);
        self.text.push(lo);
        self.text.push(hi);
    }

    /// Current text-segment word offset
    pub fn current(&self) -> usize {
        self.text.len()
    }

    /// Rewrites an emitted immediate (back-patching)
    pub fn edit(&mut self, slot: usize, imm: i32) {
        self.text[slot] = imm as u32;
    }

    /// Emits a branch with a placeholder target, returning the slot to patch
    fn branch(&mut self, op: Opcode) -> usize {
        self.emit1(op, 0);
        self.current() - 1
    }

    /// Builds a one-line diagnostic at a source position; generation of
    /// the current translation unit stops when it propagates
    pub fn error(&self, span: Span, msg: impl Into<String>) -> Error {
        Error::semantic(span.line, span.column, msg)
    }

    /// Loads a 64-bit constant into `ax`, using the short form when it fits
    fn emit_const(&mut self, value: i64) {
        if value >= i32::MIN as i64 && value <= i32::MAX as i64 {
            self.emit1(Opcode::Imm, value as i32);
        } else {
            self.emit2(Opcode::Imx, value as u32, (value >> 32) as u32);
        }
    }

    /// Interns a string literal in the data segment
    ///
    /// Identical literals share one address; the bytes are
    /// NUL-terminated.
    pub fn load_string(&mut self, s: &str) -> u32 {
        if let Some(&addr) = self.strings.get(s) {
            return addr;
        }
        let addr = DATA_BASE | self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        self.strings.insert(s.to_string(), addr);
        addr
    }

    /// Reserves an aligned global slot, returning its virtual address
    fn alloc_global(&mut self, size: u32, align: u32) -> u32 {
        let off = align_up(self.data.len() as u32, align.max(1));
        self.data.resize((off + size) as usize, 0);
        DATA_BASE | off
    }

    /// Reserves an aligned local slot, returning its frame offset
    fn alloc_local(&mut self, size: u32, align: u32) -> i64 {
        let off = align_up(self.local_offset, align.max(1)) + size;
        self.local_offset = off;
        -(off as i64)
    }

    // -------------------------------------------------------------------
    // Types and constants
    // -------------------------------------------------------------------

    fn resolve_type(&self, spec: &TypeSpec, span: Span) -> Result<Ty> {
        let ty = match &spec.base {
            BaseName::Char => Ty::Base {
                prim: Prim::Char,
                ptr: spec.ptr,
            },
            BaseName::Int => Ty::Base {
                prim: Prim::Int,
                ptr: spec.ptr,
            },
            BaseName::Long => Ty::Base {
                prim: Prim::Long,
                ptr: spec.ptr,
            },
            // float and double share the canonical floating format
            BaseName::Float | BaseName::Double => Ty::Base {
                prim: Prim::Double,
                ptr: spec.ptr,
            },
            BaseName::Void => Ty::Base {
                prim: Prim::Void,
                ptr: spec.ptr,
            },
            BaseName::Struct(name) | BaseName::Named(name) => {
                let id = self.table.lookup(name).ok_or_else(|| Error::Undeclared {
                    name: name.clone(),
                    line: span.line,
                    col: span.column,
                })?;
                match self.table.get(id) {
                    Symbol::Struct { .. } | Symbol::Typedef { .. } => Ty::Named {
                        symbol: id,
                        ptr: spec.ptr,
                    },
                    _ => {
                        return Err(Error::semantic(
                            span.line,
                            span.column,
                            format!("`{}` does not name a type", name),
                        ))
                    }
                }
            }
        };
        Ok(ty)
    }

    /// Folds a constant integer expression (enum values, case labels,
    /// global initializers)
    fn const_eval(&self, e: &Expr) -> Result<i64> {
        let fail = || {
            Error::semantic(
                e.span.line,
                e.span.column,
                "expression is not an integer constant",
            )
        };
        Ok(match &e.kind {
            ExprKind::Int(v) => *v,
            ExprKind::Ident(name) => match self.table.lookup(name).map(|id| self.table.get(id)) {
                Some(Symbol::Id(id)) if id.class == Storage::EnumConst => id.addr,
                _ => return Err(fail()),
            },
            ExprKind::Unary(UnaryOp::Neg, inner) => self.const_eval(inner)?.wrapping_neg(),
            ExprKind::Unary(UnaryOp::BitNot, inner) => !self.const_eval(inner)?,
            ExprKind::Unary(UnaryOp::LogNot, inner) => (self.const_eval(inner)? == 0) as i64,
            ExprKind::Binary(op, lhs, rhs) => {
                let l = self.const_eval(lhs)?;
                let r = self.const_eval(rhs)?;
                match op {
                    BinaryOp::Add => l.wrapping_add(r),
                    BinaryOp::Sub => l.wrapping_sub(r),
                    BinaryOp::Mul => l.wrapping_mul(r),
                    BinaryOp::Div if r != 0 => l.wrapping_div(r),
                    BinaryOp::Mod if r != 0 => l.wrapping_rem(r),
                    BinaryOp::Shl => l.wrapping_shl(r as u32),
                    BinaryOp::Shr => l.wrapping_shr(r as u32),
                    BinaryOp::BitAnd => l & r,
                    BinaryOp::BitOr => l | r,
                    BinaryOp::BitXor => l ^ r,
                    BinaryOp::Eq => (l == r) as i64,
                    BinaryOp::Ne => (l != r) as i64,
                    BinaryOp::Lt => (l < r) as i64,
                    BinaryOp::Gt => (l > r) as i64,
                    BinaryOp::Le => (l <= r) as i64,
                    BinaryOp::Ge => (l >= r) as i64,
                    _ => return Err(fail()),
                }
            }
            ExprKind::SizeofType(spec) => {
                let ty = self.resolve_type(spec, e.span)?;
                ty.size(SizeKind::Total, &self.table) as i64
            }
            ExprKind::Cast(_, inner) => self.const_eval(inner)?,
            _ => return Err(fail()),
        })
    }

    // -------------------------------------------------------------------
    // Lowering: AST expression → typed node
    // -------------------------------------------------------------------

    /// Lowers an AST expression into the typed model, resolving
    /// identifiers against the innermost visible binding
    pub fn lower(&mut self, e: &Expr) -> Result<ExprNode> {
        let span = e.span;
        let node = match &e.kind {
            ExprKind::Int(v) => ExprNode {
                ty: if *v > i32::MAX as i64 || *v < i32::MIN as i64 {
                    Ty::Base {
                        prim: Prim::Long,
                        ptr: 0,
                    }
                } else {
                    Ty::int()
                },
                kind: NodeKind::IntConst(*v),
                span,
            },
            ExprKind::Float(v) => ExprNode {
                ty: Ty::Base {
                    prim: Prim::Double,
                    ptr: 0,
                },
                kind: NodeKind::FloatConst(*v),
                span,
            },
            ExprKind::Str(s) => {
                let addr = self.load_string(s);
                ExprNode {
                    ty: Ty::char_ptr(),
                    kind: NodeKind::StrConst(addr),
                    span,
                }
            }
            ExprKind::Ident(name) => {
                let id = self.table.lookup(name).ok_or_else(|| Error::Undeclared {
                    name: name.clone(),
                    line: span.line,
                    col: span.column,
                })?;
                match self.table.get(id) {
                    Symbol::Id(sym) if sym.class == Storage::EnumConst => ExprNode {
                        ty: Ty::int(),
                        kind: NodeKind::IntConst(sym.addr),
                        span,
                    },
                    Symbol::Id(sym) => ExprNode {
                        ty: sym.ty,
                        kind: NodeKind::Id(id),
                        span,
                    },
                    Symbol::Func(f) => ExprNode {
                        ty: f.ret,
                        kind: NodeKind::Id(id),
                        span,
                    },
                    _ => {
                        return Err(Error::semantic(
                            span.line,
                            span.column,
                            format!("`{}` is not a value", name),
                        ))
                    }
                }
            }
            ExprKind::Unary(op, inner) => return self.lower_unary(*op, inner, span),
            ExprKind::Postfix(op, inner) => {
                let exp = self.lower(inner)?;
                self.check_incrementable(&exp)?;
                ExprNode {
                    ty: exp.ty,
                    kind: NodeKind::Sinop {
                        inc: *op == PostfixOp::PostInc,
                        postfix: true,
                        exp: Box::new(exp),
                    },
                    span,
                }
            }
            ExprKind::Binary(op, l, r) => {
                let lhs = self.lower(l)?;
                let rhs = self.lower(r)?;
                let ty = arith_result(*op, lhs.ty, rhs.ty, &self.table).ok_or_else(|| {
                    Error::TypeMismatch {
                        line: span.line,
                        col: span.column,
                        message: format!(
                            "invalid operands {} and {}",
                            lhs.ty.describe(&self.table),
                            rhs.ty.describe(&self.table)
                        ),
                    }
                })?;
                ExprNode {
                    ty,
                    kind: NodeKind::Binop {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span,
                }
            }
            ExprKind::Assign(op, l, r) => {
                let lhs = self.lower(l)?;
                let rhs = self.lower(r)?;
                self.check_assignable(&lhs, &rhs, span)?;
                ExprNode {
                    ty: lhs.ty,
                    kind: NodeKind::Assign {
                        op: *op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    span,
                }
            }
            ExprKind::Ternary(c, t, f) => {
                let cond = self.lower(c)?;
                let then = self.lower(t)?;
                let els = self.lower(f)?;
                let ty = if then.ty == els.ty {
                    then.ty
                } else if then.ty.is_float(&self.table) || els.ty.is_float(&self.table) {
                    Ty::Base {
                        prim: Prim::Double,
                        ptr: 0,
                    }
                } else {
                    then.ty
                };
                ExprNode {
                    ty,
                    kind: NodeKind::Triop {
                        cond: Box::new(cond),
                        then: Box::new(then),
                        els: Box::new(els),
                    },
                    span,
                }
            }
            ExprKind::Comma(exprs) => {
                let mut nodes = Vec::with_capacity(exprs.len());
                for e in exprs {
                    nodes.push(self.lower(e)?);
                }
                let ty = nodes.last().map(|n| n.ty).unwrap_or_else(Ty::int);
                ExprNode {
                    ty,
                    kind: NodeKind::List(nodes),
                    span,
                }
            }
            ExprKind::Call(callee, args) => {
                let ExprKind::Ident(name) = &callee.kind else {
                    return Err(Error::semantic(
                        span.line,
                        span.column,
                        "called object is not a function",
                    ));
                };
                let id = self.table.lookup(name).ok_or_else(|| Error::Undeclared {
                    name: name.clone(),
                    line: span.line,
                    col: span.column,
                })?;
                let (ret, nparams) = match self.table.get(id) {
                    Symbol::Func(f) => (f.ret, f.params.len()),
                    _ => {
                        return Err(Error::semantic(
                            span.line,
                            span.column,
                            format!("`{}` is not a function", name),
                        ))
                    }
                };
                if args.len() != nparams {
                    return Err(Error::semantic(
                        span.line,
                        span.column,
                        format!(
                            "`{}` expects {} argument(s), got {}",
                            name,
                            nparams,
                            args.len()
                        ),
                    ));
                }
                let mut lowered = Vec::with_capacity(args.len());
                for a in args {
                    lowered.push(self.lower(a)?);
                }
                ExprNode {
                    ty: ret,
                    kind: NodeKind::Call {
                        func: id,
                        args: lowered,
                    },
                    span,
                }
            }
            ExprKind::Index(base, index) => {
                let base = self.lower(base)?;
                let index = self.lower(index)?;
                let pointee = base.ty.deref(&self.table).ok_or_else(|| Error::TypeMismatch {
                    line: span.line,
                    col: span.column,
                    message: format!("subscript of non-pointer {}", base.ty.describe(&self.table)),
                })?;
                let ptr_ty = base.ty;
                ExprNode {
                    ty: pointee,
                    kind: NodeKind::Unop {
                        op: UnaryOp::Deref,
                        exp: Box::new(ExprNode {
                            ty: ptr_ty,
                            kind: NodeKind::Binop {
                                op: BinaryOp::Add,
                                lhs: Box::new(base),
                                rhs: Box::new(index),
                            },
                            span,
                        }),
                    },
                    span,
                }
            }
            ExprKind::Member(base, field) => {
                let base = self.lower(base)?;
                return self.lower_member(base, field, span);
            }
            ExprKind::Arrow(base, field) => {
                let ptr = self.lower(base)?;
                let pointee = ptr.ty.deref(&self.table).ok_or_else(|| Error::TypeMismatch {
                    line: span.line,
                    col: span.column,
                    message: "`->` on a non-pointer".to_string(),
                })?;
                let deref = ExprNode {
                    ty: pointee,
                    kind: NodeKind::Unop {
                        op: UnaryOp::Deref,
                        exp: Box::new(ptr),
                    },
                    span,
                };
                return self.lower_member(deref, field, span);
            }
            ExprKind::Cast(spec, inner) => {
                let ty = self.resolve_type(spec, span)?;
                let exp = self.lower(inner)?;
                ExprNode {
                    ty,
                    kind: NodeKind::Cast { exp: Box::new(exp) },
                    span,
                }
            }
            ExprKind::SizeofType(spec) => {
                let ty = self.resolve_type(spec, span)?;
                ExprNode {
                    ty: Ty::int(),
                    kind: NodeKind::IntConst(ty.size(SizeKind::Total, &self.table) as i64),
                    span,
                }
            }
            ExprKind::SizeofExpr(inner) => {
                let exp = self.lower(inner)?;
                ExprNode {
                    ty: Ty::int(),
                    kind: NodeKind::IntConst(exp.ty.size(SizeKind::Total, &self.table) as i64),
                    span,
                }
            }
        };
        Ok(node)
    }

    fn lower_unary(&mut self, op: UnaryOp, inner: &Expr, span: Span) -> Result<ExprNode> {
        let exp = self.lower(inner)?;
        let node = match op {
            UnaryOp::Neg => {
                if exp.ty.is_pointer(&self.table) {
                    return Err(Error::TypeMismatch {
                        line: span.line,
                        col: span.column,
                        message: "negation of a pointer".to_string(),
                    });
                }
                // fold literal negation
                match exp.kind {
                    NodeKind::IntConst(v) => ExprNode {
                        ty: exp.ty,
                        kind: NodeKind::IntConst(-v),
                        span,
                    },
                    NodeKind::FloatConst(v) => ExprNode {
                        ty: exp.ty,
                        kind: NodeKind::FloatConst(-v),
                        span,
                    },
                    _ => ExprNode {
                        ty: exp.ty,
                        kind: NodeKind::Unop {
                            op,
                            exp: Box::new(exp),
                        },
                        span,
                    },
                }
            }
            UnaryOp::BitNot => {
                if exp.ty.is_float(&self.table) || exp.ty.is_pointer(&self.table) {
                    return Err(Error::TypeMismatch {
                        line: span.line,
                        col: span.column,
                        message: "`~` needs an integer operand".to_string(),
                    });
                }
                ExprNode {
                    ty: exp.ty,
                    kind: NodeKind::Unop {
                        op,
                        exp: Box::new(exp),
                    },
                    span,
                }
            }
            UnaryOp::LogNot => ExprNode {
                ty: Ty::int(),
                kind: NodeKind::Unop {
                    op,
                    exp: Box::new(exp),
                },
                span,
            },
            UnaryOp::Deref => {
                let pointee = exp.ty.deref(&self.table).ok_or_else(|| Error::TypeMismatch {
                    line: span.line,
                    col: span.column,
                    message: format!(
                        "dereference of non-pointer {}",
                        exp.ty.describe(&self.table)
                    ),
                })?;
                ExprNode {
                    ty: pointee,
                    kind: NodeKind::Unop {
                        op,
                        exp: Box::new(exp),
                    },
                    span,
                }
            }
            UnaryOp::Addr => ExprNode {
                ty: exp.ty.add_ptr(),
                kind: NodeKind::Unop {
                    op,
                    exp: Box::new(exp),
                },
                span,
            },
            UnaryOp::PreInc | UnaryOp::PreDec => {
                self.check_incrementable(&exp)?;
                ExprNode {
                    ty: exp.ty,
                    kind: NodeKind::Sinop {
                        inc: op == UnaryOp::PreInc,
                        postfix: false,
                        exp: Box::new(exp),
                    },
                    span,
                }
            }
        };
        Ok(node)
    }

    fn lower_member(&mut self, base: ExprNode, field: &str, span: Span) -> Result<ExprNode> {
        let Some(sid) = base.ty.struct_symbol(&self.table).filter(|_| base.ty.ptr() == 0) else {
            return Err(Error::TypeMismatch {
                line: span.line,
                col: span.column,
                message: format!(
                    "member access on non-struct {}",
                    base.ty.describe(&self.table)
                ),
            });
        };
        let Symbol::Struct { members, .. } = self.table.get(sid) else {
            unreachable!("struct_symbol returns struct ids");
        };
        for &m in members {
            if let Symbol::Id(id) = self.table.get(m) {
                if id.name == field {
                    return Ok(ExprNode {
                        ty: id.ty,
                        kind: NodeKind::Member {
                            base: Box::new(base),
                            offset: id.addr as u32,
                        },
                        span,
                    });
                }
            }
        }
        Err(Error::semantic(
            span.line,
            span.column,
            format!("no member named `{}`", field),
        ))
    }

    fn check_incrementable(&self, exp: &ExprNode) -> Result<()> {
        if exp.ty.is_float(&self.table) || exp.ty.is_struct(&self.table) {
            return Err(Error::TypeMismatch {
                line: exp.span.line,
                col: exp.span.column,
                message: "`++`/`--` needs an integer or pointer operand".to_string(),
            });
        }
        Ok(())
    }

    fn check_assignable(&self, lhs: &ExprNode, rhs: &ExprNode, span: Span) -> Result<()> {
        if lhs.ty.is_struct(&self.table) {
            return Err(Error::TypeMismatch {
                line: span.line,
                col: span.column,
                message: "struct assignment is not supported".to_string(),
            });
        }
        let lp = lhs.ty.is_pointer(&self.table);
        let rf = rhs.ty.is_float(&self.table);
        let lf = lhs.ty.is_float(&self.table);
        let rp = rhs.ty.is_pointer(&self.table);
        if (lp && rf) || (lf && rp) {
            return Err(Error::TypeMismatch {
                line: span.line,
                col: span.column,
                message: format!(
                    "cannot assign {} to {}",
                    rhs.ty.describe(&self.table),
                    lhs.ty.describe(&self.table)
                ),
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Emission: typed node → instructions
    // -------------------------------------------------------------------

    fn load_of(&mut self, ty: Ty) -> Result<()> {
        match ty.size(SizeKind::Total, &self.table) {
            1 => self.emit(Opcode::Lb),
            4 => self.emit(Opcode::Lw),
            8 => self.emit(Opcode::Ld),
            _ => {
                return Err(Error::semantic(
                    0,
                    0,
                    format!("cannot load value of type {}", ty.describe(&self.table)),
                ))
            }
        }
        Ok(())
    }

    fn store_of(&mut self, ty: Ty) -> Result<()> {
        match ty.size(SizeKind::Total, &self.table) {
            1 => self.emit(Opcode::Sb),
            4 => self.emit(Opcode::Sw),
            8 => self.emit(Opcode::Sd),
            _ => {
                return Err(Error::semantic(
                    0,
                    0,
                    format!("cannot store value of type {}", ty.describe(&self.table)),
                ))
            }
        }
        Ok(())
    }

    /// Emits the conversion from `from` to `to`, when one is needed
    fn convert(&mut self, from: Ty, to: Ty) {
        let ff = from.is_float(&self.table);
        let tf = to.is_float(&self.table);
        if ff && !tf {
            self.emit(Opcode::F2I);
        } else if !ff && tf {
            self.emit(Opcode::I2F);
        }
    }

    /// Emits the instruction sequence leaving the node's **address** in `ax`
    ///
    /// Fails for non-addressable expressions.
    pub fn gen_lvalue(&mut self, node: &ExprNode) -> Result<()> {
        match &node.kind {
            NodeKind::Id(id) => {
                let (class, addr, name) = match self.table.get(*id) {
                    Symbol::Id(sym) => (Some(sym.class), sym.addr, sym.name.clone()),
                    sym => (None, 0, sym.name().to_string()),
                };
                match class {
                    Some(Storage::Global) => {
                        self.emit1(Opcode::Imm, addr as i32);
                        Ok(())
                    }
                    Some(Storage::Local) | Some(Storage::Param) => {
                        self.emit1(Opcode::Lea, addr as i32);
                        Ok(())
                    }
                    _ => Err(Error::LvalueRequired {
                        line: node.span.line,
                        col: node.span.column,
                        message: format!("`{}` has no address", name),
                    }),
                }
            }
            NodeKind::Unop {
                op: UnaryOp::Deref,
                exp,
            } => self.gen_rvalue(exp),
            NodeKind::Member { base, offset } => {
                self.gen_lvalue(base)?;
                if *offset != 0 {
                    self.emit(Opcode::Push);
                    self.emit1(Opcode::Imm, *offset as i32);
                    self.emit(Opcode::Add);
                }
                Ok(())
            }
            _ => Err(Error::LvalueRequired {
                line: node.span.line,
                col: node.span.column,
                message: "expression is not addressable".to_string(),
            }),
        }
    }

    /// Emits the instruction sequence leaving the node's **value** in `ax`
    ///
    /// For addressable nodes this is exactly [`Codegen::gen_lvalue`]
    /// followed by a load of the type's size.
    pub fn gen_rvalue(&mut self, node: &ExprNode) -> Result<()> {
        match &node.kind {
            NodeKind::IntConst(v) => {
                self.emit_const(*v);
                Ok(())
            }
            NodeKind::FloatConst(v) => {
                let bits = v.to_bits();
                self.emit2(Opcode::Imx, bits as u32, (bits >> 32) as u32);
                Ok(())
            }
            NodeKind::StrConst(addr) => {
                self.emit1(Opcode::Imm, *addr as i32);
                Ok(())
            }
            NodeKind::Id(id) => {
                if matches!(self.table.get(*id), Symbol::Func(_)) {
                    return Err(Error::semantic(
                        node.span.line,
                        node.span.column,
                        "function used as a value",
                    ));
                }
                if node.ty.is_struct(&self.table) {
                    return Err(Error::semantic(
                        node.span.line,
                        node.span.column,
                        "struct value used in a scalar context",
                    ));
                }
                self.gen_lvalue(node)?;
                self.load_of(node.ty)
            }
            NodeKind::Member { .. } => {
                self.gen_lvalue(node)?;
                self.load_of(node.ty)
            }
            NodeKind::Unop { op, exp } => self.gen_unop(node, *op, exp),
            NodeKind::Sinop { inc, postfix, exp } => self.gen_sinop(*inc, *postfix, exp),
            NodeKind::Binop { op, lhs, rhs } => self.gen_binop(*op, lhs, rhs, node.span),
            NodeKind::Assign { op, lhs, rhs } => self.gen_assign(*op, lhs, rhs),
            NodeKind::Triop { cond, then, els } => {
                self.gen_rvalue(cond)?;
                let to_else = self.branch(Opcode::Jz);
                self.gen_rvalue(then)?;
                self.convert(then.ty, node.ty);
                let to_end = self.branch(Opcode::Jmp);
                let else_pc = self.current() as i32;
                self.edit(to_else, else_pc);
                self.gen_rvalue(els)?;
                self.convert(els.ty, node.ty);
                let end = self.current() as i32;
                self.edit(to_end, end);
                Ok(())
            }
            NodeKind::List(nodes) => {
                for n in nodes {
                    self.gen_rvalue(n)?;
                }
                Ok(())
            }
            NodeKind::Call { func, args } => {
                let (entry, params) = match self.table.get(*func) {
                    Symbol::Func(f) => (f.entry, f.params.clone()),
                    _ => unreachable!("call target is always a function symbol"),
                };
                for (k, arg) in args.iter().enumerate() {
                    self.gen_rvalue(arg)?;
                    let pty = match self.table.get(params[k]) {
                        Symbol::Id(p) => Some(p.ty),
                        _ => None,
                    };
                    if let Some(pty) = pty {
                        self.convert(arg.ty, pty);
                    }
                    self.emit(Opcode::Push);
                }
                self.emit1(Opcode::Call, entry as i32);
                if !args.is_empty() {
                    self.emit1(Opcode::Adj, (args.len() as u32 * STACK_SLOT) as i32);
                }
                Ok(())
            }
            NodeKind::Cast { exp } => {
                self.gen_rvalue(exp)?;
                self.convert(exp.ty, node.ty);
                Ok(())
            }
        }
    }

    fn gen_unop(&mut self, node: &ExprNode, op: UnaryOp, exp: &ExprNode) -> Result<()> {
        match op {
            UnaryOp::Neg => {
                self.gen_rvalue(exp)?;
                if exp.ty.is_float(&self.table) {
                    self.emit(Opcode::FNeg);
                } else {
                    self.emit(Opcode::Neg);
                }
                Ok(())
            }
            UnaryOp::BitNot => {
                self.gen_rvalue(exp)?;
                self.emit(Opcode::Not);
                Ok(())
            }
            UnaryOp::LogNot => {
                self.gen_rvalue(exp)?;
                if exp.ty.is_float(&self.table) {
                    self.emit(Opcode::Push);
                    self.emit2(Opcode::Imx, 0, 0);
                    self.emit(Opcode::FEq);
                } else {
                    self.emit(Opcode::LNot);
                }
                Ok(())
            }
            UnaryOp::Deref => {
                if node.ty.is_struct(&self.table) {
                    return Err(Error::semantic(
                        node.span.line,
                        node.span.column,
                        "struct value used in a scalar context",
                    ));
                }
                self.gen_lvalue(node)?;
                self.load_of(node.ty)
            }
            UnaryOp::Addr => self.gen_lvalue(exp),
            UnaryOp::PreInc | UnaryOp::PreDec => {
                unreachable!("prefix ++/-- lowers to Sinop")
            }
        }
    }

    /// Side-effecting `++`/`--`: compute lvalue, duplicate, load,
    /// compute the new value, store, and leave the prefix/postfix result
    fn gen_sinop(&mut self, inc: bool, postfix: bool, exp: &ExprNode) -> Result<()> {
        let step = exp.ty.size(SizeKind::Increment, &self.table).max(1);
        let step = if exp.ty.is_pointer(&self.table) { step } else { 1 };
        self.gen_lvalue(exp)?;
        self.emit(Opcode::Push); // keep the address for the store
        self.load_of(exp.ty)?;
        self.emit(Opcode::Push);
        self.emit1(Opcode::Imm, step as i32);
        self.emit(if inc { Opcode::Add } else { Opcode::Sub });
        self.store_of(exp.ty)?;
        if postfix {
            // undo the step so the old value is the result
            self.emit(Opcode::Push);
            self.emit1(Opcode::Imm, step as i32);
            self.emit(if inc { Opcode::Sub } else { Opcode::Add });
        }
        Ok(())
    }

    fn gen_binop(&mut self, op: BinaryOp, lhs: &ExprNode, rhs: &ExprNode, span: Span) -> Result<()> {
        use BinaryOp::*;

        // Short-circuit forms patch forward over the right operand
        if op == LogAnd {
            self.gen_rvalue(lhs)?;
            let skip = self.branch(Opcode::Jz);
            self.gen_rvalue(rhs)?;
            let end = self.current() as i32;
            self.edit(skip, end);
            return Ok(());
        }
        if op == LogOr {
            self.gen_rvalue(lhs)?;
            let skip = self.branch(Opcode::Jnz);
            self.gen_rvalue(rhs)?;
            let end = self.current() as i32;
            self.edit(skip, end);
            return Ok(());
        }

        let lp = lhs.ty.is_pointer(&self.table);
        let rp = rhs.ty.is_pointer(&self.table);
        let float = !lp && !rp && (lhs.ty.is_float(&self.table) || rhs.ty.is_float(&self.table));

        if float {
            self.gen_rvalue(lhs)?;
            if !lhs.ty.is_float(&self.table) {
                self.emit(Opcode::I2F);
            }
            self.emit(Opcode::Push);
            self.gen_rvalue(rhs)?;
            if !rhs.ty.is_float(&self.table) {
                self.emit(Opcode::I2F);
            }
            let fop = match op {
                Add => Opcode::FAdd,
                Sub => Opcode::FSub,
                Mul => Opcode::FMul,
                Div => Opcode::FDiv,
                Eq => Opcode::FEq,
                Ne => Opcode::FNe,
                Lt => Opcode::FLt,
                Gt => Opcode::FGt,
                Le => Opcode::FLe,
                Ge => Opcode::FGe,
                _ => {
                    return Err(Error::TypeMismatch {
                        line: span.line,
                        col: span.column,
                        message: "operation not defined on floats".to_string(),
                    })
                }
            };
            self.emit(fop);
            return Ok(());
        }

        // pointer - pointer: byte difference divided by the increment
        if lp && rp && op == Sub {
            let inc = lhs.ty.size(SizeKind::Increment, &self.table).max(1);
            self.gen_rvalue(lhs)?;
            self.emit(Opcode::Push);
            self.gen_rvalue(rhs)?;
            self.emit(Opcode::Sub);
            if inc > 1 {
                self.emit(Opcode::Push);
                self.emit1(Opcode::Imm, inc as i32);
                self.emit(Opcode::Div);
            }
            return Ok(());
        }

        // pointer ± integer scales the integer by the increment size
        if lp && !rp && matches!(op, Add | Sub) {
            let inc = lhs.ty.size(SizeKind::Increment, &self.table).max(1);
            self.gen_rvalue(lhs)?;
            self.emit(Opcode::Push);
            self.gen_rvalue(rhs)?;
            if inc > 1 {
                self.emit(Opcode::Push);
                self.emit1(Opcode::Imm, inc as i32);
                self.emit(Opcode::Mul);
            }
            self.emit(if op == Add { Opcode::Add } else { Opcode::Sub });
            return Ok(());
        }
        if rp && !lp && op == Add {
            let inc = rhs.ty.size(SizeKind::Increment, &self.table).max(1);
            self.gen_rvalue(lhs)?;
            if inc > 1 {
                self.emit(Opcode::Push);
                self.emit1(Opcode::Imm, inc as i32);
                self.emit(Opcode::Mul);
            }
            self.emit(Opcode::Push);
            self.gen_rvalue(rhs)?;
            self.emit(Opcode::Add);
            return Ok(());
        }

        self.gen_rvalue(lhs)?;
        self.emit(Opcode::Push);
        self.gen_rvalue(rhs)?;
        let iop = match op {
            Add => Opcode::Add,
            Sub => Opcode::Sub,
            Mul => Opcode::Mul,
            Div => Opcode::Div,
            Mod => Opcode::Mod,
            Shl => Opcode::Shl,
            Shr => Opcode::Shr,
            BitAnd => Opcode::And,
            BitOr => Opcode::Or,
            BitXor => Opcode::Xor,
            Eq => Opcode::Eq,
            Ne => Opcode::Ne,
            Lt => Opcode::Lt,
            Gt => Opcode::Gt,
            Le => Opcode::Le,
            Ge => Opcode::Ge,
            LogAnd | LogOr => unreachable!("short-circuit forms handled above"),
        };
        self.emit(iop);
        Ok(())
    }

    fn gen_assign(
        &mut self,
        op: Option<BinaryOp>,
        lhs: &ExprNode,
        rhs: &ExprNode,
    ) -> Result<()> {
        match op {
            None => {
                self.gen_lvalue(lhs)?;
                self.emit(Opcode::Push);
                self.gen_rvalue(rhs)?;
                self.convert(rhs.ty, lhs.ty);
                self.store_of(lhs.ty)
            }
            Some(op) => {
                use BinaryOp::*;
                self.gen_lvalue(lhs)?;
                self.emit(Opcode::Push); // address stays for the store
                self.load_of(lhs.ty)?;
                let lf = lhs.ty.is_float(&self.table);
                let rf = rhs.ty.is_float(&self.table);
                let float = lf || rf;
                if float && !lf {
                    self.emit(Opcode::I2F);
                }
                self.emit(Opcode::Push);
                self.gen_rvalue(rhs)?;
                if float && !rf {
                    self.emit(Opcode::I2F);
                }
                if lhs.ty.is_pointer(&self.table) && matches!(op, Add | Sub) {
                    let inc = lhs.ty.size(SizeKind::Increment, &self.table).max(1);
                    if inc > 1 {
                        self.emit(Opcode::Push);
                        self.emit1(Opcode::Imm, inc as i32);
                        self.emit(Opcode::Mul);
                    }
                }
                let opcode = if float {
                    match op {
                        Add => Opcode::FAdd,
                        Sub => Opcode::FSub,
                        Mul => Opcode::FMul,
                        Div => Opcode::FDiv,
                        _ => {
                            return Err(Error::TypeMismatch {
                                line: lhs.span.line,
                                col: lhs.span.column,
                                message: "operation not defined on floats".to_string(),
                            })
                        }
                    }
                } else {
                    match op {
                        Add => Opcode::Add,
                        Sub => Opcode::Sub,
                        Mul => Opcode::Mul,
                        Div => Opcode::Div,
                        Mod => Opcode::Mod,
                        Shl => Opcode::Shl,
                        Shr => Opcode::Shr,
                        BitAnd => Opcode::And,
                        BitOr => Opcode::Or,
                        BitXor => Opcode::Xor,
                        _ => unreachable!("parser produces arithmetic compound ops only"),
                    }
                };
                self.emit(opcode);
                if float && !lf {
                    self.emit(Opcode::F2I);
                }
                self.store_of(lhs.ty)
            }
        }
    }

    // -------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------

    fn gen_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Expr(e) => {
                let node = self.lower(e)?;
                self.gen_rvalue(&node)
            }
            Stmt::Decl(decls) => {
                for d in decls {
                    self.gen_local_decl(d)?;
                }
                Ok(())
            }
            Stmt::Block(stmts) => {
                self.table.enter_scope();
                for s in stmts {
                    self.gen_stmt(s)?;
                }
                self.table.exit_scope();
                Ok(())
            }
            Stmt::If { cond, then, els } => {
                let c = self.lower(cond)?;
                self.gen_rvalue(&c)?;
                let to_else = self.branch(Opcode::Jz);
                self.gen_stmt(then)?;
                match els {
                    Some(els) => {
                        let to_end = self.branch(Opcode::Jmp);
                        let else_pc = self.current() as i32;
                        self.edit(to_else, else_pc);
                        self.gen_stmt(els)?;
                        let end = self.current() as i32;
                        self.edit(to_end, end);
                    }
                    None => {
                        let end = self.current() as i32;
                        self.edit(to_else, end);
                    }
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                let top = self.current();
                let c = self.lower(cond)?;
                self.gen_rvalue(&c)?;
                let exit = self.branch(Opcode::Jz);
                self.cycles.push(CycleFrame {
                    is_loop: true,
                    ..CycleFrame::default()
                });
                self.gen_stmt(body)?;
                self.emit1(Opcode::Jmp, top as i32);
                let end = self.current();
                self.edit(exit, end as i32);
                self.close_cycle(end, top);
                Ok(())
            }
            Stmt::DoWhile { body, cond } => {
                let top = self.current();
                self.cycles.push(CycleFrame {
                    is_loop: true,
                    ..CycleFrame::default()
                });
                self.gen_stmt(body)?;
                let test = self.current();
                let c = self.lower(cond)?;
                self.gen_rvalue(&c)?;
                self.emit1(Opcode::Jnz, top as i32);
                let end = self.current();
                self.close_cycle(end, test);
                Ok(())
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    let n = self.lower(init)?;
                    self.gen_rvalue(&n)?;
                }
                let top = self.current();
                let exit = match cond {
                    Some(cond) => {
                        let c = self.lower(cond)?;
                        self.gen_rvalue(&c)?;
                        Some(self.branch(Opcode::Jz))
                    }
                    None => None,
                };
                self.cycles.push(CycleFrame {
                    is_loop: true,
                    ..CycleFrame::default()
                });
                self.gen_stmt(body)?;
                let step_pc = self.current();
                if let Some(step) = step {
                    let n = self.lower(step)?;
                    self.gen_rvalue(&n)?;
                }
                self.emit1(Opcode::Jmp, top as i32);
                let end = self.current();
                if let Some(exit) = exit {
                    self.edit(exit, end as i32);
                }
                self.close_cycle(end, step_pc);
                Ok(())
            }
            Stmt::Switch { value, arms } => self.gen_switch(value, arms),
            Stmt::Break(span) => {
                let slot = self.branch(Opcode::Jmp);
                match self.cycles.last_mut() {
                    Some(frame) => {
                        frame.breaks.push(slot);
                        Ok(())
                    }
                    None => Err(Error::ControlOutsideLoop {
                        keyword: "break".to_string(),
                        line: span.line,
                        col: span.column,
                    }),
                }
            }
            Stmt::Continue(span) => {
                let slot = self.branch(Opcode::Jmp);
                match self.cycles.iter_mut().rev().find(|f| f.is_loop) {
                    Some(frame) => {
                        frame.continues.push(slot);
                        Ok(())
                    }
                    None => Err(Error::ControlOutsideLoop {
                        keyword: "continue".to_string(),
                        line: span.line,
                        col: span.column,
                    }),
                }
            }
            Stmt::Return(value, span) => {
                let ret_ty = match self.current_fn.map(|fid| self.table.get(fid)) {
                    Some(Symbol::Func(f)) => f.ret,
                    _ => Ty::int(),
                };
                match value {
                    Some(e) => {
                        let n = self.lower(e)?;
                        if ret_ty == (Ty::Base { prim: Prim::Void, ptr: 0 }) {
                            return Err(Error::TypeMismatch {
                                line: span.line,
                                col: span.column,
                                message: "return with a value in a void function".to_string(),
                            });
                        }
                        if (n.ty.is_float(&self.table) && ret_ty.is_pointer(&self.table))
                            || (n.ty.is_pointer(&self.table) && ret_ty.is_float(&self.table))
                        {
                            return Err(Error::TypeMismatch {
                                line: span.line,
                                col: span.column,
                                message: format!(
                                    "cannot return {} from a function returning {}",
                                    n.ty.describe(&self.table),
                                    ret_ty.describe(&self.table)
                                ),
                            });
                        }
                        self.gen_rvalue(&n)?;
                        self.convert(n.ty, ret_ty);
                    }
                    None => {}
                }
                self.emit(Opcode::Lev);
                Ok(())
            }
            Stmt::Interrupt(num, _) => {
                self.emit1(Opcode::Intr, *num as i32);
                Ok(())
            }
        }
    }

    fn close_cycle(&mut self, break_target: usize, continue_target: usize) {
        let frame = self.cycles.pop().expect("cycle frame pushed by caller");
        for slot in frame.breaks {
            self.edit(slot, break_target as i32);
        }
        for slot in frame.continues {
            self.edit(slot, continue_target as i32);
        }
    }

    /// Switch lowering: the scrutinee is stored in a hidden frame slot,
    /// then a compare chain dispatches into sequential bodies with C
    /// fall-through. `break` exits through the cycle frame.
    fn gen_switch(&mut self, value: &Expr, arms: &[crate::parser::ast::SwitchArm]) -> Result<()> {
        let scrutinee = self.lower(value)?;
        let slot_ty = Ty::Base {
            prim: Prim::Long,
            ptr: 0,
        };
        let slot = self.alloc_local(8, 8);
        self.emit1(Opcode::Lea, slot as i32);
        self.emit(Opcode::Push);
        self.gen_rvalue(&scrutinee)?;
        self.store_of(slot_ty)?;

        // dispatch chain
        let mut arm_jumps = Vec::with_capacity(arms.len());
        let mut default_jump = None;
        for arm in arms {
            match &arm.value {
                Some(expr) => {
                    let case = self.const_eval(expr)?;
                    self.emit1(Opcode::Lea, slot as i32);
                    self.emit(Opcode::Ld);
                    self.emit(Opcode::Push);
                    self.emit_const(case);
                    self.emit(Opcode::Eq);
                    arm_jumps.push(Some(self.branch(Opcode::Jnz)));
                }
                None => {
                    arm_jumps.push(None);
                    default_jump = Some(());
                }
            }
        }
        let fallthrough = self.branch(Opcode::Jmp); // to default, or past the switch

        self.cycles.push(CycleFrame {
            is_loop: false,
            ..CycleFrame::default()
        });
        let mut default_pc = None;
        for (arm, jump) in arms.iter().zip(&arm_jumps) {
            let pc = self.current();
            match jump {
                Some(slot) => self.edit(*slot, pc as i32),
                None => default_pc = Some(pc),
            }
            self.table.enter_scope();
            for s in &arm.body {
                self.gen_stmt(s)?;
            }
            self.table.exit_scope();
        }
        let end = self.current();
        match (default_jump, default_pc) {
            (Some(()), Some(pc)) => self.edit(fallthrough, pc as i32),
            _ => self.edit(fallthrough, end as i32),
        }
        self.close_cycle(end, 0);
        Ok(())
    }

    fn gen_local_decl(&mut self, d: &Decl) -> Result<()> {
        let ty = self.resolve_type(&d.ty, d.span)?;
        let size = ty.size(SizeKind::Total, &self.table);
        if size == 0 {
            return Err(self.error(d.span, format!("variable `{}` has incomplete type", d.name)));
        }
        let align = ty.align(&self.table);
        let addr = self.alloc_local(size, align);
        let id = self.table.declare(
            Symbol::Id(IdSymbol {
                name: d.name.clone(),
                ty,
                class: Storage::Local,
                addr,
                addr_end: addr + size as i64,
                span: d.span,
            }),
            d.span,
        )?;
        if let Some(init) = &d.init {
            if ty.is_struct(&self.table) {
                return Err(Error::semantic(
                    d.span.line,
                    d.span.column,
                    "struct initializers are not supported",
                ));
            }
            let rhs = self.lower(init)?;
            let lhs = ExprNode {
                ty,
                kind: NodeKind::Id(id),
                span: d.span,
            };
            self.check_assignable(&lhs, &rhs, d.span)?;
            self.gen_assign(None, &lhs, &rhs)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Items
    // -------------------------------------------------------------------

    fn gen_item(&mut self, item: &Item) -> Result<()> {
        match item {
            Item::Function(f) => self.gen_function(f),
            Item::Globals(decls) => {
                for d in decls {
                    self.gen_global_decl(d)?;
                }
                Ok(())
            }
            Item::StructDef {
                name,
                members,
                span,
            } => {
                let mut ids = Vec::with_capacity(members.len());
                for m in members {
                    let ty = self.resolve_type(&m.ty, m.span)?;
                    ids.push(self.table.alloc(Symbol::Id(IdSymbol {
                        name: m.name.clone(),
                        ty,
                        class: Storage::Member,
                        addr: 0,
                        addr_end: 0,
                        span: m.span,
                    })));
                }
                let size = self.table.layout_struct(&ids);
                self.table.declare(
                    Symbol::Struct {
                        name: name.clone(),
                        members: ids,
                        size,
                    },
                    *span,
                )?;
                Ok(())
            }
            Item::EnumDef { variants, .. } => {
                let mut next = 0i64;
                for (name, value, span) in variants {
                    let v = match value {
                        Some(e) => self.const_eval(e)?,
                        None => next,
                    };
                    next = v + 1;
                    self.table.declare(
                        Symbol::Id(IdSymbol {
                            name: name.clone(),
                            ty: Ty::int(),
                            class: Storage::EnumConst,
                            addr: v,
                            addr_end: v,
                            span: *span,
                        }),
                        *span,
                    )?;
                }
                Ok(())
            }
            Item::Typedef { ty, name, span } => {
                let target = self.resolve_type(ty, *span)?;
                self.table.declare(
                    Symbol::Typedef {
                        name: name.clone(),
                        ty: target,
                    },
                    *span,
                )?;
                Ok(())
            }
        }
    }

    fn gen_global_decl(&mut self, d: &Decl) -> Result<()> {
        let ty = self.resolve_type(&d.ty, d.span)?;
        let size = ty.size(SizeKind::Total, &self.table);
        if size == 0 {
            return Err(self.error(d.span, format!("variable `{}` has incomplete type", d.name)));
        }
        let addr = self.alloc_global(size, ty.align(&self.table));
        if let Some(init) = &d.init {
            self.write_global_init(ty, addr, init)?;
        }
        self.table.declare(
            Symbol::Id(IdSymbol {
                name: d.name.clone(),
                ty,
                class: Storage::Global,
                addr: addr as i64,
                addr_end: addr as i64 + size as i64,
                span: d.span,
            }),
            d.span,
        )?;
        Ok(())
    }

    /// Globals initialize from constants resolved at compile time
    fn write_global_init(&mut self, ty: Ty, addr: u32, init: &Expr) -> Result<()> {
        let off = (addr & SEGMENT_MASK) as usize;
        if ty.is_float(&self.table) {
            let value = match &init.kind {
                ExprKind::Float(f) => *f,
                _ => self.const_eval(init)? as f64,
            };
            self.data[off..off + 8].copy_from_slice(&value.to_bits().to_le_bytes());
            return Ok(());
        }
        if let ExprKind::Str(s) = &init.kind {
            if ty.is_pointer(&self.table) {
                let str_addr = self.load_string(s);
                self.data[off..off + 4].copy_from_slice(&str_addr.to_le_bytes());
                return Ok(());
            }
        }
        let value = self.const_eval(init)?;
        match ty.size(SizeKind::Total, &self.table) {
            1 => self.data[off] = value as u8,
            4 => self.data[off..off + 4].copy_from_slice(&(value as u32).to_le_bytes()),
            8 => self.data[off..off + 8].copy_from_slice(&(value as u64).to_le_bytes()),
            _ => {
                return Err(Error::semantic(
                    init.span.line,
                    init.span.column,
                    "initializer does not fit the declared type",
                ))
            }
        }
        Ok(())
    }

    /// Function scoping: a scope is pushed for the parameters and body,
    /// and the frame-reserve immediate is back-patched once the body's
    /// local extent is known
    fn gen_function(&mut self, f: &Function) -> Result<()> {
        let ret = self.resolve_type(&f.ret, f.span)?;
        let entry = self.current() as u32;
        let fid = self.table.declare(
            Symbol::Func(FuncSymbol {
                name: f.name.clone(),
                ret,
                params: Vec::new(),
                entry,
                frame: 0,
            }),
            f.span,
        )?;

        self.table.enter_scope();
        let n = f.params.len();
        let mut param_ids = Vec::with_capacity(n);
        for (k, p) in f.params.iter().enumerate() {
            let ty = self.resolve_type(&p.ty, p.span)?;
            if ty.is_struct(&self.table) {
                return Err(Error::semantic(
                    p.span.line,
                    p.span.column,
                    "struct parameters are not supported",
                ));
            }
            // caller pushes left to right; the first argument sits highest
            let addr = (STACK_SLOT as i64) * (n as i64 + 1 - k as i64);
            param_ids.push(self.table.declare(
                Symbol::Id(IdSymbol {
                    name: p.name.clone(),
                    ty,
                    class: Storage::Param,
                    addr,
                    addr_end: addr + STACK_SLOT as i64,
                    span: p.span,
                }),
                p.span,
            )?);
        }
        if let Symbol::Func(fun) = self.table.get_mut(fid) {
            fun.params = param_ids;
        }

        self.emit1(Opcode::Ent, 0);
        let ent_slot = self.current() - 1;
        self.local_offset = 0;
        self.current_fn = Some(fid);

        for s in &f.body {
            self.gen_stmt(s)?;
        }
        // fall-off-the-end keeps the last expression value in ax, the
        // convention the runtime library's wrappers rely on
        self.emit(Opcode::Lev);

        let frame = align_up(self.local_offset, STACK_SLOT);
        self.edit(ent_slot, frame as i32);
        if let Symbol::Func(fun) = self.table.get_mut(fid) {
            fun.frame = frame;
        }
        self.table.exit_scope();
        self.current_fn = None;
        Ok(())
    }
}
