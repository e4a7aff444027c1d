//! Typed symbol model built during code generation
//!
//! Symbols live in one arena; scopes are maps from names into it, kept
//! as a stack with the innermost scope last. Typedefs refer to their
//! target by arena index, never by owning reference, so alias chains
//! cannot form ownership cycles. Each type reports a byte size and an
//! increment size; the latter drives pointer arithmetic.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::parser::ast::{BinaryOp, Span};

/// Index of a symbol in the arena
pub type SymbolId = usize;

/// Primitive type kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    /// 1-byte character
    Char,
    /// 4-byte integer (also the enum representation)
    Int,
    /// 8-byte integer
    Long,
    /// 8-byte float; `float` and `double` share the canonical format
    Double,
    /// No value
    Void,
}

impl Prim {
    /// Byte size of the primitive
    pub fn size(self) -> u32 {
        match self {
            Prim::Char => 1,
            Prim::Int => 4,
            Prim::Long => 8,
            Prim::Double => 8,
            Prim::Void => 0,
        }
    }
}

/// Size request: total byte size or pointer-increment size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeKind {
    /// Total size in bytes
    Total,
    /// Step applied by pointer arithmetic and `++` on pointers
    Increment,
}

/// A type: a primitive or named base with a pointer indirection count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    /// Base type with indirection
    Base {
        /// Primitive kind
        prim: Prim,
        /// Levels of pointer indirection
        ptr: u8,
    },
    /// Reference to a struct or typedef symbol, with indirection
    Named {
        /// Arena index of the referenced symbol (weak)
        symbol: SymbolId,
        /// Levels of pointer indirection
        ptr: u8,
    },
}

/// Pointer size in the 32-bit virtual address space
pub const PTR_SIZE: u32 = 4;

impl Ty {
    /// Plain `int`
    pub fn int() -> Ty {
        Ty::Base {
            prim: Prim::Int,
            ptr: 0,
        }
    }

    /// Plain `char`
    pub fn ch() -> Ty {
        Ty::Base {
            prim: Prim::Char,
            ptr: 0,
        }
    }

    /// `char *`
    pub fn char_ptr() -> Ty {
        Ty::Base {
            prim: Prim::Char,
            ptr: 1,
        }
    }

    /// Indirection count of this type
    pub fn ptr(&self) -> u8 {
        match *self {
            Ty::Base { ptr, .. } | Ty::Named { ptr, .. } => ptr,
        }
    }

    /// True if this is a pointer after resolving aliases
    pub fn is_pointer(&self, table: &SymbolTable) -> bool {
        if self.ptr() > 0 {
            return true;
        }
        match *self {
            Ty::Named { symbol, .. } => match table.get(symbol) {
                Symbol::Typedef { ty, .. } => ty.is_pointer(table),
                _ => false,
            },
            _ => false,
        }
    }

    /// True if the resolved type is the floating primitive (no indirection)
    pub fn is_float(&self, table: &SymbolTable) -> bool {
        if self.ptr() > 0 {
            return false;
        }
        match *self {
            Ty::Base { prim, .. } => prim == Prim::Double,
            Ty::Named { symbol, .. } => match table.get(symbol) {
                Symbol::Typedef { ty, .. } => ty.is_float(table),
                _ => false,
            },
        }
    }

    /// True if the resolved type is a bare struct (no indirection)
    pub fn is_struct(&self, table: &SymbolTable) -> bool {
        self.struct_symbol(table).is_some() && self.ptr() == 0
    }

    /// The struct symbol behind this type, through any alias chain
    pub fn struct_symbol(&self, table: &SymbolTable) -> Option<SymbolId> {
        match *self {
            Ty::Named { symbol, ptr } => match table.get(symbol) {
                Symbol::Struct { .. } => Some(symbol),
                Symbol::Typedef { ty, .. } if ptr == 0 => ty.struct_symbol(table),
                _ => None,
            },
            _ => None,
        }
    }

    /// Byte size or increment size of the type
    ///
    /// A pointer is `PTR_SIZE` bytes; its increment is the size of the
    /// pointee. Typedefs are resolved lazily through the arena.
    pub fn size(&self, kind: SizeKind, table: &SymbolTable) -> u32 {
        match *self {
            Ty::Base { prim, ptr } => match (kind, ptr) {
                (SizeKind::Total, 0) => prim.size(),
                (SizeKind::Total, _) => PTR_SIZE,
                (SizeKind::Increment, 0) => prim.size(),
                (SizeKind::Increment, 1) => prim.size().max(1),
                (SizeKind::Increment, _) => PTR_SIZE,
            },
            Ty::Named { symbol, ptr } => {
                let inner = match table.get(symbol) {
                    Symbol::Struct { size, .. } => *size,
                    Symbol::Typedef { ty, .. } => ty.size(SizeKind::Total, table),
                    _ => 0,
                };
                match (kind, ptr) {
                    (SizeKind::Total, 0) => inner,
                    (SizeKind::Total, _) => PTR_SIZE,
                    (SizeKind::Increment, 0) => inner,
                    (SizeKind::Increment, 1) => inner.max(1),
                    (SizeKind::Increment, _) => PTR_SIZE,
                }
            }
        }
    }

    /// Natural alignment of the type
    pub fn align(&self, table: &SymbolTable) -> u32 {
        if self.ptr() > 0 {
            return PTR_SIZE;
        }
        match *self {
            Ty::Base { prim, .. } => prim.size().max(1),
            Ty::Named { symbol, .. } => match table.get(symbol) {
                Symbol::Struct { members, .. } => {
                    let mut a = 1;
                    for &m in members {
                        if let Symbol::Id(id) = table.get(m) {
                            a = a.max(id.ty.align(table));
                        }
                    }
                    a
                }
                Symbol::Typedef { ty, .. } => ty.align(table),
                _ => 1,
            },
        }
    }

    /// The type with one more level of indirection
    pub fn add_ptr(&self) -> Ty {
        match *self {
            Ty::Base { prim, ptr } => Ty::Base { prim, ptr: ptr + 1 },
            Ty::Named { symbol, ptr } => Ty::Named {
                symbol,
                ptr: ptr + 1,
            },
        }
    }

    /// The pointee type, or `None` for non-pointers
    pub fn deref(&self, table: &SymbolTable) -> Option<Ty> {
        match *self {
            Ty::Base { prim, ptr } if ptr > 0 => Some(Ty::Base { prim, ptr: ptr - 1 }),
            Ty::Named { symbol, ptr } if ptr > 0 => Some(Ty::Named {
                symbol,
                ptr: ptr - 1,
            }),
            Ty::Named { symbol, ptr: 0 } => match table.get(symbol) {
                Symbol::Typedef { ty, .. } => ty.deref(table),
                _ => None,
            },
            _ => None,
        }
    }

    /// Human-readable type name for diagnostics
    pub fn describe(&self, table: &SymbolTable) -> String {
        let (base, ptr) = match *self {
            Ty::Base { prim, ptr } => (
                match prim {
                    Prim::Char => "char".to_string(),
                    Prim::Int => "int".to_string(),
                    Prim::Long => "long".to_string(),
                    Prim::Double => "double".to_string(),
                    Prim::Void => "void".to_string(),
                },
                ptr,
            ),
            Ty::Named { symbol, ptr } => (table.get(symbol).name().to_string(), ptr),
        };
        format!("{}{}", base, "*".repeat(ptr as usize))
    }
}

/// Storage class of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Lives in the data segment at an absolute address
    Global,
    /// Frame-relative, negative offset from `bp`
    Local,
    /// Frame-relative, positive offset from `bp`
    Param,
    /// Offset within its struct
    Member,
    /// Enumerator folded to a constant
    EnumConst,
}

/// A named non-function entity
#[derive(Debug, Clone)]
pub struct IdSymbol {
    /// Declared name
    pub name: String,
    /// Declared type
    pub ty: Ty,
    /// Storage class
    pub class: Storage,
    /// Address: absolute data address, signed frame offset, member
    /// offset, or enumerator value depending on `class`
    pub addr: i64,
    /// End of the address range (`addr + size`)
    pub addr_end: i64,
    /// Declaration position
    pub span: Span,
}

/// A function symbol
#[derive(Debug, Clone)]
pub struct FuncSymbol {
    /// Function name
    pub name: String,
    /// Return type
    pub ret: Ty,
    /// Parameter symbols in declaration order
    pub params: Vec<SymbolId>,
    /// Word offset of the first emitted instruction
    pub entry: u32,
    /// Total local-frame extent in bytes (back-patched on close)
    pub frame: u32,
}

/// Arena entry
#[derive(Debug, Clone)]
pub enum Symbol {
    /// Variable, parameter, member, or enumerator
    Id(IdSymbol),
    /// Function
    Func(FuncSymbol),
    /// Struct definition: members and computed layout size
    Struct {
        /// Struct tag
        name: String,
        /// Member symbols in layout order
        members: Vec<SymbolId>,
        /// Total size with natural alignment applied
        size: u32,
    },
    /// Type alias; the target is held by value, members by index
    Typedef {
        /// Alias name
        name: String,
        /// Aliased type (may itself name another symbol by index)
        ty: Ty,
    },
}

impl Symbol {
    /// The symbol's declared name
    pub fn name(&self) -> &str {
        match self {
            Symbol::Id(id) => &id.name,
            Symbol::Func(f) => &f.name,
            Symbol::Struct { name, .. } => name,
            Symbol::Typedef { name, .. } => name,
        }
    }
}

/// Arena plus scope stack
///
/// Declarations insert into the innermost scope; lookups walk from the
/// innermost scope outward.
#[derive(Debug)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    scopes: Vec<HashMap<String, SymbolId>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Creates a table with the global scope open
    pub fn new() -> Self {
        SymbolTable {
            symbols: Vec::new(),
            scopes: vec![HashMap::new()],
        }
    }

    /// Opens a nested scope
    pub fn enter_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Closes the innermost scope; the global scope stays open
    pub fn exit_scope(&mut self) {
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Current scope depth (1 for the global scope alone)
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Adds a symbol to the arena without binding a name
    pub fn alloc(&mut self, sym: Symbol) -> SymbolId {
        self.symbols.push(sym);
        self.symbols.len() - 1
    }

    /// Declares a symbol in the innermost scope
    ///
    /// Fails if the name is already bound in that scope; shadowing an
    /// outer binding is allowed.
    pub fn declare(&mut self, sym: Symbol, span: Span) -> Result<SymbolId> {
        let name = sym.name().to_string();
        let top = self.scopes.last_mut().expect("scope stack never empty");
        if top.contains_key(&name) {
            return Err(Error::DuplicateDeclaration {
                name,
                line: span.line,
                col: span.column,
            });
        }
        self.symbols.push(sym);
        let id = self.symbols.len() - 1;
        self.scopes.last_mut().unwrap().insert(name, id);
        Ok(id)
    }

    /// Resolves a name to the innermost visible binding
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&id) = scope.get(name) {
                return Some(id);
            }
        }
        None
    }

    /// Borrows a symbol by index
    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    /// Mutably borrows a symbol by index
    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    /// Lays out a struct: sequential members with natural alignment
    ///
    /// Returns the total size; member symbols receive their offsets.
    pub fn layout_struct(&mut self, members: &[SymbolId]) -> u32 {
        let mut offset = 0u32;
        for &m in members {
            let (size, align) = match self.get(m) {
                Symbol::Id(id) => (
                    id.ty.size(SizeKind::Total, self),
                    id.ty.align(self),
                ),
                _ => (0, 1),
            };
            offset = align_up(offset, align);
            if let Symbol::Id(id) = self.get_mut(m) {
                id.addr = offset as i64;
                id.addr_end = (offset + size) as i64;
            }
            offset += size;
        }
        offset
    }
}

/// Rounds `n` up to a multiple of `align`
pub fn align_up(n: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    (n + align - 1) / align * align
}

/// A typed expression node produced by lowering the AST
///
/// Every node knows its result type; the generator emits either its
/// lvalue (address) or rvalue (value) form. Non-addressable nodes
/// reject lvalue emission.
#[derive(Debug, Clone)]
pub struct ExprNode {
    /// Result type of the expression
    pub ty: Ty,
    /// Node shape
    pub kind: NodeKind,
    /// Source position for diagnostics
    pub span: Span,
}

/// Shapes of typed expression nodes
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Integer constant (literals, folded enumerators, `sizeof`)
    IntConst(i64),
    /// Floating constant
    FloatConst(f64),
    /// Interned string; the data-segment address of its first byte
    StrConst(u32),
    /// Reference to a declared identifier
    Id(SymbolId),
    /// Unary operation without side effects
    Unop {
        /// Operator
        op: crate::parser::ast::UnaryOp,
        /// Operand
        exp: Box<ExprNode>,
    },
    /// Side-effecting `++`/`--`, prefix or postfix
    Sinop {
        /// True for `++`, false for `--`
        inc: bool,
        /// True when the old value is the result
        postfix: bool,
        /// Operand (must be an lvalue)
        exp: Box<ExprNode>,
    },
    /// Binary operation
    Binop {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<ExprNode>,
        /// Right operand
        rhs: Box<ExprNode>,
    },
    /// Assignment; `Some(op)` for compound forms
    Assign {
        /// Compound operator, if any
        op: Option<BinaryOp>,
        /// Destination (must be an lvalue)
        lhs: Box<ExprNode>,
        /// Source value
        rhs: Box<ExprNode>,
    },
    /// Conditional expression
    Triop {
        /// Condition
        cond: Box<ExprNode>,
        /// Value when non-zero
        then: Box<ExprNode>,
        /// Value when zero
        els: Box<ExprNode>,
    },
    /// Comma list, evaluated left to right
    List(Vec<ExprNode>),
    /// Call of a named function
    Call {
        /// Callee symbol
        func: SymbolId,
        /// Arguments in push order
        args: Vec<ExprNode>,
    },
    /// Conversion to the node's type
    Cast {
        /// Operand
        exp: Box<ExprNode>,
    },
    /// Struct member: address of `base` plus a fixed offset
    Member {
        /// Aggregate (emitted as lvalue)
        base: Box<ExprNode>,
        /// Byte offset of the member
        offset: u32,
    },
}

/// Usual arithmetic conversion for a binary operation
///
/// Pointers absorb integers (the generator scales by the increment
/// size); mixing with the floating primitive widens both sides; two
/// integers widen to the larger.
pub fn arith_result(op: BinaryOp, lhs: Ty, rhs: Ty, table: &SymbolTable) -> Option<Ty> {
    use BinaryOp::*;
    let cmp = matches!(op, Eq | Ne | Lt | Gt | Le | Ge | LogAnd | LogOr);
    let lp = lhs.is_pointer(table);
    let rp = rhs.is_pointer(table);
    if cmp {
        return Some(Ty::int());
    }
    match (lp, rp) {
        (true, true) => {
            // pointer - pointer divides by increment size
            if op == Sub {
                Some(Ty::int())
            } else {
                None
            }
        }
        (true, false) => {
            if matches!(op, Add | Sub) && !rhs.is_float(table) {
                Some(lhs)
            } else {
                None
            }
        }
        (false, true) => {
            if op == Add && !lhs.is_float(table) {
                Some(rhs)
            } else {
                None
            }
        }
        (false, false) => {
            if lhs.is_float(table) || rhs.is_float(table) {
                if matches!(op, Add | Sub | Mul | Div) {
                    Some(Ty::Base {
                        prim: Prim::Double,
                        ptr: 0,
                    })
                } else {
                    None
                }
            } else {
                // both integral: widen to the larger operand
                let ls = lhs.size(SizeKind::Total, table);
                let rs = rhs.size(SizeKind::Total, table);
                Some(if ls.max(rs) > 4 {
                    Ty::Base {
                        prim: Prim::Long,
                        ptr: 0,
                    }
                } else {
                    Ty::int()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span::new(1, 1)
    }

    #[test]
    fn test_prim_sizes() {
        assert_eq!(Ty::ch().size(SizeKind::Total, &SymbolTable::new()), 1);
        assert_eq!(Ty::int().size(SizeKind::Total, &SymbolTable::new()), 4);
        let d = Ty::Base {
            prim: Prim::Double,
            ptr: 0,
        };
        assert_eq!(d.size(SizeKind::Total, &SymbolTable::new()), 8);
    }

    #[test]
    fn test_pointer_size_and_increment() {
        let table = SymbolTable::new();
        let p = Ty::Base {
            prim: Prim::Int,
            ptr: 1,
        };
        assert_eq!(p.size(SizeKind::Total, &table), PTR_SIZE);
        assert_eq!(p.size(SizeKind::Increment, &table), 4);
        let pp = p.add_ptr();
        assert_eq!(pp.size(SizeKind::Increment, &table), PTR_SIZE);
        assert_eq!(Ty::char_ptr().size(SizeKind::Increment, &table), 1);
    }

    #[test]
    fn test_scope_shadowing() {
        let mut table = SymbolTable::new();
        let outer = table
            .declare(
                Symbol::Id(IdSymbol {
                    name: "x".into(),
                    ty: Ty::int(),
                    class: Storage::Global,
                    addr: 0,
                    addr_end: 4,
                    span: span(),
                }),
                span(),
            )
            .unwrap();
        table.enter_scope();
        let inner = table
            .declare(
                Symbol::Id(IdSymbol {
                    name: "x".into(),
                    ty: Ty::ch(),
                    class: Storage::Local,
                    addr: -8,
                    addr_end: -7,
                    span: span(),
                }),
                span(),
            )
            .unwrap();
        assert_eq!(table.lookup("x"), Some(inner));
        table.exit_scope();
        assert_eq!(table.lookup("x"), Some(outer));
    }

    #[test]
    fn test_duplicate_in_same_scope() {
        let mut table = SymbolTable::new();
        let sym = || {
            Symbol::Typedef {
                name: "word".into(),
                ty: Ty::int(),
            }
        };
        table.declare(sym(), span()).unwrap();
        assert!(matches!(
            table.declare(sym(), span()),
            Err(Error::DuplicateDeclaration { .. })
        ));
    }

    #[test]
    fn test_typedef_resolves_lazily() {
        let mut table = SymbolTable::new();
        let alias = table
            .declare(
                Symbol::Typedef {
                    name: "addr_t".into(),
                    ty: Ty::char_ptr(),
                },
                span(),
            )
            .unwrap();
        let named = Ty::Named {
            symbol: alias,
            ptr: 0,
        };
        assert!(named.is_pointer(&table));
        assert_eq!(named.size(SizeKind::Total, &table), PTR_SIZE);
        assert_eq!(named.size(SizeKind::Increment, &table), 1);
    }

    #[test]
    fn test_struct_layout_natural_alignment() {
        let mut table = SymbolTable::new();
        let mk = |table: &mut SymbolTable, name: &str, ty: Ty| {
            table.alloc(Symbol::Id(IdSymbol {
                name: name.into(),
                ty,
                class: Storage::Member,
                addr: 0,
                addr_end: 0,
                span: span(),
            }))
        };
        let a = mk(&mut table, "a", Ty::ch());
        let b = mk(&mut table, "b", Ty::int());
        let c = mk(&mut table, "c", Ty::ch());
        let size = table.layout_struct(&[a, b, c]);
        // char at 0, int aligned to 4, trailing char at 8
        let Symbol::Id(bid) = table.get(b) else {
            panic!()
        };
        assert_eq!(bid.addr, 4);
        assert_eq!(size, 9);
    }

    #[test]
    fn test_arith_conversion() {
        let table = SymbolTable::new();
        let ip = Ty::Base {
            prim: Prim::Int,
            ptr: 1,
        };
        // pointer + int keeps the pointer type
        assert_eq!(
            arith_result(BinaryOp::Add, ip, Ty::int(), &table),
            Some(ip)
        );
        // pointer - pointer is an int
        assert_eq!(arith_result(BinaryOp::Sub, ip, ip, &table), Some(Ty::int()));
        // pointer * pointer is rejected
        assert_eq!(arith_result(BinaryOp::Mul, ip, ip, &table), None);
        // int + double widens
        let d = Ty::Base {
            prim: Prim::Double,
            ptr: 0,
        };
        assert!(arith_result(BinaryOp::Add, Ty::int(), d, &table)
            .unwrap()
            .is_float(&table));
    }
}
