// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Syntax tables.
//!
//! The AST is not a pointer graph: expressions are fixed-width records in an
//! append-only table, referencing each other and variadic payloads (argument
//! lists, block statements, field lists) through a shared extra-word table.
//! Functions, constants, and call sites live in tables of their own with
//! hard capacities; exceeding any of them is fatal for the compile.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::arena::Span;
use crate::diag::{Diagnostic, Pos};
use crate::interp::Value;
use crate::types::TypeId;

/// Maximum number of functions, including specialization clones.
pub const FUNCTION_CAPACITY: usize = 1024;

/// Maximum number of constants (including `type` aliases).
pub const CONSTANT_CAPACITY: usize = 1024;

/// Maximum number of expression records per compile.
pub const EXPR_CAPACITY: usize = 65_536;

/// Maximum number of extra payload words per compile.
pub const EXTRA_CAPACITY: usize = 131_072;

/// Maximum number of call-site records per compile.
pub const CALL_CAPACITY: usize = 8_192;

/// Sentinel for "no expression" / "no payload" words.
pub(crate) const NONE: u32 = u32::MAX;

/// Index of an expression record.
pub(crate) type ExprId = u32;

/// Index into the function table.
pub(crate) type FuncId = u32;

/// Index into the module snapshot.
pub(crate) type ModuleId = u32;

/// A (start, len) window into the extra-word table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct ExtraRange {
    pub start: u32,
    pub len: u32,
}

/// Expression kinds. The tag dictates how the three payload words are read;
/// the per-kind layouts are documented on [`Expr`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum ExprKind {
    IntLiteral,
    BoolLiteral,
    StringLiteral,
    CharLiteral,
    Ident,
    Binary,
    Unary,
    Call,
    ArrayRepeat,
    ArrayList,
    TupleLiteral,
    StructLiteral,
    StructTypeExpr,
    FnTypeExpr,
    Index,
    Field,
    Cast,
    If,
    Loop,
    While,
    Break,
    Continue,
    Return,
    Block,
    Let,
    Assign,
    AnonFn,
    /// A compile-time value spliced in by the specializer.
    ConstValue,
}

/// Binary operators, in no particular order; precedence is the parser's
/// concern.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinaryOp {
    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub(crate) fn is_logical(self) -> bool {
        matches!(self, BinaryOp::Or | BinaryOp::And)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

/// What an identifier resolved to, cached in the expression's aux word.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Resolution {
    Local(u32),
    Constant(u32),
    Function(FuncId),
    BuiltinLen,
    BuiltinInlineWasm,
}

impl Resolution {
    const TAG_SHIFT: u32 = 28;

    pub(crate) fn encode(self) -> u32 {
        match self {
            Resolution::Local(slot) => (1 << Self::TAG_SHIFT) | slot,
            Resolution::Constant(index) => (2 << Self::TAG_SHIFT) | index,
            Resolution::Function(index) => (3 << Self::TAG_SHIFT) | index,
            Resolution::BuiltinLen => 4 << Self::TAG_SHIFT,
            Resolution::BuiltinInlineWasm => 5 << Self::TAG_SHIFT,
        }
    }

    pub(crate) fn decode(word: u32) -> Option<Resolution> {
        let payload = word & ((1 << Self::TAG_SHIFT) - 1);
        match word >> Self::TAG_SHIFT {
            1 => Some(Resolution::Local(payload)),
            2 => Some(Resolution::Constant(payload)),
            3 => Some(Resolution::Function(payload)),
            4 => Some(Resolution::BuiltinLen),
            5 => Some(Resolution::BuiltinInlineWasm),
            _ => None,
        }
    }
}

/// A fixed-width expression record.
///
/// Payload words by kind:
///
/// | kind | a | b | c |
/// |---|---|---|---|
/// | `IntLiteral` | value low word | value high word | suffix [`Prim`](crate::types::Prim) or [`NONE`] |
/// | `BoolLiteral` | 0 or 1 | | |
/// | `StringLiteral` | string-pool start | byte length | |
/// | `CharLiteral` | byte value | | |
/// | `Ident` | name ptr | name len | |
/// | `Binary` | [`BinaryOp`] | lhs | rhs |
/// | `Unary` | [`UnaryOp`] | operand | |
/// | `Call` | callee | call-table index | |
/// | `ArrayRepeat` | element | length expr | |
/// | `ArrayList` / `TupleLiteral` | extra start | extra len | |
/// | `StructLiteral` | type expr | extra start | field count |
/// | `StructTypeExpr` | extra start | field count | |
/// | `FnTypeExpr` | extra start | extra len | result expr or [`NONE`] |
/// | `Index` | base | index | |
/// | `Field` | base | name ptr | name len |
/// | `Cast` | operand | type expr | |
/// | `If` | condition | then block | else expr or [`NONE`] |
/// | `Loop` | body | | |
/// | `While` | condition | body | |
/// | `Break` | value expr or [`NONE`] | | |
/// | `Return` | value expr or [`NONE`] | | |
/// | `Block` | extra start | extra len | 1 if the last entry is a tail |
/// | `Let` | name ptr | name len | extra start (mut flag, type expr, init, slot) |
/// | `Assign` | target | value | |
/// | `AnonFn` | function index | | |
/// | `ConstValue` | value-pool index | | |
///
/// `ty` is assigned by the validator; `aux` caches resolution results (local
/// slots, field indices, identifier bindings).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub aux: u32,
    pub ty: TypeId,
    pub pos: Pos,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct FunctionFlags: u32 {
        const CONST_FN = 1 << 0;
        const HAS_CONST_PARAMS = 1 << 1;
        const SPECIALIZATION = 1 << 2;
        const EXPORTED = 1 << 3;
        const ANONYMOUS = 1 << 4;
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Param {
    pub name: Span,
    pub ty_expr: ExprId,
    pub is_const: bool,
    /// Resolved by the validator (or the specializer, for clones).
    pub ty: TypeId,
}

#[derive(Clone, Debug)]
pub(crate) struct Function {
    pub name: Span,
    pub module: ModuleId,
    pub pos: Pos,
    pub params: Vec<Param>,
    pub ret_expr: Option<ExprId>,
    pub ret: TypeId,
    pub body: ExprId,
    pub flags: FunctionFlags,
    pub local_count: u32,
    /// Types of the local slots beyond the parameters, filled by the
    /// validator.
    pub locals: Vec<TypeId>,
    /// For specialization clones, the template they were cloned from.
    pub origin: Option<FuncId>,
}

#[derive(Clone, Debug)]
pub(crate) struct Constant {
    pub name: Span,
    pub module: ModuleId,
    pub pos: Pos,
    pub ty_expr: ExprId,
    pub ty: TypeId,
    pub init: ExprId,
    pub value: Option<Value>,
}

/// Per-call-site metadata: the argument window plus the bound callee filled
/// in by the validator (possibly a specialization clone).
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct CallData {
    pub args: ExtraRange,
    pub resolved: Option<FuncId>,
    /// Bit `i` set when argument `i` was captured by a const parameter (and
    /// so is absent from the emitted call).
    pub const_mask: u32,
}

/// All syntax tables for one compile.
#[derive(Default)]
pub(crate) struct Ast {
    pub exprs: Vec<Expr>,
    pub extra: Vec<u32>,
    pub strings: Vec<u8>,
    pub functions: Vec<Function>,
    pub constants: Vec<Constant>,
    pub calls: Vec<CallData>,
}

impl Ast {
    pub(crate) fn reset(&mut self) {
        self.exprs.clear();
        self.extra.clear();
        self.strings.clear();
        self.functions.clear();
        self.constants.clear();
        self.calls.clear();
    }

    pub(crate) fn expr(&self, id: ExprId) -> Expr {
        self.exprs[id as usize]
    }

    pub(crate) fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id as usize]
    }

    pub(crate) fn add_expr(&mut self, expr: Expr) -> Result<ExprId, Diagnostic> {
        if self.exprs.len() >= EXPR_CAPACITY {
            return Err(Diagnostic::bare("expression limit exceeded"));
        }
        self.exprs.push(expr);
        Ok((self.exprs.len() - 1) as ExprId)
    }

    pub(crate) fn add_extra(&mut self, words: &[u32]) -> Result<ExtraRange, Diagnostic> {
        if self.extra.len() + words.len() > EXTRA_CAPACITY {
            return Err(Diagnostic::bare("expression data limit exceeded"));
        }
        let start = self.extra.len() as u32;
        self.extra.extend_from_slice(words);
        Ok(ExtraRange {
            start,
            len: words.len() as u32,
        })
    }

    pub(crate) fn extra_words(&self, range: ExtraRange) -> &[u32] {
        &self.extra[range.start as usize..(range.start + range.len) as usize]
    }

    /// Stores unescaped literal bytes, returning the pool start offset.
    pub(crate) fn add_string(&mut self, bytes: &[u8]) -> u32 {
        let start = self.strings.len() as u32;
        self.strings.extend_from_slice(bytes);
        start
    }

    pub(crate) fn string_bytes(&self, start: u32, len: u32) -> &[u8] {
        &self.strings[start as usize..(start + len) as usize]
    }

    pub(crate) fn add_function(&mut self, function: Function) -> Result<FuncId, Diagnostic> {
        if self.functions.len() >= FUNCTION_CAPACITY {
            return Err(Diagnostic::bare("function limit exceeded"));
        }
        self.functions.push(function);
        Ok((self.functions.len() - 1) as FuncId)
    }

    pub(crate) fn add_constant(&mut self, constant: Constant) -> Result<u32, Diagnostic> {
        if self.constants.len() >= CONSTANT_CAPACITY {
            return Err(Diagnostic::bare("constant limit exceeded"));
        }
        self.constants.push(constant);
        Ok((self.constants.len() - 1) as u32)
    }

    pub(crate) fn add_call(&mut self, call: CallData) -> Result<u32, Diagnostic> {
        if self.calls.len() >= CALL_CAPACITY {
            return Err(Diagnostic::bare("call metadata limit exceeded"));
        }
        self.calls.push(call);
        Ok((self.calls.len() - 1) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_expr(kind: ExprKind) -> Expr {
        Expr {
            kind,
            a: 0,
            b: 0,
            c: 0,
            aux: NONE,
            ty: TypeId::INVALID,
            pos: Pos::START,
        }
    }

    #[test]
    fn expr_table_appends() {
        let mut ast = Ast::default();
        let a = ast.add_expr(dummy_expr(ExprKind::BoolLiteral)).unwrap();
        let b = ast.add_expr(dummy_expr(ExprKind::Continue)).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(ast.expr(b).kind, ExprKind::Continue);
    }

    #[test]
    fn extra_ranges_are_stable() {
        let mut ast = Ast::default();
        let first = ast.add_extra(&[1, 2, 3]).unwrap();
        let second = ast.add_extra(&[4]).unwrap();
        assert_eq!(ast.extra_words(first), &[1, 2, 3]);
        assert_eq!(ast.extra_words(second), &[4]);
    }

    #[test]
    fn resolution_roundtrip() {
        for resolution in [
            Resolution::Local(7),
            Resolution::Constant(1023),
            Resolution::Function(42),
            Resolution::BuiltinLen,
            Resolution::BuiltinInlineWasm,
        ] {
            assert_eq!(Resolution::decode(resolution.encode()), Some(resolution));
        }
        assert_eq!(Resolution::decode(NONE), None);
        assert_eq!(Resolution::decode(0), None);
    }

    #[test]
    fn function_capacity_is_enforced() {
        let mut ast = Ast::default();
        let function = Function {
            name: Span::default(),
            module: 0,
            pos: Pos::START,
            params: Vec::new(),
            ret_expr: None,
            ret: TypeId::UNIT,
            body: 0,
            flags: FunctionFlags::empty(),
            local_count: 0,
            locals: Vec::new(),
            origin: None,
        };
        for _ in 0..FUNCTION_CAPACITY {
            ast.add_function(function.clone()).unwrap();
        }
        let err = ast.add_function(function).unwrap_err();
        assert_eq!(err.message(), "function limit exceeded");
    }
}
