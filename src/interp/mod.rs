// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Compile-time interpretation.
//!
//! Evaluates every expression that must be known at compile time: `const`
//! declarations, `const fn` calls, array lengths, and type expressions
//! (types are ordinary compile-time values of type `type`). The evaluator
//! also feeds the specializer, which captures const-argument values at call
//! sites.
//!
//! Integer payloads are kept canonical: signed values sign-extended to 64
//! bits, unsigned values zero-extended. All arithmetic wraps to the operand
//! width, matching what the emitted module computes at runtime.

pub(crate) mod specialize;

use log::trace;

use crate::Compilation;
use crate::arena::{Arena, Span};
use crate::diag::{Diagnostic, Pos};
use crate::syntax::{
    BinaryOp, Expr, ExprId, ExprKind, ExtraRange, FuncId, FunctionFlags, ModuleId, NONE, UnaryOp,
};
use crate::types::{Prim, TypeId, TypeKind};

/// Upper bound on interpretation steps per compile; generous enough for
/// realistic metaprogramming.
pub const ITERATION_BOUND: u64 = 10_000_000;

/// A compile-time value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Value {
    pub ty: TypeId,
    pub data: ValueData,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ValueData {
    /// Integer or boolean payload, canonical for the value's width and sign.
    Int(i64),
    /// A type value.
    Type(TypeId),
    /// A function value, by function-table index.
    Func(FuncId),
    /// A composite (array/tuple/struct) value, by pool index.
    Composite(u32),
    Unit,
}

impl Value {
    pub(crate) const UNIT: Value = Value {
        ty: TypeId::UNIT,
        data: ValueData::Unit,
    };

    pub(crate) fn int(ty: TypeId, bits: i64) -> Value {
        Value {
            ty,
            data: ValueData::Int(bits),
        }
    }

    pub(crate) fn bool(value: bool) -> Value {
        Value::int(TypeId::BOOL, i64::from(value))
    }

    pub(crate) fn ty_value(ty: TypeId) -> Value {
        Value {
            ty: TypeId::TYPE,
            data: ValueData::Type(ty),
        }
    }

    pub(crate) fn as_int(&self) -> Option<i64> {
        match self.data {
            ValueData::Int(bits) => Some(bits),
            _ => None,
        }
    }

    pub(crate) fn as_type(&self) -> Option<TypeId> {
        match self.data {
            ValueData::Type(ty) => Some(ty),
            _ => None,
        }
    }

    pub(crate) fn truthy(&self) -> bool {
        matches!(self.data, ValueData::Int(bits) if bits != 0)
    }

    /// A single word identifying the value within its type, used in
    /// specialization keys.
    pub(crate) fn key_word(&self) -> i64 {
        match self.data {
            ValueData::Int(bits) => bits,
            ValueData::Type(ty) => i64::from(ty.bits()),
            ValueData::Func(index) => i64::from(index),
            ValueData::Composite(index) => i64::from(index),
            ValueData::Unit => 0,
        }
    }
}

/// Interned storage for composite compile-time values. Structurally equal
/// composites share a pool index, so index equality is value equality.
#[derive(Default)]
pub(crate) struct ValuePool {
    composites: Vec<Box<[Value]>>,
    /// Values referenced from `ConstValue` expression records.
    pub spliced: Vec<Value>,
}

impl ValuePool {
    pub(crate) fn reset(&mut self) {
        self.composites.clear();
        self.spliced.clear();
    }

    pub(crate) fn intern(&mut self, elements: Vec<Value>) -> u32 {
        for (index, existing) in self.composites.iter().enumerate() {
            if existing.as_ref() == elements.as_slice() {
                return index as u32;
            }
        }
        self.composites.push(elements.into_boxed_slice());
        (self.composites.len() - 1) as u32
    }

    pub(crate) fn composite(&self, index: u32) -> &[Value] {
        &self.composites[index as usize]
    }

    pub(crate) fn splice(&mut self, value: Value) -> u32 {
        self.spliced.push(value);
        (self.spliced.len() - 1) as u32
    }
}

// Wraps `bits` to the canonical representation of `prim`.
fn normalize(bits: i64, prim: Prim) -> i64 {
    match prim {
        Prim::I8 => i64::from(bits as i8),
        Prim::I16 => i64::from(bits as i16),
        Prim::I32 => i64::from(bits as i32),
        Prim::I64 => bits,
        Prim::U8 => bits & 0xff,
        Prim::U16 => bits & 0xffff,
        Prim::U32 => bits & 0xffff_ffff,
        Prim::U64 => bits,
        Prim::Bool => i64::from(bits != 0),
        Prim::Unit | Prim::Type => 0,
    }
}

/// Result of evaluating one expression: either a value or in-flight control
/// flow that an enclosing construct will consume.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Flow {
    Value(Value),
    Break(Option<Value>),
    Continue,
    Return(Value),
}

// Unwraps plain values, letting control flow pass through the caller.
macro_rules! value {
    ($flow:expr) => {
        match $flow {
            Flow::Value(value) => value,
            flow => return Ok(flow),
        }
    };
}

/// A per-call environment: lexically scoped bindings of names to values.
#[derive(Default)]
pub(crate) struct Env {
    bindings: Vec<(Span, Value, bool)>,
    marks: Vec<usize>,
}

impl Env {
    pub(crate) fn bind(&mut self, name: Span, value: Value, mutable: bool) {
        self.bindings.push((name, value, mutable));
    }

    fn push_scope(&mut self) {
        self.marks.push(self.bindings.len());
    }

    fn pop_scope(&mut self) {
        let mark = self.marks.pop().unwrap_or(0);
        self.bindings.truncate(mark);
    }

    fn lookup(&self, arena: &Arena, name: &[u8]) -> Option<usize> {
        self.bindings
            .iter()
            .rposition(|(span, _, _)| arena.slice(*span) == name)
    }
}

pub(crate) struct Interp<'a> {
    pub arena: &'a Arena,
    steps: u64,
    /// Constants currently being evaluated, for cycle detection.
    evaluating: Vec<u32>,
}

impl<'a> Interp<'a> {
    pub(crate) fn new(arena: &'a Arena) -> Self {
        Self {
            arena,
            steps: 0,
            evaluating: Vec::new(),
        }
    }

    fn err(&self, comp: &Compilation, module: ModuleId, pos: Pos, message: &str) -> Diagnostic {
        Diagnostic::at(comp.module_path(self.arena, module), pos, message)
    }

    fn step(
        &mut self,
        comp: &Compilation,
        module: ModuleId,
        pos: Pos,
    ) -> Result<(), Diagnostic> {
        self.steps += 1;
        if self.steps > ITERATION_BOUND {
            return Err(self.err(
                comp,
                module,
                pos,
                "const evaluation exceeded iteration bound",
            ));
        }
        Ok(())
    }

    /// Evaluates every constant declaration that has not yet been evaluated.
    pub(crate) fn eval_constants(&mut self, comp: &mut Compilation) -> Result<(), Diagnostic> {
        for index in 0..comp.ast.constants.len() as u32 {
            self.eval_constant(comp, index)?;
        }
        Ok(())
    }

    /// Evaluates (and memoizes) the constant at `index`, on demand so that
    /// constants may reference constants declared later in the same module.
    fn eval_constant(&mut self, comp: &mut Compilation, index: u32) -> Result<Value, Diagnostic> {
        if let Some(value) = comp.ast.constants[index as usize].value {
            return Ok(value);
        }
        let constant = comp.ast.constants[index as usize].clone();
        if self.evaluating.contains(&index) {
            return Err(self.err(
                comp,
                constant.module,
                constant.pos,
                "constant evaluation cycle",
            ));
        }
        self.evaluating.push(index);
        let result = (|| {
            let mut env = Env::default();
            // Type aliases carry no annotation; their declared type is the
            // type of whatever they evaluate to.
            let value = if constant.ty_expr == NONE {
                self.eval_value(comp, constant.module, &mut env, constant.init, None)?
            } else {
                let ty = self.eval_type(comp, constant.module, &mut env, constant.ty_expr)?;
                let value =
                    self.eval_value(comp, constant.module, &mut env, constant.init, Some(ty))?;
                self.coerce(comp, constant.module, constant.pos, value, ty)?
            };
            trace!(
                "const {} = {:?}",
                self.arena.text(constant.name),
                value.data
            );
            Ok(value)
        })();
        self.evaluating.pop();
        let value = result?;
        comp.ast.constants[index as usize].ty = value.ty;
        comp.ast.constants[index as usize].value = Some(value);
        Ok(value)
    }

    /// Evaluates an expression that must produce a plain value (stray
    /// control flow is rejected).
    pub(crate) fn eval_value(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        expr: ExprId,
        expected: Option<TypeId>,
    ) -> Result<Value, Diagnostic> {
        let pos = comp.ast.expr(expr).pos;
        match self.eval(comp, module, env, expr, expected)? {
            Flow::Value(value) => Ok(value),
            Flow::Return(_) => Err(self.err(comp, module, pos, "return outside of function")),
            Flow::Break(_) | Flow::Continue => {
                Err(self.err(comp, module, pos, "break or continue outside of loop"))
            }
        }
    }

    /// Evaluates a type annotation to a type id. The unit value `()` doubles
    /// as the unit type in annotation position.
    pub(crate) fn eval_type(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        expr: ExprId,
    ) -> Result<TypeId, Diagnostic> {
        let pos = comp.ast.expr(expr).pos;
        let value = self.eval_value(comp, module, env, expr, Some(TypeId::TYPE))?;
        if value.ty == TypeId::UNIT {
            return Ok(TypeId::UNIT);
        }
        value.as_type().ok_or_else(|| {
            self.err(comp, module, pos, "type annotations require const type values")
        })
    }

    /// Evaluates a const argument at a call site, in a fresh environment.
    pub(crate) fn eval_const_expr(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        expr: ExprId,
        expected: Option<TypeId>,
    ) -> Result<Value, Diagnostic> {
        let mut env = Env::default();
        self.eval_value(comp, module, &mut env, expr, expected)
    }

    fn coerce(
        &self,
        comp: &Compilation,
        module: ModuleId,
        pos: Pos,
        value: Value,
        ty: TypeId,
    ) -> Result<Value, Diagnostic> {
        if value.ty == ty {
            return Ok(value);
        }
        Err(self.err(
            comp,
            module,
            pos,
            &format!(
                "expected {}, found {}",
                comp.types.describe(ty),
                comp.types.describe(value.ty)
            ),
        ))
    }

    fn literal_value(
        &self,
        comp: &Compilation,
        module: ModuleId,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<Value, Diagnostic> {
        let raw = u64::from(expr.a) | (u64::from(expr.b) << 32);
        let ty = if expr.c == NONE {
            match expected {
                Some(ty) if ty.is_integer() => ty,
                _ => TypeId::I32,
            }
        } else {
            let prim = Prim::try_from(expr.c as u8)
                .map_err(|_| self.err(comp, module, expr.pos, "invalid integer literal"))?;
            TypeId::primitive(prim)
        };
        let prim = ty.as_prim().unwrap_or(Prim::I32);
        let width = prim.bit_width();
        let limit = if prim.is_signed() {
            1u128 << (width - 1)
        } else {
            1u128 << width
        };
        if width < 64 && u128::from(raw) > limit {
            return Err(self.err(comp, module, expr.pos, "integer literal out of range"));
        }
        Ok(Value::int(ty, normalize(raw as i64, prim)))
    }

    fn eval(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        id: ExprId,
        expected: Option<TypeId>,
    ) -> Result<Flow, Diagnostic> {
        let expr = comp.ast.expr(id);
        self.step(comp, module, expr.pos)?;
        let value = match expr.kind {
            ExprKind::IntLiteral => self.literal_value(comp, module, expr, expected)?,
            ExprKind::BoolLiteral => Value::bool(expr.a != 0),
            ExprKind::CharLiteral => Value::int(TypeId::U8, i64::from(expr.a)),
            ExprKind::StringLiteral => {
                let bytes: Vec<u8> = comp.ast.string_bytes(expr.a, expr.b).to_vec();
                let elements: Vec<Value> = bytes
                    .iter()
                    .map(|&byte| Value::int(TypeId::U8, i64::from(byte)))
                    .collect();
                let ty = comp
                    .types
                    .intern_array(TypeId::U8, elements.len() as u32)
                    .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                let pool = comp.pool.intern(elements);
                Value {
                    ty,
                    data: ValueData::Composite(pool),
                }
            }
            ExprKind::Ident => self.eval_ident(comp, module, env, expr)?,
            ExprKind::ConstValue => comp.pool.spliced[expr.a as usize],
            ExprKind::Unary => {
                let op = UnaryOp::try_from(expr.a as u8).unwrap_or(UnaryOp::Neg);
                let operand = value!(self.eval(comp, module, env, expr.b, expected)?);
                self.eval_unary(comp, module, expr.pos, op, operand)?
            }
            ExprKind::Binary => return self.eval_binary(comp, module, env, expr, expected),
            ExprKind::Cast => {
                let target = self.eval_type(comp, module, env, expr.b)?;
                let operand = value!(self.eval(comp, module, env, expr.a, None)?);
                self.eval_cast(comp, module, expr.pos, operand, target)?
            }
            ExprKind::ArrayRepeat => {
                let element = value!(self.eval(comp, module, env, expr.a, None)?);
                let length = value!(self.eval(comp, module, env, expr.b, Some(TypeId::I32))?);
                let Some(length) = length.as_int() else {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "array length must be an integer",
                    ));
                };
                if length < 0 {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "array literal length must be non-negative",
                    ));
                }
                if let Some(element_ty) = element.as_type() {
                    // A repeat literal over a type denotes an array type.
                    let ty = comp
                        .types
                        .intern_array(element_ty, length as u32)
                        .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                    Value::ty_value(ty)
                } else {
                    let ty = comp
                        .types
                        .intern_array(element.ty, length as u32)
                        .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                    let pool = comp.pool.intern(vec![element; length as usize]);
                    Value {
                        ty,
                        data: ValueData::Composite(pool),
                    }
                }
            }
            ExprKind::ArrayList => {
                let items: Vec<ExprId> =
                    comp.ast.extra_words(ExtraRange { start: expr.a, len: expr.b }).to_vec();
                let mut elements = Vec::with_capacity(items.len());
                let mut element_ty = None;
                for item in items {
                    let value = value!(self.eval(comp, module, env, item, element_ty)?);
                    if let Some(ty) = element_ty {
                        self.coerce(comp, module, comp.ast.expr(item).pos, value, ty)?;
                    } else {
                        element_ty = Some(value.ty);
                    }
                    elements.push(value);
                }
                let element_ty = element_ty.unwrap_or(TypeId::UNIT);
                let ty = comp
                    .types
                    .intern_array(element_ty, elements.len() as u32)
                    .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                let pool = comp.pool.intern(elements);
                Value {
                    ty,
                    data: ValueData::Composite(pool),
                }
            }
            ExprKind::TupleLiteral => {
                let items: Vec<ExprId> =
                    comp.ast.extra_words(ExtraRange { start: expr.a, len: expr.b }).to_vec();
                if items.is_empty() {
                    return Ok(Flow::Value(Value::UNIT));
                }
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(value!(self.eval(comp, module, env, item, None)?));
                }
                if elements.iter().all(|v| v.as_type().is_some()) {
                    // A tuple literal of types denotes a tuple type.
                    let fields: Vec<TypeId> =
                        elements.iter().map(|v| v.as_type().unwrap()).collect();
                    let ty = comp
                        .types
                        .intern_tuple(&fields)
                        .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                    Value::ty_value(ty)
                } else {
                    let fields: Vec<TypeId> = elements.iter().map(|v| v.ty).collect();
                    let ty = comp
                        .types
                        .intern_tuple(&fields)
                        .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                    let pool = comp.pool.intern(elements);
                    Value {
                        ty,
                        data: ValueData::Composite(pool),
                    }
                }
            }
            ExprKind::StructTypeExpr => {
                let words: Vec<u32> =
                    comp.ast.extra_words(ExtraRange { start: expr.a, len: expr.b * 3 }).to_vec();
                let mut fields = Vec::with_capacity(expr.b as usize);
                for chunk in words.chunks_exact(3) {
                    let name = Span { ptr: chunk[0], len: chunk[1] };
                    let ty = self.eval_type(comp, module, env, chunk[2])?;
                    fields.push((name, ty));
                }
                let ty = comp
                    .types
                    .intern_struct(self.arena, &fields)
                    .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                Value::ty_value(ty)
            }
            ExprKind::FnTypeExpr => {
                let params: Vec<u32> =
                    comp.ast.extra_words(ExtraRange { start: expr.a, len: expr.b }).to_vec();
                let mut param_tys = Vec::with_capacity(params.len());
                for param in params {
                    param_tys.push(self.eval_type(comp, module, env, param)?);
                }
                let result = if expr.c == NONE {
                    TypeId::UNIT
                } else {
                    self.eval_type(comp, module, env, expr.c)?
                };
                let ty = comp
                    .types
                    .intern_signature(&param_tys, 0, result, true)
                    .map_err(|d| d.locate(comp.module_path(self.arena, module), expr.pos))?;
                Value::ty_value(ty)
            }
            ExprKind::StructLiteral => {
                let ty = self.eval_type(comp, module, env, expr.a)?;
                if ty.kind() != TypeKind::Struct {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "struct literal requires a struct type",
                    ));
                }
                let declared = comp.types.structure(ty).fields.clone();
                let words: Vec<u32> =
                    comp.ast.extra_words(ExtraRange { start: expr.b, len: expr.c * 3 }).to_vec();
                if words.len() / 3 != declared.len() {
                    return Err(self.err(comp, module, expr.pos, "struct literal field mismatch"));
                }
                let mut elements = Vec::with_capacity(declared.len());
                for (chunk, (field_name, field_ty)) in words.chunks_exact(3).zip(&declared) {
                    let name = Span { ptr: chunk[0], len: chunk[1] };
                    if self.arena.slice(name) != self.arena.slice(*field_name) {
                        return Err(self.err(
                            comp,
                            module,
                            expr.pos,
                            "struct literal field mismatch",
                        ));
                    }
                    let value = value!(self.eval(comp, module, env, chunk[2], Some(*field_ty))?);
                    let value = self.coerce(
                        comp,
                        module,
                        comp.ast.expr(chunk[2]).pos,
                        value,
                        *field_ty,
                    )?;
                    elements.push(value);
                }
                let pool = comp.pool.intern(elements);
                Value {
                    ty,
                    data: ValueData::Composite(pool),
                }
            }
            ExprKind::Index => {
                let base = value!(self.eval(comp, module, env, expr.a, None)?);
                let index = value!(self.eval(comp, module, env, expr.b, Some(TypeId::I32))?);
                if base.ty.kind() != TypeKind::Array {
                    return Err(self.err(comp, module, expr.pos, "Indexing non-array value"));
                }
                let Some(index) = index.as_int() else {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "array index requires integer indices",
                    ));
                };
                let ValueData::Composite(pool) = base.data else {
                    return Err(self.err(comp, module, expr.pos, "Indexing non-array value"));
                };
                let elements = comp.pool.composite(pool);
                if index < 0 {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "array index must be non-negative",
                    ));
                }
                if index as usize >= elements.len() {
                    return Err(self.err(comp, module, expr.pos, "array index out of bounds"));
                }
                elements[index as usize]
            }
            ExprKind::Field => {
                let base = value!(self.eval(comp, module, env, expr.a, None)?);
                let name = Span { ptr: expr.b, len: expr.c };
                let ValueData::Composite(pool) = base.data else {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "field access requires a tuple or struct",
                    ));
                };
                let index = self.field_index(comp, module, expr.pos, base.ty, name)?;
                comp.pool.composite(pool)[index]
            }
            ExprKind::Call => return self.eval_call(comp, module, env, expr),
            ExprKind::AnonFn => {
                let func = expr.a;
                let ty = self
                    .anon_fn_type(comp, module, env, func)
                    .unwrap_or(TypeId::INVALID);
                Value {
                    ty,
                    data: ValueData::Func(func),
                }
            }
            ExprKind::If => {
                let condition = value!(self.eval(comp, module, env, expr.a, Some(TypeId::BOOL))?);
                if condition.truthy() {
                    return self.eval(comp, module, env, expr.b, expected);
                }
                if expr.c == NONE {
                    Value::UNIT
                } else {
                    return self.eval(comp, module, env, expr.c, expected);
                }
            }
            ExprKind::While => {
                loop {
                    self.step(comp, module, expr.pos)?;
                    let condition =
                        value!(self.eval(comp, module, env, expr.a, Some(TypeId::BOOL))?);
                    if !condition.truthy() {
                        break;
                    }
                    match self.eval(comp, module, env, expr.b, None)? {
                        Flow::Break(_) => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Value(_) | Flow::Continue => {}
                    }
                }
                Value::UNIT
            }
            ExprKind::Loop => loop {
                self.step(comp, module, expr.pos)?;
                match self.eval(comp, module, env, expr.a, None)? {
                    Flow::Break(value) => break value.unwrap_or(Value::UNIT),
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Value(_) | Flow::Continue => {}
                }
            },
            ExprKind::Break => {
                if expr.a == NONE {
                    return Ok(Flow::Break(None));
                }
                let value = value!(self.eval(comp, module, env, expr.a, None)?);
                return Ok(Flow::Break(Some(value)));
            }
            ExprKind::Continue => return Ok(Flow::Continue),
            ExprKind::Return => {
                if expr.a == NONE {
                    return Ok(Flow::Return(Value::UNIT));
                }
                let value = value!(self.eval(comp, module, env, expr.a, None)?);
                return Ok(Flow::Return(value));
            }
            ExprKind::Block => {
                let items: Vec<ExprId> =
                    comp.ast.extra_words(ExtraRange { start: expr.a, len: expr.b }).to_vec();
                env.push_scope();
                let mut result = Value::UNIT;
                for (index, item) in items.iter().enumerate() {
                    let tail = expr.c == 1 && index == items.len() - 1;
                    let item_expected = if tail { expected } else { None };
                    match self.eval(comp, module, env, *item, item_expected) {
                        Ok(Flow::Value(value)) => {
                            if tail {
                                result = value;
                            }
                        }
                        Ok(flow) => {
                            env.pop_scope();
                            return Ok(flow);
                        }
                        Err(diagnostic) => {
                            env.pop_scope();
                            return Err(diagnostic);
                        }
                    }
                }
                env.pop_scope();
                result
            }
            ExprKind::Let => {
                let name = Span { ptr: expr.a, len: expr.b };
                let words = comp.ast.extra_words(ExtraRange { start: expr.c, len: 4 });
                let (mutable, ty_expr, init) = (words[0] == 1, words[1], words[2]);
                let declared = if ty_expr == NONE {
                    None
                } else {
                    Some(self.eval_type(comp, module, env, ty_expr)?)
                };
                let value = value!(self.eval(comp, module, env, init, declared)?);
                let value = match declared {
                    Some(ty) => {
                        self.coerce(comp, module, comp.ast.expr(init).pos, value, ty)?
                    }
                    None => value,
                };
                env.bind(name, value, mutable);
                Value::UNIT
            }
            ExprKind::Assign => {
                let value = value!(self.eval(comp, module, env, expr.b, None)?);
                self.assign(comp, module, env, expr.a, value)?;
                Value::UNIT
            }
        };
        Ok(Flow::Value(value))
    }

    fn eval_ident(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        expr: Expr,
    ) -> Result<Value, Diagnostic> {
        let name = Span { ptr: expr.a, len: expr.b };
        let text = self.arena.slice(name).to_vec();
        if let Some(slot) = env.lookup(self.arena, &text) {
            return Ok(env.bindings[slot].1);
        }
        if let Some(index) = comp.find_constant(self.arena, &text) {
            return self.eval_constant(comp, index);
        }
        if let Some(func) = comp.find_function(self.arena, &text) {
            // Signatures with dependent parameter types (types naming earlier
            // const params) only resolve once the call binds them; the value
            // itself is still usable as a callee.
            let ty = self
                .anon_fn_type(comp, module, env, func)
                .unwrap_or(TypeId::INVALID);
            return Ok(Value {
                ty,
                data: ValueData::Func(func),
            });
        }
        if let Some(prim) = Prim::from_name(str::from_utf8(&text).unwrap_or("")) {
            return Ok(Value::ty_value(TypeId::primitive(prim)));
        }
        if text == b"unit" {
            return Ok(Value::ty_value(TypeId::UNIT));
        }
        Err(self.err(comp, module, expr.pos, "identifier not found"))
    }

    /// The signature type of a function value, evaluating its parameter and
    /// result annotations.
    fn anon_fn_type(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        func: FuncId,
    ) -> Result<TypeId, Diagnostic> {
        let function = comp.ast.functions[func as usize].clone();
        let mut params = Vec::with_capacity(function.params.len());
        let mut const_params = 0u32;
        for (index, param) in function.params.iter().enumerate() {
            params.push(self.eval_type(comp, module, env, param.ty_expr)?);
            if param.is_const {
                const_params |= 1 << index;
            }
        }
        let result = match function.ret_expr {
            Some(ret) => self.eval_type(comp, module, env, ret)?,
            None => TypeId::UNIT,
        };
        let anonymous = function.flags.contains(FunctionFlags::ANONYMOUS);
        comp.types
            .intern_signature(&params, const_params, result, anonymous)
            .map_err(|d| d.locate(comp.module_path(self.arena, module), function.pos))
    }

    fn eval_call(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        expr: Expr,
    ) -> Result<Flow, Diagnostic> {
        let call = comp.ast.calls[expr.b as usize];
        let args: Vec<ExprId> = comp.ast.extra_words(call.args).to_vec();
        let callee = comp.ast.expr(expr.a);

        // Builtins are resolved by name before any user definition.
        if callee.kind == ExprKind::Ident {
            let name = self
                .arena
                .slice(Span { ptr: callee.a, len: callee.b })
                .to_vec();
            if name == b"len" {
                if args.len() != 1 {
                    return Err(self.err(comp, module, expr.pos, "len requires one argument"));
                }
                let operand = value!(self.eval(comp, module, env, args[0], None)?);
                if operand.ty.kind() != TypeKind::Array {
                    return Err(self.err(comp, module, expr.pos, "len requires an array"));
                }
                let length = i64::from(comp.types.array(operand.ty).length);
                return Ok(Flow::Value(Value::int(TypeId::I32, length)));
            }
            if name == b"inline_wasm" {
                return Err(self.err(
                    comp,
                    module,
                    expr.pos,
                    "inline_wasm cannot be evaluated at compile time",
                ));
            }
        }

        let callee_value = value!(self.eval(comp, module, env, expr.a, None)?);
        let ValueData::Func(func) = callee_value.data else {
            return Err(self.err(comp, module, expr.pos, "call requires a function"));
        };
        let value = self.call_function(comp, module, func, &args, env, expr.pos)?;
        Ok(Flow::Value(value))
    }

    /// Calls a function at compile time. Argument expressions are evaluated
    /// in the caller's environment; parameter types may depend on earlier
    /// (const) parameters and are resolved sequentially in the callee's.
    pub(crate) fn call_function(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        func: FuncId,
        args: &[ExprId],
        env: &mut Env,
        pos: Pos,
    ) -> Result<Value, Diagnostic> {
        let function = comp.ast.functions[func as usize].clone();
        if !function
            .flags
            .intersects(FunctionFlags::CONST_FN | FunctionFlags::ANONYMOUS)
        {
            return Err(self.err(
                comp,
                module,
                pos,
                "const functions may only call const functions",
            ));
        }
        if args.len() != function.params.len() {
            return Err(self.err(comp, module, pos, "wrong number of arguments"));
        }
        self.step(comp, module, pos)?;

        let mut callee_env = Env::default();
        for (param, &arg) in function.params.iter().zip(args) {
            let ty = self.eval_type(comp, function.module, &mut callee_env, param.ty_expr)?;
            let value = self.eval_value(comp, module, env, arg, Some(ty))?;
            let value = self.coerce(comp, module, comp.ast.expr(arg).pos, value, ty)?;
            callee_env.bind(param.name, value, false);
        }
        let ret = match function.ret_expr {
            Some(ret_expr) => self.eval_type(comp, function.module, &mut callee_env, ret_expr)?,
            None => TypeId::UNIT,
        };

        let value = match self.eval(comp, function.module, &mut callee_env, function.body, Some(ret))? {
            Flow::Value(value) | Flow::Return(value) => value,
            Flow::Break(_) | Flow::Continue => {
                return Err(self.err(
                    comp,
                    function.module,
                    function.pos,
                    "break or continue outside of loop",
                ));
            }
        };
        self.coerce(comp, function.module, function.pos, value, ret)
    }

    fn field_index(
        &self,
        comp: &Compilation,
        module: ModuleId,
        pos: Pos,
        ty: TypeId,
        name: Span,
    ) -> Result<usize, Diagnostic> {
        let text = self.arena.slice(name);
        match ty.kind() {
            TypeKind::Tuple => {
                let index: usize = str::from_utf8(text)
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| self.err(comp, module, pos, "unknown tuple field"))?;
                if index >= comp.types.tuple(ty).fields.len() {
                    return Err(self.err(comp, module, pos, "unknown tuple field"));
                }
                Ok(index)
            }
            TypeKind::Struct => comp
                .types
                .structure(ty)
                .fields
                .iter()
                .position(|(field, _)| self.arena.slice(*field) == text)
                .ok_or_else(|| self.err(comp, module, pos, "unknown struct field")),
            _ => Err(self.err(comp, module, pos, "field access requires a tuple or struct")),
        }
    }

    fn assign(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        target: ExprId,
        value: Value,
    ) -> Result<(), Diagnostic> {
        let expr = comp.ast.expr(target);
        match expr.kind {
            ExprKind::Ident => {
                let name = self.arena.slice(Span { ptr: expr.a, len: expr.b }).to_vec();
                let Some(slot) = env.lookup(self.arena, &name) else {
                    return Err(self.err(comp, module, expr.pos, "identifier not found"));
                };
                if !env.bindings[slot].2 {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "cannot assign to immutable local",
                    ));
                }
                let value = self.coerce(comp, module, expr.pos, value, env.bindings[slot].1.ty)?;
                env.bindings[slot].1 = value;
                Ok(())
            }
            ExprKind::Index => {
                let base = self.eval_value(comp, module, env, expr.a, None)?;
                let index = self.eval_value(comp, module, env, expr.b, Some(TypeId::I32))?;
                if base.ty.kind() != TypeKind::Array {
                    return Err(self.err(comp, module, expr.pos, "Indexing non-array value"));
                }
                let element_ty = comp.types.array(base.ty).element;
                let value = self
                    .coerce(comp, module, expr.pos, value, element_ty)
                    .map_err(|_| {
                        self.err(comp, module, expr.pos, "array element assignment type mismatch")
                    })?;
                let ValueData::Composite(pool) = base.data else {
                    return Err(self.err(comp, module, expr.pos, "Indexing non-array value"));
                };
                let Some(index) = index.as_int() else {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "array index requires integer indices",
                    ));
                };
                let mut elements = comp.pool.composite(pool).to_vec();
                if index < 0 {
                    return Err(self.err(comp, module, expr.pos, "array index must be non-negative"));
                }
                if index as usize >= elements.len() {
                    return Err(self.err(comp, module, expr.pos, "array index out of bounds"));
                }
                elements[index as usize] = value;
                let pool = comp.pool.intern(elements);
                self.assign(
                    comp,
                    module,
                    env,
                    expr.a,
                    Value { ty: base.ty, data: ValueData::Composite(pool) },
                )
            }
            ExprKind::Field => {
                let base = self.eval_value(comp, module, env, expr.a, None)?;
                let name = Span { ptr: expr.b, len: expr.c };
                let index = self.field_index(comp, module, expr.pos, base.ty, name)?;
                let ValueData::Composite(pool) = base.data else {
                    return Err(self.err(
                        comp,
                        module,
                        expr.pos,
                        "field access requires a tuple or struct",
                    ));
                };
                let field_ty = comp.pool.composite(pool)[index].ty;
                let value = self
                    .coerce(comp, module, expr.pos, value, field_ty)
                    .map_err(|_| {
                        self.err(comp, module, expr.pos, "tuple field assignment type mismatch")
                    })?;
                let mut elements = comp.pool.composite(pool).to_vec();
                elements[index] = value;
                let pool = comp.pool.intern(elements);
                self.assign(
                    comp,
                    module,
                    env,
                    expr.a,
                    Value { ty: base.ty, data: ValueData::Composite(pool) },
                )
            }
            _ => Err(self.err(comp, module, expr.pos, "cannot assign to this expression")),
        }
    }

    fn eval_unary(
        &self,
        comp: &Compilation,
        module: ModuleId,
        pos: Pos,
        op: UnaryOp,
        operand: Value,
    ) -> Result<Value, Diagnostic> {
        match op {
            UnaryOp::Neg => {
                let prim = operand.ty.as_prim().filter(|prim| prim.is_integer());
                let (Some(prim), Some(bits)) = (prim, operand.as_int()) else {
                    return Err(self.err(comp, module, pos, "negation requires an integer"));
                };
                Ok(Value::int(operand.ty, normalize(bits.wrapping_neg(), prim)))
            }
            UnaryOp::Not => {
                if operand.ty != TypeId::BOOL {
                    return Err(self.err(comp, module, pos, "logical not requires a bool"));
                }
                Ok(Value::bool(!operand.truthy()))
            }
        }
    }

    fn eval_binary(
        &mut self,
        comp: &mut Compilation,
        module: ModuleId,
        env: &mut Env,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<Flow, Diagnostic> {
        let op = BinaryOp::try_from(expr.a as u8).unwrap_or(BinaryOp::Add);

        if op.is_logical() {
            let lhs = value!(self.eval(comp, module, env, expr.b, Some(TypeId::BOOL))?);
            if lhs.ty != TypeId::BOOL {
                return Err(self.err(
                    comp,
                    module,
                    expr.pos,
                    "binary operator operands must have matching type",
                ));
            }
            // Short circuit.
            let taken = match op {
                BinaryOp::And => lhs.truthy(),
                _ => !lhs.truthy(),
            };
            if !taken {
                return Ok(Flow::Value(lhs));
            }
            let rhs = value!(self.eval(comp, module, env, expr.c, Some(TypeId::BOOL))?);
            if rhs.ty != TypeId::BOOL {
                return Err(self.err(
                    comp,
                    module,
                    expr.pos,
                    "binary operator operands must have matching type",
                ));
            }
            return Ok(Flow::Value(rhs));
        }

        // Evaluate the non-literal side first so untyped literals can adopt
        // the other operand's type.
        let operand_expected = expected.filter(|ty| ty.is_integer() && !op.is_comparison());
        let (lhs, rhs);
        if comp.ast.expr(expr.b).kind == ExprKind::IntLiteral
            && comp.ast.expr(expr.c).kind != ExprKind::IntLiteral
        {
            rhs = value!(self.eval(comp, module, env, expr.c, operand_expected)?);
            lhs = value!(self.eval(comp, module, env, expr.b, Some(rhs.ty))?);
        } else {
            lhs = value!(self.eval(comp, module, env, expr.b, operand_expected)?);
            rhs = value!(self.eval(comp, module, env, expr.c, Some(lhs.ty))?);
        }

        if lhs.ty != rhs.ty {
            return Err(self.err(
                comp,
                module,
                expr.pos,
                "binary operator operands must have matching type",
            ));
        }

        if lhs.ty == TypeId::BOOL && matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let result = match op {
                BinaryOp::Eq => lhs.truthy() == rhs.truthy(),
                _ => lhs.truthy() != rhs.truthy(),
            };
            return Ok(Flow::Value(Value::bool(result)));
        }

        if lhs.ty == TypeId::TYPE && matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let equal = lhs.as_type() == rhs.as_type();
            return Ok(Flow::Value(Value::bool(match op {
                BinaryOp::Eq => equal,
                _ => !equal,
            })));
        }

        let prim = lhs.ty.as_prim().filter(|prim| prim.is_integer());
        let (Some(prim), Some(a), Some(b)) = (prim, lhs.as_int(), rhs.as_int()) else {
            return Err(self.err(
                comp,
                module,
                expr.pos,
                "binary operator operands must have matching type",
            ));
        };

        let signed = prim.is_signed();
        let width = prim.bit_width();
        let value = match op {
            BinaryOp::Add => Value::int(lhs.ty, normalize(a.wrapping_add(b), prim)),
            BinaryOp::Sub => Value::int(lhs.ty, normalize(a.wrapping_sub(b), prim)),
            BinaryOp::Mul => Value::int(lhs.ty, normalize(a.wrapping_mul(b), prim)),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(self.err(comp, module, expr.pos, "division by zero"));
                }
                let bits = if signed {
                    a.wrapping_div(b)
                } else {
                    ((a as u64) / (b as u64)) as i64
                };
                Value::int(lhs.ty, normalize(bits, prim))
            }
            BinaryOp::Rem => {
                if b == 0 {
                    return Err(self.err(comp, module, expr.pos, "division by zero"));
                }
                // Truncated toward zero, as at runtime.
                let bits = if signed {
                    a.wrapping_rem(b)
                } else {
                    ((a as u64) % (b as u64)) as i64
                };
                Value::int(lhs.ty, normalize(bits, prim))
            }
            BinaryOp::BitAnd => Value::int(lhs.ty, normalize(a & b, prim)),
            BinaryOp::BitOr => Value::int(lhs.ty, normalize(a | b, prim)),
            BinaryOp::BitXor => Value::int(lhs.ty, normalize(a ^ b, prim)),
            BinaryOp::Shl => {
                let shift = (b as u64) % u64::from(width);
                Value::int(lhs.ty, normalize(a.wrapping_shl(shift as u32), prim))
            }
            BinaryOp::Shr => {
                let shift = ((b as u64) % u64::from(width)) as u32;
                let bits = if signed {
                    a.wrapping_shr(shift)
                } else {
                    (((a as u64) >> shift) & (u64::MAX >> (64 - width).min(63))) as i64
                };
                Value::int(lhs.ty, normalize(bits, prim))
            }
            BinaryOp::Eq => Value::bool(a == b),
            BinaryOp::Ne => Value::bool(a != b),
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = if signed {
                    a.cmp(&b)
                } else {
                    (a as u64).cmp(&(b as u64))
                };
                Value::bool(match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                })
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        };
        Ok(Flow::Value(value))
    }

    fn eval_cast(
        &self,
        comp: &Compilation,
        module: ModuleId,
        pos: Pos,
        operand: Value,
        target: TypeId,
    ) -> Result<Value, Diagnostic> {
        let target_prim = target.as_prim().filter(|prim| prim.is_integer());
        let Some(target_prim) = target_prim else {
            return Err(self.err(comp, module, pos, "cast target must be an integer type"));
        };
        let source_ok = operand.ty.is_integer() || operand.ty == TypeId::BOOL;
        let (true, Some(bits)) = (source_ok, operand.as_int()) else {
            return Err(self.err(comp, module, pos, "cast operand must be an integer or bool"));
        };
        Ok(Value::int(target, normalize(bits, target_prim)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    // Parses and const-evaluates a module, returning the named constant.
    fn eval_named(source: &str, name: &str) -> Result<Value, String> {
        let mut arena = Arena::new();
        registry::load(&mut arena, "/t.bt", source).unwrap();
        let mut comp = crate::Compilation::snapshot(&arena, 0);
        crate::parse::parse_module(&arena, &mut comp, 0).map_err(|d| d.to_string())?;
        let mut interp = Interp::new(&arena);
        interp.eval_constants(&mut comp).map_err(|d| d.to_string())?;
        let index = comp.find_constant(&arena, name.as_bytes()).unwrap();
        Ok(comp.ast.constants[index as usize].value.unwrap())
    }

    fn eval_int(source: &str, name: &str) -> i64 {
        eval_named(source, name).unwrap().as_int().unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(eval_int("const A: i32 = 2 + 3 * 4;", "A"), 14);
        assert_eq!(eval_int("const A: i32 = (2 + 3) * 4;", "A"), 20);
        assert_eq!(eval_int("const A: i32 = 1 << 4 | 1;", "A"), 17);
    }

    #[test]
    fn narrow_arithmetic_wraps() {
        assert_eq!(eval_int("const A: u8 = 200u8 + 100u8;", "A"), 44);
        assert_eq!(eval_int("const A: i8 = 127i8 + 1i8;", "A"), -128);
        assert_eq!(eval_int("const A: u16 = 0u16 - 1u16;", "A"), 0xffff);
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(eval_int("const A: i32 = (0 - 7) / 2;", "A"), -3);
        assert_eq!(eval_int("const A: i32 = (0 - 7) % 2;", "A"), -1);
        assert_eq!(eval_int("const A: u32 = 7u32 / 2u32;", "A"), 3);
    }

    #[test]
    fn division_by_zero_is_located() {
        let err = eval_named("const A: i32 = 10 % 0;", "A").unwrap_err();
        assert_eq!(err, "/t.bt:1:19: division by zero");
        let err = eval_named("const A: i32 = 10 / 0;", "A").unwrap_err();
        assert_eq!(err, "/t.bt:1:19: division by zero");
    }

    #[test]
    fn comparisons_respect_signedness() {
        let value = eval_named("const A: bool = 200u8 > 100u8;", "A").unwrap();
        assert_eq!(value, Value::bool(true));
        // As i8, 200 would have been negative; as u8 it is not.
        let value = eval_named("const A: bool = (0u8 - 56u8) > 100u8;", "A").unwrap();
        assert_eq!(value, Value::bool(true));
        let value = eval_named("const A: bool = (0 - 1) < 1;", "A").unwrap();
        assert_eq!(value, Value::bool(true));
    }

    #[test]
    fn const_fn_calls_evaluate() {
        let source = "const fn fact(n: i32) -> i32 {\n\
                          if n < 2 { 1 } else { n * fact(n - 1) }\n\
                      }\n\
                      const A: i32 = fact(6);";
        assert_eq!(eval_int(source, "A"), 720);
    }

    #[test]
    fn while_loops_and_mutation_evaluate() {
        let source = "const fn collatz_steps(start: i32) -> i32 {\n\
                          let mut n = start;\n\
                          let mut steps = 0;\n\
                          while n != 1 {\n\
                              if n % 2 == 0 { n = n / 2; } else { n = 3 * n + 1; }\n\
                              steps = steps + 1;\n\
                          }\n\
                          steps\n\
                      }\n\
                      const A: i32 = collatz_steps(27);";
        assert_eq!(eval_int(source, "A"), 111);
    }

    #[test]
    fn type_aliases_evaluate_to_types() {
        let value = eval_named("type Bytes = [u8; 4];", "Bytes").unwrap();
        let ty = value.as_type().unwrap();
        assert_eq!(ty.kind(), crate::types::TypeKind::Array);
    }

    #[test]
    fn array_values_index_and_measure() {
        let source = "const TABLE: [i32; 3] = [10, 20, 30];\n\
                      const A: i32 = TABLE[2] + len(TABLE);";
        assert_eq!(eval_int(source, "A"), 33);
    }

    #[test]
    fn constant_cycles_are_detected() {
        let err = eval_named("const A: i32 = B;\nconst B: i32 = A;", "A").unwrap_err();
        assert!(err.contains("constant evaluation cycle"));
    }

    #[test]
    fn non_const_calls_are_rejected() {
        let source = "fn runtime() -> i32 { 1 }\nconst A: i32 = runtime();";
        let err = eval_named(source, "A").unwrap_err();
        assert_eq!(
            err,
            "/t.bt:2:23: const functions may only call const functions"
        );
    }

    #[test]
    fn normalize_widths() {
        assert_eq!(normalize(0x1ff, Prim::U8), 0xff);
        assert_eq!(normalize(0x80, Prim::I8), -128);
        assert_eq!(normalize(-1, Prim::U16), 0xffff);
        assert_eq!(normalize(0x1_0000_0000, Prim::U32), 0);
        assert_eq!(normalize(-1, Prim::I64), -1);
    }

    #[test]
    fn pool_interns_structurally() {
        let mut pool = ValuePool::default();
        let a = pool.intern(vec![Value::int(TypeId::I32, 1), Value::int(TypeId::I32, 2)]);
        let b = pool.intern(vec![Value::int(TypeId::I32, 1), Value::int(TypeId::I32, 2)]);
        let c = pool.intern(vec![Value::int(TypeId::I32, 2)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_words_discriminate() {
        assert_eq!(Value::int(TypeId::I32, 7).key_word(), 7);
        assert_eq!(Value::bool(true).key_word(), 1);
        assert_eq!(
            Value::ty_value(TypeId::I64).key_word(),
            i64::from(TypeId::I64.bits())
        );
    }
}
