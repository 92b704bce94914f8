// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Semantic validation.
//!
//! Walks every concrete function body after parsing and const evaluation,
//! assigning each expression its resolved type, binding identifiers to
//! locals, constants, or functions, and binding every call site to a
//! concrete function index. Calls to functions with const parameters are
//! routed through the specializer, which may append clones to the function
//! table; the validation loop picks those up as it goes.
//!
//! Functions whose signatures involve compile-time-only types (`type`
//! values, function values) are templates for the interpreter and are
//! neither validated here nor emitted.

use log::debug;

use crate::Compilation;
use crate::arena::{Arena, Span};
use crate::diag::{Diagnostic, Pos};
use crate::interp::{Interp, Value, ValueData};
use crate::syntax::{
    BinaryOp, Expr, ExprId, ExprKind, ExtraRange, FuncId, FunctionFlags, ModuleId, NONE,
    Resolution, UnaryOp,
};
use crate::types::{TypeId, TypeKind};

/// Validates the whole program. On success every reachable expression has a
/// resolved type and every call site a concrete callee.
pub(crate) fn validate(arena: &Arena, comp: &mut Compilation) -> Result<(), Diagnostic> {
    let mut interp = Interp::new(arena);

    // Resolve every declared signature up front so call sites can check
    // argument types against functions validated later (mutual recursion).
    for index in 0..comp.ast.functions.len() as FuncId {
        resolve_signature(arena, comp, &mut interp, index)?;
    }

    check_main(arena, comp)?;
    mark_exports(comp);

    // Clones appended by specialization extend the table mid-loop.
    let mut index: FuncId = 0;
    while (index as usize) < comp.ast.functions.len() {
        validate_function(arena, comp, &mut interp, index)?;
        index += 1;
    }
    debug!(
        "validated {} functions ({} specialization keys)",
        comp.ast.functions.len(),
        comp.spec_cache.len()
    );
    Ok(())
}

fn resolve_signature(
    arena: &Arena,
    comp: &mut Compilation,
    interp: &mut Interp<'_>,
    fid: FuncId,
) -> Result<(), Diagnostic> {
    let function = comp.ast.functions[fid as usize].clone();
    if function.flags.contains(FunctionFlags::HAS_CONST_PARAMS) || function.ret != TypeId::INVALID
    {
        return Ok(());
    }
    let mut env = crate::interp::Env::default();
    for index in 0..function.params.len() {
        let ty_expr = function.params[index].ty_expr;
        let ty = interp.eval_type(comp, function.module, &mut env, ty_expr)?;
        if ty == TypeId::UNIT {
            let pos = comp.ast.expr(ty_expr).pos;
            return Err(Diagnostic::at(
                comp.module_path(arena, function.module),
                pos,
                "parameter cannot have unit type",
            ));
        }
        comp.ast.functions[fid as usize].params[index].ty = ty;
    }
    let ret = match function.ret_expr {
        Some(ret_expr) => interp.eval_type(comp, function.module, &mut env, ret_expr)?,
        None => TypeId::UNIT,
    };
    comp.ast.functions[fid as usize].ret = ret;
    Ok(())
}

/// Whether `ty` has a runtime (wasm-value) representation.
pub(crate) fn is_runtime_type(comp: &Compilation, ty: TypeId) -> bool {
    match ty.kind() {
        TypeKind::Primitive => ty.is_integer() || ty == TypeId::BOOL || ty == TypeId::UNIT,
        TypeKind::Array => {
            let element = comp.types.array(ty).element;
            is_runtime_type(comp, element)
        }
        TypeKind::Tuple => {
            let fields = comp.types.tuple(ty).fields.clone();
            fields.iter().all(|&field| is_runtime_type(comp, field))
        }
        TypeKind::Struct => {
            let fields: Vec<TypeId> = comp
                .types
                .structure(ty)
                .fields
                .iter()
                .map(|&(_, field)| field)
                .collect();
            fields.iter().all(|field| is_runtime_type(comp, *field))
        }
        TypeKind::Signature | TypeKind::AnonFn => false,
    }
}

/// Whether the function can exist at runtime (and so must be validated and
/// emitted).
pub(crate) fn is_runtime_function(comp: &Compilation, fid: FuncId) -> bool {
    let function = &comp.ast.functions[fid as usize];
    if function.flags.contains(FunctionFlags::HAS_CONST_PARAMS) {
        return false;
    }
    function
        .params
        .iter()
        .all(|param| is_runtime_type(comp, param.ty))
        && is_runtime_type(comp, function.ret)
}

fn check_main(arena: &Arena, comp: &Compilation) -> Result<(), Diagnostic> {
    let entry = comp.entry;
    let entry_path = comp.module_path(arena, entry).to_owned();
    let mut main = None;
    for (index, function) in comp.ast.functions.iter().enumerate() {
        if function.module == entry
            && !function.flags.contains(FunctionFlags::ANONYMOUS)
            && arena.slice(function.name) == b"main"
        {
            main = Some(index as FuncId);
            break;
        }
    }
    let Some(main) = main else {
        return Err(Diagnostic::at(&entry_path, Pos::START, "main function not found"));
    };
    let function = &comp.ast.functions[main as usize];
    if function.flags.contains(FunctionFlags::HAS_CONST_PARAMS) {
        return Err(Diagnostic::at(
            &entry_path,
            function.pos,
            "main function cannot have const parameters",
        ));
    }
    if !function.params.is_empty() {
        return Err(Diagnostic::at(
            &entry_path,
            function.pos,
            "main function cannot have parameters",
        ));
    }
    if function.ret != TypeId::I32 {
        return Err(Diagnostic::at(
            &entry_path,
            function.pos,
            "main function must return i32",
        ));
    }
    Ok(())
}

/// Entry-module functions (without const params) are exported under their
/// source names. Clones and anonymous functions never are.
fn mark_exports(comp: &mut Compilation) {
    let entry = comp.entry;
    for index in 0..comp.ast.functions.len() as FuncId {
        let runtime = is_runtime_function(comp, index);
        let function = &mut comp.ast.functions[index as usize];
        if runtime
            && function.module == entry
            && !function
                .flags
                .intersects(FunctionFlags::ANONYMOUS | FunctionFlags::SPECIALIZATION)
        {
            function.flags |= FunctionFlags::EXPORTED;
        }
    }
}

fn validate_function<'a>(
    arena: &'a Arena,
    comp: &mut Compilation,
    interp: &mut Interp<'a>,
    fid: FuncId,
) -> Result<(), Diagnostic> {
    // Clones appended during this loop have unresolved signatures only when
    // cloned from anonymous templates; resolve before deciding anything.
    resolve_signature(arena, comp, interp, fid)?;
    if !is_runtime_function(comp, fid) {
        return Ok(());
    }
    let function = comp.ast.functions[fid as usize].clone();
    let mut validator = FuncValidator {
        arena,
        comp,
        interp,
        module: function.module,
        path: String::new(),
        locals: Vec::new(),
        marks: Vec::new(),
        next_slot: 0,
        local_tys: Vec::new(),
        loops: Vec::new(),
        ret: function.ret,
    };
    validator.path = validator
        .comp
        .module_path(arena, function.module)
        .to_owned();
    for (slot, param) in function.params.iter().enumerate() {
        validator.locals.push(LocalBinding {
            name: arena.slice(param.name).to_vec(),
            ty: param.ty,
            mutable: false,
            slot: slot as u32,
        });
    }
    validator.next_slot = function.params.len() as u32;

    let body_ty = validator.validate_expr(function.body, Some(function.ret))?;
    if body_ty != function.ret {
        let pos = validator.comp.ast.expr(function.body).pos;
        return Err(validator.error(pos, "return type mismatch"));
    }
    let local_tys = validator.local_tys;
    let function = &mut comp.ast.functions[fid as usize];
    function.local_count = local_tys.len() as u32;
    function.locals = local_tys;
    Ok(())
}

struct LocalBinding {
    name: Vec<u8>,
    ty: TypeId,
    mutable: bool,
    /// Wasm local slot, or [`NONE`] for unit bindings.
    slot: u32,
}

struct LoopCtx {
    is_while: bool,
    break_ty: Option<TypeId>,
    expected: Option<TypeId>,
}

struct FuncValidator<'a, 'c, 'i> {
    arena: &'a Arena,
    comp: &'c mut Compilation,
    interp: &'i mut Interp<'a>,
    module: ModuleId,
    path: String,
    locals: Vec<LocalBinding>,
    marks: Vec<usize>,
    next_slot: u32,
    /// Types of slots past the parameters, in slot order.
    local_tys: Vec<TypeId>,
    loops: Vec<LoopCtx>,
    ret: TypeId,
}

impl FuncValidator<'_, '_, '_> {
    fn error(&self, pos: Pos, message: &str) -> Diagnostic {
        Diagnostic::at(&self.path, pos, message)
    }

    fn set(&mut self, id: ExprId, ty: TypeId) -> TypeId {
        self.comp.ast.expr_mut(id).ty = ty;
        ty
    }

    fn set_aux(&mut self, id: ExprId, aux: u32) {
        self.comp.ast.expr_mut(id).aux = aux;
    }

    fn lookup_local(&self, name: &[u8]) -> Option<usize> {
        self.locals.iter().rposition(|local| local.name == name)
    }

    fn local_by_slot(&self, slot: u32) -> Option<&LocalBinding> {
        self.locals.iter().rev().find(|local| local.slot == slot)
    }

    /// Best-effort constant evaluation; failures mean "not a constant".
    fn try_const_int(&mut self, id: ExprId) -> Option<i64> {
        self.interp
            .eval_const_expr(self.comp, self.module, id, Some(TypeId::I32))
            .ok()
            .and_then(|value| value.as_int())
    }

    /// Whether an expression (a block or plain expression) unconditionally
    /// transfers control, making its value irrelevant.
    fn diverges(&self, id: ExprId) -> bool {
        let expr = self.comp.ast.expr(id);
        match expr.kind {
            ExprKind::Return | ExprKind::Break | ExprKind::Continue => true,
            ExprKind::Block => {
                let items = self.comp.ast.extra_words(ExtraRange {
                    start: expr.a,
                    len: expr.b,
                });
                items.iter().any(|&item| {
                    matches!(
                        self.comp.ast.expr(item).kind,
                        ExprKind::Return | ExprKind::Break | ExprKind::Continue
                    )
                })
            }
            _ => false,
        }
    }

    fn validate_expr(
        &mut self,
        id: ExprId,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let expr = self.comp.ast.expr(id);
        let ty = match expr.kind {
            ExprKind::IntLiteral => self.validate_int_literal(expr, expected)?,
            ExprKind::BoolLiteral => TypeId::BOOL,
            ExprKind::CharLiteral => TypeId::U8,
            ExprKind::StringLiteral => self
                .comp
                .types
                .intern_array(TypeId::U8, expr.b)
                .map_err(|d| d.locate(&self.path, expr.pos))?,
            ExprKind::Ident => self.validate_ident(id, expr)?,
            ExprKind::ConstValue => {
                let value = self.comp.pool.spliced[expr.a as usize];
                self.check_runtime_value(expr.pos, value)?
            }
            ExprKind::Binary => self.validate_binary(id, expr, expected)?,
            ExprKind::Unary => self.validate_unary(expr, expected)?,
            ExprKind::Call => self.validate_call(id, expr, expected)?,
            ExprKind::ArrayRepeat => self.validate_array_repeat(expr, expected)?,
            ExprKind::ArrayList => self.validate_array_list(expr, expected)?,
            ExprKind::TupleLiteral => self.validate_tuple(expr)?,
            ExprKind::StructLiteral => self.validate_struct_literal(expr)?,
            ExprKind::StructTypeExpr | ExprKind::FnTypeExpr => {
                return Err(self.error(expr.pos, "type values require a const context"));
            }
            ExprKind::AnonFn => {
                return Err(self.error(expr.pos, "function values require a const context"));
            }
            ExprKind::Index => self.validate_index(id, expr)?,
            ExprKind::Field => self.validate_field(id, expr)?,
            ExprKind::Cast => self.validate_cast(expr)?,
            ExprKind::If => self.validate_if(expr, expected)?,
            ExprKind::Loop => {
                self.loops.push(LoopCtx {
                    is_while: false,
                    break_ty: None,
                    expected,
                });
                self.validate_expr(expr.a, None)?;
                let ctx = self.loops.pop().unwrap();
                ctx.break_ty
                    .or(ctx.expected)
                    .unwrap_or(TypeId::UNIT)
            }
            ExprKind::While => {
                let cond_ty = self.validate_expr(expr.a, Some(TypeId::BOOL))?;
                if cond_ty != TypeId::BOOL {
                    return Err(self.error(expr.pos, "while condition must be bool"));
                }
                self.loops.push(LoopCtx {
                    is_while: true,
                    break_ty: None,
                    expected: None,
                });
                self.validate_expr(expr.b, None)?;
                self.loops.pop();
                TypeId::UNIT
            }
            ExprKind::Break => self.validate_break(expr)?,
            ExprKind::Continue => {
                if self.loops.is_empty() {
                    return Err(self.error(expr.pos, "continue outside of loop"));
                }
                TypeId::UNIT
            }
            ExprKind::Return => {
                if expr.a == NONE {
                    if self.ret != TypeId::UNIT {
                        return Err(self.error(expr.pos, "bare return requires a unit return type"));
                    }
                } else {
                    let value_ty = self.validate_expr(expr.a, Some(self.ret))?;
                    if value_ty != self.ret {
                        return Err(self.error(expr.pos, "return type mismatch"));
                    }
                }
                TypeId::UNIT
            }
            ExprKind::Block => self.validate_block(expr, expected)?,
            ExprKind::Let => self.validate_let(id, expr)?,
            ExprKind::Assign => self.validate_assign(expr)?,
        };
        Ok(self.set(id, ty))
    }

    fn validate_int_literal(
        &mut self,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let raw = u64::from(expr.a) | (u64::from(expr.b) << 32);
        let ty = if expr.c == NONE {
            match expected {
                Some(ty) if ty.is_integer() => ty,
                _ => TypeId::I32,
            }
        } else {
            TypeId::primitive(
                crate::types::Prim::try_from(expr.c as u8)
                    .map_err(|_| self.error(expr.pos, "invalid integer literal"))?,
            )
        };
        let prim = ty.as_prim().unwrap();
        let width = prim.bit_width();
        let limit = if prim.is_signed() {
            1u128 << (width - 1)
        } else {
            1u128 << width
        };
        if width < 64 && u128::from(raw) > limit {
            return Err(self.error(expr.pos, "integer literal out of range"));
        }
        Ok(ty)
    }

    fn check_runtime_value(&self, pos: Pos, value: Value) -> Result<TypeId, Diagnostic> {
        match value.data {
            ValueData::Type(_) => Err(self.error(pos, "type values require a const context")),
            ValueData::Func(_) => Err(self.error(pos, "function values require a const context")),
            _ => Ok(value.ty),
        }
    }

    fn validate_ident(&mut self, id: ExprId, expr: Expr) -> Result<TypeId, Diagnostic> {
        let name = self
            .arena
            .slice(Span {
                ptr: expr.a,
                len: expr.b,
            })
            .to_vec();
        if let Some(index) = self.lookup_local(&name) {
            let local = &self.locals[index];
            let (slot, ty) = (local.slot, local.ty);
            self.set_aux(id, Resolution::Local(slot).encode());
            return Ok(ty);
        }
        if let Some(index) = self.comp.find_constant(self.arena, &name) {
            let value = self.comp.ast.constants[index as usize]
                .value
                .expect("constants are evaluated before validation");
            let ty = self.check_runtime_value(expr.pos, value)?;
            self.set_aux(id, Resolution::Constant(index).encode());
            return Ok(ty);
        }
        if self.comp.find_function(self.arena, &name).is_some() {
            return Err(self.error(expr.pos, "function values require a const context"));
        }
        if crate::types::Prim::from_name(str::from_utf8(&name).unwrap_or("")).is_some() {
            return Err(self.error(expr.pos, "type values require a const context"));
        }
        Err(self.error(expr.pos, "identifier not found"))
    }

    fn validate_binary(
        &mut self,
        _id: ExprId,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let op = BinaryOp::try_from(expr.a as u8).unwrap();
        if op.is_logical() {
            let lhs = self.validate_expr(expr.b, Some(TypeId::BOOL))?;
            let rhs = self.validate_expr(expr.c, Some(TypeId::BOOL))?;
            if lhs != TypeId::BOOL || rhs != TypeId::BOOL {
                return Err(self.error(
                    expr.pos,
                    "binary operator operands must have matching type",
                ));
            }
            return Ok(TypeId::BOOL);
        }

        let operand_expected = expected.filter(|ty| ty.is_integer() && !op.is_comparison());
        let (lhs, rhs);
        if self.comp.ast.expr(expr.b).kind == ExprKind::IntLiteral
            && self.comp.ast.expr(expr.c).kind != ExprKind::IntLiteral
        {
            rhs = self.validate_expr(expr.c, operand_expected)?;
            lhs = self.validate_expr(expr.b, Some(rhs))?;
        } else {
            lhs = self.validate_expr(expr.b, operand_expected)?;
            rhs = self.validate_expr(expr.c, Some(lhs))?;
        }
        if lhs != rhs {
            return Err(self.error(
                expr.pos,
                "binary operator operands must have matching type",
            ));
        }
        if op.is_comparison() {
            if lhs == TypeId::BOOL && matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                return Ok(TypeId::BOOL);
            }
            if !lhs.is_integer() {
                return Err(self.error(expr.pos, "comparison requires integer operands"));
            }
            return Ok(TypeId::BOOL);
        }
        if !lhs.is_integer() {
            return Err(self.error(expr.pos, "binary operator requires integer operands"));
        }
        Ok(lhs)
    }

    fn validate_unary(
        &mut self,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let op = UnaryOp::try_from(expr.a as u8).unwrap();
        match op {
            UnaryOp::Neg => {
                let operand = self
                    .validate_expr(expr.b, expected.filter(|ty| ty.is_integer()))?;
                if !operand.is_integer() {
                    return Err(self.error(expr.pos, "negation requires an integer"));
                }
                Ok(operand)
            }
            UnaryOp::Not => {
                let operand = self.validate_expr(expr.b, Some(TypeId::BOOL))?;
                if operand != TypeId::BOOL {
                    return Err(self.error(expr.pos, "logical not requires a bool"));
                }
                Ok(TypeId::BOOL)
            }
        }
    }

    fn validate_array_repeat(
        &mut self,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let element_expected = expected
            .filter(|ty| ty.kind() == TypeKind::Array)
            .map(|ty| self.comp.types.array(ty).element);
        let element_ty = self.validate_expr(expr.a, element_expected)?;
        let length = self
            .interp
            .eval_const_expr(self.comp, self.module, expr.b, Some(TypeId::I32))?;
        let Some(length) = length.as_int() else {
            return Err(self.error(expr.pos, "array length must be an integer"));
        };
        if length < 0 {
            return Err(self.error(expr.pos, "array literal length must be non-negative"));
        }
        self.validate_expr(expr.b, Some(TypeId::I32))?;
        self.comp
            .types
            .intern_array(element_ty, length as u32)
            .map_err(|d| d.locate(&self.path, expr.pos))
    }

    fn validate_array_list(
        &mut self,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let items: Vec<ExprId> = self
            .comp
            .ast
            .extra_words(ExtraRange {
                start: expr.a,
                len: expr.b,
            })
            .to_vec();
        let mut element_ty = expected
            .filter(|ty| ty.kind() == TypeKind::Array)
            .map(|ty| self.comp.types.array(ty).element);
        for &item in &items {
            let ty = self.validate_expr(item, element_ty)?;
            match element_ty {
                Some(existing) if existing != ty => {
                    return Err(self.error(
                        self.comp.ast.expr(item).pos,
                        "array elements must have matching types",
                    ));
                }
                _ => element_ty = Some(ty),
            }
        }
        let element_ty = element_ty.unwrap_or(TypeId::UNIT);
        self.comp
            .types
            .intern_array(element_ty, items.len() as u32)
            .map_err(|d| d.locate(&self.path, expr.pos))
    }

    fn validate_tuple(&mut self, expr: Expr) -> Result<TypeId, Diagnostic> {
        let items: Vec<ExprId> = self
            .comp
            .ast
            .extra_words(ExtraRange {
                start: expr.a,
                len: expr.b,
            })
            .to_vec();
        if items.is_empty() {
            return Ok(TypeId::UNIT);
        }
        let mut fields = Vec::with_capacity(items.len());
        for item in items {
            fields.push(self.validate_expr(item, None)?);
        }
        self.comp
            .types
            .intern_tuple(&fields)
            .map_err(|d| d.locate(&self.path, expr.pos))
    }

    fn validate_struct_literal(&mut self, expr: Expr) -> Result<TypeId, Diagnostic> {
        let ty = {
            let mut env = crate::interp::Env::default();
            self.interp
                .eval_type(self.comp, self.module, &mut env, expr.a)?
        };
        if ty.kind() != TypeKind::Struct {
            return Err(self.error(expr.pos, "struct literal requires a struct type"));
        }
        self.set(expr.a, TypeId::TYPE);
        let declared = self.comp.types.structure(ty).fields.clone();
        let words: Vec<u32> = self
            .comp
            .ast
            .extra_words(ExtraRange {
                start: expr.b,
                len: expr.c * 3,
            })
            .to_vec();
        if words.len() / 3 != declared.len() {
            return Err(self.error(expr.pos, "struct literal field mismatch"));
        }
        for (chunk, (field_name, field_ty)) in words.chunks_exact(3).zip(&declared) {
            let name = Span {
                ptr: chunk[0],
                len: chunk[1],
            };
            if self.arena.slice(name) != self.arena.slice(*field_name) {
                return Err(self.error(expr.pos, "struct literal field mismatch"));
            }
            let value_ty = self.validate_expr(chunk[2], Some(*field_ty))?;
            if value_ty != *field_ty {
                return Err(self.error(
                    self.comp.ast.expr(chunk[2]).pos,
                    "struct literal field type mismatch",
                ));
            }
        }
        Ok(ty)
    }

    fn validate_index(&mut self, _id: ExprId, expr: Expr) -> Result<TypeId, Diagnostic> {
        let base_ty = self.validate_expr(expr.a, None)?;
        if base_ty.kind() != TypeKind::Array {
            return Err(self.error(expr.pos, "Indexing non-array value"));
        }
        let index_ty = self.validate_expr(expr.b, Some(TypeId::I32))?;
        if !index_ty.is_integer() {
            return Err(self.error(expr.pos, "array index requires integer indices"));
        }
        if index_ty != TypeId::I32 {
            return Err(self.error(expr.pos, "Array index must be i32"));
        }
        let length = self.comp.types.array(base_ty).length;
        if let Some(index) = self.try_const_int(expr.b) {
            if index < 0 {
                return Err(self.error(expr.pos, "array index must be non-negative"));
            }
            if index as u32 >= length {
                return Err(self.error(expr.pos, "array index out of bounds"));
            }
        }
        Ok(self.comp.types.array(base_ty).element)
    }

    fn validate_field(&mut self, id: ExprId, expr: Expr) -> Result<TypeId, Diagnostic> {
        let base_ty = self.validate_expr(expr.a, None)?;
        let name = Span {
            ptr: expr.b,
            len: expr.c,
        };
        let text = self.arena.slice(name).to_vec();
        match base_ty.kind() {
            TypeKind::Tuple => {
                let fields = self.comp.types.tuple(base_ty).fields.clone();
                let index: usize = str::from_utf8(&text)
                    .ok()
                    .and_then(|digits| digits.parse().ok())
                    .ok_or_else(|| self.error(expr.pos, "unknown tuple field"))?;
                if index >= fields.len() {
                    return Err(self.error(expr.pos, "unknown tuple field"));
                }
                self.set_aux(id, index as u32);
                Ok(fields[index])
            }
            TypeKind::Struct => {
                let fields = self.comp.types.structure(base_ty).fields.clone();
                let index = fields
                    .iter()
                    .position(|(field, _)| self.arena.slice(*field) == text)
                    .ok_or_else(|| self.error(expr.pos, "unknown struct field"))?;
                self.set_aux(id, index as u32);
                Ok(fields[index].1)
            }
            _ => Err(self.error(expr.pos, "field access requires a tuple or struct")),
        }
    }

    fn validate_cast(&mut self, expr: Expr) -> Result<TypeId, Diagnostic> {
        let operand = self.validate_expr(expr.a, None)?;
        if !operand.is_integer() && operand != TypeId::BOOL {
            return Err(self.error(expr.pos, "cast operand must be an integer or bool"));
        }
        let target = {
            let mut env = crate::interp::Env::default();
            self.interp
                .eval_type(self.comp, self.module, &mut env, expr.b)?
        };
        if !target.is_integer() {
            return Err(self.error(expr.pos, "cast target must be an integer type"));
        }
        self.set(expr.b, TypeId::TYPE);
        Ok(target)
    }

    fn validate_if(&mut self, expr: Expr, expected: Option<TypeId>) -> Result<TypeId, Diagnostic> {
        let cond_ty = self.validate_expr(expr.a, Some(TypeId::BOOL))?;
        if cond_ty != TypeId::BOOL {
            return Err(self.error(expr.pos, "if condition must be bool"));
        }
        let then_ty = self.validate_expr(expr.b, expected)?;
        if expr.c == NONE {
            if then_ty != TypeId::UNIT && !self.diverges(expr.b) {
                return Err(self.error(expr.pos, "if branches must have matching result types"));
            }
            return Ok(TypeId::UNIT);
        }
        let else_ty = self.validate_expr(expr.c, expected)?;
        if self.diverges(expr.b) {
            return Ok(else_ty);
        }
        if self.diverges(expr.c) {
            return Ok(then_ty);
        }
        if then_ty != else_ty {
            return Err(self.error(expr.pos, "if branches must have matching result types"));
        }
        Ok(then_ty)
    }

    fn validate_break(&mut self, expr: Expr) -> Result<TypeId, Diagnostic> {
        let Some(top) = self.loops.len().checked_sub(1) else {
            return Err(self.error(expr.pos, "break outside of loop"));
        };
        if expr.a != NONE {
            if self.loops[top].is_while {
                return Err(self.error(expr.pos, "while loops cannot break with values"));
            }
            let expected = self.loops[top].break_ty.or(self.loops[top].expected);
            let value_ty = self.validate_expr(expr.a, expected)?;
            match self.loops[top].break_ty {
                Some(existing) if existing != value_ty => {
                    return Err(self.error(expr.pos, "loop break values must have matching types"));
                }
                _ => self.loops[top].break_ty = Some(value_ty),
            }
        }
        Ok(TypeId::UNIT)
    }

    fn validate_block(
        &mut self,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let items: Vec<ExprId> = self
            .comp
            .ast
            .extra_words(ExtraRange {
                start: expr.a,
                len: expr.b,
            })
            .to_vec();
        let has_tail = expr.c == 1;
        self.marks.push(self.locals.len());
        let mut result = TypeId::UNIT;
        let mut diverged = false;
        for (index, &item) in items.iter().enumerate() {
            let is_tail = has_tail && index == items.len() - 1;
            let item_expected = if is_tail { expected } else { None };
            let ty = self.validate_expr(item, item_expected)?;
            if is_tail {
                result = ty;
            }
            diverged |= matches!(
                self.comp.ast.expr(item).kind,
                ExprKind::Return | ExprKind::Break | ExprKind::Continue
            );
        }
        let mark = self.marks.pop().unwrap();
        self.locals.truncate(mark);

        if let Some(expected) = expected
            && expected != TypeId::UNIT
            && !has_tail
        {
            if diverged {
                return Ok(expected);
            }
            return Err(self.error(expr.pos, "block must end with expression"));
        }
        Ok(result)
    }

    fn validate_let(&mut self, id: ExprId, expr: Expr) -> Result<TypeId, Diagnostic> {
        let words: Vec<u32> = self
            .comp
            .ast
            .extra_words(ExtraRange {
                start: expr.c,
                len: 4,
            })
            .to_vec();
        let (mutable, ty_expr, init) = (words[0] == 1, words[1], words[2]);
        let declared = if ty_expr == NONE {
            None
        } else {
            let mut env = crate::interp::Env::default();
            let ty = self
                .interp
                .eval_type(self.comp, self.module, &mut env, ty_expr)?;
            self.set(ty_expr, TypeId::TYPE);
            Some(ty)
        };
        let init_ty = self.validate_expr(init, declared)?;
        if let Some(declared) = declared
            && declared != init_ty
        {
            return Err(self.error(expr.pos, "let binding type mismatch"));
        }
        if matches!(init_ty.kind(), TypeKind::Signature | TypeKind::AnonFn) {
            return Err(self.error(expr.pos, "function values require a const context"));
        }
        if init_ty == TypeId::TYPE {
            return Err(self.error(expr.pos, "type values require a const context"));
        }

        let slot = if init_ty == TypeId::UNIT {
            NONE
        } else {
            let slot = self.next_slot;
            self.next_slot += 1;
            self.local_tys.push(init_ty);
            slot
        };
        self.set_aux(id, slot);
        self.locals.push(LocalBinding {
            name: self
                .arena
                .slice(Span {
                    ptr: expr.a,
                    len: expr.b,
                })
                .to_vec(),
            ty: init_ty,
            mutable,
            slot,
        });
        Ok(TypeId::UNIT)
    }

    /// The local slot a place expression is rooted in, if any.
    fn place_root(&self, id: ExprId) -> Option<u32> {
        let expr = self.comp.ast.expr(id);
        match expr.kind {
            ExprKind::Ident => match Resolution::decode(expr.aux) {
                Some(Resolution::Local(slot)) => Some(slot),
                _ => None,
            },
            ExprKind::Index | ExprKind::Field => self.place_root(expr.a),
            _ => None,
        }
    }

    fn validate_assign(&mut self, expr: Expr) -> Result<TypeId, Diagnostic> {
        let target_ty = self.validate_expr(expr.a, None)?;
        let target = self.comp.ast.expr(expr.a);

        let Some(root) = self.place_root(expr.a) else {
            // Distinguish assigning to a constant from a non-place target.
            if target.kind == ExprKind::Ident {
                return Err(self.error(target.pos, "cannot assign to immutable local"));
            }
            return Err(self.error(target.pos, "cannot assign to this expression"));
        };
        let root_mutable = self
            .local_by_slot(root)
            .is_some_and(|local| local.mutable);
        if !root_mutable {
            return Err(self.error(target.pos, "cannot assign to immutable local"));
        }

        let value_ty = self.validate_expr(expr.b, Some(target_ty))?;
        if value_ty != target_ty {
            let message = match target.kind {
                ExprKind::Index => "array element assignment type mismatch",
                ExprKind::Field => {
                    let base_ty = self.comp.ast.expr(target.a).ty;
                    if base_ty.kind() == TypeKind::Struct {
                        "struct field assignment type mismatch"
                    } else {
                        "tuple field assignment type mismatch"
                    }
                }
                _ => "assignment type mismatch",
            };
            return Err(self.error(expr.pos, message));
        }
        Ok(TypeId::UNIT)
    }

    fn validate_call(
        &mut self,
        id: ExprId,
        expr: Expr,
        expected: Option<TypeId>,
    ) -> Result<TypeId, Diagnostic> {
        let call = self.comp.ast.calls[expr.b as usize];
        let args: Vec<ExprId> = self.comp.ast.extra_words(call.args).to_vec();
        let callee = self.comp.ast.expr(expr.a);

        // Builtins shadow everything.
        if callee.kind == ExprKind::Ident {
            let name = self
                .arena
                .slice(Span {
                    ptr: callee.a,
                    len: callee.b,
                })
                .to_vec();
            if name == b"len" {
                if args.len() != 1 {
                    return Err(self.error(expr.pos, "len requires one argument"));
                }
                let operand_ty = self.validate_expr(args[0], None)?;
                if operand_ty.kind() != TypeKind::Array {
                    return Err(self.error(expr.pos, "len requires an array"));
                }
                self.set(expr.a, TypeId::UNIT);
                self.set_aux(expr.a, Resolution::BuiltinLen.encode());
                return Ok(TypeId::I32);
            }
            if name == b"inline_wasm" {
                // Shape was checked by the parser; every element must be a
                // compile-time u8.
                let bytes = self.comp.ast.expr(args[0]);
                let items: Vec<ExprId> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: bytes.a,
                        len: bytes.b,
                    })
                    .to_vec();
                let mut literal = Vec::with_capacity(items.len());
                for &item in &items {
                    let value = self
                        .interp
                        .eval_const_expr(self.comp, self.module, item, Some(TypeId::U8))
                        .map_err(|_| {
                            self.error(
                                expr.pos,
                                "inline_wasm argument must be an array literal of u8 values",
                            )
                        })?;
                    let byte = value.as_int().filter(|_| value.ty == TypeId::U8);
                    let Some(byte) = byte else {
                        return Err(self.error(
                            expr.pos,
                            "inline_wasm argument must be an array literal of u8 values",
                        ));
                    };
                    literal.push(byte as u8);
                    self.validate_expr(item, Some(TypeId::U8))?;
                }
                let ty = self
                    .comp
                    .types
                    .intern_array(TypeId::U8, items.len() as u32)
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                self.set(args[0], ty);
                self.set(expr.a, TypeId::UNIT);
                self.set_aux(expr.a, Resolution::BuiltinInlineWasm.encode());
                // Stash the literal bytes for the emitter to splice.
                let start = self.comp.ast.add_string(&literal);
                self.set_aux(id, start);
                return Ok(expected.unwrap_or(TypeId::UNIT));
            }
        }

        // Resolve the callee to a function index.
        let fid = self.resolve_callee(expr.a, &callee)?;

        let function = self.comp.ast.functions[fid as usize].clone();
        if args.len() != function.params.len() {
            return Err(self.error(expr.pos, "wrong number of arguments"));
        }

        let (bound, const_mask) = if function.flags.contains(FunctionFlags::HAS_CONST_PARAMS) {
            let mut const_args: Vec<(u32, Value)> = Vec::new();
            let mut const_mask = 0u32;
            let mut env = crate::interp::Env::default();
            for (index, param) in function.params.iter().enumerate() {
                if !param.is_const {
                    continue;
                }
                let ty = self
                    .interp
                    .eval_type(self.comp, function.module, &mut env, param.ty_expr)?;
                let value = self
                    .interp
                    .eval_const_expr(self.comp, self.module, args[index], Some(ty))
                    .map_err(|d| {
                        d.locate(&self.path, self.comp.ast.expr(args[index]).pos)
                    })?;
                if value.ty != ty {
                    return Err(self.error(
                        self.comp.ast.expr(args[index]).pos,
                        "argument type mismatch",
                    ));
                }
                env.bind(param.name, value, false);
                // The argument expression is compile-time; record its type
                // for the emitter's benefit but do not emit it.
                self.set(args[index], value.ty);
                const_args.push((index as u32, value));
                const_mask |= 1 << index;
            }
            let clone = self.interp.specialize(
                self.comp,
                self.module,
                fid,
                &const_args,
                expr.pos,
            )?;
            (clone, const_mask)
        } else {
            (fid, 0)
        };

        let bound_fn = self.comp.ast.functions[bound as usize].clone();
        if !is_runtime_function(self.comp, bound) {
            return Err(self.error(expr.pos, "function is not callable at runtime"));
        }
        let mut runtime_param = 0usize;
        for (index, &arg) in args.iter().enumerate() {
            if const_mask & (1 << index) != 0 {
                continue;
            }
            let param_ty = bound_fn.params[runtime_param].ty;
            runtime_param += 1;
            let arg_ty = self.validate_expr(arg, Some(param_ty))?;
            if arg_ty != param_ty {
                return Err(self.error(
                    self.comp.ast.expr(arg).pos,
                    "argument type mismatch",
                ));
            }
        }

        self.comp.ast.calls[expr.b as usize].resolved = Some(bound);
        self.comp.ast.calls[expr.b as usize].const_mask = const_mask;
        Ok(bound_fn.ret)
    }

    fn resolve_callee(&mut self, callee_id: ExprId, callee: &Expr) -> Result<FuncId, Diagnostic> {
        match callee.kind {
            ExprKind::Ident => {
                let name = self
                    .arena
                    .slice(Span {
                        ptr: callee.a,
                        len: callee.b,
                    })
                    .to_vec();
                if self.lookup_local(&name).is_some() {
                    return Err(self.error(callee.pos, "call requires a function"));
                }
                if let Some(index) = self.comp.find_constant(self.arena, &name) {
                    let value = self.comp.ast.constants[index as usize]
                        .value
                        .expect("constants are evaluated before validation");
                    if let ValueData::Func(fid) = value.data {
                        self.set(callee_id, TypeId::UNIT);
                        self.set_aux(callee_id, Resolution::Function(fid).encode());
                        return Ok(fid);
                    }
                    return Err(self.error(callee.pos, "call requires a function"));
                }
                if let Some(fid) = self.comp.find_function(self.arena, &name) {
                    self.set(callee_id, TypeId::UNIT);
                    self.set_aux(callee_id, Resolution::Function(fid).encode());
                    return Ok(fid);
                }
                Err(self.error(callee.pos, "identifier not found"))
            }
            ExprKind::AnonFn => {
                self.set(callee_id, TypeId::UNIT);
                Ok(callee.a)
            }
            ExprKind::ConstValue => {
                let value = self.comp.pool.spliced[callee.a as usize];
                if let ValueData::Func(fid) = value.data {
                    self.set(callee_id, TypeId::UNIT);
                    return Ok(fid);
                }
                Err(self.error(callee.pos, "call requires a function"))
            }
            _ => Err(self.error(callee.pos, "call requires a function")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    // Runs the front half of the pipeline (parse, const eval, validate).
    fn check(source: &str) -> Result<(crate::Compilation, Arena), String> {
        let mut arena = Arena::new();
        registry::load(&mut arena, "/t.bt", source).unwrap();
        let mut comp = crate::Compilation::snapshot(&arena, 0);
        crate::parse::parse_module(&arena, &mut comp, 0).map_err(|d| d.to_string())?;
        let mut interp = Interp::new(&arena);
        interp.eval_constants(&mut comp).map_err(|d| d.to_string())?;
        validate(&arena, &mut comp).map_err(|d| d.to_string())?;
        Ok((comp, arena))
    }

    fn check_err(source: &str) -> String {
        match check(source) {
            Ok(_) => panic!("expected validation to fail"),
            Err(message) => message,
        }
    }

    #[test]
    fn valid_program_passes() {
        check("fn add(a: i32, b: i32) -> i32 { a + b }\nfn main() -> i32 { add(1, 2) }")
            .unwrap();
    }

    #[test]
    fn unknown_identifier() {
        assert_eq!(
            check_err("fn main() -> i32 { missing }"),
            "/t.bt:1:20: identifier not found"
        );
    }

    #[test]
    fn mismatched_operands() {
        assert_eq!(
            check_err("fn main() -> i32 { let a = 1i64; (a + 2u8) as i32 }"),
            "/t.bt:1:37: binary operator operands must have matching type"
        );
    }

    #[test]
    fn if_branches_must_agree() {
        assert_eq!(
            check_err("fn main() -> i32 { if true { 1 } else { false } }"),
            "/t.bt:1:20: if branches must have matching result types"
        );
    }

    #[test]
    fn blocks_need_tails() {
        let message = check_err("fn f() -> i32 { let x = 1; }\nfn main() -> i32 { f() }");
        assert_eq!(message, "/t.bt:1:15: block must end with expression");
    }

    #[test]
    fn indexing_requires_arrays() {
        assert_eq!(
            check_err("fn main() -> i32 { let x = 1; x[0] }"),
            "/t.bt:1:32: Indexing non-array value"
        );
    }

    #[test]
    fn bare_return_needs_unit() {
        let message = check_err("fn f() -> i32 { return; }\nfn main() -> i32 { 0 }");
        assert_eq!(message, "/t.bt:1:17: bare return requires a unit return type");
    }

    #[test]
    fn main_signature_is_checked() {
        assert_eq!(
            check_err("fn main(a: i32) -> i32 { a }"),
            "/t.bt:1:4: main function cannot have parameters"
        );
        assert_eq!(
            check_err("fn main() -> i64 { 1i64 }"),
            "/t.bt:1:4: main function must return i32"
        );
    }

    #[test]
    fn break_outside_loop() {
        assert_eq!(
            check_err("fn main() -> i32 { break; 0 }"),
            "/t.bt:1:20: break outside of loop"
        );
    }

    #[test]
    fn parameters_are_immutable() {
        assert_eq!(
            check_err("fn f(a: i32) { a = 2; }\nfn main() -> i32 { 0 }"),
            "/t.bt:1:16: cannot assign to immutable local"
        );
    }

    #[test]
    fn locals_get_typed_slots() {
        let (comp, arena) = check(
            "fn main() -> i32 { let a = 1; let wide = 2i64; let unit = (); a }",
        )
        .unwrap();
        let main = comp.find_function(&arena, b"main").unwrap();
        let function = &comp.ast.functions[main as usize];
        // The unit binding takes no slot.
        assert_eq!(function.local_count, 2);
        assert_eq!(function.locals, vec![TypeId::I32, TypeId::I64]);
    }

    #[test]
    fn identical_keys_bind_to_one_clone() {
        let (comp, _) = check(
            "fn scaled(const K: i32, v: i32) -> i32 { v * K }\n\
             fn main() -> i32 { scaled(3, 1) + scaled(3, 2) + scaled(5, 3) }",
        )
        .unwrap();
        let bound: Vec<FuncId> = comp
            .ast
            .calls
            .iter()
            .filter_map(|call| call.resolved)
            .collect();
        assert_eq!(bound.len(), 3);
        assert_eq!(bound[0], bound[1]);
        assert_ne!(bound[0], bound[2]);
        // Template + main + two clones.
        assert_eq!(comp.ast.functions.len(), 4);
    }

    #[test]
    fn templates_are_not_runtime_functions() {
        let (comp, arena) = check(
            "fn pick(const N: i32) -> i32 { N }\nfn main() -> i32 { pick(1) }",
        )
        .unwrap();
        let template = comp.find_function(&arena, b"pick").unwrap();
        assert!(!is_runtime_function(&comp, template));
        let main = comp.find_function(&arena, b"main").unwrap();
        assert!(is_runtime_function(&comp, main));
    }
}
