// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! WebAssembly binary emission.
//!
//! Writes a WebAssembly 1.0 module extended with GC heap types. Heap-type
//! indices are assigned on first use in dependency order (an array's element
//! type is always declared before the array), which keeps emission
//! deterministic: the same program always produces the same bytes.
//!
//! Sub-32-bit integers live as packed i8/i16 storage inside arrays and
//! structs but compute as i32, with explicit sign extension or masking after
//! operations that can overflow the narrow width.

mod leb128;
mod opcode;

use std::collections::HashMap;

use log::debug;

use crate::Compilation;
use crate::arena::Arena;
use crate::diag::{Diagnostic, Pos};
use crate::interp::{Value, ValueData};
use crate::syntax::{
    BinaryOp, Expr, ExprId, ExprKind, ExtraRange, FuncId, FunctionFlags, NONE, Resolution, UnaryOp,
};
use crate::types::{Prim, TypeId, TypeKind};
use crate::validate::is_runtime_function;
use leb128::{write_i32, write_i64, write_s33, write_u32};
use opcode::{
    BLOCKTYPE_EMPTY, FORM_ARRAY, FORM_FUNC, FORM_STRUCT, GcOpcode, MAGIC, MUTABLE, Opcode,
    REF_NONNULL, SectionId, ST_I8, ST_I16, VERSION, VT_I32, VT_I64,
};

/// Minimum memory size, in 64 KiB pages.
const MEMORY_MIN_PAGES: u32 = 16;

/// Emits the validated program as a `.wasm` module.
pub(crate) fn emit(arena: &Arena, comp: &mut Compilation) -> Result<Vec<u8>, Diagnostic> {
    let emitted: Vec<FuncId> = (0..comp.ast.functions.len() as FuncId)
        .filter(|&fid| is_runtime_function(comp, fid))
        .collect();
    let func_map: HashMap<FuncId, u32> = emitted
        .iter()
        .enumerate()
        .map(|(index, &fid)| (fid, index as u32))
        .collect();

    let mut writer = TypeWriter::default();

    // Assign signature (and, transitively, heap) type indices in function
    // order before any code is generated.
    let mut sig_indices = Vec::with_capacity(emitted.len());
    for &fid in &emitted {
        let function = &comp.ast.functions[fid as usize];
        let params: Vec<TypeId> = function.params.iter().map(|param| param.ty).collect();
        let ret = function.ret;
        sig_indices.push(writer.sig_index(comp, &params, ret)?);
    }

    let mut bodies = Vec::with_capacity(emitted.len());
    for &fid in &emitted {
        let mut generator = CodeGen {
            arena,
            comp,
            writer: &mut writer,
            func_map: &func_map,
            path: String::new(),
            out: Vec::new(),
            frames: Vec::new(),
        };
        bodies.push(generator.generate(fid)?);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION);

    // Type section.
    let mut payload = Vec::new();
    write_u32(&mut payload, writer.defs.len() as u32);
    for def in &writer.defs {
        payload.extend_from_slice(def);
    }
    section(&mut out, SectionId::Type, &payload);

    // Function section.
    let mut payload = Vec::new();
    write_u32(&mut payload, emitted.len() as u32);
    for &sig in &sig_indices {
        write_u32(&mut payload, sig);
    }
    section(&mut out, SectionId::Function, &payload);

    // Memory section: one memory with a fixed lower bound.
    let mut payload = Vec::new();
    write_u32(&mut payload, 1);
    payload.push(0x00);
    write_u32(&mut payload, MEMORY_MIN_PAGES);
    section(&mut out, SectionId::Memory, &payload);

    // Export section: the memory, then entry-module functions.
    let exports: Vec<FuncId> = emitted
        .iter()
        .copied()
        .filter(|&fid| {
            comp.ast.functions[fid as usize]
                .flags
                .contains(FunctionFlags::EXPORTED)
        })
        .collect();
    let mut payload = Vec::new();
    write_u32(&mut payload, 1 + exports.len() as u32);
    write_u32(&mut payload, "memory".len() as u32);
    payload.extend_from_slice(b"memory");
    payload.push(0x02);
    write_u32(&mut payload, 0);
    for &fid in &exports {
        let name = arena.slice(comp.ast.functions[fid as usize].name);
        write_u32(&mut payload, name.len() as u32);
        payload.extend_from_slice(name);
        payload.push(0x00);
        write_u32(&mut payload, func_map[&fid]);
    }
    section(&mut out, SectionId::Export, &payload);

    // Code section.
    let mut payload = Vec::new();
    write_u32(&mut payload, bodies.len() as u32);
    for body in &bodies {
        write_u32(&mut payload, body.len() as u32);
        payload.extend_from_slice(body);
    }
    section(&mut out, SectionId::Code, &payload);

    debug!(
        "emitted {} bytes ({} functions, {} types)",
        out.len(),
        emitted.len(),
        writer.defs.len()
    );
    Ok(out)
}

fn section(out: &mut Vec<u8>, id: SectionId, payload: &[u8]) {
    out.push(id.into());
    write_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Assigns WebAssembly type-section indices to composite types and function
/// signatures, encoding their definitions as it goes.
#[derive(Default)]
struct TypeWriter {
    defs: Vec<Vec<u8>>,
}

impl TypeWriter {
    /// The type-section index of an array/tuple/struct heap type, declaring
    /// it (and its element types) on first use.
    fn heap_index(&mut self, comp: &mut Compilation, ty: TypeId) -> Result<u32, Diagnostic> {
        match ty.kind() {
            TypeKind::Array => {
                if let Some(index) = comp.types.array(ty).wasm_index {
                    return Ok(index);
                }
                let element = comp.types.array(ty).element;
                let mut def = vec![FORM_ARRAY];
                self.storage_type(comp, element, &mut def)?;
                def.push(MUTABLE);
                let index = self.push_def(def);
                comp.types.arrays[ty.index()].wasm_index = Some(index);
                Ok(index)
            }
            TypeKind::Tuple => {
                if let Some(index) = comp.types.tuple(ty).wasm_index {
                    return Ok(index);
                }
                let fields = comp.types.tuple(ty).fields.clone();
                let mut def = vec![FORM_STRUCT];
                write_u32(&mut def, fields.len() as u32);
                for field in fields {
                    self.storage_type(comp, field, &mut def)?;
                    def.push(MUTABLE);
                }
                let index = self.push_def(def);
                comp.types.tuples[ty.index()].wasm_index = Some(index);
                Ok(index)
            }
            TypeKind::Struct => {
                if let Some(index) = comp.types.structure(ty).wasm_index {
                    return Ok(index);
                }
                let fields: Vec<TypeId> = comp
                    .types
                    .structure(ty)
                    .fields
                    .iter()
                    .map(|&(_, field)| field)
                    .collect();
                let mut def = vec![FORM_STRUCT];
                write_u32(&mut def, fields.len() as u32);
                for field in fields {
                    self.storage_type(comp, field, &mut def)?;
                    def.push(MUTABLE);
                }
                let index = self.push_def(def);
                comp.types.structs[ty.index()].wasm_index = Some(index);
                Ok(index)
            }
            _ => Err(Diagnostic::bare("type metadata resolution failed")),
        }
    }

    /// Storage type of an array element or struct field: packed forms for
    /// 8/16-bit integers, refs for composites.
    fn storage_type(
        &mut self,
        comp: &mut Compilation,
        ty: TypeId,
        out: &mut Vec<u8>,
    ) -> Result<(), Diagnostic> {
        match ty.as_prim() {
            Some(Prim::I8 | Prim::U8) => out.push(ST_I8),
            Some(Prim::I16 | Prim::U16) => out.push(ST_I16),
            Some(Prim::I32 | Prim::U32 | Prim::Bool) => out.push(VT_I32),
            Some(Prim::I64 | Prim::U64) => out.push(VT_I64),
            Some(Prim::Unit | Prim::Type) => {
                return Err(Diagnostic::bare("type metadata resolution failed"));
            }
            None => {
                let index = self.heap_index(comp, ty)?;
                out.push(REF_NONNULL);
                write_s33(out, i64::from(index));
            }
        }
        Ok(())
    }

    /// Value type of a parameter, local, or result. Narrow integers are i32
    /// at the value level; composites are non-nullable refs (every local is
    /// set before it is read, so null never inhabits one).
    fn value_type(
        &mut self,
        comp: &mut Compilation,
        ty: TypeId,
        out: &mut Vec<u8>,
    ) -> Result<(), Diagnostic> {
        match ty.as_prim() {
            Some(prim) if prim.is_integer() && prim.bit_width() == 64 => out.push(VT_I64),
            Some(prim) if prim.is_integer() || prim == Prim::Bool => out.push(VT_I32),
            Some(_) => return Err(Diagnostic::bare("type metadata resolution failed")),
            None => {
                let index = self.heap_index(comp, ty)?;
                out.push(REF_NONNULL);
                write_s33(out, i64::from(index));
            }
        }
        Ok(())
    }

    /// The type-section index of a function signature, deduplicated by
    /// encoding.
    fn sig_index(
        &mut self,
        comp: &mut Compilation,
        params: &[TypeId],
        ret: TypeId,
    ) -> Result<u32, Diagnostic> {
        let mut def = vec![FORM_FUNC];
        write_u32(&mut def, params.len() as u32);
        for &param in params {
            self.value_type(comp, param, &mut def)?;
        }
        if ret == TypeId::UNIT {
            write_u32(&mut def, 0);
        } else {
            write_u32(&mut def, 1);
            self.value_type(comp, ret, &mut def)?;
        }
        for (index, existing) in self.defs.iter().enumerate() {
            if *existing == def {
                return Ok(index as u32);
            }
        }
        Ok(self.push_def(def))
    }

    fn push_def(&mut self, def: Vec<u8>) -> u32 {
        self.defs.push(def);
        (self.defs.len() - 1) as u32
    }
}

/// Structured-control frames live on a stack so branch targets can be
/// expressed as relative label depths.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Frame {
    If,
    LoopExit,
    LoopTop,
    WhileExit,
    WhileTop,
}

struct CodeGen<'a, 'w> {
    arena: &'a Arena,
    comp: &'a mut Compilation,
    writer: &'w mut TypeWriter,
    func_map: &'w HashMap<FuncId, u32>,
    path: String,
    out: Vec<u8>,
    frames: Vec<Frame>,
}

impl CodeGen<'_, '_> {
    fn error(&self, pos: Pos, message: &str) -> Diagnostic {
        Diagnostic::at(&self.path, pos, message)
    }

    fn op(&mut self, op: Opcode) {
        self.out.push(op.into());
    }

    fn gc(&mut self, op: GcOpcode) {
        self.out.push(Opcode::GcPrefix.into());
        self.out.push(op.into());
    }

    fn blocktype(&mut self, ty: TypeId) -> Result<(), Diagnostic> {
        if ty == TypeId::UNIT {
            self.out.push(BLOCKTYPE_EMPTY);
            return Ok(());
        }
        let mut bytes = Vec::new();
        self.writer.value_type(self.comp, ty, &mut bytes)?;
        self.out.extend_from_slice(&bytes);
        Ok(())
    }

    fn generate(&mut self, fid: FuncId) -> Result<Vec<u8>, Diagnostic> {
        let function = self.comp.ast.functions[fid as usize].clone();
        self.path = self
            .comp
            .module_path(self.arena, function.module)
            .to_owned();

        // Locals, grouped by consecutive identical value types.
        let mut local_types = Vec::with_capacity(function.locals.len());
        for &ty in &function.locals {
            let mut bytes = Vec::new();
            self.writer.value_type(self.comp, ty, &mut bytes)?;
            local_types.push(bytes);
        }
        let mut groups: Vec<(u32, Vec<u8>)> = Vec::new();
        for bytes in local_types {
            match groups.last_mut() {
                Some((count, existing)) if *existing == bytes => *count += 1,
                _ => groups.push((1, bytes)),
            }
        }
        let mut body = Vec::new();
        write_u32(&mut body, groups.len() as u32);
        for (count, bytes) in groups {
            write_u32(&mut body, count);
            body.extend_from_slice(&bytes);
        }

        self.out = Vec::new();
        self.emit_expr(function.body)?;
        self.op(Opcode::End);

        body.append(&mut self.out);
        Ok(body)
    }

    fn expr(&self, id: ExprId) -> Expr {
        self.comp.ast.expr(id)
    }

    /// Normalizes the i32 on top of the stack after an operation that may
    /// have overflowed a narrow width.
    fn narrow_fix(&mut self, ty: TypeId) {
        match ty.as_prim() {
            Some(Prim::I8) => self.op(Opcode::I32Extend8S),
            Some(Prim::I16) => self.op(Opcode::I32Extend16S),
            Some(Prim::U8) => {
                self.op(Opcode::I32Const);
                write_i32(&mut self.out, 0xff);
                self.op(Opcode::I32And);
            }
            Some(Prim::U16) => {
                self.op(Opcode::I32Const);
                write_i32(&mut self.out, 0xffff);
                self.op(Opcode::I32And);
            }
            _ => {}
        }
    }

    fn const_int(&mut self, ty: TypeId, bits: i64) {
        let wide = ty.as_prim().is_some_and(|prim| prim.bit_width() == 64);
        if wide {
            self.op(Opcode::I64Const);
            write_i64(&mut self.out, bits);
        } else {
            self.op(Opcode::I32Const);
            write_i32(&mut self.out, bits as i32);
        }
    }

    /// Materializes a compile-time value at runtime.
    fn emit_value(&mut self, pos: Pos, value: Value) -> Result<(), Diagnostic> {
        match value.data {
            ValueData::Int(bits) => {
                self.const_int(value.ty, bits);
                Ok(())
            }
            ValueData::Unit => Ok(()),
            ValueData::Composite(pool) => {
                let elements: Vec<Value> = self.comp.pool.composite(pool).to_vec();
                for element in &elements {
                    self.emit_value(pos, *element)?;
                }
                let index = self.writer.heap_index(self.comp, value.ty)?;
                match value.ty.kind() {
                    TypeKind::Array => {
                        self.gc(GcOpcode::ArrayNewFixed);
                        write_u32(&mut self.out, index);
                        write_u32(&mut self.out, elements.len() as u32);
                    }
                    _ => {
                        self.gc(GcOpcode::StructNew);
                        write_u32(&mut self.out, index);
                    }
                }
                Ok(())
            }
            ValueData::Type(_) | ValueData::Func(_) => {
                Err(self.error(pos, "type values require a const context"))
            }
        }
    }

    fn break_depth(&self) -> u32 {
        self.frames
            .iter()
            .rev()
            .position(|frame| matches!(frame, Frame::LoopExit | Frame::WhileExit))
            .unwrap_or(0) as u32
    }

    fn continue_depth(&self) -> u32 {
        self.frames
            .iter()
            .rev()
            .position(|frame| matches!(frame, Frame::LoopTop | Frame::WhileTop))
            .unwrap_or(0) as u32
    }

    fn emit_expr(&mut self, id: ExprId) -> Result<(), Diagnostic> {
        let expr = self.expr(id);
        match expr.kind {
            ExprKind::IntLiteral => {
                let raw = u64::from(expr.a) | (u64::from(expr.b) << 32);
                let prim = expr.ty.as_prim().unwrap_or(Prim::I32);
                self.const_int(expr.ty, normalize(raw as i64, prim));
            }
            ExprKind::BoolLiteral | ExprKind::CharLiteral => {
                self.op(Opcode::I32Const);
                write_i32(&mut self.out, expr.a as i32);
            }
            ExprKind::StringLiteral => {
                let bytes: Vec<u8> = self.comp.ast.string_bytes(expr.a, expr.b).to_vec();
                for byte in &bytes {
                    self.op(Opcode::I32Const);
                    write_i32(&mut self.out, i32::from(*byte));
                }
                let index = self.writer.heap_index(self.comp, expr.ty)?;
                self.gc(GcOpcode::ArrayNewFixed);
                write_u32(&mut self.out, index);
                write_u32(&mut self.out, bytes.len() as u32);
            }
            ExprKind::Ident => match Resolution::decode(expr.aux) {
                Some(Resolution::Local(slot)) => {
                    if expr.ty != TypeId::UNIT {
                        self.op(Opcode::LocalGet);
                        write_u32(&mut self.out, slot);
                    }
                }
                Some(Resolution::Constant(index)) => {
                    let value = self.comp.ast.constants[index as usize]
                        .value
                        .expect("constants are evaluated before emission");
                    self.emit_value(expr.pos, value)?;
                }
                _ => return Err(self.error(expr.pos, "identifier not found")),
            },
            ExprKind::ConstValue => {
                let value = self.comp.pool.spliced[expr.a as usize];
                self.emit_value(expr.pos, value)?;
            }
            ExprKind::Binary => self.emit_binary(expr)?,
            ExprKind::Unary => self.emit_unary(expr)?,
            ExprKind::Call => self.emit_call(id, expr)?,
            ExprKind::ArrayRepeat => {
                self.emit_expr(expr.a)?;
                self.emit_expr(expr.b)?;
                let index = self.writer.heap_index(self.comp, expr.ty)?;
                self.gc(GcOpcode::ArrayNew);
                write_u32(&mut self.out, index);
            }
            ExprKind::ArrayList => {
                let items: Vec<ExprId> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    })
                    .to_vec();
                for &item in &items {
                    self.emit_expr(item)?;
                }
                let index = self.writer.heap_index(self.comp, expr.ty)?;
                self.gc(GcOpcode::ArrayNewFixed);
                write_u32(&mut self.out, index);
                write_u32(&mut self.out, items.len() as u32);
            }
            ExprKind::TupleLiteral => {
                let items: Vec<ExprId> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    })
                    .to_vec();
                if items.is_empty() {
                    return Ok(());
                }
                for item in items {
                    self.emit_expr(item)?;
                }
                let index = self.writer.heap_index(self.comp, expr.ty)?;
                self.gc(GcOpcode::StructNew);
                write_u32(&mut self.out, index);
            }
            ExprKind::StructLiteral => {
                let words: Vec<u32> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.b,
                        len: expr.c * 3,
                    })
                    .to_vec();
                for chunk in words.chunks_exact(3) {
                    self.emit_expr(chunk[2])?;
                }
                let index = self.writer.heap_index(self.comp, expr.ty)?;
                self.gc(GcOpcode::StructNew);
                write_u32(&mut self.out, index);
            }
            ExprKind::Index => {
                self.emit_expr(expr.a)?;
                self.emit_expr(expr.b)?;
                let base_ty = self.expr(expr.a).ty;
                let index = self.writer.heap_index(self.comp, base_ty)?;
                let element = self.comp.types.array(base_ty).element;
                self.gc(packed_array_get(element));
                write_u32(&mut self.out, index);
            }
            ExprKind::Field => {
                self.emit_expr(expr.a)?;
                let base_ty = self.expr(expr.a).ty;
                let index = self.writer.heap_index(self.comp, base_ty)?;
                self.gc(packed_struct_get(expr.ty));
                write_u32(&mut self.out, index);
                write_u32(&mut self.out, expr.aux);
            }
            ExprKind::Cast => {
                self.emit_expr(expr.a)?;
                let from = self.expr(expr.a).ty;
                self.emit_cast(from, expr.ty);
            }
            ExprKind::If => {
                self.emit_expr(expr.a)?;
                self.op(Opcode::If);
                self.blocktype(expr.ty)?;
                self.frames.push(Frame::If);
                self.emit_expr(expr.b)?;
                if expr.c != NONE {
                    self.op(Opcode::Else);
                    self.emit_expr(expr.c)?;
                }
                self.op(Opcode::End);
                self.frames.pop();
            }
            ExprKind::Loop => {
                self.op(Opcode::Block);
                self.blocktype(expr.ty)?;
                self.frames.push(Frame::LoopExit);
                self.op(Opcode::Loop);
                self.out.push(BLOCKTYPE_EMPTY);
                self.frames.push(Frame::LoopTop);
                self.emit_statement(expr.a)?;
                self.op(Opcode::Br);
                write_u32(&mut self.out, 0);
                self.op(Opcode::End);
                self.frames.pop();
                if expr.ty != TypeId::UNIT {
                    self.op(Opcode::Unreachable);
                }
                self.op(Opcode::End);
                self.frames.pop();
            }
            ExprKind::While => {
                self.op(Opcode::Block);
                self.out.push(BLOCKTYPE_EMPTY);
                self.frames.push(Frame::WhileExit);
                self.op(Opcode::Loop);
                self.out.push(BLOCKTYPE_EMPTY);
                self.frames.push(Frame::WhileTop);
                self.emit_expr(expr.a)?;
                self.op(Opcode::I32Eqz);
                self.op(Opcode::BrIf);
                write_u32(&mut self.out, 1);
                self.emit_statement(expr.b)?;
                self.op(Opcode::Br);
                write_u32(&mut self.out, 0);
                self.op(Opcode::End);
                self.frames.pop();
                self.op(Opcode::End);
                self.frames.pop();
            }
            ExprKind::Break => {
                if expr.a != NONE {
                    self.emit_expr(expr.a)?;
                }
                self.op(Opcode::Br);
                let depth = self.break_depth();
                write_u32(&mut self.out, depth);
            }
            ExprKind::Continue => {
                self.op(Opcode::Br);
                let depth = self.continue_depth();
                write_u32(&mut self.out, depth);
            }
            ExprKind::Return => {
                if expr.a != NONE {
                    self.emit_expr(expr.a)?;
                }
                self.op(Opcode::Return);
            }
            ExprKind::Block => {
                let items: Vec<ExprId> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    })
                    .to_vec();
                let has_tail = expr.c == 1;
                for (index, &item) in items.iter().enumerate() {
                    if has_tail && index == items.len() - 1 {
                        self.emit_expr(item)?;
                    } else {
                        self.emit_statement(item)?;
                    }
                }
            }
            ExprKind::Let => {
                let words: Vec<u32> = self
                    .comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.c,
                        len: 4,
                    })
                    .to_vec();
                self.emit_expr(words[2])?;
                if expr.aux != NONE {
                    self.op(Opcode::LocalSet);
                    write_u32(&mut self.out, expr.aux);
                }
            }
            ExprKind::Assign => self.emit_assign(expr)?,
            ExprKind::StructTypeExpr | ExprKind::FnTypeExpr | ExprKind::AnonFn => {
                return Err(self.error(expr.pos, "type values require a const context"));
            }
        }
        Ok(())
    }

    /// Emits an expression in statement position, dropping any value.
    fn emit_statement(&mut self, id: ExprId) -> Result<(), Diagnostic> {
        self.emit_expr(id)?;
        let expr = self.expr(id);
        if expr.ty != TypeId::UNIT && expr.ty != TypeId::INVALID {
            self.op(Opcode::Drop);
        }
        Ok(())
    }

    fn emit_binary(&mut self, expr: Expr) -> Result<(), Diagnostic> {
        let op = BinaryOp::try_from(expr.a as u8).unwrap();

        if op.is_logical() {
            // Short-circuit lowering through `if`.
            self.emit_expr(expr.b)?;
            self.op(Opcode::If);
            self.out.push(VT_I32);
            self.frames.push(Frame::If);
            match op {
                BinaryOp::And => {
                    self.emit_expr(expr.c)?;
                    self.op(Opcode::Else);
                    self.op(Opcode::I32Const);
                    write_i32(&mut self.out, 0);
                }
                _ => {
                    self.op(Opcode::I32Const);
                    write_i32(&mut self.out, 1);
                    self.op(Opcode::Else);
                    self.emit_expr(expr.c)?;
                }
            }
            self.op(Opcode::End);
            self.frames.pop();
            return Ok(());
        }

        self.emit_expr(expr.b)?;
        self.emit_expr(expr.c)?;
        let operand_ty = self.expr(expr.b).ty;
        let prim = operand_ty.as_prim().unwrap_or(Prim::I32);
        let wide = prim.is_integer() && prim.bit_width() == 64;
        let signed = prim.is_signed() || prim == Prim::Bool;
        self.op(binary_opcode(op, wide, signed));
        if matches!(
            op,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Shl
        ) {
            self.narrow_fix(expr.ty);
        }
        Ok(())
    }

    fn emit_unary(&mut self, expr: Expr) -> Result<(), Diagnostic> {
        let op = UnaryOp::try_from(expr.a as u8).unwrap();
        match op {
            UnaryOp::Neg => {
                let wide = expr
                    .ty
                    .as_prim()
                    .is_some_and(|prim| prim.bit_width() == 64);
                if wide {
                    self.op(Opcode::I64Const);
                    write_i64(&mut self.out, 0);
                } else {
                    self.op(Opcode::I32Const);
                    write_i32(&mut self.out, 0);
                }
                self.emit_expr(expr.b)?;
                self.op(if wide { Opcode::I64Sub } else { Opcode::I32Sub });
                self.narrow_fix(expr.ty);
            }
            UnaryOp::Not => {
                self.emit_expr(expr.b)?;
                self.op(Opcode::I32Eqz);
            }
        }
        Ok(())
    }

    fn emit_cast(&mut self, from: TypeId, to: TypeId) {
        let from = from.as_prim().unwrap_or(Prim::I32);
        let to = to.as_prim().unwrap_or(Prim::I32);
        let from_wide = from.is_integer() && from.bit_width() == 64;
        let to_wide = to.bit_width() == 64;
        match (from_wide, to_wide) {
            (true, true) => {}
            (false, true) => {
                // Bool and unsigned sources zero-extend.
                if from.is_signed() {
                    self.op(Opcode::I64ExtendI32S);
                } else {
                    self.op(Opcode::I64ExtendI32U);
                }
            }
            (true, false) => {
                self.op(Opcode::I32WrapI64);
                self.narrow_fix(TypeId::primitive(to));
            }
            (false, false) => {
                if from.bit_width() != to.bit_width() || from.is_signed() != to.is_signed() {
                    self.narrow_fix(TypeId::primitive(to));
                }
            }
        }
    }

    fn emit_assign(&mut self, expr: Expr) -> Result<(), Diagnostic> {
        let target = self.expr(expr.a);
        match target.kind {
            ExprKind::Ident => {
                self.emit_expr(expr.b)?;
                match Resolution::decode(target.aux) {
                    Some(Resolution::Local(slot)) if target.ty != TypeId::UNIT => {
                        self.op(Opcode::LocalSet);
                        write_u32(&mut self.out, slot);
                    }
                    _ => {}
                }
            }
            ExprKind::Index => {
                self.emit_expr(target.a)?;
                self.emit_expr(target.b)?;
                self.emit_expr(expr.b)?;
                let base_ty = self.expr(target.a).ty;
                let index = self.writer.heap_index(self.comp, base_ty)?;
                self.gc(GcOpcode::ArraySet);
                write_u32(&mut self.out, index);
            }
            ExprKind::Field => {
                self.emit_expr(target.a)?;
                self.emit_expr(expr.b)?;
                let base_ty = self.expr(target.a).ty;
                let index = self.writer.heap_index(self.comp, base_ty)?;
                self.gc(GcOpcode::StructSet);
                write_u32(&mut self.out, index);
                write_u32(&mut self.out, target.aux);
            }
            _ => return Err(self.error(target.pos, "cannot assign to this expression")),
        }
        Ok(())
    }

    fn emit_call(&mut self, id: ExprId, expr: Expr) -> Result<(), Diagnostic> {
        let callee = self.expr(expr.a);
        let call = self.comp.ast.calls[expr.b as usize];
        let args: Vec<ExprId> = self.comp.ast.extra_words(call.args).to_vec();

        if callee.kind == ExprKind::Ident {
            match Resolution::decode(callee.aux) {
                Some(Resolution::BuiltinLen) => {
                    self.emit_expr(args[0])?;
                    self.gc(GcOpcode::ArrayLen);
                    return Ok(());
                }
                Some(Resolution::BuiltinInlineWasm) => {
                    // The validator stashed the literal bytes in the string
                    // pool, keyed by this expression's aux word.
                    let list = self.expr(args[0]);
                    let bytes: Vec<u8> = self
                        .comp
                        .ast
                        .string_bytes(self.comp.ast.expr(id).aux, list.b)
                        .to_vec();
                    self.out.extend_from_slice(&bytes);
                    return Ok(());
                }
                _ => {}
            }
        }

        let Some(resolved) = call.resolved else {
            return Err(self.error(expr.pos, "call requires a function"));
        };
        for (index, &arg) in args.iter().enumerate() {
            if call.const_mask & (1 << index) != 0 {
                continue;
            }
            self.emit_expr(arg)?;
        }
        self.op(Opcode::Call);
        let wasm_index = self.func_map[&resolved];
        write_u32(&mut self.out, wasm_index);
        Ok(())
    }
}

// Wraps `bits` to the canonical representation of `prim`. Mirrors the
// interpreter so literals and const values always materialize canonically.
fn normalize(bits: i64, prim: Prim) -> i64 {
    match prim {
        Prim::I8 => i64::from(bits as i8),
        Prim::I16 => i64::from(bits as i16),
        Prim::I32 => i64::from(bits as i32),
        Prim::U8 => bits & 0xff,
        Prim::U16 => bits & 0xffff,
        Prim::U32 => bits & 0xffff_ffff,
        _ => bits,
    }
}

fn packed_array_get(element: TypeId) -> GcOpcode {
    match element.as_prim() {
        Some(Prim::I8 | Prim::I16) => GcOpcode::ArrayGetS,
        Some(Prim::U8 | Prim::U16) => GcOpcode::ArrayGetU,
        _ => GcOpcode::ArrayGet,
    }
}

fn packed_struct_get(field: TypeId) -> GcOpcode {
    match field.as_prim() {
        Some(Prim::I8 | Prim::I16) => GcOpcode::StructGetS,
        Some(Prim::U8 | Prim::U16) => GcOpcode::StructGetU,
        _ => GcOpcode::StructGet,
    }
}

fn binary_opcode(op: BinaryOp, wide: bool, signed: bool) -> Opcode {
    use BinaryOp::*;
    use Opcode::*;
    match (op, wide, signed) {
        (Add, false, _) => I32Add,
        (Add, true, _) => I64Add,
        (Sub, false, _) => I32Sub,
        (Sub, true, _) => I64Sub,
        (Mul, false, _) => I32Mul,
        (Mul, true, _) => I64Mul,
        (Div, false, true) => I32DivS,
        (Div, false, false) => I32DivU,
        (Div, true, true) => I64DivS,
        (Div, true, false) => I64DivU,
        (Rem, false, true) => I32RemS,
        (Rem, false, false) => I32RemU,
        (Rem, true, true) => I64RemS,
        (Rem, true, false) => I64RemU,
        (BitAnd, false, _) => I32And,
        (BitAnd, true, _) => I64And,
        (BitOr, false, _) => I32Or,
        (BitOr, true, _) => I64Or,
        (BitXor, false, _) => I32Xor,
        (BitXor, true, _) => I64Xor,
        (Shl, false, _) => I32Shl,
        (Shl, true, _) => I64Shl,
        (Shr, false, true) => I32ShrS,
        (Shr, false, false) => I32ShrU,
        (Shr, true, true) => I64ShrS,
        (Shr, true, false) => I64ShrU,
        (Eq, false, _) => I32Eq,
        (Eq, true, _) => I64Eq,
        (Ne, false, _) => I32Ne,
        (Ne, true, _) => I64Ne,
        (Lt, false, true) => I32LtS,
        (Lt, false, false) => I32LtU,
        (Lt, true, true) => I64LtS,
        (Lt, true, false) => I64LtU,
        (Le, false, true) => I32LeS,
        (Le, false, false) => I32LeU,
        (Le, true, true) => I64LeS,
        (Le, true, false) => I64LeU,
        (Gt, false, true) => I32GtS,
        (Gt, false, false) => I32GtU,
        (Gt, true, true) => I64GtS,
        (Gt, true, false) => I64GtU,
        (Ge, false, true) => I32GeS,
        (Ge, false, false) => I32GeU,
        (Ge, true, true) => I64GeS,
        (Ge, true, false) => I64GeU,
        (And | Or, _, _) => unreachable!("logical operators lower through if"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_opcode_selection() {
        assert_eq!(binary_opcode(BinaryOp::Add, false, true), Opcode::I32Add);
        assert_eq!(binary_opcode(BinaryOp::Div, false, false), Opcode::I32DivU);
        assert_eq!(binary_opcode(BinaryOp::Div, true, true), Opcode::I64DivS);
        assert_eq!(binary_opcode(BinaryOp::Shr, false, false), Opcode::I32ShrU);
        assert_eq!(binary_opcode(BinaryOp::Lt, true, false), Opcode::I64LtU);
    }

    #[test]
    fn packed_accessors_follow_signedness() {
        assert_eq!(packed_array_get(TypeId::I8), GcOpcode::ArrayGetS);
        assert_eq!(packed_array_get(TypeId::U8), GcOpcode::ArrayGetU);
        assert_eq!(packed_array_get(TypeId::I32), GcOpcode::ArrayGet);
        assert_eq!(packed_struct_get(TypeId::U16), GcOpcode::StructGetU);
        assert_eq!(packed_struct_get(TypeId::I64), GcOpcode::StructGet);
    }
}
