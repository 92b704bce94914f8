// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Const-parameter specialization.
//!
//! A function with const parameters is a compile-time template. Each call
//! site's const arguments form a key of sorted (parameter index, value word,
//! type id) triples; every distinct key produces one monomorphized clone
//! with the const parameters substituted by their captured values. Clones
//! share the function table (and its limit) with declared functions and are
//! never exported.

use log::debug;

use super::{Env, Interp, Value};
use crate::Compilation;
use crate::arena::Span;
use crate::diag::{Diagnostic, Pos};
use crate::syntax::{Expr, ExprId, ExprKind, ExtraRange, FuncId, FunctionFlags, NONE, Param};
use crate::types::TypeId;

/// A specialization key: sorted (param index, value word, type id) triples.
pub(crate) type ConstKey = Vec<(u32, i64, u32)>;

pub(crate) fn const_key(args: &[(u32, Value)]) -> ConstKey {
    let mut key: ConstKey = args
        .iter()
        .map(|&(index, value)| (index, value.key_word(), value.ty.bits()))
        .collect();
    key.sort_unstable();
    key
}

impl Interp<'_> {
    /// Binds a call to `origin` given its evaluated const arguments,
    /// returning the concrete function to call (a cached or fresh clone).
    pub(crate) fn specialize(
        &mut self,
        comp: &mut Compilation,
        caller_module: u32,
        origin: FuncId,
        const_args: &[(u32, Value)],
        pos: Pos,
    ) -> Result<FuncId, Diagnostic> {
        let key = const_key(const_args);
        if let Some(&clone) = comp.spec_cache.get(&(origin, key.clone())) {
            return Ok(clone);
        }

        let template = comp.ast.functions[origin as usize].clone();
        let mut cloner = Cloner {
            arena: self.arena,
            map: template
                .params
                .iter()
                .zip(const_args.iter().map(|&(_, value)| value))
                .filter(|(param, _)| param.is_const)
                .map(|(param, value)| (self.arena.slice(param.name).to_vec(), value))
                .collect(),
            shadowed: Vec::new(),
            path: comp.module_path(self.arena, template.module).to_owned(),
        };

        let mut params = Vec::with_capacity(template.params.len());
        for param in template.params.iter().filter(|param| !param.is_const) {
            params.push(Param {
                name: param.name,
                ty_expr: cloner.clone_expr(comp, param.ty_expr)?,
                is_const: false,
                ty: TypeId::INVALID,
            });
        }
        let ret_expr = match template.ret_expr {
            Some(ret) => Some(cloner.clone_expr(comp, ret)?),
            None => None,
        };
        let body = cloner.clone_expr(comp, template.body)?;

        let mut flags = template.flags;
        flags.remove(FunctionFlags::HAS_CONST_PARAMS | FunctionFlags::EXPORTED);
        flags |= FunctionFlags::SPECIALIZATION;
        let clone = comp
            .ast
            .add_function(crate::syntax::Function {
                name: template.name,
                module: template.module,
                pos: template.pos,
                params,
                ret_expr,
                ret: TypeId::INVALID,
                body,
                flags,
                local_count: 0,
                locals: Vec::new(),
                origin: Some(origin),
            })
            .map_err(|_| {
                Diagnostic::at(
                    comp.module_path(self.arena, caller_module),
                    pos,
                    "const specialization function limit exceeded",
                )
            })?;

        // Resolve the clone's signature now so the caller can check its
        // runtime arguments.
        let mut env = Env::default();
        for index in 0..comp.ast.functions[clone as usize].params.len() {
            let ty_expr = comp.ast.functions[clone as usize].params[index].ty_expr;
            let ty = self.eval_type(comp, template.module, &mut env, ty_expr)?;
            comp.ast.functions[clone as usize].params[index].ty = ty;
        }
        let ret = match comp.ast.functions[clone as usize].ret_expr {
            Some(ret_expr) => self.eval_type(comp, template.module, &mut env, ret_expr)?,
            None => TypeId::UNIT,
        };
        comp.ast.functions[clone as usize].ret = ret;

        debug!(
            "specialized {} -> clone {clone} ({} keys cached)",
            self.arena.text(template.name),
            comp.spec_cache.len() + 1
        );
        comp.spec_cache.insert((origin, key), clone);
        Ok(clone)
    }
}

/// Deep-copies an expression tree, substituting const-parameter references
/// with captured values. Names shadowed by `let` bindings or inner function
/// parameters are left untouched.
struct Cloner<'a> {
    arena: &'a crate::arena::Arena,
    map: Vec<(Vec<u8>, Value)>,
    shadowed: Vec<Vec<u8>>,
    path: String,
}

impl Cloner<'_> {
    fn substitution(&self, name: &[u8]) -> Option<Value> {
        if self.shadowed.iter().any(|shadow| shadow == name) {
            return None;
        }
        self.map
            .iter()
            .find(|(param, _)| param == name)
            .map(|&(_, value)| value)
    }

    fn add(&self, comp: &mut Compilation, expr: Expr) -> Result<ExprId, Diagnostic> {
        comp.ast
            .add_expr(expr)
            .map_err(|d| d.locate(&self.path, expr.pos))
    }

    fn clone_list(
        &mut self,
        comp: &mut Compilation,
        range: ExtraRange,
    ) -> Result<ExtraRange, Diagnostic> {
        let items: Vec<u32> = comp.ast.extra_words(range).to_vec();
        let mut cloned = Vec::with_capacity(items.len());
        for item in items {
            cloned.push(self.clone_expr(comp, item)?);
        }
        comp.ast
            .add_extra(&cloned)
            .map_err(|d| d.locate(&self.path, Pos::START))
    }

    fn clone_expr(&mut self, comp: &mut Compilation, id: ExprId) -> Result<ExprId, Diagnostic> {
        let expr = comp.ast.expr(id);
        let cloned = match expr.kind {
            ExprKind::Ident => {
                let name = Span {
                    ptr: expr.a,
                    len: expr.b,
                };
                let text = self.arena.slice(name).to_vec();
                if let Some(value) = self.substitution(&text) {
                    let index = comp.pool.splice(value);
                    Expr {
                        kind: ExprKind::ConstValue,
                        a: index,
                        ..expr
                    }
                } else {
                    expr
                }
            }
            ExprKind::IntLiteral
            | ExprKind::BoolLiteral
            | ExprKind::StringLiteral
            | ExprKind::CharLiteral
            | ExprKind::Continue
            | ExprKind::ConstValue => expr,
            ExprKind::Binary => {
                let lhs = self.clone_expr(comp, expr.b)?;
                let rhs = self.clone_expr(comp, expr.c)?;
                Expr {
                    b: lhs,
                    c: rhs,
                    ..expr
                }
            }
            ExprKind::Unary => {
                let operand = self.clone_expr(comp, expr.b)?;
                Expr { b: operand, ..expr }
            }
            ExprKind::Call => {
                let callee = self.clone_expr(comp, expr.a)?;
                let call = comp.ast.calls[expr.b as usize];
                let args = self.clone_list(comp, call.args)?;
                let call = comp
                    .ast
                    .add_call(crate::syntax::CallData {
                        args,
                        resolved: None,
                        const_mask: 0,
                    })
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                Expr {
                    a: callee,
                    b: call,
                    ..expr
                }
            }
            ExprKind::ArrayRepeat => {
                let element = self.clone_expr(comp, expr.a)?;
                let length = self.clone_expr(comp, expr.b)?;
                Expr {
                    a: element,
                    b: length,
                    ..expr
                }
            }
            ExprKind::ArrayList | ExprKind::TupleLiteral => {
                let range = self.clone_list(
                    comp,
                    ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    },
                )?;
                Expr {
                    a: range.start,
                    b: range.len,
                    ..expr
                }
            }
            ExprKind::StructLiteral => {
                let ty_expr = self.clone_expr(comp, expr.a)?;
                let words: Vec<u32> = comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.b,
                        len: expr.c * 3,
                    })
                    .to_vec();
                let mut cloned = Vec::with_capacity(words.len());
                for chunk in words.chunks_exact(3) {
                    cloned.push(chunk[0]);
                    cloned.push(chunk[1]);
                    cloned.push(self.clone_expr(comp, chunk[2])?);
                }
                let range = comp
                    .ast
                    .add_extra(&cloned)
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                Expr {
                    a: ty_expr,
                    b: range.start,
                    ..expr
                }
            }
            ExprKind::StructTypeExpr => {
                let words: Vec<u32> = comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.a,
                        len: expr.b * 3,
                    })
                    .to_vec();
                let mut cloned = Vec::with_capacity(words.len());
                for chunk in words.chunks_exact(3) {
                    cloned.push(chunk[0]);
                    cloned.push(chunk[1]);
                    cloned.push(self.clone_expr(comp, chunk[2])?);
                }
                let range = comp
                    .ast
                    .add_extra(&cloned)
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                Expr {
                    a: range.start,
                    ..expr
                }
            }
            ExprKind::FnTypeExpr => {
                let range = self.clone_list(
                    comp,
                    ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    },
                )?;
                let ret = if expr.c == NONE {
                    NONE
                } else {
                    self.clone_expr(comp, expr.c)?
                };
                Expr {
                    a: range.start,
                    b: range.len,
                    c: ret,
                    ..expr
                }
            }
            ExprKind::Index => {
                let base = self.clone_expr(comp, expr.a)?;
                let index = self.clone_expr(comp, expr.b)?;
                Expr {
                    a: base,
                    b: index,
                    ..expr
                }
            }
            ExprKind::Field => {
                let base = self.clone_expr(comp, expr.a)?;
                Expr { a: base, ..expr }
            }
            ExprKind::Cast => {
                let operand = self.clone_expr(comp, expr.a)?;
                let ty = self.clone_expr(comp, expr.b)?;
                Expr {
                    a: operand,
                    b: ty,
                    ..expr
                }
            }
            ExprKind::If => {
                let condition = self.clone_expr(comp, expr.a)?;
                let then = self.clone_expr(comp, expr.b)?;
                let otherwise = if expr.c == NONE {
                    NONE
                } else {
                    self.clone_expr(comp, expr.c)?
                };
                Expr {
                    a: condition,
                    b: then,
                    c: otherwise,
                    ..expr
                }
            }
            ExprKind::Loop => {
                let body = self.clone_expr(comp, expr.a)?;
                Expr { a: body, ..expr }
            }
            ExprKind::While => {
                let condition = self.clone_expr(comp, expr.a)?;
                let body = self.clone_expr(comp, expr.b)?;
                Expr {
                    a: condition,
                    b: body,
                    ..expr
                }
            }
            ExprKind::Break | ExprKind::Return => {
                let value = if expr.a == NONE {
                    NONE
                } else {
                    self.clone_expr(comp, expr.a)?
                };
                Expr { a: value, ..expr }
            }
            ExprKind::Block => {
                let mark = self.shadowed.len();
                let items: Vec<u32> = comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.a,
                        len: expr.b,
                    })
                    .to_vec();
                let mut cloned = Vec::with_capacity(items.len());
                let result = (|| {
                    for item in items {
                        cloned.push(self.clone_expr(comp, item)?);
                    }
                    Ok(())
                })();
                self.shadowed.truncate(mark);
                result?;
                let range = comp
                    .ast
                    .add_extra(&cloned)
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                Expr {
                    a: range.start,
                    b: range.len,
                    ..expr
                }
            }
            ExprKind::Let => {
                let words: Vec<u32> = comp
                    .ast
                    .extra_words(ExtraRange {
                        start: expr.c,
                        len: 4,
                    })
                    .to_vec();
                let ty_expr = if words[1] == NONE {
                    NONE
                } else {
                    self.clone_expr(comp, words[1])?
                };
                let init = self.clone_expr(comp, words[2])?;
                // The binding shadows the substituted name from here on.
                self.shadowed.push(
                    self.arena
                        .slice(Span {
                            ptr: expr.a,
                            len: expr.b,
                        })
                        .to_vec(),
                );
                let range = comp
                    .ast
                    .add_extra(&[words[0], ty_expr, init, NONE])
                    .map_err(|d| d.locate(&self.path, expr.pos))?;
                Expr {
                    c: range.start,
                    ..expr
                }
            }
            ExprKind::Assign => {
                let target = self.clone_expr(comp, expr.a)?;
                let value = self.clone_expr(comp, expr.b)?;
                Expr {
                    a: target,
                    b: value,
                    ..expr
                }
            }
            ExprKind::AnonFn => {
                let func = expr.a;
                let inner = comp.ast.functions[func as usize].clone();
                let mark = self.shadowed.len();
                for param in &inner.params {
                    self.shadowed.push(self.arena.slice(param.name).to_vec());
                }
                let result = (|| {
                    let mut params = Vec::with_capacity(inner.params.len());
                    for param in &inner.params {
                        params.push(Param {
                            name: param.name,
                            ty_expr: self.clone_expr(comp, param.ty_expr)?,
                            is_const: param.is_const,
                            ty: TypeId::INVALID,
                        });
                    }
                    let ret_expr = match inner.ret_expr {
                        Some(ret) => Some(self.clone_expr(comp, ret)?),
                        None => None,
                    };
                    let body = self.clone_expr(comp, inner.body)?;
                    comp.ast
                        .add_function(crate::syntax::Function {
                            name: inner.name,
                            module: inner.module,
                            pos: inner.pos,
                            params,
                            ret_expr,
                            ret: TypeId::INVALID,
                            body,
                            flags: inner.flags,
                            local_count: 0,
                            locals: Vec::new(),
                            origin: Some(func),
                        })
                        .map_err(|d| d.locate(&self.path, expr.pos))
                })();
                self.shadowed.truncate(mark);
                Expr { a: result?, ..expr }
            }
        };
        self.add(comp, Expr { ty: TypeId::INVALID, aux: NONE, ..cloned })
    }
}
