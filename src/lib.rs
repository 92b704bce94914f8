// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! An ahead-of-time compiler for the Batter systems language, targeting
//! WebAssembly with GC (typed-reference) heap types.
//!
//! The compiler is a sequential pipeline over a fixed-layout linear-memory
//! arena: module loading and resolution, lexing, parsing into table-backed
//! syntax records, compile-time (`const`) interpretation with generic
//! specialization, semantic validation, and binary emission. Hosts drive it
//! through two entry points, [`Compiler::load_module_from_source`] and
//! [`Compiler::compile_from_path`], and read results (or diagnostics) from
//! the arena at the documented offsets, so the whole thing can equally be
//! hosted behind a pair of wasm exports.

mod arena;
mod diag;
mod emit;
mod interp;
mod lex;
mod parse;
mod registry;
mod syntax;
mod types;
mod validate;

use std::collections::HashMap;

use log::debug;

pub use arena::{
    DIAGNOSTIC_CAPACITY, MEMORY_SIZE, MODULE_CAPACITY, MODULE_CONTENT_PTR, MODULE_ENTRY_SIZE,
    MODULE_PATH_PTR, MODULE_STATE_BASE, MODULE_STORAGE_BASE,
};
pub use diag::{Diagnostic, Error, Pos};
pub use interp::ITERATION_BOUND;
pub use syntax::{
    CALL_CAPACITY, CONSTANT_CAPACITY, EXPR_CAPACITY, EXTRA_CAPACITY, FUNCTION_CAPACITY,
};
pub use types::{MAX_STRUCT_FIELDS, MAX_TUPLE_FIELDS, Prim, TYPE_TABLE_CAPACITY, TypeId, TypeKind};

use arena::{Arena, DBG_COMPILED_FUNCTIONS, DBG_FUNCTION_COUNT, DBG_INSTRUCTION_CURSOR, Span};
use interp::specialize::ConstKey;
use interp::{Interp, ValuePool};
use syntax::{Ast, FuncId, ModuleId};
use types::TypeTables;

/// One module visible to the current compile.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ModuleInfo {
    pub registry_index: usize,
    pub path: Span,
    pub content: Span,
    pub parsed: bool,
}

/// All per-compile state: syntax tables, type tables, compile-time values,
/// and the module snapshot. Constructed fresh at the top of every compile;
/// the registry in the arena is the only state that survives.
pub(crate) struct Compilation {
    pub ast: Ast,
    pub types: TypeTables,
    pub pool: ValuePool,
    pub modules: Vec<ModuleInfo>,
    pub entry: ModuleId,
    pub spec_cache: HashMap<(FuncId, ConstKey), FuncId>,
}

impl Compilation {
    pub(crate) fn snapshot(arena: &Arena, entry: ModuleId) -> Self {
        let modules = (0..arena.module_count())
            .map(|index| {
                let entry = registry::read_entry(arena, index);
                ModuleInfo {
                    registry_index: index,
                    path: entry.path,
                    content: entry.content,
                    parsed: false,
                }
            })
            .collect();
        Self {
            ast: Ast::default(),
            types: TypeTables::default(),
            pool: ValuePool::default(),
            modules,
            entry,
            spec_cache: HashMap::new(),
        }
    }

    pub(crate) fn module_path<'a>(&self, arena: &'a Arena, module: ModuleId) -> &'a str {
        arena.text(self.modules[module as usize].path)
    }

    pub(crate) fn find_module(&self, arena: &Arena, path: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|module| arena.slice(module.path) == path.as_bytes())
            .map(|index| index as ModuleId)
    }

    pub(crate) fn find_constant(&self, arena: &Arena, name: &[u8]) -> Option<u32> {
        self.ast
            .constants
            .iter()
            .position(|constant| arena.slice(constant.name) == name)
            .map(|index| index as u32)
    }

    pub(crate) fn find_function(&self, arena: &Arena, name: &[u8]) -> Option<FuncId> {
        self.ast
            .functions
            .iter()
            .position(|function| {
                !function.flags.contains(syntax::FunctionFlags::ANONYMOUS)
                    && arena.slice(function.name) == name
            })
            .map(|index| index as FuncId)
    }
}

/// A compiler instance owning one linear-memory arena.
///
/// Instances are single-threaded and synchronous; hosts needing parallelism
/// run one instance per compile.
pub struct Compiler {
    arena: Arena,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
        }
    }

    /// The full linear memory, for hosts that read results by offset.
    pub fn memory(&self) -> &[u8] {
        self.arena.bytes()
    }

    /// Loads (or fully replaces) the module stored under `path`.
    ///
    /// Equivalent to the `loadModuleFromSource` export: on failure the
    /// rendered diagnostic is also written as a zero-terminated string at
    /// the output base, and the error's negative status is what a wasm host
    /// would see.
    pub fn load_module_from_source(&mut self, path: &str, content: &str) -> Result<(), Error> {
        // Mirror the call arguments at their contractual offsets.
        write_scratch_string(&mut self.arena, MODULE_PATH_PTR, MODULE_CONTENT_PTR, path);
        write_scratch_string(&mut self.arena, MODULE_CONTENT_PTR, MODULE_STATE_BASE, content);

        let result = registry::load(&mut self.arena, path, content);
        if let Err(error) = &result {
            self.arena.write_diagnostic(&error.to_string());
        }
        result
    }

    /// Compiles the module stored under `path`, returning the produced
    /// `.wasm` bytes (a view of the arena at the output base).
    ///
    /// Equivalent to the `compileFromPath` export: the returned slice length
    /// is the positive status, and on failure the diagnostic is written at
    /// the output base.
    pub fn compile_from_path(&mut self, path: &str) -> Result<&[u8], Error> {
        write_scratch_string(&mut self.arena, MODULE_PATH_PTR, MODULE_CONTENT_PTR, path);
        match self.compile_inner(path) {
            Ok(range) => Ok(&self.arena.bytes()[range.0..range.1]),
            Err(error) => {
                self.arena.write_diagnostic(&error.to_string());
                Err(error)
            }
        }
    }

    fn compile_inner(&mut self, path: &str) -> Result<(usize, usize), Error> {
        if path.is_empty() {
            return Err(Error::PathMissing);
        }
        let Some(index) = registry::find(&self.arena, path) else {
            return Err(Error::ModuleNotLoaded);
        };
        let entry = registry::read_entry(&self.arena, index);
        if entry.content.ptr == 0 {
            return Err(Error::CachedModuleMissingContent);
        }

        // Per-compile state starts from scratch; only the registry persists.
        registry::clear_flags(&mut self.arena);
        let mut comp = Compilation::snapshot(&self.arena, index as ModuleId);
        debug!("compiling {path}");

        let entry = comp.entry;
        let bytes = (|| {
            parse::parse_module(&self.arena, &mut comp, entry)?;
            let mut interp = Interp::new(&self.arena);
            interp.eval_constants(&mut comp)?;
            validate::validate(&self.arena, &mut comp)?;
            emit::emit(&self.arena, &mut comp)
        })()
        .map_err(Error::Compile)?;

        for module in &comp.modules {
            if module.parsed {
                registry::set_flag(&mut self.arena, module.registry_index, registry::FLAG_PARSED);
            }
        }

        let compiled = (0..comp.ast.functions.len() as FuncId)
            .filter(|&fid| validate::is_runtime_function(&comp, fid))
            .count();
        self.arena
            .write_debug_counter(DBG_FUNCTION_COUNT, comp.ast.functions.len() as u32);
        self.arena
            .write_debug_counter(DBG_COMPILED_FUNCTIONS, compiled as u32);
        self.arena
            .write_debug_counter(DBG_INSTRUCTION_CURSOR, bytes.len() as u32);

        let base = self.arena.storage_top();
        if base + bytes.len() > MEMORY_SIZE {
            return Err(Error::Compile(Diagnostic::bare("linear memory exhausted")));
        }
        self.arena.write_bytes(base, &bytes);
        Ok((base, base + bytes.len()))
    }
}

// Mirrors an entry-point argument at its fixed offset (truncated to the
// region), for hosts inspecting the arena.
fn write_scratch_string(arena: &mut Arena, offset: usize, region_end: usize, text: &str) {
    let capacity = region_end - offset - 1;
    let mut bytes = text.as_bytes();
    if bytes.len() > capacity {
        bytes = &bytes[..capacity];
    }
    arena.write_bytes(offset, bytes);
    arena.write_bytes(offset + bytes.len(), &[0]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_program_compiles() {
        let mut compiler = Compiler::new();
        compiler
            .load_module_from_source("/main.bt", "fn main() -> i32 { 42 }")
            .unwrap();
        let bytes = compiler.compile_from_path("/main.bt").unwrap();
        assert_eq!(&bytes[..8], b"\0asm\x01\0\0\0");
    }

    #[test]
    fn compile_unknown_module_fails() {
        let mut compiler = Compiler::new();
        let error = compiler.compile_from_path("/nope.bt").unwrap_err();
        assert_eq!(error, Error::ModuleNotLoaded);
        assert_eq!(error.status(), -5);
    }

    #[test]
    fn failure_writes_diagnostic_at_output_base() {
        let mut compiler = Compiler::new();
        compiler
            .load_module_from_source("/main.bt", "fn main() -> i32 { nope }")
            .unwrap();
        let error = compiler.compile_from_path("/main.bt").unwrap_err();
        let Error::Compile(diagnostic) = &error else {
            panic!("expected a compile error, got {error:?}");
        };
        assert_eq!(diagnostic.to_string(), "/main.bt:1:20: identifier not found");

        // The first bytes at the output base form the same C string.
        let base = u32::from_le_bytes(
            compiler.memory()[MODULE_STATE_BASE + 4..MODULE_STATE_BASE + 8]
                .try_into()
                .unwrap(),
        ) as usize;
        let tail = &compiler.memory()[base..];
        let end = tail.iter().position(|&b| b == 0).unwrap();
        assert_eq!(
            str::from_utf8(&tail[..end]).unwrap(),
            "/main.bt:1:20: identifier not found"
        );
    }

    #[test]
    fn reload_supersedes_previous_source() {
        let mut compiler = Compiler::new();
        compiler
            .load_module_from_source("/main.bt", "fn main() -> i32 { 1 }")
            .unwrap();
        let first = compiler.compile_from_path("/main.bt").unwrap().to_vec();
        compiler
            .load_module_from_source("/main.bt", "fn main() -> i32 { 2 }")
            .unwrap();
        let second = compiler.compile_from_path("/main.bt").unwrap().to_vec();
        assert_ne!(first, second);

        // And an identical reload reproduces identical output.
        compiler
            .load_module_from_source("/main.bt", "fn main() -> i32 { 1 }")
            .unwrap();
        let third = compiler.compile_from_path("/main.bt").unwrap().to_vec();
        assert_eq!(first, third);
    }
}
