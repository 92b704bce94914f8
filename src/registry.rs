// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! The module registry.
//!
//! Maps canonical module paths to stored source bytes inside the arena.
//! Entries are serialized at [`MODULE_STATE_BASE`](crate::arena::MODULE_STATE_BASE)
//! so hosts can inspect the table; contents are CRLF-normalized on the way in
//! so diagnostics have stable line numbers across hosts.

use log::debug;

use crate::arena::{Arena, MODULE_CAPACITY, MODULE_ENTRY_SIZE, MODULE_STATE_BASE, Span};
use crate::diag::Error;

// Entry flag bit recording that the module was parsed by the last compile.
pub(crate) const FLAG_PARSED: u32 = 1;

/// A registry entry snapshot. Path and content are spans of module storage.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ModuleEntry {
    pub path: Span,
    pub content: Span,
    pub flags: u32,
}

fn entry_offset(index: usize) -> usize {
    MODULE_STATE_BASE + 8 + index * MODULE_ENTRY_SIZE
}

pub(crate) fn read_entry(arena: &Arena, index: usize) -> ModuleEntry {
    let at = entry_offset(index);
    ModuleEntry {
        path: Span {
            ptr: arena.read_u32(at),
            len: arena.read_u32(at + 4),
        },
        content: Span {
            ptr: arena.read_u32(at + 8),
            len: arena.read_u32(at + 12),
        },
        flags: arena.read_u32(at + 16),
    }
}

fn write_entry(arena: &mut Arena, index: usize, entry: ModuleEntry) {
    let at = entry_offset(index);
    arena.write_u32(at, entry.path.ptr);
    arena.write_u32(at + 4, entry.path.len);
    arena.write_u32(at + 8, entry.content.ptr);
    arena.write_u32(at + 12, entry.content.len);
    arena.write_u32(at + 16, entry.flags);
}

/// Finds the registry index of `path`, comparing stored path bytes.
pub(crate) fn find(arena: &Arena, path: &str) -> Option<usize> {
    (0..arena.module_count()).find(|&index| {
        let entry = read_entry(arena, index);
        arena.slice(entry.path) == path.as_bytes()
    })
}

/// Inserts or replaces the module stored under `path`.
///
/// Replacement stores fresh bytes and repoints the entry; the storage top
/// never moves backwards.
pub(crate) fn load(arena: &mut Arena, path: &str, content: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::PathMissing);
    }

    let existing = find(arena, path);
    if existing.is_none() && arena.module_count() >= MODULE_CAPACITY {
        return Err(Error::ModuleTableFull);
    }

    let normalized = content.replace("\r\n", "\n");

    let path_base = arena
        .allocate_module_storage(path.len())
        .map_err(|_| Error::StorageExhausted)?;
    arena.write_bytes(path_base, path.as_bytes());
    let content_base = arena
        .allocate_module_storage(normalized.len())
        .map_err(|_| Error::StorageExhausted)?;
    arena.write_bytes(content_base, normalized.as_bytes());

    let entry = ModuleEntry {
        path: Span::new(path_base, path.len()),
        content: Span::new(content_base, normalized.len()),
        flags: 0,
    };
    match existing {
        Some(index) => write_entry(arena, index, entry),
        None => {
            let index = arena.module_count();
            write_entry(arena, index, entry);
            arena.set_module_count(index + 1);
        }
    }
    debug!("loaded module {path} ({} bytes)", normalized.len());
    Ok(())
}

/// Clears per-compile entry flags. The registry contents themselves persist
/// across compiles.
pub(crate) fn clear_flags(arena: &mut Arena) {
    for index in 0..arena.module_count() {
        let mut entry = read_entry(arena, index);
        entry.flags = 0;
        write_entry(arena, index, entry);
    }
}

pub(crate) fn set_flag(arena: &mut Arena, index: usize, flag: u32) {
    let mut entry = read_entry(arena, index);
    entry.flags |= flag;
    write_entry(arena, index, entry);
}

/// Resolves a `use` import string against the importer's path.
///
/// Absolute imports (leading `/`) stand alone; relative imports are joined
/// to the importer's directory. `.` and `..` segments are folded either way.
pub(crate) fn resolve_import(importer: &str, import: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    if !import.starts_with('/') {
        // Seed with the importer's directory.
        for segment in importer.split('/') {
            segments.push(segment);
        }
        segments.pop();
    }
    for segment in import.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    let mut resolved = String::new();
    for segment in segments {
        if segment.is_empty() {
            continue;
        }
        resolved.push('/');
        resolved.push_str(segment);
    }
    if resolved.is_empty() {
        resolved.push('/');
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_find() {
        let mut arena = Arena::new();
        load(&mut arena, "/main.bt", "fn main() -> i32 { 0 }").unwrap();
        load(&mut arena, "/lib/util.bt", "const A: i32 = 1;").unwrap();
        assert_eq!(find(&arena, "/main.bt"), Some(0));
        assert_eq!(find(&arena, "/lib/util.bt"), Some(1));
        assert_eq!(find(&arena, "/missing.bt"), None);
    }

    #[test]
    fn reload_replaces_content() {
        let mut arena = Arena::new();
        load(&mut arena, "/m.bt", "old").unwrap();
        let top_before = arena.storage_top();
        load(&mut arena, "/m.bt", "newer").unwrap();
        assert_eq!(arena.module_count(), 1);
        assert!(arena.storage_top() > top_before);
        let entry = read_entry(&arena, 0);
        assert_eq!(arena.slice(entry.content), b"newer");
    }

    #[test]
    fn crlf_is_normalized() {
        let mut arena = Arena::new();
        load(&mut arena, "/m.bt", "a\r\nb\r\n").unwrap();
        let entry = read_entry(&arena, 0);
        assert_eq!(arena.slice(entry.content), b"a\nb\n");
    }

    #[test]
    fn empty_path_is_rejected() {
        let mut arena = Arena::new();
        assert_eq!(load(&mut arena, "", "x"), Err(Error::PathMissing));
    }

    #[test]
    fn capacity_is_enforced() {
        let mut arena = Arena::new();
        for i in 0..MODULE_CAPACITY {
            load(&mut arena, &format!("/m{i}.bt"), "").unwrap();
        }
        assert_eq!(
            load(&mut arena, "/one-too-many.bt", ""),
            Err(Error::ModuleTableFull)
        );
        // Reloading an existing module is still fine at capacity.
        load(&mut arena, "/m0.bt", "again").unwrap();
    }

    #[test]
    fn import_resolution() {
        assert_eq!(resolve_import("/a/b.bt", "/lib/mem.bt"), "/lib/mem.bt");
        assert_eq!(resolve_import("/a/b.bt", "c.bt"), "/a/c.bt");
        assert_eq!(resolve_import("/a/b.bt", "./c.bt"), "/a/c.bt");
        assert_eq!(resolve_import("/a/b/c.bt", "../d.bt"), "/a/d.bt");
        assert_eq!(resolve_import("/a.bt", "../../x.bt"), "/x.bt");
    }
}
