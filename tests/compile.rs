// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! End-to-end compilation tests: whole programs in, `.wasm` bytes out.

use batter::{Compiler, Error};

// --- tiny module reader, just enough to inspect emitted sections ---

fn read_leb(bytes: &[u8], pos: &mut usize) -> u32 {
    let mut value = 0u32;
    let mut shift = 0;
    loop {
        let byte = bytes[*pos];
        *pos += 1;
        value |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return value;
        }
        shift += 7;
    }
}

fn sections(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    assert_eq!(&bytes[..4], b"\0asm");
    assert_eq!(&bytes[4..8], [1, 0, 0, 0]);
    let mut pos = 8;
    let mut sections = Vec::new();
    while pos < bytes.len() {
        let id = bytes[pos];
        pos += 1;
        let len = read_leb(bytes, &mut pos) as usize;
        sections.push((id, bytes[pos..pos + len].to_vec()));
        pos += len;
    }
    sections
}

fn section(bytes: &[u8], id: u8) -> Option<Vec<u8>> {
    sections(bytes)
        .into_iter()
        .find(|(section_id, _)| *section_id == id)
        .map(|(_, payload)| payload)
}

fn function_count(bytes: &[u8]) -> u32 {
    let payload = section(bytes, 3).expect("function section");
    let mut pos = 0;
    read_leb(&payload, &mut pos)
}

/// Export entries as (name, kind, index).
fn exports(bytes: &[u8]) -> Vec<(String, u8, u32)> {
    let payload = section(bytes, 7).expect("export section");
    let mut pos = 0;
    let count = read_leb(&payload, &mut pos);
    let mut entries = Vec::new();
    for _ in 0..count {
        let len = read_leb(&payload, &mut pos) as usize;
        let name = String::from_utf8(payload[pos..pos + len].to_vec()).unwrap();
        pos += len;
        let kind = payload[pos];
        pos += 1;
        let index = read_leb(&payload, &mut pos);
        entries.push((name, kind, index));
    }
    entries
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn compile(source: &str) -> Vec<u8> {
    let mut compiler = Compiler::new();
    compiler.load_module_from_source("/main.bt", source).unwrap();
    compiler.compile_from_path("/main.bt").unwrap().to_vec()
}

fn compile_err(source: &str) -> String {
    let mut compiler = Compiler::new();
    compiler.load_module_from_source("/main.bt", source).unwrap();
    match compiler.compile_from_path("/main.bt") {
        Ok(_) => panic!("expected a compile error"),
        Err(Error::Compile(diagnostic)) => diagnostic.to_string(),
        Err(other) => panic!("unexpected error {other:?}"),
    }
}

// --- representative end-to-end scenarios ---

#[test]
fn trivial_main() {
    let bytes = compile("fn main() -> i32 { 42 }");
    // i32.const 42 in the body.
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 42]));
    let exports = exports(&bytes);
    assert!(exports.contains(&("memory".to_owned(), 0x02, 0)));
    assert!(
        exports
            .iter()
            .any(|(name, kind, _)| name == "main" && *kind == 0x00)
    );
}

#[test]
fn const_fn_folds_to_constant() {
    let bytes = compile(
        "const fn add(a: i32, b: i32) -> i32 { a + b }\n\
         const V: i32 = add(40, 2);\n\
         fn main() -> i32 { V }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 42]));
}

#[test]
fn recursive_calls_compile() {
    let bytes = compile(
        "fn fib(n: i32) -> i32 {\n\
             if n < 2 { return n; }\n\
             return fib(n - 1) + fib(n - 2);\n\
         }\n\
         fn main() -> i32 { fib(10) }",
    );
    assert_eq!(function_count(&bytes), 2);
    let code = section(&bytes, 10).unwrap();
    // call opcode with the fib index.
    assert!(contains(&code, &[0x10, 0x00]));
}

#[test]
fn const_params_specialize_per_key() {
    let bytes = compile(
        "fn choose(const F: bool, v: i32) -> i32 { if F { v } else { v + 10 } }\n\
         fn main() -> i32 { choose(true, 7) + choose(true, 3) + choose(false, 5) }",
    );
    // main plus exactly two clones of choose; the template itself is not
    // emitted.
    assert_eq!(function_count(&bytes), 3);
    let exports = exports(&bytes);
    assert!(exports.iter().all(|(name, _, _)| name != "choose"));
    assert!(exports.iter().any(|(name, _, _)| name == "main"));
}

#[test]
fn string_literal_lowering_is_bit_exact() {
    let bytes = compile(
        "fn greeting() -> [u8; 5] { \"hello\" }\n\
         fn main() -> i32 { 0 }",
    );
    let code = section(&bytes, 10).unwrap();
    let expected = [
        0x41, 0xe8, 0x00, // i32.const 'h'
        0x41, 0xe5, 0x00, // i32.const 'e'
        0x41, 0xec, 0x00, // i32.const 'l'
        0x41, 0xec, 0x00, // i32.const 'l'
        0x41, 0xef, 0x00, // i32.const 'o'
        0xfb, 0x08, 0x00, 0x05, // array.new_fixed (type 0) 5
    ];
    assert!(contains(&code, &expected));
}

#[test]
fn const_division_by_zero_is_located() {
    let mut compiler = Compiler::new();
    compiler
        .load_module_from_source("/main.bt", "const V: i32 = 10 % 0;\nfn main() -> i32 { V }")
        .unwrap();
    let error = compiler.compile_from_path("/main.bt").unwrap_err();
    assert!(error.status() < 0);
    let Error::Compile(diagnostic) = &error else {
        panic!("unexpected error {error:?}");
    };
    assert_eq!(diagnostic.to_string(), "/main.bt:1:19: division by zero");

    // The diagnostic is also a C string at the output base.
    let base = u32::from_le_bytes(
        compiler.memory()[batter::MODULE_STATE_BASE + 4..batter::MODULE_STATE_BASE + 8]
            .try_into()
            .unwrap(),
    ) as usize;
    let tail = &compiler.memory()[base..];
    let end = tail.iter().position(|&b| b == 0).unwrap();
    assert_eq!(
        str::from_utf8(&tail[..end]).unwrap(),
        "/main.bt:1:19: division by zero"
    );
}

// --- quantified properties ---

#[test]
fn emission_is_deterministic() {
    let source = "const fn square(x: i32) -> i32 { x * x }\n\
                  const TABLE: [i32; 4] = [square(1), square(2), square(3), square(4)];\n\
                  fn pick(const N: i32) -> i32 { TABLE[N] }\n\
                  fn main() -> i32 { pick(2) + pick(3) }";
    assert_eq!(compile(source), compile(source));
}

#[test]
fn identical_const_keys_share_a_clone() {
    let one = compile(
        "fn scaled(const K: i32, v: i32) -> i32 { v * K }\n\
         fn main() -> i32 { scaled(3, 1) + scaled(3, 2) }",
    );
    let two = compile(
        "fn scaled(const K: i32, v: i32) -> i32 { v * K }\n\
         fn main() -> i32 { scaled(3, 1) + scaled(4, 2) }",
    );
    // Same key twice: main + one clone. Distinct keys: main + two clones.
    assert_eq!(function_count(&one), 2);
    assert_eq!(function_count(&two), 3);
}

#[test]
fn specialization_limit_is_reported() {
    // One clone per distinct key, driven well past the table limit by a
    // const-evaluated argument.
    let mut calls = String::new();
    for i in 0..1100 {
        calls.push_str(&format!("total = total + noop({i}, 1);\n"));
    }
    let source = format!(
        "fn noop(const K: i32, v: i32) -> i32 {{ v }}\n\
         fn main() -> i32 {{ let mut total = 0;\n{calls}total }}"
    );
    let message = compile_err(&source);
    assert!(message.contains("const specialization function limit exceeded"));
}

#[test]
fn modules_resolve_relative_imports() {
    let mut compiler = Compiler::new();
    compiler
        .load_module_from_source("/lib/math.bt", "const fn double(x: i32) -> i32 { x * 2 }")
        .unwrap();
    compiler
        .load_module_from_source(
            "/app/main.bt",
            "use \"../lib/math.bt\";\nconst V: i32 = double(21);\nfn main() -> i32 { V }",
        )
        .unwrap();
    let bytes = compiler.compile_from_path("/app/main.bt").unwrap();
    let code = section(bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 42]));
}

#[test]
fn missing_import_fails_at_the_use_site() {
    let mut compiler = Compiler::new();
    compiler
        .load_module_from_source("/main.bt", "use \"./absent.bt\";\nfn main() -> i32 { 0 }")
        .unwrap();
    let Err(Error::Compile(diagnostic)) = compiler.compile_from_path("/main.bt") else {
        panic!("expected a compile error");
    };
    assert_eq!(
        diagnostic.to_string(),
        "/main.bt:1:5: module import not found"
    );
}

// --- boundary behaviors ---

#[test]
fn zero_length_arrays_are_accepted() {
    let bytes = compile(
        "fn empty() -> [i32; 0] { [] }\n\
         fn main() -> i32 { len(empty()) }",
    );
    assert_eq!(function_count(&bytes), 2);
}

#[test]
fn negative_array_length_is_rejected() {
    let message = compile_err("fn main() -> i32 { let a = [0; 0 - 1]; 0 }");
    assert!(message.contains("array literal length must be non-negative"));
}

#[test]
fn constant_index_bounds() {
    let message = compile_err("fn main() -> i32 { let a = [1, 2, 3]; a[3] }");
    assert!(message.contains("array index out of bounds"));
    let bytes = compile("fn main() -> i32 { let a = [1, 2, 3]; a[2] }");
    assert!(!bytes.is_empty());
}

#[test]
fn while_cannot_break_with_value() {
    let message =
        compile_err("fn main() -> i32 { while true { break 1; } 0 }");
    assert!(message.contains("while loops cannot break with values"));
}

#[test]
fn loop_breaks_with_values() {
    let bytes = compile(
        "fn main() -> i32 {\n\
             let mut i = 0;\n\
             loop {\n\
                 i = i + 1;\n\
                 if i == 10 { break i * 2; }\n\
             }\n\
         }",
    );
    assert!(!bytes.is_empty());
}

#[test]
fn immutable_locals_cannot_be_assigned() {
    let message = compile_err("fn main() -> i32 { let x = 1; x = 2; x }");
    assert!(message.contains("cannot assign to immutable local"));
}

#[test]
fn operand_types_must_match() {
    let message = compile_err("fn main() -> i32 { let a = 1u8; let b = 2i32; (a + b) as i32 }");
    assert!(message.contains("binary operator operands must have matching type"));
}

#[test]
fn main_is_required() {
    let message = compile_err("fn helper() -> i32 { 1 }");
    assert!(message.contains("main function not found"));
}

// --- language features end to end ---

#[test]
fn const_while_loops_evaluate() {
    let bytes = compile(
        "const fn sum_to(n: i32) -> i32 {\n\
             let mut total = 0;\n\
             let mut i = 1;\n\
             while i <= n { total = total + i; i = i + 1; }\n\
             total\n\
         }\n\
         const S: i32 = sum_to(100);\n\
         fn main() -> i32 { S }",
    );
    let code = section(&bytes, 10).unwrap();
    // 5050 as a signed LEB128 i32.const operand.
    assert!(contains(&code, &[0x41, 0xba, 0x27]));
}

#[test]
fn iteration_bound_stops_runaway_const_loops() {
    let message = compile_err(
        "const fn forever() -> i32 { loop { } }\n\
         const V: i32 = forever();\n\
         fn main() -> i32 { V }",
    );
    assert!(message.contains("const evaluation exceeded iteration bound"));
}

#[test]
fn structs_compile_to_gc_structs() {
    let bytes = compile(
        "type Point = struct { x: i32, y: i32 };\n\
         fn make(x: i32, y: i32) -> Point { Point { x: x, y: y } }\n\
         fn main() -> i32 { let p = make(3, 4); p.x + p.y }",
    );
    let types = section(&bytes, 1).unwrap();
    // A struct form with two mutable i32 fields.
    assert!(contains(&types, &[0x5f, 0x02, 0x7f, 0x01, 0x7f, 0x01]));
    let code = section(&bytes, 10).unwrap();
    // struct.new and struct.get.
    assert!(contains(&code, &[0xfb, 0x00]));
    assert!(contains(&code, &[0xfb, 0x02]));
}

#[test]
fn tuples_support_field_access() {
    let bytes = compile(
        "fn pair() -> (i32, bool) { (7, true) }\n\
         fn main() -> i32 { let p = pair(); if p.1 { p.0 } else { 0 } }",
    );
    assert!(!bytes.is_empty());
}

#[test]
fn packed_arrays_use_signed_and_unsigned_gets() {
    let bytes = compile(
        "fn main() -> i32 {\n\
             let a = [1u8, 2u8];\n\
             let b = [1i8, 2i8];\n\
             a[0] as i32 + b[1] as i32\n\
         }",
    );
    let types = section(&bytes, 1).unwrap();
    // Packed i8 array form.
    assert!(contains(&types, &[0x5e, 0x78, 0x01]));
    let code = section(&bytes, 10).unwrap();
    // array.get_u for u8, array.get_s for i8.
    assert!(contains(&code, &[0xfb, 0x0d]));
    assert!(contains(&code, &[0xfb, 0x0c]));
}

#[test]
fn inline_wasm_splices_bytes_verbatim() {
    let bytes = compile(
        "fn main() -> i32 { inline_wasm([0x41u8, 0x2au8]) }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 0x2a]));
}

#[test]
fn type_aliases_participate_in_annotations() {
    let bytes = compile(
        "type Word = i64;\n\
         fn widen(x: i32) -> Word { x as Word }\n\
         fn main() -> i32 { widen(1) as i32 }",
    );
    assert!(!bytes.is_empty());
}

#[test]
fn const_type_params_monomorphize() {
    let bytes = compile(
        "fn first(const T: type, values: [T; 2]) -> T { values[0] }\n\
         fn main() -> i32 {\n\
             first(i32, [10, 20]) + first(u8, [1u8, 2u8]) as i32\n\
         }",
    );
    // main + one clone per element type.
    assert_eq!(function_count(&bytes), 3);
}

#[test]
fn casts_lower_with_extension_and_masking() {
    let bytes = compile(
        "fn main() -> i32 {\n\
             let a = 300;\n\
             let b = a as u8;\n\
             let c = b as i64;\n\
             (c as i32) + (a as i16) as i32\n\
         }",
    );
    let code = section(&bytes, 10).unwrap();
    // u8 masking and i64 zero-extension both appear.
    assert!(contains(&code, &[0x41, 0xff, 0x01, 0x71]));
    assert!(contains(&code, &[0xad]));
}

#[test]
fn sixty_four_bit_arithmetic_uses_i64_opcodes() {
    let bytes = compile(
        "fn main() -> i32 { let x = 1i64 << 40i64; (x >> 40i64) as i32 }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x86])); // i64.shl
    assert!(contains(&code, &[0x87])); // i64.shr_s
}

#[test]
fn value_loops_may_exit_only_through_return() {
    let bytes = compile("fn main() -> i32 { loop { return 3; } }");
    let code = section(&bytes, 10).unwrap();
    // block (result i32), loop, ..., return, ..., unreachable.
    assert!(contains(&code, &[0x02, 0x7f, 0x03, 0x40]));
    assert!(contains(&code, &[0x0f]));
    assert!(contains(&code, &[0x00, 0x0b, 0x0b]));
}

#[test]
fn element_and_field_stores_lower_to_gc_sets() {
    let bytes = compile(
        "type Pair = struct { lo: i32, hi: i32 };\n\
         fn main() -> i32 {\n\
             let mut a = [1, 2, 3];\n\
             a[1] = 9;\n\
             let mut p = Pair { lo: 1, hi: 2 };\n\
             p.hi = a[1];\n\
             let mut t = (4, 5);\n\
             t.0 = p.hi;\n\
             t.0 + a[1]\n\
         }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0xfb, 0x0e])); // array.set
    assert!(contains(&code, &[0xfb, 0x05])); // struct.set
}

#[test]
fn store_type_mismatches_are_specific() {
    let message = compile_err(
        "fn main() -> i32 { let mut a = [1, 2]; a[0] = true; 0 }",
    );
    assert!(message.contains("array element assignment type mismatch"));

    let message = compile_err(
        "fn main() -> i32 { let mut t = (1, 2); t.0 = false; 0 }",
    );
    assert!(message.contains("tuple field assignment type mismatch"));

    let message = compile_err(
        "type P = struct { x: i32 };\n\
         fn main() -> i32 { let mut p = P { x: 1 }; p.x = false; 0 }",
    );
    assert!(message.contains("struct field assignment type mismatch"));
}

#[test]
fn shadowing_rebinding_compiles() {
    let bytes = compile(
        "fn main() -> i32 { let x = 1; let x = x + 1; let x = x * 10; x }",
    );
    assert!(!bytes.is_empty());
}

#[test]
fn continue_skips_iterations() {
    let bytes = compile(
        "fn main() -> i32 {\n\
             let mut i = 0;\n\
             let mut total = 0;\n\
             while i < 10 {\n\
                 i = i + 1;\n\
                 if i % 2 == 0 { continue; }\n\
                 total = total + i;\n\
             }\n\
             total\n\
         }",
    );
    assert!(!bytes.is_empty());
}

#[test]
fn hex_and_separator_literals() {
    let bytes = compile("fn main() -> i32 { 0x2A + 0_000 }");
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 0x2a]));
}

#[test]
fn absolute_imports_resolve() {
    let mut compiler = Compiler::new();
    compiler
        .load_module_from_source("/lib/flags.bt", "const ON: bool = true;")
        .unwrap();
    compiler
        .load_module_from_source(
            "/deep/nested/main.bt",
            "use \"/lib/flags.bt\";\nfn main() -> i32 { if ON { 1 } else { 0 } }",
        )
        .unwrap();
    assert!(compiler.compile_from_path("/deep/nested/main.bt").is_ok());
}

#[test]
fn imported_functions_are_not_exported() {
    let mut compiler = Compiler::new();
    compiler
        .load_module_from_source(
            "/lib/util.bt",
            "fn helper(x: i32) -> i32 { x + 1 }",
        )
        .unwrap();
    compiler
        .load_module_from_source(
            "/main.bt",
            "use \"/lib/util.bt\";\nfn local_fn() -> i32 { helper(1) }\nfn main() -> i32 { local_fn() }",
        )
        .unwrap();
    let bytes = compiler.compile_from_path("/main.bt").unwrap().to_vec();
    let names: Vec<String> = exports(&bytes)
        .into_iter()
        .map(|(name, _, _)| name)
        .collect();
    assert_eq!(names, ["memory", "local_fn", "main"]);
}

#[test]
fn nested_comments_and_whitespace_are_trivia() {
    let bytes = compile(
        "// line comment\n\
         /* block /* nested */ comment */\n\
         fn main() -> i32 { /* inline */ 42 // trailing\n\
         }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x41, 42]));
}

#[test]
fn unsigned_division_uses_unsigned_opcodes() {
    let bytes = compile(
        "fn main() -> i32 { (200u32 / 3u32) as i32 + (200 / 3) }",
    );
    let code = section(&bytes, 10).unwrap();
    assert!(contains(&code, &[0x6e])); // i32.div_u
    assert!(contains(&code, &[0x6d])); // i32.div_s
}

#[test]
fn anonymous_functions_specialize_through_const_params() {
    let bytes = compile(
        "fn apply(const F: fn(i32) -> i32, v: i32) -> i32 { F(v) }\n\
         const DOUBLE: fn(i32) -> i32 = fn(x: i32) -> i32 { x * 2 };\n\
         fn main() -> i32 { apply(DOUBLE, 21) }",
    );
    // main, the anonymous function, and one clone of apply.
    assert_eq!(function_count(&bytes), 3);
}
