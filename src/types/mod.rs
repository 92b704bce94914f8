// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Source-language types.
//!
//! A type is a 32-bit id whose high byte is the kind and whose low bits are
//! either a primitive tag or an index into the kind's table. Composite types
//! are interned: structurally equal types always compare equal as ids.

use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};

use crate::arena::{Arena, Span};
use crate::diag::Diagnostic;

/// Per-table interning capacity.
pub const TYPE_TABLE_CAPACITY: usize = 256;

/// Upper bound on tuple arity.
pub const MAX_TUPLE_FIELDS: usize = 16;

/// Upper bound on struct field count.
pub const MAX_STRUCT_FIELDS: usize = 16;

/// The kind prefix of a [`TypeId`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
#[repr(u8)]
pub enum TypeKind {
    Primitive = 0,
    Array = 1,
    Tuple = 2,
    Struct = 3,
    Signature = 4,
    AnonFn = 5,
}

// `TryFromPrimitive` cannot be derived here: the derive macro's generated
// code references the trait's associated type via `Self::Primitive`, which
// is ambiguous because this enum has a variant literally named `Primitive`.
impl TryFromPrimitive for TypeKind {
    type Primitive = u8;
    type Error = TryFromPrimitiveError<Self>;

    const NAME: &'static str = "TypeKind";

    fn try_from_primitive(
        number: <Self as TryFromPrimitive>::Primitive,
    ) -> Result<Self, Self::Error> {
        match number {
            0 => Ok(Self::Primitive),
            1 => Ok(Self::Array),
            2 => Ok(Self::Tuple),
            3 => Ok(Self::Struct),
            4 => Ok(Self::Signature),
            5 => Ok(Self::AnonFn),
            _ => Err(TryFromPrimitiveError::new(number)),
        }
    }
}

impl TryFrom<u8> for TypeKind {
    type Error = TryFromPrimitiveError<Self>;

    #[inline]
    fn try_from(number: u8) -> Result<Self, Self::Error> {
        TryFromPrimitive::try_from_primitive(number)
    }
}

/// Primitive types.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Prim {
    I8 = 0,
    I16 = 1,
    I32 = 2,
    I64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    Bool = 8,
    Unit = 9,
    /// The type of type values; inhabited only at compile time.
    Type = 10,
}

impl Prim {
    pub(crate) fn from_name(name: &str) -> Option<Prim> {
        Some(match name {
            "i8" => Prim::I8,
            "i16" => Prim::I16,
            "i32" => Prim::I32,
            "i64" => Prim::I64,
            "u8" => Prim::U8,
            "u16" => Prim::U16,
            "u32" => Prim::U32,
            "u64" => Prim::U64,
            "bool" => Prim::Bool,
            "type" => Prim::Type,
            _ => return None,
        })
    }

    pub(crate) fn is_integer(self) -> bool {
        matches!(
            self,
            Prim::I8
                | Prim::I16
                | Prim::I32
                | Prim::I64
                | Prim::U8
                | Prim::U16
                | Prim::U32
                | Prim::U64
        )
    }

    pub(crate) fn is_signed(self) -> bool {
        matches!(self, Prim::I8 | Prim::I16 | Prim::I32 | Prim::I64)
    }

    pub(crate) fn bit_width(self) -> u32 {
        match self {
            Prim::I8 | Prim::U8 => 8,
            Prim::I16 | Prim::U16 => 16,
            Prim::I32 | Prim::U32 => 32,
            Prim::I64 | Prim::U64 => 64,
            Prim::Bool => 1,
            Prim::Unit | Prim::Type => 0,
        }
    }
}

/// A 32-bit encoded type descriptor: kind in the high byte, primitive tag or
/// table index below it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub(crate) const I8: TypeId = TypeId::primitive(Prim::I8);
    pub(crate) const I16: TypeId = TypeId::primitive(Prim::I16);
    pub(crate) const I32: TypeId = TypeId::primitive(Prim::I32);
    pub(crate) const I64: TypeId = TypeId::primitive(Prim::I64);
    pub(crate) const U8: TypeId = TypeId::primitive(Prim::U8);
    pub(crate) const U16: TypeId = TypeId::primitive(Prim::U16);
    pub(crate) const U32: TypeId = TypeId::primitive(Prim::U32);
    pub(crate) const U64: TypeId = TypeId::primitive(Prim::U64);
    pub(crate) const BOOL: TypeId = TypeId::primitive(Prim::Bool);
    pub(crate) const UNIT: TypeId = TypeId::primitive(Prim::Unit);
    pub(crate) const TYPE: TypeId = TypeId::primitive(Prim::Type);

    /// Sentinel for not-yet-resolved expression types.
    pub(crate) const INVALID: TypeId = TypeId(u32::MAX);

    pub(crate) const fn primitive(prim: Prim) -> TypeId {
        TypeId(((TypeKind::Primitive as u32) << 24) | prim as u32)
    }

    pub(crate) const fn composite(kind: TypeKind, index: usize) -> TypeId {
        TypeId(((kind as u32) << 24) | index as u32)
    }

    pub(crate) fn kind(self) -> TypeKind {
        TypeKind::try_from((self.0 >> 24) as u8).unwrap_or(TypeKind::Primitive)
    }

    pub(crate) fn index(self) -> usize {
        (self.0 & 0x00ff_ffff) as usize
    }

    pub(crate) fn as_prim(self) -> Option<Prim> {
        if self == TypeId::INVALID || self.kind() != TypeKind::Primitive {
            return None;
        }
        Prim::try_from(self.index() as u8).ok()
    }

    pub(crate) fn is_integer(self) -> bool {
        self.as_prim().is_some_and(Prim::is_integer)
    }

    pub(crate) fn is_signed_integer(self) -> bool {
        self.as_prim().is_some_and(Prim::is_signed)
    }

    pub(crate) fn is_composite(self) -> bool {
        matches!(
            self.kind(),
            TypeKind::Array | TypeKind::Tuple | TypeKind::Struct
        ) && self != TypeId::INVALID
    }

    pub(crate) fn bits(self) -> u32 {
        self.0
    }
}

/// An interned array type.
#[derive(Clone, Debug)]
pub(crate) struct ArrayType {
    pub element: TypeId,
    pub length: u32,
    pub wasm_index: Option<u32>,
}

/// An interned tuple type.
#[derive(Clone, Debug)]
pub(crate) struct TupleType {
    pub fields: Vec<TypeId>,
    pub wasm_index: Option<u32>,
}

/// An interned struct type. Field names are spans of module source.
#[derive(Clone, Debug)]
pub(crate) struct StructType {
    pub fields: Vec<(Span, TypeId)>,
    pub wasm_index: Option<u32>,
}

/// An interned function-signature type, shared between named signatures and
/// anonymous-function types (the id kind tells them apart).
#[derive(Clone, Debug)]
pub(crate) struct SignatureType {
    pub params: Vec<TypeId>,
    pub const_params: u32,
    pub result: TypeId,
    pub anonymous: bool,
    pub wasm_index: Option<u32>,
}

#[derive(Default)]
pub(crate) struct TypeTables {
    pub arrays: Vec<ArrayType>,
    pub tuples: Vec<TupleType>,
    pub structs: Vec<StructType>,
    pub signatures: Vec<SignatureType>,
}

impl TypeTables {
    pub(crate) fn reset(&mut self) {
        self.arrays.clear();
        self.tuples.clear();
        self.structs.clear();
        self.signatures.clear();
    }

    pub(crate) fn array(&self, id: TypeId) -> &ArrayType {
        debug_assert_eq!(id.kind(), TypeKind::Array);
        &self.arrays[id.index()]
    }

    pub(crate) fn tuple(&self, id: TypeId) -> &TupleType {
        debug_assert_eq!(id.kind(), TypeKind::Tuple);
        &self.tuples[id.index()]
    }

    pub(crate) fn structure(&self, id: TypeId) -> &StructType {
        debug_assert_eq!(id.kind(), TypeKind::Struct);
        &self.structs[id.index()]
    }

    pub(crate) fn signature(&self, id: TypeId) -> &SignatureType {
        debug_assert!(matches!(id.kind(), TypeKind::Signature | TypeKind::AnonFn));
        &self.signatures[id.index()]
    }

    pub(crate) fn intern_array(
        &mut self,
        element: TypeId,
        length: u32,
    ) -> Result<TypeId, Diagnostic> {
        for (index, entry) in self.arrays.iter().enumerate() {
            if entry.element == element && entry.length == length {
                return Ok(TypeId::composite(TypeKind::Array, index));
            }
        }
        if self.arrays.len() >= TYPE_TABLE_CAPACITY {
            return Err(Diagnostic::bare("array type table full"));
        }
        self.arrays.push(ArrayType {
            element,
            length,
            wasm_index: None,
        });
        Ok(TypeId::composite(TypeKind::Array, self.arrays.len() - 1))
    }

    pub(crate) fn intern_tuple(&mut self, fields: &[TypeId]) -> Result<TypeId, Diagnostic> {
        if fields.len() > MAX_TUPLE_FIELDS {
            return Err(Diagnostic::bare("tuple field limit exceeded"));
        }
        for (index, entry) in self.tuples.iter().enumerate() {
            if entry.fields == fields {
                return Ok(TypeId::composite(TypeKind::Tuple, index));
            }
        }
        if self.tuples.len() >= TYPE_TABLE_CAPACITY {
            return Err(Diagnostic::bare("tuple type table full"));
        }
        self.tuples.push(TupleType {
            fields: fields.to_vec(),
            wasm_index: None,
        });
        Ok(TypeId::composite(TypeKind::Tuple, self.tuples.len() - 1))
    }

    pub(crate) fn intern_struct(
        &mut self,
        arena: &Arena,
        fields: &[(Span, TypeId)],
    ) -> Result<TypeId, Diagnostic> {
        if fields.len() > MAX_STRUCT_FIELDS {
            return Err(Diagnostic::bare("struct field limit exceeded"));
        }
        for (index, entry) in self.structs.iter().enumerate() {
            if entry.fields.len() == fields.len()
                && entry.fields.iter().zip(fields).all(|(a, b)| {
                    a.1 == b.1 && arena.slice(a.0) == arena.slice(b.0)
                })
            {
                return Ok(TypeId::composite(TypeKind::Struct, index));
            }
        }
        if self.structs.len() >= TYPE_TABLE_CAPACITY {
            return Err(Diagnostic::bare("struct type table full"));
        }
        self.structs.push(StructType {
            fields: fields.to_vec(),
            wasm_index: None,
        });
        Ok(TypeId::composite(TypeKind::Struct, self.structs.len() - 1))
    }

    pub(crate) fn intern_signature(
        &mut self,
        params: &[TypeId],
        const_params: u32,
        result: TypeId,
        anonymous: bool,
    ) -> Result<TypeId, Diagnostic> {
        let kind = if anonymous {
            TypeKind::AnonFn
        } else {
            TypeKind::Signature
        };
        for (index, entry) in self.signatures.iter().enumerate() {
            if entry.params == params
                && entry.const_params == const_params
                && entry.result == result
                && entry.anonymous == anonymous
            {
                return Ok(TypeId::composite(kind, index));
            }
        }
        if self.signatures.len() >= TYPE_TABLE_CAPACITY {
            return Err(Diagnostic::bare("function type table full"));
        }
        self.signatures.push(SignatureType {
            params: params.to_vec(),
            const_params,
            result,
            anonymous,
            wasm_index: None,
        });
        Ok(TypeId::composite(kind, self.signatures.len() - 1))
    }

    /// A short type description for diagnostics.
    pub(crate) fn describe(&self, id: TypeId) -> String {
        match id.kind() {
            TypeKind::Primitive => match id.as_prim() {
                Some(Prim::Bool) => "bool".into(),
                Some(Prim::Unit) => "()".into(),
                Some(Prim::Type) => "type".into(),
                Some(prim) => {
                    let sign = if prim.is_signed() { "i" } else { "u" };
                    format!("{sign}{}", prim.bit_width())
                }
                None => "<invalid>".into(),
            },
            TypeKind::Array => {
                let entry = self.array(id);
                format!("[{}; {}]", self.describe(entry.element), entry.length)
            }
            TypeKind::Tuple => {
                let fields: Vec<String> = self
                    .tuple(id)
                    .fields
                    .iter()
                    .map(|&field| self.describe(field))
                    .collect();
                format!("({})", fields.join(", "))
            }
            TypeKind::Struct => "struct".into(),
            TypeKind::Signature | TypeKind::AnonFn => "fn".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_ids_roundtrip() {
        assert_eq!(TypeId::I32.kind(), TypeKind::Primitive);
        assert_eq!(TypeId::I32.as_prim(), Some(Prim::I32));
        assert!(TypeId::U8.is_integer());
        assert!(!TypeId::U8.is_signed_integer());
        assert!(TypeId::I64.is_signed_integer());
        assert!(!TypeId::BOOL.is_integer());
    }

    #[test]
    fn arrays_are_interned() {
        let mut tables = TypeTables::default();
        let a = tables.intern_array(TypeId::U8, 5).unwrap();
        let b = tables.intern_array(TypeId::U8, 5).unwrap();
        let c = tables.intern_array(TypeId::U8, 6).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(tables.array(a).length, 5);
    }

    #[test]
    fn nested_composites_intern_structurally() {
        let mut tables = TypeTables::default();
        let inner = tables.intern_array(TypeId::I32, 2).unwrap();
        let t1 = tables.intern_tuple(&[inner, TypeId::BOOL]).unwrap();
        let inner_again = tables.intern_array(TypeId::I32, 2).unwrap();
        let t2 = tables.intern_tuple(&[inner_again, TypeId::BOOL]).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn signature_kinds_are_distinct() {
        let mut tables = TypeTables::default();
        let named = tables
            .intern_signature(&[TypeId::I32], 0, TypeId::I32, false)
            .unwrap();
        let anon = tables
            .intern_signature(&[TypeId::I32], 0, TypeId::I32, true)
            .unwrap();
        assert_ne!(named, anon);
        assert_eq!(named.kind(), TypeKind::Signature);
        assert_eq!(anon.kind(), TypeKind::AnonFn);
    }

    #[test]
    fn array_table_capacity() {
        let mut tables = TypeTables::default();
        for length in 0..TYPE_TABLE_CAPACITY as u32 {
            tables.intern_array(TypeId::I32, length).unwrap();
        }
        let err = tables
            .intern_array(TypeId::I32, TYPE_TABLE_CAPACITY as u32)
            .unwrap_err();
        assert_eq!(err.message(), "array type table full");
    }

    #[test]
    fn describe_renders_shapes() {
        let mut tables = TypeTables::default();
        let arr = tables.intern_array(TypeId::U8, 5).unwrap();
        let tup = tables.intern_tuple(&[TypeId::I32, arr]).unwrap();
        assert_eq!(tables.describe(arr), "[u8; 5]");
        assert_eq!(tables.describe(tup), "(i32, [u8; 5])");
    }
}
