// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Type representation and struct layout.
//!
//! The dialect has four scalar bases, void, single-level arrays,
//! pointers of any depth and tagged structs. Struct fields are laid out
//! in declaration order with no padding, and a struct larger than 255
//! bytes is rejected so field offsets stay byte-addressable through the
//! indexed mode.

use std::fmt;

use indexmap::IndexMap;

use crate::core::diag::{DiagKind, Diagnostic, SourcePos};

pub const MAX_STRUCT_SIZE: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseType {
    Char,
    UChar,
    Int,
    UInt,
    Void,
    Struct(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CType {
    pub base: BaseType,
    pub ptr_depth: u8,
    /// Array element count; the dialect has single-level arrays only.
    pub array_len: Option<u16>,
}

impl CType {
    pub fn scalar(base: BaseType) -> Self {
        Self {
            base,
            ptr_depth: 0,
            array_len: None,
        }
    }

    pub fn char_() -> Self {
        Self::scalar(BaseType::Char)
    }

    pub fn int_() -> Self {
        Self::scalar(BaseType::Int)
    }

    pub fn uint_() -> Self {
        Self::scalar(BaseType::UInt)
    }

    pub fn void_() -> Self {
        Self::scalar(BaseType::Void)
    }

    pub fn pointer_to(mut self) -> Self {
        self.ptr_depth += 1;
        self
    }

    pub fn array_of(mut self, len: u16) -> Self {
        self.array_len = Some(len);
        self
    }

    pub fn is_pointer(&self) -> bool {
        self.ptr_depth > 0 && self.array_len.is_none()
    }

    pub fn is_array(&self) -> bool {
        self.array_len.is_some()
    }

    pub fn is_void(&self) -> bool {
        self.base == BaseType::Void && self.ptr_depth == 0
    }

    pub fn is_struct_value(&self) -> bool {
        matches!(self.base, BaseType::Struct(_)) && self.ptr_depth == 0 && self.array_len.is_none()
    }

    /// The char family occupies one byte and selects 8-bit codegen.
    pub fn is_char(&self) -> bool {
        matches!(self.base, BaseType::Char | BaseType::UChar)
            && self.ptr_depth == 0
            && self.array_len.is_none()
    }

    pub fn is_unsigned(&self) -> bool {
        matches!(self.base, BaseType::UChar | BaseType::UInt)
    }

    /// Strip one level of pointer or decay an array to its element.
    pub fn dereference(&self) -> Option<CType> {
        if self.array_len.is_some() {
            let mut t = self.clone();
            t.array_len = None;
            return Some(t);
        }
        if self.ptr_depth > 0 {
            let mut t = self.clone();
            t.ptr_depth -= 1;
            return Some(t);
        }
        None
    }

    /// Array-to-pointer decay for argument passing and extern matching.
    pub fn decayed(&self) -> CType {
        if self.array_len.is_some() {
            let mut t = self.clone();
            t.array_len = None;
            t.ptr_depth += 1;
            t
        } else {
            self.clone()
        }
    }

    /// Size of the element this type loads and stores (1 for char, 2
    /// for int and pointers, struct size for struct values).
    pub fn element_size(&self, structs: &StructTable) -> u32 {
        if self.ptr_depth > 0 {
            return 2;
        }
        match &self.base {
            BaseType::Char | BaseType::UChar => 1,
            BaseType::Int | BaseType::UInt => 2,
            BaseType::Void => 0,
            BaseType::Struct(tag) => structs.get(tag).map(|s| s.size).unwrap_or(0),
        }
    }

    /// Total storage size, counting the whole array.
    pub fn storage_size(&self, structs: &StructTable) -> u32 {
        match self.array_len {
            Some(len) => {
                let mut element = self.clone();
                element.array_len = None;
                element.element_size(structs) * len as u32
            }
            None => self.element_size(structs),
        }
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let base = match &self.base {
            BaseType::Char => "char".to_string(),
            BaseType::UChar => "unsigned char".to_string(),
            BaseType::Int => "int".to_string(),
            BaseType::UInt => "unsigned int".to_string(),
            BaseType::Void => "void".to_string(),
            BaseType::Struct(tag) => format!("struct {tag}"),
        };
        write!(f, "{base}")?;
        for _ in 0..self.ptr_depth {
            write!(f, "*")?;
        }
        if let Some(len) = self.array_len {
            write!(f, "[{len}]")?;
        }
        Ok(())
    }
}

/// Two types are compatible across declarations when identical after
/// array-to-pointer decay, so `char buf[]`, `char *buf` and `char
/// buf[N]` all match.
pub fn types_match(a: &CType, b: &CType) -> bool {
    a.decayed() == b.decayed()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub field_type: CType,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub tag: String,
    pub fields: Vec<FieldLayout>,
    pub size: u32,
}

impl StructLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructTable {
    layouts: IndexMap<String, StructLayout>,
}

impl StructTable {
    pub fn get(&self, tag: &str) -> Option<&StructLayout> {
        self.layouts.get(tag)
    }

    /// Lay out a struct: declaration order, no padding, 255-byte cap.
    pub fn define(
        &mut self,
        tag: &str,
        fields: &[(String, CType)],
        pos: &SourcePos,
    ) -> Result<(), Diagnostic> {
        if self.layouts.contains_key(tag) {
            return Err(Diagnostic::error(
                DiagKind::Type,
                pos.clone(),
                format!("struct {tag} is already defined"),
            ));
        }
        let mut offset: u32 = 0;
        let mut layouts = Vec::with_capacity(fields.len());
        for (name, field_type) in fields {
            if layouts.iter().any(|f: &FieldLayout| &f.name == name) {
                return Err(Diagnostic::error(
                    DiagKind::Type,
                    pos.clone(),
                    format!("duplicate field {name} in struct {tag}"),
                ));
            }
            let size = field_type.storage_size(self);
            if size == 0 {
                return Err(Diagnostic::error(
                    DiagKind::Type,
                    pos.clone(),
                    format!("field {name} of struct {tag} has no size"),
                ));
            }
            layouts.push(FieldLayout {
                name: name.clone(),
                field_type: field_type.clone(),
                offset,
            });
            offset += size;
        }
        if offset > MAX_STRUCT_SIZE {
            return Err(Diagnostic::error(
                DiagKind::Type,
                pos.clone(),
                format!("struct {tag} is {offset} bytes; the limit is {MAX_STRUCT_SIZE}"),
            ));
        }
        self.layouts.insert(
            tag.to_string(),
            StructLayout {
                tag: tag.to_string(),
                fields: layouts,
                size: offset,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos() -> SourcePos {
        SourcePos::new("t.c", 1, 1)
    }

    #[test]
    fn scalar_sizes() {
        let structs = StructTable::default();
        assert_eq!(CType::char_().storage_size(&structs), 1);
        assert_eq!(CType::int_().storage_size(&structs), 2);
        assert_eq!(CType::char_().pointer_to().storage_size(&structs), 2);
        assert_eq!(CType::char_().array_of(20).storage_size(&structs), 20);
        assert_eq!(CType::int_().array_of(10).storage_size(&structs), 20);
    }

    #[test]
    fn struct_layout_in_declaration_order() {
        let mut structs = StructTable::default();
        structs
            .define(
                "P",
                &[
                    ("x".into(), CType::int_()),
                    ("y".into(), CType::int_()),
                    ("tag".into(), CType::char_()),
                ],
                &pos(),
            )
            .unwrap();
        let layout = structs.get("P").unwrap();
        assert_eq!(layout.size, 5);
        assert_eq!(layout.field("x").unwrap().offset, 0);
        assert_eq!(layout.field("y").unwrap().offset, 2);
        assert_eq!(layout.field("tag").unwrap().offset, 4);
        // Invariant: offset + size never exceeds the struct size.
        for field in &layout.fields {
            assert!(field.offset + field.field_type.storage_size(&structs) <= layout.size);
        }
    }

    #[test]
    fn oversized_struct_is_rejected() {
        let mut structs = StructTable::default();
        let err = structs
            .define("BIG", &[("blob".into(), CType::char_().array_of(300))], &pos())
            .unwrap_err();
        assert!(err.message.contains("255"));
    }

    #[test]
    fn struct_at_exact_limit_is_accepted() {
        let mut structs = StructTable::default();
        structs
            .define("EDGE", &[("blob".into(), CType::char_().array_of(255))], &pos())
            .unwrap();
        assert_eq!(structs.get("EDGE").unwrap().size, 255);
    }

    #[test]
    fn array_decay_matching() {
        let array = CType::char_().array_of(16);
        let unsized_ptr = CType::char_().pointer_to();
        assert!(types_match(&array, &unsized_ptr));
        assert!(!types_match(&CType::int_(), &unsized_ptr));
    }

    #[test]
    fn nested_struct_sizes() {
        let mut structs = StructTable::default();
        structs
            .define("IN", &[("a".into(), CType::int_())], &pos())
            .unwrap();
        structs
            .define(
                "OUT",
                &[
                    ("head".into(), CType::scalar(BaseType::Struct("IN".into()))),
                    ("tail".into(), CType::scalar(BaseType::Struct("IN".into()))),
                ],
                &pos(),
            )
            .unwrap();
        assert_eq!(structs.get("OUT").unwrap().size, 4);
    }
}
