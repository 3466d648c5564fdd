//! Type sizing and layout rules for the μVM object model.
//!
//! Sizes and alignments are in bytes. The machine word is 64 bits; every
//! payload starts at least word-aligned, so reference fields always sit
//! on 8-byte boundaries.

use crate::types::{TypeDef, TypeId, TypeTable};

/// Machine word size in bytes.
pub const WORD_BYTES: u64 = 8;

/// Rounds `n` up to the next multiple of `align` (a power of two).
#[inline(always)]
pub fn align_up(n: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Payload size of a fixed-size type.
///
/// # Panics
///
/// Panics for hybrids, whose size depends on the var-part length; use
/// [`hybrid_size`] instead.
pub fn size_of_ty(table: &TypeTable, id: TypeId) -> u64 {
    match table.get(id) {
        TypeDef::Int { bits } => int_bytes(*bits),
        TypeDef::Float => 4,
        TypeDef::Double => 8,
        TypeDef::Ref { .. } | TypeDef::IRef { .. } | TypeDef::WeakRef { .. } => WORD_BYTES,
        TypeDef::Struct { fields } => struct_layout(table, fields).0,
        TypeDef::Array { elem, len } => array_stride(table, *elem) * len,
        TypeDef::Hybrid { .. } => panic!("hybrid size requires a var-part length"),
        TypeDef::Void => 0,
    }
}

/// Alignment of a type's payload.
pub fn align_of_ty(table: &TypeTable, id: TypeId) -> u64 {
    match table.get(id) {
        TypeDef::Int { bits } => int_bytes(*bits).min(16),
        TypeDef::Float => 4,
        TypeDef::Double => 8,
        TypeDef::Ref { .. } | TypeDef::IRef { .. } | TypeDef::WeakRef { .. } => WORD_BYTES,
        TypeDef::Struct { fields } => struct_layout(table, fields).1,
        TypeDef::Array { elem, .. } => align_of_ty(table, *elem),
        TypeDef::Hybrid { fixed, var } => {
            struct_layout(table, fixed).1.max(align_of_ty(table, *var))
        }
        TypeDef::Void => 1,
    }
}

/// Total payload size of a hybrid with `var_len` var-part elements.
///
/// # Panics
///
/// Panics if `id` is not a hybrid.
pub fn hybrid_size(table: &TypeTable, id: TypeId, var_len: u64) -> u64 {
    let (offset, stride, _) = hybrid_var_part(table, id);
    offset + stride * var_len
}

/// Byte offset, element stride, and element type of a hybrid's var part.
///
/// # Panics
///
/// Panics if `id` is not a hybrid.
pub fn hybrid_var_part(table: &TypeTable, id: TypeId) -> (u64, u64, TypeId) {
    match table.get(id) {
        TypeDef::Hybrid { fixed, var } => {
            let (fixed_size, _) = struct_layout(table, fixed);
            let offset = align_up(fixed_size, align_of_ty(table, *var));
            (offset, array_stride(table, *var), *var)
        }
        other => panic!("hybrid_var_part on non-hybrid type {other:?}"),
    }
}

/// Pushes the payload-relative byte offsets of every `Ref` field of
/// `id`, recursing through structs and fixed-size arrays. For hybrids
/// only the fixed prefix is walked; the caller handles the var part via
/// [`hybrid_var_part`] and the stored length word.
pub fn ref_offsets(table: &TypeTable, id: TypeId, base: u64, out: &mut Vec<u64>) {
    match table.get(id) {
        TypeDef::Ref { .. } => out.push(base),
        TypeDef::Struct { fields } => {
            ref_offsets_of_fields(table, fields, base, out);
        }
        TypeDef::Array { elem, len } => {
            let stride = array_stride(table, *elem);
            for i in 0..*len {
                ref_offsets(table, *elem, base + i * stride, out);
            }
        }
        TypeDef::Hybrid { fixed, .. } => {
            ref_offsets_of_fields(table, fixed, base, out);
        }
        _ => {}
    }
}

fn ref_offsets_of_fields(table: &TypeTable, fields: &[TypeId], base: u64, out: &mut Vec<u64>) {
    let mut offset = 0;
    for &field in fields {
        offset = align_up(offset, align_of_ty(table, field));
        ref_offsets(table, field, base + offset, out);
        offset += size_of_ty(table, field);
    }
}

fn int_bytes(bits: u32) -> u64 {
    (bits as u64).div_ceil(8).next_power_of_two().max(1)
}

fn array_stride(table: &TypeTable, elem: TypeId) -> u64 {
    align_up(size_of_ty(table, elem), align_of_ty(table, elem))
}

/// Size and alignment of a sequence of fields laid out struct-style.
fn struct_layout(table: &TypeTable, fields: &[TypeId]) -> (u64, u64) {
    let mut offset = 0;
    let mut align = 1;
    for &field in fields {
        let field_align = align_of_ty(table, field);
        offset = align_up(offset, field_align) + size_of_ty(table, field);
        align = align.max(field_align);
    }
    (align_up(offset, align), align)
}
