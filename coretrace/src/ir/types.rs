//! LLVM type representation and data-layout driven size computation.
//!
//! The passes only ever need store sizes and ABI alignments of first-class
//! types (the bounds pass derives access sizes from them), so this models
//! exactly that: integer, floating point, pointer, vector, array and struct
//! types plus named struct definitions from the module header.

use rustc_hash::FxHashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(u32),
    Half,
    BFloat,
    Float,
    Double,
    X86Fp80,
    Fp128,
    Ptr,
    Label,
    Token,
    Metadata,
    Named(String),
    Array(u64, Box<Type>),
    Vector(u64, Box<Type>),
    Struct { packed: bool, fields: Vec<Type> },
    /// `ret (params...)`; only appears in call signatures.
    Func {
        ret: Box<Type>,
        params: Vec<Type>,
        varargs: bool,
    },
    /// Anything we do not model; carries the original text.
    Opaque(String),
}

impl Type {
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr)
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    pub fn is_float(&self) -> bool {
        matches!(
            self,
            Type::Half | Type::BFloat | Type::Float | Type::Double | Type::X86Fp80 | Type::Fp128
        )
    }
}

/// Named struct bodies (`%struct.X = type { ... }`).
#[derive(Default)]
pub struct TypeTable {
    defs: FxHashMap<String, Type>,
}

impl TypeTable {
    pub fn define(&mut self, name: String, body: Type) {
        self.defs.insert(name, body);
    }

    pub fn resolve(&self, name: &str) -> Option<&Type> {
        self.defs.get(name)
    }
}

/// The subset of `target datalayout` the sizes depend on: pointer width and
/// a couple of ABI alignments. Defaults match x86_64-linux.
#[derive(Clone, Debug)]
pub struct DataLayout {
    pub pointer_size: u64,
    pub pointer_align: u64,
    pub i64_align: u64,
    pub f64_align: u64,
    pub f80_align: u64,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self {
            pointer_size: 8,
            pointer_align: 8,
            i64_align: 8,
            f64_align: 8,
            f80_align: 16,
        }
    }
}

impl DataLayout {
    /// Parse the handful of specs we honor; unknown components are ignored.
    pub fn parse(spec: &str) -> Self {
        let mut layout = Self::default();
        for part in spec.split('-') {
            if let Some(rest) = part.strip_prefix('p') {
                // p[addrspace]:size:abi[:pref[:idx]]
                let mut pieces = rest.split(':');
                let addrspace = pieces.next().unwrap_or("");
                if !addrspace.is_empty() && addrspace != "0" {
                    continue;
                }
                if let Some(size) = pieces.next().and_then(|s| s.parse::<u64>().ok()) {
                    layout.pointer_size = size / 8;
                }
                if let Some(align) = pieces.next().and_then(|s| s.parse::<u64>().ok()) {
                    layout.pointer_align = align / 8;
                }
            } else if let Some(rest) = part.strip_prefix("i64:") {
                if let Some(align) = rest.split(':').next().and_then(|s| s.parse::<u64>().ok()) {
                    layout.i64_align = align / 8;
                }
            } else if let Some(rest) = part.strip_prefix("f64:") {
                if let Some(align) = rest.split(':').next().and_then(|s| s.parse::<u64>().ok()) {
                    layout.f64_align = align / 8;
                }
            } else if let Some(rest) = part.strip_prefix("f80:") {
                if let Some(align) = rest.split(':').next().and_then(|s| s.parse::<u64>().ok()) {
                    layout.f80_align = align / 8;
                }
            }
        }
        layout
    }

    /// ABI alignment in bytes.
    pub fn abi_align(&self, ty: &Type, types: &TypeTable) -> u64 {
        match ty {
            Type::Void | Type::Label | Type::Token | Type::Metadata | Type::Opaque(_) => 1,
            Type::Int(bits) => match bits {
                0..=8 => 1,
                9..=16 => 2,
                17..=32 => 4,
                _ => self.i64_align,
            },
            Type::Half | Type::BFloat => 2,
            Type::Float => 4,
            Type::Double => self.f64_align,
            Type::X86Fp80 => self.f80_align,
            Type::Fp128 => 16,
            Type::Ptr | Type::Func { .. } => self.pointer_align,
            Type::Named(name) => types
                .resolve(name)
                .map(|body| self.abi_align(body, types))
                .unwrap_or(1),
            Type::Array(_, elem) => self.abi_align(elem, types),
            Type::Vector(count, elem) => {
                // Vectors align to their total size, power-of-two rounded.
                let size = self.store_size(elem, types) * count;
                size.next_power_of_two()
            }
            Type::Struct { packed, fields } => {
                if *packed {
                    1
                } else {
                    fields
                        .iter()
                        .map(|f| self.abi_align(f, types))
                        .max()
                        .unwrap_or(1)
                }
            }
        }
    }

    /// Allocation size in bytes: store size padded to the ABI alignment.
    pub fn alloc_size(&self, ty: &Type, types: &TypeTable) -> u64 {
        let size = self.store_size(ty, types);
        let align = self.abi_align(ty, types).max(1);
        size.div_ceil(align) * align
    }

    /// The number of bytes a store of this type writes.
    pub fn store_size(&self, ty: &Type, types: &TypeTable) -> u64 {
        match ty {
            Type::Void | Type::Label | Type::Token | Type::Metadata | Type::Opaque(_) => 0,
            Type::Int(bits) => u64::from(*bits).div_ceil(8),
            Type::Half | Type::BFloat => 2,
            Type::Float => 4,
            Type::Double => 8,
            Type::X86Fp80 => 10,
            Type::Fp128 => 16,
            Type::Ptr | Type::Func { .. } => self.pointer_size,
            Type::Named(name) => types
                .resolve(name)
                .map(|body| self.store_size(body, types))
                .unwrap_or(0),
            Type::Array(count, elem) => count * self.alloc_size(elem, types),
            Type::Vector(count, elem) => {
                let elem_bits = match elem.as_ref() {
                    Type::Int(bits) => u64::from(*bits),
                    other => self.store_size(other, types) * 8,
                };
                (count * elem_bits).div_ceil(8)
            }
            Type::Struct { packed, fields } => {
                if *packed {
                    fields.iter().map(|f| self.store_size(f, types)).sum()
                } else {
                    let mut offset = 0u64;
                    let mut max_align = 1u64;
                    for field in fields {
                        let align = self.abi_align(field, types).max(1);
                        max_align = max_align.max(align);
                        offset = offset.div_ceil(align) * align;
                        offset += self.alloc_size(field, types);
                    }
                    offset.div_ceil(max_align) * max_align
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> DataLayout {
        DataLayout::parse("e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-f80:128-n8:16:32:64-S128")
    }

    #[test]
    fn scalar_store_sizes() {
        let dl = layout();
        let tt = TypeTable::default();
        assert_eq!(dl.store_size(&Type::Int(1), &tt), 1);
        assert_eq!(dl.store_size(&Type::Int(8), &tt), 1);
        assert_eq!(dl.store_size(&Type::Int(32), &tt), 4);
        assert_eq!(dl.store_size(&Type::Int(64), &tt), 8);
        assert_eq!(dl.store_size(&Type::Float, &tt), 4);
        assert_eq!(dl.store_size(&Type::Double, &tt), 8);
        assert_eq!(dl.store_size(&Type::X86Fp80, &tt), 10);
        assert_eq!(dl.store_size(&Type::Ptr, &tt), 8);
    }

    #[test]
    fn array_and_vector_sizes() {
        let dl = layout();
        let tt = TypeTable::default();
        assert_eq!(
            dl.store_size(&Type::Array(10, Box::new(Type::Int(8))), &tt),
            10
        );
        assert_eq!(
            dl.store_size(&Type::Array(4, Box::new(Type::Int(32))), &tt),
            16
        );
        assert_eq!(
            dl.store_size(&Type::Vector(4, Box::new(Type::Int(32))), &tt),
            16
        );
        assert_eq!(
            dl.store_size(&Type::Vector(8, Box::new(Type::Int(1))), &tt),
            1
        );
    }

    #[test]
    fn struct_sizes_respect_padding() {
        let dl = layout();
        let tt = TypeTable::default();
        // { i8, i32 } -> 1 + pad(3) + 4 = 8
        let s = Type::Struct {
            packed: false,
            fields: vec![Type::Int(8), Type::Int(32)],
        };
        assert_eq!(dl.store_size(&s, &tt), 8);

        // <{ i8, i32 }> packed -> 5
        let p = Type::Struct {
            packed: true,
            fields: vec![Type::Int(8), Type::Int(32)],
        };
        assert_eq!(dl.store_size(&p, &tt), 5);

        // { i32, i64 } -> 4 + pad(4) + 8 = 16
        let s2 = Type::Struct {
            packed: false,
            fields: vec![Type::Int(32), Type::Int(64)],
        };
        assert_eq!(dl.store_size(&s2, &tt), 16);
    }

    #[test]
    fn named_struct_resolution() {
        let dl = layout();
        let mut tt = TypeTable::default();
        tt.define(
            "struct.pair".to_owned(),
            Type::Struct {
                packed: false,
                fields: vec![Type::Ptr, Type::Int(64)],
            },
        );
        assert_eq!(dl.store_size(&Type::Named("struct.pair".to_owned()), &tt), 16);
        assert_eq!(dl.store_size(&Type::Named("struct.unknown".to_owned()), &tt), 0);
    }
}
