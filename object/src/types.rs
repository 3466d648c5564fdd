/// Index of an interned type in a [`TypeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

/// A μVM type definition.
///
/// Composite types reference their components through [`TypeId`], so a
/// table can describe arbitrarily nested layouts without ownership
/// cycles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDef {
    /// Fixed-width integer of the given bit width.
    Int { bits: u32 },
    Float,
    Double,
    /// Reference to a heap object of the given type.
    Ref { to: TypeId },
    /// Internal reference into an object. Not traced by the collector.
    IRef { to: TypeId },
    /// Weak reference. Not traced by the collector.
    WeakRef { to: TypeId },
    Struct { fields: Vec<TypeId> },
    Array { elem: TypeId, len: u64 },
    /// Fixed prefix plus a var-length suffix whose length is supplied at
    /// allocation time.
    Hybrid { fixed: Vec<TypeId>, var: TypeId },
    Void,
}

/// Interning table for [`TypeDef`]s. Ids are dense and stable.
#[derive(Debug, Default)]
pub struct TypeTable {
    defs: Vec<TypeDef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `def`, reusing the id of a structurally equal definition.
    pub fn intern(&mut self, def: TypeDef) -> TypeId {
        if let Some(idx) = self.defs.iter().position(|d| *d == def) {
            return TypeId(idx as u32);
        }
        let id = TypeId(self.defs.len() as u32);
        self.defs.push(def);
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDef {
        &self.defs[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_reuses_equal_defs() {
        let mut table = TypeTable::new();
        let i64_a = table.intern(TypeDef::Int { bits: 64 });
        let i32_t = table.intern(TypeDef::Int { bits: 32 });
        let i64_b = table.intern(TypeDef::Int { bits: 64 });

        assert_eq!(i64_a, i64_b);
        assert_ne!(i64_a, i32_t);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn composite_types_reference_components() {
        let mut table = TypeTable::new();
        let byte = table.intern(TypeDef::Int { bits: 8 });
        let hybrid = table.intern(TypeDef::Hybrid {
            fixed: vec![],
            var: byte,
        });

        match table.get(hybrid) {
            TypeDef::Hybrid { fixed, var } => {
                assert!(fixed.is_empty());
                assert_eq!(*var, byte);
            }
            other => panic!("expected hybrid, got {other:?}"),
        }
    }
}
