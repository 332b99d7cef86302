//! Immutable attribute descriptor sets

use crate::declaration::AttributesDeclaration;
use crate::kind::AttributeKind;
use ember_core::{EmberError, Result};

/// The descriptor set for one particle type: three ordered lists of
/// attribute names, one per kind. Names are unique across kinds.
///
/// An info is immutable once built. Attribute storage addresses
/// attributes by `(kind, index)` where the index is the position of the
/// name within its kind's list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributesInfo {
    byte_names: Vec<String>,
    float_names: Vec<String>,
    float3_names: Vec<String>,
}

impl AttributesInfo {
    /// An info with no attributes at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build an info from explicit name lists.
    ///
    /// Fails if any name appears twice across the three lists.
    pub fn new(
        byte_names: Vec<String>,
        float_names: Vec<String>,
        float3_names: Vec<String>,
    ) -> Result<Self> {
        let mut decl = AttributesDeclaration::new();
        for name in &byte_names {
            decl.add_byte(name.clone());
        }
        for name in &float_names {
            decl.add_float(name.clone());
        }
        for name in &float3_names {
            decl.add_float3(name.clone());
        }
        Self::from_declaration(&decl)
    }

    /// Union a declaration's contributions into an info.
    ///
    /// Contribution order determines attribute order within each kind.
    /// A name declared with two different kinds is a configuration
    /// error.
    pub fn from_declaration(decl: &AttributesDeclaration) -> Result<Self> {
        let mut info = Self::empty();
        for (name, kind) in decl.entries() {
            if let Some(existing) = info.kind_of(name) {
                if existing != *kind {
                    return Err(EmberError::AttributeKindConflict {
                        name: name.clone(),
                        first: existing.type_name(),
                        second: kind.type_name(),
                    });
                }
                continue;
            }
            match kind {
                AttributeKind::Byte => info.byte_names.push(name.clone()),
                AttributeKind::Float => info.float_names.push(name.clone()),
                AttributeKind::Float3 => info.float3_names.push(name.clone()),
            }
        }
        Ok(info)
    }

    pub fn byte_names(&self) -> &[String] {
        &self.byte_names
    }

    pub fn float_names(&self) -> &[String] {
        &self.float_names
    }

    pub fn float3_names(&self) -> &[String] {
        &self.float3_names
    }

    pub fn byte_index(&self, name: &str) -> Option<usize> {
        self.byte_names.iter().position(|n| n == name)
    }

    pub fn float_index(&self, name: &str) -> Option<usize> {
        self.float_names.iter().position(|n| n == name)
    }

    pub fn float3_index(&self, name: &str) -> Option<usize> {
        self.float3_names.iter().position(|n| n == name)
    }

    pub fn kind_of(&self, name: &str) -> Option<AttributeKind> {
        if self.byte_index(name).is_some() {
            Some(AttributeKind::Byte)
        } else if self.float_index(name).is_some() {
            Some(AttributeKind::Float)
        } else if self.float3_index(name).is_some() {
            Some(AttributeKind::Float3)
        } else {
            None
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.kind_of(name).is_some()
    }

    /// Total number of attributes across all kinds.
    pub fn attribute_count(&self) -> usize {
        self.byte_names.len() + self.float_names.len() + self.float3_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_preserves_contribution_order() {
        let mut decl = AttributesDeclaration::new();
        decl.add_byte("Kill State");
        decl.add_float("Birth Time");
        decl.add_float3("Position");
        decl.add_float3("Velocity");
        decl.add_float3("Position");

        let info = AttributesInfo::from_declaration(&decl).unwrap();
        assert_eq!(info.float3_names(), ["Position", "Velocity"]);
        assert_eq!(info.float3_index("Velocity"), Some(1));
        assert_eq!(info.kind_of("Kill State"), Some(AttributeKind::Byte));
        assert_eq!(info.attribute_count(), 4);
    }

    #[test]
    fn kind_conflict_is_an_error() {
        let mut decl = AttributesDeclaration::new();
        decl.add_float("Size");
        decl.add_byte("Size");

        let err = AttributesInfo::from_declaration(&decl).unwrap_err();
        match err {
            EmberError::AttributeKindConflict { name, .. } => assert_eq!(name, "Size"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn names_unique_across_kinds_in_new() {
        let err = AttributesInfo::new(
            vec!["A".into()],
            vec!["A".into()],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, EmberError::AttributeKindConflict { .. }));
    }
}
