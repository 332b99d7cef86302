//! Attribute kinds

use serde::{Deserialize, Serialize};

/// The kind of a particle attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeKind {
    Byte,
    Float,
    Float3,
}

impl AttributeKind {
    /// Size in bytes of one element of this kind.
    pub fn element_size(self) -> usize {
        match self {
            AttributeKind::Byte => 1,
            AttributeKind::Float => 4,
            AttributeKind::Float3 => 12,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            AttributeKind::Byte => "byte",
            AttributeKind::Float => "float",
            AttributeKind::Float3 => "float3",
        }
    }
}
