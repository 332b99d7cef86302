//! Ember Schema - Attribute descriptor sets
//!
//! A particle type's storage layout is described by an [`AttributesInfo`]:
//! three ordered, duplicate-free lists of attribute names (byte, float,
//! float3). Types and events contribute `(name, kind)` pairs to an
//! [`AttributesDeclaration`]; building the info from the declaration
//! detects kind conflicts, which are configuration errors.

mod declaration;
mod info;
mod kind;

pub use declaration::AttributesDeclaration;
pub use info::AttributesInfo;
pub use kind::AttributeKind;
