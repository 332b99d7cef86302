//! Error types for Ember

use thiserror::Error;

/// The main error type for Ember operations.
///
/// These are configuration errors: they are surfaced before a step does
/// any work, and a failing step leaves the simulation state untouched.
/// Violated internal invariants are not represented here; those panic.
#[derive(Debug, Error)]
pub enum EmberError {
    #[error("duplicate particle type: {0}")]
    DuplicateParticleType(String),

    #[error("unknown particle type: {0}")]
    UnknownParticleType(String),

    #[error("attribute '{name}' declared as both {first} and {second}")]
    AttributeKindConflict {
        name: String,
        first: &'static str,
        second: &'static str,
    },

    #[error("particle type '{type_name}' does not declare attribute '{attribute}' required by its integrator")]
    MissingAttribute {
        type_name: String,
        attribute: String,
    },

    #[error("step duration must be positive and finite, got {0}")]
    InvalidStepDuration(f32),

    #[error("config error: {0}")]
    ConfigError(String),
}

/// Result type alias for Ember operations
pub type Result<T> = std::result::Result<T, EmberError>;
