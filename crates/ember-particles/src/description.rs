//! Step descriptions
//!
//! A step description is an immutable plan for one step: the duration,
//! the particle types with their integrators and events, and the
//! emitters. The driver takes it by shared reference and never mutates
//! it, so hosts build it once and reuse it across steps.

use crate::emitter::Emitter;
use crate::events::Event;
use crate::integrator::Integrator;
use ember_schema::AttributeKind;

/// One particle type's behavior for a step.
pub struct ParticleType {
    /// Attributes the type itself declares; events contribute theirs on
    /// top, and the required `"Kill State"`/`"Birth Time"` pair is
    /// always present.
    pub attributes: Vec<(String, AttributeKind)>,
    pub integrator: Box<dyn Integrator>,
    pub events: Vec<Box<dyn Event>>,
}

impl ParticleType {
    pub fn new(integrator: Box<dyn Integrator>) -> Self {
        Self {
            attributes: Vec::new(),
            integrator,
            events: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.push((name.into(), kind));
        self
    }

    pub fn with_event(mut self, event: Box<dyn Event>) -> Self {
        self.events.push(event);
        self
    }
}

/// The immutable plan for one simulation step.
pub struct StepDescription {
    pub duration: f32,
    pub types: Vec<(String, ParticleType)>,
    pub emitters: Vec<Box<dyn Emitter>>,
}

impl StepDescription {
    pub fn new(duration: f32) -> Self {
        Self {
            duration,
            types: Vec::new(),
            emitters: Vec::new(),
        }
    }

    pub fn with_type(mut self, name: impl Into<String>, particle_type: ParticleType) -> Self {
        self.types.push((name.into(), particle_type));
        self
    }

    pub fn with_emitter(mut self, emitter: Box<dyn Emitter>) -> Self {
        self.emitters.push(emitter);
        self
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|(name, _)| name.as_str())
    }

    pub fn particle_type(&self, name: &str) -> Option<&ParticleType> {
        self.types
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| ty)
    }
}
