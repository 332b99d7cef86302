//! Emitter contract

use crate::alloc::{NewParticles, ParticleAllocator};
use crate::scratch::ArrayAllocator;
use ember_core::TimeSpan;

/// A source of newborn particles, run once per step with the step's
/// time span.
///
/// Emitters must set `"Birth Time"` to an absolute time inside the span
/// for every particle they create; other attributes default to zero.
pub trait Emitter: Send + Sync {
    fn emit(&self, interface: &mut EmitterInterface<'_, '_>);
}

pub struct EmitterInterface<'a, 's> {
    particle_allocator: &'a mut ParticleAllocator<'s>,
    array_allocator: &'a ArrayAllocator,
    time_span: TimeSpan,
}

impl<'a, 's> EmitterInterface<'a, 's> {
    pub(crate) fn new(
        particle_allocator: &'a mut ParticleAllocator<'s>,
        array_allocator: &'a ArrayAllocator,
        time_span: TimeSpan,
    ) -> Self {
        Self {
            particle_allocator,
            array_allocator,
            time_span,
        }
    }

    /// The step's time span. Birth times must fall inside it.
    pub fn time_span(&self) -> TimeSpan {
        self.time_span
    }

    pub fn array_allocator(&self) -> &'a ArrayAllocator {
        self.array_allocator
    }

    /// Claim rows for `amount` newborn particles of the given type.
    pub fn request(&mut self, type_name: &str, amount: usize) -> NewParticles {
        self.particle_allocator.request(type_name, amount)
    }
}
