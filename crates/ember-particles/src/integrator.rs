//! Integrator contract
//!
//! An integrator computes, for every particle of a block, the
//! displacement ("offset") each of its declared float3 attributes would
//! accumulate over the particle's remaining duration. The engine is
//! agnostic to the physics: forwarding and event interception only ever
//! scale and add the offsets the integrator produced.

use crate::arrays::AttributeArrays;
use crate::scratch::ArrayAllocator;
use ember_schema::AttributesInfo;

pub trait Integrator: Send + Sync {
    /// The layout of the offsets this integrator fills. Typically a
    /// subset of the particle's float3 attributes, e.g. `"Position"`.
    fn offset_attributes_info(&self) -> &AttributesInfo;

    /// Fill every declared offset for every particle in the block.
    fn integrate(&self, interface: &mut IntegratorInterface<'_>);
}

/// One block's worth of integration work.
pub struct IntegratorInterface<'a> {
    attributes: AttributeArrays<'a>,
    remaining_durations: &'a [f32],
    array_allocator: &'a ArrayAllocator,
    offsets: AttributeArrays<'a>,
}

impl<'a> IntegratorInterface<'a> {
    pub(crate) fn new(
        attributes: AttributeArrays<'a>,
        remaining_durations: &'a [f32],
        array_allocator: &'a ArrayAllocator,
        offsets: AttributeArrays<'a>,
    ) -> Self {
        Self {
            attributes,
            remaining_durations,
            array_allocator,
            offsets,
        }
    }

    pub fn particle_count(&self) -> usize {
        self.remaining_durations.len()
    }

    /// Active rows of the block, indexed `0..particle_count()`.
    pub fn attributes(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.attributes
    }

    /// Remaining duration per particle, indexed `0..particle_count()`.
    pub fn remaining_durations(&self) -> &'a [f32] {
        self.remaining_durations
    }

    pub fn array_allocator(&self) -> &'a ArrayAllocator {
        self.array_allocator
    }

    /// The offsets to fill, shaped per `offset_attributes_info`.
    pub fn offsets(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.offsets
    }

    /// Both the block attributes and the offsets, mutably. Integrators
    /// that read one attribute while writing another's offset need the
    /// two views at once.
    pub fn attributes_and_offsets(
        &mut self,
    ) -> (&mut AttributeArrays<'a>, &mut AttributeArrays<'a>) {
        (&mut self.attributes, &mut self.offsets)
    }
}
