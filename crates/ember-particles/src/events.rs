//! Event contract and interfaces
//!
//! An event is a pair of callables plus a per-particle storage size.
//! During a sub-step every event's `filter` runs over the particle set
//! and may trigger particles with a time factor (a fraction of the
//! remaining duration in `[0, 1]`); the particles for which an event
//! turned out to be the earliest are then handed to that event's
//! `execute`. Filters may pass data to `execute` through an opaque
//! per-particle byte slab, the `EventStorage`.

use crate::alloc::ParticleAllocator;
use crate::arrays::AttributeArrays;
use crate::KILL_STATE;
use crate::scratch::ArrayAllocator;
use bytemuck::Pod;
use ember_schema::AttributesDeclaration;

/// A discrete event affecting particles mid-step.
///
/// Events hold no particle state of their own. Everything they need is
/// provided through the interfaces; exceptional conditions are encoded
/// via the kill state, never as errors.
pub trait Event: Send + Sync {
    /// Contribute the attributes this event reads or writes.
    fn attributes(&self, _decl: &mut AttributesDeclaration) {}

    /// Bytes of event storage per particle slot. Zero if the filter
    /// passes nothing to `execute`.
    fn storage_size(&self) -> usize {
        0
    }

    /// Decide, for each particle, whether and when this event fires.
    fn filter(&self, interface: &mut EventFilterInterface<'_>);

    /// Apply the event to the particles for which it was the earliest.
    fn execute(&self, interface: &mut EventExecuteInterface<'_, '_>);
}

/// Per-event opaque byte slab, one entry per particle slot.
///
/// Entries are keyed by block-local particle index. Reading a slot that
/// the filter never wrote yields unspecified bytes.
pub struct EventStorage<'a> {
    buffer: &'a mut [u8],
    element_size: usize,
}

impl<'a> EventStorage<'a> {
    pub(crate) fn new(buffer: &'a mut [u8], element_size: usize) -> Self {
        assert!(element_size > 0);
        Self {
            buffer,
            element_size,
        }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn bytes(&self, pindex: usize) -> &[u8] {
        &self.buffer[pindex * self.element_size..(pindex + 1) * self.element_size]
    }

    pub fn bytes_mut(&mut self, pindex: usize) -> &mut [u8] {
        &mut self.buffer[pindex * self.element_size..(pindex + 1) * self.element_size]
    }

    pub fn write<T: Pod>(&mut self, pindex: usize, value: T) {
        let size = std::mem::size_of::<T>();
        assert!(size <= self.element_size);
        self.bytes_mut(pindex)[..size].copy_from_slice(bytemuck::bytes_of(&value));
    }

    /// Slots are packed at `element_size` strides, so typed reads go
    /// through an unaligned copy.
    pub fn read<T: Pod>(&self, pindex: usize) -> T {
        let size = std::mem::size_of::<T>();
        assert!(size <= self.element_size);
        bytemuck::pod_read_unaligned(&self.bytes(pindex)[..size])
    }
}

/// What an event's `filter` sees: the particle set, current offsets and
/// durations, the step end time, and the best time factors found so far.
pub struct EventFilterInterface<'a> {
    pindices: &'a [u32],
    attributes: AttributeArrays<'a>,
    attribute_offsets: AttributeArrays<'a>,
    remaining_durations: &'a [f32],
    end_time: f32,
    known_min_time_factors: &'a [f32],
    storage: EventStorage<'a>,
    triggered_indices: &'a mut Vec<u32>,
    triggered_factors: &'a mut Vec<f32>,
}

impl<'a> EventFilterInterface<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pindices: &'a [u32],
        attributes: AttributeArrays<'a>,
        attribute_offsets: AttributeArrays<'a>,
        remaining_durations: &'a [f32],
        end_time: f32,
        known_min_time_factors: &'a [f32],
        storage: EventStorage<'a>,
        triggered_indices: &'a mut Vec<u32>,
        triggered_factors: &'a mut Vec<f32>,
    ) -> Self {
        Self {
            pindices,
            attributes,
            attribute_offsets,
            remaining_durations,
            end_time,
            known_min_time_factors,
            storage,
            triggered_indices,
            triggered_factors,
        }
    }

    pub fn particle_count(&self) -> usize {
        self.pindices.len()
    }

    /// Block-local indices of the particles in the set, in set order.
    pub fn particle_indices(&self) -> &'a [u32] {
        self.pindices
    }

    /// Active-slice view of the block's attributes, indexed by
    /// block-local particle index.
    pub fn attributes(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.attributes
    }

    pub fn attribute_offsets(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.attribute_offsets
    }

    /// Remaining durations, indexed by block-local particle index.
    pub fn remaining_durations(&self) -> &'a [f32] {
        self.remaining_durations
    }

    /// Absolute time at the end of the current step.
    pub fn end_time(&self) -> f32 {
        self.end_time
    }

    /// The smallest time factor reported for this set position so far.
    /// A filter must only trigger with a factor at or below this.
    pub fn known_min_time_factor(&self, index: usize) -> f32 {
        self.known_min_time_factors[index]
    }

    /// Trigger the particle at set position `index` at `time_factor`.
    pub fn trigger_particle(&mut self, index: usize, time_factor: f32) {
        assert!(index < self.pindices.len());
        assert!(
            (0.0..=1.0).contains(&time_factor)
                && time_factor <= self.known_min_time_factors[index],
            "time factor {time_factor} above known minimum"
        );
        self.triggered_indices.push(index as u32);
        self.triggered_factors.push(time_factor);
    }

    /// Trigger and stash `data` in the event storage for `execute`.
    pub fn trigger_particle_with<T: Pod>(&mut self, index: usize, time_factor: f32, data: T) {
        self.trigger_particle(index, time_factor);
        self.storage.write(self.pindices[index] as usize, data);
    }
}

/// What an event's `execute` sees: the subset of particles for which it
/// was the earliest, their current absolute times, and the means to
/// mutate attributes, kill, or spawn.
pub struct EventExecuteInterface<'a, 's> {
    pindices: &'a [u32],
    current_times: &'a [f32],
    attributes: AttributeArrays<'a>,
    attribute_offsets: AttributeArrays<'a>,
    remaining_durations: &'a [f32],
    storage: EventStorage<'a>,
    particle_allocator: &'a mut ParticleAllocator<'s>,
    array_allocator: &'a ArrayAllocator,
}

impl<'a, 's> EventExecuteInterface<'a, 's> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pindices: &'a [u32],
        current_times: &'a [f32],
        attributes: AttributeArrays<'a>,
        attribute_offsets: AttributeArrays<'a>,
        remaining_durations: &'a [f32],
        storage: EventStorage<'a>,
        particle_allocator: &'a mut ParticleAllocator<'s>,
        array_allocator: &'a ArrayAllocator,
    ) -> Self {
        Self {
            pindices,
            current_times,
            attributes,
            attribute_offsets,
            remaining_durations,
            storage,
            particle_allocator,
            array_allocator,
        }
    }

    pub fn particle_count(&self) -> usize {
        self.pindices.len()
    }

    pub fn particle_indices(&self) -> &'a [u32] {
        self.pindices
    }

    /// Absolute time of each particle in the set, parallel to
    /// `particle_indices`.
    pub fn current_times(&self) -> &'a [f32] {
        self.current_times
    }

    pub fn attributes(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.attributes
    }

    pub fn attribute_offsets(&mut self) -> &mut AttributeArrays<'a> {
        &mut self.attribute_offsets
    }

    pub fn remaining_durations(&self) -> &'a [f32] {
        self.remaining_durations
    }

    pub fn storage(&self) -> &EventStorage<'a> {
        &self.storage
    }

    /// Read the storage the filter wrote for the particle at set
    /// position `index`.
    pub fn read_storage<T: Pod>(&self, index: usize) -> T {
        self.storage.read(self.pindices[index] as usize)
    }

    /// Schedule the particle at set position `index` for deletion.
    pub fn kill(&mut self, index: usize) {
        let pindex = self.pindices[index] as usize;
        self.attributes.byte_by_name_mut(KILL_STATE)[pindex] = 1;
    }

    /// Schedule every particle in the set for deletion.
    pub fn kill_all(&mut self) {
        let kill_states = self.attributes.byte_by_name_mut(KILL_STATE);
        for &pindex in self.pindices {
            kill_states[pindex as usize] = 1;
        }
    }

    /// The worker's particle allocator, for spawning new particles.
    pub fn allocator(&mut self) -> &mut ParticleAllocator<'s> {
        self.particle_allocator
    }

    pub fn array_allocator(&self) -> &ArrayAllocator {
        self.array_allocator
    }
}
