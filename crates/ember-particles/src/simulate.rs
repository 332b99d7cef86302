//! The per-step simulation pipeline and step driver
//!
//! One step proceeds as: advance the clock, ensure containers and
//! attribute layouts, simulate every existing block in parallel, run
//! the emitters, simulate newborn blocks from their birth times (a
//! worklist loop, since newborns can emit in turn), delete kill-tagged
//! particles, and compact every container.
//!
//! Within a block, motion is intercepted by events: each sub-step finds
//! the earliest event per particle, forwards all particles to their
//! event (or to step end), shrinks the remaining offsets and durations
//! of event particles, executes the events, and feeds the still-alive
//! unfinished particles into the next sub-step.

use crate::alloc::ParticleAllocator;
use crate::arrays::AttributeArraysCore;
use crate::block::Block;
use crate::container::{BlockRef, Container};
use crate::description::{ParticleType, StepDescription};
use crate::emitter::EmitterInterface;
use crate::events::{Event, EventExecuteInterface, EventFilterInterface, EventStorage};
use crate::integrator::IntegratorInterface;
use crate::scratch::{ArrayAllocator, ScratchVec};
use crate::state::ParticlesState;
use crate::{BIRTH_TIME, BLOCK_CAPACITY, KILL_STATE, MAX_EVENTS_PER_STEP, USE_THREADING};
use ember_core::{EmberError, Result, TimeSpan, Vec3};
use ember_schema::{AttributesDeclaration, AttributesInfo};
use rayon::prelude::*;
use std::sync::Arc;

fn max_event_storage_size(events: &[Box<dyn Event>]) -> usize {
    events.iter().map(|e| e.storage_size()).max().unwrap_or(0)
}

/// Run every event's filter and record, per particle, the earliest
/// event and its time factor. The last event to report an equal or
/// lower factor wins.
#[allow(clippy::too_many_arguments)]
fn find_next_event_per_particle(
    block: &mut Block,
    pindices: &[u32],
    attribute_offsets: &mut AttributeArraysCore,
    remaining_durations: &[f32],
    end_time: f32,
    events: &[Box<dyn Event>],
    event_storage_bytes: &mut [u8],
    storage_element_size: usize,
    next_event_indices: &mut [i32],
    time_factors_to_next_event: &mut [f32],
    indices_with_event: &mut ScratchVec<'_, u32>,
    pindices_with_event: &mut ScratchVec<'_, u32>,
) {
    for &pindex in pindices {
        next_event_indices[pindex as usize] = -1;
    }
    time_factors_to_next_event.fill(1.0);

    let mut triggered_indices: Vec<u32> = Vec::new();
    let mut triggered_factors: Vec<f32> = Vec::new();

    for (event_index, event) in events.iter().enumerate() {
        triggered_indices.clear();
        triggered_factors.clear();
        {
            let mut interface = EventFilterInterface::new(
                pindices,
                block.attributes(),
                attribute_offsets.slice_all(),
                remaining_durations,
                end_time,
                &*time_factors_to_next_event,
                EventStorage::new(&mut *event_storage_bytes, storage_element_size),
                &mut triggered_indices,
                &mut triggered_factors,
            );
            event.filter(&mut interface);
        }

        for (&index, &time_factor) in triggered_indices.iter().zip(&triggered_factors) {
            let pindex = pindices[index as usize];
            next_event_indices[pindex as usize] = event_index as i32;
            time_factors_to_next_event[index as usize] = time_factor;
        }
    }

    for (index, &pindex) in pindices.iter().enumerate() {
        if next_event_indices[pindex as usize] != -1 {
            indices_with_event.push(index as u32);
            pindices_with_event.push(pindex);
        }
    }
}

/// Advance every particle in the set by its time factor: event
/// particles to their event, the rest to step end.
fn forward_particles_to_next_event_or_end(
    block: &mut Block,
    pindices: &[u32],
    attribute_offsets: &AttributeArraysCore,
    time_factors_to_next_event: &[f32],
) {
    let offsets_info = attribute_offsets.info().clone();
    for (attr_index, name) in offsets_info.float3_names().iter().enumerate() {
        let offsets = attribute_offsets.float3(attr_index);
        let mut attributes = block.attributes();
        let values = attributes.float3_by_name_mut(name);

        for (index, &pindex) in pindices.iter().enumerate() {
            let pindex = pindex as usize;
            values[pindex] += time_factors_to_next_event[index] * offsets[pindex];
        }
    }
}

/// Event particles only consumed part of their offsets; scale the rest
/// down to what is left after the event.
fn update_remaining_attribute_offsets(
    indices_with_event: &[u32],
    pindices_with_event: &[u32],
    time_factors_to_next_event: &[f32],
    attribute_offsets: &mut AttributeArraysCore,
) {
    assert_eq!(indices_with_event.len(), pindices_with_event.len());

    for attr_index in 0..attribute_offsets.info().float3_names().len() {
        let offsets = attribute_offsets.float3_mut(attr_index);
        for (&index, &pindex) in indices_with_event.iter().zip(pindices_with_event) {
            offsets[pindex as usize] *= 1.0 - time_factors_to_next_event[index as usize];
        }
    }
}

fn update_remaining_durations(
    indices_with_event: &[u32],
    pindices_with_event: &[u32],
    time_factors_to_next_event: &[f32],
    remaining_durations: &mut [f32],
) {
    for (&index, &pindex) in indices_with_event.iter().zip(pindices_with_event) {
        remaining_durations[pindex as usize] *= 1.0 - time_factors_to_next_event[index as usize];
    }
}

fn find_particle_indices_per_event(
    pindices_with_event: &[u32],
    next_event_indices: &[i32],
    particles_per_event: &mut [Vec<u32>],
) {
    for &pindex in pindices_with_event {
        let event_index = next_event_indices[pindex as usize];
        assert!(event_index >= 0);
        particles_per_event[event_index as usize].push(pindex);
    }
}

/// Absolute time of each event particle, derived from the already
/// shrunken remaining durations.
fn compute_current_time_per_particle(
    pindices_with_event: &[u32],
    remaining_durations: &[f32],
    end_time: f32,
    next_event_indices: &[i32],
    current_time_per_particle: &mut [Vec<f32>],
) {
    for &pindex in pindices_with_event {
        let event_index = next_event_indices[pindex as usize];
        assert!(event_index >= 0);
        current_time_per_particle[event_index as usize]
            .push(end_time - remaining_durations[pindex as usize]);
    }
}

#[allow(clippy::too_many_arguments)]
fn execute_events(
    particle_allocator: &mut ParticleAllocator<'_>,
    array_allocator: &ArrayAllocator,
    block: &mut Block,
    particles_per_event: &[Vec<u32>],
    current_time_per_particle: &[Vec<f32>],
    remaining_durations: &[f32],
    events: &[Box<dyn Event>],
    event_storage_bytes: &mut [u8],
    storage_element_size: usize,
    attribute_offsets: &mut AttributeArraysCore,
) {
    assert_eq!(events.len(), particles_per_event.len());
    assert_eq!(events.len(), current_time_per_particle.len());

    for (event_index, event) in events.iter().enumerate() {
        let pindices = &particles_per_event[event_index];
        if pindices.is_empty() {
            continue;
        }

        let mut interface = EventExecuteInterface::new(
            pindices,
            &current_time_per_particle[event_index],
            block.attributes(),
            attribute_offsets.slice_all(),
            remaining_durations,
            EventStorage::new(&mut *event_storage_bytes, storage_element_size),
            particle_allocator,
            array_allocator,
        );
        event.execute(&mut interface);
    }
}

/// The survivors of a sub-step: alive and stopped short of step end.
fn find_unfinished_particles(
    indices_with_event: &[u32],
    pindices: &[u32],
    time_factors_to_next_event: &[f32],
    block: &mut Block,
    unfinished_pindices: &mut ScratchVec<'_, u32>,
) {
    let attributes = block.attributes();
    let kill_states = attributes.byte_by_name(KILL_STATE);

    for &index in indices_with_event {
        let index = index as usize;
        let pindex = pindices[index];
        if kill_states[pindex as usize] == 0 && time_factors_to_next_event[index] < 1.0 {
            unfinished_pindices.push(pindex);
        }
    }
}

/// One sub-step over one particle set: advance every particle either to
/// its next event or to step end, and execute the events.
#[allow(clippy::too_many_arguments)]
fn simulate_to_next_event(
    array_allocator: &ArrayAllocator,
    particle_allocator: &mut ParticleAllocator<'_>,
    block: &mut Block,
    pindices: &[u32],
    attribute_offsets: &mut AttributeArraysCore,
    remaining_durations: &mut [f32],
    end_time: f32,
    events: &[Box<dyn Event>],
    unfinished_pindices: &mut ScratchVec<'_, u32>,
) {
    let amount = pindices.len();

    let mut next_event_indices = array_allocator.allocate_slice::<i32>();
    let mut time_factors_to_next_event = array_allocator.allocate_slice::<f32>();
    let mut indices_with_event = array_allocator.allocate_vec::<u32>();
    let mut pindices_with_event = array_allocator.allocate_vec::<u32>();

    let storage_element_size = max_event_storage_size(events).max(1);
    let mut event_storage = array_allocator.allocate_bytes(storage_element_size);

    find_next_event_per_particle(
        block,
        pindices,
        attribute_offsets,
        remaining_durations,
        end_time,
        events,
        event_storage.bytes_mut(),
        storage_element_size,
        &mut next_event_indices,
        &mut time_factors_to_next_event[..amount],
        &mut indices_with_event,
        &mut pindices_with_event,
    );

    forward_particles_to_next_event_or_end(
        block,
        pindices,
        attribute_offsets,
        &time_factors_to_next_event[..amount],
    );

    update_remaining_attribute_offsets(
        &indices_with_event,
        &pindices_with_event,
        &time_factors_to_next_event[..amount],
        attribute_offsets,
    );

    update_remaining_durations(
        &indices_with_event,
        &pindices_with_event,
        &time_factors_to_next_event[..amount],
        remaining_durations,
    );

    let mut particles_per_event: Vec<Vec<u32>> = vec![Vec::new(); events.len()];
    find_particle_indices_per_event(
        &pindices_with_event,
        &next_event_indices,
        &mut particles_per_event,
    );

    let mut current_time_per_particle: Vec<Vec<f32>> = vec![Vec::new(); events.len()];
    compute_current_time_per_particle(
        &pindices_with_event,
        remaining_durations,
        end_time,
        &next_event_indices,
        &mut current_time_per_particle,
    );

    execute_events(
        particle_allocator,
        array_allocator,
        block,
        &particles_per_event,
        &current_time_per_particle,
        remaining_durations,
        events,
        event_storage.bytes_mut(),
        storage_element_size,
        attribute_offsets,
    );

    find_unfinished_particles(
        &indices_with_event,
        pindices,
        &time_factors_to_next_event[..amount],
        block,
        unfinished_pindices,
    );
}

/// Run sub-steps until every particle reached step end or died, capped
/// at `max_events` iterations to stop degenerate events from bouncing
/// forever. Particles still unfinished at the cap are returned so the
/// caller can bulk-apply their remaining offsets.
#[allow(clippy::too_many_arguments)]
fn simulate_with_max_n_events(
    max_events: usize,
    array_allocator: &ArrayAllocator,
    particle_allocator: &mut ParticleAllocator<'_>,
    block: &mut Block,
    attribute_offsets: &mut AttributeArraysCore,
    remaining_durations: &mut [f32],
    end_time: f32,
    events: &[Box<dyn Event>],
    unfinished_pindices: &mut ScratchVec<'_, u32>,
) {
    let mut input = array_allocator.allocate_vec::<u32>();
    let mut output = array_allocator.allocate_vec::<u32>();
    for pindex in 0..block.active_amount() {
        input.push(pindex as u32);
    }

    for _ in 0..max_events {
        if input.is_empty() {
            break;
        }
        output.clear();
        simulate_to_next_event(
            array_allocator,
            particle_allocator,
            block,
            &input,
            attribute_offsets,
            remaining_durations,
            end_time,
            events,
            &mut output,
        );
        std::mem::swap(&mut input, &mut output);
    }

    for &pindex in input.iter() {
        unfinished_pindices.push(pindex);
    }
}

fn is_aligned_16<T>(ptr: *const T) -> bool {
    ptr as usize % 16 == 0
}

/// `base[i] += values[i]` over flattened float3 arrays. Uses 4-wide SSE
/// adds when both arrays start 16-byte aligned (the attribute and
/// scratch allocators guarantee this for whole buffers), with a scalar
/// tail for the last `3n mod 4` floats.
fn add_float3_arrays(base: &mut [Vec3], values: &[Vec3]) {
    assert_eq!(base.len(), values.len());

    #[cfg(target_arch = "x86_64")]
    if is_aligned_16(base.as_ptr()) && is_aligned_16(values.as_ptr()) {
        // Safety: both pointers are 16-byte aligned and the loop stays
        // within `base.len() * 3` floats.
        unsafe {
            use std::arch::x86_64::{_mm_add_ps, _mm_load_ps, _mm_store_ps};

            let total = base.len() * 3;
            let vectorized = total - total % 4;
            let base_ptr = base.as_mut_ptr() as *mut f32;
            let values_ptr = values.as_ptr() as *const f32;

            let mut i = 0;
            while i < vectorized {
                let a = _mm_load_ps(base_ptr.add(i));
                let b = _mm_load_ps(values_ptr.add(i));
                _mm_store_ps(base_ptr.add(i), _mm_add_ps(a, b));
                i += 4;
            }
            for i in vectorized..total {
                *base_ptr.add(i) += *values_ptr.add(i);
            }
        }
        return;
    }

    for (b, v) in base.iter_mut().zip(values) {
        *b += *v;
    }
}

/// Add the full remaining offsets into every active row of the block.
fn apply_offsets_to_all_particles(block: &mut Block, attribute_offsets: &AttributeArraysCore) {
    let amount = block.active_amount();
    let offsets_info = attribute_offsets.info().clone();
    for (attr_index, name) in offsets_info.float3_names().iter().enumerate() {
        let offsets = &attribute_offsets.float3(attr_index)[..amount];
        let mut attributes = block.attributes();
        let values = attributes.float3_by_name_mut(name);
        add_float3_arrays(values, offsets);
    }
}

/// Add the remaining offsets into the given subset of particles.
fn apply_remaining_offsets(
    block: &mut Block,
    pindices: &[u32],
    attribute_offsets: &AttributeArraysCore,
) {
    let offsets_info = attribute_offsets.info().clone();
    for (attr_index, name) in offsets_info.float3_names().iter().enumerate() {
        let offsets = attribute_offsets.float3(attr_index);
        let mut attributes = block.attributes();
        let values = attributes.float3_by_name_mut(name);
        for &pindex in pindices {
            values[pindex as usize] += offsets[pindex as usize];
        }
    }
}

/// Simulate one block over the given per-particle durations: integrate,
/// intercept with events, and apply whatever offsets are left.
fn simulate_block(
    array_allocator: &ArrayAllocator,
    particle_allocator: &mut ParticleAllocator<'_>,
    block: &mut Block,
    particle_type: &ParticleType,
    remaining_durations: &mut [f32],
    end_time: f32,
) {
    let amount = block.active_amount();
    assert_eq!(amount, remaining_durations.len());
    assert!(array_allocator.array_length() >= amount);

    let offsets_info = Arc::new(particle_type.integrator.offset_attributes_info().clone());
    let mut attribute_offsets = array_allocator.allocate_attribute_arrays(offsets_info);

    {
        let mut interface = IntegratorInterface::new(
            block.attributes(),
            &*remaining_durations,
            array_allocator,
            attribute_offsets.core_mut().slice(0, amount),
        );
        particle_type.integrator.integrate(&mut interface);
    }

    if particle_type.events.is_empty() {
        apply_offsets_to_all_particles(block, attribute_offsets.core());
    } else {
        let mut unfinished_pindices = array_allocator.allocate_vec::<u32>();
        simulate_with_max_n_events(
            MAX_EVENTS_PER_STEP,
            array_allocator,
            particle_allocator,
            block,
            attribute_offsets.core_mut(),
            remaining_durations,
            end_time,
            &particle_type.events,
            &mut unfinished_pindices,
        );
        if !unfinished_pindices.is_empty() {
            apply_remaining_offsets(block, &unfinished_pindices, attribute_offsets.core());
        }
    }
}

/// Per-worker state of a parallel region: one scratch pool and one
/// particle sink.
struct WorkerLocals<'s> {
    arrays: ArrayAllocator,
    allocator: ParticleAllocator<'s>,
}

impl<'s> WorkerLocals<'s> {
    fn new(state: &'s ParticlesState) -> Self {
        Self {
            arrays: ArrayAllocator::new(BLOCK_CAPACITY),
            allocator: ParticleAllocator::new(state),
        }
    }
}

fn simulate_block_for_time_span(
    locals: &mut WorkerLocals<'_>,
    type_name: &str,
    block_ref: &BlockRef,
    description: &StepDescription,
    time_span: TimeSpan,
) {
    let particle_type = description.particle_type(type_name).unwrap();
    let mut block = block_ref.lock().unwrap();
    let amount = block.active_amount();

    let mut remaining_durations = locals.arrays.allocate_slice::<f32>();
    remaining_durations[..amount].fill(time_span.duration());

    simulate_block(
        &locals.arrays,
        &mut locals.allocator,
        &mut block,
        particle_type,
        &mut remaining_durations[..amount],
        time_span.end(),
    );
}

fn simulate_block_from_birth(
    locals: &mut WorkerLocals<'_>,
    type_name: &str,
    block_ref: &BlockRef,
    description: &StepDescription,
    end_time: f32,
) {
    let particle_type = description.particle_type(type_name).unwrap();
    let mut block = block_ref.lock().unwrap();

    // Birth times outside the step span would yield negative durations;
    // clamp so a misbehaving emitter stalls the particle instead.
    let mut remaining_durations: Vec<f32> = block
        .attributes()
        .float_by_name(BIRTH_TIME)
        .iter()
        .map(|birth_time| (end_time - birth_time).max(0.0))
        .collect();

    simulate_block(
        &locals.arrays,
        &mut locals.allocator,
        &mut block,
        particle_type,
        &mut remaining_durations,
        end_time,
    );
}

/// Simulate existing blocks over the whole step. Returns the blocks the
/// workers' allocators created along the way.
fn simulate_blocks_for_time_span(
    state: &ParticlesState,
    blocks: Vec<(String, BlockRef)>,
    description: &StepDescription,
    time_span: TimeSpan,
) -> Vec<(String, BlockRef)> {
    if blocks.is_empty() {
        return Vec::new();
    }
    if USE_THREADING {
        blocks
            .into_par_iter()
            .fold(
                || WorkerLocals::new(state),
                |mut locals, (type_name, block)| {
                    simulate_block_for_time_span(
                        &mut locals,
                        &type_name,
                        &block,
                        description,
                        time_span,
                    );
                    locals
                },
            )
            .map(|locals| locals.allocator.into_allocated_blocks())
            .reduce(Vec::new, |mut left, mut right| {
                left.append(&mut right);
                left
            })
    } else {
        let mut locals = WorkerLocals::new(state);
        for (type_name, block) in &blocks {
            simulate_block_for_time_span(&mut locals, type_name, block, description, time_span);
        }
        locals.allocator.into_allocated_blocks()
    }
}

/// Simulate newborn blocks from each particle's birth time to the end
/// of the step. Returns any further blocks created while doing so.
fn simulate_blocks_from_birth_to_current_time(
    state: &ParticlesState,
    blocks: Vec<(String, BlockRef)>,
    description: &StepDescription,
    end_time: f32,
) -> Vec<(String, BlockRef)> {
    if blocks.is_empty() {
        return Vec::new();
    }
    if USE_THREADING {
        blocks
            .into_par_iter()
            .fold(
                || WorkerLocals::new(state),
                |mut locals, (type_name, block)| {
                    simulate_block_from_birth(&mut locals, &type_name, &block, description, end_time);
                    locals
                },
            )
            .map(|locals| locals.allocator.into_allocated_blocks())
            .reduce(Vec::new, |mut left, mut right| {
                left.append(&mut right);
                left
            })
    } else {
        let mut locals = WorkerLocals::new(state);
        for (type_name, block) in &blocks {
            simulate_block_from_birth(&mut locals, type_name, block, description, end_time);
        }
        locals.allocator.into_allocated_blocks()
    }
}

fn get_all_blocks(
    state: &ParticlesState,
    description: &StepDescription,
) -> Vec<(String, BlockRef)> {
    let mut blocks = Vec::new();
    for type_name in description.type_names() {
        if let Some(container) = state.container(type_name) {
            for block in container.active_blocks() {
                blocks.push((type_name.to_string(), block));
            }
        }
    }
    blocks
}

fn create_particles_from_emitters(
    state: &ParticlesState,
    description: &StepDescription,
    time_span: TimeSpan,
) -> Vec<(String, BlockRef)> {
    let array_allocator = ArrayAllocator::new(BLOCK_CAPACITY);
    let mut particle_allocator = ParticleAllocator::new(state);
    for emitter in &description.emitters {
        let mut interface =
            EmitterInterface::new(&mut particle_allocator, &array_allocator, time_span);
        emitter.emit(&mut interface);
    }
    particle_allocator.into_allocated_blocks()
}

fn emit_and_simulate_particles(
    state: &ParticlesState,
    description: &StepDescription,
    time_span: TimeSpan,
) {
    let mut newborn_blocks =
        simulate_blocks_for_time_span(state, get_all_blocks(state, description), description, time_span);
    newborn_blocks.extend(create_particles_from_emitters(state, description, time_span));

    // Newborns may emit in turn; drain the worklist region by region.
    while !newborn_blocks.is_empty() {
        log::trace!("simulating {} newborn block(s)", newborn_blocks.len());
        newborn_blocks = simulate_blocks_from_birth_to_current_time(
            state,
            newborn_blocks,
            description,
            time_span.end(),
        );
    }
}

/// Remove kill-tagged rows with a backward-swap pass: each killed row is
/// overwritten by the last active row, which is then re-checked.
fn delete_tagged_in_block(block: &mut Block) {
    let kill_index = block.info().byte_index(KILL_STATE).unwrap();

    let mut index = 0;
    while index < block.active_amount() {
        if block.arrays_core().byte(kill_index)[index] == 1 {
            let last = block.active_amount() - 1;
            block.move_row(last, index);
            block.set_active_amount(last);
        } else {
            index += 1;
        }
    }
}

fn delete_tagged_particles(state: &ParticlesState, description: &StepDescription) {
    let blocks = get_all_blocks(state, description);
    if USE_THREADING {
        blocks
            .par_iter()
            .for_each(|(_, block)| delete_tagged_in_block(&mut block.lock().unwrap()));
    } else {
        for (_, block) in &blocks {
            delete_tagged_in_block(&mut block.lock().unwrap());
        }
    }
}

fn compress_all_containers(state: &ParticlesState) {
    for (_, container) in state.containers() {
        let blocks = container.active_blocks();
        if blocks.is_empty() {
            continue;
        }
        {
            let mut guards: Vec<_> = blocks.iter().map(|b| b.lock().unwrap()).collect();
            let mut block_refs: Vec<&mut Block> = guards.iter_mut().map(|g| &mut **g).collect();
            Block::compress(&mut block_refs);
        }
        for block in &blocks {
            if block.lock().unwrap().is_empty() {
                container.release_block(block);
            }
        }
    }
}

fn ensure_required_containers_exist(state: &mut ParticlesState, description: &StepDescription) {
    let missing: Vec<String> = description
        .type_names()
        .filter(|name| !state.has_container(name))
        .map(str::to_string)
        .collect();
    for type_name in missing {
        state.insert_container(
            type_name,
            Container::new(AttributesInfo::empty(), BLOCK_CAPACITY),
        );
    }
}

/// Union of the required attributes, the type's own declarations, and
/// everything its events contribute.
fn build_attributes_info_for_type(particle_type: &ParticleType) -> Result<AttributesInfo> {
    let mut declaration = AttributesDeclaration::new();
    declaration.add_byte(KILL_STATE);
    declaration.add_float(BIRTH_TIME);
    for (name, kind) in &particle_type.attributes {
        declaration.add(name.clone(), *kind);
    }
    for event in &particle_type.events {
        event.attributes(&mut declaration);
    }
    AttributesInfo::from_declaration(&declaration)
}

/// Validate the description and resolve every type's attribute layout.
/// Runs before the clock advances so a configuration error leaves the
/// state untouched.
fn validate_description(description: &StepDescription) -> Result<Vec<(String, AttributesInfo)>> {
    let duration = description.duration;
    if !duration.is_finite() || duration <= 0.0 {
        return Err(EmberError::InvalidStepDuration(duration));
    }

    for (index, (name, _)) in description.types.iter().enumerate() {
        if description.types[..index].iter().any(|(n, _)| n == name) {
            return Err(EmberError::DuplicateParticleType(name.clone()));
        }
    }

    description
        .types
        .iter()
        .map(|(name, ty)| {
            let info = build_attributes_info_for_type(ty)?;
            // The integrator's offsets land in same-named float3
            // attributes, so the type must carry them all.
            for offset_name in ty.integrator.offset_attributes_info().float3_names() {
                if info.float3_index(offset_name).is_none() {
                    return Err(EmberError::MissingAttribute {
                        type_name: name.clone(),
                        attribute: offset_name.clone(),
                    });
                }
            }
            Ok((name.clone(), info))
        })
        .collect()
}

fn ensure_required_attributes_exist(
    state: &mut ParticlesState,
    type_infos: Vec<(String, AttributesInfo)>,
) {
    for (type_name, info) in type_infos {
        state
            .container_mut(&type_name)
            .unwrap()
            .update_attributes(info);
    }
}

/// Advance the state by one step.
///
/// Configuration errors are returned before any mutation; once
/// simulation begins, a step always runs to completion.
pub fn simulate_step(state: &mut ParticlesState, description: &StepDescription) -> Result<()> {
    let type_infos = validate_description(description)?;

    let time_span = TimeSpan::new(state.current_time(), description.duration);
    state.set_current_time(time_span.end());

    ensure_required_containers_exist(state, description);
    ensure_required_attributes_exist(state, type_infos);

    emit_and_simulate_particles(state, description, time_span);

    delete_tagged_particles(state, description);
    compress_all_containers(state);

    log::debug!(
        "step to t={:.4}: {} particle(s) alive",
        state.current_time(),
        state.total_particles()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::ConstantVelocityIntegrator;
    use ember_schema::AttributeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Test event that triggers every particle at a fixed time factor.
    struct FactorEvent {
        factor: f32,
        tag: Option<(&'static str, u8)>,
        kill: bool,
        executions: Arc<AtomicUsize>,
        observed_positions: Arc<Mutex<Vec<Vec3>>>,
    }

    impl FactorEvent {
        fn plain(factor: f32) -> Self {
            Self {
                factor,
                tag: None,
                kill: false,
                executions: Arc::new(AtomicUsize::new(0)),
                observed_positions: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn killing(factor: f32) -> Self {
            Self {
                kill: true,
                ..Self::plain(factor)
            }
        }

        fn tagging(factor: f32, name: &'static str, value: u8) -> Self {
            Self {
                tag: Some((name, value)),
                ..Self::plain(factor)
            }
        }
    }

    impl Event for FactorEvent {
        fn attributes(&self, decl: &mut AttributesDeclaration) {
            if let Some((name, _)) = self.tag {
                decl.add_byte(name);
            }
        }

        fn filter(&self, interface: &mut EventFilterInterface<'_>) {
            for index in 0..interface.particle_count() {
                if self.factor <= interface.known_min_time_factor(index) {
                    interface.trigger_particle(index, self.factor);
                }
            }
        }

        fn execute(&self, interface: &mut EventExecuteInterface<'_, '_>) {
            self.executions.fetch_add(1, Ordering::Relaxed);
            let pindices = interface.particle_indices();
            {
                let positions = interface.attributes().float3_by_name("Position");
                let mut observed = self.observed_positions.lock().unwrap();
                for &pindex in pindices {
                    observed.push(positions[pindex as usize]);
                }
            }
            if let Some((name, value)) = self.tag {
                let tags = interface.attributes().byte_by_name_mut(name);
                for &pindex in pindices {
                    tags[pindex as usize] = value;
                }
            }
            if self.kill {
                interface.kill_all();
            }
        }
    }

    /// Test event that ignores the known minimum, to exercise the
    /// monotonicity assertion.
    struct UncheckedFactorEvent {
        factor: f32,
    }

    impl Event for UncheckedFactorEvent {
        fn filter(&self, interface: &mut EventFilterInterface<'_>) {
            for index in 0..interface.particle_count() {
                interface.trigger_particle(index, self.factor);
            }
        }

        fn execute(&self, _interface: &mut EventExecuteInterface<'_, '_>) {}
    }

    /// Kills its particles and spawns replacements of another type at
    /// the event time.
    struct SpawnEvent {
        factor: f32,
        spawn_type: &'static str,
        spawn_count: usize,
    }

    impl Event for SpawnEvent {
        fn filter(&self, interface: &mut EventFilterInterface<'_>) {
            for index in 0..interface.particle_count() {
                if self.factor <= interface.known_min_time_factor(index) {
                    interface.trigger_particle(index, self.factor);
                }
            }
        }

        fn execute(&self, interface: &mut EventExecuteInterface<'_, '_>) {
            let mut birth_times = Vec::new();
            for &time in interface.current_times() {
                for _ in 0..self.spawn_count {
                    birth_times.push(time);
                }
            }
            interface.kill_all();
            let new = interface.allocator().request(self.spawn_type, birth_times.len());
            new.fill_float3("Position", Vec3::ZERO);
            new.set_float(BIRTH_TIME, &birth_times);
        }
    }

    /// Emits one particle per listed birth time, at the origin.
    struct ListEmitter {
        particle_type: &'static str,
        birth_times: Vec<f32>,
    }

    impl crate::emitter::Emitter for ListEmitter {
        fn emit(&self, interface: &mut EmitterInterface<'_, '_>) {
            let new = interface.request(self.particle_type, self.birth_times.len());
            new.fill_float3("Position", Vec3::ZERO);
            new.set_float(BIRTH_TIME, &self.birth_times);
        }
    }

    fn dot_type(velocity: Vec3) -> ParticleType {
        ParticleType::new(Box::new(ConstantVelocityIntegrator::new(velocity)))
            .with_attribute("Position", AttributeKind::Float3)
    }

    /// Seed a block of particles at the given positions, with birth
    /// time zero and kill state clear.
    fn seed_block(
        state: &mut ParticlesState,
        type_name: &str,
        particle_type: &ParticleType,
        capacity: usize,
        positions: &[Vec3],
    ) -> BlockRef {
        let info = build_attributes_info_for_type(particle_type).unwrap();
        if !state.has_container(type_name) {
            state.insert_container(type_name, Container::new(info, capacity));
        }
        let block = state.container(type_name).unwrap().new_block();
        {
            let mut guard = block.lock().unwrap();
            guard.set_active_amount(positions.len());
            guard.arrays_core_mut().zero_rows(0, positions.len());
            guard
                .attributes()
                .float3_by_name_mut("Position")
                .copy_from_slice(positions);
        }
        block
    }

    fn single_position(state: &ParticlesState, type_name: &str) -> Vec3 {
        let container = state.container(type_name).unwrap();
        let blocks = container.active_blocks();
        assert_eq!(blocks.len(), 1);
        let mut guard = blocks[0].lock().unwrap();
        assert_eq!(guard.active_amount(), 1);
        guard.attributes().float3_by_name("Position")[0]
    }

    #[test]
    fn linear_motion_without_events() {
        let mut state = ParticlesState::new();
        let particle_type = dot_type(Vec3::new(1.0, 0.0, 0.0));
        seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        simulate_step(&mut state, &description).unwrap();

        assert_eq!(state.current_time(), 1.0);
        assert_eq!(single_position(&state, "Dot"), Vec3::new(1.0, 0.0, 0.0));
        let blocks = state.container("Dot").unwrap().active_blocks();
        assert_eq!(blocks[0].lock().unwrap().attributes().byte_by_name(KILL_STATE)[0], 0);

        // The clock strictly increases by the step duration.
        simulate_step(&mut state, &description).unwrap();
        assert_eq!(state.current_time(), 2.0);
        assert_eq!(single_position(&state, "Dot"), Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn mid_step_kill_advances_to_the_event_then_deletes() {
        let mut state = ParticlesState::new();
        let event = FactorEvent::killing(0.5);
        let observed = event.observed_positions.clone();

        let particle_type = dot_type(Vec3::new(2.0, 0.0, 0.0)).with_event(Box::new(event));
        seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        simulate_step(&mut state, &description).unwrap();

        // The event saw the particle at half the step's displacement.
        assert_eq!(*observed.lock().unwrap(), [Vec3::new(1.0, 0.0, 0.0)]);
        // Deletion emptied the block and compaction released it.
        let container = state.container("Dot").unwrap();
        assert_eq!(container.active_particles(), 0);
        assert_eq!(container.block_count(), 0);
    }

    #[test]
    fn degenerate_event_is_capped_and_offsets_complete() {
        let mut state = ParticlesState::new();
        let event = FactorEvent::plain(0.5);
        let executions = event.executions.clone();

        let particle_type = dot_type(Vec3::new(1.0, 0.0, 0.0)).with_event(Box::new(event));
        seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        simulate_step(&mut state, &description).unwrap();

        // Bounced once per sub-step until the cap, then the caller
        // applied the remaining offsets in bulk.
        assert_eq!(executions.load(Ordering::Relaxed), MAX_EVENTS_PER_STEP);
        let position = single_position(&state, "Dot");
        assert!((position.x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn equal_time_factors_last_event_wins() {
        let mut state = ParticlesState::new();
        let event_a = FactorEvent::tagging(0.5, "Tag", 1);
        let event_b = FactorEvent::tagging(0.5, "Tag", 2);
        let a_executions = event_a.executions.clone();

        let particle_type = dot_type(Vec3::new(1.0, 0.0, 0.0))
            .with_event(Box::new(event_a))
            .with_event(Box::new(event_b));
        seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        simulate_step(&mut state, &description).unwrap();

        let blocks = state.container("Dot").unwrap().active_blocks();
        let mut guard = blocks[0].lock().unwrap();
        assert_eq!(guard.attributes().byte_by_name("Tag")[0], 2);
        assert_eq!(a_executions.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "above known minimum")]
    fn filter_reporting_above_known_minimum_panics() {
        let mut state = ParticlesState::new();
        let particle_type = dot_type(Vec3::new(1.0, 0.0, 0.0))
            .with_event(Box::new(FactorEvent::plain(0.5)))
            .with_event(Box::new(UncheckedFactorEvent { factor: 0.9 }));
        seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        let _ = simulate_step(&mut state, &description);
    }

    #[test]
    fn split_event_halves_offsets_and_durations() {
        let mut state = ParticlesState::new();
        let info = AttributesInfo::new(
            vec![KILL_STATE.into()],
            vec![BIRTH_TIME.into()],
            vec!["Position".into()],
        )
        .unwrap();
        state.insert_container("Dot", Container::new(info, 10));
        let block_ref = state.container("Dot").unwrap().new_block();
        block_ref.lock().unwrap().set_active_amount(1);

        let array_allocator = ArrayAllocator::new(10);
        let mut particle_allocator = ParticleAllocator::new(&state);
        let offsets_info =
            Arc::new(AttributesInfo::new(vec![], vec![], vec!["Position".into()]).unwrap());
        let mut offsets = array_allocator.allocate_attribute_arrays(offsets_info);
        offsets.core_mut().float3_mut(0)[0] = Vec3::new(2.0, 0.0, 0.0);

        let events: Vec<Box<dyn Event>> = vec![Box::new(FactorEvent::plain(0.5))];
        let mut remaining_durations = [1.0f32];
        let mut unfinished = array_allocator.allocate_vec::<u32>();

        let mut guard = block_ref.lock().unwrap();
        simulate_to_next_event(
            &array_allocator,
            &mut particle_allocator,
            &mut guard,
            &[0],
            offsets.core_mut(),
            &mut remaining_durations,
            1.0,
            &events,
            &mut unfinished,
        );

        assert_eq!(
            guard.attributes().float3_by_name("Position")[0],
            Vec3::new(1.0, 0.0, 0.0)
        );
        assert_eq!(offsets.core().float3(0)[0], Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(remaining_durations[0], 0.5);
        assert_eq!(&*unfinished, &[0]);
    }

    #[test]
    fn emission_simulates_newborns_from_birth_to_step_end() {
        let mut state = ParticlesState::new();
        let description = StepDescription::new(1.0)
            .with_type("Dot", dot_type(Vec3::new(1.0, 0.0, 0.0)))
            .with_emitter(Box::new(ListEmitter {
                particle_type: "Dot",
                birth_times: vec![0.2, 0.5, 0.9],
            }));

        simulate_step(&mut state, &description).unwrap();

        let container = state.container("Dot").unwrap();
        assert_eq!(container.active_particles(), 3);
        let blocks = container.active_blocks();
        let mut guard = blocks[0].lock().unwrap();
        let attributes = guard.attributes();
        let births = attributes.float_by_name(BIRTH_TIME);
        let positions = attributes.float3_by_name("Position");
        assert_eq!(births, [0.2, 0.5, 0.9]);
        for index in 0..3 {
            assert!((positions[index].x - (1.0 - births[index])).abs() < 1e-6);
            assert_eq!(positions[index].y, 0.0);
        }
    }

    #[test]
    fn emission_overflowing_block_capacity_spans_blocks() {
        let mut state = ParticlesState::new();
        let info = AttributesInfo::new(
            vec![KILL_STATE.into()],
            vec![BIRTH_TIME.into()],
            vec!["Position".into()],
        )
        .unwrap();
        state.insert_container("Dot", Container::new(info, 4));

        let birth_times: Vec<f32> = (0..10).map(|i| i as f32 * 0.1).collect();
        let description = StepDescription::new(1.0)
            .with_type("Dot", dot_type(Vec3::new(1.0, 0.0, 0.0)))
            .with_emitter(Box::new(ListEmitter {
                particle_type: "Dot",
                birth_times: birth_times.clone(),
            }));

        simulate_step(&mut state, &description).unwrap();

        let container = state.container("Dot").unwrap();
        assert_eq!(container.active_particles(), 10);
        let mut amounts: Vec<usize> = container
            .active_blocks()
            .iter()
            .map(|b| b.lock().unwrap().active_amount())
            .collect();
        amounts.sort_unstable();
        assert_eq!(amounts, [2, 4, 4]);

        // Every particle, wherever it landed, advanced from its own
        // birth time to the step end.
        for block in container.active_blocks() {
            let mut guard = block.lock().unwrap();
            let attributes = guard.attributes();
            let births = attributes.float_by_name(BIRTH_TIME).to_vec();
            let positions = attributes.float3_by_name("Position");
            for (position, birth) in positions.iter().zip(births) {
                assert!((position.x - (1.0 - birth)).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn event_spawned_particles_are_simulated_in_the_same_step() {
        let mut state = ParticlesState::new();
        let parent_type = dot_type(Vec3::new(1.0, 0.0, 0.0)).with_event(Box::new(SpawnEvent {
            factor: 0.5,
            spawn_type: "Child",
            spawn_count: 3,
        }));
        seed_block(&mut state, "Parent", &parent_type, BLOCK_CAPACITY, &[Vec3::ZERO]);

        let description = StepDescription::new(1.0)
            .with_type("Parent", parent_type)
            .with_type("Child", dot_type(Vec3::new(2.0, 0.0, 0.0)));

        simulate_step(&mut state, &description).unwrap();

        assert_eq!(state.container("Parent").unwrap().active_particles(), 0);
        let children = state.container("Child").unwrap();
        assert_eq!(children.active_particles(), 3);
        let blocks = children.active_blocks();
        let mut guard = blocks[0].lock().unwrap();
        let attributes = guard.attributes();
        for index in 0..3 {
            assert_eq!(attributes.float_by_name(BIRTH_TIME)[index], 0.5);
            // Children were born at t=0.5 and moved at 2/unit-time.
            assert!((attributes.float3_by_name("Position")[index].x - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn deletion_keeps_exactly_the_unkilled_rows() {
        let mut state = ParticlesState::new();
        let particle_type = dot_type(Vec3::ZERO);
        let positions: Vec<Vec3> = (0..5).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let block = seed_block(&mut state, "Dot", &particle_type, BLOCK_CAPACITY, &positions);

        {
            let mut guard = block.lock().unwrap();
            let mut attributes = guard.attributes();
            let kill_states = attributes.byte_by_name_mut(KILL_STATE);
            kill_states[1] = 1;
            kill_states[4] = 1;
        }
        delete_tagged_in_block(&mut block.lock().unwrap());

        let mut guard = block.lock().unwrap();
        assert_eq!(guard.active_amount(), 3);
        let attributes = guard.attributes();
        assert!(attributes.byte_by_name(KILL_STATE).iter().all(|&k| k == 0));
        let mut survivors: Vec<f32> = attributes
            .float3_by_name("Position")
            .iter()
            .map(|p| p.x)
            .collect();
        survivors.sort_by(f32::total_cmp);
        assert_eq!(survivors, [0.0, 2.0, 3.0]);
    }

    #[test]
    fn step_compacts_sparse_blocks_and_releases_empties() {
        let mut state = ParticlesState::new();
        let particle_type = dot_type(Vec3::ZERO);
        for i in 0..4 {
            seed_block(
                &mut state,
                "Dot",
                &particle_type,
                4,
                &[Vec3::new(i as f32, 0.0, 0.0)],
            );
        }
        assert_eq!(state.container("Dot").unwrap().block_count(), 4);

        let description = StepDescription::new(1.0).with_type("Dot", particle_type);
        simulate_step(&mut state, &description).unwrap();

        let container = state.container("Dot").unwrap();
        assert_eq!(container.block_count(), 1);
        let blocks = container.active_blocks();
        let mut guard = blocks[0].lock().unwrap();
        assert_eq!(guard.active_amount(), 4);
        let mut values: Vec<f32> = guard
            .attributes()
            .float3_by_name("Position")
            .iter()
            .map(|p| p.x)
            .collect();
        values.sort_by(f32::total_cmp);
        assert_eq!(values, [0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn configuration_errors_leave_the_state_untouched() {
        let mut state = ParticlesState::new();

        let duplicate = StepDescription::new(1.0)
            .with_type("Dot", dot_type(Vec3::ZERO))
            .with_type("Dot", dot_type(Vec3::ZERO));
        let err = simulate_step(&mut state, &duplicate).unwrap_err();
        assert!(matches!(err, EmberError::DuplicateParticleType(_)));

        let bad_duration = StepDescription::new(0.0).with_type("Dot", dot_type(Vec3::ZERO));
        let err = simulate_step(&mut state, &bad_duration).unwrap_err();
        assert!(matches!(err, EmberError::InvalidStepDuration(_)));

        // An event contributing "Tag" as a byte while the type declares
        // it as a float is a kind conflict.
        let conflicting_type = dot_type(Vec3::ZERO)
            .with_attribute("Tag", AttributeKind::Float)
            .with_event(Box::new(FactorEvent::tagging(0.5, "Tag", 1)));
        let conflict = StepDescription::new(1.0).with_type("Dot", conflicting_type);
        let err = simulate_step(&mut state, &conflict).unwrap_err();
        assert!(matches!(err, EmberError::AttributeKindConflict { .. }));

        // A type missing a float3 the integrator wants to offset.
        let positionless =
            ParticleType::new(Box::new(ConstantVelocityIntegrator::new(Vec3::ZERO)));
        let missing = StepDescription::new(1.0).with_type("Dot", positionless);
        let err = simulate_step(&mut state, &missing).unwrap_err();
        assert!(matches!(err, EmberError::MissingAttribute { .. }));

        assert_eq!(state.current_time(), 0.0);
        assert!(!state.has_container("Dot"));
    }
}
