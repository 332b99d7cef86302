//! Per-worker particle creation sink
//!
//! Emitters and events create particles through a `ParticleAllocator`.
//! The allocator claims rows in fresh blocks acquired from the owning
//! state's containers and records every block it creates so the step
//! driver can simulate newborns from their birth time afterwards.
//! Allocators are single-worker-owned; concurrent workers use distinct
//! allocators, so their sink blocks are disjoint by construction.

use crate::container::BlockRef;
use crate::state::ParticlesState;
use ember_core::Vec3;
use std::collections::HashMap;
use std::ops::Range;

/// Worker-owned sink for newborn particles.
pub struct ParticleAllocator<'s> {
    state: &'s ParticlesState,
    non_full_sinks: HashMap<String, BlockRef>,
    allocated: Vec<(String, BlockRef)>,
}

impl<'s> ParticleAllocator<'s> {
    pub fn new(state: &'s ParticlesState) -> Self {
        Self {
            state,
            non_full_sinks: HashMap::new(),
            allocated: Vec::new(),
        }
    }

    pub fn state(&self) -> &'s ParticlesState {
        self.state
    }

    /// Claim `amount` rows for newborn particles of the given type.
    ///
    /// The claimed rows may span several blocks. They are zero-filled,
    /// so `"Kill State"` starts at 0; the caller must set `"Birth Time"`
    /// and any other attributes it cares about through the returned
    /// handle.
    ///
    /// Panics on an unknown type name: type wiring is validated before
    /// the step runs, so a miss here is a programmer error.
    pub fn request(&mut self, type_name: &str, amount: usize) -> NewParticles {
        let container = self
            .state
            .container(type_name)
            .unwrap_or_else(|| panic!("no container for particle type '{type_name}'"));

        let mut chunks = Vec::new();
        let mut remaining = amount;
        while remaining > 0 {
            let sink = match self.non_full_sinks.get(type_name) {
                Some(sink) => sink.clone(),
                None => {
                    let block = container.new_block();
                    self.allocated.push((type_name.to_string(), block.clone()));
                    self.non_full_sinks
                        .insert(type_name.to_string(), block.clone());
                    block
                }
            };

            let mut block = sink.lock().unwrap();
            let start = block.active_amount();
            let claim = remaining.min(block.remaining_capacity());
            if claim == 0 {
                drop(block);
                self.non_full_sinks.remove(type_name);
                continue;
            }
            block.arrays_core_mut().zero_rows(start, claim);
            block.set_active_amount(start + claim);
            let full = block.is_full();
            drop(block);
            if full {
                self.non_full_sinks.remove(type_name);
            }

            chunks.push(NewChunk {
                block: sink,
                range: start..start + claim,
            });
            remaining -= claim;
        }

        NewParticles { chunks }
    }

    /// Every block this allocator created, in creation order.
    pub fn allocated_blocks(&self) -> &[(String, BlockRef)] {
        &self.allocated
    }

    pub fn into_allocated_blocks(self) -> Vec<(String, BlockRef)> {
        self.allocated
    }
}

struct NewChunk {
    block: BlockRef,
    range: Range<usize>,
}

/// Rows claimed by one `request` call, with bulk attribute setters that
/// scatter values across the underlying blocks.
pub struct NewParticles {
    chunks: Vec<NewChunk>,
}

impl NewParticles {
    pub fn total(&self) -> usize {
        self.chunks.iter().map(|c| c.range.len()).sum()
    }

    pub fn fill_byte(&self, name: &str, value: u8) {
        self.for_each_chunk(|view, _| view.byte_by_name_mut(name).fill(value));
    }

    pub fn set_byte(&self, name: &str, values: &[u8]) {
        assert_eq!(values.len(), self.total());
        self.for_each_chunk(|view, offset| {
            let len = view.len();
            view.byte_by_name_mut(name)
                .copy_from_slice(&values[offset..offset + len]);
        });
    }

    pub fn fill_float(&self, name: &str, value: f32) {
        self.for_each_chunk(|view, _| view.float_by_name_mut(name).fill(value));
    }

    pub fn set_float(&self, name: &str, values: &[f32]) {
        assert_eq!(values.len(), self.total());
        self.for_each_chunk(|view, offset| {
            let len = view.len();
            view.float_by_name_mut(name)
                .copy_from_slice(&values[offset..offset + len]);
        });
    }

    pub fn fill_float3(&self, name: &str, value: Vec3) {
        self.for_each_chunk(|view, _| view.float3_by_name_mut(name).fill(value));
    }

    pub fn set_float3(&self, name: &str, values: &[Vec3]) {
        assert_eq!(values.len(), self.total());
        self.for_each_chunk(|view, offset| {
            let len = view.len();
            view.float3_by_name_mut(name)
                .copy_from_slice(&values[offset..offset + len]);
        });
    }

    fn for_each_chunk(&self, mut f: impl FnMut(&mut crate::arrays::AttributeArrays<'_>, usize)) {
        let mut offset = 0;
        for chunk in &self.chunks {
            let mut block = chunk.block.lock().unwrap();
            let mut view = block.slice(chunk.range.start, chunk.range.len());
            f(&mut view, offset);
            offset += chunk.range.len();
        }
    }
}
