//! Ember Particles - block-structured particle simulation engine
//!
//! Particles are rows in fixed-capacity blocks of columnar attribute
//! arrays, grouped into one container per particle type. Each step the
//! driver integrates every block in parallel, intercepts motion with
//! events, runs emitters, simulates newborns from their birth times,
//! deletes kill-tagged particles and compacts the blocks.
//!
//! Hosts drive the engine through [`simulate_step`] with a
//! [`StepDescription`] built from [`Integrator`], [`Event`] and
//! [`Emitter`] implementations; a few stock ones live in [`builtin`].

pub mod alloc;
pub mod arrays;
pub mod block;
pub mod builtin;
pub mod container;
pub mod description;
pub mod emitter;
pub mod events;
pub mod integrator;
pub mod rand;
pub mod scratch;
pub mod simulate;
pub mod state;

pub use alloc::{NewParticles, ParticleAllocator};
pub use block::Block;
pub use container::{BlockRef, Container};
pub use description::{ParticleType, StepDescription};
pub use emitter::{Emitter, EmitterInterface};
pub use events::{Event, EventExecuteInterface, EventFilterInterface, EventStorage};
pub use integrator::{Integrator, IntegratorInterface};
pub use scratch::ArrayAllocator;
pub use simulate::simulate_step;
pub use state::ParticlesState;

/// Rows per block. Scratch arrays are sized to this, so containers with
/// a larger custom capacity cannot be simulated.
pub const BLOCK_CAPACITY: usize = 1000;

/// When false, parallel regions run sequentially on the calling thread.
pub const USE_THREADING: bool = true;

/// Cap on event-interception sub-steps per block per step. Particles
/// still bouncing at the cap get their remaining offsets applied in
/// bulk.
pub const MAX_EVENTS_PER_STEP: usize = 10;

/// Required byte attribute: 0 = alive, 1 = scheduled for deletion.
pub const KILL_STATE: &str = "Kill State";

/// Required float attribute: absolute simulation time of creation.
pub const BIRTH_TIME: &str = "Birth Time";
