//! Stock integrators, events and emitters
//!
//! Enough to run useful effects without writing custom components: a
//! fixed-velocity and a constant-acceleration integrator, a lifetime
//! reaper, and a point emitter with optional directional jitter.

use crate::emitter::{Emitter, EmitterInterface};
use crate::events::{Event, EventExecuteInterface, EventFilterInterface};
use crate::integrator::{Integrator, IntegratorInterface};
use crate::rand::ParticleRng;
use crate::BIRTH_TIME;
use ember_core::Vec3;
use ember_schema::AttributesInfo;

/// Offsets `"Position"` by a fixed velocity times the remaining
/// duration.
pub struct ConstantVelocityIntegrator {
    velocity: Vec3,
    offsets_info: AttributesInfo,
}

impl ConstantVelocityIntegrator {
    pub fn new(velocity: Vec3) -> Self {
        Self {
            velocity,
            offsets_info: AttributesInfo::new(vec![], vec![], vec!["Position".into()]).unwrap(),
        }
    }
}

impl Integrator for ConstantVelocityIntegrator {
    fn offset_attributes_info(&self) -> &AttributesInfo {
        &self.offsets_info
    }

    fn integrate(&self, interface: &mut IntegratorInterface<'_>) {
        let durations = interface.remaining_durations();
        let position_offsets = interface.offsets().float3_by_name_mut("Position");
        for (offset, &duration) in position_offsets.iter_mut().zip(durations) {
            *offset = self.velocity * duration;
        }
    }
}

/// Semi-implicit constant-acceleration integrator. Reads the
/// per-particle `"Velocity"` float3 attribute (the type must declare
/// it) and offsets both `"Position"` and `"Velocity"`.
pub struct EulerIntegrator {
    acceleration: Vec3,
    offsets_info: AttributesInfo,
}

impl EulerIntegrator {
    pub fn new(acceleration: Vec3) -> Self {
        Self {
            acceleration,
            offsets_info: AttributesInfo::new(
                vec![],
                vec![],
                vec!["Position".into(), "Velocity".into()],
            )
            .unwrap(),
        }
    }
}

impl Integrator for EulerIntegrator {
    fn offset_attributes_info(&self) -> &AttributesInfo {
        &self.offsets_info
    }

    fn integrate(&self, interface: &mut IntegratorInterface<'_>) {
        let durations = interface.remaining_durations();
        let (attributes, offsets) = interface.attributes_and_offsets();
        {
            let velocities = attributes.float3_by_name("Velocity");
            let position_offsets = offsets.float3_by_name_mut("Position");
            for (index, &duration) in durations.iter().enumerate() {
                position_offsets[index] =
                    velocities[index] * duration + self.acceleration * (0.5 * duration * duration);
            }
        }
        let velocity_offsets = offsets.float3_by_name_mut("Velocity");
        for (offset, &duration) in velocity_offsets.iter_mut().zip(durations) {
            *offset = self.acceleration * duration;
        }
    }
}

/// Kills particles a fixed lifetime after their birth time,
/// intercepting mid-step at the exact death time.
pub struct AgeReaperEvent {
    lifetime: f32,
}

impl AgeReaperEvent {
    pub fn new(lifetime: f32) -> Self {
        assert!(lifetime >= 0.0);
        Self { lifetime }
    }
}

impl Event for AgeReaperEvent {
    fn filter(&self, interface: &mut EventFilterInterface<'_>) {
        let pindices = interface.particle_indices();
        let durations = interface.remaining_durations();
        let end_time = interface.end_time();

        let mut hits: Vec<(usize, f32)> = Vec::new();
        {
            let birth_times = interface.attributes().float_by_name(BIRTH_TIME);
            for (index, &pindex) in pindices.iter().enumerate() {
                let pindex = pindex as usize;
                let remaining = durations[pindex];
                if remaining <= 0.0 {
                    continue;
                }
                let death_time = birth_times[pindex] + self.lifetime;
                if death_time > end_time {
                    continue;
                }
                let current_time = end_time - remaining;
                let time_factor = ((death_time - current_time) / remaining).clamp(0.0, 1.0);
                hits.push((index, time_factor));
            }
        }

        for (index, time_factor) in hits {
            if time_factor <= interface.known_min_time_factor(index) {
                interface.trigger_particle(index, time_factor);
            }
        }
    }

    fn execute(&self, interface: &mut EventExecuteInterface<'_, '_>) {
        interface.kill_all();
    }
}

/// Emits at a fixed rate from a point, spreading birth times uniformly
/// across the step span.
///
/// The target type must declare a `"Velocity"` float3 attribute.
/// `jitter_deg` cones the emission direction; the speed is preserved.
pub struct PointEmitter {
    pub particle_type: String,
    pub position: Vec3,
    pub velocity: Vec3,
    /// Particles per unit time. The per-step count is truncated.
    pub rate: f32,
    /// Cone half-angle in degrees; zero emits exactly along `velocity`.
    pub jitter_deg: f32,
    pub seed: u32,
}

impl Emitter for PointEmitter {
    fn emit(&self, interface: &mut EmitterInterface<'_, '_>) {
        let span = interface.time_span();
        let amount = (self.rate * span.duration()) as usize;
        if amount == 0 {
            return;
        }

        // Seed per span so repeated steps do not replay the same jitter.
        let mut rng = ParticleRng::new(self.seed ^ span.start().to_bits());
        let speed = self.velocity.length();

        let mut velocities = Vec::with_capacity(amount);
        let mut birth_times = Vec::with_capacity(amount);
        for index in 0..amount {
            let fraction = (index as f32 + 0.5) / amount as f32;
            birth_times.push(span.interpolate(fraction));
            let velocity = if self.jitter_deg > 0.0 {
                rng.cone_direction(self.velocity, self.jitter_deg) * speed
            } else {
                self.velocity
            };
            velocities.push(velocity);
        }

        let new = interface.request(&self.particle_type, amount);
        new.fill_float3("Position", self.position);
        new.set_float3("Velocity", &velocities);
        new.set_float(BIRTH_TIME, &birth_times);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::{ParticleType, StepDescription};
    use crate::simulate::simulate_step;
    use crate::state::ParticlesState;
    use ember_schema::AttributeKind;

    fn euler_type(lifetime: Option<f32>) -> ParticleType {
        let mut ty = ParticleType::new(Box::new(EulerIntegrator::new(Vec3::new(0.0, -10.0, 0.0))))
            .with_attribute("Position", AttributeKind::Float3)
            .with_attribute("Velocity", AttributeKind::Float3);
        if let Some(lifetime) = lifetime {
            ty = ty.with_event(Box::new(AgeReaperEvent::new(lifetime)));
        }
        ty
    }

    #[test]
    fn point_emitter_spreads_births_across_span() {
        let mut state = ParticlesState::new();
        let description = StepDescription::new(1.0)
            .with_type("Sparks", euler_type(None))
            .with_emitter(Box::new(PointEmitter {
                particle_type: "Sparks".into(),
                position: Vec3::new(0.0, 1.0, 0.0),
                velocity: Vec3::new(0.0, 5.0, 0.0),
                rate: 8.0,
                jitter_deg: 0.0,
                seed: 1,
            }));

        simulate_step(&mut state, &description).unwrap();

        let container = state.container("Sparks").unwrap();
        assert_eq!(container.active_particles(), 8);

        let block = &container.active_blocks()[0];
        let mut guard = block.lock().unwrap();
        let n = guard.active_amount();
        let attributes = guard.attributes();
        let births = attributes.float_by_name("Birth Time");
        let positions = attributes.float3_by_name("Position");
        for index in 0..n {
            let birth = births[index];
            assert!(birth > 0.0 && birth < 1.0);
            // y(t) = y0 + v*dt - 5*dt^2 for each particle's own age.
            let dt = 1.0 - birth;
            let expected = 1.0 + 5.0 * dt - 5.0 * dt * dt;
            assert!((positions[index].y - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn age_reaper_removes_expired_particles() {
        let mut state = ParticlesState::new();
        let description = StepDescription::new(1.0)
            .with_type("Sparks", euler_type(Some(0.25)))
            .with_emitter(Box::new(PointEmitter {
                particle_type: "Sparks".into(),
                position: Vec3::ZERO,
                velocity: Vec3::new(1.0, 0.0, 0.0),
                rate: 4.0,
                jitter_deg: 0.0,
                seed: 3,
            }));

        // Births at 0.125, 0.375, 0.625, 0.875; deaths 0.25 later. Only
        // the last one survives past the step end.
        simulate_step(&mut state, &description).unwrap();
        assert_eq!(state.container("Sparks").unwrap().active_particles(), 1);
    }

    #[test]
    fn euler_integrator_applies_gravity_over_a_step() {
        let mut state = ParticlesState::new();
        let description = StepDescription::new(0.5)
            .with_type("Sparks", euler_type(None))
            .with_emitter(Box::new(PointEmitter {
                particle_type: "Sparks".into(),
                position: Vec3::ZERO,
                velocity: Vec3::new(2.0, 0.0, 0.0),
                rate: 2.0,
                jitter_deg: 0.0,
                seed: 5,
            }));
        simulate_step(&mut state, &description).unwrap();

        let container = state.container("Sparks").unwrap();
        let block = &container.active_blocks()[0];
        let mut guard = block.lock().unwrap();
        let attributes = guard.attributes();
        let births = attributes.float_by_name("Birth Time").to_vec();
        let positions = attributes.float3_by_name("Position");
        let velocities = attributes.float3_by_name("Velocity");
        for index in 0..positions.len() {
            let dt = 0.5 - births[index];
            assert!((positions[index].x - 2.0 * dt).abs() < 1e-5);
            assert!((positions[index].y - (-5.0 * dt * dt)).abs() < 1e-4);
            assert!((velocities[index].y - (-10.0 * dt)).abs() < 1e-4);
        }
    }
}
