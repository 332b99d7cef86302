//! Simulation state: containers per particle type plus the clock

use crate::container::Container;
use std::collections::HashMap;

/// The complete state of a particle simulation.
///
/// Owns one container per particle type and the monotonically advancing
/// simulation clock. The container map is only mutated in the serial
/// phases of a step; during parallel regions it is read-only.
#[derive(Default)]
pub struct ParticlesState {
    containers: HashMap<String, Container>,
    current_time: f32,
}

impl ParticlesState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absolute simulation time. During a step this is already the end
    /// of the step's time span.
    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    pub(crate) fn set_current_time(&mut self, time: f32) {
        self.current_time = time;
    }

    pub fn container(&self, type_name: &str) -> Option<&Container> {
        self.containers.get(type_name)
    }

    pub fn container_mut(&mut self, type_name: &str) -> Option<&mut Container> {
        self.containers.get_mut(type_name)
    }

    /// Insert a container for a type, replacing any existing one. Hosts
    /// use this to pre-create containers with a non-default block
    /// capacity; the step driver creates missing containers itself.
    pub fn insert_container(&mut self, type_name: impl Into<String>, container: Container) {
        self.containers.insert(type_name.into(), container);
    }

    pub fn has_container(&self, type_name: &str) -> bool {
        self.containers.contains_key(type_name)
    }

    pub fn containers(&self) -> impl Iterator<Item = (&str, &Container)> {
        self.containers.iter().map(|(name, c)| (name.as_str(), c))
    }

    /// Total live particles across all types.
    pub fn total_particles(&self) -> usize {
        self.containers.values().map(|c| c.active_particles()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_schema::AttributesInfo;

    #[test]
    fn container_lookup_and_totals() {
        let mut state = ParticlesState::new();
        assert_eq!(state.current_time(), 0.0);
        assert!(!state.has_container("Sparks"));

        state.insert_container("Sparks", Container::new(AttributesInfo::empty(), 10));
        assert!(state.has_container("Sparks"));
        assert_eq!(state.total_particles(), 0);

        state
            .container("Sparks")
            .unwrap()
            .new_block()
            .lock()
            .unwrap()
            .set_active_amount(7);
        assert_eq!(state.total_particles(), 7);
    }
}
