//! Lightweight xorshift32 PRNG for stock emitters: no external crate
//! needed, and deterministic for a given seed.

use ember_core::Vec3;

pub struct ParticleRng {
    state: u32,
}

impl ParticleRng {
    pub fn new(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    /// Returns a float in [0, 1)
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() as f32) / (u32::MAX as f32)
    }

    /// Returns a float in [min, max)
    pub fn range(&mut self, min: f32, max: f32) -> f32 {
        min + self.next_f32() * (max - min)
    }

    /// Returns a random unit direction (uniform on the sphere surface,
    /// Marsaglia method).
    pub fn unit_direction(&mut self) -> Vec3 {
        loop {
            let x = self.range(-1.0, 1.0);
            let y = self.range(-1.0, 1.0);
            let s = x * x + y * y;
            if s < 1.0 {
                let factor = 2.0 * (1.0 - s).sqrt();
                return Vec3::new(x * factor, y * factor, 1.0 - 2.0 * s);
            }
        }
    }

    /// Returns a direction within a cone around `base_dir` with
    /// half-angle `angle_deg`. With zero angle, `base_dir` comes back
    /// unchanged (and unnormalized).
    pub fn cone_direction(&mut self, base_dir: Vec3, angle_deg: f32) -> Vec3 {
        if angle_deg <= 0.0 {
            return base_dir;
        }
        if angle_deg >= 180.0 {
            return self.unit_direction();
        }

        let cos_angle = (angle_deg * std::f32::consts::PI / 180.0).cos();

        // Uniform cos_theta in [cos_angle, 1], uniform phi in [0, 2pi].
        let cos_theta = self.range(cos_angle, 1.0);
        let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
        let phi = self.range(0.0, 2.0 * std::f32::consts::PI);

        // Local direction around +Z, rotated into base_dir's frame.
        let local = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
        rotate_to_basis(base_dir, local)
    }
}

/// Rotates `local` (expressed around +Z) to align with `forward`.
fn rotate_to_basis(forward: Vec3, local: Vec3) -> Vec3 {
    let forward = forward.normalized();
    let up = if forward.y.abs() > 0.99 {
        Vec3::new(1.0, 0.0, 0.0)
    } else {
        Vec3::new(0.0, 1.0, 0.0)
    };
    let right = up.cross(&forward).normalized();
    let actual_up = forward.cross(&right);

    right * local.x + actual_up * local.y + forward * local.z
}
