//! Ember CLI - run particle effects described in TOML

use anyhow::{bail, Context, Result};
use clap::Parser;
use ember_core::Vec3;
use ember_particles::builtin::{AgeReaperEvent, EulerIntegrator, PointEmitter};
use ember_particles::{simulate_step, ParticleType, ParticlesState, StepDescription};
use ember_schema::AttributeKind;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Run a particle effect simulation", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the effect TOML file
    effect: PathBuf,

    /// Number of steps to simulate
    #[arg(long, default_value_t = 60)]
    steps: u32,

    /// Step duration in seconds (overrides the effect file)
    #[arg(long)]
    step_duration: Option<f32>,

    /// Print per-step statistics
    #[arg(long)]
    stats: bool,
}

#[derive(Debug, Deserialize)]
struct EffectConfig {
    #[serde(default = "default_step_duration")]
    step_duration: f32,
    #[serde(default)]
    types: Vec<TypeConfig>,
    #[serde(default)]
    emitters: Vec<EmitterConfig>,
}

fn default_step_duration() -> f32 {
    1.0 / 60.0
}

#[derive(Debug, Deserialize)]
struct TypeConfig {
    name: String,
    #[serde(default)]
    acceleration: [f32; 3],
    /// Seconds until particles are reaped; zero or absent means they
    /// live forever.
    #[serde(default)]
    lifetime: f32,
}

#[derive(Debug, Deserialize)]
struct EmitterConfig {
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    position: [f32; 3],
    #[serde(default)]
    velocity: [f32; 3],
    #[serde(default = "default_rate")]
    rate: f32,
    #[serde(default)]
    jitter_deg: f32,
    #[serde(default = "default_seed")]
    seed: u32,
}

fn default_rate() -> f32 {
    10.0
}

fn default_seed() -> u32 {
    1
}

fn build_description(config: &EffectConfig, step_duration: f32) -> Result<StepDescription> {
    let mut description = StepDescription::new(step_duration);

    for type_config in &config.types {
        let mut particle_type = ParticleType::new(Box::new(EulerIntegrator::new(
            Vec3::from_array(type_config.acceleration),
        )))
        .with_attribute("Position", AttributeKind::Float3)
        .with_attribute("Velocity", AttributeKind::Float3);
        if type_config.lifetime > 0.0 {
            particle_type =
                particle_type.with_event(Box::new(AgeReaperEvent::new(type_config.lifetime)));
        }
        description = description.with_type(type_config.name.clone(), particle_type);
    }

    for emitter in &config.emitters {
        if !config.types.iter().any(|t| t.name == emitter.type_name) {
            bail!(
                "emitter references unknown particle type '{}'",
                emitter.type_name
            );
        }
        description = description.with_emitter(Box::new(PointEmitter {
            particle_type: emitter.type_name.clone(),
            position: Vec3::from_array(emitter.position),
            velocity: Vec3::from_array(emitter.velocity),
            rate: emitter.rate,
            jitter_deg: emitter.jitter_deg,
            seed: emitter.seed,
        }));
    }

    Ok(description)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let text = std::fs::read_to_string(&cli.effect)
        .with_context(|| format!("reading {}", cli.effect.display()))?;
    let config: EffectConfig =
        toml::from_str(&text).with_context(|| format!("parsing {}", cli.effect.display()))?;

    let step_duration = cli.step_duration.unwrap_or(config.step_duration);
    let description = build_description(&config, step_duration)?;
    log::info!(
        "running {} step(s) of {:.4}s over {} type(s)",
        cli.steps,
        step_duration,
        description.types.len()
    );

    let mut state = ParticlesState::new();
    for step in 0..cli.steps {
        simulate_step(&mut state, &description).with_context(|| format!("step {step}"))?;
        if cli.stats {
            println!(
                "step {:>4}  t={:>8.3}  alive={}",
                step + 1,
                state.current_time(),
                state.total_particles()
            );
        }
    }

    println!(
        "simulated {} step(s) to t={:.3}",
        cli.steps,
        state.current_time()
    );
    for (name, container) in state.containers() {
        println!(
            "  {name}: {} particle(s) in {} block(s)",
            container.active_particles(),
            container.block_count()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FOUNTAIN: &str = r#"
step_duration = 0.02

[[types]]
name = "Sparks"
acceleration = [0.0, -9.81, 0.0]
lifetime = 2.0

[[emitters]]
type = "Sparks"
velocity = [0.0, 6.0, 0.0]
rate = 120.0
jitter_deg = 12.0
"#;

    #[test]
    fn parse_and_build_effect() {
        let config: EffectConfig = toml::from_str(FOUNTAIN).unwrap();
        assert!((config.step_duration - 0.02).abs() < 1e-6);
        assert_eq!(config.types[0].name, "Sparks");
        assert_eq!(config.emitters[0].rate, 120.0);

        let description = build_description(&config, config.step_duration).unwrap();
        assert_eq!(description.types.len(), 1);
        assert_eq!(description.emitters.len(), 1);
    }

    #[test]
    fn unknown_emitter_type_is_rejected() {
        let config: EffectConfig = toml::from_str(
            r#"
[[emitters]]
type = "Ghost"
"#,
        )
        .unwrap();
        assert!(build_description(&config, 0.02).is_err());
    }

    #[test]
    fn effect_runs_and_reaps() {
        let config: EffectConfig = toml::from_str(FOUNTAIN).unwrap();
        let description = build_description(&config, config.step_duration).unwrap();

        let mut state = ParticlesState::new();
        for _ in 0..150 {
            simulate_step(&mut state, &description).unwrap();
        }
        // 3s in with a 2s lifetime: emission and reaping have reached a
        // steady state around rate * lifetime particles.
        let alive = state.total_particles();
        assert!(alive > 0);
        assert!((150..350).contains(&alive));
    }
}
