//! Ember Core - Foundational types for the Ember particle engine
//!
//! This crate provides the types that all other Ember crates depend on:
//! - `Vec3` - Pod 3-float vector used for float3 particle attributes
//! - `TimeSpan` - Absolute time interval of one simulation step
//! - Error types and Result alias

mod error;
mod time;
mod types;

pub use error::{EmberError, Result};
pub use time::TimeSpan;
pub use types::Vec3;
