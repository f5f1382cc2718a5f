//! macy-core — shared types, wire format, and configuration.
//! All other macy crates depend on this one.

pub mod config;
pub mod report;
pub mod wire;

pub use config::{ConfigError, MacyConfig, Settings, Transport};
pub use report::Report;
pub use wire::{Codec, FeatureBits, WireError};
