//! Capability interface for the engines langpong orchestrates.
//!
//! An engine is produced by an [`EngineFactory`] from a list of plugin
//! configurations. The resulting [`EngineHandle`] runs named plugins.
pub mod engine;

#[cfg(feature = "test-utils")]
pub mod engine_test_util;

pub use engine::{EngineError, EngineFactory, EngineHandle, PluginConfig, PluginDescription};
