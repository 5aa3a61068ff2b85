use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One entry of the configuration list handed to [`EngineFactory::init`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PluginConfig {
    /// Name of the plugin to enable.
    pub name: String,
    /// Plugin specific settings, passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub config: Value,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), config: Value::Null }
    }
}

/// What an engine can tell callers about one of its plugins.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PluginDescription {
    pub name: String,
    pub description: String,
    /// Optional JSON schema of the params the plugin accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Errors an engine (or its factory) can return.
#[derive(Error, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum EngineError {
    /// The requested plugin is not enabled for this engine.
    #[error("unknown plugin `{0}`")]
    UnknownPlugin(String),

    /// The configuration list was rejected during init.
    #[error("invalid plugin configuration: {0}")]
    InvalidConfig(String),

    /// The plugin ran and failed.
    #[error("plugin `{plugin}` failed: {message}")]
    Execution { plugin: String, message: String },

    #[error("engine error: {0}")]
    Other(String),
}

/// A live engine instance, exclusively owned by one session.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Run the plugin `name` with `params` and return its result.
    async fn run(&self, name: &str, params: Value) -> Result<Value, EngineError>;
}

/// Produces engine handles. Initialisation may be slow and may fail.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn init(&self, configs: Vec<PluginConfig>) -> Result<Arc<dyn EngineHandle>, EngineError>;

    /// Every plugin this factory knows how to enable.
    async fn plugins(&self) -> Vec<PluginDescription>;

    async fn plugin(&self, name: &str) -> Option<PluginDescription> {
        self.plugins().await.into_iter().find(|p| p.name == name)
    }
}
