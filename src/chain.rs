use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::store::error::StoreError;

/// How a chain should be composed, e.g. `{ "type": "LLM", "options": {...} }`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChainConfig {
    #[serde(rename = "type")]
    pub chain_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl ChainConfig {
    pub fn new(chain_type: impl Into<String>) -> Self {
        Self { chain_type: chain_type.into(), options: Map::new() }
    }
}

/// A named, session scoped composed operation.
#[async_trait]
pub trait Chain: Send + Sync + Debug {
    async fn run(&self, input: Value) -> Result<Value, StoreError>;
}

/// Placeholder composition: answers with its type and the input it got.
#[derive(Debug, Clone)]
pub struct EchoChain {
    config: ChainConfig,
}

impl EchoChain {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Chain for EchoChain {
    async fn run(&self, input: Value) -> Result<Value, StoreError> {
        Ok(json!({
            "chainType": self.config.chain_type,
            "input": input,
        }))
    }
}

/// Builds the chain object registered for a `createChain` call.
pub fn build_chain(config: ChainConfig) -> Arc<dyn Chain> {
    Arc::new(EchoChain::new(config))
}
