//! The in-process engine the binary runs with when no external engine is
//! wired in.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_api::{EngineError, EngineFactory, EngineHandle, PluginConfig, PluginDescription};
use serde_json::{Value, json};
use tracing::{debug, info};

const ECHO: &str = "echo";
const SLEEP: &str = "sleep";
const FAIL: &str = "fail";

#[derive(Debug, Clone, Default)]
pub struct BuiltinEngine;

impl BuiltinEngine {
    pub fn new() -> Self {
        Self
    }

    fn is_known(name: &str) -> bool {
        matches!(name, ECHO | SLEEP | FAIL)
    }
}

#[async_trait]
impl EngineFactory for BuiltinEngine {
    #[tracing::instrument(name = "builtin_engine_init", skip(self, configs))]
    async fn init(&self, configs: Vec<PluginConfig>) -> Result<Arc<dyn EngineHandle>, EngineError> {
        let mut enabled = HashSet::with_capacity(configs.len());
        for config in configs {
            if !Self::is_known(&config.name) {
                return Err(EngineError::InvalidConfig(format!("unknown plugin `{}` in config", config.name)));
            }
            if !enabled.insert(config.name.clone()) {
                return Err(EngineError::InvalidConfig(format!("plugin `{}` configured twice", config.name)));
            }
        }
        info!("Builtin engine ready with plugins {:?}", enabled);
        Ok(Arc::new(BuiltinHandle { enabled }))
    }

    async fn plugins(&self) -> Vec<PluginDescription> {
        vec![
            PluginDescription {
                name: ECHO.into(),
                description: "Returns its params unchanged".into(),
                params: None,
            },
            PluginDescription {
                name: SLEEP.into(),
                description: "Waits `ms` milliseconds, then returns its params".into(),
                params: Some(json!({
                    "type": "object",
                    "properties": { "ms": { "type": "integer", "minimum": 0 } }
                })),
            },
            PluginDescription {
                name: FAIL.into(),
                description: "Always fails, with `message` if given".into(),
                params: Some(json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } }
                })),
            },
        ]
    }
}

#[derive(Debug)]
struct BuiltinHandle {
    enabled: HashSet<String>,
}

#[async_trait]
impl EngineHandle for BuiltinHandle {
    async fn run(&self, name: &str, params: Value) -> Result<Value, EngineError> {
        if !self.enabled.contains(name) {
            return Err(EngineError::UnknownPlugin(name.to_string()));
        }
        debug!("builtin plugin `{name}` called with {params}");
        match name {
            ECHO => Ok(params),
            SLEEP => {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(params)
            }
            FAIL => {
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("requested failure")
                    .to_string();
                Err(EngineError::Execution { plugin: name.to_string(), message })
            }
            other => Err(EngineError::UnknownPlugin(other.to_string())),
        }
    }
}
