use std::{path::PathBuf, sync::Arc};

use clap::Args;
use tracing::info;

use super::CliContext;
use langpong::auth::OwnershipPolicy;
use langpong::config::AppConfig;
use langpong::engine::BuiltinEngine;
use langpong::http::{self, AppState};
use langpong::logger::{LogLevel, init_tracing};
use langpong::store::ManagerStore;

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    #[arg(long)]
    pub max_concurrent_runs_per_manager: Option<usize>,

    #[arg(long)]
    pub max_concurrent_runs_global: Option<usize>,

    /// Log level (trace, debug, info, warn, error, critical)
    #[arg(long)]
    pub log_level: Option<LogLevel>,

    /// Directory for the rolling log file
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_logs_endpoint: Option<String>,

    /// Only the principal that created a session may use it
    #[arg(long)]
    pub enforce_ownership: bool,
}

impl RunArgs {
    /// Command line flags win over every other config layer.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(limit) = self.max_concurrent_runs_per_manager {
            config.manager.max_concurrent_runs_per_manager = limit;
        }
        if let Some(limit) = self.max_concurrent_runs_global {
            config.manager.max_concurrent_runs_global = limit;
        }
        if let Some(level) = self.log_level {
            config.manager.log_level = level;
        }
        if let Some(dir) = &self.logs_dir {
            config.manager.logs_dir = dir.clone();
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let mut config = context.config.clone();
    args.apply(&mut config);
    config.validate()?;

    let _log_guard = init_tracing(
        &config.manager.logs_dir,
        config.manager.log_level,
        args.otel_logs_endpoint.as_deref(),
    )?;
    context.sources.log();
    info!("Langpong starting up with {:?}", config.manager);

    let store = ManagerStore::new(config.manager.clone(), Arc::new(BuiltinEngine::new()));
    let mut state = AppState::new(store).with_default_plugins(config.plugins_default.clone());
    if args.enforce_ownership {
        state = state.with_policy(Arc::new(OwnershipPolicy::new()));
    }

    http::serve(state, &config.server).await
}
