use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod run;
pub mod schema;

use langpong::config::{AppConfig, ConfigSources};
use run::RunArgs;
use schema::SchemaArgs;

#[derive(Parser, Debug)]
#[command(
    name = "langpong",
    about = "Multi-tenant session orchestrator for execution engines",
    version
)]
pub struct Cli {
    /// Config file (.json, .yaml or .yml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the HTTP API
    Run(RunArgs),

    /// Print the JSON-Schema of the config file
    Schema(SchemaArgs),
}

/// Configuration after the file and environment layers have been applied.
#[derive(Clone, Debug)]
pub struct CliContext {
    pub config: AppConfig,
    pub sources: ConfigSources,
}

impl CliContext {
    pub fn new(config: AppConfig, sources: ConfigSources) -> Self {
        Self { config, sources }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args),
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default())
}
