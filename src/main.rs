use clap::Parser;

mod cli;

use cli::{Cli, CliContext, default_command, execute};
use langpong::config::AppConfig;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (config, sources) = AppConfig::load(cli.config.as_deref())?;
    let context = CliContext::new(config, sources);
    execute(&context, cli.command.unwrap_or_else(default_command)).await
}
