use std::{fs, path::PathBuf};

use anyhow::Context;
use clap::Args;
use schemars::schema_for;

use langpong::config::AppConfig;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Write the schema to this file instead of stdout
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

pub fn execute(args: SchemaArgs) -> anyhow::Result<()> {
    let schema = schema_for!(AppConfig);
    let json = serde_json::to_string_pretty(&schema)?;
    match args.out {
        Some(path) => {
            fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
            println!("Schema written to {}", path.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}
