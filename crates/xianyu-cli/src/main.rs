//! xianyu-live - keeps a seller's live chat session connected

use anyhow::Context;
use clap::Parser;

use xianyu_cli::{
    app::{setup_logging, LiveApp},
    cli::{Cli, Commands},
    config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            let effective = config::extract(cli.config.as_deref())
                .context("failed to load configuration")?;
            print!("{}", config::to_toml(&effective)?);
        }
        Commands::Run => {
            let effective =
                config::load(cli.config.as_deref()).context("failed to load configuration")?;
            setup_logging(&effective.logging.level, cli.verbose);
            LiveApp::new(effective).run().await?;
        }
    }

    Ok(())
}
