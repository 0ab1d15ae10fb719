use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;
use crate::config::Config;

mod cli;
mod config;
mod logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.dump_config {
        print!("{}", Config::default().to_toml()?);
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.merge_cli(&cli);

    if cli.dump_config_merged {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    logging::init(&config.debug, &config.verbose);

    let server = config.build()?;
    netboot::server::run(server).await?;
    Ok(())
}
