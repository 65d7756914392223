mod auth;
mod cli;
mod client;
mod config;
mod error;
mod fetch;
mod models;
mod normalize;
mod providers;
mod secrets;
mod state;
mod template;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use env_logger::Env;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_level())).init();

    info!("Starting cifetch");
    cli.execute().await?;

    Ok(())
}
