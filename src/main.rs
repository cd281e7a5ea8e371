use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use api_gateway::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    init_tracing();

    match args.get_command() {
        cli::Commands::Start => {
            commands::start::execute().await?;
        }
        cli::Commands::Validate => {
            commands::validate::execute()?;
        }
        cli::Commands::Version => {
            println!("API Gateway v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
