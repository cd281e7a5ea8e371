use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "gateway", version, about = "Distributed API Gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the gateway server (default)
    Start,

    /// Validate configuration, route table, and public key
    Validate,

    /// Show version information
    Version,
}

impl Cli {
    /// Command to execute, defaulting to Start if none provided.
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start)
    }
}
