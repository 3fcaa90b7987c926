mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crucible-cli")]
#[command(about = "Crucible admin CLI - manage API keys and inspect job statistics", long_about = None)]
struct Cli {
    /// Path to the service database file
    #[arg(long, env = "CRUCIBLE_DB_PATH", default_value = "crucible.db")]
    db_path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage API keys
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Show aggregate job statistics
    Stats,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Create a new API key
    Add {
        /// Free-form note about who the key is for
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// List all API keys
    List,

    /// Delete an API key
    Revoke {
        /// The key to delete
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keys { action } => match action {
            KeyAction::Add { description } => commands::add_key(&cli.db_path, &description).await?,
            KeyAction::List => commands::list_keys(&cli.db_path).await?,
            KeyAction::Revoke { key } => commands::revoke_key(&cli.db_path, &key).await?,
        },
        Commands::Stats => commands::show_stats(&cli.db_path).await?,
    }

    Ok(())
}
