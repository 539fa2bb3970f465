//! OmniBridge CLI: the main entry point.
//!
//! Commands:
//! - `chat`    Interactive or single-message chat, with device inputs
//! - `tools`   List the tools exposed by configured MCP servers
//! - `ingest`  Add documents to the retrieval store
//! - `search`  Query the retrieval store
//! - `init`    Write the default config file

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "omnibridge",
    about = "OmniBridge: multimodal agent runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.omnibridge/config.toml)
    #[arg(short, long, global = true, env = "OMNIBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat(commands::chat::ChatArgs),

    /// List tools from every configured MCP server
    Tools,

    /// Split, embed and store documents for retrieval
    Ingest {
        /// Text files to ingest
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Search the retrieval store
    Search {
        query: String,

        /// Number of results (defaults to retrieval.top_k)
        #[arg(short, long)]
        k: Option<usize>,
    },

    /// Write the default config file
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
}

fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn,omnibridge=info,omnibridge_agent=info,omnibridge_backends=info,omnibridge_mcp=info,omnibridge_retrieval=info,omnibridge_normalizer=info,omnibridge_config=info")
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(cli.verbose))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Chat(args) => commands::chat::run(config, args).await?,
        Commands::Tools => commands::tools::run(config).await?,
        Commands::Ingest { files } => commands::ingest::run(config, &files).await?,
        Commands::Search { query, k } => commands::search::run(config, &query, k).await?,
        Commands::Init { force } => commands::init::run(config, force)?,
    }

    Ok(())
}
