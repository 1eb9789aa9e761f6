//! mcplink - command-line client for MCP servers.
//!
//! Lists and calls tools, reads resources and renders prompts on servers
//! configured in `~/.config/mcplink/config.json`.

mod callback;
mod commands;
mod config;
mod credentials;

use clap::{Parser, Subcommand};
use commands::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcplink")]
#[command(author, version, about = "Command-line client for MCP servers", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/mcplink/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Write logs to the platform log directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,
    /// List the tools a server offers
    Tools {
        /// Server name
        server: String,
    },
    /// Call a tool
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// List resources and resource templates
    Resources {
        /// Server name
        server: String,
    },
    /// Read a resource
    Read {
        /// Server name
        server: String,
        /// Resource URI
        uri: String,
    },
    /// List prompts
    Prompts {
        /// Server name
        server: String,
    },
    /// Render a prompt
    Prompt {
        /// Server name
        server: String,
        /// Prompt name
        name: String,
        /// Prompt arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },
    /// Show OAuth metadata advertised for a server URL
    Discover {
        /// MCP server URL
        url: String,
    },
    /// Authorize with an OAuth-protected server
    Auth {
        /// Server name
        server: String,
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },
    /// Remove stored OAuth credentials for a server
    Logout {
        /// Server name
        server: String,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = init_logging(cli.verbose, cli.log_file);
    if let Some(path) = &log_file {
        tracing::debug!(path = %path.display(), "Logging to file");
    }

    match cli.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Discover { url } => discover(&url).await,
        command => {
            let ctx = Context::load(cli.config, cli.json).await?;
            run(&ctx, command).await
        }
    }
}

async fn run(ctx: &Context, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Servers => list_servers(ctx).await,
        Commands::Tools { server } => list_tools(ctx, &server).await,
        Commands::Call { server, tool, args } => {
            call_tool(ctx, &server, &tool, args.as_deref()).await
        }
        Commands::Resources { server } => list_resources(ctx, &server).await,
        Commands::Read { server, uri } => read_resource(ctx, &server, &uri).await,
        Commands::Prompts { server } => list_prompts(ctx, &server).await,
        Commands::Prompt { server, name, args } => {
            get_prompt(ctx, &server, &name, args.as_deref()).await
        }
        Commands::Auth { server, no_browser } => authenticate(ctx, &server, no_browser).await,
        Commands::Logout { server } => logout(ctx, &server).await,
        Commands::Version | Commands::Discover { .. } => Ok(()),
    }
}

fn print_version() {
    println!("mcplink {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Command-line client for Model Context Protocol servers.");
    println!();
    println!("https://github.com/wonop-io/mcplink");
}
