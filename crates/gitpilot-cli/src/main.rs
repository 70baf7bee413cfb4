mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, context::ContextSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "gitpilot",
    about = "Queue and run agent-assisted git operations (commit, push, create-pr)",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .gitpilot/ or .git/)
    #[arg(long, global = true, env = "GITPILOT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (operations, status, SSE and WebSocket events)
    Serve {
        /// Address to bind; anything but loopback also needs --token
        #[arg(long, env = "GITPILOT_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on (0 = OS-assigned)
        #[arg(long, env = "GITPILOT_PORT", default_value = "3142")]
        port: u16,

        /// Shared token non-local clients must present (Bearer header or ?token=)
        #[arg(long, env = "GITPILOT_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Override queue.max_concurrent from the config file
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Open the status endpoint in a browser once listening
        #[arg(long)]
        open: bool,
    },

    /// Print the context an operation would be given
    Context {
        #[command(subcommand)]
        subcommand: ContextSubcommand,
    },

    /// Inspect and validate .gitpilot/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Serve { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            token,
            max_concurrent,
            open,
        } => cmd::serve::run(
            &root,
            cmd::serve::ServeArgs {
                host,
                port,
                token,
                max_concurrent,
                open,
            },
        ),
        Commands::Context { subcommand } => cmd::context::run(&root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
