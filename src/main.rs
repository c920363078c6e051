//! # Relay CLI (`relay`)
//!
//! ## Usage
//!
//! ```bash
//! relay --config ./config/relay.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `relay serve` | Start the HTTP event surface |
//! | `relay check` | Print the effective configuration and validate credentials |
//! | `relay complete "<text>"` | Send one message through the dispatcher |
//! | `relay push <dir> --repo <name>` | Sync a local directory to a GitHub repository |
//! | `relay unpack <zip> --dest <dir>` | Validate and extract an archive locally |

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use relay_harness::{commands, config, logging, server};

/// Chat relay with multi-key LLM load balancing and archive-to-GitHub sync.
///
/// Settings are read from a TOML file; secrets come from the environment
/// (`GROQ_API_KEY`/`COMPLETION_API_KEYS`, `TELEGRAM_BOT_TOKEN`,
/// `GITHUB_TOKEN`). See `config/relay.example.toml`.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Cli {
    /// Path to configuration file (TOML). A missing file means defaults.
    #[arg(long, global = true, default_value = "./config/relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP event surface.
    ///
    /// Requires at least one completion key and `TELEGRAM_BOT_TOKEN`.
    /// Uploads stay disabled until `GITHUB_TOKEN` is set.
    Serve,

    /// Print the effective configuration and validate credentials.
    Check,

    /// Send one message to the completion service and print the answer.
    Complete {
        /// The message text.
        text: String,
    },

    /// Push a local directory to a GitHub repository, creating it if needed.
    Push {
        /// Directory whose files are uploaded.
        dir: PathBuf,

        /// Repository name (letters, digits, `.`, `-`, `_`).
        #[arg(long)]
        repo: String,
    },

    /// Validate a ZIP archive and extract it under the intake limits.
    Unpack {
        /// Path to the `.zip` file.
        archive: PathBuf,

        /// Destination directory; must not exist yet.
        #[arg(long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Check => {
            commands::run_check(&cfg)?;
        }
        Commands::Complete { text } => {
            commands::run_complete(&cfg, &text).await?;
        }
        Commands::Push { dir, repo } => {
            commands::run_push(&cfg, &dir, &repo).await?;
        }
        Commands::Unpack { archive, dest } => {
            commands::run_unpack(&cfg, &archive, &dest).await?;
        }
    }

    Ok(())
}
