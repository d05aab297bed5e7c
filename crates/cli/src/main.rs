//! marlin CLI, the main entry point.
//!
//! Commands:
//! - `chat`    Single-message or interactive chat with the agent
//! - `tools`   List registered tools, capabilities and alternatives
//! - `config`  Show, locate or validate the configuration

use clap::{Parser, Subcommand};
use marlin_config::AppConfig;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "marlin",
    about = "marlin: streaming, tool-using AI agent orchestration engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "MARLIN_LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the agent
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
    },

    /// List registered tools
    Tools,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Chat {
            message,
            conversation,
        } => commands::chat::run(message, conversation).await?,
        Commands::Tools => commands::tools::run().await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
            ConfigAction::Validate => commands::config_cmd::validate().await?,
        },
    }

    Ok(())
}

/// Logs go to stderr so streamed answers on stdout stay clean.
///
/// Level precedence: `--verbose`, `RUST_LOG`, `LOG_LEVEL`, then the
/// config file. JSON output with `--log-json` or `APP_ENV=production`.
fn init_tracing(verbose: bool, log_json: bool) {
    let mut logging = AppConfig::load().map(|c| c.logging).unwrap_or_default();
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        logging.level = level.to_lowercase();
    }
    let production = std::env::var("APP_ENV").is_ok_and(|env| env.eq_ignore_ascii_case("production"));

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if log_json || production || logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
