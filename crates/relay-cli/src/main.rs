//! Relay CLI
//!
//! Command-line entry point for the Telegram relay bot

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use logging::LogManager;
use relay_config::Config;
use relay_core::RelayRuntime;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Telegram bot relaying chats to an OpenAI model, with web search", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (falls back to core.log_level, then "info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Load and validate the configuration, then print a summary
    Check,

    /// List log files
    Logs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config)?;
            let data_dir = config.data_dir()?;
            std::fs::create_dir_all(&data_dir)?;

            let log_level = effective_log_level(cli.log_level, &config);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &log_level)?;

            let runtime = Arc::new(RelayRuntime::new(&config)?);
            info!("Starting relay runtime in foreground...");
            runtime.run().await?;
        }

        Commands::Check => {
            let config = load_config(cli.config)?;
            println!("{}", config_summary(&config)?);
        }

        Commands::Logs => {
            let config = load_config(cli.config)?;
            let manager = LogManager::new(config.data_dir()?.join("logs"));
            let files = manager.list()?;
            if files.is_empty() {
                println!("No log files found.");
            } else {
                let mut total = 0u64;
                for file in &files {
                    total += file.size;
                    println!(
                        "{:>10}  {}",
                        LogManager::format_size(file.size),
                        file.path.display()
                    );
                }
                println!(
                    "{} file(s), {} total",
                    files.len(),
                    LogManager::format_size(total)
                );
            }
        }
    }

    Ok(())
}

/// Explicit path, else the default location when it exists, else defaults
/// plus environment variables.
fn load_config(config_path: Option<String>) -> Result<Config> {
    if let Some(path) = config_path {
        return Config::load(&path).with_context(|| format!("Failed to load config {}", path));
    }
    match Config::default_path() {
        Some(path) if path.exists() => Config::load(&path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        _ => Config::from_env().context("No config file found; environment is incomplete"),
    }
}

fn effective_log_level(flag: Option<String>, config: &Config) -> String {
    flag.or_else(|| config.core.log_level.clone())
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}…{}", head, tail)
}

fn config_summary(config: &Config) -> Result<String> {
    let admins = if config.telegram.admins.is_empty() {
        "(none)".to_string()
    } else {
        config
            .telegram
            .admins
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let search = if config.search.is_enabled() {
        format!(
            "enabled (trigger: {}, key {})",
            config.search.trigger_strategy()?.as_str(),
            mask_secret(config.search.api_key.as_deref().unwrap_or_default())
        )
    } else {
        "disabled".to_string()
    };

    let lines = [
        "Config OK".to_string(),
        format!(
            "  Bot:            @{} (id {})",
            config.telegram.bot_username().unwrap_or_default(),
            config.telegram.account_tag()
        ),
        format!("  Telegram token: {}", mask_secret(&config.telegram.bot_token)),
        format!("  Admins:         {}", admins),
        format!(
            "  Group chat:     {}",
            config
                .telegram
                .group_chat_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "(none)".to_string())
        ),
        format!("  Model:          {}", config.openai.model),
        format!("  OpenAI key:     {}", mask_secret(&config.openai.api_key)),
        format!("  History:        {} turns", config.history.capacity),
        format!("  Search:         {}", search),
        format!("  Data dir:       {}", config.data_dir()?.display()),
    ];
    Ok(lines.join("\n"))
}
