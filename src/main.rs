//! MCP Fallback - Multi-transport command delivery
//!
//! Main entry point for the mcp-fallback CLI.

use clap::{Parser, Subcommand};
use mcp_fallback::config::{validate_config, FallbackConfig};
use mcp_fallback::protocol::{handler_fn, FallbackManager, MessagePriority, Parameters};
use mcp_fallback::{FallbackError, Result};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

/// MCP Fallback - priority-ordered transport failover for agent commands
#[derive(Parser, Debug)]
#[command(name = "mcp-fallback")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/mcp-fallback/config.yaml)
    #[arg(short, long, env = "MCP_FALLBACK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the transports until Ctrl-C
    Serve,

    /// Send one command through the fallback chain
    Send {
        /// Recipient participant id
        recipient: String,

        /// Command name
        command: String,

        /// Parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Priority (low, normal, high, critical)
        #[arg(long, default_value = "normal")]
        priority: MessagePriority,
    },

    /// Print transport status as JSON
    Status,

    /// Validate the configuration file
    Check,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    if let Err(e) = mcp_fallback::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

/// Returns Ok(false) when the command ran but did not succeed
async fn run(cli: Cli) -> Result<bool> {
    let config_file = cli.config.unwrap_or_else(FallbackConfig::default_path);

    if let Commands::Init { force } = cli.command {
        handle_init_command(&config_file, force)?;
        return Ok(true);
    }

    let config = load_config(&config_file)?;

    match cli.command {
        Commands::Init { .. } => Ok(true),
        Commands::Check => Ok(handle_check_command(&config, &config_file)),
        Commands::Serve => {
            handle_serve_command(&config).await?;
            Ok(true)
        }
        Commands::Send {
            recipient,
            command,
            params,
            priority,
        } => handle_send_command(&config, &recipient, &command, &params, priority).await,
        Commands::Status => {
            handle_status_command(&config).await?;
            Ok(true)
        }
    }
}

fn load_config(path: &Path) -> Result<FallbackConfig> {
    match FallbackConfig::load(path) {
        Ok(config) => Ok(config),
        Err(FallbackError::Config(msg)) if msg.contains("Config file not found") => {
            Err(FallbackError::Config(format!(
                "No configuration found at {}. Run 'mcp-fallback init' first to create one.",
                path.display()
            )))
        }
        Err(e) => Err(e),
    }
}

fn handle_init_command(config_file: &Path, force: bool) -> Result<()> {
    if config_file.exists() && !force {
        println!("Configuration already exists at {}", config_file.display());
        println!();
        println!("To overwrite it, run:");
        println!("  mcp-fallback init --force");
        return Ok(());
    }

    let config = FallbackConfig::new();
    config.save(config_file)?;

    println!("✓ Created configuration at {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. Add peer endpoints under protocols.http.endpoints");
    println!("  2. Validate the file:");
    println!("     mcp-fallback check");
    println!("  3. Start the transports:");
    println!("     mcp-fallback serve");

    Ok(())
}

fn handle_check_command(config: &FallbackConfig, config_file: &Path) -> bool {
    match validate_config(config) {
        Ok(()) => {
            println!("✓ {} is valid", config_file.display());
            true
        }
        Err(errors) => {
            println!("✗ {} has {} issue(s):", config_file.display(), errors.len());
            for error in errors {
                println!("  - {}", error);
            }
            false
        }
    }
}

async fn start_manager(config: &FallbackConfig) -> Result<Arc<FallbackManager>> {
    let manager = Arc::new(FallbackManager::from_config(config)?);
    if !manager.initialize().await {
        manager.shutdown().await;
        return Err(FallbackError::Other(
            "no transport could be initialized".to_string(),
        ));
    }
    Ok(manager)
}

async fn handle_serve_command(config: &FallbackConfig) -> Result<()> {
    let manager = start_manager(config).await?;

    manager.register_command_handler(
        "echo",
        handler_fn(|params| async move {
            tracing::info!(?params, "echo");
            println!("echo: {}", serde_json::Value::Object(params));
            Ok(())
        }),
    );
    manager.start().await;

    println!("{}", serde_json::to_string_pretty(&manager.get_status())?);
    println!("Listening as {} (Ctrl-C to stop)", config.participant_id);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received SIGINT, initiating graceful shutdown");

    manager.shutdown().await;
    Ok(())
}

async fn handle_send_command(
    config: &FallbackConfig,
    recipient: &str,
    command: &str,
    params: &str,
    priority: MessagePriority,
) -> Result<bool> {
    let parameters: Parameters = serde_json::from_str(params)
        .map_err(|e| FallbackError::Config(format!("--params must be a JSON object: {}", e)))?;

    let manager = start_manager(config).await?;
    let sent = manager
        .send_command(&config.participant_id, recipient, command, parameters, priority)
        .await;
    let active = manager.active_transport();
    manager.shutdown().await;

    if sent {
        println!(
            "✓ Sent {} to {} via {}",
            command,
            recipient,
            active.as_deref().unwrap_or("unknown")
        );
    } else {
        eprintln!("✗ Failed to send {} to {}", command, recipient);
    }
    Ok(sent)
}

async fn handle_status_command(config: &FallbackConfig) -> Result<()> {
    let manager = start_manager(config).await?;
    let status = manager.get_status();
    manager.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}
