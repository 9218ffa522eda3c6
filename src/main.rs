use anyhow::{Context, Result};
use chattt_bridge::{api, config};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chattt-bridge")]
#[command(about = "Supervisor and JSON-RPC stdio bridge for the ChatTTT MCP server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "CHATTT_CONFIG")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Do not launch the MCP process at boot
    #[arg(long)]
    no_auto_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config).with_context(|| {
        format!(
            "Failed to load configuration from: {}",
            cli.config.display()
        )
    })?;

    // Apply CLI overrides
    if let Some(log_level) = cli.log_level {
        config.logging.level = log_level;
    }
    if let Some(log_format) = cli.log_format {
        config.logging.format = log_format;
    }
    if cli.no_auto_start {
        config.bridge.auto_start = false;
    }

    init_logging(&config.logging)?;

    print_banner(&config);

    info!("Starting chattt-bridge...");
    api::start_server(config).await?;

    Ok(())
}

fn init_logging(config: &config::LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn print_banner(config: &config::AppConfig) {
    let version = env!("CARGO_PKG_VERSION");
    let width = 59usize;
    let border = "═".repeat(width + 2);
    let line = |content: &str| {
        info!("║ {:width$} ║", content, width = width);
    };

    info!("╔{}╗", border);
    line("CHATTT-BRIDGE");
    line(&format!("MCP stdio bridge v{}", version));
    info!("╚{}╝", border);
    info!("");
    info!("Configuration:");
    info!("  → Address: {}:{}", config.http.host, config.http.port);
    if !config.http.route_prefix.is_empty() {
        info!("  → Route prefix: {}", config.http.route_prefix);
    }
    info!("  → Log Level: {}", config.logging.level);
    info!(
        "  → MCP command: {} {}",
        config.bridge.command,
        config.bridge.args.join(" ")
    );
    info!("  → Auto-start: {}", config.bridge.auto_start);
    info!(
        "  → Timeouts: handshake {:?}, request {:?}",
        config.bridge.handshake_timeout(),
        config.bridge.request_timeout()
    );
    info!("");
}
