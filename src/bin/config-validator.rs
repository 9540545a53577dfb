//! # Relay Configuration Validator
//!
//! Command-line tool for validating pipeline configuration files per
//! environment before a deployment picks them up.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_core::config::loader::{CONFIG_DIR_ENV, DEFAULT_CONFIG_DIR};
use relay_core::config::{ConfigManager, PipelineConfig};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate relay pipeline configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: $RELAY_CONFIG_DIR or config/relay)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for `show` (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the configuration
    Validate,

    /// Print the effective configuration after all layers are applied
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::Show) => show_config(&cli),
        Some(Commands::Validate) | None => validate_config(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {:#}", e);
            process::exit(1);
        }
    }
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir
        .clone()
        .or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR))
}

fn load(cli: &Cli) -> anyhow::Result<ConfigManager> {
    let dir = config_dir(cli);
    ConfigManager::load_from_directory(&dir, &cli.environment).with_context(|| {
        format!(
            "failed to load configuration from {} for environment {}",
            dir.display(),
            cli.environment
        )
    })
}

fn validate_config(cli: &Cli) -> anyhow::Result<()> {
    println!("🔧 Validating Relay Configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", config_dir(cli).display());
    println!();

    let manager = load(cli)?;
    println!("✅ Configuration loaded and validated");
    print_summary(manager.config());
    Ok(())
}

fn show_config(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli)?;
    match cli.format.as_str() {
        "json" => {
            let rendered = serde_json::to_string_pretty(manager.config())
                .context("failed to serialize configuration")?;
            println!("{rendered}");
        }
        "table" => print_summary(manager.config()),
        other => anyhow::bail!("unsupported output format: {other}"),
    }
    Ok(())
}

fn print_summary(config: &PipelineConfig) {
    let webhook = &config.lanes.webhook;
    let message = &config.lanes.message;

    println!();
    println!("{:<28} {}", "Section", "Settings");
    println!("{}", "-".repeat(72));
    println!(
        "{:<28} ttl={}ms sweep={}ms",
        "deduplication", config.deduplication.ttl_ms, config.deduplication.sweep_interval_ms
    );
    println!(
        "{:<28} concurrency={} attempts={} backoff={}ms..{}ms",
        "lanes.webhook",
        webhook.concurrency,
        webhook.max_attempts,
        webhook.backoff_base_ms,
        webhook.backoff_max_ms
    );
    println!(
        "{:<28} concurrency={} attempts={} backoff={}ms..{}ms",
        "lanes.message",
        message.concurrency,
        message.max_attempts,
        message.backoff_base_ms,
        message.backoff_max_ms
    );
    println!(
        "{:<28} enabled={} capacity={} retries={} delays={:?}",
        "fallback_queue",
        config.fallback_queue.enabled,
        config.fallback_queue.capacity,
        config.fallback_queue.max_retries,
        config.fallback_queue.retry_delays_ms
    );
    println!(
        "{:<28} enabled={} interval={}ms batch={} cap={}",
        "dead_letter",
        config.dead_letter.enabled,
        config.dead_letter.retry_interval_ms,
        config.dead_letter.batch_size,
        config.dead_letter.max_retries
    );

    let mut components: Vec<_> = config.circuit_breakers.component_configs.iter().collect();
    components.sort_by(|a, b| a.0.cmp(b.0));
    for (name, breaker) in components {
        println!(
            "{:<28} threshold={} recovery={}ms window={}ms",
            format!("circuit_breakers.{name}"),
            breaker.failure_threshold,
            breaker.recovery_timeout_ms,
            breaker.monitoring_period_ms
        );
    }
    println!("{:<28} {}", "transport_component", config.transport_component);
}
