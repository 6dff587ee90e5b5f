//! # Stepwise Configuration Validator
//!
//! Command-line tool for validating stepwise configuration files across environments.
//! Catches bad timeouts and channel sizes before an orchestrator is started with them.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use stepwise_core::config::{sanitize_url, ConfigManager, EngineConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate stepwise configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: $STEPWISE_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load and validate the merged configuration
    Validate,

    /// Print the merged configuration with secrets masked
    Show,

    /// List environments that have an override file
    Environments,

    /// Validate every environment that has an override file
    All,
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
        Some(Commands::Validate) | None => validate(&cli, &cli.environment),
        Some(Commands::Show) => show(&cli),
        Some(Commands::Environments) => list_environments(&cli),
        Some(Commands::All) => validate_all(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli, environment: &str) -> anyhow::Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        .with_context(|| format!("loading configuration for environment '{environment}'"))
}

fn validate(cli: &Cli, environment: &str) -> anyhow::Result<()> {
    let manager = load(cli, environment)?;
    match cli.format {
        OutputFormat::Table => {
            println!("🔧 Environment: {environment}");
            println!("   Directory: {}", manager.config_directory().display());
            print_summary(manager.config());
            println!("✅ Configuration valid");
        }
        OutputFormat::Json => {
            let report = serde_json::json!({
                "environment": environment,
                "directory": manager.config_directory().display().to_string(),
                "valid": true,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn show(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli, &cli.environment)?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&manager.debug_config())?),
        OutputFormat::Table => print_summary(manager.config()),
    }
    Ok(())
}

fn print_summary(config: &EngineConfig) {
    println!("⏱️  Timeouts");
    println!("   leaf: {}ms", config.timeouts.leaf_ms);
    println!("   steady state: {}ms", config.timeouts.steady_state_ms);
    println!("   containment: {}ms", config.timeouts.containment_ms);
    println!("   abort handler: {}ms", config.timeouts.abort_handler_ms);
    println!("🎼 Orchestrator");
    println!("   convergence policy: {:?}", config.orchestrator.convergence_policy);
    println!("   transient requeues: {}", config.orchestrator.max_transient_requeues);
    println!("   event channel: {}", config.orchestrator.event_channel_capacity);
    println!("📬 Dispatcher");
    println!("   channel capacity: {}", config.dispatcher.channel_capacity);
    println!("   enqueue timeout: {}ms", config.dispatcher.enqueue_timeout_ms);
    println!("🗄️  Database");
    println!("   url: {}", sanitize_url(&config.database.url));
    println!("   max connections: {}", config.database.max_connections);
}

fn environments(directory: &Path) -> anyhow::Result<Vec<String>> {
    if !directory.is_dir() {
        bail!("configuration directory not found: {}", directory.display());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(env) = name
            .strip_prefix("stepwise.")
            .and_then(|rest| rest.strip_suffix(".toml"))
        {
            found.push(env.to_string());
        }
    }
    found.sort();
    Ok(found)
}

fn config_directory(cli: &Cli) -> PathBuf {
    cli.config_dir.clone().unwrap_or_else(|| {
        std::env::var("STEPWISE_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    })
}

fn list_environments(cli: &Cli) -> anyhow::Result<()> {
    let found = environments(&config_directory(cli))?;
    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&found)?),
        OutputFormat::Table => {
            println!("📋 Available Environments:");
            for env in found {
                println!("  • {env}");
            }
        }
    }
    Ok(())
}

fn validate_all(cli: &Cli) -> anyhow::Result<()> {
    let found = environments(&config_directory(cli))?;
    if found.is_empty() {
        bail!("no environment override files found");
    }
    let mut failures = Vec::new();
    for env in &found {
        if let Err(e) = validate(cli, env) {
            failures.push(format!("{env}: {e:#}"));
        }
    }
    if !failures.is_empty() {
        bail!("{} environment(s) invalid:\n{}", failures.len(), failures.join("\n"));
    }
    println!("\n🎉 All {} environments passed", found.len());
    Ok(())
}
