//! Ziti CLI
//!
//! Inspect an identity's services and dial them from the terminal.

mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;
use ziti_controller::{Controller, RestController};
use ziti_core::{LoopbackDnsManager, Status, Ziti, ZitiContext};

use config::{Config, expand_home};

/// Ziti - zero-trust overlay client
#[derive(Parser)]
#[command(name = "ziti")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/ziti/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List services visible to the identity
    Services,

    /// Log in and show context status
    Status,

    /// Dial a service and pipe stdin/stdout over the connection
    Dial {
        /// Service name
        #[arg(required = true)]
        service: String,
    },

    /// Show the controller version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = expand_home(&PathBuf::from(&cli.config));
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else if config_path == Config::default_path() {
        Config::load_or_default()?
    } else {
        Config::load(&config_path)? // Will fail with proper error
    };

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;

    let ziti = Ziti::with_config(config.context_config(), Arc::new(LoopbackDnsManager::new()))?;
    let result = match cli.command {
        Commands::Services => list_services(&ziti, &config),
        Commands::Status => show_status(&ziti, &config),
        Commands::Dial { service } => dial(&ziti, &config, &service),
        Commands::Version => show_version(&ziti, &config),
    };
    ziti.shutdown();
    result
}

fn load(ziti: &Ziti, config: &Config) -> anyhow::Result<ZitiContext> {
    let identity = config.load_identity()?;
    Ok(ziti.load_context(identity, true)?)
}

/// Print every service visible to the identity
fn list_services(ziti: &Ziti, config: &Config) -> anyhow::Result<()> {
    let ctx = load(ziti, config)?;
    ziti.handle().block_on(ctx.check_active())?;
    ziti.wait_for_services();

    let services = ctx.services();
    if services.is_empty() {
        println!("No services visible to {}", ctx.name());
        return Ok(());
    }

    println!("{:<32} {:<24} {:<12} DNS", "NAME", "ID", "PERMISSIONS");
    for service in services {
        let permissions: Vec<String> = service.permissions.iter().map(ToString::to_string).collect();
        let dns = service
            .dns
            .as_ref()
            .map(|d| format!("{}:{}", d.hostname, d.port))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<32} {:<24} {:<12} {}",
            service.name,
            service.id,
            permissions.join(","),
            dns
        );
    }
    Ok(())
}

/// Log in and print the resulting status
fn show_status(ziti: &Ziti, config: &Config) -> anyhow::Result<()> {
    let ctx = load(ziti, config)?;
    if let Err(e) = ziti.handle().block_on(ctx.check_active()) {
        tracing::debug!("Context did not become active: {}", e);
    }

    println!("Identity:   {}", ctx.name());
    println!("Controller: {}", ctx.controller());
    println!("Status:     {}", ctx.status());
    if let Some(id) = ctx.get_id() {
        println!("API id:     {} ({})", id.name, id.id);
    }
    if !matches!(ctx.status(), Status::Active) {
        anyhow::bail!("context is not active");
    }
    Ok(())
}

/// Pipe stdin to the service and the service to stdout
fn dial(ziti: &Ziti, config: &Config, service: &str) -> anyhow::Result<()> {
    let ctx = load(ziti, config)?;
    ziti.handle().block_on(async move {
        let mut conn = ctx.dial(service).await?;
        tracing::info!("Connected to {} (conn {})", service, conn.conn_id());

        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut buf = vec![0u8; 16 * 1024];
        let mut stdin_open = true;

        loop {
            tokio::select! {
                n = stdin.read(&mut buf), if stdin_open => {
                    match n? {
                        0 => {
                            tracing::debug!("stdin closed");
                            stdin_open = false;
                        }
                        n => conn.write(&buf[..n]).await?,
                    }
                }
                data = conn.read() => {
                    match data? {
                        Some(data) => {
                            stdout.write_all(&data).await?;
                            stdout.flush().await?;
                        }
                        None => break,
                    }
                }
            }
        }

        conn.close().await?;
        anyhow::Ok(())
    })
}

/// Print the controller version
fn show_version(ziti: &Ziti, config: &Config) -> anyhow::Result<()> {
    let identity = config.load_identity()?;
    let handle = ziti.handle();
    let controller = {
        let _enter = handle.enter();
        RestController::new(identity.controller(), identity.tls_config())?
    };
    let version = handle.block_on(controller.version())?;

    println!("Controller: {}", identity.controller());
    println!("Version:    {} ({})", version.version, version.revision);
    println!("Built:      {}", version.build_date);
    println!("Runtime:    {}", version.runtime_version);
    Ok(())
}
