//! shoal - run shell commands on many hosts at once over SSH
//!
//! Usage:
//!   shoal -s web1,web2 uptime     Run `uptime` on both hosts and report
//!   shoal -s web1,web2            Start the interactive console
//!   shoal -i -s web1 make         Run `make`, then start the console
//!   shoal --init                  Write a default ~/.shoal/config.toml

mod batch;
mod console;
mod format;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use shoal_core::ShoalConfig;
use shoal_orchestrator::{Fleet, JobDispatcher};
use shoal_ssh::RusshTransport;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::console::Console;

/// sysexits.h EX_USAGE
const EX_USAGE: i32 = 64;

#[derive(Parser, Debug)]
#[command(name = "shoal")]
#[command(author, version, about = "Run shell commands on many hosts at once over SSH")]
struct Cli {
    /// Configuration file (defaults to ~/.shoal/config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Hosts to manage, comma separated: [user[:password]@]host[:port]
    #[arg(short = 's', long = "hosts", value_name = "HOSTS", value_delimiter = ',')]
    hosts: Vec<String>,

    /// Trust and remember unknown host keys (not recommended)
    #[arg(short, long)]
    auto_add_hosts: bool,

    /// Default login name
    #[arg(short, long)]
    username: Option<String>,

    /// Default SSH port
    #[arg(short, long)]
    port: Option<u16>,

    /// Seconds to wait on each host before reporting it as pending
    #[arg(short, long, value_name = "SECONDS", allow_negative_numbers = true)]
    timeout: Option<f64>,

    /// Start the console after running the command
    #[arg(short, long)]
    interactive: bool,

    /// Print results as JSON (batch mode only)
    #[arg(long, conflicts_with = "interactive")]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    quiet: bool,

    /// Write a default configuration file and exit
    #[arg(long)]
    init: bool,

    /// Command to run on every host
    #[arg(trailing_var_arg = true, value_name = "COMMAND")]
    command: Vec<String>,
}

impl Cli {
    fn log_level(&self) -> Level {
        if self.verbose {
            Level::DEBUG
        } else if self.quiet {
            Level::WARN
        } else {
            Level::INFO
        }
    }

    /// Configuration file with command-line overrides applied
    fn load_config(&self) -> Result<ShoalConfig> {
        let mut config = ShoalConfig::load_or_default(self.config.as_deref())
            .context("Failed to load configuration")?;

        if !self.hosts.is_empty() {
            config.hosts = self
                .hosts
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if self.auto_add_hosts {
            config.auto_add_hosts = true;
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(timeout) = self.timeout {
            config.job_timeout = timeout.max(0.0);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // Setup logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level())
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.init {
        return cmd_init(cli.config.clone());
    }

    let config = cli.load_config()?;
    let fleet = Fleet::new(RusshTransport::from_config(&config), &config);
    let connected = fleet.connect_all().await;
    info!(
        "Connected to {} of {} host(s)",
        connected,
        fleet.registry().len()
    );

    let command = cli.command.join(" ");
    if command.trim().is_empty() {
        return cmd_console(fleet, &config).await;
    }

    if cli.interactive {
        JobDispatcher::new(fleet.clone()).run_all(&command).await;
        return cmd_console(fleet, &config).await;
    }

    let succeeded = batch::run(fleet.clone(), &command, cli.json)
        .await
        .context("Batch run failed")?;
    JobDispatcher::new(fleet).shutdown().await;
    std::process::exit(if succeeded { 0 } else { 1 });
}

fn cmd_init(path: Option<PathBuf>) -> Result<()> {
    let path = match path.or_else(ShoalConfig::default_path) {
        Some(path) => path,
        None => anyhow::bail!("No home directory; pass --config <FILE>"),
    };
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }

    ShoalConfig::write_default(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn cmd_console(
    fleet: std::sync::Arc<Fleet<RusshTransport>>,
    config: &ShoalConfig,
) -> Result<()> {
    Console::new(fleet, config.prompt.clone())
        .run()
        .await
        .context("Console failed")
}
