mod cli;
mod config;
mod control;
mod driver;
mod http;
mod mcp;
mod provider;
mod runtime;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::{Cli, Command, ConfigCommand, DaemonCommand, StartArgs},
    config::{Config, THEMES},
    runtime::Daemon,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().unwrap_or_else(|error| {
        eprintln!("warning: {error}; using defaults");
        Config::default()
    });

    let level = cli
        .log_level
        .map(|level| level.as_str().to_string())
        .unwrap_or_else(|| config.log_level.clone());
    init_tracing(&level);

    match cli.command {
        Command::Daemon { command } => run_daemon_command(command, config).await,
        Command::Config { command } => run_config_command(command, config),
        Command::Mcp { folder } => run_mcp(config, folder).await,
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_daemon_command(command: DaemonCommand, config: Config) -> Result<()> {
    match command {
        DaemonCommand::Start(args) => start_daemon(args, config).await,
        DaemonCommand::Stop(args) => {
            let port = args.port.unwrap_or(config.daemon.port);
            control::stop(port, args.force, args.timeout).await
        }
        DaemonCommand::Restart(args) => {
            let port = args.port.unwrap_or(config.daemon.port);
            if let Err(error) = control::stop(port, false, 30).await {
                tracing::warn!(%error, "no running daemon to stop before restart");
            }
            start_daemon(args, config).await
        }
        DaemonCommand::Status(args) => {
            let port = args.port.unwrap_or(config.daemon.port);
            control::status(port, args.format, args.health, args.performance).await
        }
        DaemonCommand::Reload(args) => {
            let port = args.port.unwrap_or(config.daemon.port);
            control::reload(port).await
        }
    }
}

async fn start_daemon(args: StartArgs, mut config: Config) -> Result<()> {
    if let Some(port) = args.port {
        config.daemon.port = port;
    }
    if let Some(pid_file) = args.pid_file.clone() {
        config.daemon.pid_file = Some(pid_file);
    }
    if args.no_health_check {
        config.daemon.health_check = false;
    }
    if args.no_performance {
        config.daemon.performance = false;
    }

    // Persist the registration so stop/status/reload find the same setup.
    config.upsert_folder(args.folder.clone(), None);
    if let Err(error) = config.save() {
        tracing::warn!(%error, "could not persist folder registration");
    }

    let daemon = Daemon::build(config, vec![args.folder]).await?;
    daemon.run().await
}

async fn run_mcp(config: Config, folder: Option<std::path::PathBuf>) -> Result<()> {
    let extra = folder.into_iter().collect();
    let daemon = Daemon::build(config, extra).await?;
    let api = daemon.api();

    // The client owns the session: serve stdio until it hangs up, then let
    // the daemon state drop.
    mcp::serve_stdio(api).await
}

fn run_config_command(command: ConfigCommand, mut config: Config) -> Result<()> {
    match command {
        ConfigCommand::Get { key } => {
            println!("{}", config.get_key(&key)?);
        }
        ConfigCommand::Set { key, value } => {
            config.set_key(&key, &value)?;
            config.save()?;
        }
        ConfigCommand::Show => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommand::Validate => {
            Config::load_from(&Config::path()?)?.validate()?;
            println!("configuration is valid");
        }
        ConfigCommand::Reset => {
            Config::default().save()?;
            println!("configuration reset to defaults");
        }
        ConfigCommand::Theme { name } => {
            config.set_key("theme", &name)?;
            config.save()?;
            println!("theme set to {name}");
        }
        ConfigCommand::ThemeList => {
            for theme in THEMES {
                println!("{theme}");
            }
        }
    }

    Ok(())
}
