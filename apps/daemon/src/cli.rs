use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "folder-mcp", about = "Semantic folder indexing daemon", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log verbosity for this invocation.
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage the indexing daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
    /// Read and write the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Serve the tool-call protocol over stdio for an MCP client.
    Mcp {
        /// Folder to serve; registered folders from the config otherwise.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start the daemon in the foreground.
    Start(StartArgs),
    /// Stop a running daemon.
    Stop(StopArgs),
    /// Stop, then start again with the same arguments.
    Restart(StartArgs),
    /// Show daemon and folder status.
    Status(StatusArgs),
    /// Ask a running daemon to re-read its folder list and rescan.
    Reload(ReloadArgs),
}

#[derive(Debug, Clone, Args)]
pub struct StartArgs {
    /// Folder to register and index.
    #[arg(long, required = true)]
    pub folder: PathBuf,

    /// Local RPC port; defaults to the configured port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Where to record the daemon pid.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// Disable the health check endpoint state.
    #[arg(long)]
    pub no_health_check: bool,

    /// Disable performance counters in status output.
    #[arg(long)]
    pub no_performance: bool,
}

#[derive(Debug, Args)]
pub struct StopArgs {
    /// Folder whose daemon should stop.
    #[arg(long, required = true)]
    pub folder: PathBuf,

    /// Cancel in-flight operations instead of draining them.
    #[arg(long)]
    pub force: bool,

    /// Seconds to wait for the daemon to exit.
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,

    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    pub folder: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StatusFormat::Table)]
    pub format: StatusFormat,

    /// Include the health check result.
    #[arg(long)]
    pub health: bool,

    /// Include resource manager counters.
    #[arg(long)]
    pub performance: bool,

    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Args)]
pub struct ReloadArgs {
    #[arg(long, required = true)]
    pub folder: PathBuf,

    #[arg(long)]
    pub port: Option<u16>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print one configuration value.
    Get { key: String },
    /// Set one configuration value.
    Set { key: String, value: String },
    /// Print the whole configuration.
    Show,
    /// Check the configuration file for errors.
    Validate,
    /// Restore the default configuration.
    Reset,
    /// Select a UI theme.
    Theme { name: String },
    /// List the available themes.
    ThemeList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFormat {
    Table,
    Json,
}
