//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// AccelMCP - admin-managed MCP gateway
#[derive(Parser, Debug)]
#[command(name = "accel-mcp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "ACCELMCP_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "ACCELMCP_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "ACCELMCP_HOST")]
    pub host: Option<String>,

    /// Catalog file (overrides `catalog` in the config file)
    #[arg(long, env = "ACCELMCP_CATALOG")]
    pub catalog: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "ACCELMCP_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "ACCELMCP_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Catalog file commands
    #[command(subcommand)]
    Catalog(CatalogCommand),
}

/// Catalog subcommands
#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// Check a catalog file for consistency
    Validate {
        /// Path to catalog YAML file
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Print services, apps and capabilities in a catalog file
    List {
        /// Path to catalog YAML file
        #[arg(required = true)]
        file: PathBuf,
    },
}
