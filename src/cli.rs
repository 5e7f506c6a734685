//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// zkauth — zero-knowledge OIDC identity provider
#[derive(Debug, Parser)]
#[command(name = "zkauth", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Subcommand; defaults to `serve`
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the server (default)
    Serve,
    /// Mint a fresh single-use install token and print it
    InstallToken,
    /// Rotate the JWT signing key
    RotateSigningKey,
}
