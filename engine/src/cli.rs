//! CLI interface for Courier
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for controlling the Courier
//! daemon.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Courier conversational agent gateway
///
/// Routes Discord and Misskey conversations to an external reasoning agent,
/// one isolated workspace per conversation, one reply per message.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway daemon (runs in the foreground)
    Start,

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Run configuration and environment diagnostics
    Doctor,
}
