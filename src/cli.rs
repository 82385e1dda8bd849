// Copyright (c) 2024-2026 the runa authors
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "runa", version, about = "ACP agent runtime bridging editors to MCP tool servers")]
pub struct Cli {
    /// Explicit config file (merged over the standard search paths).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database path, overriding `storage.path` from the config.
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    /// Log to stderr (RUNA_LOG / RUST_LOG filter syntax applies).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the Agent Client Protocol on stdio (the default).
    Serve,
    /// List persisted sessions.
    Sessions {
        /// Only sessions with this status (active | completed | cancelled).
        #[arg(long)]
        status: Option<String>,
    },
    /// Print the effective merged configuration.
    ShowConfig,
}
